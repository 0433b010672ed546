use bytes::{Bytes, BytesMut};
use log::{debug, error};

use crate::network::packet::{Packet, MAX_PAYLOAD_LENGTH};

use super::{Backend, ChannelEvent};

/// 处理完一个事件后，会话对这个虚拟套接字的处置
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Disposition {
    Keep,
    /// 关闭流程完成，从会话中移除
    Remove,
}

/// 发往客户端方向的停等状态
#[derive(Debug)]
enum State {
    /// 后端连接建立中
    Opening,
    /// 没有未确认的报文
    Idle,
    /// 一个数据报文已发出，等待 ack/nak，保留原报文用于重传
    Sending { frame: Bytes },
    /// close 报文已发出，等待 ack
    Closing,
    /// 后端连接失败，只等待客户端关闭
    Failed,
}

/// 多路复用在物理连接上的一个逻辑连接
///
/// 任意时刻最多只有一个未确认的数据报文，后端多出来的数据留在缓冲区，
/// 收到 ack 之后再切下一块发送
pub(crate) struct VirtualSocket<B> {
    port: u8,
    serial: u64,
    state: State,
    /// 后端发来、还没有发给客户端的数据
    inbound: BytesMut,
    /// 后端已经关闭
    remote_closed: bool,
    backend: B,
}

impl<B: Backend> VirtualSocket<B> {
    pub(crate) fn new(port: u8, serial: u64, backend: B) -> Self {
        Self {
            port,
            serial,
            state: State::Opening,
            inbound: BytesMut::new(),
            remote_closed: false,
            backend,
        }
    }

    pub(crate) fn serial(&self) -> u64 {
        self.serial
    }

    /// 是否有已发出未确认的数据报文
    pub(crate) fn is_sending(&self) -> bool {
        matches!(self.state, State::Sending { .. })
    }

    /// 处理一个事件，需要发给客户端的报文追加到 `out`
    pub(crate) fn handle(&mut self, event: ChannelEvent, out: &mut Vec<Bytes>) -> Disposition {
        match event {
            ChannelEvent::Connected => {
                if let State::Opening = self.state {
                    self.state = State::Idle;
                }
                push(out, Packet::Ack { port: self.port });
            }
            ChannelEvent::ConnectFailed => {
                self.state = State::Failed;
                push(out, Packet::Timeout { port: self.port });
            }
            ChannelEvent::Received(data) => {
                self.inbound.extend_from_slice(&data);
                if let State::Idle = self.state {
                    self.send_next(out);
                }
            }
            ChannelEvent::Closed => {
                self.remote_closed = true;
                // 还有数据在路上时，等 ack 流程走到最后再发 close
                if let State::Idle = self.state {
                    if self.inbound.is_empty() {
                        self.send_close(out);
                    }
                }
            }
            ChannelEvent::Ack => match self.state {
                State::Closing => return Disposition::Remove,
                State::Sending { .. } => {
                    if !self.inbound.is_empty() {
                        self.state = State::Idle;
                        self.send_next(out);
                    } else if self.remote_closed {
                        self.send_close(out);
                    } else {
                        self.state = State::Idle;
                    }
                }
                _ => debug!("port {} got unexpected ack", self.port),
            },
            ChannelEvent::Nak => match &self.state {
                State::Closing => {
                    push(out, Packet::Close { port: self.port });
                }
                State::Sending { frame } => out.push(frame.clone()),
                _ => debug!("port {} got unexpected nak", self.port),
            },
            ChannelEvent::Write(data) => {
                if !self.backend.write(data) {
                    debug!("port {} backend gone, dropping client data", self.port);
                }
                push(out, Packet::Ack { port: self.port });
            }
        }

        Disposition::Keep
    }

    /// 从缓冲区切出最多 256 字节组成数据报文发出
    fn send_next(&mut self, out: &mut Vec<Bytes>) {
        debug_assert!(!self.is_sending());
        let len = self.inbound.len().min(MAX_PAYLOAD_LENGTH);
        let data = self.inbound.split_to(len).freeze();
        let packet = Packet::Data {
            port: self.port,
            data,
        };

        if let Some(frame) = push(out, packet) {
            self.state = State::Sending { frame };
        }
    }

    fn send_close(&mut self, out: &mut Vec<Bytes>) {
        push(out, Packet::Close { port: self.port });
        self.state = State::Closing;
    }
}

/// 编码后追加到 `out`，返回编码结果供重传
fn push(out: &mut Vec<Bytes>, packet: Packet) -> Option<Bytes> {
    match packet.to_bytes() {
        Ok(frame) => {
            out.push(frame.clone());
            Some(frame)
        }
        Err(e) => {
            error!("encode {:?} error: {}", packet.packet_type(), e);
            None
        }
    }
}
