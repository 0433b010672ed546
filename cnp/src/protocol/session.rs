use std::collections::BTreeMap;

use bytes::Bytes;
use log::{debug, info, warn};
use tokio::{sync::mpsc::UnboundedSender, time};

use crate::{
    network::{
        packet::{self, Assembler, Packet},
        BackendConnection, Outbox,
    },
    UserRecord,
};

use super::{BackendEvent, ChannelEvent, Disposition, VirtualSocket};

/// 结束会话的服务消息
const END_SESSION: &str = "ENDSESSION";

/// 处理完一批数据后，事件循环是否继续
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    /// 客户端要求结束会话
    End,
}

/// 一条已认证的物理连接上的会话
///
/// 按端口号持有所有虚拟套接字，后端事件通过端口号查找路由，
/// 传输层对象不持有会话的引用
pub(crate) struct Session {
    user: UserRecord,
    /// 报文组装
    assembler: Assembler,
    /// key = 端口号
    channels: BTreeMap<u8, VirtualSocket<BackendConnection>>,
    /// 每打开一个虚拟套接字加一
    serial: u64,
    /// 写往物理连接
    outbox: Outbox,
    /// 交给后端连接任务，用来回报事件
    events_tx: UnboundedSender<BackendEvent>,
    /// 后端连接超时
    timeout: time::Duration,
}

impl Session {
    pub(crate) fn new(
        user: UserRecord,
        outbox: Outbox,
        events_tx: UnboundedSender<BackendEvent>,
        timeout: time::Duration,
    ) -> Self {
        Self {
            user,
            assembler: Assembler::new(),
            channels: BTreeMap::new(),
            serial: 0,
            outbox,
            events_tx,
            timeout,
        }
    }

    pub(crate) fn username(&self) -> &str {
        &self.user.username
    }

    /// 处理物理连接上到来的一批数据，其中可能包含多个或不完整的报文
    pub(crate) fn on_bytes(&mut self, mut chunk: Bytes) -> Flow {
        while let Some(packet) = self.assembler.next(&mut chunk) {
            match packet {
                Ok(packet) => {
                    if let Flow::End = self.dispatch(packet) {
                        return Flow::End;
                    }
                }
                Err(packet::Error::Checksum { packet_type, port }) => {
                    debug!("checksum failed on {:?} for port {}, sending nak", packet_type, port);
                    self.reply(Packet::Nak { port });
                }
                Err(packet::Error::InvalidPacketType(byte)) => {
                    info!("Unrecognized packet type: {}", byte);
                }
                Err(e) => warn!("packet error: {}", e),
            }
        }

        Flow::Continue
    }

    /// 后端连接任务发来的事件
    pub(crate) fn on_backend(&mut self, event: BackendEvent) {
        let BackendEvent {
            port,
            serial,
            event,
        } = event;

        // 已被替换或移除的虚拟套接字的事件直接丢弃
        let live = self.channels.get(&port).map(VirtualSocket::serial) == Some(serial);
        if live {
            self.step(port, event);
        } else {
            debug!("drop stale backend event for port {}", port);
        }
    }

    /// 关闭所有虚拟套接字
    pub(crate) fn close_all(&mut self) {
        // 丢弃即终止后端连接任务
        self.channels.clear();
    }

    #[cfg(test)]
    pub(crate) fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn dispatch(&mut self, packet: Packet) -> Flow {
        match packet {
            Packet::KeepAlive => info!("received keep alive. {}", self.user.username),
            Packet::Service { data, .. } => return self.service(&data),
            Packet::Open { port, data } => self.open(port, &data),
            Packet::Data { port, data } => {
                if self.channels.contains_key(&port) {
                    self.step(port, ChannelEvent::Write(data));
                } else {
                    self.reply(Packet::Timeout { port });
                }
            }
            Packet::Close { port } => {
                if self.channels.remove(&port).is_some() {
                    self.reply(Packet::Ack { port });
                } else {
                    self.reply(Packet::Timeout { port });
                }
            }
            Packet::Timeout { port } => {
                if self.channels.remove(&port).is_none() {
                    self.reply(Packet::Timeout { port });
                }
            }
            Packet::Ack { port } => self.step_or_timeout(port, ChannelEvent::Ack),
            Packet::Nak { port } => self.step_or_timeout(port, ChannelEvent::Nak),
        }

        Flow::Continue
    }

    /// 服务消息按 latin1 解码
    fn service(&mut self, data: &[u8]) -> Flow {
        let message: String = data.iter().map(|&byte| byte as char).collect();
        match message.as_str() {
            END_SESSION => {
                self.close_all();
                Flow::End
            }
            other => {
                debug!("ignore service message {:?}", other);
                Flow::Continue
            }
        }
    }

    /// 打开端口，已有同端口的虚拟套接字先关闭
    fn open(&mut self, port: u8, data: &[u8]) {
        if self.channels.remove(&port).is_some() {
            debug!("port {} reopened, closing previous socket", port);
        }

        let target = String::from_utf8_lossy(data).into_owned();
        debug!("opening port {} to {}", port, target);
        self.serial += 1;
        let backend = BackendConnection::spawn(
            target,
            port,
            self.serial,
            self.timeout,
            self.events_tx.clone(),
        );
        self.channels
            .insert(port, VirtualSocket::new(port, self.serial, backend));
    }

    fn step_or_timeout(&mut self, port: u8, event: ChannelEvent) {
        if self.channels.contains_key(&port) {
            self.step(port, event);
        } else {
            self.reply(Packet::Timeout { port });
        }
    }

    fn step(&mut self, port: u8, event: ChannelEvent) {
        let channel = match self.channels.get_mut(&port) {
            Some(channel) => channel,
            None => return,
        };

        let mut out = Vec::new();
        let disposition = channel.handle(event, &mut out);
        for frame in out {
            self.send(frame);
        }
        if let Disposition::Remove = disposition {
            self.channels.remove(&port);
        }
    }

    fn reply(&self, packet: Packet) {
        match packet.to_bytes() {
            Ok(frame) => self.send(frame),
            Err(e) => warn!("encode {:?} error: {}", packet.packet_type(), e),
        }
    }

    fn send(&self, frame: Bytes) {
        if self.outbox.send(frame).is_err() {
            debug!("client {} writer closed", self.user.username);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        sync::mpsc::{self, UnboundedReceiver},
    };

    use super::*;

    struct Harness {
        session: Session,
        outbox_rx: UnboundedReceiver<Bytes>,
        events_rx: UnboundedReceiver<BackendEvent>,
    }

    impl Harness {
        fn new() -> Self {
            let (outbox, outbox_rx) = mpsc::unbounded_channel();
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let user = UserRecord {
                username: "alice".into(),
                display_name: "Alice".into(),
                salt: "s1".into(),
                hash: String::new(),
            };
            let session = Session::new(
                user,
                outbox,
                events_tx,
                time::Duration::from_secs(5),
            );
            Self {
                session,
                outbox_rx,
                events_rx,
            }
        }

        fn feed(&mut self, packet: Packet) -> Flow {
            let bytes = packet.to_bytes().unwrap();
            self.session.on_bytes(bytes)
        }

        fn sent(&mut self) -> Vec<Bytes> {
            let mut frames = Vec::new();
            while let Ok(frame) = self.outbox_rx.try_recv() {
                frames.push(frame);
            }
            frames
        }

        /// 等待下一个后端事件并交给会话
        async fn pump(&mut self) -> ChannelEvent {
            let event = time::timeout(time::Duration::from_secs(5), self.events_rx.recv())
                .await
                .unwrap()
                .unwrap();
            let kind = event.event.clone();
            self.session.on_backend(event);
            kind
        }
    }

    #[tokio::test]
    async fn control_for_unknown_port_replies_timeout() {
        let mut harness = Harness::new();
        harness.feed(Packet::Close { port: 1 });
        harness.feed(Packet::Timeout { port: 2 });
        harness.feed(Packet::Ack { port: 3 });
        harness.feed(Packet::Nak { port: 4 });
        harness.feed(Packet::Data {
            port: 5,
            data: Bytes::from_static(b"x"),
        });

        assert_eq!(
            harness.sent(),
            vec![
                Bytes::from_static(&[0x54, 1]),
                Bytes::from_static(&[0x54, 2]),
                Bytes::from_static(&[0x54, 3]),
                Bytes::from_static(&[0x54, 4]),
                Bytes::from_static(&[0x54, 5]),
            ]
        );
    }

    #[tokio::test]
    async fn corrupted_packet_is_nakked_and_not_dispatched() {
        let mut harness = Harness::new();
        let mut frame = BytesMut::new();
        Packet::Service {
            port: 6,
            data: Bytes::from_static(b"ENDSESSION"),
        }
        .write(&mut frame)
        .unwrap();
        frame[5] ^= 0x01;

        assert_eq!(harness.session.on_bytes(frame.freeze()), Flow::Continue);
        assert_eq!(harness.sent(), vec![Bytes::from_static(&[0x4E, 6])]);
    }

    #[tokio::test]
    async fn end_session_closes_all_channels() {
        let mut harness = Harness::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap().to_string();

        harness.feed(Packet::Open {
            port: 1,
            data: Bytes::from(target.clone()),
        });
        harness.feed(Packet::Open {
            port: 2,
            data: Bytes::from(target),
        });
        assert_eq!(harness.session.channel_count(), 2);

        let flow = harness.feed(Packet::Service {
            port: 0,
            data: Bytes::from_static(b"ENDSESSION"),
        });
        assert_eq!(flow, Flow::End);
        assert_eq!(harness.session.channel_count(), 0);
    }

    #[tokio::test]
    async fn unknown_service_message_is_ignored() {
        let mut harness = Harness::new();
        let flow = harness.feed(Packet::Service {
            port: 0,
            data: Bytes::from_static(b"STATUS"),
        });
        assert_eq!(flow, Flow::Continue);
        assert!(harness.sent().is_empty());
    }

    #[tokio::test]
    async fn keep_alive_is_logged_without_reply() {
        let mut harness = Harness::new();
        assert_eq!(harness.feed(Packet::KeepAlive), Flow::Continue);
        // 0x2B 与 0x2D 等价
        assert_eq!(
            harness.session.on_bytes(Bytes::from_static(&[0x2B, 0x2D])),
            Flow::Continue
        );
        assert!(harness.sent().is_empty());
        assert_eq!(harness.session.channel_count(), 0);
    }

    #[tokio::test]
    async fn open_relays_both_directions() {
        let mut harness = Harness::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap().to_string();

        harness.feed(Packet::Open {
            port: 7,
            data: Bytes::from(target),
        });
        let (mut backend, _) = listener.accept().await.unwrap();
        assert_eq!(harness.pump().await, ChannelEvent::Connected);
        assert_eq!(harness.sent(), vec![Bytes::from_static(&[0x41, 7])]);

        // 客户端 -> 后端
        harness.feed(Packet::Data {
            port: 7,
            data: Bytes::from_static(b"ping"),
        });
        assert_eq!(harness.sent(), vec![Bytes::from_static(&[0x41, 7])]);
        let mut buf = [0u8; 4];
        backend.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        // 后端 -> 客户端
        backend.write_all(b"pong").await.unwrap();
        assert!(matches!(harness.pump().await, ChannelEvent::Received(_)));
        let pong = Packet::Data {
            port: 7,
            data: Bytes::from_static(b"pong"),
        };
        assert_eq!(harness.sent(), vec![pong.to_bytes().unwrap()]);

        // 客户端主动关闭，即使没有确认上一个数据报文
        harness.feed(Packet::Close { port: 7 });
        assert_eq!(harness.sent(), vec![Bytes::from_static(&[0x41, 7])]);
        assert_eq!(harness.session.channel_count(), 0);

        let mut rest = Vec::new();
        let read = time::timeout(time::Duration::from_secs(5), backend.read_to_end(&mut rest))
            .await
            .unwrap();
        assert!(read.is_ok());
    }

    #[tokio::test]
    async fn reopen_drops_previous_backend() {
        let mut harness = Harness::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap().to_string();

        harness.feed(Packet::Open {
            port: 3,
            data: Bytes::from(target.clone()),
        });
        let (mut first, _) = listener.accept().await.unwrap();
        assert_eq!(harness.pump().await, ChannelEvent::Connected);

        harness.feed(Packet::Open {
            port: 3,
            data: Bytes::from(target),
        });
        let (_second, _) = listener.accept().await.unwrap();

        // 第一个后端连接已被关闭
        let mut rest = Vec::new();
        let read = time::timeout(time::Duration::from_secs(5), first.read_to_end(&mut rest))
            .await
            .unwrap();
        assert!(read.is_ok());
        assert_eq!(harness.session.channel_count(), 1);
    }
}
