use bytes::{Bytes, BytesMut};
use log::debug;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    select,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
    time,
};

use crate::protocol::{Backend, BackendEvent, ChannelEvent};

/// 虚拟套接字背后的真实 tcp 连接
///
/// 连接和读写都在单独的任务里进行，结果以事件的形式发回会话；
/// 值被丢弃时任务随之终止，后端连接同步关闭
pub(crate) struct BackendConnection {
    writes: UnboundedSender<Bytes>,
    task: JoinHandle<()>,
}

impl BackendConnection {
    /// 连接 `target`（"host:port"）
    pub(crate) fn spawn(
        target: String,
        port: u8,
        serial: u64,
        timeout: time::Duration,
        events: UnboundedSender<BackendEvent>,
    ) -> Self {
        let (writes, writes_rx) = mpsc::unbounded_channel();
        let notifier = Notifier {
            port,
            serial,
            events,
        };
        let task = tokio::spawn(run(target, timeout, notifier, writes_rx));

        Self { writes, task }
    }
}

impl Backend for BackendConnection {
    fn write(&mut self, data: Bytes) -> bool {
        self.writes.send(data).is_ok()
    }
}

impl Drop for BackendConnection {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Notifier {
    port: u8,
    serial: u64,
    events: UnboundedSender<BackendEvent>,
}

impl Notifier {
    fn notify(&self, event: ChannelEvent) {
        // 会话已经结束时发送失败，忽略即可
        let _ = self.events.send(BackendEvent {
            port: self.port,
            serial: self.serial,
            event,
        });
    }
}

/// 拆分 "host:port"，以最后一个冒号为界
fn parse_target(target: &str) -> Option<(&str, u16)> {
    let (host, port) = target.trim().rsplit_once(':')?;
    let port = port.parse().ok()?;
    if host.is_empty() {
        return None;
    }
    Some((host, port))
}

async fn connect(target: &str, timeout: time::Duration) -> Option<TcpStream> {
    let (host, port) = match parse_target(target) {
        Some(addr) => addr,
        None => {
            debug!("invalid backend address: {:?}", target);
            return None;
        }
    };

    match time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => Some(stream),
        Ok(Err(e)) => {
            debug!("connect to {} failed: {}", target, e);
            None
        }
        Err(_) => {
            debug!("connect to {} timed out", target);
            None
        }
    }
}

async fn run(
    target: String,
    timeout: time::Duration,
    notifier: Notifier,
    mut writes_rx: UnboundedReceiver<Bytes>,
) {
    let stream = match connect(&target, timeout).await {
        Some(stream) => stream,
        None => return notifier.notify(ChannelEvent::ConnectFailed),
    };
    notifier.notify(ChannelEvent::Connected);

    let (mut reader, mut writer) = stream.into_split();
    let mut read = BytesMut::with_capacity(4096);
    loop {
        select! {
            reads = time::timeout(timeout, reader.read_buf(&mut read)) => {
                match reads {
                    Ok(Ok(0)) => break,
                    Ok(Ok(_)) => notifier.notify(ChannelEvent::Received(read.split().freeze())),
                    Ok(Err(e)) => {
                        debug!("read from {} error: {}", target, e);
                        break;
                    }
                    Err(_) => {
                        debug!("backend {} idle timeout", target);
                        break;
                    }
                }
            }
            write = writes_rx.recv() => {
                match write {
                    Some(data) => {
                        if let Err(e) = writer.write_all(&data).await {
                            debug!("write to {} error: {}", target, e);
                            break;
                        }
                    }
                    // 虚拟套接字已被移除
                    None => return,
                }
            }
        }
    }

    notifier.notify(ChannelEvent::Closed);
}
