//! 网络层
//! 物理连接与后端连接的读写、报文编解码，不包含会话状态

use bytes::Bytes;
use log::info;
use tokio::{
    select,
    sync::mpsc::{self, UnboundedReceiver},
    time::{self, Instant},
};

pub(crate) use conn::{BackendConnection, ClientConnection, Outbox};

use crate::{
    protocol::{BackendEvent, Flow, Session},
    UserRecord,
};

pub(crate) mod conn;
pub(crate) mod packet;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Connection error: {0}")]
    Connection(#[from] conn::Error),
}

/// 一条已认证物理连接的事件循环
pub(crate) struct SessionEventLoop {
    conn: ClientConnection,
    session: Session,
    events_rx: UnboundedReceiver<BackendEvent>,
    /// 物理连接空闲超时，任何到来的字节都会重置
    idle_timeout: time::Duration,
}

impl SessionEventLoop {
    pub(crate) fn new(
        conn: ClientConnection,
        outbox: Outbox,
        user: UserRecord,
        idle_timeout: time::Duration,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = Session::new(user, outbox, events_tx, idle_timeout);

        Self {
            conn,
            session,
            events_rx,
            idle_timeout,
        }
    }

    /// 开启事件循环
    /// * 从物理连接读数据，交给会话组装报文并分发
    /// * 接收后端连接任务的事件，交给对应的虚拟套接字
    ///
    /// `pending` 是认证阶段多读到的字节，先于物理连接上的新数据处理。
    /// 客户端发送 ENDSESSION 时正常返回，连接断开或超时返回错误；
    /// 两种情况下所有虚拟套接字都会被关闭
    pub(crate) async fn start(mut self, pending: Bytes) -> Result<(), Error> {
        let result = self.run(pending).await;
        self.session.close_all();
        result
    }

    async fn run(&mut self, pending: Bytes) -> Result<(), Error> {
        if let Flow::End = self.session.on_bytes(pending) {
            info!("client ended session. {}", self.session.username());
            return Ok(());
        }

        // 只有客户端发来的数据才重置，后端事件不算活动
        let idle = time::sleep(self.idle_timeout);
        tokio::pin!(idle);

        loop {
            select! {
                reads = self.conn.read() => {
                    let chunk = reads?;
                    idle.as_mut().reset(Instant::now() + self.idle_timeout);
                    if let Flow::End = self.session.on_bytes(chunk) {
                        info!("client ended session. {}", self.session.username());
                        return Ok(());
                    }
                }
                // 会话自己持有 events_tx，这里不会收到 None
                Some(event) = self.events_rx.recv() => self.session.on_backend(event),
                _ = &mut idle => return Err(conn::Error::IdleTimeout.into()),
            }
        }
    }
}
