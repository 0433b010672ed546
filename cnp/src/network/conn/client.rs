use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use log::debug;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    time,
};

use super::Error;

/// 写往物理连接的报文队列
///
/// 每个元素都是一个完整的报文，写任务按顺序整块写出，不会出现报文交错
pub(crate) type Outbox = UnboundedSender<Bytes>;

/// 复古客户端与网关之间的物理连接
/// 读在当前任务中进行，写交给单独的写任务
pub(crate) struct ClientConnection {
    /// tcp 读半部
    reader: OwnedReadHalf,
    /// 读缓冲区
    read: BytesMut,
    /// 对端地址
    peer: SocketAddr,
}

impl ClientConnection {
    /// 拆分 tcp 连接，启动写任务
    /// 所有 `Outbox` 被丢弃后写任务退出并关闭写半部
    pub(crate) fn new(stream: TcpStream, peer: SocketAddr) -> (Self, Outbox) {
        let (reader, writer) = stream.into_split();
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(writer, outbox_rx, peer));

        (
            Self {
                reader,
                read: BytesMut::with_capacity(4096),
                peer,
            },
            outbox,
        )
    }

    pub(crate) fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// 等待一批数据
    /// 超过空闲时间没有数据，或者对端关闭，返回错误
    pub(crate) async fn read_more(&mut self, timeout: time::Duration) -> Result<Bytes, Error> {
        time::timeout(timeout, self.read())
            .await
            .map_err(|_| Error::IdleTimeout)?
    }

    /// 等待一批数据，不设超时，对端关闭返回错误
    ///
    /// 可以在 `select!` 中被取消，已读到的数据留在读缓冲区
    pub(crate) async fn read(&mut self) -> Result<Bytes, Error> {
        let read = self.reader.read_buf(&mut self.read).await?;
        if 0 == read {
            return Err(Error::ConnectionAborted);
        }

        Ok(self.read.split().freeze())
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbox_rx: UnboundedReceiver<Bytes>,
    peer: SocketAddr,
) {
    while let Some(frame) = outbox_rx.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            debug!("write to client {} error: {}", peer, e);
            return;
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!("shutdown client {} error: {}", peer, e);
    }
}
