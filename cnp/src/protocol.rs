//! 协议层
//! 处理会话和虚拟套接字的状态，依赖于底层的网络层进行网络读写

use bytes::Bytes;

pub(crate) use channel::{Disposition, VirtualSocket};
pub(crate) use registry::{RegistryHandle, SessionId};
pub(crate) use session::{Flow, Session};

mod channel;
mod registry;
mod session;

/// 虚拟套接字背后的后端连接
pub(crate) trait Backend {
    /// 把客户端数据交给后端写出，后端已经不可用时返回 false
    fn write(&mut self, data: Bytes) -> bool;
}

/// 驱动虚拟套接字状态机的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ChannelEvent {
    /// 后端连接建立
    Connected,
    /// 后端连接失败或超时
    ConnectFailed,
    /// 后端发来数据
    Received(Bytes),
    /// 后端连接关闭
    Closed,
    /// 客户端确认
    Ack,
    /// 客户端要求重传
    Nak,
    /// 客户端发来需要转发的数据
    Write(Bytes),
}

/// 后端连接任务发给会话的消息
#[derive(Debug)]
pub(crate) struct BackendEvent {
    pub port: u8,
    /// 虚拟套接字的序号，用来丢弃已被替换的套接字的迟到事件
    pub serial: u64,
    pub event: ChannelEvent,
}
