#![allow(dead_code)]

//! CNP（Commodore Network Protocol）网关服务端库
//!
//! 复古客户端没有 TCP/IP 协议栈，通过一条已认证的物理连接，
//! 由网关代为打开任意数量的后端 TCP 连接，并在这条连接上多路复用

use async_trait::async_trait;

pub mod auth;
pub mod config;
pub mod error;
pub mod gateway;
mod network;
mod protocol;
pub mod store;

pub use auth::password_hash;
pub use gateway::Gateway;
pub use store::{FileStore, MemoryStore, StoreError};

/// 用户凭证记录
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct UserRecord {
    /// 登录用户名
    pub username: String,
    /// 显示名称
    pub display_name: String,
    /// 密码盐
    pub salt: String,
    /// md5(salt + password) 的十六进制小写字符串
    pub hash: String,
}

/// 外部凭证存储，所有连接共享同一个实例
///
/// 存储不可达时返回错误，认证方会调用 `reconnect` 后重试同一次查询
#[async_trait]
pub trait CredentialStore: Send + Sync + 'static {
    /// 按用户名查找，没有记录返回 `Ok(None)`
    async fn lookup(&self, username: &str) -> Result<Option<UserRecord>, StoreError>;
    /// 重新建立与存储的连接
    async fn reconnect(&self) -> Result<(), StoreError>;
}
