//! 连接认证
//!
//! 客户端在物理连接上以 CR 分隔的明文发送用户名和密码，
//! 网关不回复任何内容：成功直接进入会话，失败关闭连接

use bytes::{Bytes, BytesMut};
use log::{info, warn};
use md5::{Digest, Md5};
use tokio::time;

use crate::{
    network::{conn, ClientConnection},
    CredentialStore, UserRecord,
};

/// 凭证存储断开后重连的间隔
pub const RECONNECT_BACKOFF: time::Duration = time::Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("client authentication timed out")]
    TimedOut,
    #[error("unknown user: {0}")]
    UnknownUser(String),
    #[error("client authentication failed: {0}")]
    BadPassword(String),
    #[error("Connection error: {0}")]
    Connection(conn::Error),
}

impl From<conn::Error> for Error {
    fn from(e: conn::Error) -> Self {
        match e {
            conn::Error::IdleTimeout => Error::TimedOut,
            e => Error::Connection(e),
        }
    }
}

/// 客户端发来的登录凭证
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Credentials {
    pub username: String,
    pub password: String,
}

/// 按 CR 切分，出现两个 CR 才算收齐：用户名、密码、其余部分
/// 返回凭证和剩余字节的起始位置，紧跟在密码后面的换行符一并跳过
pub(crate) fn parse_credentials(text: &[u8]) -> Option<(Credentials, usize)> {
    let first = text.iter().position(|&byte| byte == b'\r')?;
    let second = first + 1 + text[first + 1..].iter().position(|&byte| byte == b'\r')?;

    let credentials = Credentials {
        username: String::from_utf8_lossy(&text[..first]).trim().to_owned(),
        password: String::from_utf8_lossy(&text[first + 1..second])
            .trim()
            .to_owned(),
    };
    let consumed = second
        + 1
        + text[second + 1..]
            .iter()
            .take_while(|&&byte| byte == b'\r' || byte == b'\n')
            .count();
    Some((credentials, consumed))
}

/// md5(salt + password) 的十六进制小写字符串
pub fn password_hash(salt: &str, password: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect()
}

/// 读取凭证并校验，成功时返回用户记录和凭证之后已经读到的字节
///
/// 读取阶段受 `timeout` 保护；凭证收齐后的查询不受超时限制，
/// 存储断开时会无限重试
pub(crate) async fn authenticate<S: CredentialStore>(
    conn: &mut ClientConnection,
    store: &S,
    timeout: time::Duration,
) -> Result<(UserRecord, Bytes), Error> {
    let mut text = BytesMut::new();
    let (credentials, consumed) = loop {
        let chunk = conn.read_more(timeout).await?;
        text.extend_from_slice(&chunk);
        if let Some(parsed) = parse_credentials(&text) {
            break parsed;
        }
    };
    // 客户端收不到认证结果，紧跟着凭证发送的报文交给会话处理
    let pending = text.split_off(consumed).freeze();

    let record = match lookup(store, &credentials.username).await {
        Some(record) => record,
        None => return Err(Error::UnknownUser(credentials.username)),
    };

    if password_hash(&record.salt, &credentials.password) != record.hash {
        return Err(Error::BadPassword(credentials.username));
    }

    Ok((record, pending))
}

/// 查询用户，存储不可达时重连后重新发起同一查询
pub(crate) async fn lookup<S: CredentialStore>(store: &S, username: &str) -> Option<UserRecord> {
    loop {
        match store.lookup(username).await {
            Ok(record) => return record,
            Err(e) => {
                warn!("lost connection to authentication server: {}", e);
                reconnect(store).await;
            }
        }
    }
}

// TODO 重试没有上限，存储长时间不可用时等待中的连接会一直堆积，需要加一个可配置的上限
async fn reconnect<S: CredentialStore>(store: &S) {
    loop {
        time::sleep(RECONNECT_BACKOFF).await;
        match store.reconnect().await {
            Ok(()) => {
                info!("connected to authentication server.");
                return;
            }
            Err(e) => warn!("reconnect to authentication server failed: {}", e),
        }
    }
}
