use std::{io, net::SocketAddr, time::Duration};

use tokio::{fs, io::AsyncReadExt};

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:6400";
/// 认证超时，单位秒
pub const DEFAULT_AUTH_TIMEOUT: u64 = 10;
/// 连接空闲超时，单位秒
pub const DEFAULT_IDLE_TIMEOUT: u64 = 600;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Read config file error: {0}")]
    Read(#[from] io::Error),
    #[error("Parse config file error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid listen address: {0}")]
    InvalidListenAddr(String),
    #[error("listen port must be a number between 1025 and 65535")]
    ListenPort,
    #[error("authentication timeout must be a number between 1 and 60")]
    AuthTimeout,
    #[error("socket timeout must be a number between 5 and 600")]
    IdleTimeout,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: Gateway,
    #[serde(default)]
    pub store: Store,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct Gateway {
    pub listen_addr: String,
    pub auth_timeout: u64,
    pub idle_timeout: u64,
    /// 不输出连接相关的日志
    pub quiet: bool,
}

impl Default for Gateway {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_owned(),
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            quiet: false,
        }
    }
}

impl Gateway {
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }

    /// 只替换监听地址中的端口
    pub fn set_port(&mut self, port: u16) -> Result<(), Error> {
        let mut addr = self.socket_addr()?;
        addr.set_port(port);
        self.listen_addr = addr.to_string();
        Ok(())
    }

    fn socket_addr(&self) -> Result<SocketAddr, Error> {
        self.listen_addr
            .parse()
            .map_err(|_| Error::InvalidListenAddr(self.listen_addr.clone()))
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct Store {
    /// 用户凭证文件
    pub users_path: String,
}

impl Default for Store {
    fn default() -> Self {
        Self {
            users_path: "users.toml".to_owned(),
        }
    }
}

impl Config {
    pub async fn from_path(path: &str) -> Result<Self, Error> {
        let mut file = fs::File::open(path).await?;
        let mut s = String::new();
        file.read_to_string(&mut s).await?;

        Self::parse(&s)
    }

    pub fn parse(s: &str) -> Result<Self, Error> {
        Ok(toml::from_str::<Config>(s)?)
    }

    /// 检查取值范围
    pub fn validate(&self) -> Result<(), Error> {
        let addr = self.gateway.socket_addr()?;
        if addr.port() < 1025 {
            return Err(Error::ListenPort);
        }
        if !(1..=60).contains(&self.gateway.auth_timeout) {
            return Err(Error::AuthTimeout);
        }
        if !(5..=600).contains(&self.gateway.idle_timeout) {
            return Err(Error::IdleTimeout);
        }
        Ok(())
    }
}
