//! cnpserver 启动参数、环境变量与日志

use clap::Parser;
use cnp::config::{self, Config};
use flexi_logger::{FlexiLoggerError, Logger, LoggerHandle};

/// Commodore Network Protocol (CNP) server
#[derive(Debug, Parser)]
#[clap(author, version, about)]
pub struct Args {
    /// 配置文件路径，文件不存在时使用默认配置
    #[clap(short, long, default_value = "cnpserver.toml")]
    pub config: String,
    /// 监听端口 (1025-65535)
    #[clap(short, long, alias = "listenport")]
    pub port: Option<u16>,
    /// 客户端认证超时，单位秒 (1-60)
    #[clap(long)]
    pub auth_timeout: Option<u64>,
    /// 客户端连接超时，单位秒 (5-600)
    #[clap(long)]
    pub timeout: Option<u64>,
    /// 不显示客户端连接消息
    #[clap(short, long)]
    pub quiet: bool,
}

/// 以 CNP_ 为前缀的环境变量
#[derive(Debug, Default, serde::Deserialize)]
pub struct EnvOverrides {
    pub port: Option<u16>,
    pub auth_timeout: Option<u64>,
    pub timeout: Option<u64>,
    pub quiet: Option<bool>,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Config(#[from] config::Error),
    #[error("Environment error: {0}")]
    Env(#[from] envy::Error),
    #[error("Logger error: {0}")]
    Logger(#[from] FlexiLoggerError),
}

impl EnvOverrides {
    pub fn from_env() -> Result<Self, Error> {
        Ok(envy::prefixed("CNP_").from_env::<Self>()?)
    }
}

/// 读取配置文件，依次叠加环境变量和命令行参数，最后检查取值范围
pub async fn load_config(args: &Args, env: &EnvOverrides) -> Result<Config, Error> {
    let mut cfg = match Config::from_path(&args.config).await {
        Ok(cfg) => cfg,
        Err(config::Error::Read(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            Config::default()
        }
        Err(e) => return Err(e.into()),
    };

    apply(&mut cfg, env.port, env.auth_timeout, env.timeout, env.quiet)?;
    apply(
        &mut cfg,
        args.port,
        args.auth_timeout,
        args.timeout,
        args.quiet.then(|| true),
    )?;

    cfg.validate()?;
    Ok(cfg)
}

fn apply(
    cfg: &mut Config,
    port: Option<u16>,
    auth_timeout: Option<u64>,
    timeout: Option<u64>,
    quiet: Option<bool>,
) -> Result<(), config::Error> {
    if let Some(port) = port {
        cfg.gateway.set_port(port)?;
    }
    if let Some(auth_timeout) = auth_timeout {
        cfg.gateway.auth_timeout = auth_timeout;
    }
    if let Some(timeout) = timeout {
        cfg.gateway.idle_timeout = timeout;
    }
    if let Some(quiet) = quiet {
        cfg.gateway.quiet = quiet;
    }
    Ok(())
}

/// 安静模式下只输出警告和错误，RUST_LOG 优先
pub fn init_logger(quiet: bool) -> Result<LoggerHandle, Error> {
    let level = if quiet { "warn" } else { "info" };
    Ok(Logger::try_with_env_or_str(level)?
        .format(flexi_logger::detailed_format)
        .start()?)
}
