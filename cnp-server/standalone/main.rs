use std::process;

use clap::Parser;
use cnp::Gateway;
use cnp_server::{Args, EnvOverrides};
use log::{error, info};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // 获取配置
    let cfg = match EnvOverrides::from_env() {
        Ok(env) => cnp_server::load_config(&args, &env).await,
        Err(e) => Err(e),
    };
    let cfg = match cfg {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    };

    let _logger = match cnp_server::init_logger(cfg.gateway.quiet) {
        Ok(logger) => logger,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    };
    info!(
        "Commodore Network Protocol (CNP) server v{}",
        env!("CARGO_PKG_VERSION")
    );

    // 启动网关
    if let Err(e) = Gateway::new(cfg).start().await {
        error!("gateway exit error: {}", e);
        process::exit(1);
    }
}
