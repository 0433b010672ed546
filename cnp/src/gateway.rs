use std::{net::SocketAddr, sync::Arc};

use log::{debug, error, info};
use tokio::{
    net::{TcpListener, TcpStream},
    time,
};

use crate::{
    auth::{self, Error as AuthError},
    config::Config,
    error::Error,
    network::{conn, ClientConnection, Error as NetworkError, SessionEventLoop},
    protocol::{RegistryHandle, SessionId},
    CredentialStore, FileStore,
};

/// 代表一个 CNP 网关节点
pub struct Gateway {
    cfg: Config,
}

impl Gateway {
    pub fn new(cfg: Config) -> Self {
        Self { cfg }
    }

    /// 使用配置中的凭证文件启动
    pub async fn start(&self) -> Result<(), Error> {
        let store = FileStore::open(&self.cfg.store.users_path).await?;
        info!("connected to authentication server.");
        self.start_with_store(Arc::new(store)).await
    }

    pub async fn start_with_store<S: CredentialStore>(&self, store: Arc<S>) -> Result<(), Error> {
        let listener = TcpListener::bind(&self.cfg.gateway.listen_addr).await?;
        info!("listenPort: {}", listener.local_addr()?.port());
        self.serve(listener, store).await
    }

    /// 在已绑定的监听上接受客户端连接，只在监听本身出错时返回
    pub async fn serve<S: CredentialStore>(
        &self,
        listener: TcpListener,
        store: Arc<S>,
    ) -> Result<(), Error> {
        let registry = RegistryHandle::spawn();
        let auth_timeout = self.cfg.gateway.auth_timeout();
        let idle_timeout = self.cfg.gateway.idle_timeout();

        debug!("start client server loop");
        loop {
            // 获取到连接
            let (stream, addr) = match listener.accept().await {
                Ok((s, a)) => (s, a),
                Err(e) => {
                    error!("accept tcp stream err: {}", e);
                    continue;
                }
            };

            let client_store = store.clone();
            let client_registry = registry.clone();
            tokio::spawn(async move {
                handle_client(
                    stream,
                    addr,
                    client_store,
                    client_registry,
                    auth_timeout,
                    idle_timeout,
                )
                .await
            });
        }
    }
}

async fn handle_client<S: CredentialStore>(
    stream: TcpStream,
    addr: SocketAddr,
    store: Arc<S>,
    registry: RegistryHandle,
    auth_timeout: time::Duration,
    idle_timeout: time::Duration,
) {
    info!("client connected. waiting for authentication.");
    if let Err(e) = stream.set_nodelay(true) {
        debug!("set nodelay on {} error: {}", addr, e);
    }
    let (mut conn, outbox) = ClientConnection::new(stream, addr);

    // 认证失败时 conn 和 outbox 一起被丢弃，连接随之关闭
    let authenticated = auth::authenticate(&mut conn, store.as_ref(), auth_timeout).await;
    let (user, pending) = match authenticated {
        Ok(authenticated) => authenticated,
        Err(AuthError::UnknownUser(username)) => {
            info!("client authentication timed out. unknown user: {}", username);
            return;
        }
        Err(e) => {
            info!("{}", e);
            return;
        }
    };
    info!("client authentication successful: {}", user.username);

    let id = SessionId::next();
    let username = user.username.clone();
    registry.add(id, username.clone(), conn.peer()).await;

    let event_loop = SessionEventLoop::new(conn, outbox, user, idle_timeout);
    match event_loop.start(pending).await {
        Ok(()) => {}
        Err(NetworkError::Connection(conn::Error::IdleTimeout)) => {
            info!("client connection timed out. {}", username)
        }
        Err(NetworkError::Connection(conn::Error::ConnectionAborted)) => {
            info!("client connection ended. {}", username)
        }
        Err(e) => info!("client connection ended. {}: {}", username, e),
    }

    registry.remove(id).await;
}
