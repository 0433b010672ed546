use std::{
    collections::HashMap,
    fmt,
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
};

use log::{error, info};
use tokio::sync::{
    mpsc::{self, Receiver, Sender},
    oneshot,
};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// 会话标识，进程内唯一
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SessionId(u64);

impl SessionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 发送给 registry 的消息
#[derive(Debug)]
enum Command {
    Add {
        id: SessionId,
        username: String,
        peer: SocketAddr,
    },
    Remove {
        id: SessionId,
    },
    Count(oneshot::Sender<usize>),
}

/// 已认证会话的登记处，只用于统计和日志
/// 由后台任务独占，各连接通过 `RegistryHandle` 发消息
struct Registry {
    registry_rx: Receiver<Command>,
    /// key = session id, value = (username, 对端地址)
    sessions: HashMap<SessionId, (String, SocketAddr)>,
}

impl Registry {
    async fn start(mut self) {
        while let Some(command) = self.registry_rx.recv().await {
            match command {
                Command::Add { id, username, peer } => {
                    // 重复添加不计数
                    self.sessions.entry(id).or_insert((username, peer));
                    info!("client connected from: {}", peer);
                    info!("total clients: {}", self.sessions.len());
                }
                Command::Remove { id } => {
                    if let Some((username, _)) = self.sessions.remove(&id) {
                        info!("removed client: {}", username);
                        info!("total clients: {}", self.sessions.len());
                    }
                }
                Command::Count(reply) => {
                    let _ = reply.send(self.sessions.len());
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RegistryHandle {
    registry_tx: Sender<Command>,
}

impl RegistryHandle {
    /// 启动 registry 后台任务
    pub(crate) fn spawn() -> Self {
        let (registry_tx, registry_rx) = mpsc::channel(1000);
        let registry = Registry {
            registry_rx,
            sessions: HashMap::new(),
        };
        tokio::spawn(registry.start());

        Self { registry_tx }
    }

    pub(crate) async fn add(&self, id: SessionId, username: String, peer: SocketAddr) {
        self.send(Command::Add { id, username, peer }).await
    }

    pub(crate) async fn remove(&self, id: SessionId) {
        self.send(Command::Remove { id }).await
    }

    /// 当前已登记的会话数
    pub(crate) async fn count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Count(tx)).await;
        rx.await.unwrap_or_default()
    }

    async fn send(&self, command: Command) {
        if let Err(e) = self.registry_tx.send(command).await {
            error!("send to registry channel error {:#}", e);
        }
    }
}
