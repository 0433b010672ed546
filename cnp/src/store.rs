//! 凭证存储的实现

use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use log::debug;
use tokio::{fs, sync::RwLock};

use crate::{auth::password_hash, CredentialStore, UserRecord};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Credential store unavailable: {0}")]
    Unavailable(String),
    #[error("Read credential file error: {0}")]
    IO(#[from] io::Error),
    #[error("Parse credential file error: {0}")]
    Parse(#[from] toml::de::Error),
}

/// 内存中的凭证表
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    users: HashMap<String, UserRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: UserRecord) {
        self.users.insert(record.username.clone(), record);
    }

    /// 以明文密码添加用户
    pub fn insert_user(&mut self, username: &str, display_name: &str, salt: &str, password: &str) {
        self.insert(UserRecord {
            username: username.to_owned(),
            display_name: display_name.to_owned(),
            salt: salt.to_owned(),
            hash: password_hash(salt, password),
        })
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn lookup(&self, username: &str) -> Result<Option<UserRecord>, StoreError> {
        Ok(self.users.get(username).cloned())
    }

    async fn reconnect(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Debug, serde::Deserialize)]
struct UsersFile {
    #[serde(default)]
    users: Vec<UserRecord>,
}

/// toml 文件中的凭证表
///
/// ```toml
/// [[users]]
/// username = "alice"
/// display_name = "Alice"
/// salt = "s1"
/// hash = "..."
/// ```
///
/// `reconnect` 重新读取文件
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    users: RwLock<HashMap<String, UserRecord>>,
}

impl FileStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let users = Self::load(&path).await?;

        Ok(Self {
            path,
            users: RwLock::new(users),
        })
    }

    async fn load(path: &Path) -> Result<HashMap<String, UserRecord>, StoreError> {
        let s = fs::read_to_string(path).await?;
        let file = toml::from_str::<UsersFile>(&s)?;
        debug!("loaded {} users from {}", file.users.len(), path.display());

        Ok(file
            .users
            .into_iter()
            .map(|record| (record.username.clone(), record))
            .collect())
    }
}

#[async_trait]
impl CredentialStore for FileStore {
    async fn lookup(&self, username: &str) -> Result<Option<UserRecord>, StoreError> {
        Ok(self.users.read().await.get(username).cloned())
    }

    /// 读取或解析失败都视为存储不可达，保留原有数据
    async fn reconnect(&self) -> Result<(), StoreError> {
        let users = Self::load(&self.path)
            .await
            .map_err(|e| StoreError::Unavailable(format!("{}: {}", self.path.display(), e)))?;
        *self.users.write().await = users;
        Ok(())
    }
}
