//! Durable per-session submission state.
//!
//! Each session persists a single `{app_id}` record: empty while nothing is
//! submitted, `PENDING` while a submission is in flight, otherwise the
//! application id. A restarted process reads it back and resumes polling or
//! stopping without submitting again.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{AppConfig, StateBackend};

const REDIS_KEY_PREFIX: &str = "session-manager:state:";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    pub app_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("state backend error: {0}")]
    Backend(String),
    #[error("stored state for `{key}` is unreadable: {reason}")]
    Corrupt { key: String, reason: String },
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<PersistedState>, StoreError>;
    async fn save(&self, key: &str, state: &PersistedState) -> Result<(), StoreError>;
    async fn clear(&self, key: &str) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct InMemoryStore {
    records: Mutex<HashMap<String, PersistedState>>,
}

impl InMemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self, key: &str) -> Option<PersistedState> {
        self.records.lock().get(key).cloned()
    }
}

#[async_trait]
impl SessionStore for InMemoryStore {
    async fn load(&self, key: &str) -> Result<Option<PersistedState>, StoreError> {
        Ok(self.get(key))
    }

    async fn save(&self, key: &str, state: &PersistedState) -> Result<(), StoreError> {
        self.records.lock().insert(key.to_string(), state.clone());
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<(), StoreError> {
        self.records.lock().remove(key);
        Ok(())
    }
}

/// One JSON file per session, replaced atomically on every save.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.json", utf8_percent_encode(key, NON_ALPHANUMERIC)))
    }
}

#[async_trait]
impl SessionStore for FileStore {
    async fn load(&self, key: &str) -> Result<Option<PersistedState>, StoreError> {
        let raw = match tokio::fs::read(self.path_for(key)).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::Backend(err.to_string())),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|err| StoreError::Corrupt {
                key: key.to_string(),
                reason: err.to_string(),
            })
    }

    async fn save(&self, key: &str, state: &PersistedState) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let payload = serde_json::to_vec(state).map_err(|e| StoreError::Backend(e.to_string()))?;
        let target = self.path_for(key);
        let tmp = self.dir.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, payload)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        if let Err(err) = tokio::fs::rename(&tmp, &target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(StoreError::Backend(err.to_string()));
        }
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::Backend(err.to_string())),
        }
    }
}

pub struct RedisStore {
    client: redis::Client,
}

impl RedisStore {
    pub fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self { client })
    }

    async fn conn(&self) -> Result<redis::aio::Connection, StoreError> {
        self.client
            .get_async_connection()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))
    }
}

fn redis_key(key: &str) -> String {
    format!("{REDIS_KEY_PREFIX}{key}")
}

#[async_trait]
impl SessionStore for RedisStore {
    async fn load(&self, key: &str) -> Result<Option<PersistedState>, StoreError> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn
            .get(redis_key(key))
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        raw.map(|raw| {
            serde_json::from_str(&raw).map_err(|err| StoreError::Corrupt {
                key: key.to_string(),
                reason: err.to_string(),
            })
        })
        .transpose()
    }

    async fn save(&self, key: &str, state: &PersistedState) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let payload =
            serde_json::to_string(state).map_err(|e| StoreError::Backend(e.to_string()))?;
        conn.set::<_, _, ()>(redis_key(key), payload)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn clear(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(redis_key(key))
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))
    }
}

pub fn build_store(cfg: &AppConfig) -> Arc<dyn SessionStore> {
    match cfg.state_backend {
        StateBackend::Memory => {
            warn!("session state is kept in memory and will not survive a restart");
            InMemoryStore::new()
        }
        StateBackend::File => match cfg.state_dir.as_deref() {
            Some(dir) => {
                info!(dir, "persisting session state to files");
                Arc::new(FileStore::new(dir))
            }
            None => {
                warn!("state_backend=file but state_dir is not set; falling back to memory");
                InMemoryStore::new()
            }
        },
        StateBackend::Redis => match cfg.redis_url.as_deref().map(RedisStore::connect) {
            Some(Ok(store)) => {
                info!("persisting session state to redis");
                Arc::new(store)
            }
            Some(Err(err)) => {
                warn!(error = %err, "invalid redis_url; falling back to memory");
                InMemoryStore::new()
            }
            None => {
                warn!("state_backend=redis but redis_url is not set; falling back to memory");
                InMemoryStore::new()
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submitted(id: &str) -> PersistedState {
        PersistedState { app_id: id.into() }
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = InMemoryStore::new();
        assert_eq!(store.load("alice").await.unwrap(), None);
        store.save("alice", &submitted("application_1_0001")).await.unwrap();
        assert_eq!(
            store.load("alice").await.unwrap(),
            Some(submitted("application_1_0001"))
        );
        store.clear("alice").await.unwrap();
        assert_eq!(store.load("alice").await.unwrap(), None);
    }

    #[tokio::test]
    async fn file_store_survives_a_new_instance() {
        let dir = tempfile::tempdir().unwrap();
        FileStore::new(dir.path())
            .save("alice/lab", &submitted("application_1_0002"))
            .await
            .unwrap();

        let reopened = FileStore::new(dir.path());
        assert_eq!(
            reopened.load("alice/lab").await.unwrap(),
            Some(submitted("application_1_0002"))
        );
        assert_eq!(reopened.load("alice").await.unwrap(), None);

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["alice%2Flab.json".to_string()]);

        reopened.clear("alice/lab").await.unwrap();
        reopened.clear("alice/lab").await.unwrap();
        assert_eq!(reopened.load("alice/lab").await.unwrap(), None);
    }

    #[tokio::test]
    async fn file_store_reports_corrupt_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        std::fs::write(store.path_for("bob"), b"{not json").unwrap();
        assert!(matches!(
            store.load("bob").await,
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    #[ignore]
    async fn redis_store_round_trip() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".into());
        let store = RedisStore::connect(&url).unwrap();
        let key = format!("test-{}", uuid::Uuid::new_v4());
        store.save(&key, &submitted("PENDING")).await.unwrap();
        assert_eq!(store.load(&key).await.unwrap(), Some(submitted("PENDING")));
        store.clear(&key).await.unwrap();
        assert_eq!(store.load(&key).await.unwrap(), None);
    }
}
