//! Process-wide resource-manager connections, one per credential pair.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use resource_manager::{
    Connector, Credentials, InMemoryCluster, InMemoryConnector, ResourceManager, RestConnector,
};
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::config::{ResourceManagerBackend, ResourceManagerConfig};
use crate::error::RemoteError;
use crate::metrics::CLIENT_CONNECTIONS;
use crate::pool::BlockingPool;
use crate::spec::ConfigError;

type Slot = Arc<OnceCell<Arc<dyn ResourceManager>>>;

pub struct ClientCache {
    connector: Arc<dyn Connector>,
    pool: BlockingPool,
    entries: DashMap<Credentials, Slot>,
}

impl ClientCache {
    pub fn new(connector: Arc<dyn Connector>, pool: BlockingPool) -> Self {
        Self {
            connector,
            pool,
            entries: DashMap::new(),
        }
    }

    /// Returns the shared connection for `credentials`, connecting on first
    /// use. Concurrent first callers wait on the same handshake. A failed
    /// handshake leaves the slot empty so the next caller retries.
    pub async fn get_client(
        &self,
        credentials: &Credentials,
    ) -> Result<Arc<dyn ResourceManager>, RemoteError> {
        let slot = self.entries.entry(credentials.clone()).or_default().clone();
        let client = slot
            .get_or_try_init(|| async {
                let connector = Arc::clone(&self.connector);
                let creds = credentials.clone();
                let client = self
                    .pool
                    .run(move || connector.connect(&creds))
                    .await?
                    .map_err(RemoteError::Connect)?;
                CLIENT_CONNECTIONS.inc();
                info!(principal = ?credentials.principal, "resource manager connection established");
                Ok::<_, RemoteError>(client)
            })
            .await?;
        Ok(Arc::clone(client))
    }

    /// Drops the cached connection for `credentials` if it is still `stale`.
    /// A slot that was already refreshed by another caller is left alone.
    pub fn invalidate(&self, credentials: &Credentials, stale: &Arc<dyn ResourceManager>) {
        let removed = self.entries.remove_if(credentials, |_, slot| {
            slot.get()
                .map(|current| same_client(current, stale))
                .unwrap_or(false)
        });
        if removed.is_some() {
            warn!(principal = ?credentials.principal, "dropped resource manager connection after auth failure");
        }
    }
}

fn same_client(a: &Arc<dyn ResourceManager>, b: &Arc<dyn ResourceManager>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

pub fn build_connector(cfg: &ResourceManagerConfig) -> Result<Arc<dyn Connector>, ConfigError> {
    match cfg.backend {
        ResourceManagerBackend::Memory => {
            warn!("using the in-memory resource manager; applications are simulated");
            Ok(Arc::new(InMemoryConnector::new(InMemoryCluster::new())))
        }
        ResourceManagerBackend::Rest => {
            let url = cfg
                .url
                .as_deref()
                .ok_or(ConfigError::Missing("resource_manager.url"))?;
            info!(url, "using the REST resource manager");
            Ok(Arc::new(
                RestConnector::new(url).with_timeout(Duration::from_secs(cfg.request_timeout_secs)),
            ))
        }
    }
}
