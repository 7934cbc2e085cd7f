use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::OnceCell;

use crate::controller::{ControllerDeps, SessionController};
use crate::error::ControllerError;
use crate::session::SessionKey;

const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(300);

type Slot = Arc<OnceCell<Arc<SessionController>>>;

#[derive(Clone)]
pub struct AppState {
    inner: Arc<Inner>,
}

struct Inner {
    deps: ControllerDeps,
    controllers: DashMap<SessionKey, Slot>,
    api_token: Option<String>,
    start_timeout: Duration,
}

impl AppState {
    pub fn new(deps: ControllerDeps) -> Self {
        Self {
            inner: Arc::new(Inner {
                deps,
                controllers: DashMap::new(),
                api_token: None,
                start_timeout: DEFAULT_START_TIMEOUT,
            }),
        }
    }

    pub fn with_api_token(self, token: Option<String>) -> Self {
        self.map_inner(|inner| inner.api_token = token)
    }

    pub fn with_start_timeout(self, timeout: Duration) -> Self {
        self.map_inner(|inner| inner.start_timeout = timeout)
    }

    // Builders run before the state is shared, so the Arc is still unique.
    fn map_inner(self, f: impl FnOnce(&mut Inner)) -> Self {
        let mut inner = Arc::try_unwrap(self.inner).unwrap_or_else(|shared| Inner {
            deps: shared.deps.clone(),
            controllers: shared.controllers.clone(),
            api_token: shared.api_token.clone(),
            start_timeout: shared.start_timeout,
        });
        f(&mut inner);
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn api_token(&self) -> Option<&str> {
        self.inner.api_token.as_deref()
    }

    pub fn start_timeout(&self) -> Duration {
        self.inner.start_timeout
    }

    /// Controller for `key`, created and restored from the store on first use.
    pub async fn controller(&self, key: &SessionKey) -> Result<Arc<SessionController>, ControllerError> {
        let slot = self
            .inner
            .controllers
            .entry(key.clone())
            .or_default()
            .clone();
        let controller = slot
            .get_or_try_init(|| async {
                let controller = SessionController::new(key.clone(), self.inner.deps.clone());
                controller.restore().await?;
                Ok::<_, ControllerError>(Arc::new(controller))
            })
            .await?;
        Ok(Arc::clone(controller))
    }

    /// The session whose start request carried `token`. `name` selects a
    /// named server; without it only default servers match.
    pub fn find_by_token(&self, token: &str, name: Option<&str>) -> Option<Arc<SessionController>> {
        let name = name.unwrap_or("");
        self.inner.controllers.iter().find_map(|entry| {
            let controller = entry.value().get()?;
            let session = controller.session();
            (session.key().name == name && session.token_matches(token))
                .then(|| Arc::clone(controller))
        })
    }

    /// Drops the in-memory controller for `key`; the next request for it
    /// starts from whatever the store holds.
    pub fn remove(&self, key: &SessionKey) {
        self.inner.controllers.remove(key);
    }
}
