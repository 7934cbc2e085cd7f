use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use resource_manager::Credentials;
use session_manager::clients::{build_connector, ClientCache};
use session_manager::config::AppConfig;
use session_manager::controller::ControllerDeps;
use session_manager::pool::BlockingPool;
use session_manager::routes::build_router;
use session_manager::sleeper::TokioSleeper;
use session_manager::spec::{validate_for_backend, validate_settings};
use session_manager::state::AppState;
use session_manager::store::build_store;
use session_manager::telemetry::init_tracing;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cfg = AppConfig::from_env().context("failed to load configuration")?;
    init_tracing(cfg.log_filter.as_deref());

    validate_settings(&cfg.session).context("invalid session settings")?;
    validate_for_backend(&cfg.session, cfg.resource_manager.backend)
        .context("session settings do not fit the resource manager backend")?;

    let pool = BlockingPool::new(cfg.blocking_threads);
    let connector = build_connector(&cfg.resource_manager)?;
    let clients = Arc::new(ClientCache::new(connector, pool.clone()));
    let deps = ControllerDeps {
        settings: Arc::new(cfg.session.clone()),
        credentials: Credentials::new(cfg.session.principal.clone(), cfg.session.keytab.clone()),
        clients,
        pool,
        store: build_store(&cfg),
        sleeper: Arc::new(TokioSleeper),
    };

    if cfg.api_token.is_none() {
        warn!("api_token not set; host control routes are unauthenticated");
    }
    let state = AppState::new(deps)
        .with_api_token(cfg.api_token.clone())
        .with_start_timeout(Duration::from_secs(cfg.start_timeout_secs));
    let app = build_router(state);

    let addr: SocketAddr = cfg.bind_addr.parse()?;
    info!(%addr, queue = %cfg.session.queue, "starting session manager");
    axum::serve(
        tokio::net::TcpListener::bind(addr).await?,
        app.into_make_service(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
