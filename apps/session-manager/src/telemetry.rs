use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// `filter` wins over `RUST_LOG`; both fall back to `info`.
pub fn init_tracing(filter: Option<&str>) {
    let env_filter = match filter {
        Some(filter) => EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info")),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    Registry::default().with(env_filter).with(fmt_layer).init();
}
