use anyhow::{Context, Result};
use mentor_backend::config::MentorConfig;
use mentor_backend::runtime::BackendRuntime;
use mentor_backend::server::serve_backend;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,mentor_backend=debug")),
        )
        .init();

    let config = MentorConfig::load();
    let runtime =
        BackendRuntime::bootstrap(config).context("failed to bootstrap backend runtime")?;

    tracing::info!(
        "Starting mentor backend (bind via MENTOR_BACKEND_BIND; auth mode via MENTOR_BACKEND_AUTH_MODE + MENTOR_BACKEND_TOKEN)"
    );

    let server_rt = tokio::runtime::Runtime::new().context("failed to start server runtime")?;
    server_rt.block_on(serve_backend(runtime))
}
