//! Remote terminal execution service entrypoint.

use std::sync::Arc;

use action_engine::{router, Service, ServerState, TopicManager};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "action-engine")]
#[command(about = "Remote terminal execution service: PTY execution engine + fanout server")]
#[command(version = env!("GIT_HASH"))]
struct Cli {
    /// Port to listen on
    #[arg(long, default_value_t = 5001)]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    tracing::info!(
        git_hash = env!("GIT_HASH"),
        build_date = env!("BUILD_DATE"),
        "starting action-engine"
    );

    let service = Service::new();
    let topics = Arc::new(TopicManager::new());
    let state = ServerState::new(service.clone(), topics);
    service.set_observer(state.clone()).await;

    let app = router(state);
    let addr = format!("{}:{}", cli.host, cli.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    service.shutdown().await;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
