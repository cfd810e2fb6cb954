//! Server binary entry point: wires a [`rfp_core::CoreRuntime`] from the
//! environment and serves its HTTP surface until killed or interrupted.
//!
//! Grounded in the donor's `src/main.rs` (tracing-subscriber init,
//! `anyhow::Result` top-level error handling).

use anyhow::{Context, Result};
use rfp_core::config::CoreConfig;
use rfp_core::server;
use rfp_core::CoreRuntime;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("rfp_core=info".parse()?),
        )
        .init();

    let config = match std::env::var("CORE_CONFIG_PATH") {
        Ok(path) => CoreConfig::load_from_file(&path)
            .with_context(|| format!("loading configuration from {path}"))?,
        Err(_) => match std::env::var("CORE_PROFILE").as_deref() {
            Ok("production") => CoreConfig::production(),
            Ok("testing") => CoreConfig::testing(),
            _ => CoreConfig::development(),
        },
    };

    let port: u16 = std::env::var("CORE_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);

    info!(port, "starting rfp coordination core");
    let runtime = CoreRuntime::new(config, Vec::new()).await?;
    let router = server::create_router(runtime.engine.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let (listener, actual_addr) = server::bind(addr).await?;
    info!(addr = %actual_addr, "listening");

    let shutdown_token = CancellationToken::new();
    let shutdown_signal = shutdown_token.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        shutdown_signal.cancel();
    });

    server::serve_with_graceful_shutdown(listener, router, shutdown_token).await?;
    info!("server stopped");
    Ok(())
}
