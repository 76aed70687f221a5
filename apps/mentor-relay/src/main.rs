use anyhow::{Context, Result};
use clap::Parser;
use mentor_relay::config::{Cli, RelayConfig};
use room_relay::RoomRegistry;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()
        .context("failed to initialise tracing subscriber")?;

    let config = RelayConfig::try_from(Cli::parse())?;
    info!(listen_addr = %config.listen_addr, "starting mentor-relay");

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    mentor_relay::serve(listener, RoomRegistry::new(), async {
        let _ = signal::ctrl_c().await;
    })
    .await?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "waiting for close frames to flush"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");
    Ok(())
}
