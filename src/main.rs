use std::sync::Arc;

use anyhow::{Context, Result};
use flume::unbounded;
use tracing_subscriber::EnvFilter;

use moltville_citizen::{Citizen, CitizenConfig, HttpWorld};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,moltville_citizen=debug")),
        )
        .init();

    let config = CitizenConfig::load();
    tracing::info!(
        "Waking up citizen {} against {}",
        config.agent.name,
        config.server.url
    );

    let (event_tx, event_rx) = unbounded();
    let world = Arc::new(HttpWorld::new(
        config.server.url.clone(),
        config.server.api_key.clone(),
        event_tx,
    ));

    let citizen = Arc::new(Citizen::new(config, world.clone(), event_rx));
    citizen
        .bootstrap()
        .await
        .context("failed to join the world")?;

    let poller = tokio::spawn(async move { world.poll_events_forever().await });
    citizen.run().await;
    poller.abort();
    Ok(())
}
