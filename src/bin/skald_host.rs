//! skald host: runs the WebSocket bus endpoint and the intent service in one
//! process. Skills and collaborator services (audio, GUI, speech-to-text)
//! connect over the bus port.

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use skald::bus::{server, Broker, BusClient};
use skald::{IntentService, SkaldConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = SkaldConfig::load_default().context("loading configuration")?;
    let addr = format!("{}:{}", config.bus.host, config.bus.port);
    info!(%addr, "starting skald host");

    let bus = BusClient::new(Arc::new(Broker::new()));
    let cancel = CancellationToken::new();

    let endpoint = {
        let bus = bus.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { server::serve(bus, &addr, cancel).await })
    };
    let service = {
        let service = IntentService::new(config, bus.clone());
        let cancel = cancel.clone();
        tokio::spawn(service.run(cancel))
    };

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown requested");
    cancel.cancel();

    endpoint.await.context("bus endpoint task")??;
    service.await.context("intent service task")??;
    info!("skald host stopped");
    Ok(())
}
