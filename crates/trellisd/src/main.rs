#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use trellis_common::SecretKey;
use trellisd::config::{Args, Config};
use trellisd::metrics::{start_metrics_server, HealthState};
use trellisd::Server;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let secret_key = match &args.key {
        Some(path) => {
            let key = SecretKey::load(path)?;
            info!("loaded node key from {}", path.display());
            key
        }
        None => {
            warn!("using ephemeral node key (not persisted)");
            SecretKey::generate()
        }
    };

    let metrics_addr = args.metrics_addr;
    let config = Config::from_args(&args, secret_key).map_err(anyhow::Error::msg)?;
    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }

    let server = Server::new(config);
    info!("node id: {}", server.local_id());

    let health_state = HealthState::new();
    tokio::spawn({
        let health_state = health_state.clone();
        async move {
            if let Err(e) = start_metrics_server(metrics_addr, health_state).await {
                warn!("metrics server error: {}", e);
            }
        }
    });

    server.start().await?;
    if let Some(addr) = server.listen_addr() {
        info!("overlay url: trellis://{}@{}", server.local_id(), addr);
    }

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal");
    health_state.set_ready(false);
    server.stop().await;

    Ok(())
}
