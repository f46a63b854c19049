//! AirDelivery rendezvous server entry point.

mod config;

use std::sync::Arc;

use airdelivery_rendezvous::RendezvousServer;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let path = config::config_path(std::env::args().nth(1));
    let config = config::Config::load(path.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_filter)),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = ?path,
        "starting AirDelivery rendezvous server"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(config))?;

    tracing::info!("server shut down cleanly");
    Ok(())
}

async fn run(config: config::Config) -> anyhow::Result<()> {
    let server = RendezvousServer::new(config.to_server_config());
    let runner = Arc::clone(&server);
    let mut handle = tokio::spawn(async move { runner.run().await });

    tokio::select! {
        result = &mut handle => {
            // The server only returns on its own when it could not start.
            result??;
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("interrupt received, shutting down");
            server.shutdown();
            handle.await??;
        }
    }
    Ok(())
}
