//! Standalone relay server binary.

use std::path::Path;

use pulsar_config::Config;
use pulsar_server::PulsarServer;
use tracing::error;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load_or_create(Path::new("config"))?;
    pulsar_log::init_logging(
        Some(Path::new("logs")),
        cfg!(debug_assertions),
        Some(&config),
    );

    let server = PulsarServer::bind(config).await?;
    let handle = server.handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.shutdown();
        }
    });

    if let Err(e) = server.run().await {
        error!("server exited with error: {e}");
        return Err(e.into());
    }
    Ok(())
}
