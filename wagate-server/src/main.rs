use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use wagate_provider::Provider;
use wagate_provider::evolution::EvolutionProvider;
use wagate_provider::loopback::LoopbackProvider;
use wagate_server::config::{ProviderKind, ServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Use JSON logs in production (WAGATE_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("WAGATE_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env()
        .add_directive("wagate_server=info".parse()?)
        .add_directive("wagate_provider=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .init();
    }

    let config = ServerConfig::parse();
    let provider: Arc<dyn Provider> = match config.provider {
        ProviderKind::Evolution => Arc::new(EvolutionProvider::new(config.evolution())),
        ProviderKind::Loopback => Arc::new(LoopbackProvider::new()),
    };
    tracing::info!(
        "Starting on {} with {} provider (QR at {})",
        config.listen_addr,
        provider.name(),
        config.qr_path.display()
    );

    let server = wagate_server::server::Server::new(config, provider);
    server.run().await
}
