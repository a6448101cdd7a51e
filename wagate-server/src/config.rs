//! Server configuration (command line with environment fallbacks).

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use wagate_provider::evolution::EvolutionConfig;

/// Origin of the bundled web frontend during development.
pub const DEFAULT_CORS_ORIGIN: &str = "http://localhost:4200";

/// Which session backend to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProviderKind {
    /// Evolution API gateway (Baileys).
    Evolution,
    /// In-process stand-in; nothing is delivered.
    Loopback,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "wagate-server", about = "HTTP/WebSocket façade for a WhatsApp bot session")]
pub struct ServerConfig {
    /// Address for the HTTP/WebSocket listener
    #[arg(long, env = "WAGATE_LISTEN_ADDR", default_value = "0.0.0.0:3002")]
    pub listen_addr: String,

    /// Allowed CORS origin (repeat for several)
    #[arg(
        long = "cors-origin",
        env = "WAGATE_CORS_ORIGIN",
        value_delimiter = ',',
        default_value = DEFAULT_CORS_ORIGIN
    )]
    pub cors_origins: Vec<String>,

    /// Pairing QR image written by the provider
    #[arg(long, env = "WAGATE_QR_PATH", default_value = "bot.qr.png")]
    pub qr_path: PathBuf,

    /// Session backend
    #[arg(long, env = "WAGATE_PROVIDER", value_enum, default_value_t = ProviderKind::Evolution)]
    pub provider: ProviderKind,

    /// Evolution API base URL
    #[arg(long, env = "WAGATE_EVOLUTION_URL", default_value = "http://127.0.0.1:8080")]
    pub evolution_url: String,

    /// Evolution API key (sent as the `apikey` header)
    #[arg(long, env = "WAGATE_EVOLUTION_API_KEY")]
    pub evolution_api_key: Option<String>,

    /// Evolution instance name
    #[arg(long = "instance-name", env = "WAGATE_INSTANCE", default_value = "wagate")]
    pub instance_name: String,

    /// Seconds between connection-state polls
    #[arg(long, env = "WAGATE_POLL_INTERVAL_SECS", default_value_t = 5)]
    pub poll_interval_secs: u64,

    /// TOML file with keyword flows (none = no automatic answers)
    #[arg(long, env = "WAGATE_FLOW_FILE")]
    pub flow_file: Option<PathBuf>,

    /// Shared secret the gateway must send in `x-wagate-secret` when posting
    /// webhooks (none = webhooks are accepted unauthenticated)
    #[arg(long, env = "WAGATE_WEBHOOK_SECRET")]
    pub webhook_secret: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3002".to_string(),
            cors_origins: vec![DEFAULT_CORS_ORIGIN.to_string()],
            qr_path: PathBuf::from("bot.qr.png"),
            provider: ProviderKind::Evolution,
            evolution_url: "http://127.0.0.1:8080".to_string(),
            evolution_api_key: None,
            instance_name: "wagate".to_string(),
            poll_interval_secs: 5,
            flow_file: None,
            webhook_secret: None,
        }
    }
}

impl ServerConfig {
    pub fn evolution(&self) -> EvolutionConfig {
        EvolutionConfig {
            api_url: self.evolution_url.clone(),
            api_key: self.evolution_api_key.clone(),
            instance_name: self.instance_name.clone(),
            qr_path: self.qr_path.clone(),
            poll_interval: Duration::from_secs(self.poll_interval_secs.max(1)),
        }
    }
}
