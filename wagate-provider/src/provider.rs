//! The provider trait.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::ProviderError;
use crate::event::ProviderEvent;

/// Buffered events per subscriber before it starts lagging.
pub const EVENT_CAPACITY: usize = 64;

/// Per-message delivery options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Media URL to attach. The message text becomes its caption.
    pub media: Option<String>,
}

/// A WhatsApp session backend.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Short identifier used in logs and `/health`.
    fn name(&self) -> &'static str;

    /// Begin the session in the background. Returns once the first
    /// handshake with the backend is done; events follow on [`subscribe`].
    ///
    /// [`subscribe`]: Provider::subscribe
    async fn start(&self) -> Result<(), ProviderError>;

    /// Receive all events emitted after this call.
    fn subscribe(&self) -> broadcast::Receiver<ProviderEvent>;

    async fn send_message(
        &self,
        phone: &str,
        message: &str,
        options: &SendOptions,
    ) -> Result<(), ProviderError>;

    /// Feed a webhook payload pushed by the backend. Events it produces are
    /// emitted before this returns, so payloads are applied in call order.
    /// Returns `false` when this provider does not take webhooks.
    async fn ingest_webhook(&self, _payload: &serde_json::Value) -> bool {
        false
    }
}
