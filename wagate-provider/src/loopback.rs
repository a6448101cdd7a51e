//! In-process provider that never leaves the machine.
//!
//! Outbound messages are recorded instead of delivered, and events are
//! injected by the caller with [`LoopbackProvider::emit`]. Integration tests
//! drive the server through it, and `--provider loopback` lets a frontend be
//! developed without a phone.

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::error::ProviderError;
use crate::event::ProviderEvent;
use crate::provider::{EVENT_CAPACITY, Provider, SendOptions};

/// A message handed to [`LoopbackProvider::send_message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub phone: String,
    pub message: String,
    pub options: SendOptions,
}

pub struct LoopbackProvider {
    events: broadcast::Sender<ProviderEvent>,
    sent: Mutex<Vec<SentMessage>>,
}

impl LoopbackProvider {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            events,
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Inject an event as if the session had produced it.
    /// Returns the number of subscribers that will see it.
    pub fn emit(&self, event: ProviderEvent) -> usize {
        self.events.send(event).unwrap_or(0)
    }

    /// Everything sent so far, oldest first.
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }
}

impl Default for LoopbackProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for LoopbackProvider {
    fn name(&self) -> &'static str {
        "loopback"
    }

    async fn start(&self) -> Result<(), ProviderError> {
        tracing::info!("Loopback provider started; no device will be linked");
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.events.subscribe()
    }

    async fn send_message(
        &self,
        phone: &str,
        message: &str,
        options: &SendOptions,
    ) -> Result<(), ProviderError> {
        let phone = phone.trim();
        if phone.is_empty() {
            return Err(ProviderError::InvalidNumber(phone.to_string()));
        }
        tracing::debug!(%phone, "Loopback send");
        self.sent.lock().push(SentMessage {
            phone: phone.to_string(),
            message: message.to_string(),
            options: options.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_sent_messages_in_order() {
        let provider = LoopbackProvider::new();
        provider.send_message("111", "first", &SendOptions::default()).await.unwrap();
        provider.send_message("222", "second", &SendOptions::default()).await.unwrap();

        let sent = provider.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].phone, "111");
        assert_eq!(sent[1].message, "second");
    }

    #[tokio::test]
    async fn rejects_blank_number() {
        let provider = LoopbackProvider::new();
        let err = provider.send_message("  ", "hi", &SendOptions::default()).await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidNumber(_)));
        assert!(provider.sent().is_empty());
    }

    #[tokio::test]
    async fn emit_reaches_subscribers_only() {
        let provider = LoopbackProvider::new();
        assert_eq!(provider.emit(ProviderEvent::Ready), 0, "no subscriber yet");

        let mut rx = provider.subscribe();
        assert_eq!(provider.emit(ProviderEvent::RequireAction), 1);
        assert_eq!(rx.recv().await.unwrap(), ProviderEvent::RequireAction);
    }
}
