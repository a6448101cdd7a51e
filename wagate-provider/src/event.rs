//! Events emitted by a provider for the server to consume.

/// Session-level events. Delivered over a broadcast channel, in the order the
/// provider observed them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    /// A device is linked and the session can send messages.
    Ready,

    /// No device is linked. A fresh QR image has been written to the
    /// provider's QR path and must be scanned from the phone.
    RequireAction,

    /// Inbound text message from a contact.
    Message(IncomingMessage),
}

/// A text message received from a contact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    /// Sender number, normalised (digits only).
    pub from: String,
    pub body: String,
    /// Display name the sender set on their account, if the gateway sent it.
    pub push_name: Option<String>,
}
