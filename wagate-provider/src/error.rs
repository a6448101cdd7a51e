//! Provider error type.

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Transport failure talking to the gateway.
    #[error("gateway request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The gateway answered with a non-success status.
    #[error("gateway rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    /// The gateway answered 2xx with a body that is not the expected JSON.
    #[error("malformed gateway response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid phone number: {0:?}")]
    InvalidNumber(String),

    #[error("invalid QR payload: {0}")]
    InvalidQr(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
