//! HTTP-facing error type.

use std::path::PathBuf;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use wagate_provider::ProviderError;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// The provider has not written a QR image yet, or it was removed.
    #[error("QR image unavailable at {}: {source}", .path.display())]
    QrUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Provider(ProviderError::InvalidNumber(_)) => StatusCode::BAD_REQUEST,
            AppError::QrUnavailable { .. } | AppError::Provider(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("{self}");
        }
        (status, self.to_string()).into_response()
    }
}
