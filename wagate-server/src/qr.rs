//! Pairing QR image as served to browsers.

use std::path::Path;

use base64::Engine;

use crate::error::AppError;

/// Prefix of every QR payload sent over HTTP or the realtime channel.
pub const DATA_URL_PREFIX: &str = "data:image/png;base64,";

pub fn to_data_url(png: &[u8]) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(png);
    format!("{DATA_URL_PREFIX}{encoded}")
}

/// Read the QR image from disk as a `data:` URL.
pub async fn read_data_url(path: &Path) -> Result<String, AppError> {
    let png = tokio::fs::read(path).await.map_err(|source| AppError::QrUnavailable {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(to_data_url(&png))
}
