//! Normalizing provider output into raw image bytes

use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use crate::backend::traits::ProviderImage;
use crate::config::StorageConfig;
use crate::error::{AppError, PipelineError};
use crate::job::ImageFormat;

/// Decode base64 image data, accepting the data URL form
pub fn decode_base64(encoded: &str) -> Result<Vec<u8>, String> {
    // e.g. "data:image/png;base64,..."
    let data = match encoded.split_once(',') {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => encoded,
    };

    STANDARD
        .decode(data.trim())
        .map_err(|e| format!("Invalid base64 image data: {}", e))
}

pub fn encode_base64(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// HTTP client for provider image downloads
pub fn download_client(config: &StorageConfig) -> crate::error::Result<Client> {
    Client::builder()
        .timeout(Duration::from_millis(config.download_timeout_ms))
        .build()
        .map_err(|e| AppError::Internal(format!("Failed to create HTTP client: {}", e)))
}

/// Turn a provider result into a single in-memory buffer
pub async fn prepare_image_buffer(
    image: &ProviderImage,
    client: &Client,
) -> Result<Vec<u8>, PipelineError> {
    if let Some(encoded) = image.image_base64.as_deref().filter(|s| !s.is_empty()) {
        return decode_base64(encoded).map_err(PipelineError::Generation);
    }

    if let Some(url) = image.image_url.as_deref().filter(|s| !s.is_empty()) {
        debug!(url = %url, "Downloading generated image");
        let response = client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| PipelineError::Generation(format!("Image download failed: {}", e)))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| PipelineError::Generation(format!("Image download failed: {}", e)))?;
        return Ok(bytes.to_vec());
    }

    Err(PipelineError::Generation(
        "Provider returned neither image data nor an image URL".to_string(),
    ))
}

/// Detect image format from binary data using magic bytes
pub fn detect_image_format(data: &[u8]) -> Option<ImageFormat> {
    // PNG: 89 50 4E 47 0D 0A 1A 0A
    if data.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Some(ImageFormat::Png);
    }

    // JPEG: FF D8 FF
    if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some(ImageFormat::Jpeg);
    }

    None
}
