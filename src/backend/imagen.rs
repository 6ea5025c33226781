//! Google Imagen provider (`:predict` REST endpoint)

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crate::backend::traits::{ImageOptions, ImageProvider, ProviderImage};
use crate::config::ProviderConfig;
use crate::error::{AppError, PipelineError, Result};
use crate::job::{ImageFormat, ProviderKind};

const DEFAULT_MODEL: &str = "imagen-3.0-generate-002";

pub struct ImagenProvider {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
}

#[derive(Debug, Serialize)]
struct PredictRequest<'a> {
    instances: [PredictInstance<'a>; 1],
    parameters: PredictParameters,
}

#[derive(Debug, Serialize)]
struct PredictInstance<'a> {
    prompt: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PredictParameters {
    sample_count: u32,
    aspect_ratio: &'static str,
    sample_image_size: &'static str,
    output_options: OutputOptions,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OutputOptions {
    mime_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    compression_quality: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    #[serde(default)]
    predictions: Vec<Prediction>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Prediction {
    #[serde(default)]
    bytes_base64_encoded: Option<String>,
    #[serde(default)]
    mime_type: Option<String>,
}

impl ImagenProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        })
    }
}

#[async_trait]
impl ImageProvider for ImagenProvider {
    fn name(&self) -> &str {
        "google-imagen"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::GoogleImagen
    }

    async fn generate_image(
        &self,
        prompt: &str,
        options: &ImageOptions,
    ) -> std::result::Result<ProviderImage, PipelineError> {
        let url = format!("{}/v1/models/{}:predict", self.endpoint, self.model);
        let request = PredictRequest {
            instances: [PredictInstance { prompt }],
            parameters: PredictParameters {
                sample_count: 1,
                aspect_ratio: "1:1",
                sample_image_size: if options.width > 1024 { "2K" } else { "1K" },
                output_options: OutputOptions {
                    mime_type: options.format.content_type(),
                    compression_quality: match options.format {
                        ImageFormat::Jpeg => Some(options.quality),
                        ImageFormat::Png => None,
                    },
                },
            },
        };

        debug!(provider = %self.name(), url = %url, "Sending predict request");

        let mut builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.header("x-goog-api-key", key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| PipelineError::Generation(format!("Request to {} failed: {}", url, e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::Generation(format!(
                "Provider returned {}: {}",
                status, body
            )));
        }

        let predict: PredictResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Generation(format!("Failed to parse response: {}", e)))?;

        let prediction = predict
            .predictions
            .into_iter()
            .find(|p| p.bytes_base64_encoded.is_some())
            .ok_or_else(|| {
                PipelineError::Generation("Provider returned no images (possibly filtered)".to_string())
            })?;

        let mut metadata = HashMap::new();
        metadata.insert("model".to_string(), self.model.clone());
        if let Some(mime) = prediction.mime_type {
            metadata.insert("mime_type".to_string(), mime);
        }

        Ok(ProviderImage {
            image_base64: prediction.bytes_base64_encoded,
            image_url: None,
            metadata,
        })
    }
}
