//! OpenAI-compatible image generation provider

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::backend::traits::{ImageOptions, ImageProvider, ProviderImage};
use crate::config::ProviderConfig;
use crate::error::{AppError, PipelineError, Result};
use crate::job::{ImageFormat, ProviderKind};

const DEFAULT_MODEL: &str = "gpt-image-1";

/// Provider calling `POST {endpoint}/v1/images/generations`
pub struct OpenAiImageProvider {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
}

#[derive(Debug, Serialize)]
struct ApiGenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    n: u32,
    size: String,
    quality: &'static str,
    output_format: &'static str,
}

#[derive(Debug, Deserialize)]
struct ApiGenerateResponse {
    #[serde(default)]
    data: Vec<ApiImageData>,
}

#[derive(Debug, Deserialize)]
struct ApiImageData {
    #[serde(default)]
    b64_json: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    revised_prompt: Option<String>,
}

impl OpenAiImageProvider {
    /// Create a new provider from configuration
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

/// Map the 0..=100 quality setting onto the API's quality levels
fn quality_level(quality: u8) -> &'static str {
    match quality {
        0..=33 => "low",
        34..=75 => "medium",
        _ => "high",
    }
}

#[async_trait]
impl ImageProvider for OpenAiImageProvider {
    fn name(&self) -> &str {
        "openai-gpt-image"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAiGptImage
    }

    async fn generate_image(
        &self,
        prompt: &str,
        options: &ImageOptions,
    ) -> std::result::Result<ProviderImage, PipelineError> {
        let url = format!("{}/v1/images/generations", self.endpoint);
        let request = ApiGenerateRequest {
            model: &self.model,
            prompt,
            n: 1,
            size: options.size(),
            quality: quality_level(options.quality),
            output_format: match options.format {
                ImageFormat::Png => "png",
                ImageFormat::Jpeg => "jpeg",
            },
        };

        debug!(provider = %self.name(), url = %url, "Sending generate request");

        let mut builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
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

        let api_response: ApiGenerateResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Generation(format!("Failed to parse response: {}", e)))?;

        let image = api_response
            .data
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::Generation("Provider returned no images".to_string()))?;

        let mut metadata = std::collections::HashMap::new();
        metadata.insert("model".to_string(), self.model.clone());
        if let Some(revised) = image.revised_prompt {
            metadata.insert("revised_prompt".to_string(), revised);
        }

        Ok(ProviderImage {
            image_base64: image.b64_json,
            image_url: image.url,
            metadata,
        })
    }
}
