//! Common traits and types for image generation providers

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::PipelineError;
use crate::job::{ImageFormat, ProviderKind, RenderSettings};

/// Generation options resolved from the render settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageOptions {
    pub width: u32,
    pub height: u32,
    /// Requested quality, 0..=100
    pub quality: u8,
    pub format: ImageFormat,
}

impl ImageOptions {
    pub fn from_settings(settings: &RenderSettings) -> Self {
        let (width, height) = settings.resolution.dimensions();
        Self {
            width,
            height,
            quality: settings.quality_or_default(),
            format: settings.format,
        }
    }

    /// `WIDTHxHEIGHT`, the size string most image APIs accept
    pub fn size(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

/// Image returned by a provider, either inline or by reference
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderImage {
    /// Base64 encoded image data, optionally as a data URL
    pub image_base64: Option<String>,

    /// URL the image can be downloaded from
    pub image_url: Option<String>,

    /// Provider specific details (model, revised prompt, ...)
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Trait for image generation providers
#[async_trait]
pub trait ImageProvider: Send + Sync {
    /// Get the provider name
    fn name(&self) -> &str;

    /// Which supported provider this is
    fn kind(&self) -> ProviderKind;

    /// Generate a single image
    async fn generate_image(
        &self,
        prompt: &str,
        options: &ImageOptions,
    ) -> Result<ProviderImage, PipelineError>;
}
