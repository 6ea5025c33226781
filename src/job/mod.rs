//! Render job data model - submission payload, settings and results

pub mod events;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Subscription level of the submitting organization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    Starter,
    Pro,
    Growth,
}

impl SubscriptionTier {
    pub const ALL: [SubscriptionTier; 3] = [
        SubscriptionTier::Starter,
        SubscriptionTier::Pro,
        SubscriptionTier::Growth,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionTier::Starter => "starter",
            SubscriptionTier::Pro => "pro",
            SubscriptionTier::Growth => "growth",
        }
    }
}

/// Supported image generation providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderKind {
    #[serde(rename = "google-imagen")]
    GoogleImagen,
    #[serde(rename = "openai-gpt-image")]
    OpenAiGptImage,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::GoogleImagen => "google-imagen",
            ProviderKind::OpenAiGptImage => "openai-gpt-image",
        }
    }
}

/// Requested output resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "1024x1024")]
    Square1024,
    #[serde(rename = "2048x2048")]
    Square2048,
    #[serde(rename = "4096x4096")]
    Square4096,
}

impl Resolution {
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            Resolution::Square1024 => (1024, 1024),
            Resolution::Square2048 => (2048, 2048),
            Resolution::Square4096 => (4096, 4096),
        }
    }

    pub fn pixel_count(&self) -> u64 {
        let (width, height) = self.dimensions();
        width as u64 * height as u64
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Square1024 => "1024x1024",
            Resolution::Square2048 => "2048x2048",
            Resolution::Square4096 => "4096x4096",
        }
    }
}

/// Output image encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ImageFormat {
    Png,
    Jpeg,
}

impl ImageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Png => "PNG",
            ImageFormat::Jpeg => "JPEG",
        }
    }
}

/// Generation settings fixed at submission time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderSettings {
    pub provider: ProviderKind,
    pub resolution: Resolution,
    pub format: ImageFormat,
    /// Requested quality, 0..=100
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<u8>,
}

impl RenderSettings {
    pub fn quality_or_default(&self) -> u8 {
        self.quality.unwrap_or(50)
    }
}

/// Kind of canvas annotation attached to a render request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AnnotationKind {
    Mask,
    AssetInstance,
    TextLabel,
}

/// Canvas annotation with free-form data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    #[serde(rename = "type")]
    pub kind: AnnotationKind,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Base prompt supplied by the editor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptParts {
    pub system: String,
    pub user: String,
}

/// Job payload submitted to the scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderJobData {
    pub render_id: String,
    pub project_id: String,
    pub scene_id: String,
    pub user_id: String,
    pub organization_id: String,
    pub subscription_tier: SubscriptionTier,
    pub prompt: PromptParts,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
    pub settings: RenderSettings,
    /// Hold the render for manual review even when it passes automated checks
    #[serde(default)]
    pub force_manual_review: bool,
}

impl RenderJobData {
    /// Reject payloads that can never be rendered
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("renderId", &self.render_id),
            ("projectId", &self.project_id),
            ("sceneId", &self.scene_id),
            ("userId", &self.user_id),
            ("organizationId", &self.organization_id),
        ] {
            if value.trim().is_empty() {
                return Err(AppError::InvalidRequest(format!("{field} must not be empty")));
            }
        }

        if let Some(quality) = self.settings.quality {
            if quality > 100 {
                return Err(AppError::InvalidRequest(format!(
                    "quality must be between 0 and 100, got {quality}"
                )));
            }
        }

        if self.prompt.user.trim().is_empty() {
            return Err(AppError::InvalidRequest("prompt.user must not be empty".to_string()));
        }

        Ok(())
    }
}

/// Lifecycle state of a render job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

/// Review state recorded for a completed render
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityStatus {
    AutoApproved,
    PendingReview,
}

/// Image facts recorded with a completed render
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderMetadata {
    pub width: u32,
    pub height: u32,
    pub format: String,
    pub file_size: u64,
}

/// Result of a completed render
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderJobResult {
    pub render_id: String,
    pub image_url: String,
    pub thumbnail_url: String,
    /// Wall-clock processing time in milliseconds
    pub processing_time: u64,
    pub prompt_hash: String,
    pub metadata: RenderMetadata,
}
