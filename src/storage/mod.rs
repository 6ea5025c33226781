//! Storage publisher - persists the final image and its thumbnail

pub mod buffer;
pub mod object_store;

pub use buffer::{
    decode_base64, detect_image_format, download_client, encode_base64, prepare_image_buffer,
};
pub use object_store::{LocalObjectStore, ObjectStore};

use image::{DynamicImage, GenericImageView};
use std::io::Cursor;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::StorageConfig;
use crate::error::PipelineError;
use crate::job::{ImageFormat, RenderSettings};

/// Where a published render ended up
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRender {
    pub image_key: String,
    pub image_url: String,
    pub thumbnail_key: String,
    pub thumbnail_url: String,
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    pub file_size: u64,
}

/// Writes renders to object storage under deterministic keys
pub struct StoragePublisher {
    store: Arc<dyn ObjectStore>,
    config: StorageConfig,
}

impl StoragePublisher {
    pub fn new(store: Arc<dyn ObjectStore>, config: StorageConfig) -> Self {
        Self { store, config }
    }

    /// `{key_prefix}/{projectId}/{renderId}.{ext}`
    pub fn image_key(&self, project_id: &str, render_id: &str, format: ImageFormat) -> String {
        format!(
            "{}/{}/{}.{}",
            self.config.key_prefix,
            project_id,
            render_id,
            format.extension()
        )
    }

    /// `{thumbnail_prefix}/{projectId}/{renderId}.jpg`
    pub fn thumbnail_key(&self, project_id: &str, render_id: &str) -> String {
        format!(
            "{}/{}/{}.{}",
            self.config.thumbnail_prefix,
            project_id,
            render_id,
            ImageFormat::Jpeg.extension()
        )
    }

    pub async fn store_render_result(
        &self,
        render_id: &str,
        project_id: &str,
        image: &[u8],
        settings: &RenderSettings,
        prompt_hash: &str,
    ) -> Result<StoredRender, PipelineError> {
        let format = settings.format;
        let thumbnail_size = self.config.thumbnail_size;
        let source = image.to_vec();
        let id = render_id.to_string();
        let renditions =
            tokio::task::spawn_blocking(move || render_renditions(&id, source, format, thumbnail_size))
                .await
                .map_err(|e| PipelineError::Storage(format!("Image processing task failed: {}", e)))??;
        let Renditions {
            body,
            thumbnail,
            width,
            height,
        } = renditions;

        let image_key = self.image_key(project_id, render_id, format);
        let image_url = self
            .store
            .put(&self.config.bucket, &image_key, &body, format.content_type())
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;

        let thumbnail_key = self.thumbnail_key(project_id, render_id);
        let thumbnail_url = self
            .store
            .put(
                &self.config.bucket,
                &thumbnail_key,
                &thumbnail,
                ImageFormat::Jpeg.content_type(),
            )
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;

        info!(
            render_id = %render_id,
            key = %image_key,
            prompt_hash = %prompt_hash,
            size = body.len(),
            "Render published"
        );

        Ok(StoredRender {
            image_key,
            image_url,
            thumbnail_key,
            thumbnail_url,
            width,
            height,
            format,
            file_size: body.len() as u64,
        })
    }
}

/// Encoded image and thumbnail ready for upload
struct Renditions {
    body: Vec<u8>,
    thumbnail: Vec<u8>,
    width: u32,
    height: u32,
}

/// Decode, transcode when needed, and build the JPEG thumbnail. Blocking.
fn render_renditions(
    render_id: &str,
    image: Vec<u8>,
    format: ImageFormat,
    thumbnail_size: u32,
) -> Result<Renditions, PipelineError> {
    let decoded = image::load_from_memory(&image)
        .map_err(|e| PipelineError::Storage(format!("Image could not be decoded: {}", e)))?;
    let (width, height) = decoded.dimensions();

    let body = if detect_image_format(&image) == Some(format) {
        image
    } else {
        debug!(render_id = %render_id, target = format.as_str(), "Transcoding render");
        encode(&decoded, format)?
    };

    let thumbnail = encode(&decoded.thumbnail(thumbnail_size, thumbnail_size), ImageFormat::Jpeg)?;

    Ok(Renditions {
        body,
        thumbnail,
        width,
        height,
    })
}

/// Encode an image, flattening alpha for JPEG
fn encode(image: &DynamicImage, format: ImageFormat) -> Result<Vec<u8>, PipelineError> {
    let mut buffer = Cursor::new(Vec::new());
    let result = match format {
        ImageFormat::Png => image.write_to(&mut buffer, image::ImageFormat::Png),
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(image.to_rgb8())
            .write_to(&mut buffer, image::ImageFormat::Jpeg),
    };
    result.map_err(|e| PipelineError::Storage(format!("Image encoding failed: {}", e)))?;
    Ok(buffer.into_inner())
}
