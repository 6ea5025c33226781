//! Object storage contract and the local filesystem implementation

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::error::{AppError, Result};

/// Object storage used for published renders
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store an object and return its public URL
    async fn put(&self, bucket: &str, key: &str, bytes: &[u8], content_type: &str)
        -> Result<String>;

    /// Read an object back
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;

    /// Public URL of an object, derived from bucket and key only
    fn public_url(&self, bucket: &str, key: &str) -> String;
}

/// Stores objects as files under `{root}/{bucket}/{key}`
pub struct LocalObjectStore {
    root: PathBuf,
    public_base_url: String,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Resolve an object path, refusing keys that escape the bucket
    pub fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        let relative = Path::new(bucket).join(key);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(AppError::InvalidRequest(format!(
                "Invalid object key: {}/{}",
                bucket, key
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<String> {
        let path = self.object_path(bucket, key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        fs::write(&path, bytes).await?;
        debug!(path = ?path, size = bytes.len(), content_type = %content_type, "Stored object");

        Ok(self.public_url(bucket, key))
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let path = self.object_path(bucket, key)?;
        Ok(fs::read(&path).await?)
    }

    fn public_url(&self, bucket: &str, key: &str) -> String {
        format!("{}/{}/{}", self.public_base_url, bucket, key)
    }
}
