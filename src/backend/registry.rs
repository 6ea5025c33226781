//! Provider registry - typed lookup by provider kind

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::backend::imagen::ImagenProvider;
use crate::backend::openai::OpenAiImageProvider;
use crate::backend::traits::ImageProvider;
use crate::config::{ProviderConfig, ProvidersConfig};
use crate::error::Result;
use crate::job::ProviderKind;

/// Call policy applied around a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff: Duration,
}

impl From<&ProviderConfig> for CallPolicy {
    fn from(config: &ProviderConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.timeout_ms),
            max_retries: config.max_retries,
            backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self::from(&ProviderConfig::default())
    }
}

#[derive(Clone)]
pub struct RegisteredProvider {
    pub provider: Arc<dyn ImageProvider>,
    pub policy: CallPolicy,
}

/// Providers available to the orchestrator
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, RegisteredProvider>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build HTTP providers for every enabled entry in the configuration
    pub fn initialize_from_config(config: &ProvidersConfig) -> Result<Self> {
        let mut registry = Self::new();

        if config.openai_gpt_image.enabled {
            let provider = OpenAiImageProvider::new(&config.openai_gpt_image)?;
            registry.register(Arc::new(provider), CallPolicy::from(&config.openai_gpt_image));
        }

        if config.google_imagen.enabled {
            let provider = ImagenProvider::new(&config.google_imagen)?;
            registry.register(Arc::new(provider), CallPolicy::from(&config.google_imagen));
        }

        info!(providers = ?registry.kinds(), "Provider registry initialized");
        Ok(registry)
    }

    pub fn register(&mut self, provider: Arc<dyn ImageProvider>, policy: CallPolicy) {
        self.providers
            .insert(provider.kind(), RegisteredProvider { provider, policy });
    }

    pub fn get(&self, kind: ProviderKind) -> Option<&RegisteredProvider> {
        self.providers.get(&kind)
    }

    pub fn kinds(&self) -> Vec<ProviderKind> {
        let mut kinds: Vec<_> = self.providers.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
