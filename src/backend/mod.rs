//! Provider module - traits, HTTP providers, registry and prompt building

pub mod imagen;
pub mod openai;
pub mod prompt;
pub mod registry;
pub mod traits;

pub use registry::{CallPolicy, ProviderRegistry, RegisteredProvider};
pub use traits::{ImageOptions, ImageProvider, ProviderImage};

use rand::Rng;
use std::time::Duration;
use tracing::warn;

use crate::error::PipelineError;

/// Invoke a provider with a per-call timeout and bounded retries.
///
/// `max_retries` counts total attempts. The delay doubles after each failure
/// with up to 25% random jitter.
pub async fn invoke_with_retry(
    entry: &RegisteredProvider,
    prompt: &str,
    options: &ImageOptions,
) -> Result<ProviderImage, PipelineError> {
    let attempts = entry.policy.max_retries.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        let call = entry.provider.generate_image(prompt, options);
        let error = match tokio::time::timeout(entry.policy.timeout, call).await {
            Ok(Ok(image)) => return Ok(image),
            Ok(Err(e)) => e,
            Err(_) => PipelineError::Generation(format!(
                "{} timed out after {}ms",
                entry.provider.name(),
                entry.policy.timeout.as_millis()
            )),
        };

        warn!(
            provider = %entry.provider.name(),
            attempt,
            error = %error,
            "Provider call failed"
        );
        last_error = Some(error);

        if attempt < attempts {
            tokio::time::sleep(backoff_delay(entry.policy.backoff, attempt)).await;
        }
    }

    Err(last_error.unwrap_or_else(|| PipelineError::Generation("Provider was not called".to_string())))
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << (attempt - 1).min(16));
    let jitter_cap = exp.as_millis() as u64 / 4;
    let jitter = if jitter_cap > 0 {
        rand::thread_rng().gen_range(0..=jitter_cap)
    } else {
        0
    };
    exp + Duration::from_millis(jitter)
}
