//! Provider-specific prompt construction

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::job::{Annotation, AnnotationKind, ProviderKind, PromptParts};

/// Longest prompt the providers accept
const MAX_PROMPT_CHARS: usize = 4000;

/// Build the prompt sent to a provider from the editor prompt and canvas annotations
pub fn build_prompt(provider: ProviderKind, prompt: &PromptParts, annotations: &[Annotation]) -> String {
    let details: Vec<String> = annotations.iter().filter_map(describe_annotation).collect();

    let text = match provider {
        ProviderKind::OpenAiGptImage => {
            let mut text = format!("{}\n\n{}", prompt.system.trim(), prompt.user.trim());
            if !details.is_empty() {
                text.push_str("\n\nScene details:\n");
                for detail in &details {
                    text.push_str("- ");
                    text.push_str(detail);
                    text.push('\n');
                }
            }
            text
        }
        // Imagen takes a single descriptive sentence list
        ProviderKind::GoogleImagen => {
            let mut parts = vec![prompt.user.trim().to_string()];
            parts.extend(details);
            parts.push(prompt.system.trim().to_string());
            parts
                .into_iter()
                .filter(|p| !p.is_empty())
                .collect::<Vec<_>>()
                .join(". ")
        }
    };

    truncate_chars(text.trim(), MAX_PROMPT_CHARS)
}

fn describe_annotation(annotation: &Annotation) -> Option<String> {
    let text = |keys: &[&str]| {
        keys.iter()
            .find_map(|k| annotation.data.get(*k).and_then(Value::as_str))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    match annotation.kind {
        AnnotationKind::Mask => Some(match text(&["description", "label"]) {
            Some(description) => format!("Redesign the masked area as {}", description),
            None => "Redesign the masked area".to_string(),
        }),
        AnnotationKind::AssetInstance => {
            text(&["name", "assetName"]).map(|name| format!("Include {}", name))
        }
        AnnotationKind::TextLabel => text(&["text", "label"]).map(|label| format!("Area labelled \"{}\"", label)),
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((index, _)) => text[..index].to_string(),
        None => text.to_string(),
    }
}

/// SHA-256 hex digest of the final prompt
pub fn prompt_hash(prompt: &str) -> String {
    hex::encode(Sha256::digest(prompt.as_bytes()))
}
