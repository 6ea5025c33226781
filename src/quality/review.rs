//! Manual review queue for renders held by policy

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use tracing::info;

/// A render waiting for a human decision
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewItem {
    pub render_id: String,
    pub project_id: String,
    pub score: f64,
    pub perceptual_hash: String,
    pub reasons: Vec<String>,
    pub queued_at: DateTime<Utc>,
}

/// FIFO of renders awaiting review
#[derive(Default)]
pub struct ReviewQueue {
    items: Mutex<VecDeque<ReviewItem>>,
}

impl ReviewQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a render, replacing any earlier entry for the same render
    pub fn enqueue(&self, item: ReviewItem) {
        let mut items = self.items.lock();
        items.retain(|existing| existing.render_id != item.render_id);
        info!(
            render_id = %item.render_id,
            reasons = ?item.reasons,
            "Render queued for manual review"
        );
        items.push_back(item);
    }

    /// Remove a render from the queue once a reviewer decided on it
    pub fn take(&self, render_id: &str) -> Option<ReviewItem> {
        let mut items = self.items.lock();
        let index = items.iter().position(|item| item.render_id == render_id)?;
        items.remove(index)
    }

    pub fn pending(&self) -> Vec<ReviewItem> {
        self.items.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
