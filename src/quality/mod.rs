//! Quality gate - scoring, near-duplicate detection and the review decision

pub mod analyzer;
pub mod phash;
pub mod review;

pub use analyzer::{ImageAnalysis, ImageAnalyzer, PixelAnalyzer};
pub use phash::PerceptualHash;
pub use review::{ReviewItem, ReviewQueue};

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::QualityConfig;
use crate::error::PipelineError;
use crate::job::{QualityStatus, RenderSettings};

/// Thresholds an image must meet
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityRequirements {
    pub min_width: u32,
    pub min_height: u32,
    pub min_score: f64,
}

impl QualityRequirements {
    /// Half the requested resolution in each dimension
    pub fn for_settings(settings: &RenderSettings, min_score: f64) -> Self {
        let (width, height) = settings.resolution.dimensions();
        Self {
            min_width: width / 2,
            min_height: height / 2,
            min_score,
        }
    }
}

/// Outcome of scoring a single image
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityResult {
    pub score: f64,
    pub issues: Vec<String>,
    pub perceptual_hash: String,
    pub width: u32,
    pub height: u32,
    pub passed: bool,
}

/// Why the gate refused a render
#[derive(Debug, Clone, PartialEq)]
pub enum QualityRejection {
    Duplicate {
        matched_render_id: String,
        /// Percentage, 0..=100
        similarity: f64,
    },
    BelowThreshold {
        result: Option<QualityResult>,
        issues: Vec<String>,
    },
}

impl From<QualityRejection> for PipelineError {
    fn from(rejection: QualityRejection) -> Self {
        match rejection {
            QualityRejection::Duplicate {
                matched_render_id,
                similarity,
            } => PipelineError::Duplicate {
                matched_render_id,
                similarity,
            },
            QualityRejection::BelowThreshold { issues, .. } => PipelineError::Quality { issues },
        }
    }
}

/// Decision returned to the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub enum QualityOutcome {
    Accepted {
        result: QualityResult,
        status: QualityStatus,
    },
    Rejected(QualityRejection),
}

/// Inputs for a full gate decision
#[derive(Debug, Clone, Copy)]
pub struct QualityCheck<'a> {
    pub render_id: &'a str,
    pub project_id: &'a str,
    pub image: &'a [u8],
    pub settings: &'a RenderSettings,
    pub attempts_made: u32,
    pub force_manual_review: bool,
}

#[derive(Debug, Clone)]
struct ApprovedRender {
    render_id: String,
    project_id: String,
    hash: PerceptualHash,
}

/// Bounded history of approved renders used for duplicate detection
pub struct ApprovedRenderIndex {
    capacity: usize,
    renders: RwLock<VecDeque<ApprovedRender>>,
}

impl ApprovedRenderIndex {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            renders: RwLock::new(VecDeque::new()),
        }
    }

    pub fn insert(&self, render_id: &str, project_id: &str, hash: PerceptualHash) {
        let mut renders = self.renders.write();
        renders.retain(|r| r.render_id != render_id);
        if renders.len() >= self.capacity {
            renders.pop_front();
        }
        renders.push_back(ApprovedRender {
            render_id: render_id.to_string(),
            project_id: project_id.to_string(),
            hash,
        });
    }

    /// Most similar approved render in the project at or above `threshold`
    pub fn find_similar(
        &self,
        render_id: &str,
        project_id: &str,
        hash: PerceptualHash,
        threshold: f64,
    ) -> Option<(String, f64)> {
        self.renders
            .read()
            .iter()
            .filter(|r| r.project_id == project_id && r.render_id != render_id)
            .map(|r| (r, r.hash.similarity(&hash)))
            .filter(|(_, similarity)| *similarity >= threshold)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(r, similarity)| (r.render_id.clone(), similarity))
    }

    pub fn len(&self) -> usize {
        self.renders.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Automated quality gate in front of storage
pub struct QualityGate {
    analyzer: Arc<dyn ImageAnalyzer>,
    approved: ApprovedRenderIndex,
    review_queue: Arc<ReviewQueue>,
    config: QualityConfig,
}

impl QualityGate {
    pub fn new(
        analyzer: Arc<dyn ImageAnalyzer>,
        review_queue: Arc<ReviewQueue>,
        config: QualityConfig,
    ) -> Self {
        Self {
            analyzer,
            approved: ApprovedRenderIndex::new(config.duplicate_window),
            review_queue,
            config,
        }
    }

    pub fn review_queue(&self) -> &Arc<ReviewQueue> {
        &self.review_queue
    }

    /// Score an image against the requirements
    pub fn check_quality(
        &self,
        image: &[u8],
        requirements: &QualityRequirements,
    ) -> Result<QualityResult, String> {
        let analysis = self.analyzer.analyze(image)?;

        let mut issues = Vec::new();
        let resolution_ok =
            analysis.width >= requirements.min_width && analysis.height >= requirements.min_height;
        if !resolution_ok {
            issues.push(format!(
                "Resolution {}x{} is below the minimum {}x{}",
                analysis.width, analysis.height, requirements.min_width, requirements.min_height
            ));
        }
        issues.extend(analysis.issues);

        let score_ok = analysis.score >= requirements.min_score;
        if !score_ok {
            issues.push(format!(
                "Quality score {:.2} is below the minimum {:.2}",
                analysis.score, requirements.min_score
            ));
        }

        Ok(QualityResult {
            score: analysis.score,
            issues,
            perceptual_hash: analysis.perceptual_hash.to_hex(),
            width: analysis.width,
            height: analysis.height,
            passed: resolution_ok && score_ok,
        })
    }

    /// Run the full gate: score, duplicate check, then the review decision
    pub fn perform_quality_check(&self, check: QualityCheck<'_>) -> QualityOutcome {
        let requirements = QualityRequirements::for_settings(check.settings, self.config.min_score);

        let result = match self.check_quality(check.image, &requirements) {
            Ok(result) => result,
            Err(issue) => {
                return QualityOutcome::Rejected(QualityRejection::BelowThreshold {
                    result: None,
                    issues: vec![issue],
                });
            }
        };

        if let Some(hash) = PerceptualHash::from_hex(&result.perceptual_hash) {
            if let Some((matched_render_id, similarity)) = self.approved.find_similar(
                check.render_id,
                check.project_id,
                hash,
                self.config.similarity_threshold,
            ) {
                info!(
                    render_id = %check.render_id,
                    matched_render_id = %matched_render_id,
                    similarity,
                    "Duplicate render detected"
                );
                return QualityOutcome::Rejected(QualityRejection::Duplicate {
                    matched_render_id,
                    similarity: similarity * 100.0,
                });
            }
        }

        let reasons = self.review_reasons(&check, &result);
        if !reasons.is_empty() {
            self.review_queue.enqueue(ReviewItem {
                render_id: check.render_id.to_string(),
                project_id: check.project_id.to_string(),
                score: result.score,
                perceptual_hash: result.perceptual_hash.clone(),
                reasons,
                queued_at: Utc::now(),
            });
        }

        if !result.passed {
            return QualityOutcome::Rejected(QualityRejection::BelowThreshold {
                issues: result.issues.clone(),
                result: Some(result),
            });
        }

        let status = if self.review_queue_holds(check.render_id) {
            QualityStatus::PendingReview
        } else {
            QualityStatus::AutoApproved
        };

        debug!(render_id = %check.render_id, score = result.score, status = ?status, "Quality gate passed");
        QualityOutcome::Accepted { result, status }
    }

    /// Whether policy requires a human to look at this render
    pub fn requires_manual_review(&self, check: &QualityCheck<'_>, result: &QualityResult) -> bool {
        !self.review_reasons(check, result).is_empty()
    }

    fn review_reasons(&self, check: &QualityCheck<'_>, result: &QualityResult) -> Vec<String> {
        let mut reasons = Vec::new();
        if !result.passed {
            reasons.push("Automated quality check failed".to_string());
        }
        if check.force_manual_review || self.config.force_manual_review {
            reasons.push("Manual review requested".to_string());
        }
        if check.attempts_made > 1 {
            reasons.push(format!("Render needed {} attempts", check.attempts_made));
        }
        if let Some(threshold) = self.config.high_quality_review_threshold {
            let quality = check.settings.quality_or_default();
            if quality > threshold {
                reasons.push(format!("Requested quality {quality} exceeds {threshold}"));
            }
        }
        reasons
    }

    fn review_queue_holds(&self, render_id: &str) -> bool {
        self.review_queue
            .pending()
            .iter()
            .any(|item| item.render_id == render_id)
    }

    /// Remember an approved render for future duplicate checks
    pub fn register_approved(&self, render_id: &str, project_id: &str, perceptual_hash: &str) {
        if let Some(hash) = PerceptualHash::from_hex(perceptual_hash) {
            self.approved.insert(render_id, project_id, hash);
        }
    }

    /// Reviewer approved a held render
    pub fn approve_review(&self, render_id: &str) -> Option<ReviewItem> {
        let item = self.review_queue.take(render_id)?;
        self.register_approved(&item.render_id, &item.project_id, &item.perceptual_hash);
        Some(item)
    }

    /// Reviewer rejected a held render
    pub fn reject_review(&self, render_id: &str) -> Option<ReviewItem> {
        self.review_queue.take(render_id)
    }

    pub fn approved_count(&self) -> usize {
        self.approved.len()
    }
}
