//! Failure monitor - periodic health checks and failure pattern detection

pub mod alert;

pub use alert::{Alert, AlertSeverity, AlertSink, LogAlertSink, WebhookAlertSink};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::error::ErrorKind;
use crate::job::ProviderKind;

/// Consecutive failures of one user that raise a warning
const USER_STREAK_THRESHOLD: usize = 3;

/// A pipeline failure as seen by the monitor
#[derive(Debug, Clone, PartialEq)]
pub struct FailureRecord {
    pub render_id: String,
    pub user_id: String,
    pub provider: ProviderKind,
    pub kind: ErrorKind,
    pub message: String,
    /// No further attempt will be made
    pub is_final: bool,
}

#[derive(Debug, Clone)]
struct Outcome {
    at: Instant,
    user_id: String,
    provider: ProviderKind,
    failure: Option<ErrorKind>,
    is_final: bool,
}

/// Result of a health check
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub healthy: bool,
    pub failure_rate: f64,
    pub recent_total: usize,
    pub recent_failures: usize,
    pub active_alerts: usize,
    pub checked_at: DateTime<Utc>,
}

struct MonitorState {
    outcomes: VecDeque<Outcome>,
    /// Alert key to the time it was raised
    active_alerts: HashMap<String, Instant>,
}

struct MonitorInner {
    config: MonitorConfig,
    sinks: Vec<Arc<dyn AlertSink>>,
    state: Mutex<MonitorState>,
    pattern_checks: AtomicU64,
    /// Alert deliveries still in flight
    dispatches: Mutex<Vec<JoinHandle<()>>>,
}

/// Tracks recent outcomes and raises alerts through the configured sinks
pub struct FailureMonitor {
    inner: Arc<MonitorInner>,
    check_task: RwLock<Option<JoinHandle<()>>>,
}

impl FailureMonitor {
    pub fn new(config: MonitorConfig, sinks: Vec<Arc<dyn AlertSink>>) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                config,
                sinks,
                state: Mutex::new(MonitorState {
                    outcomes: VecDeque::new(),
                    active_alerts: HashMap::new(),
                }),
                pattern_checks: AtomicU64::new(0),
                dispatches: Mutex::new(Vec::new()),
            }),
            check_task: RwLock::new(None),
        }
    }

    /// Build the sinks named by the configuration
    pub fn from_config(config: MonitorConfig) -> crate::error::Result<Self> {
        let mut sinks: Vec<Arc<dyn AlertSink>> = vec![Arc::new(LogAlertSink)];
        if let Some(url) = config.webhook_url.as_deref().filter(|u| !u.is_empty()) {
            sinks.push(Arc::new(WebhookAlertSink::new(url)?));
        }
        Ok(Self::new(config, sinks))
    }

    pub fn record_success(&self, user_id: &str, provider: ProviderKind) {
        self.inner.push(Outcome {
            at: Instant::now(),
            user_id: user_id.to_string(),
            provider,
            failure: None,
            is_final: true,
        });
    }

    pub fn record_failure(&self, failure: &FailureRecord) {
        debug!(render_id = %failure.render_id, kind = failure.kind.as_str(), "Recorded failure");
        self.inner.push(Outcome {
            at: Instant::now(),
            user_id: failure.user_id.clone(),
            provider: failure.provider,
            failure: Some(failure.kind),
            is_final: failure.is_final,
        });
    }

    /// Look for repeated failures in the window and alert on new patterns
    pub async fn check_for_failure_patterns(&self) -> Vec<Alert> {
        self.inner.check_for_failure_patterns().await
    }

    /// Number of pattern checks performed since start-up
    pub fn pattern_checks(&self) -> u64 {
        self.inner.pattern_checks.load(Ordering::Relaxed)
    }

    pub async fn health_check(&self) -> HealthReport {
        self.inner.health_check().await
    }

    /// Health computed without raising alerts
    pub fn health(&self) -> HealthReport {
        self.inner.report()
    }

    pub fn active_alerts(&self) -> usize {
        self.inner.report().active_alerts
    }

    /// Start the periodic health check
    pub async fn start(&self) {
        let inner = self.inner.clone();
        let interval_secs = inner.config.interval_secs.max(1);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let report = inner.health_check().await;
                debug!(
                    healthy = report.healthy,
                    failure_rate = report.failure_rate,
                    active_alerts = report.active_alerts,
                    "Health check completed"
                );
            }
        });

        *self.check_task.write().await = Some(handle);
        info!(interval_secs, "Started failure monitor");
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.check_task.write().await.take() {
            handle.abort();
            info!("Stopped failure monitor");
        }
        self.flush_alerts().await;
    }

    /// Wait for alerts already raised to reach every sink
    pub async fn flush_alerts(&self) {
        let pending: Vec<_> = self.inner.dispatches.lock().drain(..).collect();
        for result in join_all(pending).await {
            if let Err(e) = result {
                warn!(error = %e, "Alert dispatch task ended abnormally");
            }
        }
    }
}

impl MonitorInner {
    fn window(&self) -> Duration {
        Duration::from_secs(self.config.window_secs)
    }

    fn cooldown(&self) -> Duration {
        Duration::from_secs(self.config.alert_cooldown_secs)
    }

    fn push(&self, outcome: Outcome) {
        let mut state = self.state.lock();
        state.outcomes.push_back(outcome);
        Self::prune(&mut state, Instant::now(), self.window(), self.cooldown());
    }

    fn prune(state: &mut MonitorState, now: Instant, window: Duration, cooldown: Duration) {
        while state
            .outcomes
            .front()
            .is_some_and(|o| now.saturating_duration_since(o.at) > window)
        {
            state.outcomes.pop_front();
        }
        state
            .active_alerts
            .retain(|_, raised| now.saturating_duration_since(*raised) < cooldown);
    }

    fn report(&self) -> HealthReport {
        let mut state = self.state.lock();
        Self::prune(&mut state, Instant::now(), self.window(), self.cooldown());

        let recent_total = state.outcomes.len();
        let recent_failures = state.outcomes.iter().filter(|o| o.failure.is_some()).count();
        let failure_rate = if recent_total == 0 {
            0.0
        } else {
            recent_failures as f64 / recent_total as f64
        };
        let active_alerts = state.active_alerts.len();

        let rate_unhealthy =
            recent_total >= self.config.min_samples && failure_rate > self.config.failure_rate_threshold;
        let alerts_unhealthy = active_alerts >= self.config.max_active_alerts;

        HealthReport {
            healthy: !(rate_unhealthy || alerts_unhealthy),
            failure_rate,
            recent_total,
            recent_failures,
            active_alerts,
            checked_at: Utc::now(),
        }
    }

    async fn health_check(&self) -> HealthReport {
        let report = self.report();
        if !report.healthy {
            let alert = Alert::new(
                AlertSeverity::Critical,
                "health_check_failed",
                format!(
                    "Render pipeline unhealthy: {:.0}% of {} recent renders failed",
                    report.failure_rate * 100.0,
                    report.recent_total
                ),
            )
            .with_details(json!({
                "failureRate": report.failure_rate,
                "recentFailures": report.recent_failures,
                "activeAlerts": report.active_alerts,
            }));
            self.raise("health".to_string(), alert).await;
        }
        report
    }

    async fn check_for_failure_patterns(&self) -> Vec<Alert> {
        self.pattern_checks.fetch_add(1, Ordering::Relaxed);
        let candidates = self.detect_patterns();

        let mut raised = Vec::new();
        for (key, alert) in candidates {
            if self.raise(key, alert.clone()).await {
                raised.push(alert);
            }
        }
        raised
    }

    fn detect_patterns(&self) -> Vec<(String, Alert)> {
        let mut state = self.state.lock();
        Self::prune(&mut state, Instant::now(), self.window(), self.cooldown());

        let threshold = self.config.pattern_threshold.max(1);
        let window_secs = self.config.window_secs;
        let mut by_kind: HashMap<ErrorKind, usize> = HashMap::new();
        let mut by_provider: HashMap<ProviderKind, usize> = HashMap::new();

        for outcome in &state.outcomes {
            if let Some(kind) = outcome.failure {
                *by_kind.entry(kind).or_default() += 1;
                if kind == ErrorKind::Generation {
                    *by_provider.entry(outcome.provider).or_default() += 1;
                }
            }
        }

        let mut alerts = Vec::new();

        for (kind, count) in by_kind {
            if count >= threshold {
                alerts.push((
                    format!("kind:{}", kind.as_str()),
                    Alert::new(
                        AlertSeverity::High,
                        "repeated_failure",
                        format!("{} {} failures in the last {}s", count, kind.as_str(), window_secs),
                    )
                    .with_details(json!({"kind": kind.as_str(), "count": count})),
                ));
            }
        }

        for (provider, count) in by_provider {
            if count >= threshold {
                alerts.push((
                    format!("provider:{}", provider.as_str()),
                    Alert::new(
                        AlertSeverity::Critical,
                        "provider_degraded",
                        format!("Provider {} failed {} times in the last {}s", provider.as_str(), count, window_secs),
                    )
                    .with_details(json!({"provider": provider.as_str(), "count": count})),
                ));
            }
        }

        // Users whose latest renders all failed; retried attempts are not renders
        let mut streaks: HashMap<&str, (usize, bool)> = HashMap::new();
        for outcome in state.outcomes.iter().rev().filter(|o| o.is_final) {
            let (streak, broken) = streaks.entry(outcome.user_id.as_str()).or_insert((0, false));
            if *broken {
                continue;
            }
            if outcome.failure.is_some() {
                *streak += 1;
            } else {
                *broken = true;
            }
        }
        for (user_id, (streak, _)) in streaks {
            if streak >= USER_STREAK_THRESHOLD {
                alerts.push((
                    format!("user:{}", user_id),
                    Alert::new(
                        AlertSeverity::Warning,
                        "user_failure_streak",
                        format!("User {} had {} consecutive failed renders", user_id, streak),
                    )
                    .with_details(json!({"userId": user_id, "streak": streak})),
                ));
            }
        }

        alerts
    }

    /// Dispatch an alert unless one with the same key is still cooling down
    async fn raise(&self, key: String, alert: Alert) -> bool {
        {
            let mut state = self.state.lock();
            if state.active_alerts.contains_key(&key) {
                return false;
            }
            state.active_alerts.insert(key.clone(), Instant::now());
        }

        counter!("render_alerts_total", "severity" => alert.severity.as_str()).increment(1);

        // Sinks may retry for seconds; delivery runs off the caller's path.
        let sinks = self.sinks.clone();
        let handle = tokio::spawn(async move {
            for sink in &sinks {
                if let Err(e) = sink.send(&alert).await {
                    warn!(sink = sink.name(), key = %key, error = %e, "Failed to dispatch alert");
                }
            }
        });

        let mut dispatches = self.dispatches.lock();
        dispatches.retain(|handle| !handle.is_finished());
        dispatches.push(handle);
        true
    }
}
