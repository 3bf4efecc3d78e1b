//! Performance monitor and device-resource advisors.
//!
//! The monitor samples memory and storage on a fixed cadence, classifies
//! battery impact on mobile hosts, and raises a [`PerformanceWarning`] when a
//! metric crosses its threshold. Readings reach the state tree only through
//! dispatched system actions.

use crate::config::PerformanceConfig;
use crate::platform::Platform;
use crate::store::Dispatcher;
use crate::system::{SystemAction, AI_RESPONSE_WARNING_MS, MEMORY_WARNING_RATIO};
use crate::types::{
    AiMode, BatteryImpact, PerformanceMetrics, PerformanceMetricsPatch, StorageEstimate,
};
use crate::user::PreferencesPatch;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Memory assumed in use when the platform cannot report it
pub const BASELINE_MEMORY_MB: f64 = 50.0;
/// Assumed growth of the estimate per elapsed minute
pub const ESTIMATED_GROWTH_MB_PER_MINUTE: f64 = 1.0;
/// One frame at 60fps
pub const FRAME_BUDGET_MS: f64 = 1000.0 / 60.0;
pub const TRANSCRIPTION_LATENCY_WARNING_MS: f64 = 2000.0;
/// Memory ceiling recommended on mobile hosts
pub const MOBILE_MEMORY_LIMIT_MB: f64 = 100.0;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
const WARNING_CHANNEL_CAPACITY: usize = 16;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct PerformanceThresholds {
    pub memory_limit_mb: f64,
    /// Share of `memory_limit_mb` that counts as high usage
    pub memory_warning_ratio: f64,
    pub ai_response_warning_ms: f64,
    pub transcription_latency_warning_ms: f64,
    pub render_budget_ms: f64,
}

impl Default for PerformanceThresholds {
    fn default() -> Self {
        Self {
            memory_limit_mb: 200.0,
            memory_warning_ratio: MEMORY_WARNING_RATIO,
            ai_response_warning_ms: AI_RESPONSE_WARNING_MS,
            transcription_latency_warning_ms: TRANSCRIPTION_LATENCY_WARNING_MS,
            render_budget_ms: FRAME_BUDGET_MS,
        }
    }
}

impl PerformanceThresholds {
    fn memory_ratio(&self, metrics: &PerformanceMetrics) -> f64 {
        ratio(metrics.memory_usage_mb, self.memory_limit_mb)
    }

    fn ai_ratio(&self, metrics: &PerformanceMetrics) -> f64 {
        ratio(metrics.ai_response_time_ms, self.ai_response_warning_ms)
    }

    fn transcription_ratio(&self, metrics: &PerformanceMetrics) -> f64 {
        ratio(
            metrics.transcription_latency_ms,
            self.transcription_latency_warning_ms,
        )
    }

    fn render_ratio(&self, metrics: &PerformanceMetrics) -> f64 {
        ratio(metrics.render_time_ms, self.render_budget_ms)
    }
}

fn ratio(value: f64, limit: f64) -> f64 {
    if limit > 0.0 {
        value / limit
    } else {
        0.0
    }
}

/// Signal raised when a metric crosses into its warning range
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PerformanceWarning {
    HighMemory { usage_mb: f64, limit_mb: f64 },
    SlowAiResponse { response_ms: f64, threshold_ms: f64 },
    SlowTranscription { latency_ms: f64, threshold_ms: f64 },
}

/// Linear memory estimate for platforms that cannot report usage
pub fn estimate_memory_mb(elapsed: chrono::Duration, limit_mb: f64) -> f64 {
    let minutes = elapsed.num_milliseconds().max(0) as f64 / 60_000.0;
    (BASELINE_MEMORY_MB + minutes * ESTIMATED_GROWTH_MB_PER_MINUTE).min(limit_mb)
}

/// Battery impact from the memory ratio and the AI response ratio (response / warning)
pub fn classify_battery(memory_ratio: f64, ai_ratio: f64) -> BatteryImpact {
    if memory_ratio > 0.8 || ai_ratio > 2.0 {
        BatteryImpact::High
    } else if memory_ratio > 0.5 || ai_ratio > 1.5 {
        BatteryImpact::Medium
    } else {
        BatteryImpact::Low
    }
}

// ============================================================================
// Advisors
// ============================================================================

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MobileRecommendation {
    DisableAdvancedAi,
    DisableRealTimeTranscription,
    DisableAutoAiSuggestions,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct MobileOptimizations {
    pub memory_limit_mb: f64,
    pub recommendations: Vec<MobileRecommendation>,
}

impl MobileOptimizations {
    /// Preference changes that carry out the recommendations
    pub fn preferences_patch(&self) -> PreferencesPatch {
        let mut patch = PreferencesPatch::default();
        for rec in &self.recommendations {
            match rec {
                MobileRecommendation::DisableAdvancedAi => patch.default_ai_mode = Some(AiMode::Basic),
                MobileRecommendation::DisableRealTimeTranscription => {
                    patch.real_time_transcription = Some(false)
                }
                MobileRecommendation::DisableAutoAiSuggestions => {
                    patch.auto_ai_suggestions = Some(false)
                }
            }
        }
        patch
    }
}

/// Advice for mobile hosts; desktop hosts get the limit unchanged and no advice
pub fn mobile_optimizations(
    metrics: &PerformanceMetrics,
    thresholds: &PerformanceThresholds,
    is_mobile: bool,
) -> MobileOptimizations {
    if !is_mobile {
        return MobileOptimizations {
            memory_limit_mb: thresholds.memory_limit_mb,
            recommendations: Vec::new(),
        };
    }

    let clamped = PerformanceThresholds {
        memory_limit_mb: thresholds.memory_limit_mb.min(MOBILE_MEMORY_LIMIT_MB),
        ..*thresholds
    };
    let mut recommendations = Vec::new();
    if clamped.memory_ratio(metrics) >= clamped.memory_warning_ratio {
        recommendations.push(MobileRecommendation::DisableAdvancedAi);
    }
    if clamped.transcription_ratio(metrics) > 1.0 {
        recommendations.push(MobileRecommendation::DisableRealTimeTranscription);
    }
    if clamped.ai_ratio(metrics) > 1.0 {
        recommendations.push(MobileRecommendation::DisableAutoAiSuggestions);
    }
    MobileOptimizations {
        memory_limit_mb: clamped.memory_limit_mb,
        recommendations,
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationKind {
    ReduceMemory,
    OptimizeRendering,
    BatchOperations,
    DisableFeatures,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Impact {
    Low,
    Medium,
    High,
}

impl Impact {
    fn from_ratio(r: f64) -> Self {
        if r >= 1.5 {
            Impact::High
        } else if r >= 1.0 {
            Impact::Medium
        } else {
            Impact::Low
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct OptimizationAction {
    pub kind: OptimizationKind,
    /// 1 is most urgent
    pub priority: u8,
    pub impact: Impact,
    pub description: String,
}

/// Prioritized optimizations for the current readings
pub fn optimization_strategies(
    metrics: &PerformanceMetrics,
    thresholds: &PerformanceThresholds,
) -> Vec<OptimizationAction> {
    let memory = thresholds.memory_ratio(metrics);
    let render = thresholds.render_ratio(metrics);
    let slowest = thresholds
        .ai_ratio(metrics)
        .max(thresholds.transcription_ratio(metrics));

    let mut actions = Vec::new();
    if memory >= thresholds.memory_warning_ratio {
        actions.push(OptimizationAction {
            kind: OptimizationKind::ReduceMemory,
            priority: 1,
            // Scaled so that reaching the warning ratio counts as medium
            impact: Impact::from_ratio(memory / thresholds.memory_warning_ratio),
            description: format!(
                "Memory at {:.0}% of the {:.0}MB limit; release cached transcripts and AI messages",
                memory * 100.0,
                thresholds.memory_limit_mb
            ),
        });
    }
    if render > 1.0 {
        actions.push(OptimizationAction {
            kind: OptimizationKind::OptimizeRendering,
            priority: 2,
            impact: Impact::from_ratio(render),
            description: format!(
                "Frames take {:.1}ms against a {:.1}ms budget; throttle live updates",
                metrics.render_time_ms, thresholds.render_budget_ms
            ),
        });
    }
    if slowest > 1.0 {
        actions.push(OptimizationAction {
            kind: OptimizationKind::BatchOperations,
            priority: 3,
            impact: Impact::from_ratio(slowest),
            description: "Service responses are slow; batch transcript and AI requests".to_string(),
        });
    }
    if memory >= 1.0 || metrics.battery_impact == BatteryImpact::High {
        actions.push(OptimizationAction {
            kind: OptimizationKind::DisableFeatures,
            priority: 4,
            impact: Impact::High,
            description: "Turn off real-time transcription and automatic AI suggestions".to_string(),
        });
    }
    actions.sort_by_key(|a| a.priority);
    actions
}

// ============================================================================
// Monitor
// ============================================================================

#[derive(Default)]
struct WarningLatch {
    memory: bool,
    ai: bool,
    transcription: bool,
}

pub struct PerformanceMonitor {
    platform: Arc<dyn Platform>,
    dispatcher: Arc<dyn Dispatcher>,
    /// Configured thresholds; the memory limit is resolved per reading
    base: PerformanceThresholds,
    memory_ceiling_mb: Option<f64>,
    interval: Duration,
    mobile: bool,
    metrics: Mutex<PerformanceMetrics>,
    latch: Mutex<WarningLatch>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    slow_frames: AtomicU64,
    warnings: broadcast::Sender<PerformanceWarning>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl PerformanceMonitor {
    pub fn new(
        platform: Arc<dyn Platform>,
        dispatcher: Arc<dyn Dispatcher>,
        config: &PerformanceConfig,
    ) -> Self {
        let mobile = config.force_mobile.unwrap_or_else(|| platform.is_mobile());
        let (warnings, _) = broadcast::channel(WARNING_CHANNEL_CAPACITY);
        Self {
            platform,
            dispatcher,
            base: config.thresholds(),
            memory_ceiling_mb: config.memory_limit_mb,
            interval: config.sample_interval(),
            mobile,
            metrics: Mutex::new(PerformanceMetrics::default()),
            latch: Mutex::new(WarningLatch::default()),
            started_at: Mutex::new(None),
            slow_frames: AtomicU64::new(0),
            warnings,
            cancel: Mutex::new(None),
        }
    }

    /// Thresholds in force right now
    ///
    /// The memory limit follows the performance mode in the state tree,
    /// capped by the configured limit and, on mobile, by the mobile limit.
    pub fn thresholds(&self) -> PerformanceThresholds {
        let mode_limit = self.dispatcher.snapshot().system.memory_threshold_mb();
        let mut limit = self
            .memory_ceiling_mb
            .map_or(mode_limit, |ceiling| ceiling.min(mode_limit));
        if self.mobile {
            limit = limit.min(MOBILE_MEMORY_LIMIT_MB);
        }
        PerformanceThresholds {
            memory_limit_mb: limit,
            ..self.base
        }
    }

    pub fn is_mobile(&self) -> bool {
        self.mobile
    }

    pub fn metrics(&self) -> PerformanceMetrics {
        *self.metrics.lock()
    }

    /// Render times over budget seen so far
    pub fn slow_frames(&self) -> u64 {
        self.slow_frames.load(Ordering::Relaxed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PerformanceWarning> {
        self.warnings.subscribe()
    }

    pub fn mobile_optimizations(&self) -> MobileOptimizations {
        mobile_optimizations(&self.metrics(), &self.thresholds(), self.mobile)
    }

    pub fn optimization_strategies(&self) -> Vec<OptimizationAction> {
        optimization_strategies(&self.metrics(), &self.thresholds())
    }

    /// Take one reading of memory and storage and publish it
    pub async fn sample(&self) -> PerformanceMetrics {
        let now = self.dispatcher.now();
        let started = *self.started_at.lock().get_or_insert(now);
        let thresholds = self.thresholds();

        let memory = match self.platform.memory_usage_mb().await {
            Some(mb) => mb,
            None => estimate_memory_mb(now - started, thresholds.memory_limit_mb),
        };
        let storage = self.platform.storage_estimate().await;

        let snapshot = {
            let mut metrics = self.metrics.lock();
            metrics.memory_usage_mb = memory;
            if let Some(estimate) = storage {
                metrics.storage_usage_mb = estimate.used as f64 / BYTES_PER_MB;
            }
            if self.mobile {
                metrics.battery_impact = classify_battery(
                    thresholds.memory_ratio(&metrics),
                    thresholds.ai_ratio(&metrics),
                );
            }
            *metrics
        };

        self.dispatcher.dispatch(
            SystemAction::UpdatePerformanceMetrics {
                metrics: PerformanceMetricsPatch {
                    memory_usage_mb: Some(snapshot.memory_usage_mb),
                    storage_usage_mb: storage.map(|_| snapshot.storage_usage_mb),
                    battery_impact: self.mobile.then_some(snapshot.battery_impact),
                    ..Default::default()
                },
            }
            .into(),
        );
        if let Some(StorageEstimate { used, available }) = storage {
            self.dispatcher.dispatch(
                SystemAction::UpdateStorageUsage {
                    used,
                    available,
                    quota: used.saturating_add(available),
                }
                .into(),
            );
        }

        tracing::trace!(memory_mb = snapshot.memory_usage_mb, "Performance sample");
        self.check_thresholds(&snapshot);
        snapshot
    }

    pub fn record_transcription_latency(&self, ms: f64) {
        let snapshot = self.update(|m| m.transcription_latency_ms = ms);
        self.publish(PerformanceMetricsPatch {
            transcription_latency_ms: Some(ms),
            ..Default::default()
        });
        self.check_thresholds(&snapshot);
    }

    pub fn record_ai_response_time(&self, ms: f64) {
        let snapshot = self.update(|m| m.ai_response_time_ms = ms);
        self.publish(PerformanceMetricsPatch {
            ai_response_time_ms: Some(ms),
            ..Default::default()
        });
        self.check_thresholds(&snapshot);
    }

    /// Returns whether the frame went over budget
    pub fn record_render_time(&self, ms: f64) -> bool {
        self.update(|m| m.render_time_ms = ms);
        self.publish(PerformanceMetricsPatch {
            render_time_ms: Some(ms),
            ..Default::default()
        });
        let budget = self.base.render_budget_ms;
        let slow = ms > budget;
        if slow {
            self.slow_frames.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                "Slow render: {:.2}ms exceeds the {:.2}ms frame budget",
                ms,
                budget
            );
        }
        slow
    }

    fn update(&self, f: impl FnOnce(&mut PerformanceMetrics)) -> PerformanceMetrics {
        let mut metrics = self.metrics.lock();
        f(&mut metrics);
        *metrics
    }

    fn publish(&self, patch: PerformanceMetricsPatch) {
        self.dispatcher
            .dispatch(SystemAction::UpdatePerformanceMetrics { metrics: patch }.into());
    }

    /// Emit a warning for each metric that just entered its warning range
    fn check_thresholds(&self, metrics: &PerformanceMetrics) {
        let t = &self.thresholds();
        let mut raised = Vec::new();
        {
            let mut latch = self.latch.lock();

            let high_memory = t.memory_ratio(metrics) >= t.memory_warning_ratio;
            if high_memory && !latch.memory {
                raised.push(PerformanceWarning::HighMemory {
                    usage_mb: metrics.memory_usage_mb,
                    limit_mb: t.memory_limit_mb,
                });
            }
            latch.memory = high_memory;

            let slow_ai = metrics.ai_response_time_ms > t.ai_response_warning_ms;
            if slow_ai && !latch.ai {
                raised.push(PerformanceWarning::SlowAiResponse {
                    response_ms: metrics.ai_response_time_ms,
                    threshold_ms: t.ai_response_warning_ms,
                });
            }
            latch.ai = slow_ai;

            let slow_transcription =
                metrics.transcription_latency_ms > t.transcription_latency_warning_ms;
            if slow_transcription && !latch.transcription {
                raised.push(PerformanceWarning::SlowTranscription {
                    latency_ms: metrics.transcription_latency_ms,
                    threshold_ms: t.transcription_latency_warning_ms,
                });
            }
            latch.transcription = slow_transcription;
        }

        for warning in raised {
            tracing::warn!(?warning, "Performance threshold crossed");
            // Nobody listening is fine
            let _ = self.warnings.send(warning);
        }
    }

    pub fn is_running(&self) -> bool {
        self.cancel.lock().is_some()
    }

    /// Start periodic sampling. Returns `None` if already running.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut slot = self.cancel.lock();
        if slot.is_some() {
            return None;
        }
        let token = CancellationToken::new();
        *slot = Some(token.clone());
        *self.started_at.lock() = Some(self.dispatcher.now());

        let monitor = Arc::clone(self);
        let period = self.interval;
        tracing::info!("Performance monitoring every {:?}", period);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        monitor.sample().await;
                    }
                }
            }
            tracing::debug!("Performance monitoring stopped");
        }))
    }

    pub fn stop(&self) {
        if let Some(token) = self.cancel.lock().take() {
            token.cancel();
        }
    }
}
