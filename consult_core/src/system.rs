//! System slice: connectivity, errors, notifications, cache and resource state.

use crate::action::ReduceContext;
use crate::types::{
    push_bounded, ErrorCode, MedicalError, Notification, NotificationDraft, NotificationKind,
    PerformanceMetrics, PerformanceMetricsPatch, PerformanceMode, Severity,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Errors kept in the system slice
pub const ERROR_CAP: usize = 50;
/// Notifications kept in the system slice
pub const NOTIFICATION_CAP: usize = 100;
/// Window in which an identical error is considered a repeat
pub const ERROR_DEDUP_WINDOW_MINUTES: i64 = 5;
/// Age after which non-persistent notifications are dropped
pub const NOTIFICATION_TTL_MINUTES: i64 = 60;
/// Age after which errors are dropped on rehydration
pub const ERROR_TTL_HOURS: i64 = 24;

/// Share of the mode's memory budget that triggers a warning
pub const MEMORY_WARNING_RATIO: f64 = 0.8;
/// AI response time that triggers a warning
pub const AI_RESPONSE_WARNING_MS: f64 = 5000.0;
/// Share of the storage quota that triggers a warning
pub const STORAGE_WARNING_RATIO: f64 = 0.85;

pub const HIGH_MEMORY_TITLE: &str = "High memory usage";
pub const SLOW_AI_TITLE: &str = "Slow AI response";
pub const STORAGE_FULL_TITLE: &str = "Storage almost full";
pub const OFFLINE_TITLE: &str = "Connection lost";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct CacheMetrics {
    pub size_bytes: u64,
    /// Share of lookups served from cache, in [0, 1]
    pub hit_rate: f64,
    pub last_cleaned: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct StorageUsage {
    pub used: u64,
    pub available: u64,
    pub quota: u64,
}

impl StorageUsage {
    pub fn ratio(&self) -> f64 {
        if self.quota == 0 {
            0.0
        } else {
            self.used as f64 / self.quota as f64
        }
    }
}

/// The system slice of the application state
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SystemState {
    pub is_online: bool,
    #[serde(skip)]
    pub is_loading: bool,
    pub errors: VecDeque<MedicalError>,
    pub notifications: Vec<Notification>,
    pub cache: CacheMetrics,
    pub storage: StorageUsage,
    pub performance_mode: PerformanceMode,
    /// Latest sampled metrics; derived, never persisted
    #[serde(skip)]
    pub metrics: PerformanceMetrics,
}

impl Default for SystemState {
    fn default() -> Self {
        Self {
            is_online: true,
            is_loading: false,
            errors: VecDeque::new(),
            notifications: Vec::new(),
            cache: CacheMetrics::default(),
            storage: StorageUsage::default(),
            performance_mode: PerformanceMode::default(),
            metrics: PerformanceMetrics::default(),
        }
    }
}

impl SystemState {
    pub fn memory_threshold_mb(&self) -> f64 {
        self.performance_mode.memory_threshold_mb()
    }

    pub fn unread_notifications(&self) -> impl Iterator<Item = &Notification> {
        self.notifications.iter().filter(|n| !n.read)
    }

    fn has_unread_titled(&self, needle: &str) -> bool {
        self.unread_notifications().any(|n| n.title.contains(needle))
    }

    fn notify(&mut self, draft: NotificationDraft, ctx: &ReduceContext) {
        self.prune_notifications(ctx.now);
        self.notifications.push(Notification {
            id: ctx.ids.next_id(),
            kind: draft.kind,
            title: draft.title,
            message: draft.message,
            timestamp: ctx.now,
            read: false,
            persistent: draft.persistent,
        });
        if self.notifications.len() > NOTIFICATION_CAP {
            let excess = self.notifications.len() - NOTIFICATION_CAP;
            self.notifications.drain(..excess);
        }
    }

    /// Drop non-persistent notifications older than the TTL
    fn prune_notifications(&mut self, now: DateTime<Utc>) -> bool {
        let before = self.notifications.len();
        let cutoff = now - Duration::minutes(NOTIFICATION_TTL_MINUTES);
        self.notifications
            .retain(|n| n.persistent || n.timestamp >= cutoff);
        self.notifications.len() != before
    }
}

// ============================================================================
// Actions
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SystemAction {
    SetOnline { online: bool },
    SetLoading { loading: bool },
    AddError { error: MedicalError },
    ClearError { id: String },
    ClearErrors,
    AddNotification { notification: NotificationDraft },
    MarkNotificationRead { id: String },
    MarkAllNotificationsRead,
    RemoveNotification { id: String },
    ClearNotifications,
    PruneNotifications,
    UpdateCacheMetrics { size_bytes: u64, hit_rate: f64 },
    CleanCache { force: bool },
    UpdateStorageUsage { used: u64, available: u64, quota: u64 },
    SetPerformanceMode { mode: PerformanceMode },
    UpdatePerformanceMetrics { metrics: PerformanceMetricsPatch },
}

// ============================================================================
// Reducer
// ============================================================================

/// Apply `action` to the slice. Returns whether anything changed.
pub fn reduce(state: &mut SystemState, action: &SystemAction, ctx: &ReduceContext) -> bool {
    use SystemAction::*;

    match action {
        SetOnline { online } => {
            if state.is_online == *online {
                return false;
            }
            state.is_online = *online;
            if *online {
                tracing::info!("Connectivity restored");
                for n in state
                    .notifications
                    .iter_mut()
                    .filter(|n| n.title == OFFLINE_TITLE)
                {
                    n.read = true;
                }
            } else {
                tracing::warn!("Connectivity lost");
                state.notify(
                    NotificationDraft::warning(
                        OFFLINE_TITLE,
                        "Working offline. Changes are kept locally until the connection returns.",
                    )
                    .persistent(),
                    ctx,
                );
            }
            true
        }

        SetLoading { loading } => {
            if state.is_loading == *loading {
                return false;
            }
            state.is_loading = *loading;
            true
        }

        AddError { error } => add_error(state, error, ctx),

        ClearError { id } => {
            let before = state.errors.len();
            state.errors.retain(|e| &e.id != id);
            state.errors.len() != before
        }

        ClearErrors => {
            if state.errors.is_empty() {
                return false;
            }
            state.errors.clear();
            true
        }

        AddNotification { notification } => {
            state.notify(notification.clone(), ctx);
            true
        }

        MarkNotificationRead { id } => match state
            .notifications
            .iter_mut()
            .find(|n| &n.id == id && !n.read)
        {
            Some(n) => {
                n.read = true;
                true
            }
            None => false,
        },

        MarkAllNotificationsRead => {
            let mut changed = false;
            for n in state.notifications.iter_mut().filter(|n| !n.read) {
                n.read = true;
                changed = true;
            }
            changed
        }

        RemoveNotification { id } => {
            let before = state.notifications.len();
            state.notifications.retain(|n| &n.id != id);
            state.notifications.len() != before
        }

        ClearNotifications => {
            if state.notifications.is_empty() {
                return false;
            }
            state.notifications.clear();
            true
        }

        PruneNotifications => state.prune_notifications(ctx.now),

        UpdateCacheMetrics {
            size_bytes,
            hit_rate,
        } => {
            state.cache.size_bytes = *size_bytes;
            state.cache.hit_rate = hit_rate.clamp(0.0, 1.0);
            true
        }

        CleanCache { force } => {
            let cache = &mut state.cache;
            if *force {
                cache.size_bytes = 0;
                cache.hit_rate = 0.0;
            } else {
                cache.size_bytes = cache.size_bytes * 3 / 10;
                cache.hit_rate *= 0.9;
            }
            cache.last_cleaned = Some(ctx.now);
            tracing::info!(force = *force, "Cache cleaned");
            true
        }

        UpdateStorageUsage {
            used,
            available,
            quota,
        } => {
            let usage = StorageUsage {
                used: *used,
                available: *available,
                quota: *quota,
            };
            let changed = state.storage != usage;
            state.storage = usage;
            if state.storage.ratio() > STORAGE_WARNING_RATIO
                && !state.has_unread_titled(STORAGE_FULL_TITLE)
            {
                state.notify(
                    NotificationDraft::warning(
                        STORAGE_FULL_TITLE,
                        format!(
                            "Local storage is {:.0}% full. Older consultations may be archived.",
                            state.storage.ratio() * 100.0
                        ),
                    )
                    .persistent(),
                    ctx,
                );
                return true;
            }
            changed
        }

        SetPerformanceMode { mode } => {
            if state.performance_mode == *mode {
                return false;
            }
            tracing::info!("Performance mode changed to {:?}", mode);
            state.performance_mode = *mode;
            true
        }

        UpdatePerformanceMetrics { metrics } => {
            let before = state.metrics;
            state.metrics.apply(metrics);
            let notified = check_performance_thresholds(state, ctx);
            notified || state.metrics != before
        }
    }
}

fn add_error(state: &mut SystemState, error: &MedicalError, ctx: &ReduceContext) -> bool {
    let window = Duration::minutes(ERROR_DEDUP_WINDOW_MINUTES);
    let repeat = state.errors.iter().any(|e| {
        e.code == error.code && e.message == error.message && ctx.now - e.timestamp < window
    });
    if repeat {
        tracing::debug!("Dropping repeated error {}", error.key());
        return false;
    }

    tracing::warn!(
        code = %error.code,
        severity = ?error.severity,
        "Error recorded: {}",
        error.message
    );
    push_bounded(&mut state.errors, error.clone(), ERROR_CAP);

    if error.severity >= Severity::High {
        let mut draft = NotificationDraft::new(
            NotificationKind::Error,
            error_title(error.code),
            error.message.clone(),
        );
        if error.severity == Severity::Critical {
            draft = draft.persistent();
        }
        state.notify(draft, ctx);
    }
    true
}

/// Returns whether a warning notification was added
fn check_performance_thresholds(state: &mut SystemState, ctx: &ReduceContext) -> bool {
    let mut notified = false;
    let threshold = state.memory_threshold_mb();
    let memory = state.metrics.memory_usage_mb;
    if memory >= threshold * MEMORY_WARNING_RATIO && !state.has_unread_titled(HIGH_MEMORY_TITLE) {
        state.notify(
            NotificationDraft::warning(
                HIGH_MEMORY_TITLE,
                format!(
                    "Memory usage is {:.0}MB of a {:.0}MB budget. Consider closing unused consultations.",
                    memory, threshold
                ),
            ),
            ctx,
        );
        notified = true;
    }

    let ai = state.metrics.ai_response_time_ms;
    if ai > AI_RESPONSE_WARNING_MS && !state.has_unread_titled(SLOW_AI_TITLE) {
        state.notify(
            NotificationDraft::warning(
                SLOW_AI_TITLE,
                format!("AI suggestions are taking {:.1}s to arrive.", ai / 1000.0),
            ),
            ctx,
        );
        notified = true;
    }
    notified
}

/// User-facing title for an error notification
pub fn error_title(code: ErrorCode) -> &'static str {
    match code {
        ErrorCode::NetworkError => "Network problem",
        ErrorCode::ApiError => "Service problem",
        ErrorCode::TranscriptionError => "Transcription problem",
        ErrorCode::AiError => "AI assistant problem",
        ErrorCode::PermissionError => "Permission required",
        ErrorCode::StorageError => "Storage problem",
        ErrorCode::MedicalValidationError => "Validation problem",
    }
}

/// Prepare a persisted slice for use: drop stale errors and expired notifications
pub fn rehydrate(mut state: SystemState, now: DateTime<Utc>) -> SystemState {
    let error_cutoff = now - Duration::hours(ERROR_TTL_HOURS);
    state.errors.retain(|e| e.timestamp >= error_cutoff);
    state.prune_notifications(now);
    state.is_loading = false;
    state.is_online = true;
    state.metrics = PerformanceMetrics::default();
    state
}
