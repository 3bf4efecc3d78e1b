//! Cross-cutting domain types shared by the reducers, the recovery engine and
//! the performance monitor.
//!
//! This module defines:
//! - The error taxonomy (`MedicalError` and its classification helpers)
//! - Notifications
//! - Performance metrics and modes
//! - Permission and preference enums used across slices
//! - The bounded-list insert helper

use crate::action::ActionPayload;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;

/// Push onto a bounded list, evicting the oldest entries beyond `cap`
pub fn push_bounded<T>(list: &mut VecDeque<T>, item: T, cap: usize) {
    list.push_back(item);
    while list.len() > cap {
        list.pop_front();
    }
}

// ============================================================================
// Error Taxonomy
// ============================================================================

/// Normalized failure codes
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NetworkError,
    ApiError,
    TranscriptionError,
    AiError,
    PermissionError,
    StorageError,
    MedicalValidationError,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 7] = [
        ErrorCode::NetworkError,
        ErrorCode::ApiError,
        ErrorCode::TranscriptionError,
        ErrorCode::AiError,
        ErrorCode::PermissionError,
        ErrorCode::StorageError,
        ErrorCode::MedicalValidationError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::ApiError => "API_ERROR",
            ErrorCode::TranscriptionError => "TRANSCRIPTION_ERROR",
            ErrorCode::AiError => "AI_ERROR",
            ErrorCode::PermissionError => "PERMISSION_ERROR",
            ErrorCode::StorageError => "STORAGE_ERROR",
            ErrorCode::MedicalValidationError => "MEDICAL_VALIDATION_ERROR",
        }
    }

    /// Parse either the canonical code or a short alias (`network`, `ai`, ...)
    pub fn parse(s: &str) -> Option<ErrorCode> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        ErrorCode::ALL.into_iter().find(|code| {
            let canonical = code.as_str();
            canonical == normalized || canonical.trim_end_matches("_ERROR") == normalized
        })
    }

    /// Category this code belongs to
    pub fn category(&self) -> ErrorCategory {
        match self {
            ErrorCode::TranscriptionError
            | ErrorCode::AiError
            | ErrorCode::MedicalValidationError => ErrorCategory::Medical,
            ErrorCode::ApiError | ErrorCode::NetworkError | ErrorCode::StorageError => {
                ErrorCategory::Technical
            }
            ErrorCode::PermissionError => ErrorCategory::User,
        }
    }

    /// Default remediation label for this code
    pub fn recovery_label(&self) -> RecoveryLabel {
        match self {
            ErrorCode::NetworkError | ErrorCode::ApiError => RecoveryLabel::Retry,
            ErrorCode::TranscriptionError | ErrorCode::AiError | ErrorCode::StorageError => {
                RecoveryLabel::Fallback
            }
            ErrorCode::PermissionError | ErrorCode::MedicalValidationError => {
                RecoveryLabel::UserAction
            }
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Medical,
    Technical,
    User,
    System,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryLabel {
    Retry,
    Fallback,
    UserAction,
}

/// Well-known context keys plus free-form extras
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
pub struct ErrorContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consultation_id: Option<String>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub memory_pressure: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission: Option<PermissionKind>,

    /// Action that failed, replayed by the network retry strategy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_action: Option<Box<ActionPayload>>,

    #[serde(default, flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A failure normalized for the system slice and the recovery engine
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MedicalError {
    pub id: String,
    pub code: ErrorCode,
    pub category: ErrorCategory,
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub context: ErrorContext,
    pub timestamp: DateTime<Utc>,
    pub recoverable: bool,
    pub recovery_strategy: RecoveryLabel,
}

impl MedicalError {
    /// Build an error; category and recovery label are derived from `code`
    pub fn new(
        id: impl Into<String>,
        code: ErrorCode,
        severity: Severity,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            code,
            category: code.category(),
            severity,
            message: message.into(),
            context: ErrorContext::default(),
            timestamp,
            recoverable: code != ErrorCode::MedicalValidationError,
            recovery_strategy: code.recovery_label(),
        }
    }

    /// Normalize a crate error raised at a detection site
    pub fn from_failure(
        id: impl Into<String>,
        err: &crate::Error,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let (code, severity) = match err {
            crate::Error::Io(_) | crate::Error::Storage(_) | crate::Error::Json(_) => {
                (ErrorCode::StorageError, Severity::High)
            }
            crate::Error::Timeout(_) => (ErrorCode::NetworkError, Severity::Medium),
            crate::Error::Toml(_) | crate::Error::Config(_) => {
                // A broken config file needs the user; cache cleanup cannot fix it
                let mut error = Self::new(
                    id,
                    ErrorCode::StorageError,
                    Severity::Medium,
                    err.to_string(),
                    timestamp,
                )
                .recoverable(false);
                error.category = ErrorCategory::System;
                error.recovery_strategy = RecoveryLabel::UserAction;
                return error;
            }
            crate::Error::Recovery(_) | crate::Error::Other(_) => {
                (ErrorCode::ApiError, Severity::Medium)
            }
        };
        Self::new(id, code, severity, err.to_string(), timestamp)
    }

    /// Memory usage past its warning ratio, flagged for memory relief
    pub fn memory_pressure(
        id: impl Into<String>,
        usage_mb: f64,
        limit_mb: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let mut error = Self::new(
            id,
            ErrorCode::StorageError,
            Severity::Medium,
            format!("Memory usage at {:.0}MB of a {:.0}MB limit", usage_mb, limit_mb),
            timestamp,
        )
        .with_memory_pressure()
        .with_extra("usage_mb", serde_json::json!(usage_mb))
        .with_extra("limit_mb", serde_json::json!(limit_mb));
        error.category = ErrorCategory::System;
        error
    }

    pub fn with_consultation(mut self, consultation_id: impl Into<String>) -> Self {
        self.context.consultation_id = Some(consultation_id.into());
        self
    }

    pub fn with_memory_pressure(mut self) -> Self {
        self.context.memory_pressure = true;
        self
    }

    pub fn with_permission(mut self, kind: PermissionKind) -> Self {
        self.context.permission = Some(kind);
        self
    }

    pub fn with_original_action(mut self, action: ActionPayload) -> Self {
        self.context.original_action = Some(Box::new(action));
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.extra.insert(key.into(), value);
        self
    }

    pub fn recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }

    /// Identity used for attempt tracking and deduplication
    pub fn key(&self) -> String {
        format!("{}:{}", self.code, self.message)
    }
}

// ============================================================================
// Notifications
// ============================================================================

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub id: String,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub read: bool,
    pub persistent: bool,
}

/// Notification contents before the reducer assigns id and timestamp
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NotificationDraft {
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub persistent: bool,
}

impl NotificationDraft {
    pub fn new(kind: NotificationKind, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            title: title.into(),
            message: message.into(),
            persistent: false,
        }
    }

    pub fn info(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NotificationKind::Info, title, message)
    }

    pub fn warning(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NotificationKind::Warning, title, message)
    }

    pub fn error(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NotificationKind::Error, title, message)
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }
}

// ============================================================================
// Performance
// ============================================================================

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BatteryImpact {
    #[default]
    Low,
    Medium,
    High,
}

/// Coarse device resource budget
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceMode {
    High,
    #[default]
    Balanced,
    BatterySaver,
}

impl PerformanceMode {
    /// Memory budget in MB for this mode
    pub fn memory_threshold_mb(&self) -> f64 {
        match self {
            PerformanceMode::High => 300.0,
            PerformanceMode::Balanced => 200.0,
            PerformanceMode::BatterySaver => 100.0,
        }
    }
}

/// Point-in-time performance readings (milliseconds and megabytes)
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct PerformanceMetrics {
    pub transcription_latency_ms: f64,
    pub ai_response_time_ms: f64,
    pub render_time_ms: f64,
    pub memory_usage_mb: f64,
    pub network_usage_kb: f64,
    pub storage_usage_mb: f64,
    pub battery_impact: BatteryImpact,
}

/// Partial metric update; absent fields keep their previous value
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct PerformanceMetricsPatch {
    pub transcription_latency_ms: Option<f64>,
    pub ai_response_time_ms: Option<f64>,
    pub render_time_ms: Option<f64>,
    pub memory_usage_mb: Option<f64>,
    pub network_usage_kb: Option<f64>,
    pub storage_usage_mb: Option<f64>,
    pub battery_impact: Option<BatteryImpact>,
}

impl PerformanceMetrics {
    pub fn apply(&mut self, patch: &PerformanceMetricsPatch) {
        if let Some(v) = patch.transcription_latency_ms {
            self.transcription_latency_ms = v;
        }
        if let Some(v) = patch.ai_response_time_ms {
            self.ai_response_time_ms = v;
        }
        if let Some(v) = patch.render_time_ms {
            self.render_time_ms = v;
        }
        if let Some(v) = patch.memory_usage_mb {
            self.memory_usage_mb = v;
        }
        if let Some(v) = patch.network_usage_kb {
            self.network_usage_kb = v;
        }
        if let Some(v) = patch.storage_usage_mb {
            self.storage_usage_mb = v;
        }
        if let Some(v) = patch.battery_impact {
            self.battery_impact = v;
        }
    }
}

/// Best-effort storage quota reading in bytes
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StorageEstimate {
    pub used: u64,
    pub available: u64,
}

impl StorageEstimate {
    pub fn quota(&self) -> u64 {
        self.used.saturating_add(self.available)
    }
}

// ============================================================================
// Permissions and Service Preferences
// ============================================================================

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PermissionKind {
    Microphone,
    Notifications,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PermissionStatus {
    #[default]
    Prompt,
    Granted,
    Denied,
}

/// Which speech-to-text engine the transcription collaborator should use
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptionService {
    #[default]
    Cloud,
    Local,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AiMode {
    Basic,
    #[default]
    Advanced,
    Expert,
}
