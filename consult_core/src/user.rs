//! User slice: preferences, permission state and usage statistics.

use crate::action::ReduceContext;
use crate::types::{push_bounded, AiMode, ErrorCode, PermissionKind, PermissionStatus, TranscriptionService};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Analytics events kept in the user slice
pub const ANALYTICS_CAP: usize = 100;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Theme {
    Light,
    Dark,
    #[default]
    System,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Preferences {
    pub language: String,
    pub theme: Theme,
    pub transcription_service: TranscriptionService,
    pub default_ai_mode: AiMode,
    pub auto_ai_suggestions: bool,
    pub real_time_transcription: bool,
    pub notifications_enabled: bool,
    pub auto_save: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            language: "en".into(),
            theme: Theme::default(),
            transcription_service: TranscriptionService::default(),
            default_ai_mode: AiMode::default(),
            auto_ai_suggestions: true,
            real_time_transcription: true,
            notifications_enabled: true,
            auto_save: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct PreferencesPatch {
    pub language: Option<String>,
    pub theme: Option<Theme>,
    pub transcription_service: Option<TranscriptionService>,
    pub default_ai_mode: Option<AiMode>,
    pub auto_ai_suggestions: Option<bool>,
    pub real_time_transcription: Option<bool>,
    pub notifications_enabled: Option<bool>,
    pub auto_save: Option<bool>,
}

impl Preferences {
    fn merge(&mut self, patch: &PreferencesPatch) {
        if let Some(ref language) = patch.language {
            self.language = language.clone();
        }
        self.theme = patch.theme.unwrap_or(self.theme);
        self.transcription_service = patch
            .transcription_service
            .unwrap_or(self.transcription_service);
        self.default_ai_mode = patch.default_ai_mode.unwrap_or(self.default_ai_mode);
        self.auto_ai_suggestions = patch.auto_ai_suggestions.unwrap_or(self.auto_ai_suggestions);
        self.real_time_transcription = patch
            .real_time_transcription
            .unwrap_or(self.real_time_transcription);
        self.notifications_enabled = patch
            .notifications_enabled
            .unwrap_or(self.notifications_enabled);
        self.auto_save = patch.auto_save.unwrap_or(self.auto_save);
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Permissions {
    pub microphone: PermissionStatus,
    pub notifications: PermissionStatus,
}

impl Permissions {
    pub fn get(&self, kind: PermissionKind) -> PermissionStatus {
        match kind {
            PermissionKind::Microphone => self.microphone,
            PermissionKind::Notifications => self.notifications,
        }
    }

    pub fn set(&mut self, kind: PermissionKind, status: PermissionStatus) {
        match kind {
            PermissionKind::Microphone => self.microphone = status,
            PermissionKind::Notifications => self.notifications = status,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PermissionsPatch {
    pub microphone: Option<PermissionStatus>,
    pub notifications: Option<PermissionStatus>,
}

impl PermissionsPatch {
    pub fn single(kind: PermissionKind, status: PermissionStatus) -> Self {
        let mut patch = Self::default();
        match kind {
            PermissionKind::Microphone => patch.microphone = Some(status),
            PermissionKind::Notifications => patch.notifications = Some(status),
        }
        patch
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct UsageStatistics {
    pub total_consultations: u64,
    pub total_duration_ms: i64,
    pub average_session_length_ms: i64,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Usage and recovery events fed into the rolling statistics
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AnalyticsEvent {
    ConsultationCompleted {
        consultation_id: String,
        duration_ms: i64,
    },
    Interaction {
        name: String,
    },
    RecoverySucceeded {
        strategy: String,
        code: ErrorCode,
        attempt: u32,
    },
    RecoveryFailed {
        strategy: String,
        code: ErrorCode,
        attempt: u32,
        reason: String,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AnalyticsRecord {
    #[serde(flatten)]
    pub event: AnalyticsEvent,
    pub timestamp: DateTime<Utc>,
}

/// The user slice of the application state
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct UserState {
    pub preferences: Preferences,
    pub permissions: Permissions,
    pub statistics: UsageStatistics,
    pub analytics: VecDeque<AnalyticsRecord>,
}

// ============================================================================
// Actions
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum UserAction {
    UpdatePreferences { preferences: PreferencesPatch },
    UpdatePermissions { permissions: PermissionsPatch },
    TrackEvent { event: AnalyticsEvent },
    GdprDelete,
}

/// Apply `action` to the slice. Returns whether anything changed.
pub fn reduce(state: &mut UserState, action: &UserAction, ctx: &ReduceContext) -> bool {
    match action {
        UserAction::UpdatePreferences { preferences } => {
            let before = state.preferences.clone();
            state.preferences.merge(preferences);
            state.preferences != before
        }

        UserAction::UpdatePermissions { permissions } => {
            let before = state.permissions;
            if let Some(status) = permissions.microphone {
                state.permissions.set(PermissionKind::Microphone, status);
            }
            if let Some(status) = permissions.notifications {
                state.permissions.set(PermissionKind::Notifications, status);
            }
            state.permissions != before
        }

        UserAction::TrackEvent { event } => {
            track(state, event, ctx.now);
            true
        }

        UserAction::GdprDelete => {
            tracing::info!("Erasing user data");
            *state = UserState::default();
            true
        }
    }
}

fn track(state: &mut UserState, event: &AnalyticsEvent, now: DateTime<Utc>) {
    let stats = &mut state.statistics;
    if let AnalyticsEvent::ConsultationCompleted { duration_ms, .. } = event {
        stats.total_consultations += 1;
        stats.total_duration_ms += duration_ms.max(&0);
        stats.average_session_length_ms =
            stats.total_duration_ms / stats.total_consultations as i64;
    }
    stats.last_activity = Some(now);

    push_bounded(
        &mut state.analytics,
        AnalyticsRecord {
            event: event.clone(),
            timestamp: now,
        },
        ANALYTICS_CAP,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SequentialIds;

    fn apply(state: &mut UserState, action: UserAction, now: DateTime<Utc>) -> bool {
        let ids = SequentialIds::default();
        let ctx = ReduceContext::new(now, &ids);
        reduce(state, &action, &ctx)
    }

    fn completed(duration_ms: i64) -> UserAction {
        UserAction::TrackEvent {
            event: AnalyticsEvent::ConsultationCompleted {
                consultation_id: "c".into(),
                duration_ms,
            },
        }
    }

    #[test]
    fn test_preferences_partial_merge() {
        let mut state = UserState::default();
        let now = Utc::now();
        assert!(apply(
            &mut state,
            UserAction::UpdatePreferences {
                preferences: PreferencesPatch {
                    transcription_service: Some(TranscriptionService::Local),
                    ..Default::default()
                },
            },
            now,
        ));
        assert_eq!(
            state.preferences.transcription_service,
            TranscriptionService::Local
        );
        assert_eq!(state.preferences.language, "en");
        assert!(state.preferences.auto_ai_suggestions);

        // Same values again is not a change
        assert!(!apply(
            &mut state,
            UserAction::UpdatePreferences {
                preferences: PreferencesPatch {
                    transcription_service: Some(TranscriptionService::Local),
                    ..Default::default()
                },
            },
            now,
        ));
    }

    #[test]
    fn test_permissions_merge() {
        let mut state = UserState::default();
        apply(
            &mut state,
            UserAction::UpdatePermissions {
                permissions: PermissionsPatch::single(
                    PermissionKind::Microphone,
                    PermissionStatus::Granted,
                ),
            },
            Utc::now(),
        );
        assert_eq!(state.permissions.microphone, PermissionStatus::Granted);
        assert_eq!(state.permissions.notifications, PermissionStatus::Prompt);
    }

    #[test]
    fn test_completion_updates_rolling_statistics() {
        let mut state = UserState::default();
        let now = Utc::now();
        apply(&mut state, completed(60_000), now);
        apply(&mut state, completed(120_000), now);
        apply(
            &mut state,
            UserAction::TrackEvent {
                event: AnalyticsEvent::Interaction {
                    name: "open_notes".into(),
                },
            },
            now,
        );

        let stats = &state.statistics;
        assert_eq!(stats.total_consultations, 2);
        assert_eq!(stats.total_duration_ms, 180_000);
        assert_eq!(stats.average_session_length_ms, 90_000);
        assert_eq!(stats.last_activity, Some(now));
        assert_eq!(state.analytics.len(), 3);
    }

    #[test]
    fn test_gdpr_delete_resets_everything() {
        let mut state = UserState::default();
        apply(&mut state, completed(1_000), Utc::now());
        state.permissions.microphone = PermissionStatus::Granted;
        state.preferences.language = "fr".into();

        apply(&mut state, UserAction::GdprDelete, Utc::now());
        assert_eq!(state, UserState::default());
        assert_eq!(state.statistics.total_consultations, 0);
        assert_eq!(state.permissions.microphone, PermissionStatus::Prompt);
    }

    #[test]
    fn test_analytics_record_flattens_event() {
        let record = AnalyticsRecord {
            event: AnalyticsEvent::RecoveryFailed {
                strategy: "network_retry".into(),
                code: ErrorCode::NetworkError,
                attempt: 2,
                reason: "timed out".into(),
            },
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["event"], "recovery_failed");
        assert_eq!(json["code"], "NETWORK_ERROR");
    }
}
