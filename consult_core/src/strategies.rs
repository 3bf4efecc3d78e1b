//! Built-in recovery strategies.

use crate::action::ActionPayload;
use crate::consultation::{ConsultationAction, EndReason};
use crate::platform::Platform;
use crate::recovery::RecoveryStrategy;
use crate::store::Dispatcher;
use crate::system::SystemAction;
use crate::types::{
    AiMode, ErrorCode, MedicalError, NotificationDraft, NotificationKind, PerformanceMode,
    PermissionKind, PermissionStatus, TranscriptionService,
};
use crate::user::{PermissionsPatch, PreferencesPatch, UserAction};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

fn notify(dispatcher: &dyn Dispatcher, draft: NotificationDraft) {
    dispatcher.dispatch(SystemAction::AddNotification { notification: draft }.into());
}

/// Active consultation an error is about: the one named in its context, else the current one
fn affected_consultation(error: &MedicalError, dispatcher: &dyn Dispatcher) -> Option<String> {
    let state = dispatcher.snapshot();
    let id = match error.context.consultation_id {
        Some(ref id) => id.clone(),
        None => state.consultation.current_id.clone()?,
    };
    state.consultation.active.contains_key(&id).then_some(id)
}

// ============================================================================
// network_retry
// ============================================================================

/// Wait for connectivity, then replay the action that failed
pub struct NetworkRetry {
    platform: Arc<dyn Platform>,
    timeout: Duration,
}

impl NetworkRetry {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(platform: Arc<dyn Platform>, timeout: Duration) -> Self {
        Self { platform, timeout }
    }
}

#[async_trait]
impl RecoveryStrategy for NetworkRetry {
    fn name(&self) -> &'static str {
        "network_retry"
    }

    fn applies_to(&self, error: &MedicalError) -> bool {
        matches!(error.code, ErrorCode::NetworkError | ErrorCode::ApiError)
    }

    fn max_attempts(&self) -> u32 {
        3
    }

    fn backoff(&self) -> Duration {
        Duration::from_millis(2000)
    }

    async fn recover(&self, error: &MedicalError, dispatcher: &dyn Dispatcher) -> Result<bool> {
        if !self.platform.is_online() {
            tracing::info!("Waiting up to {:?} for connectivity", self.timeout);
            tokio::time::timeout(self.timeout, self.platform.wait_for_online())
                .await
                .map_err(|_| Error::Timeout(self.timeout))?;
        }
        dispatcher.dispatch(SystemAction::SetOnline { online: true }.into());

        if let Some(ref original) = error.context.original_action {
            let replay: ActionPayload = (**original).clone();
            tracing::info!("Replaying {}", replay.type_name());
            dispatcher.dispatch(replay);
        }
        Ok(true)
    }
}

// ============================================================================
// transcription_fallback
// ============================================================================

/// Switch speech-to-text to the on-device engine
pub struct TranscriptionFallback;

#[async_trait]
impl RecoveryStrategy for TranscriptionFallback {
    fn name(&self) -> &'static str {
        "transcription_fallback"
    }

    fn applies_to(&self, error: &MedicalError) -> bool {
        error.code == ErrorCode::TranscriptionError
    }

    fn max_attempts(&self) -> u32 {
        1
    }

    fn backoff(&self) -> Duration {
        Duration::ZERO
    }

    async fn recover(&self, _error: &MedicalError, dispatcher: &dyn Dispatcher) -> Result<bool> {
        dispatcher.dispatch(
            UserAction::UpdatePreferences {
                preferences: PreferencesPatch {
                    transcription_service: Some(TranscriptionService::Local),
                    ..Default::default()
                },
            }
            .into(),
        );
        notify(
            dispatcher,
            NotificationDraft::info(
                "Switched to local transcription",
                "The cloud transcription service is unavailable. Transcription continues on this device.",
            ),
        );
        Ok(true)
    }
}

// ============================================================================
// ai_service_fallback
// ============================================================================

/// Drop the affected consultation to basic AI assistance
pub struct AiServiceFallback;

#[async_trait]
impl RecoveryStrategy for AiServiceFallback {
    fn name(&self) -> &'static str {
        "ai_service_fallback"
    }

    fn applies_to(&self, error: &MedicalError) -> bool {
        error.code == ErrorCode::AiError
    }

    fn max_attempts(&self) -> u32 {
        1
    }

    fn backoff(&self) -> Duration {
        Duration::ZERO
    }

    async fn recover(&self, error: &MedicalError, dispatcher: &dyn Dispatcher) -> Result<bool> {
        let Some(id) = affected_consultation(error, dispatcher) else {
            tracing::debug!("No active consultation to downgrade for {}", error.key());
            return Ok(false);
        };

        dispatcher.dispatch(
            ConsultationAction::SetAiMode {
                id: id.clone(),
                mode: AiMode::Basic,
            }
            .into(),
        );
        dispatcher.dispatch(
            ConsultationAction::SetThinking {
                id,
                thinking: false,
            }
            .into(),
        );
        notify(
            dispatcher,
            NotificationDraft::warning(
                "AI assistance reduced",
                "The AI service is degraded. Suggestions switched to basic mode.",
            ),
        );
        Ok(true)
    }
}

// ============================================================================
// storage_cleanup
// ============================================================================

/// Free space: clear the cache and archive stale consultations
pub struct StorageCleanup {
    stale_after: chrono::Duration,
}

impl StorageCleanup {
    pub fn new(stale_after: chrono::Duration) -> Self {
        Self { stale_after }
    }
}

#[async_trait]
impl RecoveryStrategy for StorageCleanup {
    fn name(&self) -> &'static str {
        "storage_cleanup"
    }

    fn applies_to(&self, error: &MedicalError) -> bool {
        error.code == ErrorCode::StorageError
    }

    fn max_attempts(&self) -> u32 {
        1
    }

    fn backoff(&self) -> Duration {
        Duration::ZERO
    }

    async fn recover(&self, _error: &MedicalError, dispatcher: &dyn Dispatcher) -> Result<bool> {
        dispatcher.dispatch(SystemAction::CleanCache { force: true }.into());

        let cutoff = dispatcher.now() - self.stale_after;
        let stale: Vec<String> = dispatcher
            .snapshot()
            .consultation
            .active
            .values()
            .filter(|c| c.metadata.created_at < cutoff)
            .map(|c| c.id.clone())
            .collect();

        for id in &stale {
            dispatcher.dispatch(
                ConsultationAction::End {
                    id: id.clone(),
                    reason: EndReason::Archived,
                }
                .into(),
            );
        }
        tracing::info!("Storage cleanup archived {} stale consultation(s)", stale.len());
        Ok(true)
    }
}

// ============================================================================
// permission_request
// ============================================================================

/// Prompt again for the permission that was refused
pub struct PermissionRequest {
    platform: Arc<dyn Platform>,
}

impl PermissionRequest {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self { platform }
    }
}

#[async_trait]
impl RecoveryStrategy for PermissionRequest {
    fn name(&self) -> &'static str {
        "permission_request"
    }

    fn applies_to(&self, error: &MedicalError) -> bool {
        error.code == ErrorCode::PermissionError
    }

    fn max_attempts(&self) -> u32 {
        2
    }

    fn backoff(&self) -> Duration {
        Duration::from_millis(1000)
    }

    async fn recover(&self, error: &MedicalError, dispatcher: &dyn Dispatcher) -> Result<bool> {
        let kind = error.context.permission.unwrap_or(PermissionKind::Microphone);
        let status = self.platform.request_permission(kind).await;
        dispatcher.dispatch(
            UserAction::UpdatePermissions {
                permissions: PermissionsPatch::single(kind, status),
            }
            .into(),
        );
        Ok(status == PermissionStatus::Granted)
    }
}

// ============================================================================
// memory_pressure_relief
// ============================================================================

/// Shed memory: battery saver mode, empty cache, drop cached AI messages
pub struct MemoryPressureRelief;

#[async_trait]
impl RecoveryStrategy for MemoryPressureRelief {
    fn name(&self) -> &'static str {
        "memory_pressure_relief"
    }

    fn applies_to(&self, error: &MedicalError) -> bool {
        error.context.memory_pressure
    }

    fn max_attempts(&self) -> u32 {
        1
    }

    fn backoff(&self) -> Duration {
        Duration::ZERO
    }

    async fn recover(&self, error: &MedicalError, dispatcher: &dyn Dispatcher) -> Result<bool> {
        dispatcher.dispatch(
            SystemAction::SetPerformanceMode {
                mode: PerformanceMode::BatterySaver,
            }
            .into(),
        );
        dispatcher.dispatch(SystemAction::CleanCache { force: true }.into());
        if let Some(id) = affected_consultation(error, dispatcher) {
            dispatcher.dispatch(ConsultationAction::ClearAiMessages { id }.into());
        }
        notify(
            dispatcher,
            NotificationDraft::new(
                NotificationKind::Info,
                "Battery saver enabled",
                "Memory was running low. Cached data was released to keep the consultation responsive.",
            ),
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SequentialIds;
    use crate::platform::SimulatedPlatform;
    use crate::store::Store;
    use crate::types::Severity;
    use chrono::Utc;

    fn err(code: ErrorCode) -> MedicalError {
        MedicalError::new("e", code, Severity::Medium, "failure", Utc::now())
    }

    #[test]
    fn test_applicability_matches_codes() {
        let platform: Arc<dyn Platform> = Arc::new(SimulatedPlatform::new());
        let network = NetworkRetry::new(platform.clone(), NetworkRetry::DEFAULT_TIMEOUT);
        assert!(network.applies_to(&err(ErrorCode::NetworkError)));
        assert!(network.applies_to(&err(ErrorCode::ApiError)));
        assert!(!network.applies_to(&err(ErrorCode::AiError)));

        let permission = PermissionRequest::new(platform);
        assert!(permission.applies_to(&err(ErrorCode::PermissionError)));
        assert_eq!(permission.max_attempts(), 2);
        assert_eq!(permission.backoff(), Duration::from_millis(1000));

        assert!(!MemoryPressureRelief.applies_to(&err(ErrorCode::AiError)));
        assert!(MemoryPressureRelief.applies_to(&err(ErrorCode::AiError).with_memory_pressure()));
    }

    #[tokio::test]
    async fn test_ai_fallback_uses_current_consultation() {
        let store = Store::new(Arc::new(crate::clock::SystemClock), Arc::new(SequentialIds::default()));
        store.dispatch(ConsultationAction::Start {
            id: "c1".into(),
            patient: None,
            ai_mode: None,
        });
        store.dispatch(ConsultationAction::SetThinking {
            id: "c1".into(),
            thinking: true,
        });

        assert!(AiServiceFallback
            .recover(&err(ErrorCode::AiError), &store)
            .await
            .unwrap());
        let state = store.snapshot();
        let c = state.consultation.get("c1").unwrap();
        assert_eq!(c.ai.mode, AiMode::Basic);
        assert!(!c.ai.is_thinking);
    }

    #[tokio::test]
    async fn test_network_retry_online_succeeds_immediately() {
        let store = Store::default();
        let platform = Arc::new(SimulatedPlatform::new());
        let strategy = NetworkRetry::new(platform, Duration::from_millis(10));
        assert!(strategy
            .recover(&err(ErrorCode::ApiError), &store)
            .await
            .unwrap());
    }
}
