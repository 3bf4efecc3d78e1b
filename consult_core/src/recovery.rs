//! Error recovery engine.
//!
//! Errors are matched against an ordered table of strategies. Each strategy
//! gets a bounded number of attempts per error key (`code:message`) with
//! exponential backoff between them. Outcomes are reported as analytics
//! events; nothing a strategy does can make the engine itself fail.

use crate::config::RecoveryConfig;
use crate::performance::{PerformanceMonitor, PerformanceWarning};
use crate::platform::Platform;
use crate::store::{Dispatcher, Store};
use crate::strategies;
use crate::system::{error_title, SystemAction};
use crate::types::{push_bounded, MedicalError, NotificationDraft, Severity};
use crate::user::{AnalyticsEvent, UserAction};
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const CLAIMED_CAP: usize = 256;

/// A named, bounded-retry remediation for one class of error
#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn applies_to(&self, error: &MedicalError) -> bool;

    fn max_attempts(&self) -> u32;

    /// Delay before the second attempt; doubles for each attempt after that
    fn backoff(&self) -> Duration;

    /// Try to remediate. `Ok(false)` means the attempt ran but did not help.
    async fn recover(&self, error: &MedicalError, dispatcher: &dyn Dispatcher) -> Result<bool>;
}

/// Delay before the attempt that follows `prior` attempts
///
/// No delay for the first attempt, then `base`, `2 * base`, `4 * base`...
pub fn backoff_delay(base: Duration, prior: u32) -> Duration {
    if prior == 0 {
        return Duration::ZERO;
    }
    let factor = 1u32.checked_shl(prior - 1).unwrap_or(u32::MAX);
    base.saturating_mul(factor)
}

/// Where one recovery attempt left an error key
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Recovered,
    /// Failed, with attempts left
    Retry,
    /// The last allowed attempt failed
    Exhausted,
    /// Not attempted; the key was already exhausted
    Refused,
    /// No registered strategy applies
    Unhandled,
}

#[derive(Default)]
struct AttemptTable {
    counts: HashMap<String, u32>,
    /// Keys whose last allowed attempt failed; the next call is refused once
    exhausted: HashSet<String>,
}

pub struct ErrorRecoveryEngine {
    strategies: Vec<Box<dyn RecoveryStrategy>>,
    attempts: Mutex<AttemptTable>,
    /// Ids of errors some caller is already handling
    claimed: Mutex<VecDeque<String>>,
}

impl Default for ErrorRecoveryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorRecoveryEngine {
    /// Engine with an empty strategy table
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
            attempts: Mutex::new(AttemptTable::default()),
            claimed: Mutex::new(VecDeque::new()),
        }
    }

    /// Engine with the built-in strategies, memory relief first
    pub fn with_defaults(platform: Arc<dyn Platform>, config: &RecoveryConfig) -> Self {
        let mut engine = Self::new();
        engine.register(Box::new(strategies::MemoryPressureRelief));
        engine.register(Box::new(strategies::NetworkRetry::new(
            platform.clone(),
            config.network_timeout(),
        )));
        engine.register(Box::new(strategies::TranscriptionFallback));
        engine.register(Box::new(strategies::AiServiceFallback));
        engine.register(Box::new(strategies::StorageCleanup::new(
            config.stale_consultation_age(),
        )));
        engine.register(Box::new(strategies::PermissionRequest::new(platform)));
        engine
    }

    /// Append a strategy; earlier registrations win when several apply
    pub fn register(&mut self, strategy: Box<dyn RecoveryStrategy>) {
        tracing::debug!("Registered recovery strategy {}", strategy.name());
        self.strategies.push(strategy);
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Name of the strategy that would handle `error`
    pub fn strategy_for(&self, error: &MedicalError) -> Option<&'static str> {
        self.find(error).map(|s| s.name())
    }

    /// Attempts recorded so far for an error key
    pub fn attempts(&self, key: &str) -> u32 {
        self.attempts.lock().counts.get(key).copied().unwrap_or(0)
    }

    fn find(&self, error: &MedicalError) -> Option<&dyn RecoveryStrategy> {
        self.strategies
            .iter()
            .find(|s| s.applies_to(error))
            .map(|s| &**s)
    }

    /// Run the matching strategy once. Returns whether the error was remediated.
    pub async fn recover_from_error(&self, error: &MedicalError, dispatcher: &dyn Dispatcher) -> bool {
        self.attempt(error, dispatcher).await == RecoveryOutcome::Recovered
    }

    /// Run the matching strategy once and say where that leaves the error key
    pub async fn attempt(&self, error: &MedicalError, dispatcher: &dyn Dispatcher) -> RecoveryOutcome {
        let key = error.key();
        let Some(strategy) = self.find(error) else {
            tracing::debug!("No recovery strategy for {}", key);
            return RecoveryOutcome::Unhandled;
        };
        let max_attempts = strategy.max_attempts();

        let prior = {
            let mut table = self.attempts.lock();
            if table.exhausted.remove(&key) {
                tracing::info!("Recovery for {} already exhausted, giving up", key);
                return RecoveryOutcome::Refused;
            }
            let prior = table.counts.get(&key).copied().unwrap_or(0);
            if prior >= max_attempts {
                table.counts.remove(&key);
                tracing::info!("Recovery attempts for {} exhausted", key);
                return RecoveryOutcome::Refused;
            }
            table.counts.insert(key.clone(), prior + 1);
            prior
        };
        let attempt = prior + 1;

        let delay = backoff_delay(strategy.backoff(), prior);
        if !delay.is_zero() {
            tracing::debug!("Backing off {:?} before attempt {} for {}", delay, attempt, key);
            tokio::time::sleep(delay).await;
        }

        tracing::info!(
            strategy = strategy.name(),
            attempt,
            max_attempts,
            "Recovering from {}",
            key
        );

        let reason = match strategy.recover(error, dispatcher).await {
            Ok(true) => {
                self.attempts.lock().counts.remove(&key);
                tracing::info!("Recovered from {} via {}", key, strategy.name());
                dispatcher.dispatch(
                    UserAction::TrackEvent {
                        event: AnalyticsEvent::RecoverySucceeded {
                            strategy: strategy.name().to_string(),
                            code: error.code,
                            attempt,
                        },
                    }
                    .into(),
                );
                return RecoveryOutcome::Recovered;
            }
            Ok(false) => "strategy reported no improvement".to_string(),
            Err(e) => e.to_string(),
        };

        let exhausted = attempt >= max_attempts;
        if exhausted {
            let mut table = self.attempts.lock();
            table.counts.remove(&key);
            table.exhausted.insert(key.clone());
        }
        tracing::warn!(
            strategy = strategy.name(),
            attempt,
            "Recovery from {} failed: {}",
            key,
            reason
        );
        dispatcher.dispatch(
            UserAction::TrackEvent {
                event: AnalyticsEvent::RecoveryFailed {
                    strategy: strategy.name().to_string(),
                    code: error.code,
                    attempt,
                    reason,
                },
            }
            .into(),
        );
        if exhausted {
            RecoveryOutcome::Exhausted
        } else {
            RecoveryOutcome::Retry
        }
    }

    /// Record `error` and make one recovery attempt for it
    ///
    /// Returns whether the error was remediated. A repeat that the error list
    /// drops still gets the next attempt from the strategy's budget, so
    /// reporting the same failure again is how a caller retries. The user is
    /// told once the budget runs out or when nothing can handle the error.
    pub async fn report(&self, error: MedicalError, dispatcher: &dyn Dispatcher) -> bool {
        let fresh = self.record(&error, dispatcher);
        self.handle(&error, fresh, false, dispatcher).await
    }

    /// Like [`report`](Self::report), but keep retrying until the error is
    /// remediated or the strategy's attempts are spent
    pub async fn resolve(&self, error: MedicalError, dispatcher: &dyn Dispatcher) -> bool {
        let fresh = self.record(&error, dispatcher);
        self.handle(&error, fresh, true, dispatcher).await
    }

    /// Claim the error and add it to the error list. Returns whether the list kept it.
    fn record(&self, error: &MedicalError, dispatcher: &dyn Dispatcher) -> bool {
        // Claimed before dispatch so a running listener leaves it alone
        self.claim(&error.id);
        let fresh = dispatcher.dispatch(SystemAction::AddError { error: error.clone() }.into());
        if !fresh {
            tracing::debug!("Error {} is a repeat, continuing its recovery", error.key());
        }
        fresh
    }

    /// Mark an error id as taken. False if someone already handles it.
    fn claim(&self, id: &str) -> bool {
        let mut claimed = self.claimed.lock();
        if claimed.iter().any(|c| c == id) {
            return false;
        }
        push_bounded(&mut claimed, id.to_string(), CLAIMED_CAP);
        true
    }

    async fn handle(
        &self,
        error: &MedicalError,
        fresh: bool,
        retry: bool,
        dispatcher: &dyn Dispatcher,
    ) -> bool {
        if !error.recoverable {
            if fresh {
                surface(error, dispatcher);
            }
            return false;
        }
        loop {
            match self.attempt(error, dispatcher).await {
                RecoveryOutcome::Recovered => return true,
                RecoveryOutcome::Retry if retry => continue,
                RecoveryOutcome::Retry | RecoveryOutcome::Refused => return false,
                RecoveryOutcome::Exhausted => {
                    surface(error, dispatcher);
                    return false;
                }
                RecoveryOutcome::Unhandled => {
                    if fresh {
                        surface(error, dispatcher);
                    }
                    return false;
                }
            }
        }
    }

    /// Report a high-memory warning as a memory-pressure error
    ///
    /// Other warnings carry nothing to remediate and return false.
    pub async fn relieve(&self, warning: &PerformanceWarning, store: &Store) -> bool {
        let PerformanceWarning::HighMemory { usage_mb, limit_mb } = *warning else {
            return false;
        };
        let mut error = MedicalError::memory_pressure(
            store.ids().next_id(),
            usage_mb,
            limit_mb,
            store.now(),
        );
        if let Some(id) = store.snapshot().consultation.current_id.clone() {
            error = error.with_consultation(id);
        }
        self.report(error, store).await
    }

    /// Recover every error the store admits, each on its own task
    ///
    /// Each task retries until the error is remediated or its budget is
    /// spent. Errors already taken by [`report`](Self::report) or
    /// [`resolve`](Self::resolve) on this engine are skipped.
    pub fn spawn(self: &Arc<Self>, store: Arc<Store>, cancel: CancellationToken) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let mut errors = store.subscribe_errors();
        tokio::spawn(async move {
            loop {
                let error = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = errors.recv() => match received {
                        Ok(error) => error,
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!("Recovery fell behind, skipped {} error(s)", skipped);
                            continue;
                        }
                        Err(RecvError::Closed) => break,
                    },
                };
                if !engine.claim(&error.id) {
                    continue;
                }

                let engine = Arc::clone(&engine);
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    engine.handle(&error, true, true, store.as_ref()).await;
                });
            }
            tracing::debug!("Recovery listener stopped");
        })
    }

    /// Feed the monitor's high-memory warnings to [`relieve`](Self::relieve)
    pub fn watch_performance(
        self: &Arc<Self>,
        monitor: &PerformanceMonitor,
        store: Arc<Store>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let mut warnings = monitor.subscribe();
        tokio::spawn(async move {
            loop {
                let warning = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = warnings.recv() => match received {
                        Ok(warning) => warning,
                        Err(RecvError::Lagged(_)) => continue,
                        Err(RecvError::Closed) => break,
                    },
                };
                engine.relieve(&warning, &store).await;
            }
            tracing::debug!("Performance watch stopped");
        })
    }
}

/// Notify about an error nobody could fix
///
/// High and critical errors were already announced when they were recorded.
fn surface(error: &MedicalError, dispatcher: &dyn Dispatcher) {
    if error.severity >= Severity::High {
        return;
    }
    dispatcher.dispatch(
        SystemAction::AddNotification {
            notification: NotificationDraft::error(error_title(error.code), error.message.clone()),
        }
        .into(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SequentialIds};
    use crate::config::RecoveryConfig;
    use crate::consultation::{AiMessageDraft, ConsultationAction, EndReason};
    use crate::platform::SimulatedPlatform;
    use crate::store::Store;
    use crate::types::{
        AiMode, ErrorCode, PerformanceMode, PermissionKind, PermissionStatus, TranscriptionService,
    };
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn store() -> (Arc<Store>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Store::new(clock.clone(), Arc::new(SequentialIds::new("t")));
        (Arc::new(store), clock)
    }

    fn error(store: &Store, code: ErrorCode, message: &str) -> MedicalError {
        MedicalError::new(store.ids().next_id(), code, Severity::Medium, message, store.now())
    }

    fn engine(platform: Arc<SimulatedPlatform>) -> ErrorRecoveryEngine {
        ErrorRecoveryEngine::with_defaults(platform, &RecoveryConfig::default())
    }

    /// Counts invocations and answers from a fixed script
    struct Scripted {
        calls: Arc<AtomicU32>,
        answers: Vec<bool>,
        max_attempts: u32,
        backoff: Duration,
    }

    #[async_trait]
    impl RecoveryStrategy for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }
        fn applies_to(&self, _error: &MedicalError) -> bool {
            true
        }
        fn max_attempts(&self) -> u32 {
            self.max_attempts
        }
        fn backoff(&self) -> Duration {
            self.backoff
        }
        async fn recover(&self, _error: &MedicalError, _d: &dyn Dispatcher) -> Result<bool> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            Ok(self.answers.get(n).copied().unwrap_or(false))
        }
    }

    fn scripted(answers: Vec<bool>, max_attempts: u32, backoff: Duration) -> (ErrorRecoveryEngine, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let mut engine = ErrorRecoveryEngine::new();
        engine.register(Box::new(Scripted {
            calls: calls.clone(),
            answers,
            max_attempts,
            backoff,
        }));
        (engine, calls)
    }

    #[test]
    fn test_backoff_delay_doubles() {
        let base = Duration::from_millis(2000);
        assert_eq!(backoff_delay(base, 0), Duration::ZERO);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(2000));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(4000));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(8000));
        assert_eq!(backoff_delay(Duration::ZERO, 5), Duration::ZERO);
        // Saturates instead of overflowing
        assert!(backoff_delay(base, 64) >= Duration::from_secs(u32::MAX as u64));
    }

    #[test]
    fn test_default_registration_order() {
        let engine = engine(Arc::new(SimulatedPlatform::new()));
        assert_eq!(
            engine.strategy_names(),
            vec![
                "memory_pressure_relief",
                "network_retry",
                "transcription_fallback",
                "ai_service_fallback",
                "storage_cleanup",
                "permission_request",
            ]
        );
    }

    #[test]
    fn test_memory_pressure_wins_over_code_match() {
        let (store, _) = store();
        let engine = engine(Arc::new(SimulatedPlatform::new()));
        let err = error(&store, ErrorCode::StorageError, "quota").with_memory_pressure();
        assert_eq!(engine.strategy_for(&err), Some("memory_pressure_relief"));
        let err = error(&store, ErrorCode::MedicalValidationError, "bad dose");
        assert_eq!(engine.strategy_for(&err), None);
    }

    #[tokio::test]
    async fn test_no_strategy_is_failure() {
        let (store, _) = store();
        let engine = ErrorRecoveryEngine::new();
        let err = error(&store, ErrorCode::NetworkError, "offline");
        assert!(!engine.recover_from_error(&err, store.as_ref()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_cap_refuses_without_invoking() {
        let (store, _) = store();
        let (engine, calls) = scripted(vec![false, false, false], 3, Duration::ZERO);
        let err = error(&store, ErrorCode::NetworkError, "offline");

        for expected in 1..=3 {
            assert!(!engine.recover_from_error(&err, store.as_ref()).await);
            assert_eq!(calls.load(Ordering::SeqCst), expected);
        }
        assert_eq!(engine.attempts(&err.key()), 0);

        // Fourth call is refused outright
        assert!(!engine.recover_from_error(&err, store.as_ref()).await);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // After the refusal the key starts over
        assert!(!engine.recover_from_error(&err, store.as_ref()).await);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_counter_never_exceeds_max() {
        let (store, _) = store();
        let (engine, _) = scripted(vec![], 2, Duration::ZERO);
        let err = error(&store, ErrorCode::ApiError, "502");

        engine.recover_from_error(&err, store.as_ref()).await;
        assert_eq!(engine.attempts(&err.key()), 1);
        engine.recover_from_error(&err, store.as_ref()).await;
        assert!(engine.attempts(&err.key()) <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_before_each_retry() {
        let (store, _) = store();
        let (engine, calls) = scripted(vec![false, false, true], 3, Duration::from_millis(2000));
        let err = error(&store, ErrorCode::NetworkError, "offline");

        let started = tokio::time::Instant::now();
        assert!(!engine.recover_from_error(&err, store.as_ref()).await);
        assert_eq!(started.elapsed(), Duration::ZERO);

        let started = tokio::time::Instant::now();
        assert!(!engine.recover_from_error(&err, store.as_ref()).await);
        assert_eq!(started.elapsed(), Duration::from_millis(2000));

        let started = tokio::time::Instant::now();
        assert!(engine.recover_from_error(&err, store.as_ref()).await);
        assert_eq!(started.elapsed(), Duration::from_millis(4000));

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(engine.attempts(&err.key()), 0);
    }

    #[tokio::test]
    async fn test_outcomes_are_tracked_as_analytics() {
        let (store, _) = store();
        let (engine, _) = scripted(vec![false, true], 2, Duration::ZERO);
        let err = error(&store, ErrorCode::TranscriptionError, "engine crashed");

        engine.recover_from_error(&err, store.as_ref()).await;
        engine.recover_from_error(&err, store.as_ref()).await;

        let events: Vec<_> = store
            .snapshot()
            .user
            .analytics
            .iter()
            .map(|r| r.event.clone())
            .collect();
        assert!(matches!(
            events[0],
            AnalyticsEvent::RecoveryFailed { attempt: 1, .. }
        ));
        assert!(matches!(
            events[1],
            AnalyticsEvent::RecoverySucceeded { attempt: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_storage_error_scenario() {
        let (store, clock) = store();
        let engine = engine(Arc::new(SimulatedPlatform::new()));

        store.dispatch(ConsultationAction::Start {
            id: "old".into(),
            patient: None,
            ai_mode: None,
        });
        clock.advance(chrono::Duration::days(8));
        store.dispatch(ConsultationAction::Start {
            id: "fresh".into(),
            patient: None,
            ai_mode: None,
        });
        store.dispatch(SystemAction::UpdateCacheMetrics {
            size_bytes: 50_000,
            hit_rate: 0.9,
        });

        let err = error(&store, ErrorCode::StorageError, "quota exceeded");
        assert!(engine.report(err.clone(), store.as_ref()).await);

        let state = store.snapshot();
        assert_eq!(state.system.cache.size_bytes, 0);
        assert!(state.system.cache.last_cleaned.is_some());
        assert!(state.consultation.archived.contains_key("old"));
        assert_eq!(state.consultation.archived["old"].reason, EndReason::Archived);
        assert!(state.consultation.active.contains_key("fresh"));
        assert_eq!(engine.attempts(&err.key()), 0);
        assert_eq!(state.system.errors.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_denied_twice_scenario() {
        let (store, _) = store();
        let platform = Arc::new(SimulatedPlatform::new());
        platform.script_permissions([PermissionStatus::Denied, PermissionStatus::Denied]);
        let engine = engine(platform.clone());

        let err = error(&store, ErrorCode::PermissionError, "microphone blocked")
            .with_permission(PermissionKind::Microphone);

        assert!(!engine.recover_from_error(&err, store.as_ref()).await);
        assert_eq!(engine.attempts(&err.key()), 1);

        let started = tokio::time::Instant::now();
        assert!(!engine.recover_from_error(&err, store.as_ref()).await);
        assert_eq!(started.elapsed(), Duration::from_millis(1000));
        assert_eq!(engine.attempts(&err.key()), 0);
        assert_eq!(platform.prompt_count(), 2);

        // Third call is refused without prompting again
        assert!(!engine.recover_from_error(&err, store.as_ref()).await);
        assert_eq!(platform.prompt_count(), 2);

        let state = store.snapshot();
        assert_eq!(state.user.permissions.microphone, PermissionStatus::Denied);
    }

    #[tokio::test]
    async fn test_permission_granted_updates_state() {
        let (store, _) = store();
        let platform = Arc::new(SimulatedPlatform::new());
        let engine = engine(platform);

        let err = error(&store, ErrorCode::PermissionError, "notifications blocked")
            .with_permission(PermissionKind::Notifications);
        assert!(engine.recover_from_error(&err, store.as_ref()).await);
        assert_eq!(
            store.snapshot().user.permissions.notifications,
            PermissionStatus::Granted
        );
    }

    #[tokio::test]
    async fn test_transcription_and_ai_fallbacks() {
        let (store, _) = store();
        let engine = engine(Arc::new(SimulatedPlatform::new()));
        store.dispatch(ConsultationAction::Start {
            id: "c1".into(),
            patient: None,
            ai_mode: Some(AiMode::Expert),
        });

        let err = error(&store, ErrorCode::TranscriptionError, "cloud engine down");
        assert!(engine.recover_from_error(&err, store.as_ref()).await);

        let err = error(&store, ErrorCode::AiError, "model overloaded").with_consultation("c1");
        assert!(engine.recover_from_error(&err, store.as_ref()).await);

        let state = store.snapshot();
        assert_eq!(
            state.user.preferences.transcription_service,
            TranscriptionService::Local
        );
        assert_eq!(state.consultation.get("c1").unwrap().ai.mode, AiMode::Basic);
        assert_eq!(state.system.notifications.len(), 2);
    }

    #[tokio::test]
    async fn test_ai_fallback_for_archived_consultation_is_noop() {
        let (store, _) = store();
        let engine = engine(Arc::new(SimulatedPlatform::new()));
        store.dispatch(ConsultationAction::Start {
            id: "c1".into(),
            patient: None,
            ai_mode: None,
        });
        store.dispatch(ConsultationAction::End {
            id: "c1".into(),
            reason: EndReason::Completed,
        });
        let revision = store.revision();

        let err = error(&store, ErrorCode::AiError, "late failure").with_consultation("c1");
        assert!(!engine.recover_from_error(&err, store.as_ref()).await);
        // Only the failure analytics event was recorded
        assert_eq!(store.revision(), revision + 1);
    }

    #[tokio::test]
    async fn test_memory_pressure_relief() {
        let (store, _) = store();
        let engine = engine(Arc::new(SimulatedPlatform::new()));
        store.dispatch(ConsultationAction::Start {
            id: "c1".into(),
            patient: None,
            ai_mode: None,
        });
        store.dispatch(ConsultationAction::AddAiMessage {
            id: "c1".into(),
            message: AiMessageDraft::suggestion("Consider a lipid panel"),
        });
        store.dispatch(SystemAction::UpdateCacheMetrics {
            size_bytes: 10_000,
            hit_rate: 0.5,
        });

        let err = error(&store, ErrorCode::AiError, "out of memory")
            .with_consultation("c1")
            .with_memory_pressure();
        assert!(engine.recover_from_error(&err, store.as_ref()).await);

        let state = store.snapshot();
        assert_eq!(state.system.performance_mode, PerformanceMode::BatterySaver);
        assert_eq!(state.system.cache.size_bytes, 0);
        assert!(state.consultation.get("c1").unwrap().ai.messages.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_retry_waits_then_replays_original_action() {
        let (store, _) = store();
        let platform = Arc::new(SimulatedPlatform::new());
        platform.set_online(false);
        let engine = Arc::new(engine(platform.clone()));
        store.dispatch(ConsultationAction::Start {
            id: "c1".into(),
            patient: None,
            ai_mode: None,
        });
        store.dispatch(SystemAction::SetOnline { online: false });

        let replay = ConsultationAction::AddAiMessage {
            id: "c1".into(),
            message: AiMessageDraft::suggestion("Check blood pressure"),
        };
        let err = error(&store, ErrorCode::NetworkError, "request failed")
            .with_original_action(replay.into());

        let task = {
            let engine = engine.clone();
            let store = store.clone();
            tokio::spawn(async move { engine.recover_from_error(&err, store.as_ref()).await })
        };
        tokio::time::sleep(Duration::from_secs(5)).await;
        platform.set_online(true);

        assert!(task.await.unwrap());
        let state = store.snapshot();
        assert!(state.system.is_online);
        assert_eq!(state.consultation.get("c1").unwrap().ai.messages.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_retry_times_out() {
        let (store, _) = store();
        let platform = Arc::new(SimulatedPlatform::new());
        platform.set_online(false);
        let engine = engine(platform);

        let err = error(&store, ErrorCode::NetworkError, "request failed");
        let started = tokio::time::Instant::now();
        assert!(!engine.recover_from_error(&err, store.as_ref()).await);
        assert_eq!(started.elapsed(), Duration::from_secs(30));

        let events = &store.snapshot().user.analytics;
        assert!(matches!(
            &events[0].event,
            AnalyticsEvent::RecoveryFailed { reason, .. } if reason.contains("Timed out")
        ));
    }

    #[tokio::test]
    async fn test_report_surfaces_unrecoverable_errors() {
        let (store, _) = store();
        let engine = engine(Arc::new(SimulatedPlatform::new()));

        let err = error(&store, ErrorCode::MedicalValidationError, "dose out of range");
        assert!(!err.recoverable);
        assert!(!engine.report(err.clone(), store.as_ref()).await);

        let state = store.snapshot();
        assert_eq!(state.system.errors.len(), 1);
        assert_eq!(state.system.notifications.len(), 1);
        assert_eq!(state.system.notifications[0].title, "Validation problem");

        // Repeat inside the dedup window is dropped
        let repeat = MedicalError { id: "again".into(), ..err };
        assert!(!engine.report(repeat, store.as_ref()).await);
        assert_eq!(store.snapshot().system.notifications.len(), 1);
    }

    #[tokio::test]
    async fn test_spawned_listener_recovers_admitted_errors() {
        let (store, _) = store();
        let engine = Arc::new(engine(Arc::new(SimulatedPlatform::new())));
        let cancel = CancellationToken::new();
        let handle = engine.spawn(store.clone(), cancel.clone());

        let err = error(&store, ErrorCode::TranscriptionError, "cloud engine down");
        store.dispatch(SystemAction::AddError { error: err });

        for _ in 0..50 {
            if store.snapshot().user.preferences.transcription_service == TranscriptionService::Local {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(
            store.snapshot().user.preferences.transcription_service,
            TranscriptionService::Local
        );

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_report_runs_next_attempt() {
        let (store, _) = store();
        let platform = Arc::new(SimulatedPlatform::new());
        platform.script_permissions([PermissionStatus::Denied, PermissionStatus::Granted]);
        let engine = engine(platform.clone());

        let err = error(&store, ErrorCode::PermissionError, "microphone blocked")
            .with_permission(PermissionKind::Microphone);
        assert!(!engine.report(err.clone(), store.as_ref()).await);
        assert_eq!(platform.prompt_count(), 1);
        // Budget not spent yet, so nothing is surfaced
        assert!(store.snapshot().system.notifications.is_empty());

        // Same failure again: dropped by the error list, retried by the engine
        let repeat = MedicalError {
            id: store.ids().next_id(),
            ..err.clone()
        };
        let started = tokio::time::Instant::now();
        assert!(engine.report(repeat, store.as_ref()).await);
        assert_eq!(started.elapsed(), Duration::from_millis(1000));
        assert_eq!(platform.prompt_count(), 2);

        let state = store.snapshot();
        assert_eq!(state.system.errors.len(), 1);
        assert_eq!(state.user.permissions.microphone, PermissionStatus::Granted);
        assert_eq!(engine.attempts(&err.key()), 0);
    }

    #[tokio::test]
    async fn test_report_notifies_once_budget_is_spent() {
        let (store, _) = store();
        let (engine, calls) = scripted(vec![false, false], 2, Duration::ZERO);
        let err = error(&store, ErrorCode::ApiError, "502 from upstream");

        assert!(!engine.report(err.clone(), store.as_ref()).await);
        assert!(store.snapshot().system.notifications.is_empty());

        let repeat = MedicalError {
            id: "again".into(),
            ..err
        };
        assert!(!engine.report(repeat, store.as_ref()).await);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let state = store.snapshot();
        assert_eq!(state.system.notifications.len(), 1);
        assert_eq!(state.system.notifications[0].title, "Service problem");
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_uses_whole_budget() {
        let (store, _) = store();
        let platform = Arc::new(SimulatedPlatform::new());
        platform.set_default_permission(PermissionStatus::Denied);
        let engine = engine(platform.clone());

        let err = error(&store, ErrorCode::PermissionError, "microphone blocked");
        let started = tokio::time::Instant::now();
        assert!(!engine.resolve(err, store.as_ref()).await);
        assert_eq!(started.elapsed(), Duration::from_millis(1000));
        assert_eq!(platform.prompt_count(), 2);
        assert_eq!(store.snapshot().system.notifications.len(), 1);
    }

    #[tokio::test]
    async fn test_listener_skips_errors_already_reported() {
        let (store, _) = store();
        let (engine, calls) = scripted(vec![true], 1, Duration::ZERO);
        let engine = Arc::new(engine);
        let cancel = CancellationToken::new();
        let handle = engine.spawn(store.clone(), cancel.clone());

        let err = error(&store, ErrorCode::TranscriptionError, "engine crashed");
        assert!(engine.report(err, store.as_ref()).await);
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(store.snapshot().system.notifications.is_empty());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_high_memory_sample_relieves_pressure() {
        use crate::config::PerformanceConfig;
        use crate::performance::PerformanceMonitor;

        let (store, _) = store();
        let platform = Arc::new(SimulatedPlatform::new());
        platform.set_memory_mb(Some(170.0));
        let engine = Arc::new(engine(platform.clone()));
        let monitor = PerformanceMonitor::new(platform, store.clone(), &PerformanceConfig::default());

        store.dispatch(ConsultationAction::Start {
            id: "c1".into(),
            patient: None,
            ai_mode: None,
        });
        store.dispatch(ConsultationAction::AddAiMessage {
            id: "c1".into(),
            message: AiMessageDraft::suggestion("Order an ECG"),
        });
        store.dispatch(SystemAction::UpdateCacheMetrics {
            size_bytes: 4_096,
            hit_rate: 0.7,
        });

        let cancel = CancellationToken::new();
        let watch = engine.watch_performance(&monitor, store.clone(), cancel.clone());
        monitor.sample().await;

        for _ in 0..50 {
            if store.snapshot().system.performance_mode == PerformanceMode::BatterySaver {
                break;
            }
            tokio::task::yield_now().await;
        }

        let state = store.snapshot();
        assert_eq!(state.system.performance_mode, PerformanceMode::BatterySaver);
        assert_eq!(state.system.cache.size_bytes, 0);
        assert!(state.consultation.get("c1").unwrap().ai.messages.is_empty());
        let recorded = state.system.errors.back().unwrap();
        assert!(recorded.context.memory_pressure);
        assert_eq!(recorded.context.consultation_id.as_deref(), Some("c1"));
        // The monitor now measures against the battery saver limit
        assert_eq!(monitor.thresholds().memory_limit_mb, 100.0);

        cancel.cancel();
        watch.await.unwrap();
    }

    #[tokio::test]
    async fn test_relieve_ignores_other_warnings() {
        let (store, _) = store();
        let engine = engine(Arc::new(SimulatedPlatform::new()));
        let warning = PerformanceWarning::SlowAiResponse {
            response_ms: 9000.0,
            threshold_ms: 5000.0,
        };
        assert!(!engine.relieve(&warning, &store).await);
        assert!(store.snapshot().system.errors.is_empty());
    }
}
