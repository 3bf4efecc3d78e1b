//! State container: composes the slice reducers behind a single dispatch.
//!
//! The container owns one `Arc<AppState>` snapshot. Dispatch swaps in a
//! copy-on-write successor under a short write lock, so readers holding an
//! older snapshot never observe a half-applied transition. Changed snapshots
//! are persisted through the storage adapter at most once per debounce window.

use crate::action::{Action, ActionPayload, ReduceContext};
use crate::clock::{Clock, IdGenerator, SystemClock, UuidGenerator};
use crate::consultation::{self, ConsultationAction, ConsultationState, EndReason};
use crate::storage::StorageAdapter;
use crate::system::{self, SystemAction, SystemState};
use crate::types::MedicalError;
use crate::user::{self, AnalyticsEvent, UserAction, UserState};
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Bumped whenever the persisted layout changes incompatibly
pub const SCHEMA_VERSION: u32 = 1;

const ERROR_CHANNEL_CAPACITY: usize = 64;

/// The whole application state tree
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AppState {
    pub consultation: ConsultationState,
    pub system: SystemState,
    pub user: UserState,
}

/// On-disk envelope around a snapshot
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistedState {
    pub schema_version: u32,
    pub saved_at: DateTime<Utc>,
    pub state: Arc<AppState>,
}

/// Route an action to the slice that owns it. Returns whether anything changed.
///
/// A completed consultation is also fed to the user slice as a
/// `ConsultationCompleted` analytics event.
pub fn reduce(state: &mut AppState, action: &Action, ctx: &ReduceContext) -> bool {
    match &action.payload {
        ActionPayload::Consultation(a) => {
            let changed = consultation::reduce(&mut state.consultation, a, ctx);
            if let (
                true,
                ConsultationAction::End {
                    id,
                    reason: EndReason::Completed,
                },
            ) = (changed, a)
            {
                if let Some(archived) = state.consultation.archived.get(id) {
                    let event = AnalyticsEvent::ConsultationCompleted {
                        consultation_id: id.clone(),
                        duration_ms: archived.session.duration_ms,
                    };
                    user::reduce(&mut state.user, &UserAction::TrackEvent { event }, ctx);
                }
            }
            changed
        }
        ActionPayload::System(a) => system::reduce(&mut state.system, a, ctx),
        ActionPayload::User(a) => user::reduce(&mut state.user, a, ctx),
    }
}

fn is_metrics_update(payload: &ActionPayload) -> bool {
    matches!(
        payload,
        ActionPayload::System(SystemAction::UpdatePerformanceMetrics { .. })
    )
}

fn last_notification_id(state: &AppState) -> Option<String> {
    state.system.notifications.last().map(|n| n.id.clone())
}

/// Turn a stored snapshot back into a live state
fn hydrate(persisted: PersistedState, now: DateTime<Utc>) -> AppState {
    let AppState {
        mut consultation,
        system,
        user,
    } = Arc::unwrap_or_clone(persisted.state);

    if let Some(ref id) = consultation.current_id {
        if !consultation.active.contains_key(id) {
            tracing::warn!("Stored current consultation {} is not active, clearing", id);
            consultation.current_id = None;
        }
    }

    AppState {
        consultation,
        system: system::rehydrate(system, now),
        user,
    }
}

/// What async collaborators may do with the container
///
/// Recovery strategies and the performance sampler never mutate state
/// directly; they read snapshots and dispatch further actions.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, payload: ActionPayload) -> bool;
    fn snapshot(&self) -> Arc<AppState>;
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Default)]
struct PersistTracker {
    last_saved_at: Option<DateTime<Utc>>,
    saved_revision: u64,
}

/// The application state container
pub struct Store {
    state: RwLock<Arc<AppState>>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    storage: Option<StorageAdapter>,
    persist_debounce: Duration,
    persistence: Mutex<PersistTracker>,
    revision: AtomicU64,
    /// Newest revision that changed something persisted
    durable_revision: AtomicU64,
    errors: broadcast::Sender<MedicalError>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock), Arc::new(UuidGenerator))
    }
}

impl Store {
    pub fn new(clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        let (errors, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(Arc::new(AppState::default())),
            clock,
            ids,
            storage: None,
            persist_debounce: Duration::zero(),
            persistence: Mutex::new(PersistTracker::default()),
            revision: AtomicU64::new(0),
            durable_revision: AtomicU64::new(0),
            errors,
        }
    }

    /// Attach persistence, rehydrating from whatever the adapter holds
    pub fn with_storage(mut self, storage: StorageAdapter, debounce: Duration) -> Self {
        match storage.load_state::<PersistedState>() {
            Some(persisted) if persisted.schema_version == SCHEMA_VERSION => {
                let now = self.clock.now();
                let state = hydrate(persisted, now);
                tracing::info!(
                    "Restored {} active and {} archived consultation(s)",
                    state.consultation.active.len(),
                    state.consultation.archived.len()
                );
                *self.state.get_mut() = Arc::new(state);
            }
            Some(persisted) => {
                tracing::warn!(
                    "Ignoring stored state with schema version {} (expected {})",
                    persisted.schema_version,
                    SCHEMA_VERSION
                );
            }
            None => {}
        }
        self.storage = Some(storage);
        self.persist_debounce = debounce;
        self
    }

    pub fn storage(&self) -> Option<&StorageAdapter> {
        self.storage.as_ref()
    }

    pub fn ids(&self) -> &dyn IdGenerator {
        self.ids.as_ref()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Current snapshot; never changes after it is handed out
    pub fn snapshot(&self) -> Arc<AppState> {
        Arc::clone(&self.state.read())
    }

    /// Number of applied (state-changing) actions since construction
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    /// Errors admitted into the system slice, in dispatch order
    pub fn subscribe_errors(&self) -> broadcast::Receiver<MedicalError> {
        self.errors.subscribe()
    }

    /// Stamp `payload` with the current time and dispatch it
    pub fn dispatch(&self, payload: impl Into<ActionPayload>) -> bool {
        self.dispatch_action(Action::new(payload, self.clock.now()))
    }

    /// Apply a fully formed action. Returns whether the state changed.
    pub fn dispatch_action(&self, action: Action) -> bool {
        let ctx = ReduceContext::new(action.timestamp, self.ids.as_ref());
        let (changed, durable) = {
            let mut guard = self.state.write();
            let state = Arc::make_mut(&mut *guard);
            // Sampled metrics are never persisted; a threshold notification is
            let before = is_metrics_update(&action.payload).then(|| last_notification_id(state));
            let changed = reduce(state, &action, &ctx);
            let durable = match before {
                Some(before) => last_notification_id(state) != before,
                None => true,
            };
            (changed, changed && durable)
        };

        if !changed {
            tracing::trace!("{} left state unchanged", action.payload.type_name());
            return false;
        }

        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!("Applied {} (revision {})", action.payload.type_name(), revision);

        if let ActionPayload::System(SystemAction::AddError { error }) = &action.payload {
            // No subscribers is fine; recovery may not be running
            let _ = self.errors.send(error.clone());
        }

        if durable {
            self.durable_revision.fetch_max(revision, Ordering::SeqCst);
            self.persist_if_due();
        }
        true
    }

    /// Whether there are applied changes not yet written to storage
    pub fn is_dirty(&self) -> bool {
        self.storage.is_some()
            && self.persistence.lock().saved_revision < self.durable_revision.load(Ordering::SeqCst)
    }

    /// Write the current snapshot now, ignoring the debounce window
    ///
    /// Returns false when there is no storage or the write failed.
    pub fn flush(&self) -> bool {
        let Some(storage) = &self.storage else {
            return false;
        };
        let mut tracker = self.persistence.lock();
        self.persist(storage, &mut tracker, self.clock.now())
    }

    fn persist_if_due(&self) {
        let Some(storage) = &self.storage else {
            return;
        };
        let now = self.clock.now();
        let mut tracker = self.persistence.lock();
        if let Some(last) = tracker.last_saved_at {
            if now - last < self.persist_debounce {
                return;
            }
        }
        // A writer that held the lock before us may already have saved this revision
        if tracker.saved_revision >= self.durable_revision.load(Ordering::SeqCst) {
            return;
        }
        self.persist(storage, &mut tracker, now);
    }

    /// Save the current snapshot. The tracker lock is held throughout, so
    /// saves land in revision order.
    fn persist(&self, storage: &StorageAdapter, tracker: &mut PersistTracker, now: DateTime<Utc>) -> bool {
        // Read before the snapshot: the snapshot is at least this new
        let revision = self.durable_revision.load(Ordering::SeqCst);
        let persisted = PersistedState {
            schema_version: SCHEMA_VERSION,
            saved_at: now,
            state: self.snapshot(),
        };
        if !storage.save_state(&persisted) {
            return false;
        }
        tracker.last_saved_at = Some(now);
        tracker.saved_revision = tracker.saved_revision.max(revision);
        true
    }

    /// Periodically flush pending changes until `cancel` fires, then flush once more
    pub fn spawn_autosave(
        self: &Arc<Self>,
        every: std::time::Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        if store.is_dirty() {
                            store.flush();
                        }
                        break;
                    }
                    _ = ticker.tick() => {
                        if store.is_dirty() {
                            store.flush();
                        }
                    }
                }
            }
            tracing::debug!("Autosave stopped");
        })
    }
}

impl Dispatcher for Store {
    fn dispatch(&self, payload: ActionPayload) -> bool {
        Store::dispatch(self, payload)
    }

    fn snapshot(&self) -> Arc<AppState> {
        Store::snapshot(self)
    }

    fn now(&self) -> DateTime<Utc> {
        Store::now(self)
    }
}
