//! Platform port: host resources the monitor and recovery engine consult.
//!
//! Reducers never touch the platform. Only the performance monitor and the
//! recovery strategies read metrics or prompt for permissions through it.

use crate::types::{PermissionKind, PermissionStatus, StorageEstimate};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::sync::watch;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[async_trait]
pub trait Platform: Send + Sync {
    /// Resident memory of this process in MB, when the platform exposes it
    async fn memory_usage_mb(&self) -> Option<f64>;

    async fn storage_estimate(&self) -> Option<StorageEstimate>;

    fn is_online(&self) -> bool;

    /// Resolve once connectivity is available
    async fn wait_for_online(&self);

    /// Prompt for `kind` and report the answer
    async fn request_permission(&self, kind: PermissionKind) -> PermissionStatus;

    fn is_mobile(&self) -> bool;
}

/// Connectivity flag that async waiters can park on
struct OnlineSignal {
    tx: watch::Sender<bool>,
}

impl OnlineSignal {
    fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx }
    }

    fn get(&self) -> bool {
        *self.tx.borrow()
    }

    fn set(&self, online: bool) {
        self.tx.send_replace(online);
    }

    async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so the wait cannot fail
        let _ = rx.wait_for(|online| *online).await;
    }
}

// ============================================================================
// Host platform
// ============================================================================

/// Desktop host: process memory from sysinfo, disk space from fs2
///
/// Desktop builds have no permission prompts, so every request is granted.
pub struct HostPlatform {
    data_dir: PathBuf,
    online: OnlineSignal,
}

impl HostPlatform {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            online: OnlineSignal::new(true),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.set(online);
    }
}

fn process_memory_mb() -> Option<f64> {
    let pid = sysinfo::get_current_pid().ok()?;
    let mut sys = System::new();
    sys.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::new().with_memory(),
    );
    let bytes = sys.process(pid)?.memory();
    Some(bytes as f64 / BYTES_PER_MB)
}

#[async_trait]
impl Platform for HostPlatform {
    async fn memory_usage_mb(&self) -> Option<f64> {
        match tokio::task::spawn_blocking(process_memory_mb).await {
            Ok(reading) => reading,
            Err(e) => {
                tracing::warn!("Memory sampling task failed: {}", e);
                None
            }
        }
    }

    async fn storage_estimate(&self) -> Option<StorageEstimate> {
        let dir = self.data_dir.clone();
        let reading = tokio::task::spawn_blocking(move || {
            let probe = if dir.exists() { dir.clone() } else { dir.parent()?.to_path_buf() };
            let available = fs2::available_space(&probe).ok()?;
            let used = std::fs::read_dir(&dir)
                .map(|entries| {
                    entries
                        .filter_map(|e| e.ok())
                        .filter_map(|e| e.metadata().ok())
                        .filter(|m| m.is_file())
                        .map(|m| m.len())
                        .sum::<u64>()
                })
                .unwrap_or(0);
            Some(StorageEstimate { used, available })
        })
        .await;
        reading.ok().flatten()
    }

    fn is_online(&self) -> bool {
        self.online.get()
    }

    async fn wait_for_online(&self) {
        self.online.wait().await
    }

    async fn request_permission(&self, kind: PermissionKind) -> PermissionStatus {
        tracing::debug!("Granting {:?} on desktop host", kind);
        PermissionStatus::Granted
    }

    fn is_mobile(&self) -> bool {
        false
    }
}

// ============================================================================
// Simulated platform
// ============================================================================

/// Scriptable platform for tests and dry runs
pub struct SimulatedPlatform {
    memory_mb: Mutex<Option<f64>>,
    storage: Mutex<Option<StorageEstimate>>,
    online: OnlineSignal,
    answers: Mutex<VecDeque<PermissionStatus>>,
    default_answer: Mutex<PermissionStatus>,
    prompts: AtomicU32,
    mobile: AtomicBool,
}

impl Default for SimulatedPlatform {
    fn default() -> Self {
        Self {
            memory_mb: Mutex::new(None),
            storage: Mutex::new(None),
            online: OnlineSignal::new(true),
            answers: Mutex::new(VecDeque::new()),
            default_answer: Mutex::new(PermissionStatus::Granted),
            prompts: AtomicU32::new(0),
            mobile: AtomicBool::new(false),
        }
    }
}

impl SimulatedPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_memory_mb(&self, mb: Option<f64>) {
        *self.memory_mb.lock() = mb;
    }

    pub fn set_storage(&self, estimate: Option<StorageEstimate>) {
        *self.storage.lock() = estimate;
    }

    pub fn set_online(&self, online: bool) {
        self.online.set(online);
    }

    pub fn set_mobile(&self, mobile: bool) {
        self.mobile.store(mobile, Ordering::SeqCst);
    }

    /// Queue answers for the next permission prompts, in order
    pub fn script_permissions(&self, answers: impl IntoIterator<Item = PermissionStatus>) {
        self.answers.lock().extend(answers);
    }

    /// Answer given once the scripted queue runs dry
    pub fn set_default_permission(&self, status: PermissionStatus) {
        *self.default_answer.lock() = status;
    }

    /// Number of permission prompts shown so far
    pub fn prompt_count(&self) -> u32 {
        self.prompts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Platform for SimulatedPlatform {
    async fn memory_usage_mb(&self) -> Option<f64> {
        *self.memory_mb.lock()
    }

    async fn storage_estimate(&self) -> Option<StorageEstimate> {
        *self.storage.lock()
    }

    fn is_online(&self) -> bool {
        self.online.get()
    }

    async fn wait_for_online(&self) {
        self.online.wait().await
    }

    async fn request_permission(&self, kind: PermissionKind) -> PermissionStatus {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        let answer = self
            .answers
            .lock()
            .pop_front()
            .unwrap_or(*self.default_answer.lock());
        tracing::debug!("Simulated {:?} prompt answered {:?}", kind, answer);
        answer
    }

    fn is_mobile(&self) -> bool {
        self.mobile.load(Ordering::SeqCst)
    }
}
