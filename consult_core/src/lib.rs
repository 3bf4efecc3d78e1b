#![forbid(unsafe_code)]

//! Core state model and resilience engine for clinical consultations.
//!
//! This crate provides:
//! - Domain types (consultations, errors, notifications, metrics)
//! - Pure reducers for the consultation, system and user slices
//! - The store: snapshots, dispatch, debounced persistence
//! - Error recovery strategies with bounded retries
//! - Performance monitoring and device-resource advice

pub mod types;
pub mod error;
pub mod action;
pub mod clock;
pub mod config;
pub mod logging;
pub mod consultation;
pub mod system;
pub mod user;
pub mod store;
pub mod selectors;
pub mod storage;
pub mod platform;
pub mod recovery;
pub mod strategies;
pub mod performance;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;
pub use action::{Action, ActionPayload, ReduceContext};
pub use clock::{Clock, IdGenerator, ManualClock, SequentialIds, SystemClock, UuidGenerator};
pub use config::Config;
pub use consultation::{ConsultationAction, EndReason};
pub use system::SystemAction;
pub use user::UserAction;
pub use store::{AppState, Dispatcher, Store};
pub use storage::{FileStore, KeyValueStore, MemoryStore, StorageAdapter};
pub use platform::{HostPlatform, Platform, SimulatedPlatform};
pub use recovery::{ErrorRecoveryEngine, RecoveryOutcome, RecoveryStrategy};
pub use performance::{PerformanceMonitor, PerformanceWarning};
