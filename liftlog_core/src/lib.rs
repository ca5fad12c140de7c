#![forbid(unsafe_code)]

//! Core domain model and business logic for the Liftlog workout tracker.
//!
//! This crate provides:
//! - Domain types (sessions, sets, metrics, domain events)
//! - The live session state machine and its orchestrator
//! - Replay-based metrics and the adaptive rest calculator
//! - Offline-first persistence (durable event queue, snapshots, set logs)
//! - The sync reconciler and remote store boundary

pub mod types;
pub mod error;
pub mod config;
pub mod logging;
pub mod machine;
pub mod metrics;
pub mod rest;
pub mod queue;
pub mod remote;
pub mod reconciler;
pub mod store;
pub mod orchestrator;
pub mod archive;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;
pub use config::Config;
pub use machine::{apply, SessionEvent, SideEffect};
pub use metrics::CalorieModel;
pub use rest::{target_rest_seconds, FatigueEstimator, NeutralFatigue};
pub use queue::{EventQueue, QueueState};
pub use remote::{Connectivity, DirRemoteStore, RemoteResponse, RemoteStore};
pub use reconciler::{BackoffPolicy, ConnectivityChange, DrainReport, Reconciler};
pub use store::SessionStore;
pub use orchestrator::{Orchestrator, SyncIndicator};
