//! Editor instance orchestration.
//!
//! - `lifecycle`: start/stop with rollback, status, repositories
//! - `reconcile`: crash recovery and bulk kills
//! - `cleanup`: per-port user-data and log sweeping

mod cleanup;
mod lifecycle;
mod reconcile;
mod types;

pub use lifecycle::Orchestrator;

pub use types::{
    InstanceStatus, KillAllReport, KillOutcome, ManagedProcess, PoolStatus, ReconcileReport,
    StartOutcome, Status, StopOutcome,
};

pub use cleanup::sweep_port_artifacts;
