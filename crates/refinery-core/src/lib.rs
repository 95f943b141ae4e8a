//! Refinery-core - Merge queue coordination engine
//!
//! This crate provides:
//! - A file-backed merge request store with priority ordering
//! - Lease-based claims that give workers mutual exclusion without a lock server
//! - Speculative conflict detection against a version control backend
//! - An append-only event log
//! - The refinery engine that drives merge requests to their target branch

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]
#![allow(clippy::module_name_repetitions)]

pub mod claim;
pub mod config;
pub mod conflict;
pub mod engine;
pub mod error;
pub mod events;
pub mod gate;
pub mod git;
pub mod mr;
pub mod queue;
pub mod status;
pub mod store;
pub mod tracker;
pub mod vcs;

pub use claim::ClaimManager;
pub use config::RefineryConfig;
pub use conflict::{check_conflicts, TreeState};
pub use engine::{CycleOutcome, EngineSettings, FailureKind, Refinery, RunSummary};
pub use error::{Error, Result};
pub use events::{EventLog, EventRecord, EventType};
pub use gate::{CommandGate, GateVerdict, MergeGate, PassGate};
pub use git::GitCli;
pub use mr::{Claim, CloseReason, MergeRequest, MrId, MrStatus, Submission};
pub use queue::{build_queue, QueueItem};
pub use status::{EngineState, EngineStatus, StatusBoard};
pub use store::MrStore;
pub use tracker::{CommandTracker, IssueTracker, NullTracker};
pub use vcs::{CommandOutput, MergeOptions, VcsBackend};
