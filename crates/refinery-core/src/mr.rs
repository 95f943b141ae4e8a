//! Merge request data model

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Lease duration after which a claim is considered abandoned.
pub const DEFAULT_LEASE_SECS: i64 = 600;

/// Default lease as a chrono duration.
#[must_use]
pub fn default_lease() -> Duration {
    Duration::seconds(DEFAULT_LEASE_SECS)
}

/// Unique merge request identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MrId(String);

impl MrId {
    /// Create a merge request ID
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the ID as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id is usable as a record file name.
    ///
    /// Ids become file names, so path separators and dot-prefixed names are refused.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
            && !self.0.starts_with('.')
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    }
}

impl std::fmt::Display for MrId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MrId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Lifecycle status of a merge request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MrStatus {
    /// Waiting to be processed
    #[default]
    Open,
    /// Claimed by a worker
    InProgress,
    /// Terminal
    Closed,
}

impl MrStatus {
    /// Wire name of the status
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for MrStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a merge request was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Merged,
    Rejected,
    Conflict,
    Superseded,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Merged => write!(f, "merged"),
            Self::Rejected => write!(f, "rejected"),
            Self::Conflict => write!(f, "conflict"),
            Self::Superseded => write!(f, "superseded"),
        }
    }
}

/// A time-bounded, worker-scoped lease over one merge request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    /// Worker holding the lease
    pub worker_id: String,
    /// When the lease was granted
    pub claimed_at: DateTime<Utc>,
}

impl Claim {
    /// Create a claim granted at `now`
    #[must_use]
    pub fn new(worker_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            worker_id: worker_id.into(),
            claimed_at: now,
        }
    }

    /// A claim expires once `now - claimed_at` exceeds the lease.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>, lease: Duration) -> bool {
        now - self.claimed_at > lease
    }
}

/// A pending integration of `branch` into `target`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeRequest {
    pub id: MrId,
    pub branch: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_issue: Option<String>,
    pub worker: String,
    pub rig: String,
    pub title: String,
    /// Lower sorts first
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_bead: Option<String>,
    #[serde(default)]
    pub status: MrStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim: Option<Claim>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<CloseReason>,
    /// Last failure message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Failed processing attempts so far
    #[serde(default)]
    pub attempts: u32,
    /// Set when the last failure needs producer action (conflict, failing gate)
    #[serde(default)]
    pub needs_rework: bool,
    /// Branch head observed when the rework-class failure happened
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_head: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl MergeRequest {
    /// The claim if it is still within its lease.
    #[must_use]
    pub fn active_claim(&self, now: DateTime<Utc>, lease: Duration) -> Option<&Claim> {
        self.claim.as_ref().filter(|c| !c.is_expired(now, lease))
    }

    /// No unexpired claim exists and the record is not terminal.
    #[must_use]
    pub fn is_unclaimed(&self, now: DateTime<Utc>, lease: Duration) -> bool {
        self.status != MrStatus::Closed && self.active_claim(now, lease).is_none()
    }

    /// Whether `worker` holds the claim, expired or not.
    #[must_use]
    pub fn is_claimed_by(&self, worker: &str) -> bool {
        self.claim.as_ref().is_some_and(|c| c.worker_id == worker)
    }

    /// Display classification of the record.
    #[must_use]
    pub fn classification(&self) -> &'static str {
        match self.status {
            MrStatus::Closed => "closed",
            MrStatus::InProgress => "in-progress",
            MrStatus::Open if self.needs_rework => "needs-rework",
            MrStatus::Open if self.error.is_some() => "retry",
            MrStatus::Open => "ready",
        }
    }
}

/// Producer-facing input for `MrStore::submit`.
///
/// `id` and `created_at` are assigned by the store when absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub id: Option<MrId>,
    pub branch: String,
    pub target: String,
    pub source_issue: Option<String>,
    pub worker: String,
    pub rig: String,
    pub title: String,
    pub priority: i32,
    pub created_at: Option<DateTime<Utc>>,
    pub agent_bead: Option<String>,
}

impl Submission {
    /// Start a submission for `branch` into `target`
    #[must_use]
    pub fn new(branch: impl Into<String>, target: impl Into<String>) -> Self {
        let branch = branch.into();
        Self {
            title: branch.clone(),
            branch,
            target: target.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_worker(mut self, worker: impl Into<String>) -> Self {
        self.worker = worker.into();
        self
    }

    #[must_use]
    pub fn with_rig(mut self, rig: impl Into<String>) -> Self {
        self.rig = rig.into();
        self
    }

    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    #[must_use]
    pub fn with_source_issue(mut self, issue: impl Into<String>) -> Self {
        self.source_issue = Some(issue.into());
        self
    }

    #[must_use]
    pub fn with_agent_bead(mut self, bead: impl Into<String>) -> Self {
        self.agent_bead = Some(bead.into());
        self
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<MrId>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Turn the submission into a persisted-shape record.
    #[must_use]
    pub fn into_record(self, id: MrId, created_at: DateTime<Utc>) -> MergeRequest {
        MergeRequest {
            id,
            branch: self.branch,
            target: self.target,
            source_issue: self.source_issue,
            worker: self.worker,
            rig: self.rig,
            title: self.title,
            priority: self.priority,
            created_at,
            agent_bead: self.agent_bead,
            status: MrStatus::Open,
            claim: None,
            merge_commit: None,
            close_reason: None,
            error: None,
            attempts: 0,
            needs_rework: false,
            failed_head: None,
            updated_at: None,
        }
    }
}
