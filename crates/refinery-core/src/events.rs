//! Append-only, per-rig merge event journal.
//!
//! One JSON object per line in `<queue>/events/<rig>.jsonl`. Entries are
//! never rewritten; readers skip lines that fail to parse.

use std::{
    io::Write,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::{
    mr::{MergeRequest, MrId},
    Error, Result,
};

const EVENTS_DIR: &str = "events";

/// Lifecycle events recorded for a merge request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Record created by a producer
    MrSubmitted,
    /// Engine claimed the MR and began processing
    MergeStarted,
    /// Integration merge committed
    Merged,
    /// Processing failed
    MergeFailed,
}

impl EventType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MrSubmitted => "mr_submitted",
            Self::MergeStarted => "merge_started",
            Self::Merged => "merged",
            Self::MergeFailed => "merge_failed",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// One immutable journal entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_type: EventType,
    pub mr_id: MrId,
    pub timestamp: DateTime<Utc>,
    pub rig: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Set on `merged`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_commit: Option<String>,
    /// Set on `merge_failed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EventRecord {
    fn for_mr(event_type: EventType, mr: &MergeRequest) -> Self {
        Self {
            event_type,
            mr_id: mr.id.clone(),
            timestamp: Utc::now(),
            rig: mr.rig.clone(),
            worker: None,
            branch: Some(mr.branch.clone()),
            target: Some(mr.target.clone()),
            merge_commit: None,
            error: None,
        }
    }

    #[must_use]
    pub fn submitted(mr: &MergeRequest) -> Self {
        Self {
            worker: Some(mr.worker.clone()).filter(|w| !w.is_empty()),
            ..Self::for_mr(EventType::MrSubmitted, mr)
        }
    }

    #[must_use]
    pub fn started(mr: &MergeRequest, worker: &str) -> Self {
        Self {
            worker: Some(worker.to_string()),
            ..Self::for_mr(EventType::MergeStarted, mr)
        }
    }

    #[must_use]
    pub fn merged(mr: &MergeRequest, worker: &str, merge_commit: &str) -> Self {
        Self {
            worker: Some(worker.to_string()),
            merge_commit: Some(merge_commit.to_string()),
            ..Self::for_mr(EventType::Merged, mr)
        }
    }

    #[must_use]
    pub fn failed(mr: &MergeRequest, worker: &str, error: &str) -> Self {
        Self {
            worker: Some(worker.to_string()),
            error: Some(error.to_string()),
            ..Self::for_mr(EventType::MergeFailed, mr)
        }
    }
}

/// Handle over the events directory of one queue
#[derive(Debug, Clone)]
pub struct EventLog {
    dir: PathBuf,
}

impl EventLog {
    /// Event log stored under `<queue_root>/events`
    #[must_use]
    pub fn new(queue_root: impl AsRef<Path>) -> Self {
        Self {
            dir: queue_root.as_ref().join(EVENTS_DIR),
        }
    }

    /// Journal file of `rig`
    #[must_use]
    pub fn path_for(&self, rig: &str) -> PathBuf {
        let rig = if rig.is_empty() { "default" } else { rig };
        let safe: String = rig
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.jsonl"))
    }

    /// Append one event to its rig's journal.
    ///
    /// The line is written with a single call while holding an exclusive
    /// lock on the file, so concurrent appenders never interleave.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` on serialization or I/O failure.
    pub async fn append(&self, event: &EventRecord) -> Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let path = self.path_for(&event.rig);
        let dir = self.dir.clone();

        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            std::fs::create_dir_all(&dir)?;
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            file.lock_exclusive()?;
            let written = file.write_all(&line).and_then(|()| file.sync_data());
            FileExt::unlock(&file)?;
            written
        })
        .await
        .map_err(|e| Error::Storage(format!("event append task failed: {e}")))?
        .map_err(|e| Error::Storage(format!("failed to append event: {e}")))?;

        tracing::debug!(
            event_type = %event.event_type,
            mr_id = %event.mr_id,
            rig = %event.rig,
            "Appended event"
        );
        Ok(())
    }

    /// Every well-formed event of `rig`, in append order.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` if the journal exists but cannot be read.
    pub async fn read_all(&self, rig: &str) -> Result<Vec<EventRecord>> {
        let path = self.path_for(rig);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::Storage(format!(
                    "failed to read {}: {e}",
                    path.display()
                )));
            }
        };

        Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(event) => Some(event),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping malformed event line");
                    None
                }
            })
            .collect())
    }

    /// The last `n` events of `rig`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` if the journal exists but cannot be read.
    pub async fn tail(&self, rig: &str, n: usize) -> Result<Vec<EventRecord>> {
        let mut events = self.read_all(rig).await?;
        let skip = events.len().saturating_sub(n);
        Ok(events.split_off(skip))
    }
}
