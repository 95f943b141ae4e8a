//! Engine status and pause control.
//!
//! Each engine publishes its state to `<queue>/engines/<worker>.json`; the
//! queue-wide `paused` marker file suspends every engine polling that queue.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{mr::MrId, store::write_atomic, Error, Result};

const ENGINES_DIR: &str = "engines";
const PAUSE_MARKER: &str = "paused";

/// Lifecycle state of a refinery engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    #[default]
    Stopped,
    Running,
    Paused,
}

impl EngineState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Paused => "paused",
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot answered by the status query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub worker_id: String,
    pub state: EngineState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_mr: Option<MrId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_merge_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl EngineStatus {
    #[must_use]
    pub fn stopped(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            state: EngineState::Stopped,
            current_mr: None,
            last_merge_at: None,
            last_cycle_at: None,
            updated_at: Utc::now(),
        }
    }
}

/// Reads and writes engine status files and the pause marker.
#[derive(Debug, Clone)]
pub struct StatusBoard {
    root: PathBuf,
}

impl StatusBoard {
    #[must_use]
    pub fn new(queue_root: impl AsRef<Path>) -> Self {
        Self {
            root: queue_root.as_ref().to_path_buf(),
        }
    }

    fn engines_dir(&self) -> PathBuf {
        self.root.join(ENGINES_DIR)
    }

    fn status_path(&self, worker_id: &str) -> PathBuf {
        let safe: String = worker_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
            .collect();
        let safe = safe.trim_start_matches('.');
        let name = if safe.is_empty() { "default" } else { safe };
        self.engines_dir().join(format!("{name}.json"))
    }

    fn pause_path(&self) -> PathBuf {
        self.root.join(PAUSE_MARKER)
    }

    /// Persist `status`, stamping `updated_at`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` on I/O failure.
    pub async fn save(&self, status: &EngineStatus) -> Result<()> {
        tokio::fs::create_dir_all(self.engines_dir()).await?;
        let mut stamped = status.clone();
        stamped.updated_at = Utc::now();
        let bytes = serde_json::to_vec_pretty(&stamped)?;
        write_atomic(&self.status_path(&status.worker_id), &bytes).await
    }

    /// Last published status of `worker_id`, if it ever ran.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` if the file exists but cannot be read or parsed.
    pub async fn load(&self, worker_id: &str) -> Result<Option<EngineStatus>> {
        match tokio::fs::read(self.status_path(worker_id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Every published engine status, sorted by worker id.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` if the directory cannot be read.
    pub async fn list(&self) -> Result<Vec<EngineStatus>> {
        let mut entries = match tokio::fs::read_dir(self.engines_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut statuses = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let visible = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| !n.starts_with('.') && n.ends_with(".json"));
            if !visible {
                continue;
            }
            match tokio::fs::read(&path).await.map_err(Error::from).and_then(|bytes| {
                serde_json::from_slice::<EngineStatus>(&bytes).map_err(Error::from)
            }) {
                Ok(status) => statuses.push(status),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable engine status"),
            }
        }
        statuses.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(statuses)
    }

    /// Suspend polling for every engine on this queue.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` on I/O failure.
    pub async fn pause(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        write_atomic(&self.pause_path(), Utc::now().to_rfc3339().as_bytes()).await?;
        tracing::info!(queue = %self.root.display(), "Paused refinery");
        Ok(())
    }

    /// Remove the pause marker. Resuming a running queue is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` on I/O failure.
    pub async fn resume(&self) -> Result<()> {
        match tokio::fs::remove_file(self.pause_path()).await {
            Ok(()) => {
                tracing::info!(queue = %self.root.display(), "Resumed refinery");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether the pause marker is present.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` if the marker cannot be checked.
    pub async fn is_paused(&self) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.pause_path()).await?)
    }
}
