//! Shared state for one CLI invocation

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use refinery_core::{
    config::worker_id_from_env, ClaimManager, CommandGate, CommandTracker, EventLog, GitCli,
    IssueTracker, MergeGate, MrStore, NullTracker, PassGate, Refinery, RefineryConfig, StatusBoard,
};

use crate::output::OutputFormat;

/// Loaded configuration plus the worker identity and output mode
#[derive(Debug, Clone)]
pub struct AppContext {
    pub config: RefineryConfig,
    pub worker_id: String,
    pub format: OutputFormat,
}

impl AppContext {
    /// Load configuration for the current directory.
    ///
    /// # Errors
    ///
    /// Returns the configuration error if loading or validation fails.
    pub fn load(config_path: Option<PathBuf>, format: OutputFormat) -> Result<Self> {
        let project_dir = std::env::current_dir().context("Failed to get current directory")?;
        let config = RefineryConfig::load(&project_dir, config_path.as_deref())?;
        Ok(Self {
            config,
            worker_id: worker_id_from_env(),
            format,
        })
    }

    /// Open the record store under the configured queue directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue directory cannot be created.
    pub async fn store(&self) -> Result<MrStore> {
        MrStore::open(&self.config.queue_dir).await.with_context(|| {
            format!("Failed to open queue at {}", self.config.queue_dir.display())
        })
    }

    /// # Errors
    ///
    /// Returns an error if the store cannot be opened.
    pub async fn claims(&self) -> Result<ClaimManager> {
        Ok(ClaimManager::with_lease(self.store().await?, self.config.lease()))
    }

    #[must_use]
    pub fn events(&self) -> EventLog {
        EventLog::new(&self.config.queue_dir)
    }

    #[must_use]
    pub fn status_board(&self) -> StatusBoard {
        StatusBoard::new(&self.config.queue_dir)
    }

    /// Engine wired to git, the configured gate and the configured tracker.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be opened.
    pub async fn engine(&self) -> Result<Refinery> {
        let vcs = Arc::new(GitCli::new(&self.config.repo_path));
        let gate: Arc<dyn MergeGate> = if self.config.gate.commands.is_empty() {
            Arc::new(PassGate)
        } else {
            Arc::new(CommandGate::new(self.config.gate.commands.clone()))
        };
        let tracker: Arc<dyn IssueTracker> = match &self.config.tracker.command {
            Some(program) => Arc::new(
                CommandTracker::new(program)
                    .with_back_reference_field(&self.config.tracker.back_reference_field),
            ),
            None => Arc::new(NullTracker),
        };

        Ok(Refinery::new(
            self.store().await?,
            vcs,
            self.config.engine_settings(&self.worker_id),
        )
        .with_lease(self.config.lease())
        .with_gate(gate)
        .with_tracker(tracker))
    }
}
