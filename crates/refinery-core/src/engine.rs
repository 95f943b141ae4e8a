//! The refinery engine: claims queued merge requests one at a time and
//! integrates them into their target branch.
//!
//! Every cycle:
//! 1. honour the pause marker
//! 2. restore the working tree to a clean state
//! 3. finish records left `closed/merged` by an interrupted success path
//! 4. claim the head of the unclaimed queue (or resume a record this worker
//!    already holds), skipping contended records and records waiting on rework
//! 5. process it: conflict probe, staged merge, gate, commit, push
//! 6. run the success or failure compensations
//!
//! A crash anywhere leaves either an expired-able claim or a closed record,
//! both of which a later cycle picks up.

use std::{path::PathBuf, sync::Arc, time::Duration as StdDuration};

use chrono::{Duration, Utc};
use futures::FutureExt;
use tokio::sync::{Mutex, Notify};

use crate::{
    claim::ClaimManager,
    conflict::{check_conflicts, collect_conflicts, output_signals_conflict, recover_tree, restore_tree},
    events::{EventLog, EventRecord},
    gate::{MergeGate, PassGate},
    mr::{CloseReason, MergeRequest, MrId, MrStatus},
    status::{EngineState, EngineStatus, StatusBoard},
    store::MrStore,
    tracker::{IssueTracker, NullTracker},
    vcs::{MergeOptions, VcsBackend},
    Error, Result,
};

/// Tunables of one engine instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub worker_id: String,
    pub poll_interval: StdDuration,
    pub max_attempts: u32,
    pub delete_merged_branches: bool,
    /// Push merged targets here and delete merged branches remotely
    pub remote: Option<String>,
    /// Working tree the gate commands run in
    pub workdir: PathBuf,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            worker_id: "refinery".to_string(),
            poll_interval: StdDuration::from_secs(30),
            max_attempts: 3,
            delete_merged_branches: true,
            remote: None,
            workdir: PathBuf::from("."),
        }
    }
}

/// Why processing a merge request failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// The branch does not merge cleanly; carries the conflicting paths
    Conflict(Vec<String>),
    /// The staged merge failed the gate
    GateFailed(String),
    /// Version control failure unrelated to conflicts
    Backend(String),
    /// Record store failure while finishing the merge
    Storage(String),
}

impl FailureKind {
    /// Failures only the producer can fix by changing the branch.
    #[must_use]
    pub const fn needs_rework(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::GateFailed(_))
    }

    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Conflict(_) => "conflict",
            Self::GateFailed(_) => "gate_failed",
            Self::Backend(_) => "backend",
            Self::Storage(_) => "storage",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Conflict(paths) => write!(f, "conflict: {}", paths.join(", ")),
            Self::GateFailed(summary) => write!(f, "gate failed: {summary}"),
            Self::Backend(msg) => write!(f, "backend error: {msg}"),
            Self::Storage(msg) => write!(f, "storage error: {msg}"),
        }
    }
}

impl From<Error> for FailureKind {
    fn from(err: Error) -> Self {
        match err {
            Error::Storage(msg) => Self::Storage(msg),
            other => Self::Backend(other.to_string()),
        }
    }
}

/// Result of one engine cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The pause marker is present
    Paused,
    /// Nothing claimable
    Idle,
    Merged { id: MrId, merge_commit: String },
    Failed { id: MrId, failure: FailureKind },
}

/// Counters reported when the engine loop exits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RunSummary {
    pub cycles: usize,
    pub merged: usize,
    pub failed: usize,
    pub errors: usize,
}

/// A merge queue worker bound to one queue directory and one working tree.
pub struct Refinery {
    claims: ClaimManager,
    events: EventLog,
    board: StatusBoard,
    vcs: Arc<dyn VcsBackend>,
    tracker: Arc<dyn IssueTracker>,
    gate: Arc<dyn MergeGate>,
    settings: EngineSettings,
    status: Mutex<EngineStatus>,
}

impl Refinery {
    /// Engine over `store` with a no-op tracker and an always-passing gate.
    #[must_use]
    pub fn new(store: MrStore, vcs: Arc<dyn VcsBackend>, settings: EngineSettings) -> Self {
        let events = EventLog::new(store.root());
        let board = StatusBoard::new(store.root());
        let status = Mutex::new(EngineStatus::stopped(settings.worker_id.clone()));
        Self {
            claims: ClaimManager::new(store),
            events,
            board,
            vcs,
            tracker: Arc::new(NullTracker),
            gate: Arc::new(PassGate),
            settings,
            status,
        }
    }

    #[must_use]
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.claims = ClaimManager::with_lease(self.claims.store().clone(), lease);
        self
    }

    #[must_use]
    pub fn with_tracker(mut self, tracker: Arc<dyn IssueTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    #[must_use]
    pub fn with_gate(mut self, gate: Arc<dyn MergeGate>) -> Self {
        self.gate = gate;
        self
    }

    #[must_use]
    pub const fn claims(&self) -> &ClaimManager {
        &self.claims
    }

    #[must_use]
    pub const fn events(&self) -> &EventLog {
        &self.events
    }

    #[must_use]
    pub const fn status_board(&self) -> &StatusBoard {
        &self.board
    }

    #[must_use]
    pub const fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    fn store(&self) -> &MrStore {
        self.claims.store()
    }

    fn worker(&self) -> &str {
        &self.settings.worker_id
    }

    /// Current in-memory status of this engine.
    pub async fn status(&self) -> EngineStatus {
        self.status.lock().await.clone()
    }

    async fn publish<F>(&self, change: F)
    where
        F: FnOnce(&mut EngineStatus) + Send,
    {
        let snapshot = {
            let mut status = self.status.lock().await;
            change(&mut status);
            status.updated_at = Utc::now();
            status.clone()
        };
        if let Err(e) = self.board.save(&snapshot).await {
            tracing::warn!(worker = %self.worker(), error = %e, "Failed to publish engine status");
        }
    }

    /// Carry merge and cycle history over from the last published status.
    async fn restore_status(&self) {
        let saved = match self.board.load(self.worker()).await {
            Ok(Some(saved)) => saved,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(worker = %self.worker(), error = %e, "Failed to load previous engine status");
                return;
            }
        };
        let mut status = self.status.lock().await;
        if status.last_merge_at.is_none() {
            status.last_merge_at = saved.last_merge_at;
        }
        if status.last_cycle_at.is_none() {
            status.last_cycle_at = saved.last_cycle_at;
        }
    }

    /// Poll until `shutdown` is notified.
    ///
    /// Busy cycles run back to back; idle, paused and failed-to-run cycles
    /// wait for the poll interval. The cycle in flight when the signal
    /// arrives completes before the loop exits.
    ///
    /// # Errors
    ///
    /// Never fails once started; cycle errors are logged and counted.
    pub async fn run(&self, shutdown: Arc<Notify>) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        self.restore_status().await;
        self.publish(|s| s.state = EngineState::Running).await;
        tracing::info!(
            worker = %self.worker(),
            poll_interval_secs = self.settings.poll_interval.as_secs(),
            "Refinery started"
        );

        loop {
            if shutdown.notified().now_or_never().is_some() {
                tracing::info!(worker = %self.worker(), "Shutdown requested");
                break;
            }

            summary.cycles += 1;
            let delay = match self.run_cycle().await {
                Ok(CycleOutcome::Merged { .. }) => {
                    summary.merged += 1;
                    StdDuration::ZERO
                }
                Ok(CycleOutcome::Failed { .. }) => {
                    summary.failed += 1;
                    StdDuration::ZERO
                }
                Ok(CycleOutcome::Idle | CycleOutcome::Paused) => self.settings.poll_interval,
                Err(e) => {
                    summary.errors += 1;
                    tracing::error!(worker = %self.worker(), error = %e, "Refinery cycle failed");
                    self.settings.poll_interval
                }
            };

            if delay.is_zero() {
                continue;
            }
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = shutdown.notified() => {
                    tracing::info!(worker = %self.worker(), "Shutdown requested while idle");
                    break;
                }
            }
        }

        self.release_held_claims().await;
        self.publish(|s| {
            s.state = EngineState::Stopped;
            s.current_mr = None;
        })
        .await;
        tracing::info!(
            worker = %self.worker(),
            merged = summary.merged,
            failed = summary.failed,
            "Refinery stopped"
        );
        Ok(summary)
    }

    /// Run a single cycle and leave the engine marked stopped.
    ///
    /// # Errors
    ///
    /// Propagates the cycle error, see [`Self::run_cycle`].
    pub async fn run_once(&self) -> Result<CycleOutcome> {
        self.restore_status().await;
        let outcome = self.run_cycle().await;
        self.publish(|s| {
            s.state = EngineState::Stopped;
            s.current_mr = None;
        })
        .await;
        outcome
    }

    /// One pass of the processing state machine.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` if the queue cannot be listed and
    /// `Error::Backend` if the working tree cannot be restored. Failures
    /// while processing a claimed MR are reported as `CycleOutcome::Failed`.
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        if self.board.is_paused().await? {
            self.publish(|s| {
                s.state = EngineState::Paused;
                s.last_cycle_at = Some(Utc::now());
            })
            .await;
            tracing::debug!(worker = %self.worker(), "Refinery paused");
            return Ok(CycleOutcome::Paused);
        }
        self.publish(|s| {
            s.state = EngineState::Running;
            s.last_cycle_at = Some(Utc::now());
        })
        .await;

        recover_tree(self.vcs.as_ref()).await?;

        let records = self.store().list().await?;
        self.finish_closed(&records).await;

        for candidate in self.candidates(records) {
            if self.awaiting_rework(&candidate).await {
                continue;
            }
            match self.claims.claim(&candidate.id, self.worker()).await {
                Ok(claimed) => return Ok(self.process(claimed).await),
                Err(e @ (Error::AlreadyClaimed { .. } | Error::NotFound(_))) => {
                    tracing::debug!(mr_id = %candidate.id, error = %e, "Skipping candidate");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(CycleOutcome::Idle)
    }

    /// Whether `mr` failed a rework-class check and its branch has not moved since.
    async fn awaiting_rework(&self, mr: &MergeRequest) -> bool {
        if !mr.needs_rework {
            return false;
        }
        match self.vcs.rev_parse(&mr.branch).await {
            Ok(head) => mr.failed_head.as_deref() == Some(head.as_str()),
            Err(e) => {
                tracing::debug!(mr_id = %mr.id, branch = %mr.branch, error = %e, "Rework branch unavailable");
                true
            }
        }
    }

    /// Unclaimed open records plus open records this worker already holds,
    /// in queue order.
    fn candidates(&self, records: Vec<MergeRequest>) -> Vec<MergeRequest> {
        let now = Utc::now();
        let lease = self.claims.lease();
        records
            .into_iter()
            .filter(|mr| {
                mr.is_unclaimed(now, lease)
                    || (mr.status != MrStatus::Closed && mr.is_claimed_by(self.worker()))
            })
            .collect()
    }

    /// Complete success compensations for merged records a crash left behind.
    async fn finish_closed(&self, records: &[MergeRequest]) {
        let now = Utc::now();
        let lease = self.claims.lease();
        for mr in records {
            let abandoned = mr.status == MrStatus::Closed
                && mr.close_reason == Some(CloseReason::Merged)
                && (mr.active_claim(now, lease).is_none() || mr.is_claimed_by(self.worker()));
            if !abandoned {
                continue;
            }
            tracing::warn!(mr_id = %mr.id, "Finishing interrupted merge completion");
            self.complete_merged(mr).await;
        }
    }

    async fn process(&self, mr: MergeRequest) -> CycleOutcome {
        tracing::info!(
            mr_id = %mr.id,
            branch = %mr.branch,
            target = %mr.target,
            worker = %self.worker(),
            "Processing merge request"
        );
        let current = mr.id.clone();
        self.publish(|s| s.current_mr = Some(current)).await;

        if let Err(e) = self.events.append(&EventRecord::started(&mr, self.worker())).await {
            tracing::warn!(mr_id = %mr.id, error = %e, "Failed to append merge_started event");
        }

        let outcome = match self.integrate(&mr).await {
            Ok(merge_commit) => match self.handle_success(&mr, &merge_commit).await {
                Ok(()) => CycleOutcome::Merged {
                    id: mr.id.clone(),
                    merge_commit,
                },
                Err(e) => self.handle_failure(&mr, FailureKind::from(e)).await,
            },
            Err(failure) => self.handle_failure(&mr, failure).await,
        };

        self.publish(|s| s.current_mr = None).await;
        outcome
    }

    /// Merge `mr` into its target, returning the commit the target now points at.
    async fn integrate(&self, mr: &MergeRequest) -> std::result::Result<String, FailureKind> {
        let vcs = self.vcs.as_ref();
        vcs.checkout(&mr.target).await?;

        if vcs.is_ancestor(&mr.branch, &mr.target).await? {
            let head = vcs.rev_parse(&mr.target).await?;
            tracing::info!(mr_id = %mr.id, merge_commit = %head, "Branch already merged into target");
            return Ok(head);
        }

        let ahead = vcs.count_commits(&mr.target, &mr.branch).await?;
        tracing::debug!(mr_id = %mr.id, commits = ahead, "Checking for conflicts");

        let conflicts = check_conflicts(vcs, &mr.branch, &mr.target).await?;
        if !conflicts.is_empty() {
            return Err(FailureKind::Conflict(conflicts));
        }

        self.merge_and_commit(mr).await
    }

    /// Staged merge, gate, commit and optional push. Any failure leaves
    /// the target where it was.
    async fn merge_and_commit(&self, mr: &MergeRequest) -> std::result::Result<String, FailureKind> {
        let vcs = self.vcs.as_ref();
        vcs.checkout(&mr.target).await?;
        let pre_merge = vcs.rev_parse("HEAD").await?;

        let output = vcs.merge(&mr.branch, &MergeOptions::probe()).await?;
        if !output.success {
            let conflicts = collect_conflicts(vcs, &output).await;
            restore_tree(vcs).await;
            if output_signals_conflict(&output) && !conflicts.is_empty() {
                return Err(FailureKind::Conflict(conflicts));
            }
            return Err(FailureKind::Backend(format!(
                "merge of {} into {} failed: {}",
                mr.branch,
                mr.target,
                output.combined()
            )));
        }

        let verdict = match self.gate.run(mr, &self.settings.workdir).await {
            Ok(verdict) => verdict,
            Err(e) => {
                restore_tree(vcs).await;
                return Err(e.into());
            }
        };
        if !verdict.passed {
            tracing::warn!(mr_id = %mr.id, summary = %verdict.summary, "Merge gate failed");
            restore_tree(vcs).await;
            return Err(FailureKind::GateFailed(verdict.summary));
        }

        let message = format!("Merge {} into {} ({})", mr.branch, mr.target, mr.id);
        let merge_commit = match vcs.commit_merge(&message).await {
            Ok(commit) => commit,
            Err(e) => {
                self.rewind(&pre_merge).await;
                return Err(e.into());
            }
        };

        if let Some(remote) = self.settings.remote.as_deref() {
            if let Err(e) = vcs.push(remote, &mr.target).await {
                self.rewind(&pre_merge).await;
                return Err(FailureKind::Backend(format!("push to {remote} failed: {e}")));
            }
        }

        tracing::info!(mr_id = %mr.id, merge_commit = %merge_commit, "Merged");
        Ok(merge_commit)
    }

    async fn rewind(&self, commit: &str) {
        restore_tree(self.vcs.as_ref()).await;
        if let Err(e) = self.vcs.reset_to(commit).await {
            tracing::error!(commit, error = %e, "Failed to rewind target after aborted merge");
        }
    }

    /// Persist the terminal state, then run the compensations.
    async fn handle_success(&self, mr: &MergeRequest, merge_commit: &str) -> Result<()> {
        let commit = merge_commit.to_string();
        let closed = self
            .store()
            .update(&mr.id, move |record| {
                record.status = MrStatus::Closed;
                record.close_reason = Some(CloseReason::Merged);
                record.merge_commit = Some(commit);
                record.error = None;
                Ok(())
            })
            .await?;

        self.publish(|s| s.last_merge_at = Some(Utc::now())).await;
        self.complete_merged(&closed).await;
        Ok(())
    }

    /// Success compensations for a record already persisted as merged.
    /// Each step is best-effort; the record is removed last.
    async fn complete_merged(&self, mr: &MergeRequest) {
        let merge_commit = mr.merge_commit.as_deref().unwrap_or_default();
        if let Err(e) = self
            .events
            .append(&EventRecord::merged(mr, self.worker(), merge_commit))
            .await
        {
            tracing::warn!(mr_id = %mr.id, error = %e, "Failed to append merged event");
        }

        if let Some(issue) = mr.source_issue.as_deref() {
            if let Err(e) = self.tracker.close(issue, &format!("Merged in {}", mr.id)).await {
                tracing::warn!(mr_id = %mr.id, issue, error = %e, "Failed to close source issue");
            }
        }

        if let Some(actor) = mr.agent_bead.as_deref() {
            if let Err(e) = self.tracker.clear_back_reference(actor).await {
                tracing::warn!(mr_id = %mr.id, actor, error = %e, "Failed to clear back-reference");
            }
        }

        if self.settings.delete_merged_branches {
            if let Err(e) = self.vcs.delete_branch(&mr.branch).await {
                tracing::warn!(mr_id = %mr.id, branch = %mr.branch, error = %e, "Failed to delete merged branch");
            }
            if let Some(remote) = self.settings.remote.as_deref() {
                if let Err(e) = self.vcs.push_delete_remote_branch(remote, &mr.branch).await {
                    tracing::warn!(
                        mr_id = %mr.id,
                        branch = %mr.branch,
                        remote,
                        error = %e,
                        "Failed to delete remote branch"
                    );
                }
            }
        }

        if let Err(e) = self.store().remove(&mr.id).await {
            tracing::warn!(mr_id = %mr.id, error = %e, "Failed to remove merged record");
        }
    }

    /// Record the failure against the MR and hand it back to the queue.
    async fn handle_failure(&self, mr: &MergeRequest, failure: FailureKind) -> CycleOutcome {
        let message = failure.to_string();
        tracing::warn!(
            mr_id = %mr.id,
            kind = failure.label(),
            error = %message,
            "Merge request failed"
        );

        if let Err(e) = self
            .events
            .append(&EventRecord::failed(mr, self.worker(), &message))
            .await
        {
            tracing::warn!(mr_id = %mr.id, error = %e, "Failed to append merge_failed event");
        }

        let head = self.vcs.rev_parse(&mr.branch).await.ok();
        let rework_class = failure.needs_rework();
        let max_attempts = self.settings.max_attempts;
        let error = message.clone();
        let released = self
            .claims
            .release_with(&mr.id, move |record| {
                // a rework-flagged record only gets claimed after a new push
                let prior = if record.needs_rework { 0 } else { record.attempts };
                record.attempts = prior.saturating_add(1);
                record.error = Some(error);
                record.needs_rework = rework_class || record.attempts >= max_attempts;
                record.failed_head = if record.needs_rework { head } else { None };
            })
            .await;

        match released {
            Ok(record) => {
                let fields = vec![
                    ("status".to_string(), record.status.to_string()),
                    ("error".to_string(), message),
                    ("attempts".to_string(), record.attempts.to_string()),
                ];
                if let Err(e) = self.tracker.update_mr_fields(mr.id.as_str(), &fields).await {
                    tracing::warn!(mr_id = %mr.id, error = %e, "Failed to update tracker after failure");
                }
                if record.needs_rework {
                    tracing::info!(mr_id = %mr.id, attempts = record.attempts, "Merge request needs rework");
                }
            }
            Err(e) => {
                tracing::error!(mr_id = %mr.id, error = %e, "Failed to release claim; it will expire with the lease");
            }
        }

        CycleOutcome::Failed {
            id: mr.id.clone(),
            failure,
        }
    }

    /// Release every open record this worker still holds.
    async fn release_held_claims(&self) {
        let records = match self.store().list().await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list records during shutdown");
                return;
            }
        };
        for mr in records
            .iter()
            .filter(|mr| mr.status != MrStatus::Closed && mr.is_claimed_by(self.worker()))
        {
            match self.claims.release(&mr.id).await {
                Ok(_) => tracing::info!(mr_id = %mr.id, "Released claim on shutdown"),
                Err(e) => tracing::warn!(mr_id = %mr.id, error = %e, "Failed to release claim on shutdown"),
            }
        }
    }
}

impl std::fmt::Debug for Refinery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Refinery")
            .field("queue", &self.store().root())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
