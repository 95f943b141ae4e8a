//! Merge request commands: submit, inspect, claim and remove records.

use std::fmt::Write as _;

use anyhow::{Context, Result};
use chrono::Utc;
use refinery_core::{build_queue, EventRecord, MergeRequest, MrId, QueueItem, Submission};
use serde_json::json;

use crate::{context::AppContext, output::truncate};

/// Producer input for `mq submit`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitOptions {
    pub branch: String,
    pub target: Option<String>,
    pub issue: Option<String>,
    pub worker: Option<String>,
    pub title: Option<String>,
    pub priority: i32,
    pub agent_bead: Option<String>,
}

impl SubmitOptions {
    fn into_submission(self, ctx: &AppContext) -> Submission {
        let target = self
            .target
            .unwrap_or_else(|| ctx.config.default_target.clone());
        let mut submission = Submission::new(self.branch, target)
            .with_priority(self.priority)
            .with_worker(self.worker.unwrap_or_else(|| ctx.worker_id.clone()))
            .with_rig(ctx.config.rig_name());
        if let Some(title) = self.title {
            submission = submission.with_title(title);
        }
        if let Some(issue) = self.issue {
            submission = submission.with_source_issue(issue);
        }
        if let Some(bead) = self.agent_bead {
            submission = submission.with_agent_bead(bead);
        }
        submission
    }
}

/// # Errors
///
/// Returns an error if the record cannot be written.
pub async fn submit(ctx: &AppContext, options: &SubmitOptions) -> Result<()> {
    let store = ctx.store().await?;
    let mr = store
        .submit(options.clone().into_submission(ctx))
        .await
        .context("Failed to submit merge request")?;

    if let Err(e) = ctx.events().append(&EventRecord::submitted(&mr)).await {
        tracing::warn!(mr_id = %mr.id, error = %e, "Failed to append mr_submitted event");
    }

    ctx.format.emit(&mr, || mr.id.to_string())
}

/// # Errors
///
/// Returns an error if the store cannot be read.
pub async fn list(ctx: &AppContext, unclaimed_only: bool) -> Result<()> {
    let records = if unclaimed_only {
        ctx.claims().await?.list_unclaimed().await?
    } else {
        ctx.store().await?.list().await?
    };
    ctx.format.emit(&records, || render_list(&records))
}

/// # Errors
///
/// Returns an error if the store cannot be read.
pub async fn queue(ctx: &AppContext) -> Result<()> {
    let records = ctx.store().await?.list().await?;
    let items = build_queue(records, Utc::now(), ctx.config.lease());
    ctx.format.emit(&items, || render_queue(&items))
}

/// # Errors
///
/// Returns `NotFound` if the record does not exist.
pub async fn show(ctx: &AppContext, id: &str) -> Result<()> {
    let mr = ctx
        .store()
        .await?
        .get(&MrId::new(id))
        .await
        .with_context(|| format!("Failed to show {id}"))?;
    ctx.format.emit(&mr, || render_record(&mr))
}

/// # Errors
///
/// Returns an error if the store cannot be read.
pub async fn count(ctx: &AppContext) -> Result<()> {
    let count = ctx.store().await?.count().await?;
    ctx.format
        .emit(&json!({ "count": count }), || count.to_string())
}

/// # Errors
///
/// Returns `AlreadyClaimed` under contention and `NotFound` for absent or closed records.
pub async fn claim(ctx: &AppContext, id: &str) -> Result<()> {
    let mr = ctx
        .claims()
        .await?
        .claim(&MrId::new(id), &ctx.worker_id)
        .await
        .with_context(|| format!("Failed to claim {id}"))?;
    ctx.format.emit(&mr, || format!("Claimed {} as {}", mr.id, ctx.worker_id))
}

/// # Errors
///
/// Returns `NotFound` if the record does not exist.
pub async fn release(ctx: &AppContext, id: &str) -> Result<()> {
    let mr = ctx
        .claims()
        .await?
        .release(&MrId::new(id))
        .await
        .with_context(|| format!("Failed to release {id}"))?;
    ctx.format.emit(&mr, || format!("Released {}", mr.id))
}

/// Removing an absent record succeeds.
///
/// # Errors
///
/// Returns an error if the record exists but cannot be deleted.
pub async fn remove(ctx: &AppContext, id: &str) -> Result<()> {
    ctx.store()
        .await?
        .remove(&MrId::new(id))
        .await
        .with_context(|| format!("Failed to remove {id}"))?;
    ctx.format
        .emit(&json!({ "removed": id }), || format!("Removed {id}"))
}

fn render_list(records: &[MergeRequest]) -> String {
    if records.is_empty() {
        return "Queue is empty".to_string();
    }
    let mut out = format!(
        "{:<28} {:>4}  {:<12} {:<32} {:<10} {}\n",
        "ID", "PRI", "STATE", "BRANCH -> TARGET", "WORKER", "ERROR"
    );
    for mr in records {
        let route = format!("{} -> {}", mr.branch, mr.target);
        let worker = mr
            .claim
            .as_ref()
            .map_or(mr.worker.as_str(), |c| c.worker_id.as_str());
        let _ = writeln!(
            out,
            "{:<28} {:>4}  {:<12} {:<32} {:<10} {}",
            truncate(mr.id.as_str(), 28),
            mr.priority,
            mr.classification(),
            truncate(&route, 32),
            truncate(worker, 10),
            truncate(mr.error.as_deref().unwrap_or("-"), 40),
        );
    }
    out.trim_end().to_string()
}

fn render_queue(items: &[QueueItem]) -> String {
    if items.is_empty() {
        return "Queue is empty".to_string();
    }
    let mut out = format!(
        "{:>3}  {:>5}  {:<28} {:<32} {}\n",
        "POS", "AGE", "ID", "BRANCH", "STATE"
    );
    for item in items {
        let position = if item.position == 0 {
            "*".to_string()
        } else {
            item.position.to_string()
        };
        let _ = writeln!(
            out,
            "{:>3}  {:>5}  {:<28} {:<32} {}",
            position,
            item.age,
            truncate(item.mr.id.as_str(), 28),
            truncate(&item.mr.branch, 32),
            item.mr.classification(),
        );
    }
    out.trim_end().to_string()
}

fn render_record(mr: &MergeRequest) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "ID:        {}", mr.id);
    let _ = writeln!(out, "Title:     {}", mr.title);
    let _ = writeln!(out, "Branch:    {} -> {}", mr.branch, mr.target);
    let _ = writeln!(out, "Status:    {} ({})", mr.status, mr.classification());
    let _ = writeln!(out, "Priority:  {}", mr.priority);
    let _ = writeln!(out, "Rig:       {}", mr.rig);
    let _ = writeln!(out, "Worker:    {}", mr.worker);
    let _ = writeln!(out, "Created:   {}", mr.created_at.to_rfc3339());
    if let Some(issue) = &mr.source_issue {
        let _ = writeln!(out, "Issue:     {issue}");
    }
    if let Some(bead) = &mr.agent_bead {
        let _ = writeln!(out, "Agent:     {bead}");
    }
    if let Some(claim) = &mr.claim {
        let _ = writeln!(
            out,
            "Claimed:   {} at {}",
            claim.worker_id,
            claim.claimed_at.to_rfc3339()
        );
    }
    if mr.attempts > 0 {
        let _ = writeln!(out, "Attempts:  {}", mr.attempts);
    }
    if let Some(error) = &mr.error {
        let _ = writeln!(out, "Error:     {error}");
    }
    if let Some(commit) = &mr.merge_commit {
        let _ = writeln!(out, "Merged as: {commit}");
    }
    out.trim_end().to_string()
}
