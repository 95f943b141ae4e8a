//! Engine commands: run the refinery, query and control it.

use std::{fmt::Write as _, path::Path, sync::Arc};

use anyhow::{bail, Context, Result};
use refinery_core::{conflict::inspect_tree, CycleOutcome, EngineStatus, GitCli, TreeState};
use serde_json::json;
use tokio::sync::Notify;

use crate::{context::AppContext, setup::wait_for_shutdown_signal};

/// Run the engine until SIGINT or SIGTERM.
///
/// # Errors
///
/// Returns an error if the engine cannot be constructed.
pub async fn run(ctx: &AppContext) -> Result<()> {
    guard_invoking_checkout(&ctx.config.repo_path).await?;
    let engine = ctx.engine().await?;
    let shutdown = Arc::new(Notify::new());

    let signal = Arc::clone(&shutdown);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        signal.notify_one();
    });

    let summary = engine.run(shutdown).await?;
    ctx.format.emit(&summary, || {
        format!(
            "Refinery {} stopped after {} cycles: {} merged, {} failed, {} errors",
            ctx.worker_id, summary.cycles, summary.merged, summary.failed, summary.errors
        )
    })
}

/// Run a single cycle.
///
/// # Errors
///
/// Returns an error if the cycle could not run (queue unreadable, working
/// tree unrecoverable). A failed merge is reported, not returned.
pub async fn run_once(ctx: &AppContext) -> Result<()> {
    guard_invoking_checkout(&ctx.config.repo_path).await?;
    let engine = ctx.engine().await?;
    let outcome = engine.run_once().await.context("Refinery cycle failed")?;

    let (value, text) = match &outcome {
        CycleOutcome::Paused => (json!({ "outcome": "paused" }), "Refinery is paused".to_string()),
        CycleOutcome::Idle => (json!({ "outcome": "idle" }), "Nothing to merge".to_string()),
        CycleOutcome::Merged { id, merge_commit } => (
            json!({ "outcome": "merged", "mr_id": id, "merge_commit": merge_commit }),
            format!("Merged {id} as {merge_commit}"),
        ),
        CycleOutcome::Failed { id, failure } => (
            json!({
                "outcome": "failed",
                "mr_id": id,
                "kind": failure.label(),
                "needs_rework": failure.needs_rework(),
                "error": failure.to_string(),
            }),
            format!("Failed {id}: {failure}"),
        ),
    };
    ctx.format.emit(&value, || text)
}

/// Show published engine status for every worker on this queue.
///
/// # Errors
///
/// Returns an error if the status files cannot be read.
pub async fn status(ctx: &AppContext) -> Result<()> {
    let board = ctx.status_board();
    let paused = board.is_paused().await?;
    let engines = board.list().await?;

    ctx.format.emit(
        &json!({ "paused": paused, "engines": engines }),
        || render_status(paused, &engines),
    )
}

/// # Errors
///
/// Returns an error if the pause marker cannot be written.
pub async fn pause(ctx: &AppContext) -> Result<()> {
    ctx.status_board()
        .pause()
        .await
        .context("Failed to pause refinery")?;
    ctx.format
        .emit(&json!({ "paused": true }), || "Refinery paused".to_string())
}

/// # Errors
///
/// Returns an error if the pause marker cannot be removed.
pub async fn resume(ctx: &AppContext) -> Result<()> {
    ctx.status_board()
        .resume()
        .await
        .context("Failed to resume refinery")?;
    ctx.format
        .emit(&json!({ "paused": false }), || "Refinery resumed".to_string())
}

/// Refuse to run when the engine would hard-reset uncommitted edits in the
/// checkout the command was invoked from.
async fn guard_invoking_checkout(repo_path: &Path) -> Result<()> {
    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    if !same_checkout(repo_path, &cwd) {
        return Ok(());
    }
    let state = inspect_tree(&GitCli::new(repo_path))
        .await
        .with_context(|| format!("Failed to inspect working tree at {}", repo_path.display()))?;
    refuse_dirty_checkout(repo_path, &state)
}

fn same_checkout(repo_path: &Path, cwd: &Path) -> bool {
    match (repo_path.canonicalize(), cwd.canonicalize()) {
        (Ok(repo), Ok(cwd)) => repo == cwd,
        _ => repo_path == cwd,
    }
}

fn refuse_dirty_checkout(repo_path: &Path, state: &TreeState) -> Result<()> {
    if *state == TreeState::Dirty {
        bail!(
            "Working tree at {} has uncommitted changes and is the current checkout; \
             the refinery would discard them. Commit or stash them, or point repo_path \
             at a dedicated clone",
            repo_path.display()
        );
    }
    Ok(())
}

fn render_status(paused: bool, engines: &[EngineStatus]) -> String {
    let mut out = String::new();
    if paused {
        out.push_str("Queue is paused\n");
    }
    if engines.is_empty() {
        out.push_str("No refinery has run on this queue");
        return out;
    }
    for status in engines {
        let _ = write!(out, "{}: {}", status.worker_id, status.state);
        if let Some(current) = &status.current_mr {
            let _ = write!(out, ", processing {current}");
        }
        match status.last_merge_at {
            Some(at) => {
                let _ = write!(out, ", last merge {}", at.to_rfc3339());
            }
            None => out.push_str(", no merges yet"),
        }
        out.push('\n');
    }
    out.trim_end().to_string()
}
