//! Speculative conflict detection and working-tree recovery.
//!
//! `check_conflicts` merges `source` into `target` without committing and
//! always restores the tree before returning. The caller guarantees the
//! tree is clean on entry and that only one protocol step drives the tree
//! at a time.

use crate::{
    vcs::{CommandOutput, MergeOptions, VcsBackend},
    Error, Result,
};

/// Prefix git prints for every conflicting hunk of a merge.
const CONFLICT_MARKER: &str = "CONFLICT";

/// Probe whether `source` merges cleanly into `target`.
///
/// Returns the conflicting paths; empty means mergeable. On every exit path
/// the working tree is left on `target` with no merge in progress.
///
/// # Errors
///
/// Returns `Error::Backend` if checkout fails or the merge fails for a
/// reason other than conflicts.
pub async fn check_conflicts(
    backend: &dyn VcsBackend,
    source: &str,
    target: &str,
) -> Result<Vec<String>> {
    backend.checkout(target).await?;

    let output = match backend.merge(source, &MergeOptions::probe()).await {
        Ok(output) => output,
        Err(e) => {
            restore_tree(backend).await;
            return Err(e);
        }
    };

    if output.success {
        // A staged no-commit merge cannot be undone with `merge --abort`
        // on every backend; reset to the pre-merge commit instead.
        if let Err(e) = backend.reset_hard().await {
            if let Err(abort) = backend.abort_merge().await {
                tracing::warn!(error = %abort, "Failed to abort staged merge after failed reset");
            }
            return Err(e);
        }
        tracing::debug!(source, target, "Speculative merge is clean");
        return Ok(Vec::new());
    }

    let conflicts = collect_conflicts(backend, &output).await;
    restore_tree(backend).await;

    if conflicts.is_empty() {
        return Err(Error::Backend(format!(
            "merge of {source} into {target} failed: {}",
            output.combined()
        )));
    }

    tracing::info!(
        source,
        target,
        count = conflicts.len(),
        "Speculative merge found conflicts"
    );
    Ok(conflicts)
}

/// Conflicting paths from unmerged-state detection, falling back to the
/// CONFLICT lines in the command output.
pub(crate) async fn collect_conflicts(backend: &dyn VcsBackend, output: &CommandOutput) -> Vec<String> {
    let unmerged = backend.conflicted_paths().await.unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to list unmerged paths");
        Vec::new()
    });
    if !unmerged.is_empty() {
        return unmerged;
    }
    let combined = output.combined();
    let parsed = parse_conflict_output(&combined);
    if parsed.is_empty() && output_signals_conflict(output) {
        // conflict reported without per-path lines; keep the signal
        return combined
            .lines()
            .find(|l| l.to_lowercase().contains("conflict"))
            .map(|l| vec![l.trim().to_string()])
            .unwrap_or_default();
    }
    parsed
}

/// Extract paths from `CONFLICT (...): ...` lines.
///
/// Handles `Merge conflict in <path>` and the `<path> deleted in ...` forms;
/// for any other CONFLICT line the text after the kind is reported so the
/// signal is never lost.
#[must_use]
pub fn parse_conflict_output(output: &str) -> Vec<String> {
    let mut paths: Vec<String> = output
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with(CONFLICT_MARKER))
        .map(|line| {
            let detail = line.split_once("): ").map_or(line, |(_, rest)| rest);
            if let Some((_, path)) = detail.split_once("Merge conflict in ") {
                path.trim().to_string()
            } else if let Some((path, _)) = detail.split_once(" deleted in ") {
                path.trim().to_string()
            } else {
                detail.trim().to_string()
            }
        })
        .collect();
    paths.sort();
    paths.dedup();
    paths
}

/// Whether the output of a failed merge signals conflicts.
#[must_use]
pub fn output_signals_conflict(output: &CommandOutput) -> bool {
    output.stdout.contains(CONFLICT_MARKER)
        || output.stderr.contains(CONFLICT_MARKER)
        || output.combined().to_lowercase().contains("fix conflicts")
}

/// Unconditional cleanup: abort, and if there is nothing to abort, hard reset.
pub(crate) async fn restore_tree(backend: &dyn VcsBackend) {
    if backend.abort_merge().await.is_ok() {
        return;
    }
    if let Err(e) = backend.reset_hard().await {
        tracing::warn!(error = %e, "Failed to reset working tree after merge attempt");
    }
}

/// Recognizable working-tree states after an interruption
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeState {
    /// No merge in progress, no tracked modifications
    Clean,
    /// Merge in progress with unmerged paths
    MergeConflicted(Vec<String>),
    /// Merge in progress, staged cleanly but not committed
    MergeStaged,
    /// Tracked modifications without a merge
    Dirty,
}

/// Classify the working tree.
///
/// # Errors
///
/// Returns `Error::Backend` if the backend cannot be queried.
pub async fn inspect_tree(backend: &dyn VcsBackend) -> Result<TreeState> {
    if backend.merge_in_progress().await? {
        let unmerged = backend.conflicted_paths().await?;
        return Ok(if unmerged.is_empty() {
            TreeState::MergeStaged
        } else {
            TreeState::MergeConflicted(unmerged)
        });
    }
    if backend.is_clean().await? {
        Ok(TreeState::Clean)
    } else {
        Ok(TreeState::Dirty)
    }
}

/// Bring the tree back to `Clean`, returning the state that was found.
///
/// # Errors
///
/// Returns `Error::Backend` if inspection or the fix-up fails.
pub async fn recover_tree(backend: &dyn VcsBackend) -> Result<TreeState> {
    let found = inspect_tree(backend).await?;
    match &found {
        TreeState::Clean => {}
        TreeState::MergeConflicted(paths) => {
            tracing::warn!(paths = ?paths, "Recovering interrupted merge with conflicts");
            if backend.abort_merge().await.is_err() {
                backend.reset_hard().await?;
            }
        }
        TreeState::MergeStaged => {
            tracing::warn!("Recovering interrupted clean merge");
            backend.reset_hard().await?;
        }
        TreeState::Dirty => {
            tracing::error!(
                "Discarding uncommitted tracked modifications in refinery working tree"
            );
            backend.reset_hard().await?;
        }
    }
    Ok(found)
}
