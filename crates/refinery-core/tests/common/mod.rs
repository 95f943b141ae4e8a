//! Shared fixtures for refinery-core integration tests

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use refinery_core::{
    CommandOutput, EngineSettings, Error, IssueTracker, MergeOptions, MrStore, Refinery, Result,
    VcsBackend,
};
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq, Eq)]
enum MergeState {
    None,
    Staged(String),
    Conflicted(Vec<String>),
}

#[derive(Debug)]
struct MockState {
    heads: HashMap<String, String>,
    /// branch -> commit that merged it
    merged: HashMap<String, String>,
    conflicts: HashMap<String, Vec<String>>,
    checked_out: String,
    merge: MergeState,
    dirty: bool,
    next_commit: String,
    fail_push: bool,
    calls: Vec<String>,
}

/// In-memory version control backend.
///
/// Branches are names with a head id; merging records the branch as merged
/// into whatever is checked out and moves that branch to `next_commit`.
#[derive(Debug)]
pub struct MockVcs {
    state: Mutex<MockState>,
}

impl MockVcs {
    pub fn new() -> Arc<Self> {
        let mut heads = HashMap::new();
        heads.insert("main".to_string(), "main-0".to_string());
        Arc::new(Self {
            state: Mutex::new(MockState {
                heads,
                merged: HashMap::new(),
                conflicts: HashMap::new(),
                checked_out: "main".to_string(),
                merge: MergeState::None,
                dirty: false,
                next_commit: "abc123".to_string(),
                fail_push: false,
                calls: Vec::new(),
            }),
        })
    }

    pub fn set_branch(&self, name: &str, head: &str) {
        self.state
            .lock()
            .unwrap()
            .heads
            .insert(name.to_string(), head.to_string());
    }

    pub fn add_conflict(&self, branch: &str, paths: &[&str]) {
        self.state.lock().unwrap().conflicts.insert(
            branch.to_string(),
            paths.iter().map(ToString::to_string).collect(),
        );
    }

    pub fn clear_conflict(&self, branch: &str) {
        self.state.lock().unwrap().conflicts.remove(branch);
    }

    pub fn mark_merged(&self, branch: &str) {
        self.state
            .lock()
            .unwrap()
            .merged
            .insert(branch.to_string(), "premerged".to_string());
    }

    pub fn set_next_commit(&self, commit: &str) {
        self.state.lock().unwrap().next_commit = commit.to_string();
    }

    pub fn fail_push(&self, fail: bool) {
        self.state.lock().unwrap().fail_push = fail;
    }

    /// Leave a staged, uncommitted merge behind, as a crash would.
    pub fn interrupt_with_staged_merge(&self, branch: &str) {
        self.state.lock().unwrap().merge = MergeState::Staged(branch.to_string());
    }

    pub fn make_dirty(&self) {
        self.state.lock().unwrap().dirty = true;
    }

    pub fn is_pristine(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.merge == MergeState::None && !state.dirty
    }

    pub fn checked_out(&self) -> String {
        self.state.lock().unwrap().checked_out.clone()
    }

    pub fn head(&self, branch: &str) -> Option<String> {
        self.state.lock().unwrap().heads.get(branch).cloned()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn called(&self, prefix: &str) -> bool {
        self.calls().iter().any(|c| c.starts_with(prefix))
    }

    fn record(&self, call: String) -> std::sync::MutexGuard<'_, MockState> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        state
    }
}

#[async_trait]
impl VcsBackend for MockVcs {
    async fn checkout(&self, reference: &str) -> Result<()> {
        let mut state = self.record(format!("checkout {reference}"));
        if state.merge != MergeState::None {
            return Err(Error::Backend("cannot checkout during a merge".into()));
        }
        if !state.heads.contains_key(reference) {
            return Err(Error::Backend(format!("unknown ref {reference}")));
        }
        state.checked_out = reference.to_string();
        Ok(())
    }

    async fn merge(&self, source: &str, options: &MergeOptions) -> Result<CommandOutput> {
        let mut state = self.record(format!("merge {source} no_commit={}", options.no_commit));
        if let Some(paths) = state.conflicts.get(source).cloned() {
            let stdout = paths
                .iter()
                .map(|p| format!("CONFLICT (content): Merge conflict in {p}"))
                .collect::<Vec<_>>()
                .join("\n");
            state.merge = MergeState::Conflicted(paths);
            return Ok(CommandOutput {
                success: false,
                stdout: format!("{stdout}\nAutomatic merge failed; fix conflicts and then commit the result."),
                stderr: String::new(),
            });
        }
        if !state.heads.contains_key(source) {
            return Ok(CommandOutput {
                success: false,
                stdout: String::new(),
                stderr: format!("merge: {source} - not something we can merge"),
            });
        }
        state.merge = MergeState::Staged(source.to_string());
        Ok(CommandOutput {
            success: true,
            stdout: "Automatic merge went well; stopped before committing as requested".into(),
            stderr: String::new(),
        })
    }

    async fn abort_merge(&self) -> Result<()> {
        let mut state = self.record("merge --abort".into());
        if state.merge == MergeState::None {
            return Err(Error::Backend("There is no merge to abort (MERGE_HEAD missing).".into()));
        }
        state.merge = MergeState::None;
        Ok(())
    }

    async fn reset_to(&self, reference: &str) -> Result<()> {
        let mut state = self.record(format!("reset --hard {reference}"));
        state.merge = MergeState::None;
        state.dirty = false;
        if reference != "HEAD" {
            let branch = state.checked_out.clone();
            if let Some(old) = state.heads.insert(branch, reference.to_string()) {
                state.merged.retain(|_, commit| *commit != old);
            }
        }
        Ok(())
    }

    async fn conflicted_paths(&self) -> Result<Vec<String>> {
        let state = self.record("diff --diff-filter=U".into());
        Ok(match &state.merge {
            MergeState::Conflicted(paths) => paths.clone(),
            _ => Vec::new(),
        })
    }

    async fn commit_merge(&self, message: &str) -> Result<String> {
        let mut state = self.record(format!("commit {message}"));
        let MergeState::Staged(source) = state.merge.clone() else {
            return Err(Error::Backend("nothing staged to commit".into()));
        };
        let commit = state.next_commit.clone();
        let target = state.checked_out.clone();
        state.heads.insert(target, commit.clone());
        state.merged.insert(source, commit.clone());
        state.merge = MergeState::None;
        Ok(commit)
    }

    async fn rev_parse(&self, reference: &str) -> Result<String> {
        let state = self.state.lock().unwrap();
        let name = if reference == "HEAD" {
            state.checked_out.as_str()
        } else {
            reference
        };
        state
            .heads
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Backend(format!("unknown revision {reference}")))
    }

    async fn is_ancestor(&self, ancestor: &str, _descendant: &str) -> Result<bool> {
        let state = self.state.lock().unwrap();
        if !state.heads.contains_key(ancestor) {
            return Err(Error::Backend(format!("unknown revision {ancestor}")));
        }
        Ok(state.merged.contains_key(ancestor))
    }

    async fn count_commits(&self, _base: &str, _head: &str) -> Result<usize> {
        Ok(1)
    }

    async fn merge_in_progress(&self) -> Result<bool> {
        Ok(self.state.lock().unwrap().merge != MergeState::None)
    }

    async fn is_clean(&self) -> Result<bool> {
        let state = self.state.lock().unwrap();
        Ok(state.merge == MergeState::None && !state.dirty)
    }

    async fn delete_branch(&self, branch: &str) -> Result<()> {
        let mut state = self.record(format!("branch -D {branch}"));
        state
            .heads
            .remove(branch)
            .map(|_| ())
            .ok_or_else(|| Error::Backend(format!("branch {branch} not found")))
    }

    async fn push(&self, remote: &str, branch: &str) -> Result<()> {
        let state = self.record(format!("push {remote} {branch}"));
        if state.fail_push {
            return Err(Error::Backend("remote rejected".into()));
        }
        Ok(())
    }

    async fn push_delete_remote_branch(&self, remote: &str, branch: &str) -> Result<()> {
        drop(self.record(format!("push {remote} --delete {branch}")));
        Ok(())
    }
}

/// Tracker that records every call
#[derive(Debug, Default)]
pub struct RecordingTracker {
    calls: Mutex<Vec<String>>,
}

impl RecordingTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl IssueTracker for RecordingTracker {
    async fn update_mr_fields(&self, mr_id: &str, fields: &[(String, String)]) -> Result<()> {
        let rendered: Vec<String> = fields.iter().map(|(k, v)| format!("{k}={v}")).collect();
        self.calls
            .lock()
            .unwrap()
            .push(format!("update {mr_id} {}", rendered.join(" ")));
        Ok(())
    }

    async fn close(&self, issue: &str, reason: &str) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("close {issue}: {reason}"));
        Ok(())
    }

    async fn clear_back_reference(&self, actor: &str) -> Result<()> {
        self.calls.lock().unwrap().push(format!("clear {actor}"));
        Ok(())
    }
}

/// Temporary queue directory with an opened store
pub async fn temp_store() -> (TempDir, MrStore) {
    let dir = TempDir::new().unwrap();
    let store = MrStore::open(dir.path().join("queue")).await.unwrap();
    (dir, store)
}

pub fn settings(worker: &str) -> EngineSettings {
    EngineSettings {
        worker_id: worker.to_string(),
        poll_interval: std::time::Duration::from_millis(10),
        ..EngineSettings::default()
    }
}

pub fn engine(store: &MrStore, vcs: &Arc<MockVcs>, worker: &str) -> Refinery {
    Refinery::new(store.clone(), Arc::clone(vcs) as Arc<dyn VcsBackend>, settings(worker))
}
