//! Version control backend seam.
//!
//! The engine and the conflict detector only talk to the repository through
//! this trait; [`crate::git::GitCli`] is the production implementation.

use async_trait::async_trait;

use crate::Result;

/// Captured output of one backend command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// stdout and stderr joined, for conflict scanning and error text
    #[must_use]
    pub fn combined(&self) -> String {
        match (self.stdout.trim(), self.stderr.trim()) {
            ("", err) => err.to_string(),
            (out, "") => out.to_string(),
            (out, err) => format!("{out}\n{err}"),
        }
    }
}

/// Flags for a merge of a source ref into the checked-out branch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOptions {
    /// Stage the merge without committing
    pub no_commit: bool,
    /// Always create a merge commit
    pub no_fast_forward: bool,
    /// Commit message when committing
    pub message: Option<String>,
}

impl MergeOptions {
    /// The speculative probe: no commit, no fast-forward.
    #[must_use]
    pub const fn probe() -> Self {
        Self {
            no_commit: true,
            no_fast_forward: true,
            message: None,
        }
    }
}

/// Operations the merge queue consumes from the version control tool.
///
/// All calls are blocking from the caller's point of view and operate on a
/// single working tree.
#[async_trait]
pub trait VcsBackend: Send + Sync {
    /// Switch the working tree to `reference`.
    async fn checkout(&self, reference: &str) -> Result<()>;

    /// Merge `source` into the checked-out branch.
    ///
    /// A merge that runs but fails (conflicts, unknown ref) is `Ok` with
    /// `success == false`; `Err` means the tool could not be run at all.
    async fn merge(&self, source: &str, options: &MergeOptions) -> Result<CommandOutput>;

    /// Abort an in-progress merge.
    async fn abort_merge(&self) -> Result<()>;

    /// Hard-reset the working tree and index to `reference`.
    async fn reset_to(&self, reference: &str) -> Result<()>;

    /// Hard-reset to the current `HEAD`.
    async fn reset_hard(&self) -> Result<()> {
        self.reset_to("HEAD").await
    }

    /// Paths currently in unmerged state, sorted.
    async fn conflicted_paths(&self) -> Result<Vec<String>>;

    /// Commit the staged merge and return the new `HEAD` commit.
    async fn commit_merge(&self, message: &str) -> Result<String>;

    /// Resolve a ref to a commit id.
    async fn rev_parse(&self, reference: &str) -> Result<String>;

    /// Whether `ancestor` is reachable from `descendant`.
    async fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool>;

    /// Commits reachable from `head` but not from `base`.
    async fn count_commits(&self, base: &str, head: &str) -> Result<usize>;

    /// Whether a merge is in progress in the working tree.
    async fn merge_in_progress(&self) -> Result<bool>;

    /// Whether tracked files match `HEAD`.
    async fn is_clean(&self) -> Result<bool>;

    /// Delete a local branch.
    async fn delete_branch(&self, branch: &str) -> Result<()>;

    /// Publish `branch` to `remote`.
    async fn push(&self, remote: &str, branch: &str) -> Result<()>;

    /// Delete `branch` on `remote`.
    async fn push_delete_remote_branch(&self, remote: &str, branch: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combined_output() {
        let out = CommandOutput {
            success: false,
            stdout: "Auto-merging a.txt\n".into(),
            stderr: "error: boom\n".into(),
        };
        assert_eq!(out.combined(), "Auto-merging a.txt\nerror: boom");

        let only_err = CommandOutput {
            stderr: "fatal".into(),
            ..CommandOutput::default()
        };
        assert_eq!(only_err.combined(), "fatal");
    }

    #[test]
    fn test_probe_options() {
        let probe = MergeOptions::probe();
        assert!(probe.no_commit);
        assert!(probe.no_fast_forward);
        assert!(probe.message.is_none());
    }
}
