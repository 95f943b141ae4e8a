//! Git command-line backend.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;

use crate::{
    vcs::{CommandOutput, MergeOptions, VcsBackend},
    Error, Result,
};

/// Drives `git` in one working tree.
#[derive(Debug, Clone)]
pub struct GitCli {
    workdir: PathBuf,
    program: String,
}

impl GitCli {
    /// Backend for the working tree at `workdir`
    #[must_use]
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            program: "git".to_string(),
        }
    }

    /// Use a different git executable
    #[must_use]
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    #[must_use]
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    async fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        let output = Command::new(&self.program)
            .args(args)
            .current_dir(&self.workdir)
            .env("GIT_MERGE_AUTOEDIT", "no")
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .await
            .map_err(|e| Error::Backend(format!("failed to execute git {}: {e}", args.join(" "))))?;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn run_checked(&self, args: &[&str]) -> Result<String> {
        let out = self.run(args).await?;
        if out.success {
            Ok(out.stdout)
        } else {
            Err(Error::Backend(format!(
                "git {} failed: {}",
                args.join(" "),
                out.combined()
            )))
        }
    }
}

#[async_trait]
impl VcsBackend for GitCli {
    async fn checkout(&self, reference: &str) -> Result<()> {
        self.run_checked(&["checkout", "--quiet", reference]).await?;
        Ok(())
    }

    async fn merge(&self, source: &str, options: &MergeOptions) -> Result<CommandOutput> {
        let mut args = vec!["merge"];
        if options.no_commit {
            args.push("--no-commit");
        }
        if options.no_fast_forward {
            args.push("--no-ff");
        }
        if let Some(message) = options.message.as_deref() {
            args.extend(["-m", message]);
        }
        args.push(source);
        self.run(&args).await
    }

    async fn abort_merge(&self) -> Result<()> {
        self.run_checked(&["merge", "--abort"]).await?;
        Ok(())
    }

    async fn reset_to(&self, reference: &str) -> Result<()> {
        self.run_checked(&["reset", "--hard", "--quiet", reference])
            .await?;
        Ok(())
    }

    async fn conflicted_paths(&self) -> Result<Vec<String>> {
        let stdout = self
            .run_checked(&["diff", "--name-only", "--diff-filter=U"])
            .await?;
        let mut paths: Vec<String> = stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect();
        paths.sort();
        paths.dedup();
        Ok(paths)
    }

    async fn commit_merge(&self, message: &str) -> Result<String> {
        self.run_checked(&["commit", "--quiet", "-m", message])
            .await?;
        self.rev_parse("HEAD").await
    }

    async fn rev_parse(&self, reference: &str) -> Result<String> {
        let stdout = self
            .run_checked(&["rev-parse", "--verify", "--quiet", reference])
            .await?;
        let sha = stdout.trim().to_string();
        if sha.is_empty() {
            return Err(Error::Backend(format!("empty commit id for {reference}")));
        }
        Ok(sha)
    }

    async fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        let out = self
            .run(&["merge-base", "--is-ancestor", ancestor, descendant])
            .await?;
        if out.success {
            return Ok(true);
        }
        // exit 1 means "not an ancestor"; anything else carries an error message
        if out.stderr.trim().is_empty() {
            Ok(false)
        } else {
            Err(Error::Backend(format!(
                "git merge-base --is-ancestor {ancestor} {descendant} failed: {}",
                out.stderr.trim()
            )))
        }
    }

    async fn count_commits(&self, base: &str, head: &str) -> Result<usize> {
        let range = format!("{base}..{head}");
        let stdout = self.run_checked(&["rev-list", "--count", &range]).await?;
        stdout
            .trim()
            .parse()
            .map_err(|e| Error::Backend(format!("unexpected rev-list output '{}': {e}", stdout.trim())))
    }

    async fn merge_in_progress(&self) -> Result<bool> {
        let out = self
            .run(&["rev-parse", "--verify", "--quiet", "MERGE_HEAD"])
            .await?;
        Ok(out.success)
    }

    async fn is_clean(&self) -> Result<bool> {
        let stdout = self
            .run_checked(&["status", "--porcelain", "--untracked-files=no"])
            .await?;
        Ok(stdout.trim().is_empty())
    }

    async fn delete_branch(&self, branch: &str) -> Result<()> {
        self.run_checked(&["branch", "-D", branch]).await?;
        Ok(())
    }

    async fn push(&self, remote: &str, branch: &str) -> Result<()> {
        self.run_checked(&["push", "--quiet", remote, branch]).await?;
        Ok(())
    }

    async fn push_delete_remote_branch(&self, remote: &str, branch: &str) -> Result<()> {
        self.run_checked(&["push", "--quiet", remote, "--delete", branch])
            .await?;
        Ok(())
    }
}
