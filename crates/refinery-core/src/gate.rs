//! Pre-commit test gate for the integration merge.
//!
//! The gate runs after the merge is staged and before it is committed. A
//! failing verdict aborts the merge.

use std::{path::Path, process::Stdio};

use async_trait::async_trait;
use tokio::process::Command;

use crate::{mr::MergeRequest, Error, Result};

/// Outcome of a gate run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateVerdict {
    pub passed: bool,
    /// Failing command and its output, or a short note on success
    pub summary: String,
}

impl GateVerdict {
    #[must_use]
    pub fn pass(summary: impl Into<String>) -> Self {
        Self {
            passed: true,
            summary: summary.into(),
        }
    }

    #[must_use]
    pub fn fail(summary: impl Into<String>) -> Self {
        Self {
            passed: false,
            summary: summary.into(),
        }
    }
}

#[async_trait]
pub trait MergeGate: Send + Sync {
    /// Judge the staged merge of `mr` in `workdir`.
    ///
    /// `Err` means the gate itself could not run; a failing test suite is
    /// `Ok` with `passed == false`.
    async fn run(&self, mr: &MergeRequest, workdir: &Path) -> Result<GateVerdict>;
}

/// Gate that always passes
#[derive(Debug, Clone, Copy, Default)]
pub struct PassGate;

#[async_trait]
impl MergeGate for PassGate {
    async fn run(&self, _mr: &MergeRequest, _workdir: &Path) -> Result<GateVerdict> {
        Ok(GateVerdict::pass("no gate configured"))
    }
}

/// Runs shell commands in order, stopping at the first failure.
#[derive(Debug, Clone)]
pub struct CommandGate {
    commands: Vec<String>,
    shell: String,
}

impl CommandGate {
    #[must_use]
    pub fn new(commands: Vec<String>) -> Self {
        Self {
            commands,
            shell: "sh".to_string(),
        }
    }

    #[must_use]
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    #[must_use]
    pub fn commands(&self) -> &[String] {
        &self.commands
    }
}

#[async_trait]
impl MergeGate for CommandGate {
    async fn run(&self, mr: &MergeRequest, workdir: &Path) -> Result<GateVerdict> {
        for command in &self.commands {
            tracing::info!(mr_id = %mr.id, command = %command, "Running merge gate");
            let output = Command::new(&self.shell)
                .arg("-c")
                .arg(command)
                .current_dir(workdir)
                .env("REFINERY_MR_ID", mr.id.as_str())
                .env("REFINERY_BRANCH", &mr.branch)
                .env("REFINERY_TARGET", &mr.target)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output()
                .await
                .map_err(|e| Error::Backend(format!("failed to run gate '{command}': {e}")))?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let stdout = String::from_utf8_lossy(&output.stdout);
                let detail = if stderr.trim().is_empty() {
                    stdout.trim().to_string()
                } else {
                    stderr.trim().to_string()
                };
                let code = output
                    .status
                    .code()
                    .map_or_else(|| "signal".to_string(), |c| c.to_string());
                return Ok(GateVerdict::fail(format!(
                    "gate '{command}' failed (exit {code}): {detail}"
                )));
            }
        }
        Ok(GateVerdict::pass(format!(
            "{} gate command(s) passed",
            self.commands.len()
        )))
    }
}
