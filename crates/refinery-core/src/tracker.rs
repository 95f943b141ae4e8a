//! Issue tracker seam.
//!
//! The engine reports outcomes to an external tracker: it annotates the MR,
//! closes the source issue on merge, and clears the back-reference the
//! originating actor keeps to the MR. All calls are best-effort from the
//! engine's point of view.

use async_trait::async_trait;
use tokio::process::Command;

use crate::{Error, Result};

/// Field on the actor record that points back at the MR it is waiting on
pub const DEFAULT_BACK_REFERENCE_FIELD: &str = "active_mr";

#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// Set `fields` on the tracker entry of merge request `mr_id`.
    async fn update_mr_fields(&self, mr_id: &str, fields: &[(String, String)]) -> Result<()>;

    /// Close `issue` with a human readable reason.
    async fn close(&self, issue: &str, reason: &str) -> Result<()>;

    /// Clear the MR back-reference on the actor record `actor`.
    async fn clear_back_reference(&self, actor: &str) -> Result<()>;
}

/// Tracker that accepts every call and does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTracker;

#[async_trait]
impl IssueTracker for NullTracker {
    async fn update_mr_fields(&self, _mr_id: &str, _fields: &[(String, String)]) -> Result<()> {
        Ok(())
    }

    async fn close(&self, _issue: &str, _reason: &str) -> Result<()> {
        Ok(())
    }

    async fn clear_back_reference(&self, _actor: &str) -> Result<()> {
        Ok(())
    }
}

/// Tracker driven through a `bd`-style command line.
///
/// - `<program> update <id> --<field> <value> ...`
/// - `<program> close <issue> --reason <reason>`
/// - `<program> update <actor> --<back-reference-field> ""`
#[derive(Debug, Clone)]
pub struct CommandTracker {
    program: String,
    back_reference_field: String,
}

impl CommandTracker {
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            back_reference_field: DEFAULT_BACK_REFERENCE_FIELD.to_string(),
        }
    }

    #[must_use]
    pub fn with_back_reference_field(mut self, field: impl Into<String>) -> Self {
        self.back_reference_field = field.into();
        self
    }

    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    async fn run(&self, args: Vec<String>) -> Result<()> {
        let output = Command::new(&self.program)
            .args(&args)
            .output()
            .await
            .map_err(|e| Error::Tracker(format!("failed to execute {}: {e}", self.program)))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(Error::Tracker(format!(
                "{} {} failed: {}",
                self.program,
                args.first().map_or("", String::as_str),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

/// Arguments for `update <id> --<field> <value> ...`
fn update_args(id: &str, fields: &[(String, String)]) -> Vec<String> {
    let mut args = vec!["update".to_string(), id.to_string()];
    for (field, value) in fields {
        args.push(format!("--{field}"));
        args.push(value.clone());
    }
    args
}

#[async_trait]
impl IssueTracker for CommandTracker {
    async fn update_mr_fields(&self, mr_id: &str, fields: &[(String, String)]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        self.run(update_args(mr_id, fields)).await
    }

    async fn close(&self, issue: &str, reason: &str) -> Result<()> {
        self.run(vec![
            "close".to_string(),
            issue.to_string(),
            "--reason".to_string(),
            reason.to_string(),
        ])
        .await
    }

    async fn clear_back_reference(&self, actor: &str) -> Result<()> {
        self.run(update_args(
            actor,
            &[(self.back_reference_field.clone(), String::new())],
        ))
        .await
    }
}
