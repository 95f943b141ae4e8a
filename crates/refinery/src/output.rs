//! Output format selection and printing

use std::io::Write;

use anyhow::{Context, Result};
use serde::Serialize;

/// How command results are written to stdout
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Structured, machine-readable
    Json,
    /// Terminal-friendly text
    #[default]
    Human,
}

impl OutputFormat {
    #[must_use]
    pub const fn from_json_flag(json: bool) -> Self {
        if json {
            Self::Json
        } else {
            Self::Human
        }
    }

    #[must_use]
    pub const fn is_json(&self) -> bool {
        matches!(self, Self::Json)
    }

    /// Print `value` as pretty JSON, or the text built by `human`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the stdout write fails.
    pub fn emit<T, F>(self, value: &T, human: F) -> Result<()>
    where
        T: Serialize + ?Sized,
        F: FnOnce() -> String,
    {
        let text = if self.is_json() {
            serde_json::to_string_pretty(value).context("Failed to serialize output")?
        } else {
            human()
        };
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{text}").context("Failed to write output")
    }
}

/// Shorten `s` to at most `max_len` characters, marking the cut.
#[must_use]
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() > max_len {
        let kept: String = s.chars().take(max_len.saturating_sub(1)).collect();
        format!("{kept}…")
    } else {
        s.to_string()
    }
}
