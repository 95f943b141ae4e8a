//! Event log listing

use std::fmt::Write as _;

use anyhow::{Context, Result};
use refinery_core::EventRecord;

use crate::context::AppContext;

/// Events command options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventsOptions {
    /// Only the last N events
    pub tail: Option<usize>,
    /// Rig log to read; the configured rig when unset
    pub rig: Option<String>,
}

/// # Errors
///
/// Returns an error if the event log exists but cannot be read.
pub async fn run(ctx: &AppContext, options: &EventsOptions) -> Result<()> {
    let rig = options.rig.clone().unwrap_or_else(|| ctx.config.rig_name());
    let log = ctx.events();
    let events = match options.tail {
        Some(n) => log.tail(&rig, n).await,
        None => log.read_all(&rig).await,
    }
    .with_context(|| format!("Failed to read events for rig {rig}"))?;

    ctx.format.emit(&events, || render(&events))
}

fn render(events: &[EventRecord]) -> String {
    if events.is_empty() {
        return "No events".to_string();
    }
    let mut out = String::new();
    for event in events {
        let _ = write!(
            out,
            "{}  {:<14} {}",
            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
            event.event_type,
            event.mr_id
        );
        if let Some(worker) = &event.worker {
            let _ = write!(out, " [{worker}]");
        }
        if let Some(commit) = &event.merge_commit {
            let _ = write!(out, " {commit}");
        }
        if let Some(error) = &event.error {
            let _ = write!(out, " {error}");
        }
        out.push('\n');
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use refinery_core::{MrId, Submission};

    use super::*;

    #[test]
    fn test_render_merged_event() {
        let mr = Submission::new("work/a", "main").into_record(MrId::new("mr-1"), Utc::now());
        let mut event = EventRecord::merged(&mr, "w1", "abc123");
        event.timestamp = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(
            render(&[event]),
            "2026-01-02 03:04:05  merged         mr-1 [w1] abc123"
        );
    }

    #[test]
    fn test_render_empty() {
        assert_eq!(render(&[]), "No events");
    }
}
