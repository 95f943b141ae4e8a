//! Derived queue view.
//!
//! Recomputed from the live record set on every query; never persisted.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::mr::{MergeRequest, MrStatus};

/// A merge request annotated with its place in the queue
#[derive(Debug, Clone, Serialize)]
pub struct QueueItem {
    /// 0 = currently processing, 1..N = pending order
    pub position: usize,
    /// Human readable age, e.g. `12m`
    pub age: String,
    #[serde(flatten)]
    pub mr: MergeRequest,
}

/// Build the queue view from records already in queue order.
///
/// Records under an active lease get position 0; the rest are numbered
/// from 1. Closed records are not part of the queue.
#[must_use]
pub fn build_queue(records: Vec<MergeRequest>, now: DateTime<Utc>, lease: Duration) -> Vec<QueueItem> {
    let (processing, pending): (Vec<_>, Vec<_>) = records
        .into_iter()
        .filter(|mr| mr.status != MrStatus::Closed)
        .partition(|mr| mr.active_claim(now, lease).is_some());

    let processing = processing.into_iter().map(|mr| (0, mr));
    let pending = pending.into_iter().enumerate().map(|(i, mr)| (i + 1, mr));

    processing
        .chain(pending)
        .map(|(position, mr)| QueueItem {
            position,
            age: format_age(now - mr.created_at),
            mr,
        })
        .collect()
}

/// Compact age string: `45s`, `12m`, `3h`, `2d`.
#[must_use]
pub fn format_age(age: Duration) -> String {
    let secs = age.num_seconds().max(0);
    match secs {
        s if s < 60 => format!("{s}s"),
        s if s < 3600 => format!("{}m", s / 60),
        s if s < 86_400 => format!("{}h", s / 3600),
        s => format!("{}d", s / 86_400),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mr::{default_lease, Claim, MrId, Submission};

    fn record(id: &str, priority: i32, created_at: DateTime<Utc>) -> MergeRequest {
        Submission::new(format!("work/{id}"), "main")
            .with_priority(priority)
            .into_record(MrId::new(id), created_at)
    }

    #[test]
    fn test_format_age() {
        assert_eq!(format_age(Duration::seconds(45)), "45s");
        assert_eq!(format_age(Duration::minutes(12)), "12m");
        assert_eq!(format_age(Duration::hours(3)), "3h");
        assert_eq!(format_age(Duration::days(2)), "2d");
        assert_eq!(format_age(Duration::seconds(-5)), "0s");
    }

    #[test]
    fn test_positions() {
        let now = Utc::now();
        let mut claimed = record("b", 2, now - Duration::minutes(5));
        claimed.claim = Some(Claim::new("w1", now));
        claimed.status = MrStatus::InProgress;
        let mut closed = record("z", 0, now);
        closed.status = MrStatus::Closed;

        let items = build_queue(
            vec![closed, record("a", 1, now), claimed, record("c", 3, now)],
            now,
            default_lease(),
        );
        let view: Vec<_> = items
            .iter()
            .map(|i| (i.position, i.mr.id.as_str().to_string()))
            .collect();
        assert_eq!(
            view,
            vec![(0, "b".into()), (1, "a".into()), (2, "c".into())]
        );
        assert_eq!(items[0].age, "5m");
    }

    #[test]
    fn test_expired_claim_is_pending() {
        let now = Utc::now();
        let mut stale = record("a", 1, now);
        stale.claim = Some(Claim::new("w1", now - Duration::minutes(30)));
        stale.status = MrStatus::InProgress;

        let items = build_queue(vec![stale], now, default_lease());
        assert_eq!(items[0].position, 1);
    }
}
