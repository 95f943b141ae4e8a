//! Lease mutual exclusion under concurrent claimers

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::uninlined_format_args
)]

mod common;

use chrono::Duration;
use refinery_core::{ClaimManager, Error, MrStatus, Submission};

#[tokio::test]
async fn only_one_of_many_concurrent_claimers_wins() {
    let (_dir, store) = common::temp_store().await;
    let mr = store
        .submit(Submission::new("work/a", "main").with_priority(5))
        .await
        .unwrap();
    let claims = ClaimManager::new(store);

    let handles: Vec<_> = (0..12)
        .map(|i| {
            let claims = claims.clone();
            let id = mr.id.clone();
            tokio::spawn(async move { claims.claim(&id, &format!("w{i}")).await })
        })
        .collect();

    let mut winners = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(claimed) => winners.push(claimed.claim.unwrap().worker_id),
            Err(Error::AlreadyClaimed { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(winners.len(), 1, "winners: {:?}", winners);
    let persisted = claims.store().get(&mr.id).await.unwrap();
    assert!(persisted.is_claimed_by(&winners[0]));
    assert_eq!(persisted.status, MrStatus::InProgress);
}

#[tokio::test]
async fn separate_store_handles_share_exclusion() {
    let (dir, store) = common::temp_store().await;
    let mr = store.submit(Submission::new("work/a", "main")).await.unwrap();

    // two independent handles over the same directory, as two processes would have
    let other = refinery_core::MrStore::open(dir.path().join("queue")).await.unwrap();
    let first = ClaimManager::new(store);
    let second = ClaimManager::new(other);

    let (a, b) = tokio::join!(first.claim(&mr.id, "w1"), second.claim(&mr.id, "w2"));
    assert!(a.is_ok() ^ b.is_ok(), "exactly one claim must succeed: {:?} / {:?}", a, b);
}

#[tokio::test]
async fn short_lease_expiry_liberates_work() {
    let (_dir, store) = common::temp_store().await;
    let mr = store.submit(Submission::new("work/a", "main")).await.unwrap();
    let claims = ClaimManager::with_lease(store, Duration::milliseconds(50));

    claims.claim(&mr.id, "w1").await.unwrap();
    assert!(claims.list_unclaimed().await.unwrap().is_empty());
    assert!(matches!(
        claims.claim(&mr.id, "w2").await,
        Err(Error::AlreadyClaimed { .. })
    ));

    tokio::time::sleep(std::time::Duration::from_millis(120)).await;

    let unclaimed = claims.list_unclaimed().await.unwrap();
    assert_eq!(unclaimed.len(), 1);
    let taken = claims.claim(&mr.id, "w2").await.unwrap();
    assert!(taken.is_claimed_by("w2"));
}

#[tokio::test]
async fn claiming_different_records_never_contends() {
    let (_dir, store) = common::temp_store().await;
    let a = store.submit(Submission::new("work/a", "main")).await.unwrap();
    let b = store.submit(Submission::new("work/b", "main")).await.unwrap();
    let claims = ClaimManager::new(store);

    let (ra, rb) = tokio::join!(claims.claim(&a.id, "w1"), claims.claim(&b.id, "w2"));
    assert!(ra.unwrap().is_claimed_by("w1"));
    assert!(rb.unwrap().is_claimed_by("w2"));
}

#[tokio::test]
async fn concurrent_remove_is_idempotent() {
    let (_dir, store) = common::temp_store().await;
    let mr = store.submit(Submission::new("work/a", "main")).await.unwrap();

    let (first, second) = tokio::join!(store.remove(&mr.id), store.remove(&mr.id));
    first.unwrap();
    second.unwrap();
    assert!(matches!(store.get(&mr.id).await, Err(Error::NotFound(_))));
}
