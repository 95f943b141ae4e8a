//! Claim leases over merge requests.
//!
//! A claim is plain data inside the record (`claim` + `status`). Granting or
//! clearing one is a read-check-write of that single file, done under the
//! record's advisory lock and committed with an atomic replace. Expiry is
//! evaluated lazily by whoever reads the record.

use chrono::{Duration, Utc};

use crate::{
    mr::{default_lease, Claim, MergeRequest, MrId, MrStatus},
    store::MrStore,
    Error, Result,
};

/// Grants and clears leases on top of an [`MrStore`].
#[derive(Debug, Clone)]
pub struct ClaimManager {
    store: MrStore,
    lease: Duration,
}

impl ClaimManager {
    /// Manager with the default 10 minute lease
    #[must_use]
    pub fn new(store: MrStore) -> Self {
        Self::with_lease(store, default_lease())
    }

    /// Manager with a custom lease duration
    #[must_use]
    pub const fn with_lease(store: MrStore, lease: Duration) -> Self {
        Self { store, lease }
    }

    #[must_use]
    pub const fn store(&self) -> &MrStore {
        &self.store
    }

    #[must_use]
    pub const fn lease(&self) -> Duration {
        self.lease
    }

    /// Claim `id` for `worker_id`.
    ///
    /// Re-claiming by the current holder renews the lease. An expired claim
    /// by anyone is overwritten.
    ///
    /// # Errors
    ///
    /// - `Error::NotFound` if the record is absent or already closed
    /// - `Error::AlreadyClaimed` if another worker holds an unexpired claim
    /// - `Error::Storage` on I/O failure
    pub async fn claim(&self, id: &MrId, worker_id: &str) -> Result<MergeRequest> {
        let lease = self.lease;
        self.store
            .update(id, |mr| {
                let now = Utc::now();
                if mr.status == MrStatus::Closed {
                    return Err(Error::NotFound(format!("{id} is closed")));
                }
                if let Some(active) = mr.active_claim(now, lease) {
                    if active.worker_id != worker_id {
                        return Err(Error::AlreadyClaimed {
                            id: id.to_string(),
                            holder: active.worker_id.clone(),
                        });
                    }
                } else if let Some(stale) = &mr.claim {
                    tracing::info!(
                        mr_id = %id,
                        previous = %stale.worker_id,
                        worker = %worker_id,
                        "Taking over expired claim"
                    );
                }
                mr.claim = Some(Claim::new(worker_id, now));
                mr.status = MrStatus::InProgress;
                Ok(())
            })
            .await?;

        // Read back so a filesystem with ineffective advisory locks still
        // cannot report two winners.
        let persisted = self.store.get(id).await?;
        match &persisted.claim {
            Some(claim) if claim.worker_id == worker_id => {
                tracing::debug!(mr_id = %id, worker = %worker_id, "Claimed merge request");
                Ok(persisted)
            }
            other => Err(Error::AlreadyClaimed {
                id: id.to_string(),
                holder: other
                    .as_ref()
                    .map_or_else(|| "<released>".to_string(), |c| c.worker_id.clone()),
            }),
        }
    }

    /// Clear the claim and reset the record to `open`, whoever holds it.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the record is absent, `Error::Storage` on I/O failure.
    pub async fn release(&self, id: &MrId) -> Result<MergeRequest> {
        self.release_with(id, |_| {}).await
    }

    /// Release after applying `update` to the record in the same write.
    ///
    /// Used by failure handling to attach the error to the record.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the record is absent, `Error::Storage` on I/O failure.
    pub async fn release_with<F>(&self, id: &MrId, update: F) -> Result<MergeRequest>
    where
        F: FnOnce(&mut MergeRequest) + Send,
    {
        let mr = self
            .store
            .update(id, |mr| {
                update(mr);
                mr.claim = None;
                if mr.status != MrStatus::Closed {
                    mr.status = MrStatus::Open;
                }
                Ok(())
            })
            .await?;
        tracing::debug!(mr_id = %id, "Released claim");
        Ok(mr)
    }

    /// Records with no unexpired claim, in queue order.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` if the store cannot be enumerated.
    pub async fn list_unclaimed(&self) -> Result<Vec<MergeRequest>> {
        let now = Utc::now();
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|mr| mr.is_unclaimed(now, self.lease))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::mr::Submission;

    async fn setup() -> (TempDir, ClaimManager, MergeRequest) {
        let dir = TempDir::new().unwrap();
        let store = MrStore::open(dir.path()).await.unwrap();
        let mr = store
            .submit(Submission::new("work/a", "main").with_priority(5))
            .await
            .unwrap();
        (dir, ClaimManager::new(store), mr)
    }

    async fn backdate_claim(claims: &ClaimManager, id: &MrId, by: Duration) {
        let mut mr = claims.store().get(id).await.unwrap();
        if let Some(claim) = mr.claim.as_mut() {
            claim.claimed_at = claim.claimed_at - by;
        }
        claims.store().put(&mr).await.unwrap();
    }

    #[tokio::test]
    async fn test_claim_sets_in_progress() {
        let (_dir, claims, mr) = setup().await;
        let claimed = claims.claim(&mr.id, "w1").await.unwrap();
        assert_eq!(claimed.status, MrStatus::InProgress);
        assert!(claimed.is_claimed_by("w1"));
    }

    #[tokio::test]
    async fn test_second_worker_is_rejected() {
        let (_dir, claims, mr) = setup().await;
        claims.claim(&mr.id, "w1").await.unwrap();
        let err = claims.claim(&mr.id, "w2").await.unwrap_err();
        assert!(matches!(err, Error::AlreadyClaimed { ref holder, .. } if holder == "w1"));
    }

    #[tokio::test]
    async fn test_same_worker_reclaim_is_idempotent() {
        let (_dir, claims, mr) = setup().await;
        claims.claim(&mr.id, "w1").await.unwrap();
        let again = claims.claim(&mr.id, "w1").await.unwrap();
        assert!(again.is_claimed_by("w1"));
    }

    #[tokio::test]
    async fn test_claim_missing_is_not_found() {
        let (_dir, claims, _mr) = setup().await;
        let err = claims.claim(&MrId::new("mr-ghost"), "w1").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_expired_claim_is_overwritten() {
        let (_dir, claims, mr) = setup().await;
        claims.claim(&mr.id, "w1").await.unwrap();
        backdate_claim(&claims, &mr.id, Duration::minutes(11)).await;

        let unclaimed = claims.list_unclaimed().await.unwrap();
        assert_eq!(unclaimed.len(), 1);

        let taken = claims.claim(&mr.id, "w2").await.unwrap();
        assert!(taken.is_claimed_by("w2"));
        assert!(!taken.is_claimed_by("w1"));
    }

    #[tokio::test]
    async fn test_release_resets_open_regardless_of_holder() {
        let (_dir, claims, mr) = setup().await;
        claims.claim(&mr.id, "w1").await.unwrap();
        let released = claims.release(&mr.id).await.unwrap();
        assert_eq!(released.status, MrStatus::Open);
        assert!(released.claim.is_none());

        claims.claim(&mr.id, "w2").await.unwrap();
    }

    #[tokio::test]
    async fn test_release_with_attaches_error() {
        let (_dir, claims, mr) = setup().await;
        claims.claim(&mr.id, "w1").await.unwrap();
        let released = claims
            .release_with(&mr.id, |r| r.error = Some("conflict in a.txt".into()))
            .await
            .unwrap();
        assert_eq!(released.error.as_deref(), Some("conflict in a.txt"));
        assert_eq!(released.status, MrStatus::Open);
    }

    #[tokio::test]
    async fn test_list_unclaimed_hides_active_claims() {
        let (_dir, claims, mr) = setup().await;
        claims
            .store()
            .submit(Submission::new("work/b", "main").with_priority(9))
            .await
            .unwrap();
        claims.claim(&mr.id, "w1").await.unwrap();

        let unclaimed = claims.list_unclaimed().await.unwrap();
        assert_eq!(unclaimed.len(), 1);
        assert_eq!(unclaimed[0].branch, "work/b");
    }
}
