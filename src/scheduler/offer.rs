use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::scheduler::job::JobId;
use crate::worker::WorkerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OfferStatus {
    Pending,
    Accepted,
    Rejected,
    Expired,
}

impl std::fmt::Display for OfferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OfferStatus::Pending => f.pad("pending"),
            OfferStatus::Accepted => f.pad("accepted"),
            OfferStatus::Rejected => f.pad("rejected"),
            OfferStatus::Expired => f.pad("expired"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Offer {
    pub id: Uuid,
    pub job_id: JobId,
    pub worker_id: WorkerId,
    pub created_at: DateTime<Utc>,
    pub deadline_at: DateTime<Utc>,
    pub status: OfferStatus,
    pub resolved_at: Option<DateTime<Utc>>,
    /// Worker-supplied reason on rejection
    pub reason: Option<String>,
}

/// A live or resolved offer.
///
/// `deadline` is on the monotonic tokio clock and is what expiry is enforced
/// against; `Offer::deadline_at` is the wall-clock rendering of it. The
/// cancellation token is shared with the offer's timer and alert tasks and is
/// cancelled while `state` is locked, in the same step that resolves it.
#[derive(Debug)]
pub struct OfferHandle {
    pub id: Uuid,
    pub job_id: JobId,
    pub worker_id: WorkerId,
    pub deadline: Instant,
    state: Mutex<Offer>,
    cancel: CancellationToken,
}

impl OfferHandle {
    pub fn new(job_id: JobId, worker_id: WorkerId, window: Duration) -> Self {
        let created_at = Utc::now();
        let deadline_at = created_at
            + chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::seconds(300));
        let id = Uuid::new_v4();

        Self {
            id,
            job_id: job_id.clone(),
            worker_id: worker_id.clone(),
            deadline: Instant::now() + window,
            state: Mutex::new(Offer {
                id,
                job_id,
                worker_id,
                created_at,
                deadline_at,
                status: OfferStatus::Pending,
                resolved_at: None,
                reason: None,
            }),
            cancel: CancellationToken::new(),
        }
    }

    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, Offer> {
        self.state.lock().await
    }

    pub async fn snapshot(&self) -> Offer {
        self.state.lock().await.clone()
    }

    /// Move a PENDING offer to its final status and cancel its tasks.
    /// `offer` must be the guard obtained from [`OfferHandle::lock`].
    pub(crate) fn resolve(
        &self,
        offer: &mut Offer,
        status: OfferStatus,
        reason: Option<String>,
    ) -> Result<()> {
        if offer.status != OfferStatus::Pending {
            return Err(DispatchError::OfferAlreadyResolved {
                offer_id: self.id,
                status: offer.status,
            });
        }
        offer.status = status;
        offer.resolved_at = Some(Utc::now());
        offer.reason = reason;
        self.cancel.cancel();
        Ok(())
    }

    pub fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn is_resolved(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Accepting is still allowed at exactly the deadline.
    pub fn has_passed_deadline(&self) -> bool {
        Instant::now() > self.deadline
    }

    /// The timer's view: the deadline instant has arrived.
    pub fn deadline_reached(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Time left to answer, zero once the deadline has passed.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Index of offers by id.
#[derive(Default)]
pub struct OfferBook {
    offers: RwLock<HashMap<Uuid, Arc<OfferHandle>>>,
}

impl OfferBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn insert(&self, handle: OfferHandle) -> Arc<OfferHandle> {
        let handle = Arc::new(handle);
        self.offers.write().await.insert(handle.id, handle.clone());
        handle
    }

    pub async fn get(&self, id: &Uuid) -> Result<Arc<OfferHandle>> {
        self.offers
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or(DispatchError::OfferNotFound(*id))
    }

    /// Unresolved offers.
    pub async fn pending(&self) -> Vec<Arc<OfferHandle>> {
        self.offers
            .read()
            .await
            .values()
            .filter(|h| !h.is_resolved())
            .cloned()
            .collect()
    }

    /// The unresolved offer held by `worker_id`, if any.
    pub async fn pending_for_worker(&self, worker_id: &WorkerId) -> Option<Arc<OfferHandle>> {
        self.offers
            .read()
            .await
            .values()
            .find(|h| &h.worker_id == worker_id && !h.is_resolved())
            .cloned()
    }

    pub async fn snapshot(&self) -> Vec<Offer> {
        let handles: Vec<Arc<OfferHandle>> = self.offers.read().await.values().cloned().collect();
        let mut offers = Vec::with_capacity(handles.len());
        for handle in handles {
            offers.push(handle.snapshot().await);
        }
        offers.sort_by_key(|o| o.created_at);
        offers
    }

    /// Forget resolved offers whose deadline passed before `cutoff`.
    pub async fn prune_resolved(&self, cutoff: DateTime<Utc>) -> usize {
        let handles: Vec<Arc<OfferHandle>> = self
            .offers
            .read()
            .await
            .values()
            .filter(|h| h.is_resolved())
            .cloned()
            .collect();

        let mut stale = Vec::new();
        for handle in handles {
            if handle.snapshot().await.deadline_at < cutoff {
                stale.push(handle.id);
            }
        }

        let mut offers = self.offers.write().await;
        for id in &stale {
            offers.remove(id);
        }
        stale.len()
    }
}
