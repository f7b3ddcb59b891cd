use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::scheduler::{JobSummary, OfferHandle, OfferStatus};
use crate::worker::WorkerId;

/// What the worker's device receives while an offer is open.
#[derive(Debug, Clone, Serialize)]
pub struct OfferNotification {
    pub offer_id: Uuid,
    pub worker_id: WorkerId,
    pub job: JobSummary,
    pub deadline_at: DateTime<Utc>,
    pub remaining_secs: u64,
    pub attempt: u32,
}

/// Sink for offer alerts. `notify` is called with the offer locked and must
/// return promptly.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &OfferNotification);
}

/// Writes alerts to the log only.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, n: &OfferNotification) {
        tracing::info!(
            offer_id = %n.offer_id,
            worker_id = %n.worker_id,
            job_id = %n.job.job_id,
            attempt = n.attempt,
            remaining_secs = n.remaining_secs,
            "Offer alert"
        );
    }
}

/// Fans alerts out to connected worker clients.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<OfferNotification>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OfferNotification> {
        self.tx.subscribe()
    }
}

impl Notifier for BroadcastNotifier {
    fn notify(&self, n: &OfferNotification) {
        // Nobody listening is not an error; the worker reconnects and polls.
        let _ = self.tx.send(n.clone());
    }
}

/// Every sink in order.
impl Notifier for Vec<Arc<dyn Notifier>> {
    fn notify(&self, n: &OfferNotification) {
        for sink in self {
            sink.notify(n);
        }
    }
}

/// Repeats offer alerts until the offer resolves.
#[derive(Clone)]
pub struct AlertDispatcher {
    notifier: Arc<dyn Notifier>,
    interval: Duration,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl AlertDispatcher {
    pub fn new(
        notifier: Arc<dyn Notifier>,
        interval: Duration,
        tracker: TaskTracker,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            notifier,
            interval,
            tracker,
            shutdown,
        }
    }

    /// Alert immediately, then every `interval`, until the offer leaves
    /// PENDING.
    pub fn start(&self, offer: Arc<OfferHandle>, job: JobSummary) {
        let notifier = self.notifier.clone();
        let shutdown = self.shutdown.clone();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.tracker.spawn(async move {
            let mut attempt = 0u32;
            loop {
                tokio::select! {
                    biased;
                    _ = offer.cancelled() => break,
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        // Resolution cancels under this same lock, so a
                        // PENDING read here means the offer is still open.
                        let state = offer.lock().await;
                        if state.status != OfferStatus::Pending {
                            break;
                        }
                        if offer.has_passed_deadline() {
                            continue;
                        }
                        attempt += 1;
                        notifier.notify(&OfferNotification {
                            offer_id: offer.id,
                            worker_id: offer.worker_id.clone(),
                            job: job.clone(),
                            deadline_at: state.deadline_at,
                            remaining_secs: offer.remaining().as_secs(),
                            attempt,
                        });
                    }
                }
            }
            tracing::debug!(offer_id = %offer.id, alerts = attempt, "Offer alerts stopped");
        });
    }
}
