pub mod assigner;
pub mod job;
pub mod offer;
pub mod registry;
pub mod timer;

pub use assigner::{JobSummary, OfferScheduler, OfferView};
pub use job::{Job, JobFilter, JobId, JobStatus};
pub use offer::{Offer, OfferBook, OfferHandle, OfferStatus};
pub use registry::{JobListing, JobRegistry};
pub use timer::DeadlineTimer;

use chrono::Utc;
use tokio::sync::mpsc;

use crate::incident::{IncidentKind, IncidentReporter};
use crate::worker::{HistoryEntry, TaskOutcome, WorkerDirectory, WorkerId};

/// Wake-ups for the dispatch loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchEvent {
    /// A job entered PENDING (new or requeued)
    JobPending(JobId),
    /// A worker entered IDLE (came online or finished)
    WorkerIdle(WorkerId),
}

/// Non-blocking handle for raising [`DispatchEvent`]s.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<DispatchEvent>,
}

impl EventSender {
    pub fn new(tx: mpsc::Sender<DispatchEvent>) -> Self {
        Self { tx }
    }

    /// Never waits. A dropped event is recovered by the periodic sweep.
    pub fn emit(&self, event: DispatchEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::debug!(event = ?event, "Dispatch queue full, leaving event to the sweep");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

/// A job/worker pair that just came apart without completing.
#[derive(Debug, Clone)]
pub(crate) struct Requeued {
    pub job_id: JobId,
    pub address: String,
    pub worker_id: WorkerId,
    pub worker_label: String,
}

impl Requeued {
    /// Side effects shared by reject, expiry and abandon: one incident, one
    /// history line, and wake-ups for both the job and the worker.
    pub(crate) async fn announce(
        self,
        kind: IncidentKind,
        outcome: TaskOutcome,
        message: String,
        incidents: &IncidentReporter,
        workers: &WorkerDirectory,
        events: &EventSender,
    ) {
        incidents
            .append(self.job_id.clone(), self.worker_id.clone(), kind, message)
            .await;
        workers
            .record(
                &self.worker_id,
                HistoryEntry {
                    job_id: self.job_id.clone(),
                    address: self.address,
                    outcome,
                    at: Utc::now(),
                },
            )
            .await;
        events.emit(DispatchEvent::JobPending(self.job_id));
        events.emit(DispatchEvent::WorkerIdle(self.worker_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_never_blocks_on_a_full_queue() {
        let (tx, mut rx) = mpsc::channel(1);
        let events = EventSender::new(tx);

        events.emit(DispatchEvent::JobPending(JobId::from("a")));
        events.emit(DispatchEvent::JobPending(JobId::from("b")));

        assert_eq!(rx.recv().await, Some(DispatchEvent::JobPending(JobId::from("a"))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn emit_ignores_a_closed_queue() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        EventSender::new(tx).emit(DispatchEvent::WorkerIdle(WorkerId::from("w1")));
    }
}
