//! Operator-facing incident log.
//!
//! Every rejected or timed-out offer produces one [`IncidentReport`]. Appending
//! never fails and never waits on storage:
//!
//! 1. The report is added to the in-memory feed and broadcast to live
//!    subscribers (the operator console stream).
//! 2. An [`IncidentWriter`] task persists it through an [`IncidentStore`],
//!    retrying with exponential backoff.
//! 3. Reports that still fail are parked and retried by [`IncidentReporter::replay`],
//!    which the node calls on every sweep.

pub mod store;

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::IncidentConfig;
use crate::scheduler::JobId;
use crate::worker::WorkerId;

pub use store::{IncidentStore, JsonlIncidentStore, MemoryIncidentStore};

const LIVE_FEED_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentKind {
    Rejected,
    TimedOut,
}

impl std::fmt::Display for IncidentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IncidentKind::Rejected => f.pad("rejected"),
            IncidentKind::TimedOut => f.pad("timed_out"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentReport {
    pub id: Uuid,
    pub job_id: JobId,
    pub worker_id: WorkerId,
    pub kind: IncidentKind,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl IncidentReport {
    pub fn new(
        job_id: JobId,
        worker_id: WorkerId,
        kind: IncidentKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            worker_id,
            kind,
            timestamp: Utc::now(),
            message: message.into(),
        }
    }
}

type ReplayQueue = Arc<Mutex<VecDeque<IncidentReport>>>;

pub struct IncidentReporter {
    feed: RwLock<Vec<IncidentReport>>,
    live: broadcast::Sender<IncidentReport>,
    writer_tx: mpsc::UnboundedSender<IncidentReport>,
    replay: ReplayQueue,
    store: Arc<dyn IncidentStore>,
}

impl IncidentReporter {
    /// Create the reporter and the writer task that persists its reports.
    /// The writer must be spawned for reports to reach the store.
    pub fn new(store: Arc<dyn IncidentStore>, config: IncidentConfig) -> (Self, IncidentWriter) {
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (live, _) = broadcast::channel(LIVE_FEED_CAPACITY);
        let replay: ReplayQueue = Arc::new(Mutex::new(VecDeque::new()));

        let reporter = Self {
            feed: RwLock::new(Vec::new()),
            live,
            writer_tx,
            replay: replay.clone(),
            store: store.clone(),
        };
        let writer = IncidentWriter {
            rx: writer_rx,
            store,
            replay,
            config,
        };
        (reporter, writer)
    }

    /// Load previously persisted incidents into the feed.
    pub async fn restore(&self) -> usize {
        match self.store.load().await {
            Ok(reports) => {
                let count = reports.len();
                let mut feed = self.feed.write().await;
                let mut restored = reports;
                restored.append(&mut feed);
                *feed = restored;
                count
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not restore incident log");
                0
            }
        }
    }

    /// Record an incident. Storage problems are handled internally.
    pub async fn append(
        &self,
        job_id: JobId,
        worker_id: WorkerId,
        kind: IncidentKind,
        message: impl Into<String>,
    ) -> IncidentReport {
        let report = IncidentReport::new(job_id, worker_id, kind, message);
        self.feed.write().await.push(report.clone());
        // No subscribers is fine.
        let _ = self.live.send(report.clone());

        if self.writer_tx.send(report.clone()).is_err() {
            tracing::warn!(incident_id = %report.id, "Incident writer stopped, parking report");
            self.replay.lock().await.push_back(report.clone());
        }

        tracing::info!(
            incident_id = %report.id,
            job_id = %report.job_id,
            worker_id = %report.worker_id,
            kind = %report.kind,
            "Incident recorded"
        );
        report
    }

    /// All incidents, oldest first.
    pub async fn feed(&self) -> Vec<IncidentReport> {
        self.feed.read().await.clone()
    }

    pub async fn for_job(&self, job_id: &JobId) -> Vec<IncidentReport> {
        self.feed
            .read()
            .await
            .iter()
            .filter(|r| &r.job_id == job_id)
            .cloned()
            .collect()
    }

    /// Live stream of new incidents.
    pub fn subscribe(&self) -> broadcast::Receiver<IncidentReport> {
        self.live.subscribe()
    }

    /// Reports waiting for storage to come back.
    pub async fn parked(&self) -> usize {
        self.replay.lock().await.len()
    }

    /// One write attempt per parked report. Returns how many were persisted.
    pub async fn replay(&self) -> usize {
        let parked: Vec<IncidentReport> = self.replay.lock().await.drain(..).collect();
        if parked.is_empty() {
            return 0;
        }

        let mut persisted = 0;
        let mut still_failing = Vec::new();
        for report in parked {
            match self.store.append(&report).await {
                Ok(()) => persisted += 1,
                Err(e) => {
                    tracing::debug!(incident_id = %report.id, error = %e, "Replay attempt failed");
                    still_failing.push(report);
                }
            }
        }

        if !still_failing.is_empty() {
            let mut queue = self.replay.lock().await;
            for report in still_failing.into_iter().rev() {
                queue.push_front(report);
            }
        }
        if persisted > 0 {
            tracing::info!(persisted, "Replayed parked incidents");
        }
        persisted
    }
}

/// Background task that moves incidents into the durable store.
pub struct IncidentWriter {
    rx: mpsc::UnboundedReceiver<IncidentReport>,
    store: Arc<dyn IncidentStore>,
    replay: ReplayQueue,
    config: IncidentConfig,
}

impl IncidentWriter {
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                report = self.rx.recv() => {
                    let Some(report) = report else { break };
                    self.persist(report).await;
                }
                _ = shutdown.cancelled() => {
                    // Flush what is already queued, without retries.
                    while let Ok(report) = self.rx.try_recv() {
                        if self.store.append(&report).await.is_err() {
                            tracing::error!(incident_id = %report.id, "Incident lost on shutdown");
                        }
                    }
                    break;
                }
            }
        }
        tracing::debug!("Incident writer stopped");
    }

    async fn persist(&self, report: IncidentReport) {
        let max_attempts = self.config.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            match self.store.append(&report).await {
                Ok(()) => return,
                Err(e) if attempt < max_attempts => {
                    let delay = self.jittered(self.config.backoff_for(attempt));
                    tracing::warn!(
                        incident_id = %report.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Incident write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    tracing::error!(
                        incident_id = %report.id,
                        job_id = %report.job_id,
                        worker_id = %report.worker_id,
                        kind = %report.kind,
                        message = %report.message,
                        error = %e,
                        "Incident write failed, parked for replay"
                    );
                }
            }
        }
        self.replay.lock().await.push_back(report);
    }

    fn jittered(&self, delay: std::time::Duration) -> std::time::Duration {
        let spread = (delay.as_millis() as u64) / 10;
        if spread == 0 {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(0..=spread);
        delay + std::time::Duration::from_millis(jitter)
    }
}
