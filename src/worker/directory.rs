use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::error::{DispatchError, Result};
use crate::geo::Coordinate;
use crate::scheduler::JobId;

const HISTORY_LIMIT: usize = 100;

/// Identifier chosen at registration (login or badge number).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub String);

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for WorkerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    Offline,
    Idle,
    Offered,
    Busy,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Offline => f.pad("offline"),
            WorkerStatus::Idle => f.pad("idle"),
            WorkerStatus::Offered => f.pad("offered"),
            WorkerStatus::Busy => f.pad("busy"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub name: String,
    pub contact: String,
    /// Plate or truck number, shown in incident messages
    pub vehicle: Option<String>,
    pub status: WorkerStatus,
    pub location: Option<Coordinate>,
    pub location_at: Option<DateTime<Utc>>,
    pub active_job_id: Option<JobId>,
    pub registered_at: DateTime<Utc>,
}

impl Worker {
    pub fn new(id: impl Into<WorkerId>, name: impl Into<String>, contact: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            contact: contact.into(),
            vehicle: None,
            status: WorkerStatus::Offline,
            location: None,
            location_at: None,
            active_job_id: None,
            registered_at: Utc::now(),
        }
    }

    pub fn with_vehicle(mut self, vehicle: impl Into<String>) -> Self {
        self.vehicle = Some(vehicle.into());
        self
    }

    /// "Name (PLATE)" or just the name.
    pub fn label(&self) -> String {
        match &self.vehicle {
            Some(vehicle) => format!("{} ({})", self.name, vehicle),
            None => self.name.clone(),
        }
    }

    fn expect_status(&self, expected: WorkerStatus) -> Result<()> {
        if self.status != expected {
            return Err(DispatchError::WorkerConflict {
                worker_id: self.id.clone(),
                expected,
                actual: self.status,
            });
        }
        Ok(())
    }

    /// IDLE -> OFFERED for `job_id`.
    pub(crate) fn assign(&mut self, job_id: &JobId) -> Result<()> {
        self.expect_status(WorkerStatus::Idle)?;
        self.status = WorkerStatus::Offered;
        self.active_job_id = Some(job_id.clone());
        Ok(())
    }

    /// OFFERED -> BUSY.
    pub(crate) fn engage(&mut self) -> Result<()> {
        self.expect_status(WorkerStatus::Offered)?;
        self.status = WorkerStatus::Busy;
        Ok(())
    }

    /// OFFERED or BUSY -> IDLE. Returns the job the worker was holding.
    pub(crate) fn release(&mut self) -> Result<Option<JobId>> {
        match self.status {
            WorkerStatus::Offered | WorkerStatus::Busy => {
                self.status = WorkerStatus::Idle;
                Ok(self.active_job_id.take())
            }
            actual => Err(DispatchError::WorkerConflict {
                worker_id: self.id.clone(),
                expected: WorkerStatus::Busy,
                actual,
            }),
        }
    }

    /// activeJobId is set exactly while the worker is OFFERED or BUSY.
    pub fn is_consistent(&self) -> bool {
        matches!(self.status, WorkerStatus::Offered | WorkerStatus::Busy)
            == self.active_job_id.is_some()
    }
}

#[derive(Debug, Clone, Copy)]
struct Ping {
    at: DateTime<Utc>,
    coordinate: Coordinate,
}

/// Last-write-wins location cell. Kept apart from the status lock so pings
/// never contend with offers.
#[derive(Debug, Default)]
struct LocationRegister {
    ping: std::sync::Mutex<Option<Ping>>,
}

impl LocationRegister {
    fn update(&self, coordinate: Coordinate, at: DateTime<Utc>) -> bool {
        let mut ping = self.ping.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(*ping, Some(current) if at < current.at) {
            return false;
        }
        *ping = Some(Ping { at, coordinate });
        true
    }

    fn read(&self) -> Option<Ping> {
        *self.ping.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct WorkerSlot {
    seq: u64,
    cell: Arc<Mutex<Worker>>,
    location: Arc<LocationRegister>,
}

/// An IDLE worker considered for an offer.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: WorkerId,
    pub seq: u64,
    pub location: Option<Coordinate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskOutcome {
    Completed,
    Rejected,
    TimedOut,
    Abandoned,
}

/// One line of a worker's task history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub job_id: JobId,
    pub address: String,
    pub outcome: TaskOutcome,
    pub at: DateTime<Utc>,
}

/// Authoritative worker state.
#[derive(Default)]
pub struct WorkerDirectory {
    workers: RwLock<HashMap<WorkerId, WorkerSlot>>,
    history: RwLock<HashMap<WorkerId, VecDeque<HistoryEntry>>>,
    next_seq: AtomicU64,
}

impl WorkerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker. New workers start OFFLINE.
    pub async fn register(&self, mut worker: Worker) -> Result<Worker> {
        let mut workers = self.workers.write().await;
        if workers.contains_key(&worker.id) {
            return Err(DispatchError::DuplicateWorker(worker.id));
        }

        let location = Arc::new(LocationRegister::default());
        if let Some(coordinate) = worker.location {
            location.update(coordinate, worker.location_at.unwrap_or_else(Utc::now));
        }
        worker.status = WorkerStatus::Offline;
        worker.active_job_id = None;

        workers.insert(
            worker.id.clone(),
            WorkerSlot {
                seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                cell: Arc::new(Mutex::new(worker.clone())),
                location,
            },
        );
        tracing::info!(worker_id = %worker.id, name = %worker.name, "Worker registered");
        Ok(worker)
    }

    /// Current state including the latest location.
    pub async fn get(&self, id: &WorkerId) -> Result<Worker> {
        let (cell, location) = self.handles(id).await?;
        let mut worker = cell.lock().await.clone();
        Self::overlay_location(&mut worker, &location);
        Ok(worker)
    }

    /// OFFLINE <-> IDLE. Workers holding an offer or a job cannot toggle.
    pub async fn set_online(&self, id: &WorkerId, online: bool) -> Result<Worker> {
        let mut worker = self.lock(id).await?;
        match (worker.status, online) {
            (WorkerStatus::Offline, true) => worker.status = WorkerStatus::Idle,
            (WorkerStatus::Idle, false) => worker.status = WorkerStatus::Offline,
            (WorkerStatus::Offline, false) | (WorkerStatus::Idle, true) => {}
            (status @ (WorkerStatus::Offered | WorkerStatus::Busy), _) => {
                return Err(DispatchError::WorkerBusy {
                    worker_id: worker.id.clone(),
                    status,
                });
            }
        }
        tracing::info!(worker_id = %worker.id, status = %worker.status, "Worker availability changed");
        Ok(worker.clone())
    }

    /// Record a location ping. Pings older than the stored one are ignored.
    pub async fn update_location(
        &self,
        id: &WorkerId,
        coordinate: Coordinate,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        if !coordinate.is_valid() {
            return Err(DispatchError::InvalidRequest(format!(
                "coordinate out of range: {}",
                coordinate
            )));
        }
        let (_, location) = self.handles(id).await?;
        let applied = location.update(coordinate, at);
        if !applied {
            tracing::debug!(worker_id = %id, at = %at, "Stale location ping discarded");
        }
        Ok(applied)
    }

    /// Workers currently IDLE, in registration order.
    pub async fn idle_candidates(&self) -> Vec<Candidate> {
        let mut slots = self.slots().await;
        slots.sort_by_key(|(seq, _, _)| *seq);

        let mut candidates = Vec::new();
        for (seq, cell, location) in slots {
            let worker = cell.lock().await;
            if worker.status == WorkerStatus::Idle {
                candidates.push(Candidate {
                    id: worker.id.clone(),
                    seq,
                    location: location.read().map(|p| p.coordinate),
                });
            }
        }
        candidates
    }

    /// Location of a single worker without touching its status lock.
    pub async fn location_of(&self, id: &WorkerId) -> Option<Coordinate> {
        let (_, location) = self.handles(id).await.ok()?;
        location.read().map(|p| p.coordinate)
    }

    /// All workers in registration order.
    pub async fn snapshot(&self) -> Vec<Worker> {
        let mut slots = self.slots().await;
        slots.sort_by_key(|(seq, _, _)| *seq);

        let mut workers = Vec::with_capacity(slots.len());
        for (_, cell, location) in slots {
            let mut worker = cell.lock().await.clone();
            Self::overlay_location(&mut worker, &location);
            workers.push(worker);
        }
        workers
    }

    pub(crate) async fn lock(&self, id: &WorkerId) -> Result<OwnedMutexGuard<Worker>> {
        let (cell, _) = self.handles(id).await?;
        Ok(cell.lock_owned().await)
    }

    pub(crate) async fn record(&self, id: &WorkerId, entry: HistoryEntry) {
        let mut history = self.history.write().await;
        let entries = history.entry(id.clone()).or_default();
        entries.push_front(entry);
        entries.truncate(HISTORY_LIMIT);
    }

    /// Task history, newest first.
    pub async fn history(&self, id: &WorkerId) -> Result<Vec<HistoryEntry>> {
        self.handles(id).await?;
        Ok(self
            .history
            .read()
            .await
            .get(id)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn handles(&self, id: &WorkerId) -> Result<(Arc<Mutex<Worker>>, Arc<LocationRegister>)> {
        self.workers
            .read()
            .await
            .get(id)
            .map(|slot| (slot.cell.clone(), slot.location.clone()))
            .ok_or_else(|| DispatchError::WorkerNotFound(id.clone()))
    }

    async fn slots(&self) -> Vec<(u64, Arc<Mutex<Worker>>, Arc<LocationRegister>)> {
        self.workers
            .read()
            .await
            .values()
            .map(|slot| (slot.seq, slot.cell.clone(), slot.location.clone()))
            .collect()
    }

    fn overlay_location(worker: &mut Worker, location: &LocationRegister) {
        if let Some(ping) = location.read() {
            worker.location = Some(ping.coordinate);
            worker.location_at = Some(ping.at);
        }
    }
}
