use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geo::Coordinate;
use crate::worker::WorkerId;

/// Identifier assigned by the job source (e.g. a container or bin id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Offered,
    Accepted,
    Completed,
}

impl JobStatus {
    /// Edges of the job lifecycle graph.
    pub fn can_transition_to(self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Pending, Offered)
                | (Offered, Pending)
                | (Offered, Accepted)
                | (Accepted, Completed)
                | (Accepted, Pending)
                | (Pending, Completed)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == JobStatus::Completed
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => f.pad("pending"),
            JobStatus::Offered => f.pad("offered"),
            JobStatus::Accepted => f.pad("accepted"),
            JobStatus::Completed => f.pad("completed"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "offered" => Ok(JobStatus::Offered),
            "accepted" => Ok(JobStatus::Accepted),
            "completed" => Ok(JobStatus::Completed),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub coordinate: Coordinate,
    pub address: String,
    pub status: JobStatus,
    pub current_offer_id: Option<Uuid>,
    /// Worker holding the job between accept and completion
    pub assigned_worker: Option<WorkerId>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Worker that closed the job. `None` when the source retracted it.
    pub completed_by: Option<WorkerId>,
    /// Worker that let the last offer time out; ranked last on the next round.
    pub avoid_worker: Option<WorkerId>,
    pub offer_rounds: u32,
    /// Registry creation order, assigned on submit
    pub seq: u64,
}

impl Job {
    pub fn new(id: impl Into<JobId>, coordinate: Coordinate, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            coordinate,
            address: address.into(),
            status: JobStatus::Pending,
            current_offer_id: None,
            assigned_worker: None,
            created_at: Utc::now(),
            completed_at: None,
            completed_by: None,
            avoid_worker: None,
            offer_rounds: 0,
            seq: 0,
        }
    }

    /// FIFO key: creation time, then registry sequence.
    pub fn fifo_key(&self) -> (DateTime<Utc>, u64) {
        (self.created_at, self.seq)
    }
}

/// Status/location predicate for [`JobRegistry::list`](super::JobRegistry::list).
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub near: Option<(Coordinate, f64)>,
}

impl JobFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            near: None,
        }
    }

    pub fn within(mut self, center: Coordinate, radius_m: f64) -> Self {
        self.near = Some((center, radius_m));
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        if let Some(status) = self.status {
            if job.status != status {
                return false;
            }
        }
        match &self.near {
            Some((center, radius_m)) => center.distance_m(&job.coordinate) <= *radius_m,
            None => true,
        }
    }
}
