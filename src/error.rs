use thiserror::Error;

use crate::scheduler::{JobId, JobStatus, OfferStatus};
use crate::worker::{WorkerId, WorkerStatus};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("State conflict on job {job_id}: expected {expected}, found {actual}")]
    StateConflict {
        job_id: JobId,
        expected: JobStatus,
        actual: JobStatus,
    },

    #[error("Worker {worker_id} changed state concurrently: expected {expected}, found {actual}")]
    WorkerConflict {
        worker_id: WorkerId,
        expected: WorkerStatus,
        actual: WorkerStatus,
    },

    #[error("Illegal job transition {from} -> {to}")]
    IllegalTransition { from: JobStatus, to: JobStatus },

    #[error("Offer {0} expired before it was answered")]
    OfferExpired(uuid::Uuid),

    #[error("Offer {offer_id} already resolved as {status}")]
    OfferAlreadyResolved {
        offer_id: uuid::Uuid,
        status: OfferStatus,
    },

    #[error("Worker {worker_id} is {status} and cannot change availability")]
    WorkerBusy {
        worker_id: WorkerId,
        status: WorkerStatus,
    },

    #[error("Job already exists: {0}")]
    DuplicateJob(JobId),

    #[error("Worker already registered: {0}")]
    DuplicateWorker(WorkerId),

    #[error("Worker {worker_id} does not own job {job_id}")]
    NotOwner { job_id: JobId, worker_id: WorkerId },

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Worker not found: {0}")]
    WorkerNotFound(WorkerId),

    #[error("Offer not found: {0}")]
    OfferNotFound(uuid::Uuid),

    #[error("Incident storage unavailable: {0}")]
    TransientStorageFailure(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// Lost races and resolved offers. Workers see these as "offer no longer
    /// valid", not as failures.
    pub fn is_stale(&self) -> bool {
        matches!(
            self,
            DispatchError::StateConflict { .. }
                | DispatchError::WorkerConflict { .. }
                | DispatchError::OfferExpired(_)
                | DispatchError::OfferAlreadyResolved { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_errors_are_informational() {
        let id = uuid::Uuid::new_v4();
        assert!(DispatchError::OfferExpired(id).is_stale());
        assert!(DispatchError::OfferAlreadyResolved {
            offer_id: id,
            status: OfferStatus::Accepted,
        }
        .is_stale());
        assert!(DispatchError::StateConflict {
            job_id: JobId::from("bin-1"),
            expected: JobStatus::Pending,
            actual: JobStatus::Offered,
        }
        .is_stale());
    }

    #[test]
    fn ownership_and_lookup_errors_are_hard() {
        assert!(!DispatchError::NotOwner {
            job_id: JobId::from("bin-1"),
            worker_id: WorkerId::from("w-2"),
        }
        .is_stale());
        assert!(!DispatchError::DuplicateJob(JobId::from("bin-1")).is_stale());
        assert!(!DispatchError::WorkerNotFound(WorkerId::from("w-9")).is_stale());
    }

    #[test]
    fn display_names_the_entities() {
        let err = DispatchError::NotOwner {
            job_id: JobId::from("bin-7"),
            worker_id: WorkerId::from("w-3"),
        };
        assert_eq!(err.to_string(), "Worker w-3 does not own job bin-7");
    }
}
