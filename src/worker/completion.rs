use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use crate::error::{DispatchError, Result};
use crate::incident::{IncidentKind, IncidentReporter};
use crate::scheduler::{DispatchEvent, EventSender, Job, JobId, JobRegistry, JobStatus, Requeued};
use crate::worker::{HistoryEntry, TaskOutcome, Worker, WorkerDirectory, WorkerId, WorkerStatus};

/// Result of a completion call.
#[derive(Debug, Clone, Serialize)]
pub struct Completion {
    pub job: Job,
    /// The job was already closed by this worker; nothing changed.
    pub already_completed: bool,
}

/// Closes out accepted jobs.
pub struct CompletionHandler {
    jobs: Arc<JobRegistry>,
    workers: Arc<WorkerDirectory>,
    incidents: Arc<IncidentReporter>,
    events: EventSender,
}

impl CompletionHandler {
    pub fn new(
        jobs: Arc<JobRegistry>,
        workers: Arc<WorkerDirectory>,
        incidents: Arc<IncidentReporter>,
        events: EventSender,
    ) -> Self {
        Self {
            jobs,
            workers,
            incidents,
            events,
        }
    }

    /// ACCEPTED -> COMPLETED for the worker holding the job. Repeating the
    /// call after success returns the completed job unchanged.
    pub async fn complete(&self, job_id: &JobId, worker_id: &WorkerId) -> Result<Completion> {
        let mut job = match self.jobs.lock(job_id).await {
            Ok(job) => job,
            Err(DispatchError::JobNotFound(_)) => return self.repeated(job_id, worker_id).await,
            Err(e) => return Err(e),
        };

        if job.status != JobStatus::Accepted {
            // Archived a moment ago, or archived and resubmitted since.
            if job.status == JobStatus::Completed || self.jobs.archived(job_id).await.is_some() {
                drop(job);
                return self.repeated(job_id, worker_id).await;
            }
            return Err(DispatchError::StateConflict {
                job_id: job.id.clone(),
                expected: JobStatus::Accepted,
                actual: job.status,
            });
        }
        if job.assigned_worker.as_ref() != Some(worker_id) {
            return Err(DispatchError::NotOwner {
                job_id: job.id.clone(),
                worker_id: worker_id.clone(),
            });
        }

        let mut worker = self.workers.lock(worker_id).await?;
        holds(&worker, &job.id)?;

        JobRegistry::apply_transition(&mut job, JobStatus::Accepted, JobStatus::Completed)?;
        job.completed_at = Some(Utc::now());
        job.completed_by = Some(worker_id.clone());
        worker.release()?;
        self.jobs.archive_locked(&job).await?;

        let done = job.clone();
        drop(worker);
        drop(job);

        self.workers
            .record(
                worker_id,
                HistoryEntry {
                    job_id: done.id.clone(),
                    address: done.address.clone(),
                    outcome: TaskOutcome::Completed,
                    at: Utc::now(),
                },
            )
            .await;
        self.events.emit(DispatchEvent::WorkerIdle(worker_id.clone()));
        tracing::info!(job_id = %done.id, worker_id = %worker_id, rounds = done.offer_rounds, "Job completed");

        Ok(Completion {
            job: done,
            already_completed: false,
        })
    }

    async fn repeated(&self, job_id: &JobId, worker_id: &WorkerId) -> Result<Completion> {
        let done = self
            .jobs
            .archived(job_id)
            .await
            .ok_or_else(|| DispatchError::JobNotFound(job_id.clone()))?;
        if done.completed_by.as_ref() != Some(worker_id) {
            return Err(DispatchError::NotOwner {
                job_id: job_id.clone(),
                worker_id: worker_id.clone(),
            });
        }
        tracing::debug!(job_id = %job_id, worker_id = %worker_id, "Repeated completion ignored");
        Ok(Completion {
            job: done,
            already_completed: true,
        })
    }

    /// Drop an accepted job. The job goes back to PENDING with this worker
    /// ranked last for the next round, and an incident records the reason.
    pub async fn abandon(&self, job_id: &JobId, worker_id: &WorkerId, reason: &str) -> Result<Job> {
        let mut job = self.jobs.lock(job_id).await?;
        if job.status != JobStatus::Accepted {
            return Err(DispatchError::StateConflict {
                job_id: job.id.clone(),
                expected: JobStatus::Accepted,
                actual: job.status,
            });
        }
        if job.assigned_worker.as_ref() != Some(worker_id) {
            return Err(DispatchError::NotOwner {
                job_id: job.id.clone(),
                worker_id: worker_id.clone(),
            });
        }

        let mut worker = self.workers.lock(worker_id).await?;
        holds(&worker, &job.id)?;

        JobRegistry::apply_transition(&mut job, JobStatus::Accepted, JobStatus::Pending)?;
        job.current_offer_id = None;
        job.assigned_worker = None;
        job.avoid_worker = Some(worker_id.clone());
        worker.release()?;

        let requeued = Requeued {
            job_id: job.id.clone(),
            address: job.address.clone(),
            worker_id: worker.id.clone(),
            worker_label: worker.label(),
        };
        let snapshot = job.clone();
        drop(worker);
        drop(job);

        let reason = match reason.trim() {
            "" => "no reason given",
            r => r,
        };
        tracing::info!(job_id = %requeued.job_id, worker_id = %worker_id, reason, "Job abandoned, requeued");
        let message = format!(
            "Worker {} abandoned the job at {}: {}",
            requeued.worker_label, requeued.address, reason
        );
        requeued
            .announce(
                IncidentKind::Rejected,
                TaskOutcome::Abandoned,
                message,
                &self.incidents,
                &self.workers,
                &self.events,
            )
            .await;
        Ok(snapshot)
    }
}

fn holds(worker: &Worker, job_id: &JobId) -> Result<()> {
    if worker.status != WorkerStatus::Busy || worker.active_job_id.as_ref() != Some(job_id) {
        return Err(DispatchError::WorkerConflict {
            worker_id: worker.id.clone(),
            expected: WorkerStatus::Busy,
            actual: worker.status,
        });
    }
    Ok(())
}
