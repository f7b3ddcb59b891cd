use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, StreamExt};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::error::{DispatchError, Result};
use crate::scheduler::job::{Job, JobFilter, JobId, JobStatus};

type JobCell = Arc<Mutex<Job>>;

struct JobSlot {
    seq: u64,
    cell: JobCell,
}

/// Authoritative job state.
///
/// Every live job sits behind its own mutex, so transitions on one job never
/// wait on another. The map lock is only held long enough to clone a slot
/// handle; it is never held while waiting on a job lock.
#[derive(Default)]
pub struct JobRegistry {
    live: RwLock<HashMap<JobId, JobSlot>>,
    archive: RwLock<HashMap<JobId, Job>>,
    next_seq: AtomicU64,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new PENDING job.
    pub async fn submit(&self, mut job: Job) -> Result<Job> {
        if !job.coordinate.is_valid() {
            return Err(DispatchError::InvalidRequest(format!(
                "coordinate out of range: {}",
                job.coordinate
            )));
        }

        let mut live = self.live.write().await;
        if live.contains_key(&job.id) {
            return Err(DispatchError::DuplicateJob(job.id));
        }

        job.status = JobStatus::Pending;
        job.current_offer_id = None;
        job.assigned_worker = None;
        job.completed_at = None;
        job.completed_by = None;
        job.seq = self.next_seq.fetch_add(1, Ordering::Relaxed);

        live.insert(
            job.id.clone(),
            JobSlot {
                seq: job.seq,
                cell: Arc::new(Mutex::new(job.clone())),
            },
        );
        tracing::info!(job_id = %job.id, address = %job.address, "Job submitted");
        Ok(job)
    }

    /// Current state of a live or archived job.
    pub async fn get(&self, id: &JobId) -> Result<Job> {
        if let Some(cell) = self.cell(id).await {
            return Ok(cell.lock().await.clone());
        }
        self.archive
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| DispatchError::JobNotFound(id.clone()))
    }

    /// Jobs matching `filter`, in creation order. The listing can be streamed
    /// any number of times; each pass reads current job state.
    pub async fn list(&self, filter: JobFilter) -> JobListing {
        let live = self.live.read().await;
        let mut slots: Vec<(u64, JobCell)> = live
            .values()
            .map(|slot| (slot.seq, slot.cell.clone()))
            .collect();
        slots.sort_by_key(|(seq, _)| *seq);

        // An id submitted again after completion is listed once, as the live job.
        let mut archived: Vec<Job> = self
            .archive
            .read()
            .await
            .values()
            .filter(|job| !live.contains_key(&job.id) && filter.matches(job))
            .cloned()
            .collect();
        drop(live);
        archived.sort_by_key(|job| job.seq);

        JobListing {
            filter,
            cells: slots.into_iter().map(|(_, cell)| cell).collect(),
            archived,
        }
    }

    /// Compare-and-swap on the job status.
    pub async fn transition(&self, id: &JobId, from: JobStatus, to: JobStatus) -> Result<Job> {
        let mut job = self.lock(id).await?;
        Self::apply_transition(&mut job, from, to)?;
        Ok(job.clone())
    }

    /// The single status mutation primitive. Callers must hold the job lock.
    pub(crate) fn apply_transition(job: &mut Job, from: JobStatus, to: JobStatus) -> Result<()> {
        if !from.can_transition_to(to) {
            return Err(DispatchError::IllegalTransition { from, to });
        }
        if job.status != from {
            return Err(DispatchError::StateConflict {
                job_id: job.id.clone(),
                expected: from,
                actual: job.status,
            });
        }
        job.status = to;
        tracing::debug!(job_id = %job.id, from = %from, to = %to, "Job transitioned");
        Ok(())
    }

    /// Exclusive access to a live job.
    pub(crate) async fn lock(&self, id: &JobId) -> Result<OwnedMutexGuard<Job>> {
        let cell = self
            .cell(id)
            .await
            .ok_or_else(|| DispatchError::JobNotFound(id.clone()))?;
        Ok(cell.lock_owned().await)
    }

    async fn cell(&self, id: &JobId) -> Option<JobCell> {
        self.live.read().await.get(id).map(|slot| slot.cell.clone())
    }

    pub(crate) async fn archived(&self, id: &JobId) -> Option<Job> {
        self.archive.read().await.get(id).cloned()
    }

    /// Move a completed job out of the live set. Callers must hold the job lock.
    pub(crate) async fn archive_locked(&self, job: &Job) -> Result<()> {
        if job.status != JobStatus::Completed {
            return Err(DispatchError::StateConflict {
                job_id: job.id.clone(),
                expected: JobStatus::Completed,
                actual: job.status,
            });
        }
        let mut live = self.live.write().await;
        if live.get(&job.id).is_some_and(|slot| slot.seq == job.seq) {
            live.remove(&job.id);
        }
        drop(live);
        self.archive.write().await.insert(job.id.clone(), job.clone());
        tracing::debug!(job_id = %job.id, "Job archived");
        Ok(())
    }

    /// The job source reports the location was serviced without us.
    /// Only PENDING jobs are closed; in-flight ones run to their normal end.
    pub async fn retract(&self, id: &JobId) -> Result<Job> {
        let mut job = match self.lock(id).await {
            Ok(job) => job,
            Err(DispatchError::JobNotFound(_)) => {
                if let Some(done) = self.archived(id).await {
                    return Ok(done);
                }
                return Err(DispatchError::JobNotFound(id.clone()));
            }
            Err(e) => return Err(e),
        };

        if job.status == JobStatus::Completed {
            return Ok(job.clone());
        }
        Self::apply_transition(&mut job, JobStatus::Pending, JobStatus::Completed)?;
        job.completed_at = Some(Utc::now());
        job.completed_by = None;
        self.archive_locked(&job).await?;
        tracing::info!(job_id = %job.id, "Job retracted by source");
        Ok(job.clone())
    }

    /// Drop archived jobs completed before `cutoff`. Returns the number removed.
    pub async fn purge_archive(&self, cutoff: DateTime<Utc>) -> usize {
        let mut archive = self.archive.write().await;
        let before = archive.len();
        archive.retain(|_, job| !matches!(job.completed_at, Some(at) if at < cutoff));
        before - archive.len()
    }

    /// Number of live (non-archived) jobs
    pub async fn live_len(&self) -> usize {
        self.live.read().await.len()
    }
}

/// Restartable, lazily evaluated job sequence produced by [`JobRegistry::list`].
pub struct JobListing {
    filter: JobFilter,
    cells: Vec<JobCell>,
    archived: Vec<Job>,
}

impl JobListing {
    /// Start a fresh pass over the listing.
    pub fn stream(&self) -> impl Stream<Item = Job> + '_ {
        let filter = &self.filter;
        stream::iter(self.cells.iter())
            .filter_map(move |cell| async move {
                let job = cell.lock().await.clone();
                filter.matches(&job).then_some(job)
            })
            .chain(stream::iter(self.archived.iter().cloned()))
    }

    pub async fn collect(&self) -> Vec<Job> {
        self.stream().collect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::Coordinate;

    fn job(id: &str) -> Job {
        Job::new(id, Coordinate::new(41.31, 69.28), format!("{} street", id))
    }

    #[tokio::test]
    async fn submit_rejects_duplicates() {
        let registry = JobRegistry::new();
        registry.submit(job("bin-1")).await.unwrap();

        let err = registry.submit(job("bin-1")).await.unwrap_err();
        assert_eq!(err, DispatchError::DuplicateJob(JobId::from("bin-1")));
    }

    #[tokio::test]
    async fn submit_rejects_bad_coordinates() {
        let registry = JobRegistry::new();
        let bad = Job::new("bin-x", Coordinate::new(123.0, 0.0), "nowhere");
        assert!(matches!(
            registry.submit(bad).await,
            Err(DispatchError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn transition_is_compare_and_swap() {
        let registry = JobRegistry::new();
        let id = registry.submit(job("bin-1")).await.unwrap().id;

        let job = registry
            .transition(&id, JobStatus::Pending, JobStatus::Offered)
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Offered);

        let err = registry
            .transition(&id, JobStatus::Pending, JobStatus::Offered)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            DispatchError::StateConflict {
                job_id: id.clone(),
                expected: JobStatus::Pending,
                actual: JobStatus::Offered,
            }
        );
    }

    #[tokio::test]
    async fn transition_rejects_edges_outside_lifecycle() {
        let registry = JobRegistry::new();
        let id = registry.submit(job("bin-1")).await.unwrap().id;
        let err = registry
            .transition(&id, JobStatus::Pending, JobStatus::Accepted)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn concurrent_transitions_have_one_winner() {
        let registry = Arc::new(JobRegistry::new());
        let id = registry.submit(job("bin-1")).await.unwrap().id;

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .transition(&id, JobStatus::Pending, JobStatus::Offered)
                    .await
                    .is_ok()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn list_is_ordered_and_restartable() {
        let registry = JobRegistry::new();
        for id in ["a", "b", "c"] {
            registry.submit(job(id)).await.unwrap();
        }
        registry
            .transition(&JobId::from("b"), JobStatus::Pending, JobStatus::Offered)
            .await
            .unwrap();

        let listing = registry.list(JobFilter::status(JobStatus::Pending)).await;
        let first: Vec<String> = listing.collect().await.into_iter().map(|j| j.id.0).collect();
        assert_eq!(first, vec!["a", "c"]);

        // A second pass sees the latest state of each job.
        registry
            .transition(&JobId::from("b"), JobStatus::Offered, JobStatus::Pending)
            .await
            .unwrap();
        let second: Vec<String> = listing.collect().await.into_iter().map(|j| j.id.0).collect();
        assert_eq!(second, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn retract_closes_pending_jobs_only() {
        let registry = JobRegistry::new();
        registry.submit(job("a")).await.unwrap();
        registry.submit(job("b")).await.unwrap();
        registry
            .transition(&JobId::from("b"), JobStatus::Pending, JobStatus::Offered)
            .await
            .unwrap();

        let done = registry.retract(&JobId::from("a")).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.completed_by.is_none());
        assert_eq!(registry.live_len().await, 1);

        // Retracting again is harmless.
        assert_eq!(
            registry.retract(&JobId::from("a")).await.unwrap().status,
            JobStatus::Completed
        );

        assert!(registry.retract(&JobId::from("b")).await.unwrap_err().is_stale());
    }

    #[tokio::test]
    async fn archived_jobs_can_be_resubmitted_and_purged() {
        let registry = JobRegistry::new();
        registry.submit(job("a")).await.unwrap();
        registry.retract(&JobId::from("a")).await.unwrap();

        let again = registry.submit(job("a")).await.unwrap();
        assert_eq!(again.status, JobStatus::Pending);
        assert_eq!(registry.get(&JobId::from("a")).await.unwrap().status, JobStatus::Pending);

        let removed = registry.purge_archive(Utc::now() + chrono::Duration::seconds(1)).await;
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn resubmitted_id_is_listed_once() {
        let registry = JobRegistry::new();
        registry.submit(job("a")).await.unwrap();
        registry.submit(job("b")).await.unwrap();
        registry.retract(&JobId::from("a")).await.unwrap();
        registry.retract(&JobId::from("b")).await.unwrap();
        registry.submit(job("a")).await.unwrap();

        let jobs = registry.list(JobFilter::any()).await.collect().await;
        let listed: Vec<(String, JobStatus)> = jobs.into_iter().map(|j| (j.id.0, j.status)).collect();
        assert_eq!(
            listed,
            vec![
                ("a".to_string(), JobStatus::Pending),
                ("b".to_string(), JobStatus::Completed),
            ]
        );

        let done = registry.list(JobFilter::status(JobStatus::Completed)).await.collect().await;
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].id, JobId::from("b"));
    }
}
