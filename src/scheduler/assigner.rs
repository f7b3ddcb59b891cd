use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::error::{DispatchError, Result};
use crate::geo::Coordinate;
use crate::incident::{IncidentKind, IncidentReporter};
use crate::scheduler::job::{Job, JobFilter, JobId, JobStatus};
use crate::scheduler::offer::{Offer, OfferBook, OfferHandle, OfferStatus};
use crate::scheduler::registry::JobRegistry;
use crate::scheduler::timer::DeadlineTimer;
use crate::scheduler::{EventSender, Requeued};
use crate::worker::{AlertDispatcher, Candidate, TaskOutcome, Worker, WorkerDirectory, WorkerId, WorkerStatus};

/// What a worker is told about the job on offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: JobId,
    pub address: String,
    pub coordinate: Coordinate,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            address: job.address.clone(),
            coordinate: job.coordinate,
        }
    }
}

/// Offer state as shown on the worker screen.
#[derive(Debug, Clone, Serialize)]
pub struct OfferView {
    #[serde(flatten)]
    pub offer: Offer,
    /// Countdown to the deadline; zero once resolved or past due
    pub remaining_secs: u64,
}

/// Pairs PENDING jobs with IDLE workers and runs the accept/reject protocol.
///
/// Multi-entity operations lock job, then worker, then offer. Side effects
/// that may wait (incidents, history, wake-ups) run after the locks are
/// released.
#[derive(Clone)]
pub struct OfferScheduler {
    jobs: Arc<JobRegistry>,
    workers: Arc<WorkerDirectory>,
    offers: Arc<OfferBook>,
    incidents: Arc<IncidentReporter>,
    alerts: AlertDispatcher,
    timer: DeadlineTimer,
    events: EventSender,
    config: DispatchConfig,
}

impl OfferScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        jobs: Arc<JobRegistry>,
        workers: Arc<WorkerDirectory>,
        offers: Arc<OfferBook>,
        incidents: Arc<IncidentReporter>,
        alerts: AlertDispatcher,
        timer: DeadlineTimer,
        events: EventSender,
        config: DispatchConfig,
    ) -> Self {
        Self {
            jobs,
            workers,
            offers,
            incidents,
            alerts,
            timer,
            events,
            config,
        }
    }

    /// Offer `job_id` to the best IDLE worker. `Ok(None)` when the job is no
    /// longer PENDING or nobody is available.
    pub async fn offer_job(&self, job_id: &JobId) -> Result<Option<Offer>> {
        let job = self.jobs.get(job_id).await?;
        if job.status != JobStatus::Pending {
            return Ok(None);
        }

        let candidates = rank_workers(
            &job.coordinate,
            job.avoid_worker.as_ref(),
            self.workers.idle_candidates().await,
        );
        for candidate in candidates {
            match self.try_offer(job_id, &candidate.id).await {
                Ok(handle) => return Ok(Some(handle.snapshot().await)),
                Err(DispatchError::WorkerConflict { .. }) | Err(DispatchError::WorkerNotFound(_)) => {
                    tracing::debug!(job_id = %job_id, worker_id = %candidate.id, "Candidate taken, trying next");
                }
                Err(DispatchError::StateConflict { .. }) | Err(DispatchError::JobNotFound(_)) => {
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Offer the best PENDING job to `worker_id`. `Ok(None)` when the worker
    /// is not IDLE or nothing is waiting.
    pub async fn offer_to_worker(&self, worker_id: &WorkerId) -> Result<Option<Offer>> {
        let worker = self.workers.get(worker_id).await?;
        if worker.status != WorkerStatus::Idle {
            return Ok(None);
        }

        let pending = self
            .jobs
            .list(JobFilter::status(JobStatus::Pending))
            .await
            .collect()
            .await;
        for job in rank_jobs(worker_id, worker.location.as_ref(), pending) {
            match self.try_offer(&job.id, worker_id).await {
                Ok(handle) => return Ok(Some(handle.snapshot().await)),
                Err(DispatchError::StateConflict { .. }) | Err(DispatchError::JobNotFound(_)) => {
                    tracing::debug!(job_id = %job.id, worker_id = %worker_id, "Job taken, trying next");
                }
                Err(DispatchError::WorkerConflict { .. }) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Offer every PENDING job in creation order and expire anything whose
    /// timer was lost. Returns the number of offers made.
    pub async fn sweep(&self) -> usize {
        for handle in self.offers.pending().await {
            if handle.deadline_reached() {
                if let Err(e) = self.expire(&handle.id).await {
                    tracing::warn!(offer_id = %handle.id, error = %e, "Sweep could not expire offer");
                }
            }
        }

        let pending = self
            .jobs
            .list(JobFilter::status(JobStatus::Pending))
            .await
            .collect()
            .await;

        let mut offered = 0;
        for job in pending {
            match self.offer_job(&job.id).await {
                Ok(Some(_)) => offered += 1,
                Ok(None) => {}
                Err(e) => tracing::warn!(job_id = %job.id, error = %e, "Sweep could not offer job"),
            }
        }
        if offered > 0 {
            tracing::debug!(offered, "Sweep made offers");
        }
        offered
    }

    /// Create one offer, flipping job and worker together. Either side being
    /// out of state aborts the attempt with nothing changed.
    async fn try_offer(&self, job_id: &JobId, worker_id: &WorkerId) -> Result<Arc<OfferHandle>> {
        let location = self.workers.location_of(worker_id).await;
        let mut job = self.jobs.lock(job_id).await?;
        if job.status != JobStatus::Pending {
            return Err(DispatchError::StateConflict {
                job_id: job.id.clone(),
                expected: JobStatus::Pending,
                actual: job.status,
            });
        }
        let mut worker = self.workers.lock(worker_id).await?;

        let offer = OfferHandle::new(job.id.clone(), worker.id.clone(), self.config.acceptance_window);
        worker.assign(&job.id)?;
        if let Err(e) = JobRegistry::apply_transition(&mut job, JobStatus::Pending, JobStatus::Offered) {
            worker.release()?;
            return Err(e);
        }
        job.current_offer_id = Some(offer.id);
        job.offer_rounds += 1;
        job.avoid_worker = None;

        let summary = JobSummary::from(&*job);
        let handle = self.offers.insert(offer).await;
        tracing::info!(
            offer_id = %handle.id,
            job_id = %job.id,
            worker_id = %worker.id,
            round = job.offer_rounds,
            distance_m = location.map(|l| l.distance_m(&job.coordinate).round()),
            "Offer created"
        );
        drop(worker);
        drop(job);

        let scheduler = self.clone();
        self.timer.arm(handle.clone(), move |offer| async move {
            if let Err(e) = scheduler.expire(&offer.id).await {
                tracing::warn!(offer_id = %offer.id, error = %e, "Offer expiry failed");
            }
        });
        self.alerts.start(handle.clone(), summary);
        Ok(handle)
    }

    /// Accept an offer. Calling again after resolution returns the offer as
    /// it stands. An offer answered after its deadline is expired here.
    pub async fn accept(&self, offer_id: &Uuid) -> Result<Offer> {
        let handle = self.offers.get(offer_id).await?;
        if handle.is_resolved() {
            return Ok(handle.snapshot().await);
        }

        let mut job = self.jobs.lock(&handle.job_id).await?;
        let mut worker = self.workers.lock(&handle.worker_id).await?;
        let mut offer = handle.lock().await;

        if offer.status != OfferStatus::Pending {
            return Ok(offer.clone());
        }
        if handle.has_passed_deadline() {
            let requeued = unwind(&handle, &mut job, &mut worker, &mut offer, OfferStatus::Expired, None)?;
            drop(offer);
            drop(worker);
            drop(job);
            self.announce_timeout(requeued).await;
            return Err(DispatchError::OfferExpired(handle.id));
        }

        check_in_step(&handle, &job, &worker)?;
        handle.resolve(&mut offer, OfferStatus::Accepted, None)?;
        JobRegistry::apply_transition(&mut job, JobStatus::Offered, JobStatus::Accepted)?;
        job.assigned_worker = Some(worker.id.clone());
        worker.engage()?;

        tracing::info!(
            offer_id = %handle.id,
            job_id = %job.id,
            worker_id = %worker.id,
            remaining_secs = handle.remaining().as_secs(),
            "Offer accepted"
        );
        Ok(offer.clone())
    }

    /// Reject an offer and requeue its job. Rejecting twice returns the
    /// rejection; rejecting an offer resolved any other way fails.
    pub async fn reject(&self, offer_id: &Uuid, reason: impl Into<String>) -> Result<Offer> {
        let handle = self.offers.get(offer_id).await?;
        let reason = reason.into();
        let reason = if reason.trim().is_empty() {
            "no reason given".to_string()
        } else {
            reason
        };

        if handle.is_resolved() {
            let offer = handle.snapshot().await;
            return match offer.status {
                OfferStatus::Rejected => Ok(offer),
                status => Err(DispatchError::OfferAlreadyResolved {
                    offer_id: handle.id,
                    status,
                }),
            };
        }

        let mut job = self.jobs.lock(&handle.job_id).await?;
        let mut worker = self.workers.lock(&handle.worker_id).await?;
        let mut offer = handle.lock().await;

        match offer.status {
            OfferStatus::Pending => {}
            OfferStatus::Rejected => return Ok(offer.clone()),
            status => {
                return Err(DispatchError::OfferAlreadyResolved {
                    offer_id: handle.id,
                    status,
                })
            }
        }

        if handle.has_passed_deadline() {
            let requeued = unwind(&handle, &mut job, &mut worker, &mut offer, OfferStatus::Expired, None)?;
            drop(offer);
            drop(worker);
            drop(job);
            self.announce_timeout(requeued).await;
            return Err(DispatchError::OfferExpired(handle.id));
        }

        let requeued = unwind(
            &handle,
            &mut job,
            &mut worker,
            &mut offer,
            OfferStatus::Rejected,
            Some(reason.clone()),
        )?;
        let resolved = offer.clone();
        drop(offer);
        drop(worker);
        drop(job);

        tracing::info!(
            offer_id = %handle.id,
            job_id = %requeued.job_id,
            worker_id = %requeued.worker_id,
            reason = %reason,
            "Offer rejected, job requeued"
        );
        let message = format!(
            "Worker {} rejected the job at {}: {}",
            requeued.worker_label, requeued.address, reason
        );
        requeued
            .announce(
                IncidentKind::Rejected,
                TaskOutcome::Rejected,
                message,
                &self.incidents,
                &self.workers,
                &self.events,
            )
            .await;
        Ok(resolved)
    }

    /// Deadline handler. Expires the offer if it is still PENDING and its
    /// deadline has arrived; returns whether it did.
    pub async fn expire(&self, offer_id: &Uuid) -> Result<bool> {
        let handle = self.offers.get(offer_id).await?;
        if handle.is_resolved() {
            return Ok(false);
        }

        let mut job = self.jobs.lock(&handle.job_id).await?;
        let mut worker = self.workers.lock(&handle.worker_id).await?;
        let mut offer = handle.lock().await;

        if offer.status != OfferStatus::Pending || !handle.deadline_reached() {
            return Ok(false);
        }
        let requeued = unwind(&handle, &mut job, &mut worker, &mut offer, OfferStatus::Expired, None)?;
        drop(offer);
        drop(worker);
        drop(job);

        self.announce_timeout(requeued).await;
        Ok(true)
    }

    async fn announce_timeout(&self, requeued: Requeued) {
        tracing::warn!(
            job_id = %requeued.job_id,
            worker_id = %requeued.worker_id,
            "Offer expired, job requeued"
        );
        let message = format!(
            "Worker {} did not accept the job at {} within {}",
            requeued.worker_label,
            requeued.address,
            describe_window(self.config.acceptance_window)
        );
        requeued
            .announce(
                IncidentKind::TimedOut,
                TaskOutcome::TimedOut,
                message,
                &self.incidents,
                &self.workers,
                &self.events,
            )
            .await;
    }

    /// Offer with its countdown.
    pub async fn view(&self, offer_id: &Uuid) -> Result<OfferView> {
        let handle = self.offers.get(offer_id).await?;
        let offer = handle.snapshot().await;
        let remaining_secs = match offer.status {
            OfferStatus::Pending => handle.remaining().as_secs(),
            _ => 0,
        };
        Ok(OfferView {
            offer,
            remaining_secs,
        })
    }

    /// The open offer held by `worker_id`, if any.
    pub async fn pending_for_worker(&self, worker_id: &WorkerId) -> Option<OfferView> {
        let handle = self.offers.pending_for_worker(worker_id).await?;
        self.view(&handle.id).await.ok()
    }

    pub fn offers(&self) -> &Arc<OfferBook> {
        &self.offers
    }
}

/// The job, worker and offer must all point at each other.
fn check_in_step(handle: &OfferHandle, job: &Job, worker: &Worker) -> Result<()> {
    if job.current_offer_id != Some(handle.id) {
        return Err(DispatchError::StateConflict {
            job_id: job.id.clone(),
            expected: JobStatus::Offered,
            actual: job.status,
        });
    }
    if worker.status != WorkerStatus::Offered || worker.active_job_id.as_ref() != Some(&job.id) {
        return Err(DispatchError::WorkerConflict {
            worker_id: worker.id.clone(),
            expected: WorkerStatus::Offered,
            actual: worker.status,
        });
    }
    Ok(())
}

/// Resolve a PENDING offer without acceptance and put its job back in the
/// queue. Caller holds all three locks.
fn unwind(
    handle: &OfferHandle,
    job: &mut Job,
    worker: &mut Worker,
    offer: &mut Offer,
    status: OfferStatus,
    reason: Option<String>,
) -> Result<Requeued> {
    check_in_step(handle, job, worker)?;
    handle.resolve(offer, status, reason)?;
    JobRegistry::apply_transition(job, JobStatus::Offered, JobStatus::Pending)?;
    job.current_offer_id = None;
    job.avoid_worker = Some(worker.id.clone());
    worker.release()?;

    Ok(Requeued {
        job_id: job.id.clone(),
        address: job.address.clone(),
        worker_id: worker.id.clone(),
        worker_label: worker.label(),
    })
}

fn distance_or_max(from: Option<&Coordinate>, to: &Coordinate) -> f64 {
    from.map(|c| c.distance_m(to)).unwrap_or(f64::INFINITY)
}

/// IDLE workers for a job: the avoided worker last, then nearest first, then
/// registration order. Workers with no known location rank after located ones.
pub fn rank_workers(
    target: &Coordinate,
    avoid: Option<&WorkerId>,
    mut candidates: Vec<Candidate>,
) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        let avoid_a = avoid == Some(&a.id);
        let avoid_b = avoid == Some(&b.id);
        avoid_a
            .cmp(&avoid_b)
            .then_with(|| {
                distance_or_max(a.location.as_ref(), target)
                    .total_cmp(&distance_or_max(b.location.as_ref(), target))
            })
            .then_with(|| a.seq.cmp(&b.seq))
    });
    candidates
}

/// PENDING jobs for a worker: jobs avoiding this worker last, then oldest
/// first. Distance only separates jobs created in the same instant.
pub fn rank_jobs(worker_id: &WorkerId, location: Option<&Coordinate>, mut jobs: Vec<Job>) -> Vec<Job> {
    jobs.sort_by(|a, b| {
        let avoid_a = a.avoid_worker.as_ref() == Some(worker_id);
        let avoid_b = b.avoid_worker.as_ref() == Some(worker_id);
        let by_distance = match location {
            Some(here) => here
                .distance_m(&a.coordinate)
                .total_cmp(&here.distance_m(&b.coordinate)),
            None => Ordering::Equal,
        };
        avoid_a
            .cmp(&avoid_b)
            .then_with(|| a.fifo_key().cmp(&b.fifo_key()))
            .then(by_distance)
    });
    jobs
}

/// "5 minutes", "1 minute", "90 seconds".
pub fn describe_window(window: Duration) -> String {
    let secs = window.as_secs();
    match (secs / 60, secs % 60) {
        (1, 0) => "1 minute".to_string(),
        (m, 0) if m > 0 => format!("{} minutes", m),
        _ if secs == 1 => "1 second".to_string(),
        _ => format!("{} seconds", secs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, seq: u64, location: Option<Coordinate>) -> Candidate {
        Candidate {
            id: WorkerId::from(id),
            seq,
            location,
        }
    }

    fn ids(candidates: &[Candidate]) -> Vec<&str> {
        candidates.iter().map(|c| c.id.0.as_str()).collect()
    }

    #[test]
    fn nearest_worker_first() {
        let job = Coordinate::new(41.3111, 69.2797);
        let ranked = rank_workers(
            &job,
            None,
            vec![
                candidate("far", 0, Some(Coordinate::new(41.40, 69.40))),
                candidate("near", 1, Some(Coordinate::new(41.312, 69.280))),
                candidate("unknown", 2, None),
            ],
        );
        assert_eq!(ids(&ranked), vec!["near", "far", "unknown"]);
    }

    #[test]
    fn equal_distance_falls_back_to_registration_order() {
        let spot = Coordinate::new(41.3, 69.2);
        let ranked = rank_workers(
            &spot,
            None,
            vec![
                candidate("second", 5, Some(spot)),
                candidate("first", 1, Some(spot)),
            ],
        );
        assert_eq!(ids(&ranked), vec!["first", "second"]);
    }

    #[test]
    fn avoided_worker_ranks_last_but_stays_eligible() {
        let spot = Coordinate::new(41.3, 69.2);
        let avoid = WorkerId::from("w1");
        let ranked = rank_workers(
            &spot,
            Some(&avoid),
            vec![
                candidate("w1", 0, Some(spot)),
                candidate("w2", 1, Some(Coordinate::new(41.5, 69.5))),
            ],
        );
        assert_eq!(ids(&ranked), vec!["w2", "w1"]);
    }

    #[test]
    fn jobs_rank_oldest_first_regardless_of_distance() {
        let here = Coordinate::new(41.3, 69.2);
        let mut old_far = Job::new("old-far", Coordinate::new(41.6, 69.6), "a");
        old_far.seq = 0;
        let mut new_near = Job::new("new-near", Coordinate::new(41.301, 69.201), "b");
        new_near.seq = 2;
        let mut mid_near = Job::new("mid-near", Coordinate::new(41.301, 69.201), "c");
        mid_near.seq = 1;
        new_near.created_at = old_far.created_at;
        mid_near.created_at = old_far.created_at;

        let worker = WorkerId::from("w1");
        let ranked = rank_jobs(&worker, Some(&here), vec![old_far.clone(), new_near, mid_near]);
        let order: Vec<&str> = ranked.iter().map(|j| j.id.0.as_str()).collect();
        assert_eq!(order, vec!["old-far", "mid-near", "new-near"]);

        let mut avoided = old_far;
        avoided.avoid_worker = Some(worker.clone());
        let mut fresh = Job::new("fresh", Coordinate::new(41.7, 69.7), "d");
        fresh.seq = 3;
        let ranked = rank_jobs(&worker, None, vec![avoided, fresh]);
        assert_eq!(ranked[0].id, JobId::from("fresh"));
    }

    #[test]
    fn window_descriptions() {
        assert_eq!(describe_window(Duration::from_secs(300)), "5 minutes");
        assert_eq!(describe_window(Duration::from_secs(60)), "1 minute");
        assert_eq!(describe_window(Duration::from_secs(90)), "90 seconds");
        assert_eq!(describe_window(Duration::from_secs(1)), "1 second");
    }
}
