use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::config::{DispatchConfig, NodeConfig};
use crate::dashboard;
use crate::error::{DispatchError, Result};
use crate::geo::Coordinate;
use crate::incident::{
    IncidentReport, IncidentReporter, IncidentStore, IncidentWriter, JsonlIncidentStore,
    MemoryIncidentStore,
};
use crate::scheduler::{
    DeadlineTimer, DispatchEvent, EventSender, Job, JobFilter, JobId, JobRegistry, Offer, OfferBook,
    OfferScheduler, OfferView,
};
use crate::worker::{
    AlertDispatcher, BroadcastNotifier, Completion, CompletionHandler, HistoryEntry, LogNotifier,
    Notifier, OfferNotification, Worker, WorkerDirectory, WorkerId, WorkerStatus,
};

const OFFER_FEED_CAPACITY: usize = 256;

/// Background halves of a [`Node`], consumed by [`Node::start`].
pub struct NodeRuntime {
    events: mpsc::Receiver<DispatchEvent>,
    writer: IncidentWriter,
}

/// The dispatch core and its entry points.
pub struct Node {
    pub config: NodeConfig,
    pub jobs: Arc<JobRegistry>,
    pub workers: Arc<WorkerDirectory>,
    pub offers: Arc<OfferBook>,
    pub incidents: Arc<IncidentReporter>,
    pub scheduler: OfferScheduler,
    pub completion: CompletionHandler,
    offer_feed: BroadcastNotifier,
    events: EventSender,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl Node {
    /// Node with the incident store named by the config (JSON lines file, or
    /// memory when no path is set) and alerts sent to the log and the live
    /// offer feed.
    pub fn new(config: NodeConfig) -> (Self, NodeRuntime) {
        let store: Arc<dyn IncidentStore> = match &config.incidents.log_path {
            Some(path) => {
                let store = JsonlIncidentStore::new(path);
                tracing::info!(path = %store.path().display(), "Incident log");
                Arc::new(store)
            }
            None => Arc::new(MemoryIncidentStore::new()),
        };
        Self::with_sinks(config, store, None)
    }

    /// Node with an explicit incident store and an optional extra alert sink.
    pub fn with_sinks(
        config: NodeConfig,
        store: Arc<dyn IncidentStore>,
        notifier: Option<Arc<dyn Notifier>>,
    ) -> (Self, NodeRuntime) {
        let tracker = TaskTracker::new();
        let shutdown = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::channel(config.dispatch.event_buffer.max(1));
        let events = EventSender::new(events_tx);

        let offer_feed = BroadcastNotifier::new(OFFER_FEED_CAPACITY);
        let mut sinks: Vec<Arc<dyn Notifier>> =
            vec![Arc::new(LogNotifier), Arc::new(offer_feed.clone())];
        sinks.extend(notifier);

        let (reporter, writer) = IncidentReporter::new(store, config.incidents.clone());
        let jobs = Arc::new(JobRegistry::new());
        let workers = Arc::new(WorkerDirectory::new());
        let offers = Arc::new(OfferBook::new());
        let incidents = Arc::new(reporter);

        let alerts = AlertDispatcher::new(
            Arc::new(sinks),
            config.dispatch.alert_interval,
            tracker.clone(),
            shutdown.clone(),
        );
        let timer = DeadlineTimer::new(tracker.clone(), shutdown.clone());
        let scheduler = OfferScheduler::new(
            jobs.clone(),
            workers.clone(),
            offers.clone(),
            incidents.clone(),
            alerts,
            timer,
            events.clone(),
            config.dispatch.clone(),
        );
        let completion = CompletionHandler::new(
            jobs.clone(),
            workers.clone(),
            incidents.clone(),
            events.clone(),
        );

        let node = Self {
            config,
            jobs,
            workers,
            offers,
            incidents,
            scheduler,
            completion,
            offer_feed,
            events,
            tracker,
            shutdown,
        };
        let runtime = NodeRuntime {
            events: events_rx,
            writer,
        };
        (node, runtime)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawn the incident writer and the dispatch loop.
    pub fn start(&self, runtime: NodeRuntime) {
        let NodeRuntime { events, writer } = runtime;
        self.tracker.spawn(writer.run(self.shutdown.clone()));
        self.tracker.spawn(Self::dispatch_loop(
            self.scheduler.clone(),
            self.jobs.clone(),
            self.offers.clone(),
            self.incidents.clone(),
            self.config.dispatch.clone(),
            events,
            self.shutdown.clone(),
        ));
    }

    /// Run the node until shutdown.
    ///
    /// 1. Restores the incident feed from the store
    /// 2. Spawns the incident writer and the dispatch loop
    /// 3. Serves the HTTP API (blocking)
    /// 4. On shutdown, waits for offer timers, alert loops and the writer
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot bind or the server fails.
    pub async fn run(self: Arc<Self>, runtime: NodeRuntime) -> std::result::Result<(), Box<dyn std::error::Error>> {
        let restored = self.incidents.restore().await;
        if restored > 0 {
            tracing::info!(restored, "Incident feed restored");
        }
        self.start(runtime);

        let listener = tokio::net::TcpListener::bind(self.config.listen_addr).await?;
        tracing::info!(addr = %self.config.listen_addr, "HTTP API listening");

        let shutdown = self.shutdown.clone();
        let served = axum::serve(listener, dashboard::router(self.clone()))
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;

        self.stop().await;
        served?;
        Ok(())
    }

    /// Cancel background work and wait for it to finish.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("Node stopped");
    }

    /// Reacts to dispatch events and runs the periodic sweep.
    ///
    /// - `JobPending`: offer the job to the best IDLE worker
    /// - `WorkerIdle`: offer the best PENDING job to the worker
    /// - sweep tick: re-offer every PENDING job, expire offers whose timer was
    ///   lost, replay parked incidents, and drop old archived jobs and
    ///   resolved offers
    async fn dispatch_loop(
        scheduler: OfferScheduler,
        jobs: Arc<JobRegistry>,
        offers: Arc<OfferBook>,
        incidents: Arc<IncidentReporter>,
        config: DispatchConfig,
        mut events: mpsc::Receiver<DispatchEvent>,
        shutdown: CancellationToken,
    ) {
        let mut sweep_interval = tokio::time::interval(config.sweep_interval);
        sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let retention = chrono::Duration::from_std(config.archive_retention)
            .unwrap_or_else(|_| chrono::Duration::hours(24));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                event = events.recv() => {
                    let Some(event) = event else { break };
                    let result = match &event {
                        DispatchEvent::JobPending(job_id) => scheduler.offer_job(job_id).await,
                        DispatchEvent::WorkerIdle(worker_id) => scheduler.offer_to_worker(worker_id).await,
                    };
                    match result {
                        Ok(_) => {}
                        Err(DispatchError::JobNotFound(_)) | Err(DispatchError::WorkerNotFound(_)) => {
                            tracing::debug!(event = ?event, "Dispatch event for unknown entity");
                        }
                        Err(e) => tracing::warn!(event = ?event, error = %e, "Dispatch event failed"),
                    }
                }

                _ = sweep_interval.tick() => {
                    scheduler.sweep().await;
                    incidents.replay().await;

                    let cutoff = Utc::now() - retention;
                    let purged = jobs.purge_archive(cutoff).await;
                    let pruned = offers.prune_resolved(cutoff).await;
                    if purged > 0 || pruned > 0 {
                        tracing::debug!(purged, pruned, "Retention cleanup");
                    }
                }
            }
        }
        tracing::debug!("Dispatch loop stopped");
    }

    /// Job Source: a location needs service.
    pub async fn submit_job(&self, job: Job) -> Result<Job> {
        let job = self.jobs.submit(job).await?;
        self.events.emit(DispatchEvent::JobPending(job.id.clone()));
        Ok(job)
    }

    /// Job Source: the location was serviced without us.
    pub async fn retract_job(&self, job_id: &JobId) -> Result<Job> {
        self.jobs.retract(job_id).await
    }

    pub async fn job(&self, job_id: &JobId) -> Result<Job> {
        self.jobs.get(job_id).await
    }

    pub async fn list_jobs(&self, filter: JobFilter) -> Vec<Job> {
        self.jobs.list(filter).await.collect().await
    }

    pub async fn register_worker(&self, worker: Worker) -> Result<Worker> {
        self.workers.register(worker).await
    }

    /// Worker toggle. Coming online raises a dispatch event.
    pub async fn set_online(&self, worker_id: &WorkerId, online: bool) -> Result<Worker> {
        let worker = self.workers.set_online(worker_id, online).await?;
        if worker.status == WorkerStatus::Idle {
            self.events.emit(DispatchEvent::WorkerIdle(worker.id.clone()));
        }
        Ok(worker)
    }

    pub async fn update_location(
        &self,
        worker_id: &WorkerId,
        coordinate: Coordinate,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        self.workers.update_location(worker_id, coordinate, at).await
    }

    pub async fn worker(&self, worker_id: &WorkerId) -> Result<Worker> {
        self.workers.get(worker_id).await
    }

    pub async fn list_workers(&self) -> Vec<Worker> {
        self.workers.snapshot().await
    }

    pub async fn worker_history(&self, worker_id: &WorkerId) -> Result<Vec<HistoryEntry>> {
        self.workers.history(worker_id).await
    }

    pub async fn accept_offer(&self, offer_id: &Uuid) -> Result<Offer> {
        self.scheduler.accept(offer_id).await
    }

    pub async fn reject_offer(&self, offer_id: &Uuid, reason: &str) -> Result<Offer> {
        self.scheduler.reject(offer_id, reason).await
    }

    pub async fn offer(&self, offer_id: &Uuid) -> Result<OfferView> {
        self.scheduler.view(offer_id).await
    }

    pub async fn open_offer_for(&self, worker_id: &WorkerId) -> Option<OfferView> {
        self.scheduler.pending_for_worker(worker_id).await
    }

    pub async fn complete_job(&self, job_id: &JobId, worker_id: &WorkerId) -> Result<Completion> {
        self.completion.complete(job_id, worker_id).await
    }

    pub async fn abandon_job(&self, job_id: &JobId, worker_id: &WorkerId, reason: &str) -> Result<Job> {
        self.completion.abandon(job_id, worker_id, reason).await
    }

    pub async fn incident_feed(&self) -> Vec<IncidentReport> {
        self.incidents.feed().await
    }

    pub fn subscribe_incidents(&self) -> broadcast::Receiver<IncidentReport> {
        self.incidents.subscribe()
    }

    /// Offer alerts for every worker; filter by `worker_id` on the receiving side.
    pub fn subscribe_offers(&self) -> broadcast::Receiver<OfferNotification> {
        self.offer_feed.subscribe()
    }
}
