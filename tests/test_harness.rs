//! Shared helpers for dispatch integration tests.
//!
//! Nodes can be built two ways: `TestNode::manual` leaves the dispatch loop
//! stopped so a test drives the scheduler itself, `TestNode::running` starts
//! it so offers happen on their own.

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use dispatch_lite::config::{DispatchConfig, NodeConfig};
use dispatch_lite::geo::Coordinate;
use dispatch_lite::incident::{IncidentReport, IncidentStore, MemoryIncidentStore};
use dispatch_lite::node::Node;
use dispatch_lite::scheduler::{Job, JobId, Offer};
use dispatch_lite::worker::{Notifier, OfferNotification, Worker, WorkerId};
use dispatch_lite::{DispatchError, Result};

/// Default timings: 300 s window, 10 s alerts, 5 s sweep.
pub fn test_config() -> NodeConfig {
    NodeConfig::default().with_dispatch(DispatchConfig::default())
}

pub fn config_with_window(window: Duration) -> NodeConfig {
    NodeConfig::default().with_dispatch(DispatchConfig::default().with_acceptance_window(window))
}

/// Remembers every alert delivered.
#[derive(Default)]
pub struct RecordingNotifier {
    seen: Mutex<Vec<OfferNotification>>,
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: &OfferNotification) {
        self.seen.lock().unwrap().push(notification.clone());
    }
}

impl RecordingNotifier {
    pub fn for_offer(&self, offer: &Offer) -> Vec<OfferNotification> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.offer_id == offer.id)
            .cloned()
            .collect()
    }
}

/// Fails the first `failures` appends, then behaves like memory storage.
pub struct FlakyIncidentStore {
    failures_left: AtomicU32,
    attempts: AtomicU32,
    inner: MemoryIncidentStore,
}

impl FlakyIncidentStore {
    pub fn new(failures: u32) -> Self {
        Self {
            failures_left: AtomicU32::new(failures),
            attempts: AtomicU32::new(0),
            inner: MemoryIncidentStore::new(),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn heal(&self) {
        self.failures_left.store(0, Ordering::SeqCst);
    }

    pub async fn stored(&self) -> Vec<IncidentReport> {
        self.inner.load().await.unwrap()
    }
}

#[async_trait]
impl IncidentStore for FlakyIncidentStore {
    async fn append(&self, report: &IncidentReport) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(DispatchError::TransientStorageFailure("disk unavailable".into()));
        }
        self.inner.append(report).await
    }

    async fn load(&self) -> Result<Vec<IncidentReport>> {
        self.inner.load().await
    }
}

pub struct TestNode {
    pub node: Arc<Node>,
    pub alerts: Arc<RecordingNotifier>,
}

impl TestNode {
    /// Node without the dispatch loop or incident writer.
    pub fn manual(config: NodeConfig) -> Self {
        let (node, _runtime) = Self::build(config, Arc::new(MemoryIncidentStore::new()));
        node
    }

    /// Node with the dispatch loop and incident writer running.
    pub fn running(config: NodeConfig) -> Self {
        Self::running_with_store(config, Arc::new(MemoryIncidentStore::new()))
    }

    pub fn running_with_store(config: NodeConfig, store: Arc<dyn IncidentStore>) -> Self {
        let (test_node, runtime) = Self::build(config, store);
        test_node.node.start(runtime);
        test_node
    }

    fn build(
        config: NodeConfig,
        store: Arc<dyn IncidentStore>,
    ) -> (Self, dispatch_lite::node::NodeRuntime) {
        let alerts = Arc::new(RecordingNotifier::default());
        let sink: Arc<dyn Notifier> = alerts.clone();
        let (node, runtime) = Node::with_sinks(config, store, Some(sink));
        (
            Self {
                node: Arc::new(node),
                alerts,
            },
            runtime,
        )
    }

    pub async fn submit(&self, id: &str, lat: f64, lng: f64) -> JobId {
        self.node
            .submit_job(Job::new(id, Coordinate::new(lat, lng), format!("{} street", id)))
            .await
            .unwrap()
            .id
    }

    /// Registered, located and online.
    pub async fn idle_worker(&self, id: &str, lat: f64, lng: f64) -> WorkerId {
        let worker = Worker::new(id, format!("Driver {}", id), "+998 90 123 45 67")
            .with_vehicle(format!("01{}777", id.to_uppercase()));
        let worker_id = self.node.register_worker(worker).await.unwrap().id;
        self.node
            .update_location(&worker_id, Coordinate::new(lat, lng), Utc::now())
            .await
            .unwrap();
        self.node.set_online(&worker_id, true).await.unwrap();
        worker_id
    }

    /// The worker's open offer once one exists.
    pub async fn wait_for_offer(&self, worker_id: &WorkerId) -> Offer {
        let node = self.node.clone();
        let worker_id = worker_id.clone();
        let mut found = None;
        for _ in 0..500 {
            if let Some(view) = node.open_offer_for(&worker_id).await {
                found = Some(view.offer);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        found.unwrap_or_else(|| panic!("no offer reached worker {}", worker_id))
    }
}

/// Poll `check` until it returns true or `timeout` passes.
pub async fn assert_eventually<F, Fut>(mut check: F, timeout: Duration, msg: &str)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within {:?}: {}", timeout, msg);
}
