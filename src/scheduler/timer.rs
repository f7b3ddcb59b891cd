use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::scheduler::offer::OfferHandle;

/// One wake-up per outstanding offer, at its deadline.
///
/// The wake-up is dropped as soon as the offer resolves or the node shuts
/// down. `on_expire` is responsible for re-checking the offer under its locks.
#[derive(Clone)]
pub struct DeadlineTimer {
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl DeadlineTimer {
    pub fn new(tracker: TaskTracker, shutdown: CancellationToken) -> Self {
        Self { tracker, shutdown }
    }

    pub fn arm<F, Fut>(&self, offer: Arc<OfferHandle>, on_expire: F)
    where
        F: FnOnce(Arc<OfferHandle>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let shutdown = self.shutdown.clone();
        self.tracker.spawn(async move {
            let fired = {
                tokio::select! {
                    _ = offer.cancelled() => false,
                    _ = shutdown.cancelled() => false,
                    _ = tokio::time::sleep_until(offer.deadline) => true,
                }
            };

            if fired {
                tracing::debug!(offer_id = %offer.id, "Offer deadline reached");
                on_expire(offer).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{JobId, OfferStatus};
    use crate::worker::WorkerId;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn timer() -> (DeadlineTimer, CancellationToken) {
        let shutdown = CancellationToken::new();
        (DeadlineTimer::new(TaskTracker::new(), shutdown.clone()), shutdown)
    }

    fn offer(window: Duration) -> Arc<OfferHandle> {
        Arc::new(OfferHandle::new(JobId::from("bin-1"), WorkerId::from("w1"), window))
    }

    #[tokio::test(start_paused = true)]
    async fn fires_at_deadline_not_before() {
        let (timer, _) = timer();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();

        timer.arm(offer(Duration::from_secs(300)), move |_| async move {
            flag.store(true, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(299)).await;
        assert!(!fired.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn resolved_offer_disarms() {
        let (timer, _) = timer();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let handle = offer(Duration::from_secs(60));

        timer.arm(handle.clone(), move |_| async move {
            flag.store(true, Ordering::SeqCst);
        });
        {
            let mut state = handle.lock().await;
            handle.resolve(&mut state, OfferStatus::Accepted, None).unwrap();
        }

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_disarms() {
        let (timer, shutdown) = timer();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();

        timer.arm(offer(Duration::from_secs(60)), move |_| async move {
            flag.store(true, Ordering::SeqCst);
        });
        shutdown.cancel();

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
