//! Periodic enqueueing of recurring jobs.
//!
//! The enqueuer only inserts jobs; the processor runs them like any other job.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::payload::JobPayload;
use super::store::{JobStore, JobStoreExt};
use super::types::EnqueueOptions;

/// Handle to control and join a periodic enqueuer.
#[derive(Debug)]
pub struct EnqueuerHandle {
    shutdown: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

impl EnqueuerHandle {
    /// Request shutdown and wait for the loop to stop.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        let _ = self.join.await;
    }
}

/// Enqueues a fixed payload on a fixed interval.
///
/// - First enqueue happens one interval after spawn
/// - Enqueue failures are logged and retried on the next interval
/// - Missed intervals are skipped, not burst
#[derive(Debug)]
pub struct PeriodicEnqueuer;

impl PeriodicEnqueuer {
    pub fn spawn<P>(
        name: &'static str,
        store: Arc<dyn JobStore>,
        payload: P,
        interval: Duration,
    ) -> EnqueuerHandle
    where
        P: JobPayload + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let join = tokio::spawn(async move {
            info!(
                scheduler = name,
                kind = %P::KIND,
                interval_secs = interval.as_secs(),
                "periodic enqueuer started"
            );

            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        match store.enqueue_payload(&payload, EnqueueOptions::default()).await {
                            Ok(job_id) => debug!(scheduler = name, job_id = %job_id, "enqueued periodic job"),
                            Err(e) => warn!(scheduler = name, error = %e, "periodic enqueue failed"),
                        }
                    }
                }
            }

            info!(scheduler = name, "periodic enqueuer stopped");
        });

        EnqueuerHandle {
            shutdown: shutdown_tx,
            join,
        }
    }
}
