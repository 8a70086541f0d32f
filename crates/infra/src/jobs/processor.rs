//! Polling job processor with bounded concurrency and retry/backoff.
//!
//! Each tick:
//! 1. `fetch_due(batch_size)`; an empty batch ends the tick, a store error aborts it.
//! 2. The batch is split into chunks of `concurrency` jobs. Chunks run one after the
//!    other; the jobs inside a chunk run as concurrent tasks.
//! 3. Per job: claim (`mark_processing`), run the handler, then `mark_completed`,
//!    `reschedule` (backoff) or `mark_failed` (attempts exhausted).
//!
//! A tick that starts while another is still running is a no-op.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::ProcessorConfig;
use crate::error::{HandlerError, PersistenceError};

use super::registry::HandlerRegistry;
use super::store::JobStore;
use super::types::{Job, JobId, JobKind, RetryDecision};

/// Lifecycle error.
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("processor is already running")]
    AlreadyRunning,
    #[error("processor timer lock poisoned")]
    Poisoned,
}

/// A job that exhausted its attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalJobFailure {
    pub job_id: JobId,
    pub kind: JobKind,
    pub attempts: u32,
    pub last_error: String,
}

/// What happened to one job in a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Retrying {
        attempts: u32,
        next_run_at: DateTime<Utc>,
    },
    Failed(TerminalJobFailure),
    /// Not claimed (someone else took it, or it vanished) or the store refused the
    /// claim; the job was not run.
    Skipped,
    /// The handler ran but its result could not be recorded; the job is left in
    /// `processing`.
    Stranded(StrandedJob),
}

/// A job whose completion, reschedule or terminal failure was not persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrandedJob {
    pub job_id: JobId,
    pub kind: JobKind,
    pub error: String,
}

/// Summary of one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// The tick did nothing because another tick was in flight.
    pub overlapped: bool,
    pub fetched: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: Vec<TerminalJobFailure>,
    pub skipped: usize,
    pub stranded: Vec<StrandedJob>,
}

impl TickReport {
    fn overlapped() -> Self {
        Self {
            overlapped: true,
            ..Default::default()
        }
    }

    fn record(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Completed => self.completed += 1,
            JobOutcome::Retrying { .. } => self.retried += 1,
            JobOutcome::Failed(failure) => self.failed.push(failure),
            JobOutcome::Skipped => self.skipped += 1,
            JobOutcome::Stranded(job) => self.stranded.push(job),
        }
    }
}

/// Cumulative processor statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ProcessorStats {
    pub ticks: u64,
    pub overlapped_ticks: u64,
    pub aborted_ticks: u64,
    pub jobs_completed: u64,
    pub jobs_retried: u64,
    pub jobs_failed: u64,
    pub jobs_skipped: u64,
    pub jobs_stranded: u64,
}

impl ProcessorStats {
    fn absorb(&mut self, report: &TickReport) {
        self.ticks += 1;
        if report.overlapped {
            self.overlapped_ticks += 1;
        }
        self.jobs_completed += report.completed as u64;
        self.jobs_retried += report.retried as u64;
        self.jobs_failed += report.failed.len() as u64;
        self.jobs_skipped += report.skipped as u64;
        self.jobs_stranded += report.stranded.len() as u64;
    }
}

/// Running timer loop.
#[derive(Debug)]
struct TimerHandle {
    shutdown: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

/// Clears the in-flight flag when the tick ends, however it ends.
struct InFlightGuard<'a>(&'a AtomicBool);

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Executes one claimed job. Cheap to clone into a task.
#[derive(Clone)]
struct JobRunner {
    store: Arc<dyn JobStore>,
    registry: Arc<HandlerRegistry>,
    config: ProcessorConfig,
}

impl JobRunner {
    async fn run(self, job: Job) -> JobOutcome {
        if let Err(e) = self.store.mark_processing(job.id).await {
            if e.is_already_handled() {
                debug!(job_id = %job.id, kind = %job.kind, error = %e, "job not claimable, skipping");
            } else {
                warn!(job_id = %job.id, kind = %job.kind, error = %e, "failed to claim job");
            }
            return JobOutcome::Skipped;
        }

        debug!(job_id = %job.id, kind = %job.kind, attempts = job.attempts, "claimed job");

        match self.invoke(&job).await {
            Ok(()) => {
                let recorded = self.store.mark_completed(job.id).await;
                let outcome = settle(&job, "completion", recorded, JobOutcome::Completed);
                if outcome == JobOutcome::Completed {
                    debug!(job_id = %job.id, kind = %job.kind, "job completed");
                }
                outcome
            }
            Err(err) => self.handle_failure(&job, err).await,
        }
    }

    /// Run the handler in its own task so a panic stays a per-job failure.
    async fn invoke(&self, job: &Job) -> Result<(), HandlerError> {
        let handler = self.registry.handler(job.kind);
        let payload = job.payload.clone();
        let mut task = tokio::spawn(async move { handler.handle(&payload).await });

        let joined = match self.config.handler_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    task.abort();
                    return Err(HandlerError::TimedOut(limit));
                }
            },
            None => task.await,
        };

        match joined {
            Ok(result) => result,
            Err(join_err) if join_err.is_panic() => {
                Err(HandlerError::Panicked(panic_message(join_err.into_panic())))
            }
            Err(join_err) => Err(HandlerError::failed(join_err.to_string())),
        }
    }

    async fn handle_failure(&self, job: &Job, err: HandlerError) -> JobOutcome {
        let message = err.to_string();
        let decision = RetryDecision::after_failure(
            job.attempts,
            job.max_attempts,
            Utc::now(),
            &self.config.backoff,
        );

        match decision {
            RetryDecision::Retry { attempts, run_at } => {
                warn!(
                    job_id = %job.id,
                    kind = %job.kind,
                    attempts,
                    max_attempts = job.max_attempts,
                    next_run_at = %run_at,
                    error = %message,
                    "job failed, retry scheduled"
                );
                let recorded = self.store.reschedule(job.id, attempts, run_at, &message).await;
                settle(
                    job,
                    "reschedule",
                    recorded,
                    JobOutcome::Retrying {
                        attempts,
                        next_run_at: run_at,
                    },
                )
            }
            RetryDecision::Exhausted { attempts } => {
                error!(
                    job_id = %job.id,
                    kind = %job.kind,
                    attempts,
                    error = %message,
                    "job failed permanently, attempts exhausted"
                );
                let recorded = self.store.mark_failed(job.id, &message).await;
                settle(
                    job,
                    "terminal failure",
                    recorded,
                    JobOutcome::Failed(TerminalJobFailure {
                        job_id: job.id,
                        kind: job.kind,
                        attempts,
                        last_error: message,
                    }),
                )
            }
        }
    }
}

/// Turn the result of the final store write into the job's outcome.
///
/// A job that vanished or moved on keeps `outcome`; any other error strands it.
fn settle(
    job: &Job,
    step: &'static str,
    recorded: Result<(), PersistenceError>,
    outcome: JobOutcome,
) -> JobOutcome {
    match recorded {
        Ok(()) => outcome,
        Err(e) if e.is_already_handled() => {
            debug!(job_id = %job.id, kind = %job.kind, step, error = %e, "job changed underneath, result not recorded");
            outcome
        }
        Err(e) => {
            error!(
                job_id = %job.id,
                kind = %job.kind,
                step,
                error = %e,
                "failed to record job result, job left in processing"
            );
            JobOutcome::Stranded(StrandedJob {
                job_id: job.id,
                kind: job.kind,
                error: e.to_string(),
            })
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Background job processor.
///
/// Owns its in-flight flag and timer; several isolated instances can coexist (tests).
/// Call `stop()` before dropping a started processor: the timer task holds a
/// reference to it.
pub struct Processor {
    runner: JobRunner,
    in_flight: AtomicBool,
    timer: Mutex<Option<TimerHandle>>,
    stats: Mutex<ProcessorStats>,
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("config", &self.runner.config)
            .field("in_flight", &self.in_flight.load(Ordering::Relaxed))
            .finish()
    }
}

impl Processor {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<HandlerRegistry>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            runner: JobRunner {
                store,
                registry,
                config,
            },
            in_flight: AtomicBool::new(false),
            timer: Mutex::new(None),
            stats: Mutex::new(ProcessorStats::default()),
        }
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.runner.config
    }

    /// Current statistics.
    pub fn stats(&self) -> ProcessorStats {
        self.stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn is_running(&self) -> bool {
        self.timer.lock().map(|t| t.is_some()).unwrap_or(false)
    }

    /// Run one tick. Returns immediately with `overlapped = true` if another tick is in
    /// flight; fails only if fetching the batch fails.
    pub async fn tick(&self) -> Result<TickReport, PersistenceError> {
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight) else {
            debug!(processor = %self.runner.config.name, "tick already in flight, skipping");
            let report = TickReport::overlapped();
            self.record(&report);
            return Ok(report);
        };

        let batch = match self.runner.store.fetch_due(self.runner.config.batch_size).await {
            Ok(batch) => batch,
            Err(e) => {
                error!(processor = %self.runner.config.name, error = %e, "failed to fetch due jobs, tick aborted");
                if let Ok(mut stats) = self.stats.lock() {
                    stats.aborted_ticks += 1;
                }
                return Err(e);
            }
        };

        let mut report = TickReport {
            fetched: batch.len(),
            ..Default::default()
        };

        if !batch.is_empty() {
            debug!(processor = %self.runner.config.name, jobs = batch.len(), "processing batch");
        }

        for chunk in batch.chunks(self.runner.config.concurrency.max(1)) {
            let mut tasks = JoinSet::new();
            for job in chunk.iter().cloned() {
                tasks.spawn(self.runner.clone().run(job));
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(outcome) => report.record(outcome),
                    Err(e) => {
                        error!(processor = %self.runner.config.name, error = %e, "job task aborted");
                        report.skipped += 1;
                    }
                }
            }
        }

        self.record(&report);
        Ok(report)
    }

    fn record(&self, report: &TickReport) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.absorb(report);
        }
    }

    /// Start the timer loop: one tick every `poll_interval`, first one after one
    /// interval. Ticks missed while a tick runs are dropped, not queued.
    pub fn start(self: &Arc<Self>) -> Result<(), ProcessorError> {
        let mut timer = self.timer.lock().map_err(|_| ProcessorError::Poisoned)?;
        if timer.is_some() {
            return Err(ProcessorError::AlreadyRunning);
        }

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let processor = Arc::clone(self);
        let join = tokio::spawn(async move {
            let config = processor.config().clone();
            info!(
                processor = %config.name,
                poll_interval_ms = config.poll_interval.as_millis() as u64,
                batch_size = config.batch_size,
                concurrency = config.concurrency,
                "job processor started"
            );

            let start = tokio::time::Instant::now() + config.poll_interval;
            let mut interval = tokio::time::interval_at(start, config.poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = interval.tick() => {
                        // Errors are logged inside tick; the next timer fire retries.
                        let _ = processor.tick().await;
                    }
                }
            }

            info!(processor = %config.name, "job processor stopped");
        });

        *timer = Some(TimerHandle {
            shutdown: shutdown_tx,
            join,
        });
        Ok(())
    }

    /// Stop the timer loop and wait for an in-flight tick to finish.
    ///
    /// Returns `false` if the processor was not running.
    pub async fn stop(&self) -> bool {
        let handle = match self.timer.lock() {
            Ok(mut timer) => timer.take(),
            Err(_) => None,
        };

        match handle {
            Some(TimerHandle { shutdown, join }) => {
                let _ = shutdown.send(());
                if let Err(e) = join.await {
                    error!(processor = %self.runner.config.name, error = %e, "processor loop ended abnormally");
                }
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::{Barrier, Notify};

    use crate::jobs::registry::JobHandler;
    use crate::jobs::registry::tests::{CountingHandler, registry_with};
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::{EnqueueOptions, JobStatus};

    fn processor_with(
        store: Arc<InMemoryJobStore>,
        kind: JobKind,
        handler: Arc<dyn JobHandler>,
        config: ProcessorConfig,
    ) -> Arc<Processor> {
        Arc::new(Processor::new(
            store,
            Arc::new(registry_with(kind, handler)),
            config,
        ))
    }

    /// Make every pending job due now (skip the backoff wait).
    async fn fast_forward(store: &InMemoryJobStore, id: JobId) {
        store.mark_processing(id).await.unwrap();
        let job = store.get(id).await.unwrap().unwrap();
        store
            .reschedule(id, job.attempts, Utc::now() - chrono::Duration::seconds(1), "ff")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn successful_job_is_completed() {
        let store = InMemoryJobStore::arc();
        let handler = Arc::new(CountingHandler::default());
        let processor = processor_with(
            store.clone(),
            JobKind::SendNotification,
            handler.clone(),
            ProcessorConfig::default(),
        );

        let id = store
            .enqueue(JobKind::SendNotification, serde_json::json!({}), EnqueueOptions::default())
            .await
            .unwrap();

        let report = processor.tick().await.unwrap();
        assert_eq!(report.fetched, 1);
        assert_eq!(report.completed, 1);
        assert_eq!(handler.calls(), 1);

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 0);

        // Completed jobs are never picked up again.
        let report = processor.tick().await.unwrap();
        assert_eq!(report.fetched, 0);
        assert_eq!(handler.calls(), 1);
    }

    #[tokio::test]
    async fn failure_schedules_exponential_backoff() {
        let store = InMemoryJobStore::arc();
        let handler = Arc::new(CountingHandler::failing(usize::MAX));
        let processor = processor_with(
            store.clone(),
            JobKind::ProcessWaitlist,
            handler,
            ProcessorConfig::default(),
        );

        let id = store
            .enqueue(
                JobKind::ProcessWaitlist,
                serde_json::json!({}),
                EnqueueOptions::default().with_max_attempts(10),
            )
            .await
            .unwrap();

        for n in 1..=4u32 {
            let before = Utc::now();
            let report = processor.tick().await.unwrap();
            let after = Utc::now();
            assert_eq!(report.retried, 1);

            let job = store.get(id).await.unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Pending);
            assert_eq!(job.attempts, n);
            assert_eq!(job.last_error.as_deref(), Some("induced failure"));

            let expected = chrono::Duration::seconds(2i64.pow(n));
            assert!(job.scheduled_at >= before + expected);
            assert!(job.scheduled_at <= after + expected);

            fast_forward(&store, id).await;
        }
    }

    #[tokio::test]
    async fn always_failing_job_fails_after_max_attempts() {
        let store = InMemoryJobStore::arc();
        let handler = Arc::new(CountingHandler::failing(usize::MAX));
        let processor = processor_with(
            store.clone(),
            JobKind::ProcessWaitlist,
            handler.clone(),
            ProcessorConfig::default(),
        );

        let id = store
            .enqueue(JobKind::ProcessWaitlist, serde_json::json!({}), EnqueueOptions::default())
            .await
            .unwrap();

        let mut failures = Vec::new();
        for _ in 0..10 {
            let report = processor.tick().await.unwrap();
            failures.extend(report.failed);

            let job = store.get(id).await.unwrap().unwrap();
            assert!(job.attempts <= job.max_attempts);
            if job.status == JobStatus::Pending {
                fast_forward(&store, id).await;
            }
        }

        assert_eq!(handler.calls(), 3);
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 3);

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].job_id, id);
        assert_eq!(failures[0].attempts, 3);
        assert_eq!(processor.stats().jobs_failed, 1);
        assert_eq!(processor.stats().jobs_retried, 2);
    }

    #[tokio::test]
    async fn flaky_job_recovers() {
        let store = InMemoryJobStore::arc();
        let handler = Arc::new(CountingHandler::failing(1));
        let processor = processor_with(
            store.clone(),
            JobKind::SendNotification,
            handler.clone(),
            ProcessorConfig::default(),
        );

        let id = store
            .enqueue(JobKind::SendNotification, serde_json::json!({}), EnqueueOptions::default())
            .await
            .unwrap();

        processor.tick().await.unwrap();
        fast_forward(&store, id).await;
        let report = processor.tick().await.unwrap();

        assert_eq!(report.completed, 1);
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 1);
    }

    struct PanickingHandler;

    #[async_trait]
    impl JobHandler for PanickingHandler {
        async fn handle(&self, _payload: &serde_json::Value) -> Result<(), HandlerError> {
            panic!("handler exploded");
        }
    }

    #[tokio::test]
    async fn panicking_handler_is_a_failure_and_spares_siblings() {
        let store = InMemoryJobStore::arc();
        let registry = HandlerRegistry::builder()
            .register(JobKind::ProcessWaitlist, Arc::new(PanickingHandler))
            .unwrap()
            .register(JobKind::SendNotification, Arc::new(CountingHandler::default()))
            .unwrap()
            .register(JobKind::CleanupExpiredRequests, Arc::new(CountingHandler::default()))
            .unwrap()
            .register(JobKind::UpdateClassStatistics, Arc::new(CountingHandler::default()))
            .unwrap()
            .build()
            .unwrap();
        let processor = Processor::new(store.clone(), Arc::new(registry), ProcessorConfig::default());

        let bad = store
            .enqueue(JobKind::ProcessWaitlist, serde_json::json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        let good = store
            .enqueue(JobKind::SendNotification, serde_json::json!({}), EnqueueOptions::default())
            .await
            .unwrap();

        let report = processor.tick().await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(report.retried, 1);

        let bad = store.get(bad).await.unwrap().unwrap();
        assert_eq!(bad.status, JobStatus::Pending);
        assert!(bad.last_error.unwrap().contains("handler exploded"));
        assert_eq!(
            store.get(good).await.unwrap().unwrap().status,
            JobStatus::Completed
        );
    }

    struct SlowHandler;

    #[async_trait]
    impl JobHandler for SlowHandler {
        async fn handle(&self, _payload: &serde_json::Value) -> Result<(), HandlerError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn handler_timeout_is_a_failure() {
        let store = InMemoryJobStore::arc();
        let processor = processor_with(
            store.clone(),
            JobKind::ProcessWaitlist,
            Arc::new(SlowHandler),
            ProcessorConfig::default().with_handler_timeout(Duration::from_millis(20)),
        );

        let id = store
            .enqueue(JobKind::ProcessWaitlist, serde_json::json!({}), EnqueueOptions::default())
            .await
            .unwrap();

        let report = processor.tick().await.unwrap();
        assert_eq!(report.retried, 1);
        let job = store.get(id).await.unwrap().unwrap();
        assert!(job.last_error.unwrap().contains("timed out"));
    }

    /// Records peak concurrency; waits at a barrier so chunk members overlap.
    struct ConcurrencyGauge {
        current: std::sync::atomic::AtomicUsize,
        peak: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl JobHandler for ConcurrencyGauge {
        async fn handle(&self, _payload: &serde_json::Value) -> Result<(), HandlerError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrency_is_bounded_by_chunk_size() {
        let store = InMemoryJobStore::arc();
        let gauge = Arc::new(ConcurrencyGauge {
            current: Default::default(),
            peak: Default::default(),
        });
        let processor = processor_with(
            store.clone(),
            JobKind::SendNotification,
            gauge.clone(),
            ProcessorConfig::default(),
        );

        for _ in 0..12 {
            store
                .enqueue(JobKind::SendNotification, serde_json::json!({}), EnqueueOptions::default())
                .await
                .unwrap();
        }

        let report = processor.tick().await.unwrap();
        assert_eq!(report.fetched, 10);
        assert_eq!(report.completed, 10);
        assert!(gauge.peak.load(Ordering::SeqCst) <= 3);
        assert!(gauge.peak.load(Ordering::SeqCst) >= 2);

        assert_eq!(store.stats().await.unwrap().pending, 2);
    }

    /// Blocks until released, signalling when it has started.
    struct GateHandler {
        started: Notify,
        release: Barrier,
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl JobHandler for GateHandler {
        async fn handle(&self, _payload: &serde_json::Value) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.started.notify_one();
            self.release.wait().await;
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn overlapping_tick_is_a_noop() {
        let store = InMemoryJobStore::arc();
        let gate = Arc::new(GateHandler {
            started: Notify::new(),
            release: Barrier::new(2),
            calls: Default::default(),
        });
        let processor = processor_with(
            store.clone(),
            JobKind::ProcessWaitlist,
            gate.clone(),
            ProcessorConfig::default(),
        );

        let id = store
            .enqueue(JobKind::ProcessWaitlist, serde_json::json!({}), EnqueueOptions::default())
            .await
            .unwrap();

        let first = tokio::spawn({
            let processor = processor.clone();
            async move { processor.tick().await }
        });
        gate.started.notified().await;

        let second = processor.tick().await.unwrap();
        assert!(second.overlapped);
        assert_eq!(second.fetched, 0);

        gate.release.wait().await;
        let first = first.await.unwrap().unwrap();
        assert_eq!(first.completed, 1);

        assert_eq!(gate.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            store.get(id).await.unwrap().unwrap().status,
            JobStatus::Completed
        );
        assert_eq!(processor.stats().overlapped_ticks, 1);
    }

    #[tokio::test]
    async fn job_claimed_elsewhere_is_skipped() {
        let store = InMemoryJobStore::arc();
        let handler = Arc::new(CountingHandler::default());
        let processor = processor_with(
            store.clone(),
            JobKind::SendNotification,
            handler.clone(),
            ProcessorConfig::default(),
        );
        let id = store
            .enqueue(JobKind::SendNotification, serde_json::json!({}), EnqueueOptions::default())
            .await
            .unwrap();

        let job = store.fetch_due(1).await.unwrap().remove(0);
        store.mark_processing(id).await.unwrap();

        let outcome = processor.runner.clone().run(job).await;
        assert_eq!(outcome, JobOutcome::Skipped);
        assert_eq!(handler.calls(), 0);
    }

    /// Delegates to an in-memory store, failing selected operations on demand.
    #[derive(Default)]
    struct FaultyStore {
        inner: InMemoryJobStore,
        fetch_failures: std::sync::atomic::AtomicUsize,
        fetch_calls: std::sync::atomic::AtomicUsize,
        fail_completion: AtomicBool,
    }

    fn unavailable() -> PersistenceError {
        PersistenceError::Unavailable("connection reset".to_string())
    }

    #[async_trait]
    impl JobStore for FaultyStore {
        async fn enqueue(
            &self,
            kind: JobKind,
            payload: serde_json::Value,
            options: EnqueueOptions,
        ) -> Result<JobId, PersistenceError> {
            self.inner.enqueue(kind, payload, options).await
        }

        async fn fetch_due(&self, limit: usize) -> Result<Vec<Job>, PersistenceError> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.fetch_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fetch_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(unavailable());
            }
            self.inner.fetch_due(limit).await
        }

        async fn mark_processing(&self, id: JobId) -> Result<(), PersistenceError> {
            self.inner.mark_processing(id).await
        }

        async fn mark_completed(&self, id: JobId) -> Result<(), PersistenceError> {
            if self.fail_completion.load(Ordering::SeqCst) {
                return Err(unavailable());
            }
            self.inner.mark_completed(id).await
        }

        async fn mark_failed(&self, id: JobId, error: &str) -> Result<(), PersistenceError> {
            self.inner.mark_failed(id, error).await
        }

        async fn reschedule(
            &self,
            id: JobId,
            attempts: u32,
            scheduled_at: DateTime<Utc>,
            error: &str,
        ) -> Result<(), PersistenceError> {
            self.inner.reschedule(id, attempts, scheduled_at, error).await
        }

        async fn get(&self, id: JobId) -> Result<Option<Job>, PersistenceError> {
            self.inner.get(id).await
        }

        async fn list_by_status(
            &self,
            status: JobStatus,
            limit: usize,
        ) -> Result<Vec<Job>, PersistenceError> {
            self.inner.list_by_status(status, limit).await
        }

        async fn stats(&self) -> Result<crate::jobs::store::JobStats, PersistenceError> {
            self.inner.stats().await
        }
    }

    #[tokio::test]
    async fn fetch_error_aborts_the_tick_only() {
        let store = Arc::new(FaultyStore::default());
        store.fetch_failures.store(1, Ordering::SeqCst);
        let handler = Arc::new(CountingHandler::default());
        let processor = Processor::new(
            store.clone(),
            Arc::new(registry_with(JobKind::SendNotification, handler.clone())),
            ProcessorConfig::default(),
        );
        store
            .enqueue(JobKind::SendNotification, serde_json::json!({}), EnqueueOptions::default())
            .await
            .unwrap();

        let err = processor.tick().await.unwrap_err();
        assert!(matches!(err, PersistenceError::Unavailable(_)));
        assert!(!processor.in_flight.load(Ordering::SeqCst));
        assert_eq!(processor.stats().aborted_ticks, 1);
        assert_eq!(handler.calls(), 0);

        let report = processor.tick().await.unwrap();
        assert!(!report.overlapped);
        assert_eq!(report.completed, 1);
        assert_eq!(handler.calls(), 1);
        assert_eq!(store.fetch_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unrecorded_completion_is_reported_as_stranded() {
        let store = Arc::new(FaultyStore::default());
        store.fail_completion.store(true, Ordering::SeqCst);
        let handler = Arc::new(CountingHandler::default());
        let processor = Processor::new(
            store.clone(),
            Arc::new(registry_with(JobKind::SendNotification, handler.clone())),
            ProcessorConfig::default(),
        );
        let id = store
            .enqueue(JobKind::SendNotification, serde_json::json!({}), EnqueueOptions::default())
            .await
            .unwrap();

        let report = processor.tick().await.unwrap();
        assert_eq!(handler.calls(), 1);
        assert_eq!(report.completed, 0);
        assert_eq!(report.stranded.len(), 1);
        assert_eq!(report.stranded[0].job_id, id);
        assert!(report.stranded[0].error.contains("connection reset"));

        let stats = processor.stats();
        assert_eq!(stats.jobs_completed, 0);
        assert_eq!(stats.jobs_stranded, 1);
        assert_eq!(
            store.get(id).await.unwrap().unwrap().status,
            JobStatus::Processing
        );
    }

    #[tokio::test(start_paused = true)]
    async fn start_and_stop_drive_ticks() {
        let store = InMemoryJobStore::arc();
        let handler = Arc::new(CountingHandler::default());
        let processor = processor_with(
            store.clone(),
            JobKind::SendNotification,
            handler.clone(),
            ProcessorConfig::default().with_poll_interval(Duration::from_secs(5)),
        );

        store
            .enqueue(JobKind::SendNotification, serde_json::json!({}), EnqueueOptions::default())
            .await
            .unwrap();

        processor.start().unwrap();
        assert!(processor.is_running());
        assert!(matches!(processor.start(), Err(ProcessorError::AlreadyRunning)));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(handler.calls(), 1);

        assert!(processor.stop().await);
        assert!(!processor.is_running());
        assert!(!processor.stop().await);
    }
}
