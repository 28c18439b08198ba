//! Processing loop.
//!
//! ```text
//! Starting -> Running -> Draining -> Stopped
//!               |  ^
//!               v  |
//!              Faulted -> Stopped (reconnect cycles exhausted)
//! ```
//!
//! One item is in flight at a time. Per-item failures never stop the loop;
//! only losing Redis for longer than the reconnect budget does.

use crate::backoff::{Sleeper, TokioSleeper};
use crate::config::WorkerConfig;
use crate::connection::{ConnectionState, Dial, RedisConnector};
use crate::error::{ConnectionError, FetchError, ProcessingError, WorkerError};
use crate::job::WorkItem;
use crate::metrics::WorkerMetrics;
use crate::processor::WorkProcessor;
use crate::source::{JobSource, RequeueOutcome};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Processing loop lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Starting,
    Running,
    Faulted,
    Draining,
    Stopped,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            WorkerState::Starting => "starting",
            WorkerState::Running => "running",
            WorkerState::Faulted => "faulted",
            WorkerState::Draining => "draining",
            WorkerState::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

/// Counters reported when the loop stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerSummary {
    /// Items processed and acknowledged
    pub processed: u64,
    /// Items handed back for another attempt
    pub retried: u64,
    /// Items moved to the dead-letter destination
    pub dead_lettered: u64,
    /// Items cut short by shutdown and handed back without using an attempt
    pub released: u64,
    /// Items whose settlement failed; they stay with the source for recovery
    pub unsettled: u64,
}

enum Step {
    Idle,
    Item(WorkItem),
    Unreachable(ConnectionError),
    FetchFailed(FetchError),
    Shutdown,
}

enum Outcome {
    Done,
    Failed(ProcessingError),
    Abandoned,
}

enum Settled {
    Acked,
    Requeued(RequeueOutcome),
    Released,
    DeadLettered,
}

/// Fetch -> process -> settle loop over one job source.
pub struct Worker<D: Dial, S, P> {
    connector: RedisConnector<D>,
    source: S,
    processor: Arc<P>,
    config: WorkerConfig,
    state: watch::Sender<WorkerState>,
    sleeper: Arc<dyn Sleeper>,
    metrics: WorkerMetrics,
    summary: WorkerSummary,
    needs_recovery: bool,
    last_recovery: Option<tokio::time::Instant>,
}

impl<D, S, P> Worker<D, S, P>
where
    D: Dial + 'static,
    S: JobSource<D::Session> + 'static,
    P: WorkProcessor,
{
    pub fn new(dialer: D, source: S, processor: P, config: WorkerConfig) -> Self {
        let (state, _) = watch::channel(WorkerState::Starting);
        let metrics = WorkerMetrics::new(source.name(), processor.name());
        let connector = RedisConnector::new(dialer, config.reconnect);

        Self {
            connector,
            source,
            processor: Arc::new(processor),
            config,
            state,
            sleeper: Arc::new(TokioSleeper),
            metrics,
            summary: WorkerSummary::default(),
            needs_recovery: true,
            last_recovery: None,
        }
    }

    /// Replace the sleeper used for reconnect and fault backoff
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.connector = self.connector.with_sleeper(sleeper.clone());
        self.sleeper = sleeper;
        self
    }

    /// Read-only view of the loop state
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Read-only view of the connection state
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connector.subscribe()
    }

    pub fn dialer(&self) -> &D {
        self.connector.dialer()
    }

    /// Run until `shutdown` turns `true` or Redis stays unreachable.
    ///
    /// Returns the processing summary on a clean stop, or the connection
    /// error that ended the loop.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<WorkerSummary, WorkerError> {
        info!(
            queue = %self.source.name(),
            processor = %self.processor.name(),
            consumer = %self.config.consumer_name,
            "Starting worker"
        );

        let startup = tokio::select! {
            result = self.connector.ensure_connected() => result.map(|_| ()),
            _ = wait_for_shutdown(&mut shutdown) => return Ok(self.stop()),
        };

        if let Err(e) = startup {
            error!(error = %e, "Redis unreachable at start-up");
            self.stop();
            return Err(e.into());
        }

        self.metrics.connected(true);
        self.set_state(WorkerState::Running);

        let mut fault_cycles = 0;
        let mut fetch_failures = 0;

        while !*shutdown.borrow() {
            match self.next_item(&mut shutdown).await {
                Step::Shutdown => break,
                Step::Idle => {
                    fault_cycles = 0;
                    fetch_failures = 0;
                    self.set_state(WorkerState::Running);
                }
                Step::Item(item) => {
                    fault_cycles = 0;
                    fetch_failures = 0;
                    self.set_state(WorkerState::Running);

                    let outcome = self.run_handler(&item, &mut shutdown).await;
                    self.settle(item, outcome).await;
                }
                Step::Unreachable(e) => {
                    fault_cycles += 1;
                    self.metrics.connected(false);
                    self.set_state(WorkerState::Faulted);

                    if fault_cycles > self.config.max_fault_cycles {
                        error!(
                            cycles = fault_cycles,
                            error = %e,
                            "Redis unreachable, giving up"
                        );
                        self.stop();
                        return Err(e.into());
                    }

                    let delay = self.config.reconnect.delay_for(fault_cycles - 1);
                    warn!(
                        cycle = fault_cycles,
                        max_cycles = self.config.max_fault_cycles,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Redis unreachable, pausing before next reconnect cycle"
                    );
                    if self.pause(delay, &mut shutdown).await {
                        break;
                    }
                }
                Step::FetchFailed(e) => {
                    fetch_failures += 1;
                    self.metrics.fetch_failed();

                    if e.is_connection_error() {
                        self.lose_connection(&e.to_string());
                    }

                    let delay = self.config.reconnect.delay_for(fetch_failures - 1);
                    warn!(
                        failures = fetch_failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Fetch failed"
                    );
                    if self.pause(delay, &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        self.set_state(WorkerState::Draining);
        Ok(self.stop())
    }

    async fn next_item(&mut self, shutdown: &mut watch::Receiver<bool>) -> Step {
        let timeout = self.config.fetch_timeout;

        let session = tokio::select! {
            result = self.connector.ensure_connected() => match result {
                Ok(session) => session,
                Err(e) => return Step::Unreachable(e),
            },
            _ = wait_for_shutdown(shutdown) => return Step::Shutdown,
        };
        self.metrics.connected(true);

        // Sweep on (re)connect, then once per claim interval so items left
        // by consumers that never came back are picked up.
        let sweep_due = self
            .last_recovery
            .is_none_or(|at| at.elapsed() >= self.config.claim_idle);

        if self.needs_recovery || sweep_due {
            match self.source.recover(session).await {
                Ok(recovered) => {
                    self.needs_recovery = false;
                    self.last_recovery = Some(tokio::time::Instant::now());
                    if recovered > 0 {
                        self.metrics.items_recovered(recovered);
                    }
                }
                Err(e) if e.is_connection_error() => return Step::FetchFailed(e),
                Err(e) => {
                    self.needs_recovery = false;
                    self.last_recovery = Some(tokio::time::Instant::now());
                    warn!(error = %e, "Failed to recover unsettled items");
                }
            }
        }

        tokio::select! {
            result = self.source.fetch(session, timeout) => match result {
                Ok(Some(item)) => Step::Item(item),
                Ok(None) => Step::Idle,
                Err(e) => Step::FetchFailed(e),
            },
            _ = wait_for_shutdown(shutdown) => Step::Shutdown,
        }
    }

    async fn run_handler(&mut self, item: &WorkItem, shutdown: &mut watch::Receiver<bool>) -> Outcome {
        self.metrics.item_received();
        debug!(item_id = %item.id(), attempts = item.attempts(), "Processing item");

        let started = Instant::now();
        let processor = Arc::clone(&self.processor);
        let work = processor.process(item);
        tokio::pin!(work);

        let result = tokio::select! {
            result = &mut work => result,
            _ = wait_for_shutdown(shutdown) => {
                self.set_state(WorkerState::Draining);
                info!(
                    item_id = %item.id(),
                    grace_ms = self.config.grace_period.as_millis() as u64,
                    "Shutdown requested, waiting for in-flight item"
                );

                match tokio::time::timeout(self.config.grace_period, &mut work).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(item_id = %item.id(), "Grace period elapsed, abandoning in-flight item");
                        self.metrics.item_failed("abandoned");
                        return Outcome::Abandoned;
                    }
                }
            }
        };

        match result {
            Ok(()) => {
                self.metrics.item_processed(started.elapsed());
                Outcome::Done
            }
            Err(e) if e.is_retryable() => {
                warn!(item_id = %item.id(), attempts = item.attempts(), error = %e, "Item failed, will retry");
                self.metrics.item_failed("transient");
                Outcome::Failed(e)
            }
            Err(e) => {
                error!(item_id = %item.id(), error = %e, "Item failed permanently");
                self.metrics.item_failed("permanent");
                Outcome::Failed(e)
            }
        }
    }

    async fn settle(&mut self, item: WorkItem, outcome: Outcome) {
        let item_id = item.id().to_string();

        // Never redial here: during shutdown nothing would bound the wait.
        // Without a session the item stays with the source for recovery.
        let Some(session) = self.connector.session() else {
            error!(item_id = %item_id, "Could not settle item, no Redis session");
            self.summary.unsettled += 1;
            self.metrics.settle_failed();
            self.needs_recovery = true;
            return;
        };

        let settled = match outcome {
            Outcome::Done => self
                .source
                .acknowledge(session, &item)
                .await
                .map(|()| Settled::Acked),
            Outcome::Failed(e) if e.is_retryable() => self
                .source
                .requeue(session, item, &e.message)
                .await
                .map(Settled::Requeued),
            Outcome::Failed(e) => self
                .source
                .dead_letter(session, item, &e.message)
                .await
                .map(|()| Settled::DeadLettered),
            Outcome::Abandoned => self
                .source
                .release(session, item)
                .await
                .map(|()| Settled::Released),
        };

        match settled {
            Ok(Settled::Acked) => {
                self.summary.processed += 1;
                debug!(item_id = %item_id, "Item processed");
            }
            Ok(Settled::Requeued(RequeueOutcome::Requeued { attempt })) => {
                self.summary.retried += 1;
                self.metrics.item_retried();
                info!(
                    item_id = %item_id,
                    attempt,
                    max_retries = self.config.max_retries,
                    "Item requeued"
                );
            }
            Ok(Settled::Released) => {
                self.summary.released += 1;
                info!(item_id = %item_id, "Item released back to the queue");
            }
            Ok(Settled::Requeued(RequeueOutcome::DeadLettered)) | Ok(Settled::DeadLettered) => {
                self.summary.dead_lettered += 1;
                self.metrics.item_dead_lettered();
            }
            Err(e) => {
                error!(item_id = %item_id, error = %e, "Failed to settle item");
                self.summary.unsettled += 1;
                self.metrics.settle_failed();
                if e.is_connection_error() {
                    self.lose_connection(&e.to_string());
                }
            }
        }
    }

    /// Sleep unless shutdown arrives first. Returns `true` on shutdown.
    async fn pause(&self, delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = self.sleeper.sleep(delay) => false,
            _ = wait_for_shutdown(shutdown) => true,
        }
    }

    fn lose_connection(&mut self, reason: &str) {
        self.connector.invalidate(reason);
        self.metrics.connected(false);
        self.needs_recovery = true;
    }

    fn set_state(&self, next: WorkerState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            debug!(from = %current, to = %next, "Worker state changed");
            *current = next;
            true
        });
    }

    fn stop(&mut self) -> WorkerSummary {
        self.connector.disconnect();
        self.metrics.connected(false);
        self.set_state(WorkerState::Stopped);

        info!(
            processed = self.summary.processed,
            retried = self.summary.retried,
            dead_lettered = self.summary.dead_lettered,
            unsettled = self.summary.unsettled,
            "Worker stopped"
        );

        self.summary
    }
}

/// Resolves once shutdown is requested. If the sender is gone nobody can
/// request it any more, so this never resolves.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::{Backoff, RecordingSleeper};
    use crate::health::{Health, HealthReporter};
    use crate::source::InMemorySource;
    use crate::test_support::{wait_until, FakeDial};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::task::JoinHandle;

    /// Fails permanently on payload "poison", transiently on "flaky",
    /// otherwise sleeps for `delay` and succeeds.
    struct ScriptedProcessor {
        calls: Arc<AtomicU32>,
        delay: Duration,
    }

    impl ScriptedProcessor {
        fn new() -> (Self, Arc<AtomicU32>) {
            let calls = Arc::new(AtomicU32::new(0));
            let processor = Self {
                calls: calls.clone(),
                delay: Duration::ZERO,
            };
            (processor, calls)
        }

        fn slow(delay: Duration) -> Self {
            Self {
                calls: Arc::new(AtomicU32::new(0)),
                delay,
            }
        }
    }

    #[async_trait]
    impl WorkProcessor for ScriptedProcessor {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn process(&self, item: &WorkItem) -> Result<(), ProcessingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match item.payload() {
                b"poison" => Err(ProcessingError::permanent("cannot parse payload")),
                b"flaky" => Err(ProcessingError::transient("upstream timed out")),
                _ => {
                    if !self.delay.is_zero() {
                        tokio::time::sleep(self.delay).await;
                    }
                    Ok(())
                }
            }
        }
    }

    fn config() -> WorkerConfig {
        WorkerConfig::new("jobs")
            .with_consumer_name("test")
            .with_fetch_timeout(Duration::from_millis(10))
    }

    struct Harness {
        shutdown: watch::Sender<bool>,
        states: watch::Receiver<WorkerState>,
        connection: watch::Receiver<ConnectionState>,
        handle: JoinHandle<Result<WorkerSummary, WorkerError>>,
    }

    impl Harness {
        fn start<P: WorkProcessor>(
            dial: FakeDial,
            source: InMemorySource,
            processor: P,
            config: WorkerConfig,
        ) -> (Self, Arc<RecordingSleeper>) {
            let sleeper = Arc::new(RecordingSleeper::new());
            let worker = Worker::new(dial, source, processor, config).with_sleeper(sleeper.clone());
            let (shutdown, rx) = watch::channel(false);
            let states = worker.subscribe();
            let connection = worker.connection_state();
            let handle = tokio::spawn(worker.run(rx));

            let harness = Self {
                shutdown,
                states,
                connection,
                handle,
            };
            (harness, sleeper)
        }

        async fn stop(self) -> Result<WorkerSummary, WorkerError> {
            self.shutdown.send_replace(true);
            self.handle.await.unwrap()
        }
    }

    #[tokio::test]
    async fn test_failing_item_does_not_block_later_items() {
        let source = InMemorySource::new("jobs", 3);
        source.push("poison");
        source.push("ok");
        let (processor, calls) = ScriptedProcessor::new();

        let (harness, _) = Harness::start(FakeDial::reachable(), source.clone(), processor, config());
        wait_until(|| source.acked_count() == 1 && source.dead_letters().len() == 1).await;
        let summary = harness.stop().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.dead_lettered, 1);
        assert_eq!(source.dead_letters()[0].reason, "cannot parse payload");
    }

    #[tokio::test]
    async fn test_transient_failures_retry_then_dead_letter() {
        let source = InMemorySource::new("jobs", 2);
        source.push("flaky");
        let (processor, calls) = ScriptedProcessor::new();

        let (harness, _) = Harness::start(
            FakeDial::reachable(),
            source.clone(),
            processor,
            config().with_max_retries(2),
        );
        wait_until(|| source.dead_letters().len() == 1).await;
        let summary = harness.stop().await.unwrap();

        // First delivery plus two retries
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(summary.retried, 2);
        assert_eq!(summary.dead_lettered, 1);
        assert_eq!(source.dead_letters()[0].attempts, 3);
        assert_eq!(source.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_at_startup_fails_after_backoff() {
        let dial = FakeDial::unreachable();
        let (processor, calls) = ScriptedProcessor::new();

        let (harness, sleeper) = Harness::start(
            dial.clone(),
            InMemorySource::new("jobs", 3),
            processor,
            config(),
        );
        let states = harness.states.clone();
        let err = harness.handle.await.unwrap().unwrap_err();

        let WorkerError::Connection(ConnectionError::Exhausted { attempts, .. }) = err else {
            panic!("expected exhausted reconnect budget, got {err:?}");
        };
        assert_eq!(attempts, 4);
        assert_eq!(dial.dials(), 4);
        assert_eq!(
            sleeper.slept(),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
        assert_eq!(*states.borrow(), WorkerState::Stopped);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_queue_idles_and_reports_healthy() {
        let dial = FakeDial::reachable();
        let source = InMemorySource::new("jobs", 3);
        let (processor, calls) = ScriptedProcessor::new();

        let (harness, _) = Harness::start(dial.clone(), source.clone(), processor, config());
        let states = harness.states.clone();
        wait_until(|| *states.borrow() == WorkerState::Running).await;

        // Let a few empty fetches go by
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*harness.states.borrow(), WorkerState::Running);

        let reporter = HealthReporter::new(dial, harness.connection.clone());
        assert_eq!(reporter.check().await.status, Health::Healthy);

        let summary = harness.stop().await.unwrap();
        assert_eq!(summary, WorkerSummary::default());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fetch_failure_reconnects_and_continues() {
        let dial = FakeDial::reachable();
        let source = InMemorySource::new("jobs", 3);
        source.fail_next_fetches(2);
        source.push("ok");
        let (processor, _) = ScriptedProcessor::new();

        let (harness, sleeper) = Harness::start(dial.clone(), source.clone(), processor, config());
        wait_until(|| source.acked_count() == 1).await;
        let summary = harness.stop().await.unwrap();

        assert_eq!(summary.processed, 1);
        assert_eq!(dial.dials(), 3);
        assert_eq!(
            sleeper.slept(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
    }

    #[tokio::test]
    async fn test_partition_then_restore() {
        let dial = FakeDial::reachable();
        let source = InMemorySource::new("jobs", 3);
        let (processor, _) = ScriptedProcessor::new();

        let (harness, _) = Harness::start(
            dial.clone(),
            source.clone(),
            processor,
            config().with_max_fault_cycles(u32::MAX),
        );
        let reporter = HealthReporter::new(dial.clone(), harness.connection.clone());
        let states = harness.states.clone();
        wait_until(|| *states.borrow() == WorkerState::Running).await;
        assert_eq!(reporter.check().await.status, Health::Healthy);

        // Partition: the next fetch drops the connection and dials start failing
        dial.set_up(false);
        source.fail_next_fetches(1);
        wait_until(|| *states.borrow() == WorkerState::Faulted).await;
        assert_eq!(reporter.check().await.status, Health::Unhealthy);

        // Restore
        dial.set_up(true);
        let connection = harness.connection.clone();
        wait_until(|| {
            *connection.borrow() == ConnectionState::Connected && *states.borrow() == WorkerState::Running
        })
        .await;
        assert_eq!(reporter.check().await.status, Health::Healthy);

        source.push("after restore");
        wait_until(|| source.acked_count() == 1).await;
        let summary = harness.stop().await.unwrap();
        assert_eq!(summary.processed, 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_fault_cycles() {
        let dial = FakeDial::reachable();
        let source = InMemorySource::new("jobs", 3);
        let (processor, _) = ScriptedProcessor::new();

        let (harness, _) = Harness::start(
            dial.clone(),
            source.clone(),
            processor,
            config().with_max_fault_cycles(2),
        );
        let states = harness.states.clone();
        wait_until(|| *states.borrow() == WorkerState::Running).await;

        dial.set_up(false);
        source.fail_next_fetches(1);
        let err = harness.handle.await.unwrap().unwrap_err();

        assert!(matches!(err, WorkerError::Connection(ConnectionError::Exhausted { .. })));
        // 1 start-up dial, then three cycles of four dials
        assert_eq!(dial.dials(), 13);
        assert_eq!(*states.borrow(), WorkerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_lets_in_flight_item_finish() {
        let source = InMemorySource::new("jobs", 3);
        source.push("slow");
        let processor = ScriptedProcessor::slow(Duration::from_secs(3));

        let (harness, _) = Harness::start(
            FakeDial::reachable(),
            source.clone(),
            processor,
            config().with_grace_period(Duration::from_secs(10)),
        );
        wait_until(|| source.in_flight_len() == 1).await;

        let states = harness.states.clone();
        let summary = harness.stop().await.unwrap();

        assert_eq!(summary.processed, 1);
        assert_eq!(source.acked_count(), 1);
        assert_eq!(*states.borrow(), WorkerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_deadline_releases_in_flight_item() {
        // No retries left: a counted attempt would dead-letter the item
        let source = InMemorySource::new("jobs", 0);
        let id = source.push("stuck");
        let processor = ScriptedProcessor::slow(Duration::from_secs(60));

        let (harness, _) = Harness::start(
            FakeDial::reachable(),
            source.clone(),
            processor,
            config().with_max_retries(0).with_grace_period(Duration::from_secs(1)),
        );
        wait_until(|| source.in_flight_len() == 1).await;

        let summary = harness.stop().await.unwrap();

        assert_eq!(summary.processed, 0);
        assert_eq!(summary.released, 1);
        assert_eq!(summary.retried, 0);
        assert_eq!(summary.dead_lettered, 0);
        assert!(source.dead_letters().is_empty());
        assert_eq!(source.pending_len(), 1);
        assert_eq!(source.in_flight_len(), 0);

        let mut next = source.clone();
        let item = next.fetch(&mut (), Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(item.id(), id);
        assert_eq!(item.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_with_redis_down_does_not_redial() {
        let dial = FakeDial::reachable();
        let source = InMemorySource::new("jobs", 3);
        source.push("stuck");
        let processor = ScriptedProcessor::slow(Duration::from_secs(60));

        let (harness, sleeper) = Harness::start(
            dial.clone(),
            source.clone(),
            processor,
            config().with_grace_period(Duration::from_secs(1)),
        );
        wait_until(|| source.in_flight_len() == 1).await;
        dial.set_up(false);

        let started = tokio::time::Instant::now();
        let summary = harness.stop().await.unwrap();

        assert_eq!(summary.released, 1);
        assert_eq!(dial.dials(), 1);
        assert!(sleeper.slept().is_empty());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_sweep_reclaims_orphaned_items() {
        let source = InMemorySource::new("jobs", 3);
        let (processor, calls) = ScriptedProcessor::new();

        let (harness, _) = Harness::start(
            FakeDial::reachable(),
            source.clone(),
            processor,
            config().with_claim_idle(Duration::from_secs(1)),
        );
        // A processed item proves the start-up sweep has run
        source.push("first");
        wait_until(|| source.acked_count() == 1).await;

        // Taken by a consumer that went away after the start-up sweep
        let started = tokio::time::Instant::now();
        source.push_unsettled("orphan");
        assert_eq!(source.in_flight_len(), 1);

        wait_until(|| source.acked_count() == 2).await;
        assert!(started.elapsed() >= Duration::from_millis(500));

        let summary = harness.stop().await.unwrap();
        assert_eq!(summary.processed, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_reconnect_backoff_uses_worker_policy() {
        let dial = FakeDial::unreachable();
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(150), 2);
        let (processor, _) = ScriptedProcessor::new();

        let (harness, sleeper) = Harness::start(
            dial.clone(),
            InMemorySource::new("jobs", 3),
            processor,
            config().with_reconnect(backoff),
        );
        assert!(harness.handle.await.unwrap().is_err());

        assert_eq!(dial.dials(), 3);
        assert_eq!(
            sleeper.slept(),
            vec![Duration::from_millis(100), Duration::from_millis(150)]
        );
    }
}
