//! Record delivery
//!
//! The transmitter owns a small dedicated tokio runtime so that host
//! request threads never wait on network I/O in async mode:
//!
//! ```text
//! send_async ──► bounded queue ──► batch loop ──► worker pool (Semaphore)
//!                                                   │
//!                                                   └─► Transport (retry + backoff)
//! ```
//!
//! With `batch_size <= 1` records skip the queue and go straight to the
//! worker pool. At most `max_queue_size` records are held at once, counting
//! queued, batched and in-flight ones; beyond that new records are dropped.
//! Failed deliveries are retried with capped exponential backoff and then
//! discarded.

mod batcher;
mod retry;
mod stats;
mod transport;

pub use stats::{StatsSnapshot, TransmitterStats};
pub use transport::{user_agent, HttpTransport, Transport, BATCH_PATH, COLLECT_PATH};

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::{Config, SharedConfig};
use crate::error::{contain, panic_message, PerfmonError, Result};
use crate::record::PerformanceRecord;
use batcher::Command;

const FLUSH_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Extra time a blocked `send_sync` caller allows beyond the retry budget
const SYNC_WAIT_SLACK: Duration = Duration::from_secs(1);

/// State shared between the public handle, the batch loop and workers
pub(crate) struct Shared {
    pub(crate) config: SharedConfig,
    transport: Arc<dyn Transport>,
    semaphore: Arc<Semaphore>,
    pub(crate) stats: TransmitterStats,
    pub(crate) cancel: CancellationToken,
}

impl Shared {
    /// Deliver one batch through the worker pool
    pub(crate) async fn deliver_batch(self: Arc<Self>, batch: Vec<PerformanceRecord>) {
        let count = batch.len();
        let Ok(_permit) = self.semaphore.clone().acquire_owned().await else {
            self.stats.discarded(count);
            return;
        };

        let config = self.config.snapshot();
        let result = guarded(retry::with_retry(&config.retry_config(), &self.cancel, "batch", || {
            self.transport.send_batch(&batch, &config)
        }))
        .await;

        match result {
            Ok(()) => self.stats.delivered(count),
            Err(e) => {
                tracing::error!(
                    batch_size = count,
                    error = %e.sanitized_message(),
                    "Batch delivery failed, discarding records"
                );
                self.stats.batch_failed(count);
            }
        }
    }

    /// Deliver one record; `pooled` deliveries wait for a worker permit
    async fn deliver_record(self: Arc<Self>, record: PerformanceRecord, pooled: bool) -> bool {
        let _permit = if pooled {
            match self.semaphore.clone().acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => {
                    self.stats.discarded(1);
                    return false;
                }
            }
        } else {
            None
        };

        let config = self.config.snapshot();
        let result = guarded(retry::with_retry(&config.retry_config(), &self.cancel, "record", || {
            self.transport.send_one(&record, &config)
        }))
        .await;

        match result {
            Ok(()) => {
                self.stats.delivered(1);
                true
            }
            Err(e) => {
                tracing::error!(
                    trace_id = %record.trace_id,
                    error = %e.sanitized_message(),
                    "Record delivery failed, discarding"
                );
                self.stats.record_failed();
                false
            }
        }
    }
}

/// Run a delivery, turning a panic inside the transport into an error so
/// the record is still accounted for
async fn guarded(delivery: impl Future<Output = Result<()>>) -> Result<()> {
    match AssertUnwindSafe(delivery).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(PerfmonError::Runtime(format!(
            "transport panicked: {}",
            panic_message(payload.as_ref())
        ))),
    }
}

/// Longest a `send_sync` caller waits: every attempt at full timeout,
/// every backoff sleep, plus slack
fn sync_wait_budget(config: &Config) -> Duration {
    let policy = config.retry_config();
    config
        .request_timeout
        .saturating_mul(policy.total_attempts())
        .saturating_add(policy.total_backoff())
        .saturating_add(SYNC_WAIT_SLACK)
}

/// Delivers performance records to the collection backend
pub struct Transmitter {
    shared: Arc<Shared>,
    handle: Handle,
    runtime: Mutex<Option<Runtime>>,
    queue: RwLock<Option<mpsc::Sender<Command>>>,
    closed: AtomicBool,
}

impl Transmitter {
    /// Create a transmitter delivering over HTTP
    pub fn new(config: SharedConfig) -> Result<Self> {
        let transport = HttpTransport::new(&config.snapshot())?;
        Self::with_transport(config, Arc::new(transport))
    }

    /// Create a transmitter with a custom transport
    pub fn with_transport(config: SharedConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let snapshot = config.snapshot();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(snapshot.max_workers)
            .thread_name("perfmon-sender")
            .enable_all()
            .build()
            .map_err(|e| PerfmonError::Runtime(format!("failed to start sender runtime: {}", e)))?;

        let (tx, rx) = mpsc::channel(snapshot.max_queue_size);
        let shared = Arc::new(Shared {
            config,
            transport,
            semaphore: Arc::new(Semaphore::new(snapshot.max_workers)),
            stats: TransmitterStats::default(),
            cancel: CancellationToken::new(),
        });

        runtime.spawn(batcher::run(rx, shared.clone()));

        tracing::debug!(
            max_workers = snapshot.max_workers,
            max_queue_size = snapshot.max_queue_size,
            batch_size = snapshot.batch_size,
            "Transmitter started"
        );

        Ok(Self {
            shared,
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            queue: RwLock::new(Some(tx)),
            closed: AtomicBool::new(false),
        })
    }

    /// Deliver one record now, blocking the caller until it succeeds or
    /// exhausts its retries. Never panics into the caller.
    pub fn send_sync(&self, record: &PerformanceRecord) -> bool {
        contain("send_sync", false, || {
            if self.is_closed() {
                tracing::warn!(trace_id = %record.trace_id, "Transmitter closed, dropping record");
                self.shared.stats.refused();
                return false;
            }

            self.shared.stats.accepted();
            let budget = sync_wait_budget(&self.shared.config.snapshot());
            let shared = self.shared.clone();
            let trace_id = record.trace_id.clone();
            let record = record.clone();
            let (tx, rx) = std::sync::mpsc::sync_channel(1);
            self.handle.spawn(async move {
                let delivered = shared.deliver_record(record, false).await;
                let _ = tx.send(delivered);
            });

            match rx.recv_timeout(budget) {
                Ok(delivered) => delivered,
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    // The delivery keeps running and settles the counters itself
                    tracing::warn!(
                        trace_id = %trace_id,
                        waited_ms = budget.as_millis() as u64,
                        "Synchronous delivery overran its budget, no longer waiting"
                    );
                    false
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => false,
            }
        })
    }

    /// Hand a record to the background pipeline without waiting.
    ///
    /// Returns false if the record was dropped (closed, or the backlog is full).
    pub fn send_async(&self, record: PerformanceRecord) -> bool {
        contain("send_async", false, || self.enqueue(record))
    }

    fn enqueue(&self, record: PerformanceRecord) -> bool {
        if self.is_closed() {
            tracing::warn!(trace_id = %record.trace_id, "Transmitter closed, dropping record");
            self.shared.stats.refused();
            return false;
        }

        let config = self.shared.config.snapshot();

        // Queued, batched and in-flight records all count against the bound
        if !self.shared.stats.try_accept(config.max_queue_size) {
            tracing::warn!(
                trace_id = %record.trace_id,
                max_queue_size = config.max_queue_size,
                "Delivery backlog full, dropping record"
            );
            self.shared.stats.refused();
            return false;
        }

        if config.batch_size <= 1 {
            self.handle
                .spawn(self.shared.clone().deliver_record(record, true));
            return true;
        }

        let queue = self.queue.read();
        let Some(queue) = queue.as_ref() else {
            self.shared.stats.rejected_after_accept();
            return false;
        };

        match queue.try_send(Command::Record(Box::new(record))) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.shared.stats.rejected_after_accept();
                tracing::warn!(
                    max_queue_size = config.max_queue_size,
                    "Record queue full, dropping record"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.shared.stats.rejected_after_accept();
                false
            }
        }
    }

    /// Dispatch buffered records and wait, up to `timeout`, until nothing
    /// is pending or in flight. Returns whether everything drained.
    pub fn flush(&self, timeout: Duration) -> bool {
        contain("flush", false, || self.drain(timeout))
    }

    fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut requested = false;

        loop {
            let pending = self.shared.stats.pending();
            if pending == 0 {
                return true;
            }
            if !requested {
                requested = self.request_flush();
            }
            if Instant::now() >= deadline {
                tracing::warn!(pending = pending, "Flush timed out with records still pending");
                return false;
            }
            std::thread::sleep(FLUSH_POLL_INTERVAL);
        }
    }

    fn request_flush(&self) -> bool {
        match self.queue.read().as_ref() {
            Some(queue) => queue.try_send(Command::Flush).is_ok(),
            None => true,
        }
    }

    /// Stop accepting records, flush with the configured shutdown timeout,
    /// then stop the background runtime. Idempotent.
    pub fn close(&self) {
        let timeout = self.shared.config.snapshot().shutdown_timeout;
        self.close_with_timeout(timeout);
    }

    /// [`close`](Self::close) with an explicit flush bound
    pub fn close_with_timeout(&self, timeout: Duration) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        contain("close", (), || {
            let drained = self.drain(timeout);
            self.shared.cancel.cancel();
            self.queue.write().take();
            if let Some(runtime) = self.runtime.lock().take() {
                runtime.shutdown_background();
            }

            let stats = self.stats();
            tracing::info!(
                drained = drained,
                sent = stats.sent,
                dropped = stats.dropped,
                failed_batches = stats.failed_batches,
                failed_records = stats.failed_records,
                "Transmitter closed"
            );
        });
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Current delivery counters
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }
}

impl Drop for Transmitter {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Transmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transmitter")
            .field("closed", &self.is_closed())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::record::tests::sample_record;
    use async_trait::async_trait;
    use perfmon_http::HttpError;

    /// Records what it is asked to deliver
    #[derive(Default)]
    struct RecordingTransport {
        singles: Mutex<Vec<String>>,
        batches: Mutex<Vec<Vec<String>>>,
        fail: bool,
        panic: bool,
        delay: Duration,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send_one(&self, record: &PerformanceRecord, _config: &Config) -> Result<()> {
            self.singles.lock().push(record.trace_id.clone());
            tokio::time::sleep(self.delay).await;
            if self.panic {
                panic!("transport bug");
            }
            if self.fail {
                return Err(HttpError::Status {
                    status: 503,
                    message: "unavailable".to_string(),
                }
                .into());
            }
            Ok(())
        }

        async fn send_batch(&self, records: &[PerformanceRecord], _config: &Config) -> Result<()> {
            self.batches
                .lock()
                .push(records.iter().map(|r| r.trace_id.clone()).collect());
            tokio::time::sleep(self.delay).await;
            if self.panic {
                panic!("transport bug");
            }
            if self.fail {
                return Err(HttpError::Status {
                    status: 503,
                    message: "unavailable".to_string(),
                }
                .into());
            }
            Ok(())
        }
    }

    fn config(batch_size: usize) -> Config {
        Config {
            batch_size,
            batch_timeout: Duration::from_secs(60),
            retry_times: 2,
            retry_delay: Duration::from_millis(1),
            max_retry_delay: Duration::from_millis(5),
            ..Config::new("pk_test", "http://collector.local")
        }
    }

    fn transmitter(config: Config, transport: Arc<RecordingTransport>) -> Transmitter {
        Transmitter::with_transport(SharedConfig::new(config), transport).unwrap()
    }

    #[test]
    fn test_send_sync_success() {
        let transport = Arc::new(RecordingTransport::default());
        let tx = transmitter(config(10), transport.clone());

        assert!(tx.send_sync(&sample_record("trace_sync")));
        assert_eq!(*transport.singles.lock(), vec!["trace_sync".to_string()]);
        assert_eq!(tx.stats().sent, 1);
        tx.close();
    }

    #[test]
    fn test_send_sync_retries_then_gives_up() {
        let transport = Arc::new(RecordingTransport {
            fail: true,
            ..Default::default()
        });
        let tx = transmitter(config(10), transport.clone());

        assert!(!tx.send_sync(&sample_record("trace_fail")));
        // retry_times = 2: one attempt plus two retries
        assert_eq!(transport.singles.lock().len(), 3);
        assert_eq!(tx.stats().dropped, 1);
        tx.close();
    }

    #[test]
    fn test_direct_dispatch_when_batching_disabled() {
        let transport = Arc::new(RecordingTransport::default());
        let tx = transmitter(config(1), transport.clone());

        assert!(tx.send_async(sample_record("trace_direct")));
        assert!(tx.flush(Duration::from_secs(5)));
        assert_eq!(*transport.singles.lock(), vec!["trace_direct".to_string()]);
        assert!(transport.batches.lock().is_empty());
        tx.close();
    }

    #[test]
    fn test_flush_dispatches_partial_batch() {
        let transport = Arc::new(RecordingTransport::default());
        let tx = transmitter(config(10), transport.clone());

        tx.send_async(sample_record("trace_a"));
        tx.send_async(sample_record("trace_b"));
        assert!(tx.flush(Duration::from_secs(5)));

        assert_eq!(
            *transport.batches.lock(),
            vec![vec!["trace_a".to_string(), "trace_b".to_string()]]
        );
        tx.close();
    }

    #[test]
    fn test_close_is_idempotent_and_rejects_new_records() {
        let transport = Arc::new(RecordingTransport::default());
        let tx = transmitter(config(10), transport.clone());

        tx.close();
        tx.close();
        assert!(tx.is_closed());
        assert!(!tx.send_async(sample_record("trace_late")));
        assert!(!tx.send_sync(&sample_record("trace_late")));
        assert_eq!(tx.stats().dropped, 2);
    }

    #[test]
    fn test_backlog_overflow_drops_without_blocking() {
        let transport = Arc::new(RecordingTransport {
            delay: Duration::from_millis(300),
            ..Default::default()
        });
        let tx = transmitter(
            Config {
                max_queue_size: 1,
                ..config(1)
            },
            transport,
        );

        let started = Instant::now();
        assert!(tx.send_async(sample_record("trace_first")));
        assert!(!tx.send_async(sample_record("trace_second")));
        assert!(started.elapsed() < Duration::from_millis(300));

        let stats = tx.stats();
        assert_eq!(stats.enqueued, 1);
        assert_eq!(stats.dropped, 1);

        assert!(tx.flush(Duration::from_secs(5)));
        assert_eq!(tx.stats().sent, 1);
        tx.close();
    }

    #[test]
    fn test_queue_accounting_under_pressure() {
        let transport = Arc::new(RecordingTransport::default());
        let tx = transmitter(
            Config {
                max_queue_size: 1,
                ..config(1_000)
            },
            transport,
        );

        let accepted = (0..200)
            .filter(|i| tx.send_async(sample_record(&format!("trace_{}", i))))
            .count();
        let stats = tx.stats();

        assert_eq!(stats.enqueued as usize, accepted);
        assert_eq!(stats.enqueued + stats.dropped, 200);
        tx.close_with_timeout(Duration::from_secs(5));
    }

    #[test]
    fn test_batch_backlog_is_bounded_while_backend_stalls() {
        let transport = Arc::new(RecordingTransport {
            delay: Duration::from_secs(30),
            ..Default::default()
        });
        let tx = transmitter(
            Config {
                max_queue_size: 4,
                max_workers: 1,
                ..config(2)
            },
            transport,
        );

        let accepted = (0..2_000)
            .filter(|i| tx.send_async(sample_record(&format!("trace_{}", i))))
            .count();
        let stats = tx.stats();

        assert!(accepted <= 4, "accepted {} records", accepted);
        assert!(stats.pending <= 4, "pending {}", stats.pending);
        assert_eq!(stats.enqueued + stats.dropped, 2_000);
        tx.close_with_timeout(Duration::from_millis(50));
    }

    #[test]
    fn test_failed_single_record_is_not_a_failed_batch() {
        let transport = Arc::new(RecordingTransport {
            fail: true,
            ..Default::default()
        });
        let tx = transmitter(config(1), transport);

        assert!(tx.send_async(sample_record("trace_lost")));
        assert!(tx.flush(Duration::from_secs(5)));

        let stats = tx.stats();
        assert_eq!(stats.failed_records, 1);
        assert_eq!(stats.failed_batches, 0);
        assert_eq!(stats.dropped, 1);
        tx.close();
    }

    #[test]
    fn test_failed_batch_counts_once() {
        let transport = Arc::new(RecordingTransport {
            fail: true,
            ..Default::default()
        });
        let tx = transmitter(config(3), transport);

        for i in 0..3 {
            tx.send_async(sample_record(&format!("trace_{}", i)));
        }
        assert!(tx.flush(Duration::from_secs(5)));

        let stats = tx.stats();
        assert_eq!(stats.failed_batches, 1);
        assert_eq!(stats.failed_records, 3);
        tx.close();
    }

    #[test]
    fn test_panicking_transport_is_accounted_for() {
        let transport = Arc::new(RecordingTransport {
            panic: true,
            ..Default::default()
        });
        let tx = transmitter(config(1), transport.clone());

        assert!(!tx.send_sync(&sample_record("trace_sync")));
        assert!(tx.send_async(sample_record("trace_async")));
        assert!(tx.flush(Duration::from_secs(5)));

        let stats = tx.stats();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.failed_records, 2);
        // A panic is not retried
        assert_eq!(transport.singles.lock().len(), 2);
        tx.close();
    }

    #[test]
    fn test_send_sync_stops_waiting_on_a_hung_transport() {
        let transport = Arc::new(RecordingTransport {
            delay: Duration::from_secs(30),
            ..Default::default()
        });
        let tx = transmitter(
            Config {
                retry_times: 0,
                request_timeout: Duration::from_millis(100),
                ..config(10)
            },
            transport,
        );

        let started = Instant::now();
        assert!(!tx.send_sync(&sample_record("trace_hung")));
        assert!(started.elapsed() < Duration::from_secs(5));
        tx.close_with_timeout(Duration::from_millis(50));
    }

    #[test]
    fn test_sync_wait_budget_covers_retries() {
        let config = Config {
            retry_times: 2,
            request_timeout: Duration::from_secs(2),
            retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(10),
            ..Config::new("pk_test", "http://collector.local")
        };
        // 3 attempts x 2s + (1s + 2s) backoff + slack
        assert_eq!(sync_wait_budget(&config), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_usable_inside_async_context() {
        let transport = Arc::new(RecordingTransport::default());
        let tx = transmitter(config(2), transport.clone());

        tx.send_async(sample_record("trace_1"));
        tx.send_async(sample_record("trace_2"));
        assert!(tx.flush(Duration::from_secs(5)));
        assert_eq!(transport.batches.lock().len(), 1);

        // Dropping inside a runtime must not panic
        drop(tx);
    }
}
