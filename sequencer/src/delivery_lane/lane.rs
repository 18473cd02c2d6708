// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime};

use app_core::OrderedTx;
use app_core::application::Application;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::DeliveryLaneError;
use super::profiling::DeliveryLaneMetrics;
use crate::executor::Executor;
use crate::lifecycle::TaskFailure;
use crate::ordering::lock_storage;
use crate::storage::{BatchHead, Storage};

#[derive(Debug, Clone, Copy)]
pub struct DeliveryLaneConfig {
    pub page_size: usize,
    pub max_batch_txs: u64,
    pub max_batch_bytes: u64,
    pub max_batch_open: Duration,
    pub idle_poll_interval: Duration,
    pub metrics_enabled: bool,
    pub metrics_log_interval: Duration,
}

impl Default for DeliveryLaneConfig {
    fn default() -> Self {
        Self {
            page_size: 256,
            max_batch_txs: 1_024,
            max_batch_bytes: 128 * 1024,
            max_batch_open: Duration::from_secs(2),
            idle_poll_interval: Duration::from_millis(2),
            metrics_enabled: false,
            metrics_log_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeliveryLaneStop {
    shutdown: Arc<AtomicBool>,
    halt: Arc<AtomicBool>,
}

impl DeliveryLaneStop {
    /// The lane drains the ordered log and closes the open batch before it
    /// exits.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// The lane exits after the entry it is executing, leaving the rest of
    /// the ordered log and the open batch for the next run.
    pub fn request_halt(&self) {
        self.halt.store(true, Ordering::Relaxed);
    }

    fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    fn is_halt_requested(&self) -> bool {
        self.halt.load(Ordering::Relaxed)
    }
}

/// Single caller of [`Executor::execute`]: feeds the ordered log to the
/// executor in order and cuts the delivered prefix into batches.
pub struct DeliveryLane<A: Application + 'static> {
    storage: Arc<Mutex<Storage>>,
    executor: Arc<Executor<A>>,
    stop: DeliveryLaneStop,
    config: DeliveryLaneConfig,
    metrics: DeliveryLaneMetrics,
}

impl<A: Application + 'static> DeliveryLane<A> {
    pub fn new(
        storage: Arc<Mutex<Storage>>,
        executor: Arc<Executor<A>>,
        config: DeliveryLaneConfig,
    ) -> Self {
        Self {
            storage,
            executor,
            stop: DeliveryLaneStop::default(),
            metrics: DeliveryLaneMetrics::new(config.metrics_enabled, config.metrics_log_interval),
            config,
        }
    }

    /// Runs the lane on the blocking pool. An exit that was not requested
    /// through the returned [`DeliveryLaneStop`] is recorded in `failure`.
    pub fn spawn(self, failure: TaskFailure) -> (JoinHandle<DeliveryLaneError>, DeliveryLaneStop) {
        let stop = self.stop.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let mut lane = self;
            let result = lane.run_forever();
            lane.metrics.log_final();
            let err = match result {
                Err(err) => err,
                Ok(()) => unreachable!("delivery lane run loop is expected to be non-terminating"),
            };
            if !err.is_requested_stop() {
                error!(error = %err, "delivery lane failed");
                failure.record("delivery lane");
            }
            err
        });
        (handle, stop)
    }

    fn run_forever(&mut self) -> Result<(), DeliveryLaneError> {
        // Resuming from the executor's own counter makes redelivery impossible.
        let mut next_seq = self.executor.processed_inputs();
        let mut head = lock_storage(&self.storage)
            .load_open_batch(next_seq)
            .map_err(|source| DeliveryLaneError::LoadOpenBatch { source })?;
        info!(
            next_seq,
            open_batch_first_seq = head.first_seq,
            open_batch_txs = head.tx_count,
            "delivery lane started"
        );

        let mut page = Vec::with_capacity(self.config.page_size.max(1));
        loop {
            if self.stop.is_halt_requested() {
                info!(next_seq, "delivery lane halted");
                return Err(DeliveryLaneError::Halted);
            }
            // Sampled before reading: an empty page after shutdown means fully drained.
            let shutting_down = self.stop.is_shutdown_requested();
            self.metrics.on_loop_start();

            let delivered = self.deliver_page(&mut next_seq, &mut head, &mut page)?;
            if self.stop.is_halt_requested() {
                continue;
            }
            if head.should_close_by_age(&self.config) {
                self.close_batch(&mut head)?;
            }

            if shutting_down && delivered == 0 {
                if !head.is_empty() {
                    self.close_batch(&mut head)?;
                }
                info!(next_seq, "delivery lane drained");
                return Err(DeliveryLaneError::ShutdownRequested);
            }

            if delivered == 0 {
                let started_at = self.metrics.phase_started_at();
                thread::sleep(self.config.idle_poll_interval);
                self.metrics.on_idle_sleep_end(started_at);
            }
            self.metrics.maybe_log_window();
        }
    }

    fn deliver_page(
        &mut self,
        next_seq: &mut u64,
        head: &mut BatchHead,
        page: &mut Vec<OrderedTx>,
    ) -> Result<usize, DeliveryLaneError> {
        page.clear();
        let started_at = self.metrics.phase_started_at();
        lock_storage(&self.storage)
            .fill_ordered_txs(*next_seq, self.config.page_size.max(1), page)
            .map_err(|source| DeliveryLaneError::LoadOrdered { source })?;
        self.metrics.on_load_end(started_at);

        let mut delivered = 0;
        for entry in page.iter() {
            if self.stop.is_halt_requested() {
                break;
            }
            assert_eq!(entry.seq, *next_seq, "ordered log delivered out of order");
            let started_at = self.metrics.phase_started_at();
            let before = self.executor.cursor();
            let after = self
                .executor
                .execute(entry.seq, &entry.tx)
                .map_err(|source| DeliveryLaneError::Execute {
                    seq: entry.seq,
                    source,
                })?;
            self.metrics.on_execute_end(started_at, after > before);

            *next_seq += 1;
            delivered += 1;
            head.record_delivered(entry.tx.len());
            if head.should_close_by_size(&self.config) {
                self.close_batch(head)?;
            }
        }
        Ok(delivered)
    }

    fn close_batch(&mut self, head: &mut BatchHead) -> Result<(), DeliveryLaneError> {
        let started_at = self.metrics.phase_started_at();
        let (first_seq, end_seq) = (head.first_seq, head.end_seq());
        lock_storage(&self.storage)
            .close_batch(head)
            .map_err(|source| DeliveryLaneError::CloseBatch { source })?;
        self.metrics.on_close_end(started_at);
        debug!(first_seq, end_seq, "batch closed");
        Ok(())
    }
}

impl BatchHead {
    fn should_close_by_size(&self, config: &DeliveryLaneConfig) -> bool {
        !self.is_empty()
            && (self.tx_count >= config.max_batch_txs || self.byte_count >= config.max_batch_bytes)
    }

    fn should_close_by_age(&self, config: &DeliveryLaneConfig) -> bool {
        let age = SystemTime::now()
            .duration_since(self.created_at)
            .unwrap_or_default();
        !self.is_empty() && age >= config.max_batch_open
    }
}
