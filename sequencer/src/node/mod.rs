// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! The sequencer node: durable ingress, ordering, delivery and publication
//! behind one lifecycle.

mod publication;

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use alloy_primitives::B256;
use app_core::Transaction;
use app_core::application::Application;
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use publication::{PublicationConfig, PublicationError, PublicationLane};

use crate::delivery_lane::{DeliveryLane, DeliveryLaneConfig, DeliveryLaneError, DeliveryLaneStop};
use crate::executor::Executor;
use crate::lifecycle::{Lifecycle, LifecycleError, LifecycleState, TaskFailure};
use crate::ordering::{OrderedLog, OrderingError, OrderingProtocol, lock_storage};
use crate::publisher::Publisher;
use crate::storage::Storage;

const RESUBMIT_PAGE_SIZE: usize = 512;

#[derive(Debug, Clone, Copy)]
pub struct SequencerConfig {
    pub max_tx_bytes: usize,
    /// Accepted writes not yet ordered are handed to the protocol again at
    /// this pace.
    pub resubmit_interval: Duration,
    pub stop_timeout: Duration,
    pub delivery: DeliveryLaneConfig,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            max_tx_bytes: 64 * 1024,
            resubmit_interval: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(10),
            delivery: DeliveryLaneConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SequencerError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error("empty transaction")]
    EmptyTransaction,
    #[error("transaction too large: max {max} bytes, got {actual} bytes")]
    TransactionTooLarge { max: usize, actual: usize },
    #[error("sequencer storage failed")]
    Storage {
        #[source]
        source: rusqlite::Error,
    },
    #[error("ordering protocol failed")]
    Ordering {
        #[source]
        source: OrderingError,
    },
    #[error("start cancelled")]
    Cancelled,
    #[error("stop did not finish within {timeout:?}")]
    StopTimeout { timeout: Duration },
    #[error("delivery lane failed")]
    DeliveryLane {
        #[source]
        source: DeliveryLaneError,
    },
    #[error("{task} task panicked")]
    TaskPanicked { task: &'static str },
    #[error("{task} failed, sequencer must be restarted")]
    TaskFailed { task: &'static str },
}

impl From<rusqlite::Error> for SequencerError {
    fn from(source: rusqlite::Error) -> Self {
        Self::Storage { source }
    }
}

impl From<OrderingError> for SequencerError {
    fn from(source: OrderingError) -> Self {
        Self::Ordering { source }
    }
}

struct Tasks {
    ordering_left: bool,
    delivery: Option<JoinHandle<DeliveryLaneError>>,
    delivery_stop: DeliveryLaneStop,
    resubmit_cancel: CancellationToken,
    resubmitter: Option<JoinHandle<()>>,
    publication_cancel: CancellationToken,
    publication: Option<JoinHandle<Result<(), PublicationError>>>,
}

/// A sequencer node.
///
/// `write` durably accepts a transaction and hands it to the ordering
/// protocol; the delivery lane feeds the agreed order to the executor and
/// cuts it into batches; the publication lane (when configured) pushes those
/// batches to the DA layer.
pub struct Sequencer<A: Application + 'static> {
    storage: Arc<Mutex<Storage>>,
    executor: Arc<Executor<A>>,
    ordering: Arc<dyn OrderingProtocol>,
    publication: Option<(Arc<dyn Publisher>, PublicationConfig)>,
    lifecycle: Lifecycle,
    failure: TaskFailure,
    config: SequencerConfig,
    tasks: tokio::sync::Mutex<Option<Tasks>>,
}

impl<A: Application + 'static> Sequencer<A> {
    pub fn new(
        storage: Arc<Mutex<Storage>>,
        executor: Arc<Executor<A>>,
        ordering: Arc<dyn OrderingProtocol>,
        config: SequencerConfig,
    ) -> Self {
        Self {
            storage,
            executor,
            ordering,
            publication: None,
            lifecycle: Lifecycle::new(),
            failure: TaskFailure::default(),
            config,
            tasks: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>, config: PublicationConfig) -> Self {
        self.publication = Some((publisher, config));
        self
    }

    pub fn executor(&self) -> &Arc<Executor<A>> {
        &self.executor
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// The background task whose unrequested exit stopped this run from
    /// making progress. Cleared by the next `start`.
    pub fn failed_task(&self) -> Option<&'static str> {
        self.failure.get()
    }

    pub async fn start(&self, cancel: &CancellationToken) -> Result<(), SequencerError> {
        self.lifecycle.begin_start()?;
        match self.spawn_tasks(cancel).await {
            Ok(tasks) => {
                *self.tasks.lock().await = Some(tasks);
                self.lifecycle.finish_start()?;
                info!(
                    cursor = self.executor.cursor().get(),
                    processed_inputs = self.executor.processed_inputs(),
                    "sequencer running"
                );
                Ok(())
            }
            Err(err) => {
                self.lifecycle.abort_start()?;
                warn!(error = %err, "sequencer start failed");
                Err(err)
            }
        }
    }

    async fn spawn_tasks(&self, cancel: &CancellationToken) -> Result<Tasks, SequencerError> {
        if cancel.is_cancelled() {
            return Err(SequencerError::Cancelled);
        }
        self.ordering
            .start(OrderedLog::new(Arc::clone(&self.storage)))
            .await?;
        if cancel.is_cancelled() {
            if let Err(err) = self.ordering.stop().await {
                warn!(error = %err, "cannot leave ordering after cancelled start");
            }
            return Err(SequencerError::Cancelled);
        }

        self.failure.clear();
        let (delivery, delivery_stop) = DeliveryLane::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.executor),
            self.config.delivery,
        )
        .spawn(self.failure.clone());

        let resubmit_cancel = CancellationToken::new();
        let resubmitter = tokio::spawn(resubmit_accepted(
            Arc::clone(&self.storage),
            Arc::clone(&self.ordering),
            self.config.resubmit_interval,
            resubmit_cancel.clone(),
        ));

        let publication_cancel = CancellationToken::new();
        let publication = self.publication.as_ref().map(|(publisher, config)| {
            PublicationLane::new(Arc::clone(&self.storage), Arc::clone(publisher), config.clone())
                .spawn(publication_cancel.clone(), self.failure.clone())
        });

        Ok(Tasks {
            ordering_left: false,
            delivery: Some(delivery),
            delivery_stop,
            resubmit_cancel,
            resubmitter: Some(resubmitter),
            publication_cancel,
            publication,
        })
    }

    /// Accepts `tx` durably and hands it to the ordering protocol. Returns the
    /// transaction hash.
    pub async fn write(&self, tx: Vec<u8>) -> Result<B256, SequencerError> {
        self.lifecycle.ensure_running()?;
        if let Some(task) = self.failure.get() {
            return Err(SequencerError::TaskFailed { task });
        }
        if tx.is_empty() {
            return Err(SequencerError::EmptyTransaction);
        }
        if tx.len() > self.config.max_tx_bytes {
            return Err(SequencerError::TransactionTooLarge {
                max: self.config.max_tx_bytes,
                actual: tx.len(),
            });
        }

        let tx = Transaction::new(tx);
        let hash = tx.hash();
        let fresh = lock_storage(&self.storage).accept_tx(&tx)?;
        if !fresh {
            debug!(tx_hash = %hash, "transaction already accepted");
            return Ok(hash);
        }
        // From here on the resubmitter owns delivery to the protocol.
        if let Err(err) = self.ordering.submit(tx).await {
            warn!(tx_hash = %hash, error = %err, "cannot hand transaction to ordering, will resubmit");
        }
        Ok(hash)
    }

    /// Drains accepted writes into the executor and stops every task. When
    /// that takes longer than `stop_timeout` the node halts instead: delivery
    /// stops after the entry in flight and the rest is left for the next run.
    pub async fn stop(&self) -> Result<(), SequencerError> {
        self.lifecycle.begin_stop()?;
        let result = {
            let mut guard = self.tasks.lock().await;
            let result = match guard.as_mut() {
                None => Ok(()),
                Some(tasks) => {
                    let timeout = self.config.stop_timeout;
                    let graceful = tokio::time::timeout(timeout, self.shutdown(tasks)).await;
                    match graceful {
                        Ok(result) => result,
                        Err(_) => {
                            warn!(?timeout, "graceful stop timed out, halting");
                            self.halt(tasks).await;
                            Err(SequencerError::StopTimeout { timeout })
                        }
                    }
                }
            };
            *guard = None;
            result
        };
        self.lifecycle.finish_stop()?;
        match &result {
            Ok(()) => info!(
                cursor = self.executor.cursor().get(),
                processed_inputs = self.executor.processed_inputs(),
                "sequencer stopped"
            ),
            Err(err) => error!(error = %err, "sequencer stopped with error"),
        }
        result
    }

    /// Every step leaves `tasks` accurate, so a timed-out shutdown can be
    /// finished by [`Self::halt`].
    async fn shutdown(&self, tasks: &mut Tasks) -> Result<(), SequencerError> {
        tasks.resubmit_cancel.cancel();
        let resubmitter_result = match join_task(&mut tasks.resubmitter).await {
            Some(Err(_)) => Err(SequencerError::TaskPanicked { task: "resubmitter" }),
            _ => Ok(()),
        };

        let ordering_result = self.leave_ordering(tasks).await;

        tasks.delivery_stop.request_shutdown();
        let delivery_result = match join_task(&mut tasks.delivery).await {
            None => Ok(()),
            Some(Ok(source)) if source.is_requested_stop() => Ok(()),
            Some(Ok(source)) => Err(SequencerError::DeliveryLane { source }),
            Some(Err(_)) => Err(SequencerError::TaskPanicked {
                task: "delivery lane",
            }),
        };

        tasks.publication_cancel.cancel();
        match join_task(&mut tasks.publication).await {
            Some(Ok(Err(err))) => warn!(error = %err, "publication lane had failed"),
            Some(Err(_)) => warn!("publication lane panicked"),
            _ => {}
        }

        resubmitter_result?;
        ordering_result?;
        delivery_result
    }

    /// Returns once no task of this run can reach the executor or the
    /// ordered log.
    async fn halt(&self, tasks: &mut Tasks) {
        tasks.resubmit_cancel.cancel();
        tasks.publication_cancel.cancel();
        if let Some(handle) = &tasks.resubmitter {
            handle.abort();
        }
        if let Some(handle) = &tasks.publication {
            handle.abort();
        }
        join_task(&mut tasks.resubmitter).await;
        join_task(&mut tasks.publication).await;

        if let Err(err) = self.leave_ordering(tasks).await {
            warn!(error = %err, "cannot leave ordering while halting");
        }

        tasks.delivery_stop.request_halt();
        if let Some(Err(_)) = join_task(&mut tasks.delivery).await {
            warn!("delivery lane panicked");
        }
        info!(
            processed_inputs = self.executor.processed_inputs(),
            "sequencer halted"
        );
    }

    async fn leave_ordering(&self, tasks: &mut Tasks) -> Result<(), OrderingError> {
        if tasks.ordering_left {
            return Ok(());
        }
        let result = self.ordering.stop().await;
        tasks.ordering_left = true;
        result
    }
}

/// Joins the task still registered in `slot`. Dropping the returned future
/// before it completes leaves the task registered.
async fn join_task<T>(slot: &mut Option<JoinHandle<T>>) -> Option<Result<T, JoinError>> {
    let handle = slot.as_mut()?;
    let joined = handle.await;
    *slot = None;
    Some(joined)
}

async fn resubmit_accepted(
    storage: Arc<Mutex<Storage>>,
    ordering: Arc<dyn OrderingProtocol>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Leftovers from a previous run are due right away.
    let mut min_age = Duration::ZERO;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let cutoff = SystemTime::now()
            .checked_sub(min_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        min_age = interval;

        let pending = lock_storage(&storage).load_unordered_accepted(cutoff, RESUBMIT_PAGE_SIZE);
        let pending = match pending {
            Ok(pending) => pending,
            Err(err) => {
                warn!(error = %err, "cannot load unordered transactions");
                continue;
            }
        };
        if pending.is_empty() {
            continue;
        }
        debug!(count = pending.len(), "resubmitting unordered transactions");
        for tx in pending {
            if let Err(err) = ordering.submit(tx).await {
                warn!(error = %err, "resubmission to ordering failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Sequencer, SequencerConfig, SequencerError};
    use crate::delivery_lane::DeliveryLaneConfig;
    use crate::executor::{Executor, ExecutorConfig};
    use crate::lifecycle::{LifecycleError, LifecycleState};
    use crate::ordering::{Mesh, OrderingMode};
    use crate::storage::Storage;
    use app_core::application::{Deposit, Method, WalletApp};
    use app_core::{Cursor, Transaction};
    use alloy_primitives::{Address, U256};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn config() -> SequencerConfig {
        SequencerConfig {
            max_tx_bytes: 256,
            resubmit_interval: Duration::from_millis(20),
            stop_timeout: Duration::from_secs(5),
            delivery: DeliveryLaneConfig {
                max_batch_open: Duration::from_millis(20),
                ..DeliveryLaneConfig::default()
            },
        }
    }

    fn single_node(dir: &TempDir, mesh: &Mesh) -> Sequencer<WalletApp> {
        single_node_with(dir, mesh, config())
    }

    fn single_node_with(dir: &TempDir, mesh: &Mesh, config: SequencerConfig) -> Sequencer<WalletApp> {
        let storage = Storage::open(&dir.path().join("seq.sqlite").to_string_lossy(), "NORMAL")
            .expect("open storage");
        let executor = Executor::open(
            &dir.path().join("exec.sqlite").to_string_lossy(),
            "FULL",
            WalletApp::default(),
            ExecutorConfig::default(),
        )
        .expect("open executor");
        let (transport, inbox) = mesh.join(1);
        let ordering = OrderingMode::SingleLeader {
            leader: 1,
            members: vec![1],
            sync_interval: Duration::from_millis(20),
        }
        .build(Arc::new(transport), inbox);
        Sequencer::new(
            Arc::new(Mutex::new(storage)),
            Arc::new(executor),
            ordering,
            config,
        )
    }

    fn deposit(seed: u8) -> Vec<u8> {
        deposit_of(seed, 1)
    }

    fn deposit_of(seed: u8, amount: u64) -> Vec<u8> {
        Method::Deposit(Deposit {
            to: Address::from_slice(&[seed; 20]),
            amount: U256::from(amount),
        })
        .encode()
    }

    async fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
        let started = tokio::time::Instant::now();
        while started.elapsed() < timeout {
            if predicate() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        predicate()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn write_requires_running_and_validates_size() {
        let dir = tempfile::Builder::new()
            .prefix("sequencer-node")
            .tempdir()
            .expect("create temp dir");
        let mesh = Mesh::new();
        let node = single_node(&dir, &mesh);

        assert!(matches!(
            node.write(deposit(1)).await,
            Err(SequencerError::Lifecycle(LifecycleError::NotRunning(LifecycleState::Stopped)))
        ));

        node.start(&CancellationToken::new()).await.expect("start");
        assert_eq!(node.state(), LifecycleState::Running);
        assert!(matches!(
            node.write(Vec::new()).await,
            Err(SequencerError::EmptyTransaction)
        ));
        assert!(matches!(
            node.write(vec![0; 257]).await,
            Err(SequencerError::TransactionTooLarge { max: 256, actual: 257 })
        ));
        assert!(matches!(
            node.start(&CancellationToken::new()).await,
            Err(SequencerError::Lifecycle(_))
        ));
        node.stop().await.expect("stop");
        assert_eq!(node.state(), LifecycleState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_drains_every_accepted_write_into_the_executor() {
        let dir = tempfile::Builder::new()
            .prefix("sequencer-node")
            .tempdir()
            .expect("create temp dir");
        let mesh = Mesh::new();
        let node = single_node(&dir, &mesh);
        node.start(&CancellationToken::new()).await.expect("start");

        for seed in 1..=20_u8 {
            node.write(deposit(seed)).await.expect("write");
        }
        node.write(deposit(1)).await.expect("duplicate write is accepted");
        tokio::time::timeout(Duration::from_secs(5), node.stop())
            .await
            .expect("stop timeout")
            .expect("stop");

        assert_eq!(node.executor().cursor(), Cursor(20));
        assert_eq!(node.executor().processed_inputs(), 20);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelled_start_leaves_node_stopped() {
        let dir = tempfile::Builder::new()
            .prefix("sequencer-node")
            .tempdir()
            .expect("create temp dir");
        let mesh = Mesh::new();
        let node = single_node(&dir, &mesh);
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(matches!(
            node.start(&cancel).await,
            Err(SequencerError::Cancelled)
        ));
        assert_eq!(node.state(), LifecycleState::Stopped);
        node.start(&CancellationToken::new())
            .await
            .expect("start after cancelled attempt");
        node.stop().await.expect("stop");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timed_out_stop_halts_delivery_before_the_next_start() {
        const ORDERED: u64 = 3_000;
        let dir = tempfile::Builder::new()
            .prefix("sequencer-halt")
            .tempdir()
            .expect("create temp dir");
        {
            let mut storage =
                Storage::open(&dir.path().join("seq.sqlite").to_string_lossy(), "NORMAL")
                    .expect("open storage");
            for amount in 1..=ORDERED {
                storage
                    .append_ordered(&Transaction::new(deposit_of(7, amount)))
                    .expect("append ordered")
                    .expect("fresh transaction");
            }
        }
        let mesh = Mesh::new();
        let node = single_node_with(
            &dir,
            &mesh,
            SequencerConfig {
                stop_timeout: Duration::from_millis(20),
                ..config()
            },
        );

        node.start(&CancellationToken::new()).await.expect("start");
        match node.stop().await {
            Ok(()) | Err(SequencerError::StopTimeout { .. }) => {}
            Err(other) => panic!("unexpected stop error: {other}"),
        }
        assert_eq!(node.state(), LifecycleState::Stopped);
        let halted_at = node.executor().processed_inputs();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            node.executor().processed_inputs(),
            halted_at,
            "delivery must not outlive stop"
        );

        node.start(&CancellationToken::new()).await.expect("restart");
        let executor = Arc::clone(node.executor());
        assert!(
            wait_until(Duration::from_secs(60), || executor.processed_inputs() >= ORDERED).await,
            "restart should deliver the rest of the ordered log"
        );
        match node.stop().await {
            Ok(()) | Err(SequencerError::StopTimeout { .. }) => {}
            Err(other) => panic!("unexpected stop error: {other}"),
        }

        assert_eq!(node.executor().processed_inputs(), ORDERED);
        assert_eq!(node.executor().cursor(), Cursor(ORDERED));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn executor_storage_failure_stops_accepting_writes() {
        let dir = tempfile::Builder::new()
            .prefix("sequencer-failure")
            .tempdir()
            .expect("create temp dir");
        let mesh = Mesh::new();
        let node = single_node(&dir, &mesh);
        node.start(&CancellationToken::new()).await.expect("start");

        node.write(deposit(1)).await.expect("write");
        let executor = Arc::clone(node.executor());
        assert!(
            wait_until(Duration::from_secs(5), || executor.processed_inputs() == 1).await,
            "first write should be executed"
        );
        assert_eq!(node.failed_task(), None);

        // Another writer moves the persisted head, so the next commit fails.
        {
            let conn = rusqlite::Connection::open(dir.path().join("exec.sqlite"))
                .expect("raw connection");
            conn.execute(
                "UPDATE executor_meta SET processed_inputs = processed_inputs + 7",
                [],
            )
            .expect("move head");
        }
        node.write(deposit(2)).await.expect("write before the failure");
        assert!(
            wait_until(Duration::from_secs(5), || node.failed_task().is_some()).await,
            "delivery failure should be recorded"
        );

        assert_eq!(node.failed_task(), Some("delivery lane"));
        assert!(matches!(
            node.write(deposit(3)).await,
            Err(SequencerError::TaskFailed {
                task: "delivery lane"
            })
        ));
        assert_eq!(executor.processed_inputs(), 1);
        assert!(matches!(
            node.stop().await,
            Err(SequencerError::DeliveryLane { .. })
        ));
        assert_eq!(node.state(), LifecycleState::Stopped);
    }
}
