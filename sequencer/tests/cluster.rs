// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy_primitives::{Address, U256};
use app_core::Cursor;
use app_core::application::{Deposit, Method, WalletApp, Withdrawal};
use sequencer::delivery_lane::DeliveryLaneConfig;
use sequencer::executor::{Executor, ExecutorConfig};
use sequencer::node::{PublicationConfig, Sequencer, SequencerConfig};
use sequencer::ordering::{Mesh, NodeId, OrderingMode};
use sequencer::publisher::{
    DaClient, DaClientConfig, MemoryDa, Namespace, Publisher, RetryConfig,
};
use sequencer::replay::{ReplayConfig, Replayer};
use sequencer::storage::Storage;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const CONVERGENCE_TIMEOUT: Duration = Duration::from_secs(10);
const MEMBERS: [NodeId; 3] = [1, 2, 3];

fn sequencer_config() -> SequencerConfig {
    SequencerConfig {
        max_tx_bytes: 1024,
        resubmit_interval: Duration::from_millis(50),
        stop_timeout: Duration::from_secs(5),
        delivery: DeliveryLaneConfig {
            max_batch_open: Duration::from_millis(20),
            ..DeliveryLaneConfig::default()
        },
    }
}

fn single_leader() -> impl Fn() -> OrderingMode {
    || OrderingMode::SingleLeader {
        leader: 1,
        members: MEMBERS.to_vec(),
        sync_interval: Duration::from_millis(20),
    }
}

fn multi_leader() -> impl Fn() -> OrderingMode {
    || OrderingMode::MultiLeader {
        members: MEMBERS.to_vec(),
        round_interval: Duration::from_millis(10),
    }
}

fn open_node(dir: &Path, mesh: &Mesh, id: NodeId, mode: OrderingMode) -> Sequencer<WalletApp> {
    let storage = Storage::open(
        &dir.join(format!("node-{id}-sequencer.sqlite")).to_string_lossy(),
        "NORMAL",
    )
    .expect("open sequencer storage");
    let executor = Executor::open(
        &dir.join(format!("node-{id}-executor.sqlite")).to_string_lossy(),
        "FULL",
        WalletApp::default(),
        ExecutorConfig {
            snapshot_interval: 4,
        },
    )
    .expect("open executor");
    let (transport, inbox) = mesh.join(id);
    Sequencer::new(
        Arc::new(Mutex::new(storage)),
        Arc::new(executor),
        mode.build(Arc::new(transport), inbox),
        sequencer_config(),
    )
}

async fn start_cluster(
    dir: &TempDir,
    mesh: &Mesh,
    mode: impl Fn() -> OrderingMode,
) -> Vec<Sequencer<WalletApp>> {
    let mut nodes = Vec::new();
    for id in MEMBERS {
        let node = open_node(dir.path(), mesh, id, mode());
        node.start(&CancellationToken::new())
            .await
            .expect("start node");
        nodes.push(node);
    }
    nodes
}

async fn stop_all(nodes: &[Sequencer<WalletApp>]) {
    for node in nodes {
        tokio::time::timeout(Duration::from_secs(10), node.stop())
            .await
            .expect("stop timeout")
            .expect("stop node");
    }
}

async fn wait_processed(nodes: &[Sequencer<WalletApp>], processed: u64) {
    tokio::time::timeout(CONVERGENCE_TIMEOUT, async {
        while nodes
            .iter()
            .any(|node| node.executor().processed_inputs() < processed)
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("nodes did not converge in time");
}

fn account(seed: u8) -> Address {
    Address::from_slice(&[seed; 20])
}

fn deposit(seed: u8, amount: u64) -> Vec<u8> {
    Method::Deposit(Deposit {
        to: account(seed),
        amount: U256::from(amount),
    })
    .encode()
}

fn withdrawal(seed: u8, amount: u64) -> Vec<u8> {
    Method::Withdrawal(Withdrawal {
        from: account(seed),
        amount: U256::from(amount),
    })
    .encode()
}

fn balance(executor: &Executor<WalletApp>, seed: u8) -> (U256, Cursor) {
    let (bytes, cursor) = executor
        .query(account(seed).as_slice())
        .expect("query balance");
    (U256::from_be_slice(&bytes), cursor)
}

async fn writes_converge(mode: impl Fn() -> OrderingMode) {
    let dir = tempfile::Builder::new()
        .prefix("cluster-converge")
        .tempdir()
        .expect("create temp dir");
    let mesh = Mesh::new();
    let nodes = start_cluster(&dir, &mesh, mode).await;

    for round in 0..4_u8 {
        for (index, node) in nodes.iter().enumerate() {
            let seed = round * 3 + index as u8 + 1;
            node.write(deposit(seed, u64::from(seed)))
                .await
                .expect("write deposit");
        }
    }
    // An invalid input is ordered and consumed everywhere but never applied.
    nodes[1]
        .write(withdrawal(200, 1))
        .await
        .expect("write invalid withdrawal");

    wait_processed(&nodes, 13).await;
    for node in &nodes {
        assert_eq!(node.executor().cursor(), Cursor(12));
        for seed in 1..=12_u8 {
            assert_eq!(
                balance(node.executor(), seed),
                (U256::from(seed), Cursor(12))
            );
        }
    }
    assert_eq!(
        nodes[0].executor().head().expect("head").log_hash,
        nodes[2].executor().head().expect("head").log_hash
    );
    stop_all(&nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_leader_writes_converge_on_every_node() {
    writes_converge(single_leader()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn multi_leader_writes_converge_on_every_node() {
    writes_converge(multi_leader()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn conflicting_withdrawals_apply_exactly_once() {
    let dir = tempfile::Builder::new()
        .prefix("cluster-double-spend")
        .tempdir()
        .expect("create temp dir");
    let mesh = Mesh::new();
    let nodes = start_cluster(&dir, &mesh, multi_leader()).await;

    nodes[0].write(deposit(9, 10)).await.expect("fund account");
    wait_processed(&nodes, 1).await;

    // Either one fits the balance, both together do not.
    let (a, b) = tokio::join!(
        nodes[1].write(withdrawal(9, 10)),
        nodes[2].write(withdrawal(9, 7)),
    );
    a.expect("write A");
    b.expect("write B");

    wait_processed(&nodes, 3).await;
    let (reference, _) = balance(nodes[0].executor(), 9);
    assert!(reference == U256::ZERO || reference == U256::from(3_u64));
    for node in &nodes {
        assert_eq!(node.executor().cursor(), Cursor(2));
        assert_eq!(balance(node.executor(), 9), (reference, Cursor(2)));
    }
    stop_all(&nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restarted_node_keeps_every_acknowledged_write() {
    let dir = tempfile::Builder::new()
        .prefix("cluster-restart")
        .tempdir()
        .expect("create temp dir");
    let mesh = Mesh::new();
    let mode = || OrderingMode::SingleLeader {
        leader: 1,
        members: vec![1],
        sync_interval: Duration::from_millis(20),
    };

    let node = open_node(dir.path(), &mesh, 1, mode());
    node.start(&CancellationToken::new()).await.expect("start");
    for seed in 1..=6_u8 {
        node.write(deposit(seed, 1)).await.expect("write");
    }
    node.stop().await.expect("stop");
    assert_eq!(node.executor().cursor(), Cursor(6));
    drop(node);

    let node = open_node(dir.path(), &mesh, 1, mode());
    assert_eq!(node.executor().cursor(), Cursor(6));
    node.start(&CancellationToken::new()).await.expect("restart");
    // Same bytes as an earlier write: already ordered, not applied again.
    node.write(deposit(1, 1)).await.expect("duplicate write after restart");
    node.write(deposit(1, 2)).await.expect("write after restart");
    node.stop().await.expect("stop again");

    assert_eq!(node.executor().cursor(), Cursor(7));
    assert_eq!(balance(node.executor(), 1), (U256::from(3_u64), Cursor(7)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn published_batches_replay_to_the_same_state() {
    let dir = tempfile::Builder::new()
        .prefix("cluster-publish")
        .tempdir()
        .expect("create temp dir");
    let mesh = Mesh::new();
    let shutdown = CancellationToken::new();

    let da = Arc::new(MemoryDa::new([11_u8; 32]).expect("create memory DA"));
    let sealer = Arc::clone(&da).spawn_sealer(Duration::from_millis(10), shutdown.clone());
    let publisher: Arc<dyn Publisher> = Arc::new(DaClient::new(
        Arc::clone(&da),
        DaClientConfig {
            retry: RetryConfig::fast(),
            ..DaClientConfig::new(da.attester())
        },
    ));
    let namespace = Namespace::new("cluster");

    let node = open_node(
        dir.path(),
        &mesh,
        1,
        OrderingMode::SingleLeader {
            leader: 1,
            members: vec![1],
            sync_interval: Duration::from_millis(20),
        },
    )
    .with_publisher(
        Arc::clone(&publisher),
        PublicationConfig {
            poll_interval: Duration::from_millis(10),
            ..PublicationConfig::new(namespace.clone())
        },
    );
    node.start(&CancellationToken::new()).await.expect("start");
    for seed in 1..=5_u8 {
        node.write(deposit(seed, u64::from(seed) * 10))
            .await
            .expect("write deposit");
    }
    node.write(withdrawal(3, 5)).await.expect("write withdrawal");
    node.write(withdrawal(4, 1_000)).await.expect("write overdraft");

    let replay_executor = Arc::new(
        Executor::open(
            &dir.path().join("replay-executor.sqlite").to_string_lossy(),
            "FULL",
            WalletApp::default(),
            ExecutorConfig::default(),
        )
        .expect("open replay executor"),
    );
    // The observer verifies with its own client, trusting only the attester.
    let reader = Arc::new(DaClient::new(
        Arc::clone(&da),
        DaClientConfig::new(da.attester()),
    ));
    let mut replayer = Replayer::new(
        reader,
        namespace,
        Arc::clone(&replay_executor),
        ReplayConfig::default(),
    );
    let cancel = CancellationToken::new();
    tokio::time::timeout(CONVERGENCE_TIMEOUT, async {
        while replay_executor.processed_inputs() < 7 {
            replayer.sync(&cancel).await.expect("replay sync");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("replay did not catch up in time");

    assert_eq!(replay_executor.cursor(), node.executor().cursor());
    assert_eq!(replay_executor.cursor(), Cursor(6));
    for seed in 1..=5_u8 {
        assert_eq!(
            balance(&replay_executor, seed),
            balance(node.executor(), seed)
        );
    }
    assert_eq!(
        replay_executor.head().expect("head").log_hash,
        node.executor().head().expect("head").log_hash
    );

    node.stop().await.expect("stop");
    shutdown.cancel();
    sealer.await.expect("join sealer");
}
