// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::sync::{Arc, Mutex};
use std::time::Duration;

use app_core::application::WalletApp;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use sequencer::api::{AppState, router};
use sequencer::delivery_lane::DeliveryLaneConfig;
use sequencer::executor::{Executor, ExecutorConfig};
use sequencer::node::{PublicationConfig, Sequencer, SequencerConfig};
use sequencer::ordering::{Mesh, NodeId, OrderingMode};
use sequencer::publisher::{DaClient, DaClientConfig, MemoryDa, Namespace};
use sequencer::storage::Storage;

const DEFAULT_HTTP_ADDR: &str = "127.0.0.1:3000";
const DEFAULT_DB_PATH: &str = "sequencer.db";
const DEFAULT_EXECUTOR_DB_PATH: &str = "executor.db";
const DEFAULT_SQLITE_SYNCHRONOUS: &str = "NORMAL";
const DEFAULT_EXECUTOR_SQLITE_SYNCHRONOUS: &str = "FULL";
const DEFAULT_MAX_BODY_BYTES: usize = 128 * 1024;
const DEFAULT_MAX_TX_BYTES: usize = 64 * 1024;
const DEFAULT_RESUBMIT_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MAX_BATCH_TXS: u64 = 1_024;
const DEFAULT_MAX_BATCH_BYTES: u64 = 128 * 1024;
const DEFAULT_MAX_BATCH_OPEN_DURATION: Duration = Duration::from_secs(2);
const DEFAULT_DELIVERY_LANE_IDLE_POLL_INTERVAL: Duration = Duration::from_millis(2);
const DEFAULT_SNAPSHOT_INTERVAL: u64 = 1_000;
const DEFAULT_NODE_ID: NodeId = 1;
const DEFAULT_ORDERING: &str = "single-leader";
const DEFAULT_ORDERING_INTERVAL: Duration = Duration::from_millis(50);
const DEFAULT_DA_NAMESPACE: &str = "rollup";
const DEFAULT_DA_SEAL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_DA_ATTESTER_KEY: &str =
    "0x0707070707070707070707070707070707070707070707070707070707070707";
const DEFAULT_PUBLISH_POLL_INTERVAL: Duration = Duration::from_millis(200);
const DEFAULT_PUBLISH_RESUBMIT_AFTER: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;

    let storage = Storage::open(&config.db_path, &config.sqlite_synchronous)?;
    let executor = Executor::open(
        &config.executor_db_path,
        &config.executor_sqlite_synchronous,
        WalletApp::default(),
        ExecutorConfig {
            snapshot_interval: config.snapshot_interval,
        },
    )?;

    // Single-process deployment: this node is the only mesh member.
    let mesh = Mesh::new();
    let (transport, inbox) = mesh.join(config.node_id);
    let ordering = config.ordering_mode()?.build(Arc::new(transport), inbox);

    let shutdown = CancellationToken::new();
    let da = Arc::new(MemoryDa::new(config.da_attester_key)?);
    let sealer = Arc::clone(&da).spawn_sealer(config.da_seal_interval, shutdown.clone());
    let publisher = DaClient::new(Arc::clone(&da), DaClientConfig::new(da.attester()));
    tracing::info!(attester = %da.attester(), namespace = %config.da_namespace, "memory DA ready");

    let sequencer = Arc::new(
        Sequencer::new(
            Arc::new(Mutex::new(storage)),
            Arc::new(executor),
            ordering,
            config.sequencer_config(),
        )
        .with_publisher(
            Arc::new(publisher),
            PublicationConfig {
                namespace: Namespace::new(config.da_namespace.clone()),
                poll_interval: config.publish_poll_interval,
                resubmit_after: config.publish_resubmit_after,
            },
        ),
    );
    sequencer.start(&shutdown).await?;

    let app = router(
        Arc::new(AppState {
            sequencer: Arc::clone(&sequencer),
        }),
        config.max_body_bytes,
    );
    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;

    tracing::info!(address = %config.http_addr, "listening");
    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "cannot listen for ctrl-c");
            }
        })
        .await;

    let stop_result = sequencer.stop().await;
    shutdown.cancel();
    if let Err(join_err) = sealer.await {
        return Err(format!("DA sealer join error during shutdown: {join_err}").into());
    }
    server_result?;
    stop_result?;
    Ok(())
}

struct Config {
    http_addr: String,
    db_path: String,
    executor_db_path: String,
    sqlite_synchronous: String,
    executor_sqlite_synchronous: String,
    max_body_bytes: usize,
    max_tx_bytes: usize,
    resubmit_interval: Duration,
    stop_timeout: Duration,
    max_batch_txs: u64,
    max_batch_bytes: u64,
    max_batch_open: Duration,
    delivery_lane_idle_poll_interval: Duration,
    delivery_lane_metrics: bool,
    snapshot_interval: u64,
    node_id: NodeId,
    ordering: String,
    ordering_interval: Duration,
    da_namespace: String,
    da_seal_interval: Duration,
    da_attester_key: [u8; 32],
    publish_poll_interval: Duration,
    publish_resubmit_after: Duration,
}

impl Config {
    fn from_env() -> Result<Self, String> {
        Ok(Self {
            http_addr: env_string("SEQ_HTTP_ADDR", DEFAULT_HTTP_ADDR),
            db_path: env_string("SEQ_DB_PATH", DEFAULT_DB_PATH),
            executor_db_path: env_string("SEQ_EXECUTOR_DB_PATH", DEFAULT_EXECUTOR_DB_PATH),
            sqlite_synchronous: env_string("SEQ_SQLITE_SYNCHRONOUS", DEFAULT_SQLITE_SYNCHRONOUS),
            // Executor commits are acknowledged as durable, so they fsync by default.
            executor_sqlite_synchronous: env_string(
                "SEQ_EXECUTOR_SQLITE_SYNCHRONOUS",
                DEFAULT_EXECUTOR_SQLITE_SYNCHRONOUS,
            ),
            max_body_bytes: env_usize("SEQ_MAX_BODY_BYTES", DEFAULT_MAX_BODY_BYTES),
            max_tx_bytes: env_usize("SEQ_MAX_TX_BYTES", DEFAULT_MAX_TX_BYTES).max(1),
            resubmit_interval: env_duration_ms("SEQ_RESUBMIT_INTERVAL_MS", DEFAULT_RESUBMIT_INTERVAL),
            stop_timeout: env_duration_ms("SEQ_STOP_TIMEOUT_MS", DEFAULT_STOP_TIMEOUT),
            max_batch_txs: env_u64("SEQ_MAX_BATCH_TXS", DEFAULT_MAX_BATCH_TXS).max(1),
            max_batch_bytes: env_u64("SEQ_MAX_BATCH_BYTES", DEFAULT_MAX_BATCH_BYTES).max(1),
            max_batch_open: env_duration_ms("SEQ_MAX_BATCH_OPEN_MS", DEFAULT_MAX_BATCH_OPEN_DURATION),
            delivery_lane_idle_poll_interval: env_duration_ms(
                "SEQ_DELIVERY_LANE_IDLE_POLL_INTERVAL_MS",
                DEFAULT_DELIVERY_LANE_IDLE_POLL_INTERVAL,
            ),
            delivery_lane_metrics: env_u64("SEQ_DELIVERY_LANE_METRICS", 0) != 0,
            snapshot_interval: env_u64("SEQ_SNAPSHOT_INTERVAL", DEFAULT_SNAPSHOT_INTERVAL),
            node_id: env_u64("SEQ_NODE_ID", DEFAULT_NODE_ID),
            ordering: env_string("SEQ_ORDERING", DEFAULT_ORDERING),
            ordering_interval: env_duration_ms("SEQ_ORDERING_INTERVAL_MS", DEFAULT_ORDERING_INTERVAL),
            da_namespace: env_string("SEQ_DA_NAMESPACE", DEFAULT_DA_NAMESPACE),
            da_seal_interval: env_duration_ms("SEQ_DA_SEAL_INTERVAL_MS", DEFAULT_DA_SEAL_INTERVAL),
            da_attester_key: parse_key(&env_string("SEQ_DA_ATTESTER_KEY", DEFAULT_DA_ATTESTER_KEY))?,
            publish_poll_interval: env_duration_ms(
                "SEQ_PUBLISH_POLL_INTERVAL_MS",
                DEFAULT_PUBLISH_POLL_INTERVAL,
            ),
            publish_resubmit_after: env_duration_ms(
                "SEQ_PUBLISH_RESUBMIT_AFTER_MS",
                DEFAULT_PUBLISH_RESUBMIT_AFTER,
            ),
        })
    }

    fn ordering_mode(&self) -> Result<OrderingMode, String> {
        match self.ordering.as_str() {
            "single-leader" => Ok(OrderingMode::SingleLeader {
                leader: self.node_id,
                members: vec![self.node_id],
                sync_interval: self.ordering_interval,
            }),
            "multi-leader" => Ok(OrderingMode::MultiLeader {
                members: vec![self.node_id],
                round_interval: self.ordering_interval,
            }),
            other => Err(format!(
                "SEQ_ORDERING must be single-leader or multi-leader, got {other}"
            )),
        }
    }

    fn sequencer_config(&self) -> SequencerConfig {
        SequencerConfig {
            max_tx_bytes: self.max_tx_bytes,
            resubmit_interval: self.resubmit_interval,
            stop_timeout: self.stop_timeout,
            delivery: DeliveryLaneConfig {
                max_batch_txs: self.max_batch_txs,
                max_batch_bytes: self.max_batch_bytes,
                max_batch_open: self.max_batch_open,
                idle_poll_interval: self.delivery_lane_idle_poll_interval,
                metrics_enabled: self.delivery_lane_metrics,
                ..DeliveryLaneConfig::default()
            },
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn env_duration_ms(key: &str, default: Duration) -> Duration {
    Duration::from_millis(env_u64(key, default.as_millis() as u64).max(1))
}

fn parse_key(value: &str) -> Result<[u8; 32], String> {
    if !value.starts_with("0x") {
        return Err("attester key must be 0x-prefixed hex".to_string());
    }
    let bytes =
        alloy_primitives::hex::decode(value).map_err(|e| format!("invalid attester key hex: {e}"))?;
    bytes
        .try_into()
        .map_err(|_| "attester key must be 32 bytes".to_string())
}
