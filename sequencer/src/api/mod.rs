// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

mod error;

use std::sync::Arc;

use axum::Router;
use axum::extract::{DefaultBodyLimit, Json, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::debug;

use app_core::application::Application;

use crate::lifecycle::LifecycleState;
use crate::node::Sequencer;

pub use error::ApiError;

pub struct AppState<A: Application + 'static> {
    pub sequencer: Arc<Sequencer<A>>,
}

#[derive(Debug, Deserialize)]
struct TxRequest {
    tx: String,
}

#[derive(Debug, Serialize)]
struct TxResponse {
    ok: bool,
    tx_hash: String,
}

#[derive(Debug, Deserialize)]
struct QueryRequest {
    query: String,
}

#[derive(Debug, Serialize)]
struct QueryResponse {
    ok: bool,
    result: String,
    cursor: u64,
}

#[derive(Debug, Serialize)]
struct CursorResponse {
    cursor: u64,
    processed_inputs: u64,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
    state: &'static str,
    faulted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    failed_task: Option<&'static str>,
}

pub fn router<A: Application + 'static>(state: Arc<AppState<A>>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/tx", post(submit_tx::<A>))
        .route("/query", post(query::<A>))
        .route("/cursor", get(cursor::<A>))
        .route("/health", get(health::<A>))
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
}

async fn submit_tx<A: Application + 'static>(
    State(state): State<Arc<AppState<A>>>,
    req: Result<Json<TxRequest>, axum::extract::rejection::JsonRejection>,
) -> Result<(StatusCode, Json<TxResponse>), ApiError> {
    let Json(req) = req.map_err(|err| ApiError::bad_request(format!("invalid JSON: {err}")))?;
    let tx = decode_hex_0x(&req.tx).map_err(ApiError::bad_request)?;

    let tx_hash = state.sequencer.write(tx).await?;
    let tx_hash = alloy_primitives::hex::encode_prefixed(tx_hash.as_slice());
    debug!(tx_hash = %tx_hash, "tx accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(TxResponse { ok: true, tx_hash }),
    ))
}

async fn query<A: Application + 'static>(
    State(state): State<Arc<AppState<A>>>,
    req: Result<Json<QueryRequest>, axum::extract::rejection::JsonRejection>,
) -> Result<Json<QueryResponse>, ApiError> {
    let Json(req) = req.map_err(|err| ApiError::bad_request(format!("invalid JSON: {err}")))?;
    let query = decode_hex_0x(&req.query).map_err(ApiError::bad_request)?;

    let (result, cursor) = state.sequencer.executor().query(&query)?;
    Ok(Json(QueryResponse {
        ok: true,
        result: alloy_primitives::hex::encode_prefixed(result),
        cursor: cursor.get(),
    }))
}

async fn cursor<A: Application + 'static>(
    State(state): State<Arc<AppState<A>>>,
) -> Json<CursorResponse> {
    let executor = state.sequencer.executor();
    Json(CursorResponse {
        cursor: executor.cursor().get(),
        processed_inputs: executor.processed_inputs(),
    })
}

async fn health<A: Application + 'static>(
    State(state): State<Arc<AppState<A>>>,
) -> (StatusCode, Json<HealthResponse>) {
    let lifecycle = state.sequencer.state();
    let faulted = state.sequencer.executor().is_faulted();
    let failed_task = state.sequencer.failed_task();
    let ok = lifecycle == LifecycleState::Running && !faulted && failed_task.is_none();
    let status = if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthResponse {
            ok,
            state: lifecycle.as_str(),
            faulted,
            failed_task,
        }),
    )
}

fn decode_hex_0x(value: &str) -> Result<Vec<u8>, String> {
    if !value.starts_with("0x") {
        return Err("hex string must start with 0x".to_string());
    }
    alloy_primitives::hex::decode(value).map_err(|err| format!("invalid hex: {err}"))
}
