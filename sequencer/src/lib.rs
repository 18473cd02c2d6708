// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Rollup node core: ordering, crash-safe execution and verifiable
//! publication.
//!
//! Flow: API -> sequencer (accepted_txs) -> ordering protocol -> ordered log
//! -> delivery lane -> executor, with closed batches published to a DA
//! namespace that a replayer can rebuild state from.
//! The delivery lane is the single caller of the executor.
pub mod api;
pub mod delivery_lane;
pub mod executor;
pub mod lifecycle;
pub mod node;
pub mod ordering;
pub mod publisher;
pub mod replay;
pub mod storage;
