// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! State-machine side of the rollup node.
//!
//! Everything here is deterministic and free of I/O: the transaction and batch
//! value types shared by the sequencer and any replaying observer, and the
//! [`Application`](application::Application) trait the executor drives.
pub mod application;
pub mod batch;
pub mod cursor;
pub mod tx;

pub use batch::{Batch, BatchDecodeError};
pub use cursor::Cursor;
pub use tx::{OrderedTx, Transaction};
