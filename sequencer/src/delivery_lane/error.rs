// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use thiserror::Error;

use crate::executor::ExecutorError;

#[derive(Debug, Error)]
pub enum DeliveryLaneError {
    #[error("delivery lane shutdown requested")]
    ShutdownRequested,
    #[error("delivery lane halted")]
    Halted,
    #[error("cannot load open batch")]
    LoadOpenBatch {
        #[source]
        source: rusqlite::Error,
    },
    #[error("cannot load ordered transactions")]
    LoadOrdered {
        #[source]
        source: rusqlite::Error,
    },
    #[error("execution of ordered entry {seq} failed")]
    Execute {
        seq: u64,
        #[source]
        source: ExecutorError,
    },
    #[error("failed to close batch")]
    CloseBatch {
        #[source]
        source: rusqlite::Error,
    },
}

impl DeliveryLaneError {
    /// The lane exited because it was asked to, not because it failed.
    pub fn is_requested_stop(&self) -> bool {
        matches!(self, Self::ShutdownRequested | Self::Halted)
    }
}
