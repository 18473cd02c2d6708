// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use app_core::application::AppError;
use thiserror::Error;

use crate::storage::StorageOpenError;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("cannot open executor storage")]
    Open {
        #[source]
        source: StorageOpenError,
    },
    #[error("executor storage failed")]
    Storage {
        #[source]
        source: rusqlite::Error,
    },
    #[error("apply failed after commit at cursor {cursor}; executor is faulted")]
    Apply {
        cursor: u64,
        #[source]
        source: AppError,
    },
    #[error("input {actual} delivered out of order, executor expects input {expected}")]
    OutOfOrder { expected: u64, actual: u64 },
    #[error("executor is faulted and must be reopened")]
    Faulted,
    #[error("cannot restore snapshot at cursor {cursor}")]
    Recovery {
        cursor: u64,
        #[source]
        source: AppError,
    },
    #[error("committed log is corrupted at cursor {cursor}: {reason}")]
    CorruptedLog { cursor: u64, reason: String },
    #[error("invalid query")]
    InvalidQuery {
        #[source]
        source: AppError,
    },
}

impl From<rusqlite::Error> for ExecutorError {
    fn from(source: rusqlite::Error) -> Self {
        Self::Storage { source }
    }
}

impl From<StorageOpenError> for ExecutorError {
    fn from(source: StorageOpenError) -> Self {
        Self::Open { source }
    }
}
