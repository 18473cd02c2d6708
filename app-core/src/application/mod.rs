// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

mod method;
mod wallet;

use alloy_primitives::U256;
use std::fmt;
use thiserror::Error;

pub use method::{Deposit, Method, Transfer, Withdrawal};
pub use wallet::WalletApp;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("internal: {reason}")]
    Internal { reason: String },
    #[error("invalid query: {reason}")]
    InvalidQuery { reason: String },
    #[error("cannot restore state: {reason}")]
    Restore { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidReason {
    Malformed { reason: String },
    ZeroAmount,
    InsufficientBalance { required: U256, available: U256 },
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed { reason } => write!(f, "malformed transaction: {reason}"),
            Self::ZeroAmount => write!(f, "amount must be non-zero"),
            Self::InsufficientBalance {
                required,
                available,
            } => {
                write!(
                    f,
                    "insufficient balance: required {required}, available {available}"
                )
            }
        }
    }
}

/// Deterministic state machine driven by the executor.
///
/// Implementations must be pure functions of their inputs: the same sequence
/// of `apply_valid` calls on the same starting state must yield the same state
/// on every replica. Validation never mutates.
pub trait Application: Send + Sync {
    fn validate(&self, tx: &[u8]) -> Result<(), InvalidReason>;

    /// Applies a transaction that passed [`Application::validate`] against the
    /// current state. An error here is an internal fault, not a rejection.
    fn apply_valid(&mut self, tx: &[u8]) -> Result<(), AppError>;

    fn query(&self, query: &[u8]) -> Result<Vec<u8>, AppError>;

    fn encode_state(&self) -> Vec<u8>;

    fn restore_state(bytes: &[u8]) -> Result<Self, AppError>
    where
        Self: Sized;
}
