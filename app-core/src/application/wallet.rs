// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::collections::BTreeMap;

use alloy_primitives::{Address, U256};
use ssz::{Decode, Encode};
use ssz_derive::{Decode as DeriveDecode, Encode as DeriveEncode};

use crate::application::{AppError, Application, InvalidReason, Method};

/// Reference state machine: SSZ-encoded [`Method`]s moving balances around.
///
/// Queries: an empty query returns the total supply, a 20-byte address returns
/// that account's balance. Both are 32-byte big-endian integers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalletApp {
    // BTreeMap so that snapshots are byte-identical across replicas.
    balances: BTreeMap<Address, U256>,
    total_supply: U256,
}

#[derive(Debug, DeriveEncode, DeriveDecode)]
struct AccountEntry {
    owner: Address,
    balance: U256,
}

#[derive(Debug, DeriveEncode, DeriveDecode)]
struct WalletSnapshot {
    total_supply: U256,
    accounts: Vec<AccountEntry>,
}

impl WalletApp {
    pub fn balance_of(&self, addr: &Address) -> U256 {
        *self.balances.get(addr).unwrap_or(&U256::ZERO)
    }

    pub fn total_supply(&self) -> U256 {
        self.total_supply
    }

    fn credit(&mut self, addr: Address, amount: U256) {
        let current = self.balance_of(&addr);
        self.balances.insert(addr, current.saturating_add(amount));
    }

    fn debit(&mut self, addr: Address, amount: U256) -> Result<(), AppError> {
        let current = self.balance_of(&addr);
        let next = current.checked_sub(amount).ok_or_else(|| AppError::Internal {
            reason: format!("validated debit of {amount} exceeds balance {current}"),
        })?;
        if next.is_zero() {
            self.balances.remove(&addr);
        } else {
            self.balances.insert(addr, next);
        }
        Ok(())
    }

    fn require_funds(&self, owner: &Address, amount: U256) -> Result<(), InvalidReason> {
        let available = self.balance_of(owner);
        if available < amount {
            return Err(InvalidReason::InsufficientBalance {
                required: amount,
                available,
            });
        }
        Ok(())
    }
}

fn decode_method(tx: &[u8]) -> Result<Method, InvalidReason> {
    Method::from_ssz_bytes(tx).map_err(|err| InvalidReason::Malformed {
        reason: format!("{err:?}"),
    })
}

impl Application for WalletApp {
    fn validate(&self, tx: &[u8]) -> Result<(), InvalidReason> {
        match decode_method(tx)? {
            Method::Deposit(deposit) => {
                if deposit.amount.is_zero() {
                    return Err(InvalidReason::ZeroAmount);
                }
                // Deposits mint; the supply must stay representable.
                if self.total_supply.checked_add(deposit.amount).is_none() {
                    return Err(InvalidReason::Malformed {
                        reason: "deposit overflows total supply".to_string(),
                    });
                }
                Ok(())
            }
            Method::Transfer(transfer) => {
                if transfer.amount.is_zero() {
                    return Err(InvalidReason::ZeroAmount);
                }
                self.require_funds(&transfer.from, transfer.amount)
            }
            Method::Withdrawal(withdrawal) => {
                if withdrawal.amount.is_zero() {
                    return Err(InvalidReason::ZeroAmount);
                }
                self.require_funds(&withdrawal.from, withdrawal.amount)
            }
        }
    }

    fn apply_valid(&mut self, tx: &[u8]) -> Result<(), AppError> {
        let method = decode_method(tx).map_err(|reason| AppError::Internal {
            reason: reason.to_string(),
        })?;
        match method {
            Method::Deposit(deposit) => {
                self.total_supply = self.total_supply.saturating_add(deposit.amount);
                self.credit(deposit.to, deposit.amount);
            }
            Method::Transfer(transfer) => {
                self.debit(transfer.from, transfer.amount)?;
                self.credit(transfer.to, transfer.amount);
            }
            Method::Withdrawal(withdrawal) => {
                self.debit(withdrawal.from, withdrawal.amount)?;
                self.total_supply = self.total_supply.saturating_sub(withdrawal.amount);
            }
        }
        Ok(())
    }

    fn query(&self, query: &[u8]) -> Result<Vec<u8>, AppError> {
        let value = match query.len() {
            0 => self.total_supply,
            20 => self.balance_of(&Address::from_slice(query)),
            len => {
                return Err(AppError::InvalidQuery {
                    reason: format!("expected empty query or 20-byte address, got {len} bytes"),
                });
            }
        };
        Ok(value.to_be_bytes::<32>().to_vec())
    }

    fn encode_state(&self) -> Vec<u8> {
        WalletSnapshot {
            total_supply: self.total_supply,
            accounts: self
                .balances
                .iter()
                .map(|(owner, balance)| AccountEntry {
                    owner: *owner,
                    balance: *balance,
                })
                .collect(),
        }
        .as_ssz_bytes()
    }

    fn restore_state(bytes: &[u8]) -> Result<Self, AppError> {
        let snapshot = WalletSnapshot::from_ssz_bytes(bytes).map_err(|err| AppError::Restore {
            reason: format!("{err:?}"),
        })?;
        Ok(Self {
            balances: snapshot
                .accounts
                .into_iter()
                .map(|entry| (entry.owner, entry.balance))
                .collect(),
            total_supply: snapshot.total_supply,
        })
    }
}
