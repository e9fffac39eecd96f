//! Execution boundary: the concrete EVM/state-transition engine is an
//! external collaborator, reached only through the `ExecutionEngine` trait.
//!
//! `SimpleExecutionEngine` is the default implementation used by tests and
//! local clusters: plain balance/nonce movement and gas accounting, enough
//! to exercise the cluster-core logic without pulling in a real EVM.

use crate::block::Transaction;
use crate::config::{GTXCOST, GTXXSHARDCOST};
use crate::error::{ClusterError, ClusterResult};
use crate::types::Address;
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct AccountState {
    pub balance: u128,
    pub nonce: u64,
}

#[derive(Debug, Clone)]
pub struct ExecutionReceipt {
    pub success: bool,
    pub gas_used: u64,
    pub fee_paid: u128,
}

/// Context a block provides to every transaction it executes.
#[derive(Debug, Clone, Copy)]
pub struct BlockContext {
    pub height: u64,
    pub timestamp: u64,
}

/// The seam spec.md §1 names as "external collaborator": consumes a state
/// and a transaction, returns a post-state mutation and a receipt.
pub trait ExecutionEngine: Send + Sync {
    fn execute(
        &self,
        accounts: &mut HashMap<Address, AccountState>,
        tx: &Transaction,
        ctx: BlockContext,
        is_cross_shard: bool,
    ) -> ClusterResult<ExecutionReceipt>;
}

pub struct SimpleExecutionEngine;

impl ExecutionEngine for SimpleExecutionEngine {
    fn execute(
        &self,
        accounts: &mut HashMap<Address, AccountState>,
        tx: &Transaction,
        _ctx: BlockContext,
        is_cross_shard: bool,
    ) -> ClusterResult<ExecutionReceipt> {
        let min_gas = if is_cross_shard {
            GTXXSHARDCOST + GTXCOST
        } else {
            GTXCOST
        };
        if tx.gas < min_gas {
            return Err(ClusterError::InvalidTx(format!(
                "gas {} below floor {min_gas}",
                tx.gas
            )));
        }

        let sender = accounts.entry(tx.from).or_default();
        if tx.nonce != sender.nonce {
            return Err(ClusterError::InvalidTx(format!(
                "nonce mismatch: tx has {}, account has {}",
                tx.nonce, sender.nonce
            )));
        }
        let fee = tx.gas as u128 * tx.gas_price as u128;
        let total = tx.value + fee;
        if sender.balance < total {
            return Err(ClusterError::InvalidTx("insufficient balance".into()));
        }
        sender.balance -= total;
        sender.nonce += 1;

        if !is_cross_shard {
            let recipient = accounts.entry(tx.to).or_default();
            recipient.balance += tx.value;
        }

        Ok(ExecutionReceipt {
            success: true,
            gas_used: min_gas,
            fee_paid: fee,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Transaction;

    fn addr(b: u8) -> Address {
        Address::new([b; 20], 0)
    }

    #[test]
    fn rejects_insufficient_balance() {
        let engine = SimpleExecutionEngine;
        let mut accounts = HashMap::new();
        accounts.insert(addr(1), AccountState { balance: 10, nonce: 0 });
        let tx = Transaction::unsigned(addr(1), addr(2), 100, GTXCOST, 0, 1);
        let ctx = BlockContext { height: 1, timestamp: 0 };
        assert!(engine.execute(&mut accounts, &tx, ctx, false).is_err());
    }

    #[test]
    fn deducts_value_and_fee_on_success() {
        let engine = SimpleExecutionEngine;
        let mut accounts = HashMap::new();
        accounts.insert(addr(1), AccountState { balance: 1_000_000, nonce: 0 });
        let tx = Transaction::unsigned(addr(1), addr(2), 1000, GTXCOST, 0, 1);
        let ctx = BlockContext { height: 1, timestamp: 0 };
        let receipt = engine.execute(&mut accounts, &tx, ctx, false).unwrap();
        assert!(receipt.success);
        let sender = &accounts[&addr(1)];
        assert_eq!(sender.balance, 1_000_000 - 1000 - (GTXCOST as u128 * 1));
        assert_eq!(accounts[&addr(2)].balance, 1000);
    }
}
