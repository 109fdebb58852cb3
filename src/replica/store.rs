use std::collections::HashSet;

use crate::common::{Digest, Hashable, Hasher};
use super::message::{Transaction, UniqueId};

/// Outcome of handing a delivered transaction to the [`Ledger`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Applied {
    /// Position of the transaction in this replica's apply order, from 1.
    Executed { order: u64 },
    /// The id was applied before; nothing changed.
    Duplicate,
}

/// The replicated account: balance, executed log and dedup set.
///
/// The balance only moves through [`Ledger::execute`] and the
/// snapshot overwrite used for state transfer.
pub struct Ledger {
    balance: f64,
    executed: Vec<Transaction>,
    seen: HashSet<UniqueId>,
    order_counter: u64,
    chain: Digest,
}

impl Ledger {
    pub fn new() -> Self {
        Ledger {
            balance: 0.0,
            executed: Vec::new(),
            seen: HashSet::new(),
            order_counter: 0,
            chain: [0u8; 64],
        }
    }

    pub fn balance(&self) -> f64 {
        self.balance
    }

    pub fn executed(&self) -> &[Transaction] {
        &self.executed
    }

    pub fn order_counter(&self) -> u64 {
        self.order_counter
    }

    pub fn overwrite_balance(&mut self, balance: f64) {
        self.balance = balance;
    }

    pub fn execute(&mut self, tx: Transaction) -> Applied {
        if !self.seen.insert(tx.unique_id.clone()) {
            return Applied::Duplicate;
        }
        self.balance = tx.kind.apply(self.balance, tx.operand);
        self.order_counter += 1;

        let mut hasher = Hasher::new();
        hasher.update(&self.chain).update(&tx.hash());
        self.chain = hasher.finalize();

        self.executed.push(tx);
        Applied::Executed {
            order: self.order_counter,
        }
    }

    /// Forget the executed log. Balance, counter and dedup set are kept.
    pub fn clean_history(&mut self) {
        self.executed.clear();
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl Hashable for Ledger {
    /// Covers the balance and every transaction applied since startup, in order.
    fn hash(&self) -> Digest {
        let mut hasher = Hasher::new();
        hasher
            .update(&self.balance.to_bits().to_be_bytes())
            .update(&self.order_counter.to_be_bytes())
            .update(&self.chain);
        hasher.finalize()
    }
}
