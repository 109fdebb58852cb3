use std::mem;

use crate::network::MemberId;
use super::message::{Transaction, TxKind, UniqueId};

/// Locally issued transactions waiting for the next flush.
pub struct PendingBuffer {
    origin: MemberId,
    transactions: Vec<Transaction>,
    /// Flush cycle number, part of every minted id.
    batch: u64,
    /// Sequence within the current batch, reset by every flush.
    seq: u64,
}

impl PendingBuffer {
    pub fn new(origin: MemberId) -> Self {
        PendingBuffer {
            origin,
            transactions: Vec::new(),
            batch: 1,
            seq: 0,
        }
    }

    pub fn submit(&mut self, kind: TxKind, operand: f64) -> Transaction {
        self.seq += 1;
        let tx = Transaction {
            kind,
            operand,
            unique_id: UniqueId::mint(&self.origin, self.batch, self.seq),
            origin: self.origin.clone(),
        };
        self.transactions.push(tx.clone());
        tx
    }

    /// Take everything for a flush. The buffer is empty afterwards.
    pub fn take(&mut self) -> Vec<Transaction> {
        mem::take(&mut self.transactions)
    }

    /// Put back transactions whose multicast failed, ids unchanged.
    pub fn requeue(&mut self, failed: Vec<Transaction>) {
        let newer = mem::replace(&mut self.transactions, failed);
        self.transactions.extend(newer);
    }

    pub fn finish_batch(&mut self) {
        self.batch += 1;
        self.seq = 0;
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}
