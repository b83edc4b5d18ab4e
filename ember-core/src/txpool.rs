use log::{debug, info};

use crate::error::{Error, Result};
use crate::transactions::{find_unspent_tx_out, validate_transaction, Transaction, UnspentTxOut};

/// In-memory set of admitted but not yet mined transactions. Invariant: no
/// two pool entries reference the same `(txOutId, txOutIndex)`.
#[derive(Debug, Clone, Default)]
pub struct TransactionPool {
    transactions: Vec<Transaction>,
}

impl TransactionPool {
    pub fn new() -> Self {
        Self::default()
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

    /// True if any pool entry already spends the given output.
    pub fn references(&self, tx_out_id: &str, tx_out_index: u64) -> bool {
        self.transactions
            .iter()
            .flat_map(|t| t.tx_ins.iter())
            .any(|i| i.tx_out_id == tx_out_id && i.tx_out_index == tx_out_index)
    }

    /// Admission control: the transaction must validate against the current
    /// UTXO set and must not spend anything an existing entry spends.
    pub fn add(&mut self, tx: Transaction, unspent_tx_outs: &[UnspentTxOut]) -> Result<()> {
        validate_transaction(&tx, unspent_tx_outs)?;
        for tx_in in &tx.tx_ins {
            if self.references(&tx_in.tx_out_id, tx_in.tx_out_index) {
                return Err(Error::InvalidTransaction(format!(
                    "txIn {};{} is already referenced by a pool entry",
                    tx_in.tx_out_id, tx_in.tx_out_index
                )));
            }
        }
        info!("transaction {} admitted to the pool", tx.id);
        self.transactions.push(tx);
        Ok(())
    }

    /// Drops every entry with an input that no longer resolves in the UTXO
    /// set. Called after each chain mutation.
    pub fn refresh(&mut self, unspent_tx_outs: &[UnspentTxOut]) {
        let before = self.transactions.len();
        self.transactions.retain(|tx| {
            tx.tx_ins.iter().all(|i| {
                find_unspent_tx_out(&i.tx_out_id, i.tx_out_index, unspent_tx_outs).is_some()
            })
        });
        let removed = before - self.transactions.len();
        if removed > 0 {
            debug!("dropped {} stale transactions from the pool", removed);
        }
    }
}
