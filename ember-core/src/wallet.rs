use std::fs;
use std::path::Path;

use anyhow::Context;
use log::info;

use crate::crypto;
use crate::error::{Error, Result};
use crate::transactions::{transaction_id, Transaction, TxIn, TxOut, UnspentTxOut};
use crate::txpool::TransactionPool;

/// The node's keypair, bound to a plain-text hex key file on disk.
#[derive(Debug, Clone)]
pub struct Wallet {
    private_key: String,
    address: String,
}

impl Wallet {
    /// Reads the key file, generating a fresh key on first run. Key I/O
    /// failure is the one fatal error of the process.
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let private_key = match fs::read_to_string(path) {
            Ok(content) => content.trim().to_string(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let key = crypto::generate_private_key();
                fs::write(path, &key)
                    .with_context(|| format!("failed to write key file {}", path.display()))?;
                info!("new wallet key created at {}", path.display());
                key
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read key file {}", path.display()));
            }
        };
        Self::from_private_key(private_key)
    }

    pub fn from_private_key(private_key: String) -> anyhow::Result<Self> {
        let public_key = crypto::public_key_for(&private_key)?;
        let address = crypto::base58_encode(&public_key)?;
        Ok(Wallet {
            private_key,
            address,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Assembles and signs a transfer of `amount` to `receiver`, drawing on
    /// this wallet's spendable outputs and returning change to self.
    pub fn create_transaction(
        &self,
        receiver: &str,
        amount: f64,
        unspent_tx_outs: &[UnspentTxOut],
        pool: &TransactionPool,
    ) -> Result<Transaction> {
        let spendable = spendable_utxos(&self.address, unspent_tx_outs, pool);

        let mut selected: Vec<&UnspentTxOut> = Vec::new();
        let mut gathered = 0.0;
        for utxo in &spendable {
            selected.push(utxo);
            gathered += utxo.amount;
            if gathered >= amount {
                break;
            }
        }
        if gathered < amount {
            return Err(Error::InsufficientFunds {
                available: gathered,
                required: amount,
            });
        }
        let leftover = gathered - amount;

        let tx_ins: Vec<TxIn> = selected
            .iter()
            .map(|u| TxIn {
                tx_out_id: u.tx_out_id.clone(),
                tx_out_index: u.tx_out_index,
                signature: String::new(),
            })
            .collect();

        let mut tx_outs = vec![TxOut {
            address: receiver.to_string(),
            amount,
        }];
        if leftover != 0.0 {
            tx_outs.push(TxOut {
                address: self.address.clone(),
                amount: leftover,
            });
        }

        let mut tx = Transaction {
            id: String::new(),
            tx_ins,
            tx_outs,
        };
        tx.id = transaction_id(&tx);

        let signature = crypto::sign(&tx.id, &self.private_key).map_err(|e| {
            Error::InvalidTransaction(format!("failed to sign transaction {}: {}", tx.id, e))
        })?;
        for tx_in in &mut tx.tx_ins {
            tx_in.signature = signature.clone();
        }
        Ok(tx)
    }
}

/// All outputs in the UTXO set addressed to `address`.
pub fn find_unspent_tx_outs(address: &str, unspent_tx_outs: &[UnspentTxOut]) -> Vec<UnspentTxOut> {
    unspent_tx_outs
        .iter()
        .filter(|u| u.address == address)
        .cloned()
        .collect()
}

pub fn balance(address: &str, unspent_tx_outs: &[UnspentTxOut]) -> f64 {
    find_unspent_tx_outs(address, unspent_tx_outs)
        .iter()
        .map(|u| u.amount)
        .sum()
}

/// The owner's outputs minus those already referenced by a pool entry.
pub fn spendable_utxos(
    address: &str,
    unspent_tx_outs: &[UnspentTxOut],
    pool: &TransactionPool,
) -> Vec<UnspentTxOut> {
    find_unspent_tx_outs(address, unspent_tx_outs)
        .into_iter()
        .filter(|u| !pool.references(&u.tx_out_id, u.tx_out_index))
        .collect()
}
