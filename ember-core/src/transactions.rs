use std::collections::HashSet;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::crypto;
use crate::error::{Error, Result};
use crate::COINBASE_AMOUNT;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TxIn {
    pub tx_out_id: String,
    pub tx_out_index: u64,
    /// DER-encoded ECDSA signature over the enclosing transaction id. Empty
    /// for coinbase inputs, whose `tx_out_index` carries the block height.
    pub signature: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TxOut {
    pub address: String,
    pub amount: f64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: String,
    pub tx_ins: Vec<TxIn>,
    pub tx_outs: Vec<TxOut>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UnspentTxOut {
    pub tx_out_id: String,
    pub tx_out_index: u64,
    pub address: String,
    pub amount: f64,
}

impl TxIn {
    fn content(&self) -> String {
        // the signature is excluded, it is computed over the resulting id
        format!("{};{}", self.tx_out_id, self.tx_out_index)
    }
}

impl TxOut {
    fn content(&self) -> String {
        format!("{};{:.6}", self.address, self.amount)
    }
}

/// Recomputes the transaction id from the canonical content string. Never
/// reads `tx.id`.
pub fn transaction_id(tx: &Transaction) -> String {
    let ins: String = tx.tx_ins.iter().map(TxIn::content).collect();
    let outs: String = tx.tx_outs.iter().map(TxOut::content).collect();
    crypto::hash(&format!("{};{}", ins, outs))
}

/// Builds the coinbase transaction minting the block reward at a height.
pub fn coinbase_transaction(address: &str, block_index: u64) -> Transaction {
    let mut tx = Transaction {
        id: String::new(),
        tx_ins: vec![TxIn {
            tx_out_id: String::new(),
            tx_out_index: block_index,
            signature: String::new(),
        }],
        tx_outs: vec![TxOut {
            address: address.to_string(),
            amount: COINBASE_AMOUNT,
        }],
    };
    tx.id = transaction_id(&tx);
    tx
}

pub fn find_unspent_tx_out<'a>(
    tx_out_id: &str,
    tx_out_index: u64,
    unspent_tx_outs: &'a [UnspentTxOut],
) -> Option<&'a UnspentTxOut> {
    unspent_tx_outs
        .iter()
        .find(|u| u.tx_out_id == tx_out_id && u.tx_out_index == tx_out_index)
}

fn validate_tx_in(tx_in: &TxIn, tx: &Transaction, unspent_tx_outs: &[UnspentTxOut]) -> Result<f64> {
    let referenced = find_unspent_tx_out(&tx_in.tx_out_id, tx_in.tx_out_index, unspent_tx_outs)
        .ok_or_else(|| {
            Error::InvalidTransaction(format!("referenced txOut not found: {}", tx_in.content()))
        })?;

    let public_key = crypto::base58_decode(&referenced.address).map_err(|e| {
        Error::InvalidTransaction(format!("undecodable address {}: {}", referenced.address, e))
    })?;
    if !crypto::verify(&tx.id, &tx_in.signature, &public_key) {
        return Err(Error::InvalidTransaction(format!(
            "invalid txIn signature for {} in tx {}",
            tx_in.content(),
            tx.id
        )));
    }
    Ok(referenced.amount)
}

/// A transaction is valid against a UTXO set iff its id is consistent with
/// its content, every input references a live UTXO and carries a signature
/// by that UTXO's owner, and input and output totals are exactly equal.
pub fn validate_transaction(tx: &Transaction, unspent_tx_outs: &[UnspentTxOut]) -> Result<()> {
    if transaction_id(tx) != tx.id {
        return Err(Error::InvalidTransaction(format!("invalid tx id: {}", tx.id)));
    }

    let mut total_in = 0.0;
    for tx_in in &tx.tx_ins {
        total_in += validate_tx_in(tx_in, tx, unspent_tx_outs)?;
    }
    let total_out: f64 = tx.tx_outs.iter().map(|o| o.amount).sum();

    if total_in != total_out {
        return Err(Error::InvalidTransaction(format!(
            "input total {} != output total {} in tx {}",
            total_in, total_out, tx.id
        )));
    }
    Ok(())
}

pub fn validate_coinbase(tx: &Transaction, block_index: u64) -> Result<()> {
    if transaction_id(tx) != tx.id {
        return Err(Error::InvalidTransaction(format!(
            "invalid coinbase tx id: {}",
            tx.id
        )));
    }
    if tx.tx_ins.len() != 1 {
        return Err(Error::InvalidTransaction(
            "coinbase must have exactly one txIn".into(),
        ));
    }
    if tx.tx_ins[0].tx_out_index != block_index {
        return Err(Error::InvalidTransaction(
            "coinbase txIn index must be the block height".into(),
        ));
    }
    if tx.tx_outs.len() != 1 {
        return Err(Error::InvalidTransaction(
            "coinbase must have exactly one txOut".into(),
        ));
    }
    if tx.tx_outs[0].amount != COINBASE_AMOUNT {
        return Err(Error::InvalidTransaction(
            "invalid coinbase amount".into(),
        ));
    }
    Ok(())
}

/// Validates an entire block's transaction list: a coinbase first, no two
/// inputs anywhere in the block spending the same output, and every
/// non-coinbase transaction individually valid.
pub fn validate_block_transactions(
    transactions: &[Transaction],
    unspent_tx_outs: &[UnspentTxOut],
    block_index: u64,
) -> Result<()> {
    let Some(coinbase) = transactions.first() else {
        return Err(Error::InvalidTransaction(
            "the first transaction in the block must be a coinbase".into(),
        ));
    };
    validate_coinbase(coinbase, block_index)?;

    let mut seen: HashSet<(&str, u64)> = HashSet::new();
    for tx_in in transactions.iter().flat_map(|t| t.tx_ins.iter()) {
        if !seen.insert((tx_in.tx_out_id.as_str(), tx_in.tx_out_index)) {
            return Err(Error::InvalidTransaction(format!(
                "duplicate txIn in block: {}",
                tx_in.content()
            )));
        }
    }

    for tx in &transactions[1..] {
        validate_transaction(tx, unspent_tx_outs)?;
    }
    Ok(())
}

/// The UTXO transition: validates the block's transactions and returns the
/// next UTXO set, with consumed outputs removed and freshly produced ones
/// appended.
pub fn process_transactions(
    transactions: &[Transaction],
    unspent_tx_outs: &[UnspentTxOut],
    block_index: u64,
) -> Result<Vec<UnspentTxOut>> {
    validate_block_transactions(transactions, unspent_tx_outs, block_index)?;

    let consumed: HashSet<(&str, u64)> = transactions
        .iter()
        .flat_map(|t| t.tx_ins.iter())
        .map(|i| (i.tx_out_id.as_str(), i.tx_out_index))
        .collect();

    let mut next: Vec<UnspentTxOut> = unspent_tx_outs
        .iter()
        .filter(|u| !consumed.contains(&(u.tx_out_id.as_str(), u.tx_out_index)))
        .cloned()
        .collect();

    for tx in transactions {
        for (index, tx_out) in tx.tx_outs.iter().enumerate() {
            next.push(UnspentTxOut {
                tx_out_id: tx.id.clone(),
                tx_out_index: index as u64,
                address: tx_out.address.clone(),
                amount: tx_out.amount,
            });
        }
    }

    debug!(
        "processed {} transactions at height {}, utxo set size {}",
        transactions.len(),
        block_index,
        next.len()
    );
    Ok(next)
}
