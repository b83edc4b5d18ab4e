//! Shared helpers for unit tests.

use crate::crypto;
use crate::transactions::{transaction_id, Transaction, TxIn, TxOut, UnspentTxOut};

pub struct TestWallet {
    pub private_key: String,
    pub address: String,
}

pub fn test_wallet() -> TestWallet {
    let private_key = crypto::generate_private_key();
    let public_key = crypto::public_key_for(&private_key).unwrap();
    let address = crypto::base58_encode(&public_key).unwrap();
    TestWallet {
        private_key,
        address,
    }
}

pub fn utxo_for(wallet: &TestWallet, tx_out_id: &str, amount: f64) -> UnspentTxOut {
    UnspentTxOut {
        tx_out_id: tx_out_id.to_string(),
        tx_out_index: 0,
        address: wallet.address.clone(),
        amount,
    }
}

/// Builds a transaction spending `utxo` into `outputs`, signed by `wallet`.
pub fn signed_transfer(
    wallet: &TestWallet,
    utxo: &UnspentTxOut,
    outputs: Vec<TxOut>,
) -> Transaction {
    let mut tx = Transaction {
        id: String::new(),
        tx_ins: vec![TxIn {
            tx_out_id: utxo.tx_out_id.clone(),
            tx_out_index: utxo.tx_out_index,
            signature: String::new(),
        }],
        tx_outs: outputs,
    };
    tx.id = transaction_id(&tx);
    let signature = crypto::sign(&tx.id, &wallet.private_key).unwrap();
    for tx_in in &mut tx.tx_ins {
        tx_in.signature = signature.clone();
    }
    tx
}
