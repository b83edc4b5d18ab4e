use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::Utc;
use log::{debug, info, warn};

use ember_core::blockchain::{find_block, Block, Ledger};
use ember_core::crypto;
use ember_core::error::Error;
use ember_core::transactions::{coinbase_transaction, Transaction};

use crate::node::Node;

/// Nonces scanned per interruption check.
const MINE_BATCH: u64 = 4096;

/// Mines a block from the pool contents plus a coinbase for the local
/// wallet, commits it and announces the new tip.
pub async fn mine_next_block(node: &Arc<Node>) -> Result<Block> {
    let address = node.wallet.address().to_string();
    mine_template(node, move |ledger| {
        let height = ledger.latest_block().index + 1;
        let mut transactions = vec![coinbase_transaction(&address, height)];
        transactions.extend(ledger.pool().transactions().to_vec());
        Ok(transactions)
    })
    .await
}

/// Mines a block containing exactly the coinbase and a fresh transfer of
/// `amount` to `receiver`, bypassing the pool.
pub async fn mine_with_transaction(
    node: &Arc<Node>,
    receiver: &str,
    amount: f64,
) -> Result<Block> {
    if amount <= 0.0 {
        return Err(Error::InvalidTransaction("amount must be positive".into()).into());
    }
    if !crypto::is_valid_address(receiver) {
        return Err(
            Error::InvalidTransaction(format!("invalid receiver address: {}", receiver)).into(),
        );
    }

    let address = node.wallet.address().to_string();
    let wallet = node.wallet.clone();
    let receiver = receiver.to_string();
    mine_template(node, move |ledger| {
        let height = ledger.latest_block().index + 1;
        let coinbase = coinbase_transaction(&address, height);
        let transfer =
            wallet.create_transaction(&receiver, amount, ledger.unspent_tx_outs(), ledger.pool())?;
        Ok(vec![coinbase, transfer])
    })
    .await
}

/// The proof-of-work loop. The template is built under the ledger lock, the
/// nonce scan runs on a blocking thread polling the tip generation between
/// batches, and the found block is committed under the lock again, which
/// revalidates it against the then-current tip. Any tip movement restarts
/// the search from a fresh template.
async fn mine_template<F>(node: &Arc<Node>, build: F) -> Result<Block>
where
    F: Fn(&Ledger) -> ember_core::error::Result<Vec<Transaction>>,
{
    loop {
        let (index, prev_hash, difficulty, transactions, generation) = {
            let ledger = node.ledger.lock().await;
            let tip = ledger.latest_block();
            (
                tip.index + 1,
                tip.hash.clone(),
                ledger.next_difficulty(),
                build(&ledger)?,
                node.tip_generation(),
            )
        };
        let ts = Utc::now().timestamp() as u64;
        debug!(
            "mining block {} at difficulty {} with {} transactions",
            index,
            difficulty,
            transactions.len()
        );

        let worker = node.clone();
        let mined = tokio::task::spawn_blocking(move || {
            let mut nonce = 0u64;
            loop {
                if worker.tip_generation() != generation {
                    return None;
                }
                if let Some(block) = find_block(
                    index,
                    &prev_hash,
                    ts,
                    &transactions,
                    difficulty,
                    nonce,
                    MINE_BATCH,
                ) {
                    return Some(block);
                }
                nonce = nonce.wrapping_add(MINE_BATCH);
            }
        })
        .await
        .map_err(|e| anyhow!("mining task panicked: {}", e))?;

        let Some(block) = mined else {
            debug!("tip changed during the nonce search, restarting");
            continue;
        };

        {
            let mut ledger = node.ledger.lock().await;
            let now = Utc::now().timestamp() as u64;
            if let Err(e) = ledger.add_block(block.clone(), now) {
                warn!("mined block no longer extends the tip ({}), restarting", e);
                continue;
            }
        }
        info!("mined block {} at height {}", block.hash, block.index);
        node.bump_tip_generation();
        node.broadcast_latest().await;
        node.notify_wallet_update().await;
        return Ok(block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::wallet::{balance, Wallet};
    use ember_core::COINBASE_AMOUNT;

    fn test_node() -> Arc<Node> {
        let wallet = Wallet::from_private_key(crypto::generate_private_key()).unwrap();
        Node::new(wallet)
    }

    #[tokio::test]
    async fn fresh_node_has_no_balance() {
        let node = test_node();
        let snapshot = node.wallet_snapshot().await;
        assert_eq!(snapshot.balance, 0.0);
    }

    #[tokio::test]
    async fn mine_then_balance() {
        let node = test_node();
        let block = mine_next_block(&node).await.unwrap();
        assert_eq!(block.index, 1);
        assert_eq!(block.difficulty, 0);

        let ledger = node.ledger.lock().await;
        assert_eq!(ledger.blocks().len(), 2);
        assert_eq!(
            balance(node.wallet.address(), ledger.unspent_tx_outs()),
            COINBASE_AMOUNT
        );
    }

    #[tokio::test]
    async fn send_coins_produces_change() {
        let node = test_node();
        mine_next_block(&node).await.unwrap();

        let recipient = Wallet::from_private_key(crypto::generate_private_key()).unwrap();
        let block = mine_with_transaction(&node, recipient.address(), 30.0)
            .await
            .unwrap();

        assert_eq!(block.transactions.len(), 2);
        let transfer = &block.transactions[1];
        assert_eq!(transfer.tx_outs.len(), 2);
        assert_eq!(transfer.tx_outs[0].address, recipient.address());
        assert_eq!(transfer.tx_outs[0].amount, 30.0);
        assert_eq!(transfer.tx_outs[1].address, node.wallet.address());
        assert_eq!(transfer.tx_outs[1].amount, 20.0);

        let ledger = node.ledger.lock().await;
        assert_eq!(balance(recipient.address(), ledger.unspent_tx_outs()), 30.0);
        // two coinbase rewards minus the payment
        assert_eq!(
            balance(node.wallet.address(), ledger.unspent_tx_outs()),
            COINBASE_AMOUNT * 2.0 - 30.0
        );
    }

    #[tokio::test]
    async fn pool_entry_blocks_a_second_spend() {
        let node = test_node();
        mine_next_block(&node).await.unwrap();

        let recipient = Wallet::from_private_key(crypto::generate_private_key()).unwrap();
        node.send_transaction(recipient.address(), 30.0)
            .await
            .unwrap();

        // the only UTXO is referenced by the pool entry now
        let err = node
            .send_transaction(recipient.address(), 30.0)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("insufficient funds"));

        // mining the pool confirms the transfer and frees the pool
        mine_next_block(&node).await.unwrap();
        let ledger = node.ledger.lock().await;
        assert!(ledger.pool().is_empty());
        assert_eq!(balance(recipient.address(), ledger.unspent_tx_outs()), 30.0);
    }

    #[tokio::test]
    async fn rejects_bad_send_requests() {
        let node = test_node();
        mine_next_block(&node).await.unwrap();

        assert!(node.send_transaction("not-an-address", 10.0).await.is_err());
        let recipient = Wallet::from_private_key(crypto::generate_private_key()).unwrap();
        assert!(node.send_transaction(recipient.address(), 0.0).await.is_err());
        assert!(
            mine_with_transaction(&node, recipient.address(), -1.0)
                .await
                .is_err()
        );
    }
}
