use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use dashmap::DashMap;
use log::{debug, warn};
use serde::Serialize;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{broadcast, Mutex};

use ember_core::blockchain::Ledger;
use ember_core::crypto;
use ember_core::error::Error;
use ember_core::network::Message;
use ember_core::transactions::Transaction;
use ember_core::wallet::{self, Wallet};

/// A connected peer session. The write half lives behind its own lock since
/// the frame transport is not write-safe for concurrent callers; the peer
/// registry lock is never held while writing.
pub struct Peer {
    pub id: u64,
    pub addr: String,
    writer: Mutex<OwnedWriteHalf>,
}

impl Peer {
    pub async fn send(&self, message: &Message) -> ember_core::error::Result<()> {
        let mut writer = self.writer.lock().await;
        message.send_async(&mut *writer).await
    }
}

/// Pushed to admin WebSocket clients after every chain or pool mutation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletUpdate {
    pub balance: f64,
    pub address: String,
}

/// Shared node state. The ledger mutex is the single lock guarding the
/// chain, its UTXO set, the pool and the cumulative difficulty.
pub struct Node {
    pub ledger: Mutex<Ledger>,
    pub wallet: Wallet,
    peers: DashMap<u64, Arc<Peer>>,
    next_peer_id: AtomicU64,
    tip_generation: AtomicU64,
    wallet_updates: broadcast::Sender<WalletUpdate>,
}

impl Node {
    pub fn new(wallet: Wallet) -> Arc<Self> {
        let (wallet_updates, _) = broadcast::channel(32);
        Arc::new(Node {
            ledger: Mutex::new(Ledger::new()),
            wallet,
            peers: DashMap::new(),
            next_peer_id: AtomicU64::new(0),
            tip_generation: AtomicU64::new(0),
            wallet_updates,
        })
    }

    pub fn register_peer(&self, addr: String, writer: OwnedWriteHalf) -> Arc<Peer> {
        let id = self.next_peer_id.fetch_add(1, Ordering::Relaxed);
        let peer = Arc::new(Peer {
            id,
            addr,
            writer: Mutex::new(writer),
        });
        self.peers.insert(id, peer.clone());
        peer
    }

    pub fn remove_peer(&self, id: u64) {
        if let Some((_, peer)) = self.peers.remove(&id) {
            debug!("peer {} ({}) evicted", peer.id, peer.addr);
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Sends a frame to every connected peer, evicting any that fail.
    pub async fn broadcast(&self, message: &Message) {
        let peers: Vec<Arc<Peer>> = self.peers.iter().map(|e| e.value().clone()).collect();
        for peer in peers {
            if let Err(e) = peer.send(message).await {
                warn!("dropping peer {} ({}): {}", peer.id, peer.addr, e);
                self.remove_peer(peer.id);
            }
        }
    }

    /// Announces the current tip as a single-block `BLOCKCHAIN` frame.
    pub async fn broadcast_latest(&self) {
        let tip = self.ledger.lock().await.latest_block().clone();
        self.broadcast(&Message::Blockchain(vec![tip])).await;
    }

    pub async fn broadcast_pool(&self) {
        let pool = self.ledger.lock().await.pool().transactions().to_vec();
        self.broadcast(&Message::TxPool(pool)).await;
    }

    /// The miner polls this between nonce batches; any tip change (local
    /// mine, peer append, chain replacement) bumps it.
    pub fn tip_generation(&self) -> u64 {
        self.tip_generation.load(Ordering::Relaxed)
    }

    pub fn bump_tip_generation(&self) {
        self.tip_generation.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscribe_wallet_updates(&self) -> broadcast::Receiver<WalletUpdate> {
        self.wallet_updates.subscribe()
    }

    pub async fn wallet_snapshot(&self) -> WalletUpdate {
        let ledger = self.ledger.lock().await;
        WalletUpdate {
            balance: wallet::balance(self.wallet.address(), ledger.unspent_tx_outs()),
            address: self.wallet.address().to_string(),
        }
    }

    pub async fn notify_wallet_update(&self) {
        let update = self.wallet_snapshot().await;
        let _ = self.wallet_updates.send(update);
    }

    /// Creates a transfer from the local wallet, admits it to the pool and
    /// gossips the pool. The block containing it is mined later.
    pub async fn send_transaction(&self, receiver: &str, amount: f64) -> Result<Transaction> {
        if amount <= 0.0 {
            return Err(Error::InvalidTransaction("amount must be positive".into()).into());
        }
        if !crypto::is_valid_address(receiver) {
            return Err(Error::InvalidTransaction(format!(
                "invalid receiver address: {}",
                receiver
            ))
            .into());
        }

        let tx = {
            let mut ledger = self.ledger.lock().await;
            let tx = self.wallet.create_transaction(
                receiver,
                amount,
                ledger.unspent_tx_outs(),
                ledger.pool(),
            )?;
            ledger.add_to_pool(tx.clone())?;
            tx
        };

        self.broadcast_pool().await;
        self.notify_wallet_update().await;
        Ok(tx)
    }
}
