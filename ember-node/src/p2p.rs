use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use log::{debug, info, warn};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};

use ember_core::blockchain::Block;
use ember_core::error::Error;
use ember_core::network::Message;
use ember_core::transactions::Transaction;

use crate::node::{Node, Peer};

/// Accepts inbound peer connections on the p2p port.
pub async fn serve(node: Arc<Node>, port: u16) -> Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind p2p listener on {}", addr))?;
    info!("p2p listening on {}", addr);

    loop {
        match listener.accept().await {
            Ok((socket, peer_addr)) => {
                attach_peer(node.clone(), socket, peer_addr.to_string()).await;
            }
            Err(e) => {
                warn!("error accepting peer connection: {}", e);
            }
        }
    }
}

/// Dials a peer at `host:port` and attaches the resulting session.
pub async fn connect(node: Arc<Node>, addr: &str) -> Result<()> {
    let socket = TcpStream::connect(addr)
        .await
        .with_context(|| format!("failed to dial peer {}", addr))?;
    attach_peer(node, socket, addr.to_string()).await;
    Ok(())
}

/// Registers the session, starts its reader and runs the connect handshake:
/// ask the new peer for its tip right away, then query the mesh for pending
/// transactions shortly after.
async fn attach_peer(node: Arc<Node>, socket: TcpStream, addr: String) {
    let (reader, writer) = socket.into_split();
    let peer = node.register_peer(addr.clone(), writer);
    info!("peer {} connected ({} known)", addr, node.peer_count());

    if let Err(e) = peer.send(&Message::GetLatestBlock).await {
        warn!("handshake with {} failed: {}", addr, e);
        node.remove_peer(peer.id);
        return;
    }

    {
        let node = node.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            node.broadcast(&Message::GetTxPool).await;
        });
    }

    tokio::spawn(read_loop(node, peer, reader));
}

async fn read_loop(node: Arc<Node>, peer: Arc<Peer>, mut reader: OwnedReadHalf) {
    loop {
        let message = match Message::receive_async(&mut reader).await {
            Ok(message) => message,
            Err(Error::MalformedFrame(e)) => {
                // the frame was fully consumed, the session stays usable
                warn!("malformed frame from {}: {}", peer.addr, e);
                continue;
            }
            Err(e) => {
                info!("peer {} disconnected: {}", peer.addr, e);
                node.remove_peer(peer.id);
                return;
            }
        };

        if let Err(e) = handle_message(&node, &peer, message).await {
            warn!("failed to reply to peer {}: {}", peer.addr, e);
            node.remove_peer(peer.id);
            return;
        }
    }
}

/// Dispatches one frame. An error means a failed write back to the sender;
/// validation failures are swallowed after logging.
async fn handle_message(
    node: &Arc<Node>,
    peer: &Arc<Peer>,
    message: Message,
) -> ember_core::error::Result<()> {
    match message {
        Message::GetLatestBlock => {
            let tip = node.ledger.lock().await.latest_block().clone();
            peer.send(&Message::Blockchain(vec![tip])).await
        }
        Message::GetAllBlocks => {
            let blocks = node.ledger.lock().await.blocks().to_vec();
            peer.send(&Message::Blockchain(blocks)).await
        }
        Message::GetTxPool => {
            let pool = node.ledger.lock().await.pool().transactions().to_vec();
            peer.send(&Message::TxPool(pool)).await
        }
        Message::Blockchain(blocks) => {
            handle_blockchain(node, blocks).await;
            Ok(())
        }
        Message::TxPool(transactions) => {
            handle_tx_pool(node, transactions).await;
            Ok(())
        }
    }
}

/// Reconciles a received block list with the local chain.
///
/// The last entry is the sender's tip. A tip at or below our height is
/// ignored; a tip that extends our chain is appended and re-announced; a
/// disconnected single-block announcement escalates to a full-chain
/// request; anything longer goes through the fork-choice rule.
pub(crate) async fn handle_blockchain(node: &Arc<Node>, blocks: Vec<Block>) {
    let Some(received_tip) = blocks.last().cloned() else {
        return;
    };
    let now = Utc::now().timestamp() as u64;

    let mut ledger = node.ledger.lock().await;
    let (local_index, local_hash) = {
        let tip = ledger.latest_block();
        (tip.index, tip.hash.clone())
    };

    if received_tip.index <= local_index {
        debug!(
            "received tip at height {} does not beat local height {}, ignoring",
            received_tip.index, local_index
        );
        return;
    }

    if local_hash == received_tip.prev_hash {
        match ledger.add_block(received_tip, now) {
            Ok(()) => {
                drop(ledger);
                node.bump_tip_generation();
                node.broadcast_latest().await;
                node.notify_wallet_update().await;
            }
            Err(e) => warn!("received block rejected: {}", e),
        }
    } else if blocks.len() == 1 {
        drop(ledger);
        info!("received tip does not connect, requesting all blocks");
        node.broadcast(&Message::GetAllBlocks).await;
    } else {
        match ledger.replace_chain(blocks, now) {
            Ok(()) => {
                drop(ledger);
                node.bump_tip_generation();
                node.broadcast_latest().await;
                node.notify_wallet_update().await;
            }
            Err(e) => warn!("received chain not adopted: {}", e),
        }
    }
}

/// Attempts pool admission for every received transaction; if any was
/// accepted the updated pool is gossiped onwards.
async fn handle_tx_pool(node: &Arc<Node>, transactions: Vec<Transaction>) {
    let mut accepted = false;
    {
        let mut ledger = node.ledger.lock().await;
        for tx in transactions {
            let id = tx.id.clone();
            match ledger.add_to_pool(tx) {
                Ok(()) => accepted = true,
                Err(e) => debug!("peer transaction {} rejected: {}", id, e),
            }
        }
    }
    if accepted {
        node.broadcast_pool().await;
        node.notify_wallet_update().await;
    }
}
