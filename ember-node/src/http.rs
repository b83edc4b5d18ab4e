use std::fmt::Display;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use log::info;
use tokio::sync::broadcast::error::RecvError;

use ember_core::wallet;

use crate::node::{Node, WalletUpdate};
use crate::{miner, p2p};

/// The admin surface: a JSON REST adapter over the node plus a read-only
/// WebSocket channel pushing wallet state to UI clients.
pub fn router(node: Arc<Node>) -> Router {
    Router::new()
        .route("/api/blocks", get(blocks))
        .route("/api/lastBlock", get(last_block))
        .route("/api/balance", get(balance))
        .route("/api/unspentTxOuts", get(unspent_tx_outs))
        .route("/api/mineBlock", get(mine_block))
        .route("/api/sendTx/{address}/{amount}", get(send_tx))
        .route("/api/sendCoins/{address}/{amount}", get(send_coins))
        .route("/api/addPeer/{peerAddress}", get(add_peer))
        .route("/ws", get(ws_upgrade))
        .with_state(node)
}

pub async fn serve(node: Arc<Node>, port: u16) -> Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind admin http on {}", addr))?;
    info!("admin http listening on {}", addr);
    axum::serve(listener, router(node))
        .await
        .context("admin http server failed")?;
    Ok(())
}

fn bad_request(reason: impl Display) -> Response {
    (StatusCode::BAD_REQUEST, reason.to_string()).into_response()
}

async fn blocks(State(node): State<Arc<Node>>) -> Response {
    Json(node.ledger.lock().await.blocks().to_vec()).into_response()
}

async fn last_block(State(node): State<Arc<Node>>) -> Response {
    Json(node.ledger.lock().await.latest_block().clone()).into_response()
}

async fn balance(State(node): State<Arc<Node>>) -> Response {
    let ledger = node.ledger.lock().await;
    Json(wallet::balance(node.wallet.address(), ledger.unspent_tx_outs())).into_response()
}

async fn unspent_tx_outs(State(node): State<Arc<Node>>) -> Response {
    Json(node.ledger.lock().await.unspent_tx_outs().to_vec()).into_response()
}

async fn mine_block(State(node): State<Arc<Node>>) -> Response {
    match miner::mine_next_block(&node).await {
        Ok(block) => Json(block).into_response(),
        Err(e) => bad_request(e),
    }
}

async fn send_tx(
    State(node): State<Arc<Node>>,
    Path((address, amount)): Path<(String, String)>,
) -> Response {
    let amount: f64 = match amount.parse() {
        Ok(amount) => amount,
        Err(e) => return bad_request(e),
    };
    match node.send_transaction(&address, amount).await {
        Ok(tx) => Json(tx).into_response(),
        Err(e) => bad_request(e),
    }
}

async fn send_coins(
    State(node): State<Arc<Node>>,
    Path((address, amount)): Path<(String, String)>,
) -> Response {
    let amount: f64 = match amount.parse() {
        Ok(amount) => amount,
        Err(e) => return bad_request(e),
    };
    match miner::mine_with_transaction(&node, &address, amount).await {
        Ok(block) => Json(block).into_response(),
        Err(e) => bad_request(e),
    }
}

async fn add_peer(
    State(node): State<Arc<Node>>,
    Path(peer_address): Path<String>,
) -> Response {
    match p2p::connect(node.clone(), &peer_address).await {
        Ok(()) => Json("success").into_response(),
        Err(e) => bad_request(e),
    }
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(node): State<Arc<Node>>) -> Response {
    ws.on_upgrade(move |socket| ws_session(node, socket))
}

async fn ws_session(node: Arc<Node>, mut socket: WebSocket) {
    let mut updates = node.subscribe_wallet_updates();

    let snapshot = node.wallet_snapshot().await;
    if send_wallet_frame(&mut socket, &snapshot).await.is_err() {
        return;
    }

    loop {
        match updates.recv().await {
            Ok(update) => {
                if send_wallet_frame(&mut socket, &update).await.is_err() {
                    return;
                }
            }
            // a slow client only misses intermediate states
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return,
        }
    }
}

async fn send_wallet_frame(
    socket: &mut WebSocket,
    update: &WalletUpdate,
) -> std::result::Result<(), axum::Error> {
    let frame = serde_json::json!({ "code": "WALLET_INFO", "data": update });
    socket.send(WsMessage::Text(frame.to_string().into())).await
}
