use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::blockchain::Block;
use crate::error::{Error, Result};
use crate::transactions::Transaction;
use crate::MAX_MESSAGE_SIZE;

/// A peer frame. On the wire this is `{"code": ..., "data": ...}`, carried
/// inside an 8-byte big-endian length prefix.
///
/// A `Blockchain` payload of length one is a tip announcement; longer
/// payloads are full chains offered for fork resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "code", content = "data")]
pub enum Message {
    #[serde(rename = "GET_LATEST_BLOCK")]
    GetLatestBlock,
    #[serde(rename = "GET_ALL_BLOCKS")]
    GetAllBlocks,
    #[serde(rename = "GET_TX_POOL")]
    GetTxPool,
    #[serde(rename = "BLOCKCHAIN")]
    Blockchain(Vec<Block>),
    #[serde(rename = "TX_POOL")]
    TxPool(Vec<Transaction>),
}

impl Message {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    pub async fn send_async(&self, stream: &mut (impl AsyncWrite + Unpin)) -> Result<()> {
        let bytes = self.encode()?;
        let len = bytes.len() as u64;
        stream.write_all(&len.to_be_bytes()).await?;
        stream.write_all(&bytes).await?;
        Ok(())
    }

    pub async fn receive_async(stream: &mut (impl AsyncRead + Unpin)) -> Result<Self> {
        let mut len_bytes = [0u8; 8];
        stream.read_exact(&mut len_bytes).await?;
        let len = u64::from_be_bytes(len_bytes) as usize;

        if len > MAX_MESSAGE_SIZE {
            return Err(Error::Transport(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds the {} byte cap", len, MAX_MESSAGE_SIZE),
            )));
        }

        let mut data = vec![0u8; len];
        stream.read_exact(&mut data).await?;
        Self::decode(&data)
    }
}
