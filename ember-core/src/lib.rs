pub mod blockchain;
pub mod crypto;
pub mod error;
pub mod network;
#[cfg(test)]
pub(crate) mod testutil;
pub mod transactions;
pub mod txpool;
pub mod wallet;

/// Target number of seconds between blocks.
pub const BLOCK_GENERATION_INTERVAL: u64 = 10;

/// Difficulty is re-evaluated every this many blocks.
pub const DIFFICULTY_ADJUSTMENT_INTERVAL: u64 = 10;

/// Fixed reward minted by every coinbase transaction.
pub const COINBASE_AMOUNT: f64 = 50.0;

/// Blocks may not be timestamped more than this many seconds before their
/// parent or after the local clock.
pub const TIMESTAMP_SLACK: u64 = 60;

pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024; // 10 MB
