use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::crypto;
use crate::error::{Error, Result};
use crate::transactions::{process_transactions, Transaction, UnspentTxOut};
use crate::txpool::TransactionPool;
use crate::{
    BLOCK_GENERATION_INTERVAL, COINBASE_AMOUNT, DIFFICULTY_ADJUSTMENT_INTERVAL, TIMESTAMP_SLACK,
};

pub const GENESIS_ADDRESS: &str =
    "S7H2fmjGPxznuu9NPcnYCyEqdg1ebSbMN6AJRqQQo4Z1D1yQdKwEGwiJezSDka6yqHDSb2jqaf3Tewg1tryEbDzG";
pub const GENESIS_TX_ID: &str =
    "62530d1bbbf4f75200448207cbc3c84b4b67fe7a85eddf6f5c3e4bbac4461b82";
pub const GENESIS_BLOCK_HASH: &str =
    "fbf56e4cc6a37936341c07f2d452ee01c93a1bb30d0bfe219d3d2af1cf38f78b";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub index: u64,
    pub prev_hash: String,
    pub ts: u64,
    pub transactions: Vec<Transaction>,
    pub difficulty: u32,
    pub nonce: u64,
    pub hash: String,
}

fn render_transaction(tx: &Transaction) -> String {
    let ins: Vec<String> = tx
        .tx_ins
        .iter()
        .map(|i| format!("{{{} {} {}}}", i.tx_out_id, i.tx_out_index, i.signature))
        .collect();
    let outs: Vec<String> = tx
        .tx_outs
        .iter()
        .map(|o| format!("{{{} {}}}", o.address, o.amount))
        .collect();
    format!("{{{} [{}] [{}]}}", tx.id, ins.join(" "), outs.join(" "))
}

/// The canonical header string hashed into `block.hash`. This rendering is
/// part of the wire contract: nodes that disagree on it will not agree on
/// block hashes. The hard-coded genesis digests pin it down.
pub fn header_content(
    index: u64,
    prev_hash: &str,
    ts: u64,
    transactions: &[Transaction],
    difficulty: u32,
    nonce: u64,
) -> String {
    let txs: Vec<String> = transactions.iter().map(render_transaction).collect();
    format!(
        "{{{} {} {} [{}] {} {}}}",
        index,
        prev_hash,
        ts,
        txs.join(" "),
        difficulty,
        nonce
    )
}

impl Block {
    pub fn compute_hash(&self) -> String {
        crypto::hash(&header_content(
            self.index,
            &self.prev_hash,
            self.ts,
            &self.transactions,
            self.difficulty,
            self.nonce,
        ))
    }
}

pub fn genesis_block() -> Block {
    use crate::transactions::{TxIn, TxOut};
    let genesis_tx = Transaction {
        id: GENESIS_TX_ID.to_string(),
        tx_ins: vec![TxIn {
            tx_out_id: String::new(),
            tx_out_index: 0,
            signature: String::new(),
        }],
        tx_outs: vec![TxOut {
            address: GENESIS_ADDRESS.to_string(),
            amount: COINBASE_AMOUNT,
        }],
    };
    Block {
        index: 0,
        prev_hash: String::new(),
        ts: 0,
        transactions: vec![genesis_tx],
        difficulty: 0,
        nonce: 0,
        hash: GENESIS_BLOCK_HASH.to_string(),
    }
}

/// Difficulty required of the block that extends `prev` in chain `chain`.
/// Every `DIFFICULTY_ADJUSTMENT_INTERVAL` blocks the elapsed time over the
/// closing window is compared against the target cadence.
pub fn required_difficulty(chain: &[Block], prev: &Block) -> u32 {
    if prev.index > 0 && (prev.index + 1) % DIFFICULTY_ADJUSTMENT_INTERVAL == 0 {
        adjusted_difficulty(chain, prev)
    } else {
        prev.difficulty
    }
}

fn adjusted_difficulty(chain: &[Block], prev: &Block) -> u32 {
    let anchor = &chain[(prev.index + 1 - DIFFICULTY_ADJUSTMENT_INTERVAL) as usize];
    let expected = BLOCK_GENERATION_INTERVAL * DIFFICULTY_ADJUSTMENT_INTERVAL;
    let elapsed = prev.ts.saturating_sub(anchor.ts);

    if elapsed < expected / 2 {
        anchor.difficulty + 1
    } else if elapsed > expected * 2 {
        // floors at zero; difficulty never goes negative
        anchor.difficulty.saturating_sub(1)
    } else {
        anchor.difficulty
    }
}

/// Validates `block` against its predecessor `prev` within `chain`.
/// `now` is the local clock in Unix seconds.
pub fn is_valid_block(chain: &[Block], prev: &Block, block: &Block, now: u64) -> Result<()> {
    if block.index != prev.index + 1 {
        return Err(Error::InvalidBlock(format!(
            "index {} is not a successor of {}",
            block.index, prev.index
        )));
    }
    if block.prev_hash != prev.hash {
        return Err(Error::InvalidBlock(
            "prevHash does not match the parent hash".into(),
        ));
    }
    if block.compute_hash() != block.hash {
        return Err(Error::InvalidBlock(format!(
            "declared hash {} does not match the header",
            block.hash
        )));
    }
    // genesis carries a synthetic timestamp, so its successor is exempt
    if prev.index != 0 {
        if block.ts + TIMESTAMP_SLACK <= prev.ts {
            return Err(Error::InvalidBlock(format!(
                "timestamp {} is too far before the parent's {}",
                block.ts, prev.ts
            )));
        }
        if block.ts >= now + TIMESTAMP_SLACK {
            return Err(Error::InvalidBlock(format!(
                "timestamp {} is too far in the future",
                block.ts
            )));
        }
    }
    let required = required_difficulty(chain, prev);
    if block.difficulty != required {
        return Err(Error::InvalidBlock(format!(
            "difficulty {} does not match required {}",
            block.difficulty, required
        )));
    }
    if !crypto::hash_matches_difficulty(&block.hash, block.difficulty) {
        return Err(Error::InvalidBlock(format!(
            "hash {} does not satisfy difficulty {}",
            block.hash, block.difficulty
        )));
    }
    Ok(())
}

/// `Σ 2^difficulty` over the chain, the fork-choice metric.
pub fn cumulative_difficulty(chain: &[Block]) -> u64 {
    chain
        .iter()
        .fold(0u64, |acc, b| acc.saturating_add(difficulty_weight(b)))
}

fn difficulty_weight(block: &Block) -> u64 {
    1u64.checked_shl(block.difficulty).unwrap_or(u64::MAX)
}

/// Validates a whole candidate chain: verbatim genesis, every link valid,
/// and a clean UTXO replay from empty. Returns the terminal UTXO set.
pub fn is_valid_chain(chain: &[Block], now: u64) -> Result<Vec<UnspentTxOut>> {
    if chain.first() != Some(&genesis_block()) {
        return Err(Error::InvalidChain(
            "chain does not start with the genesis block".into(),
        ));
    }

    let mut unspent_tx_outs: Vec<UnspentTxOut> = Vec::new();
    for n in 0..chain.len() {
        if n != 0 {
            is_valid_block(chain, &chain[n - 1], &chain[n], now)
                .map_err(|e| Error::InvalidChain(e.to_string()))?;
        }
        unspent_tx_outs =
            process_transactions(&chain[n].transactions, &unspent_tx_outs, chain[n].index)
                .map_err(|e| Error::InvalidChain(e.to_string()))?;
    }
    Ok(unspent_tx_outs)
}

/// Scans `steps` nonces starting at `start_nonce` for a header satisfying
/// the difficulty. Bounded so the caller can interleave interruption checks.
pub fn find_block(
    index: u64,
    prev_hash: &str,
    ts: u64,
    transactions: &[Transaction],
    difficulty: u32,
    start_nonce: u64,
    steps: u64,
) -> Option<Block> {
    let mut nonce = start_nonce;
    for _ in 0..steps {
        let hash = crypto::hash(&header_content(
            index,
            prev_hash,
            ts,
            transactions,
            difficulty,
            nonce,
        ));
        if crypto::hash_matches_difficulty(&hash, difficulty) {
            return Some(Block {
                index,
                prev_hash: prev_hash.to_string(),
                ts,
                transactions: transactions.to_vec(),
                difficulty,
                nonce,
                hash,
            });
        }
        nonce = nonce.wrapping_add(1);
    }
    None
}

/// The consensus state: the chain, its derived UTXO set, the transaction
/// pool and the cached cumulative difficulty. One instance lives behind one
/// lock; external observers never see a chain whose tip does not match the
/// UTXO set.
#[derive(Debug, Clone)]
pub struct Ledger {
    blocks: Vec<Block>,
    unspent_tx_outs: Vec<UnspentTxOut>,
    pool: TransactionPool,
    cumulative_difficulty: u64,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl Ledger {
    pub fn new() -> Self {
        let genesis = genesis_block();
        let unspent_tx_outs = process_transactions(&genesis.transactions, &[], 0)
            .expect("genesis transactions must process");
        let cumulative_difficulty = difficulty_weight(&genesis);
        Ledger {
            blocks: vec![genesis],
            unspent_tx_outs,
            pool: TransactionPool::new(),
            cumulative_difficulty,
        }
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn latest_block(&self) -> &Block {
        self.blocks.last().expect("chain always holds genesis")
    }

    pub fn unspent_tx_outs(&self) -> &[UnspentTxOut] {
        &self.unspent_tx_outs
    }

    pub fn pool(&self) -> &TransactionPool {
        &self.pool
    }

    pub fn cumulative_difficulty(&self) -> u64 {
        self.cumulative_difficulty
    }

    pub fn next_difficulty(&self) -> u32 {
        required_difficulty(&self.blocks, self.latest_block())
    }

    pub fn add_to_pool(&mut self, tx: Transaction) -> Result<()> {
        self.pool.add(tx, &self.unspent_tx_outs)
    }

    /// Appends a block extending the current tip. On success the UTXO set
    /// advances, the cumulative difficulty grows and stale pool entries are
    /// dropped, all atomically from the caller's point of view.
    pub fn add_block(&mut self, block: Block, now: u64) -> Result<()> {
        is_valid_block(&self.blocks, self.latest_block(), &block, now)?;
        let next = process_transactions(&block.transactions, &self.unspent_tx_outs, block.index)?;

        self.cumulative_difficulty = self
            .cumulative_difficulty
            .saturating_add(difficulty_weight(&block));
        info!(
            "block {} accepted at height {}, cumulative difficulty {}",
            block.hash, block.index, self.cumulative_difficulty
        );
        self.blocks.push(block);
        self.unspent_tx_outs = next;
        self.pool.refresh(&self.unspent_tx_outs);
        Ok(())
    }

    /// Fork choice: adopts `candidate` iff it is valid and has strictly
    /// greater cumulative difficulty. Ties keep the local chain.
    pub fn replace_chain(&mut self, candidate: Vec<Block>, now: u64) -> Result<()> {
        let unspent_tx_outs = is_valid_chain(&candidate, now)?;
        let candidate_difficulty = cumulative_difficulty(&candidate);
        if candidate_difficulty <= self.cumulative_difficulty {
            warn!(
                "received chain has cumulative difficulty {} <= local {}, keeping local chain",
                candidate_difficulty, self.cumulative_difficulty
            );
            return Err(Error::InvalidChain(format!(
                "cumulative difficulty {} does not exceed local {}",
                candidate_difficulty, self.cumulative_difficulty
            )));
        }

        info!(
            "replacing local chain (height {}, difficulty {}) with received chain (height {}, difficulty {})",
            self.latest_block().index,
            self.cumulative_difficulty,
            candidate.last().map(|b| b.index).unwrap_or(0),
            candidate_difficulty
        );
        self.blocks = candidate;
        self.unspent_tx_outs = unspent_tx_outs;
        self.cumulative_difficulty = candidate_difficulty;
        self.pool.refresh(&self.unspent_tx_outs);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{signed_transfer, test_wallet};
    use crate::transactions::{coinbase_transaction, find_unspent_tx_out, transaction_id, TxOut};

    fn now() -> u64 {
        chrono::Utc::now().timestamp() as u64
    }

    /// Mines a difficulty-0 block on top of the ledger's tip.
    fn mine_next(ledger: &Ledger, transactions: Vec<Transaction>, ts: u64) -> Block {
        let tip = ledger.latest_block();
        find_block(
            tip.index + 1,
            &tip.hash,
            ts,
            &transactions,
            ledger.next_difficulty(),
            0,
            u64::MAX,
        )
        .expect("difficulty 0 block must be found immediately")
    }

    #[test]
    fn genesis_digests_match_the_canonical_serialization() {
        let genesis = genesis_block();
        assert_eq!(genesis.compute_hash(), GENESIS_BLOCK_HASH);
        assert_eq!(transaction_id(&genesis.transactions[0]), GENESIS_TX_ID);
    }

    #[test]
    fn fresh_ledger_holds_the_genesis_reward() {
        let ledger = Ledger::new();
        assert_eq!(ledger.blocks().len(), 1);
        assert_eq!(ledger.unspent_tx_outs().len(), 1);
        assert_eq!(ledger.unspent_tx_outs()[0].address, GENESIS_ADDRESS);
        assert_eq!(ledger.unspent_tx_outs()[0].amount, COINBASE_AMOUNT);
        assert_eq!(ledger.cumulative_difficulty(), 1);
    }

    #[test]
    fn mined_block_extends_the_chain() {
        let mut ledger = Ledger::new();
        let wallet = test_wallet();
        let block = mine_next(
            &ledger,
            vec![coinbase_transaction(&wallet.address, 1)],
            now(),
        );
        assert_eq!(block.difficulty, 0);
        ledger.add_block(block, now()).unwrap();

        assert_eq!(ledger.blocks().len(), 2);
        assert_eq!(ledger.cumulative_difficulty(), 2);
        let total: f64 = ledger.unspent_tx_outs().iter().map(|u| u.amount).sum();
        assert_eq!(total, COINBASE_AMOUNT * 2.0);
    }

    #[test]
    fn tampered_header_fields_are_rejected() {
        let mut ledger = Ledger::new();
        let wallet = test_wallet();
        let block = mine_next(
            &ledger,
            vec![coinbase_transaction(&wallet.address, 1)],
            now(),
        );

        let mut wrong_index = block.clone();
        wrong_index.index = 5;
        assert!(ledger.add_block(wrong_index, now()).is_err());

        let mut wrong_prev = block.clone();
        wrong_prev.prev_hash = crypto::hash("bogus");
        assert!(ledger.add_block(wrong_prev, now()).is_err());

        let mut wrong_nonce = block.clone();
        wrong_nonce.nonce += 1; // hash no longer matches the header
        assert!(ledger.add_block(wrong_nonce, now()).is_err());

        ledger.add_block(block, now()).unwrap();
    }

    #[test]
    fn timestamp_window_boundaries() {
        let mut ledger = Ledger::new();
        let wallet = test_wallet();
        let t = now();

        // child of genesis is exempt from the window rule
        let first = mine_next(
            &ledger,
            vec![coinbase_transaction(&wallet.address, 1)],
            t - 1000,
        );
        ledger.add_block(first, t).unwrap();

        let parent_ts = ledger.latest_block().ts;
        let candidate = |ts| {
            mine_next(
                &ledger,
                vec![coinbase_transaction(&wallet.address, 2)],
                ts,
            )
        };

        // exclusive lower bound at parent.ts - 60
        assert!(ledger
            .clone()
            .add_block(candidate(parent_ts - TIMESTAMP_SLACK), t)
            .is_err());
        assert!(ledger
            .clone()
            .add_block(candidate(parent_ts - TIMESTAMP_SLACK + 1), t)
            .is_ok());

        // exclusive upper bound at now + 60
        assert!(ledger
            .clone()
            .add_block(candidate(t + TIMESTAMP_SLACK), t)
            .is_err());
        assert!(ledger
            .clone()
            .add_block(candidate(t + TIMESTAMP_SLACK - 1), t)
            .is_ok());
    }

    /// Builds a synthetic chain of `len` headers for retarget arithmetic.
    /// Only index, ts and difficulty are read by `required_difficulty`.
    fn retarget_chain(len: u64, last_ts: u64, difficulty: u32) -> Vec<Block> {
        (0..len)
            .map(|i| Block {
                index: i,
                prev_hash: String::new(),
                ts: if i + 1 == len { last_ts } else { 0 },
                transactions: vec![],
                difficulty,
                nonce: 0,
                hash: String::new(),
            })
            .collect()
    }

    #[test]
    fn difficulty_retarget_thresholds() {
        let expected = BLOCK_GENERATION_INTERVAL * DIFFICULTY_ADJUSTMENT_INTERVAL;

        // prev.index = 9 closes the first window, anchored at the genesis
        let exactly_half = retarget_chain(10, expected / 2, 3);
        assert_eq!(required_difficulty(&exactly_half, &exactly_half[9]), 3);

        let below_half = retarget_chain(10, expected / 2 - 1, 3);
        assert_eq!(required_difficulty(&below_half, &below_half[9]), 4);

        let exactly_double = retarget_chain(10, expected * 2, 3);
        assert_eq!(required_difficulty(&exactly_double, &exactly_double[9]), 3);

        let above_double = retarget_chain(10, expected * 2 + 1, 3);
        assert_eq!(required_difficulty(&above_double, &above_double[9]), 2);

        // decrease floors at zero
        let floored = retarget_chain(10, expected * 2 + 1, 0);
        assert_eq!(required_difficulty(&floored, &floored[9]), 0);

        // off-boundary heights keep the parent's difficulty
        let off_boundary = retarget_chain(9, expected, 3);
        assert_eq!(required_difficulty(&off_boundary, &off_boundary[8]), 3);
    }

    #[test]
    fn chain_with_spend_replays_cleanly() {
        let mut ledger = Ledger::new();
        let wallet = test_wallet();
        let recipient = test_wallet();

        let block1 = mine_next(
            &ledger,
            vec![coinbase_transaction(&wallet.address, 1)],
            now(),
        );
        let reward_id = block1.transactions[0].id.clone();
        ledger.add_block(block1, now()).unwrap();

        let reward = find_unspent_tx_out(&reward_id, 0, ledger.unspent_tx_outs())
            .unwrap()
            .clone();
        let transfer = signed_transfer(
            &wallet,
            &reward,
            vec![
                TxOut {
                    address: recipient.address.clone(),
                    amount: 30.0,
                },
                TxOut {
                    address: wallet.address.clone(),
                    amount: 20.0,
                },
            ],
        );
        let block2 = mine_next(
            &ledger,
            vec![coinbase_transaction(&wallet.address, 2), transfer],
            now(),
        );
        ledger.add_block(block2, now()).unwrap();

        let replayed = is_valid_chain(ledger.blocks(), now()).unwrap();
        assert_eq!(replayed.len(), ledger.unspent_tx_outs().len());
        let total: f64 = replayed.iter().map(|u| u.amount).sum();
        assert_eq!(total, COINBASE_AMOUNT * 3.0);
    }

    #[test]
    fn fork_choice_prefers_greater_cumulative_difficulty() {
        let wallet = test_wallet();
        let t = now();

        let mut local = Ledger::new();
        let mut remote = Ledger::new();
        for height in 1..=2 {
            let block = mine_next(
                &local,
                vec![coinbase_transaction(&wallet.address, height)],
                t + height,
            );
            local.add_block(block, now()).unwrap();
        }
        for height in 1..=3 {
            let block = mine_next(
                &remote,
                vec![coinbase_transaction(&wallet.address, height)],
                t + height,
            );
            remote.add_block(block, now()).unwrap();
        }

        // longer (heavier) remote chain wins
        local
            .replace_chain(remote.blocks().to_vec(), now())
            .unwrap();
        assert_eq!(local.blocks().len(), 4);

        // a tie keeps the local chain
        let mut other = Ledger::new();
        for height in 1..=3 {
            let block = mine_next(
                &other,
                vec![coinbase_transaction(&wallet.address, height)],
                t + 30 + height,
            );
            other.add_block(block, now()).unwrap();
        }
        assert_eq!(
            cumulative_difficulty(other.blocks()),
            local.cumulative_difficulty()
        );
        assert!(local.replace_chain(other.blocks().to_vec(), now()).is_err());
        assert_eq!(local.blocks().len(), 4);
    }

    #[test]
    fn tampered_chain_is_rejected_by_replace() {
        let wallet = test_wallet();
        let t = now();

        let mut local = Ledger::new();
        let mut remote = Ledger::new();
        for height in 1..=3 {
            let block = mine_next(
                &remote,
                vec![coinbase_transaction(&wallet.address, height)],
                t + height,
            );
            remote.add_block(block, now()).unwrap();
        }

        let mut tampered = remote.blocks().to_vec();
        tampered[2].ts += 1; // breaks the declared hash
        assert!(local.replace_chain(tampered, now()).is_err());
        assert_eq!(local.blocks().len(), 1);

        let mut bad_genesis = remote.blocks().to_vec();
        bad_genesis[0].nonce = 1;
        assert!(local.replace_chain(bad_genesis, now()).is_err());
    }

    #[test]
    fn pool_is_refreshed_after_chain_updates() {
        let mut ledger = Ledger::new();
        let wallet = test_wallet();

        let block1 = mine_next(
            &ledger,
            vec![coinbase_transaction(&wallet.address, 1)],
            now(),
        );
        let reward_id = block1.transactions[0].id.clone();
        ledger.add_block(block1, now()).unwrap();

        let reward = find_unspent_tx_out(&reward_id, 0, ledger.unspent_tx_outs())
            .unwrap()
            .clone();
        let transfer = signed_transfer(
            &wallet,
            &reward,
            vec![TxOut {
                address: wallet.address.clone(),
                amount: 50.0,
            }],
        );
        ledger.add_to_pool(transfer.clone()).unwrap();
        assert_eq!(ledger.pool().len(), 1);

        // mining the transaction consumes its input; the pool entry goes
        let block2 = mine_next(
            &ledger,
            vec![coinbase_transaction(&wallet.address, 2), transfer],
            now(),
        );
        ledger.add_block(block2, now()).unwrap();
        assert!(ledger.pool().is_empty());
    }
}
