use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use bitcoin::block::{Header, Version as BlockVersion};
use bitcoin::hashes::Hash as _;
use bitcoin::{
    Block, BlockHash, CompactTarget, OutPoint, Transaction, TxMerkleNode, Txid,
};
use ln_loop_out::error::NodeError;
use ln_loop_out::onchain::chain::ChainClient;
use ln_loop_out::onchain::htlc::FundingUtxo;

/// In-memory chain: a UTXO set, a list of blocks and a broadcast log.
#[derive(Clone)]
pub struct FakeChain {
    state: Arc<Mutex<ChainState>>,
}

struct ChainState {
    utxos: HashMap<OutPoint, FundingUtxo>,
    blocks: Vec<Block>,
    broadcasts: Vec<Transaction>,
    broadcast_rejection: Option<String>,
    failing_reads: u32,
    failed_reads: u32,
    tip_polls: u32,
}

impl Default for FakeChain {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeChain {
    pub fn new() -> Self {
        let chain = Self {
            state: Arc::new(Mutex::new(ChainState {
                utxos: HashMap::new(),
                blocks: Vec::new(),
                broadcasts: Vec::new(),
                broadcast_rejection: None,
                failing_reads: 0,
                failed_reads: 0,
                tip_polls: 0,
            })),
        };
        chain.mine(Vec::new());
        chain
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChainState> {
        self.state.lock().expect("chain state poisoned")
    }

    pub fn add_utxo(&self, utxo: FundingUtxo) {
        self.lock().utxos.insert(utxo.outpoint, utxo);
    }

    /// Appends a block with `txdata` on top of the current tip.
    pub fn mine(&self, txdata: Vec<Transaction>) -> BlockHash {
        let mut state = self.lock();
        let height = state.blocks.len() as u32;
        let prev_blockhash = state
            .blocks
            .last()
            .map(Block::block_hash)
            .unwrap_or_else(BlockHash::all_zeros);

        for tx in &txdata {
            for input in &tx.input {
                state.utxos.remove(&input.previous_output);
            }
        }

        let block = Block {
            header: Header {
                version: BlockVersion::TWO,
                prev_blockhash,
                merkle_root: TxMerkleNode::all_zeros(),
                time: 1_700_000_000 + height,
                bits: CompactTarget::from_consensus(0x207f_ffff),
                nonce: height,
            },
            txdata,
        };
        let hash = block.block_hash();
        state.blocks.push(block);
        hash
    }

    pub fn broadcasts(&self) -> Vec<Transaction> {
        self.lock().broadcasts.clone()
    }

    pub fn reject_broadcasts(&self, reason: &str) {
        self.lock().broadcast_rejection = Some(reason.to_string());
    }

    /// Makes the next `n` chain reads fail as if the node were unreachable.
    pub fn fail_next_reads(&self, n: u32) {
        self.lock().failing_reads = n;
    }

    pub fn failed_reads(&self) -> u32 {
        self.lock().failed_reads
    }

    pub fn tip_polls(&self) -> u32 {
        self.lock().tip_polls
    }

    fn check_read(state: &mut ChainState) -> Result<(), NodeError> {
        if state.failing_reads > 0 {
            state.failing_reads -= 1;
            state.failed_reads += 1;
            return Err(NodeError::Unavailable(anyhow!("connection refused")));
        }
        Ok(())
    }
}

#[tonic::async_trait]
impl ChainClient for FakeChain {
    async fn get_utxo(&self, outpoint: OutPoint) -> Result<Option<FundingUtxo>, NodeError> {
        Ok(self.lock().utxos.get(&outpoint).cloned())
    }

    async fn best_block_hash(&self) -> Result<BlockHash, NodeError> {
        let mut state = self.lock();
        state.tip_polls += 1;
        Self::check_read(&mut state)?;
        state
            .blocks
            .last()
            .map(Block::block_hash)
            .ok_or_else(|| NodeError::Rejected("empty chain".to_string()))
    }

    async fn block(&self, hash: BlockHash) -> Result<Block, NodeError> {
        let mut state = self.lock();
        Self::check_read(&mut state)?;
        state
            .blocks
            .iter()
            .find(|block| block.block_hash() == hash)
            .cloned()
            .ok_or_else(|| NodeError::Rejected(format!("block {hash} not found")))
    }

    async fn send_raw_transaction(&self, tx: &Transaction) -> Result<Txid, NodeError> {
        let mut state = self.lock();
        if let Some(reason) = &state.broadcast_rejection {
            return Err(NodeError::Rejected(reason.clone()));
        }
        state.broadcasts.push(tx.clone());
        Ok(tx.compute_txid())
    }
}
