use std::future::Future;
use std::time::Duration;

use bitcoin::hashes::Hash as _;
use bitcoin::{Block, BlockHash, OutPoint, Script, Txid, Witness};

use crate::error::{NodeError, SwapError};
use crate::onchain::chain::ChainClient;
use crate::onchain::htlc::{HTLC_SELECTOR_INDEX, HTLC_SPEND_WITNESS_LEN, HtlcSpec};
use crate::swap::secret::Preimage;

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub poll_interval: Duration,
    /// How far back from a new tip the watcher walks to find the last block it saw.
    pub max_catch_up_blocks: usize,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_catch_up_blocks: 100,
            retry_base_delay: Duration::from_millis(200),
            retry_max_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HtlcWatch {
    pub outpoint: OutPoint,
    pub spec: HtlcSpec,
    /// Tip read before the funding broadcast; scanning resumes after it.
    /// `None` starts from whatever the tip is when watching begins.
    pub start_block: Option<BlockHash>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HtlcSpend {
    /// Hash branch: the counterparty revealed the preimage.
    Redeemed { txid: Txid, preimage: Preimage },
    /// Timeout branch.
    Refunded { txid: Txid },
    /// The selector hashes to the payment hash but is not a 32-byte preimage, so
    /// the counterparty holds the coins and the invoice cannot be settled.
    UnusableSecret { txid: Txid, len: usize },
}

impl HtlcSpend {
    pub fn txid(&self) -> Txid {
        match self {
            Self::Redeemed { txid, .. }
            | Self::Refunded { txid }
            | Self::UnusableSecret { txid, .. } => *txid,
        }
    }
}

/// Polls the chain tip until the watched HTLC output is spent.
///
/// Reorganisations are not tracked: a spend seen in a block that is later
/// reorganised out is still reported.
#[derive(Debug, Clone)]
pub struct ChainWatcher<C> {
    chain: C,
    config: WatcherConfig,
}

impl<C: ChainClient> ChainWatcher<C> {
    pub fn new(chain: C, config: WatcherConfig) -> Self {
        Self { chain, config }
    }

    /// Waits without a deadline; wrap it in a timeout or drop the future to stop it.
    pub async fn await_spend(&self, watch: &HtlcWatch) -> Result<HtlcSpend, SwapError> {
        let witness_script = watch.spec.witness_script();

        let mut last_seen = match watch.start_block {
            Some(hash) => hash,
            None => {
                self.with_retry("getbestblockhash", || self.chain.best_block_hash())
                    .await
            }
        };
        tracing::info!(outpoint = %watch.outpoint, tip = %last_seen, "watching htlc output");

        loop {
            tokio::time::sleep(self.config.poll_interval).await;

            let best = self
                .with_retry("getbestblockhash", || self.chain.best_block_hash())
                .await;
            if best == last_seen {
                continue;
            }

            let blocks = self.blocks_since(best, last_seen).await;
            last_seen = best;

            for block in &blocks {
                tracing::debug!(block = %block.block_hash(), txs = block.txdata.len(), "scanning block");
                if let Some(spend) = scan_block(block, watch, &witness_script)? {
                    tracing::info!(outpoint = %watch.outpoint, txid = %spend.txid(), "htlc output spent");
                    return Ok(spend);
                }
            }
        }
    }

    /// Blocks from just after `last_seen` up to `tip`, oldest first.
    async fn blocks_since(&self, tip: BlockHash, last_seen: BlockHash) -> Vec<Block> {
        let mut blocks = Vec::new();
        let mut hash = tip;

        loop {
            let block = self.with_retry("getblock", || self.chain.block(hash)).await;
            let prev = block.header.prev_blockhash;
            blocks.push(block);

            if prev == last_seen || prev == BlockHash::all_zeros() {
                break;
            }
            if blocks.len() >= self.config.max_catch_up_blocks {
                tracing::warn!(
                    %tip,
                    %last_seen,
                    scanned = blocks.len(),
                    "last seen block not found behind new tip; possible reorganisation"
                );
                break;
            }
            hash = prev;
        }

        blocks.reverse();
        blocks
    }

    /// Chain reads have no side effects, so they are retried until they succeed.
    async fn with_retry<T, F, Fut>(&self, label: &'static str, mut f: F) -> T
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, NodeError>>,
    {
        let mut delay = self.config.retry_base_delay;
        let mut attempt: u32 = 0;

        loop {
            match f().await {
                Ok(value) => return value,
                Err(err) => {
                    attempt = attempt.saturating_add(1);
                    tracing::warn!(attempt, error = %err, "{label} failed; retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.config.retry_max_delay);
                }
            }
        }
    }
}

/// Looks for an input spending the watched outpoint. Inputs spending any other
/// outpoint are ignored.
pub fn scan_block(
    block: &Block,
    watch: &HtlcWatch,
    witness_script: &Script,
) -> Result<Option<HtlcSpend>, SwapError> {
    for tx in &block.txdata {
        if let Some(input) = tx
            .input
            .iter()
            .find(|input| input.previous_output == watch.outpoint)
        {
            let spend = classify_spend(
                tx.compute_txid(),
                &input.witness,
                watch.outpoint,
                &watch.spec,
                witness_script,
            )?;
            return Ok(Some(spend));
        }
    }
    Ok(None)
}

/// Decides which branch an HTLC spend took from its witness
/// `[signature, pubkey, selector, witness_script]`.
///
/// The selector is hashed before its length is looked at. A selector hashing to
/// the payment hash means the hash branch ran; if it is not 32 bytes long it
/// cannot settle the invoice and is reported as [`HtlcSpend::UnusableSecret`].
/// Only a selector that does not hash to the payment hash means a refund.
/// Any other witness shape is reported as [`SwapError::AmbiguousSpend`].
pub fn classify_spend(
    txid: Txid,
    witness: &Witness,
    outpoint: OutPoint,
    spec: &HtlcSpec,
    witness_script: &Script,
) -> Result<HtlcSpend, SwapError> {
    let ambiguous = |reason: String| SwapError::AmbiguousSpend {
        outpoint,
        txid,
        reason,
    };

    if witness.len() != HTLC_SPEND_WITNESS_LEN {
        return Err(ambiguous(format!(
            "expected {HTLC_SPEND_WITNESS_LEN} witness elements, got {}",
            witness.len()
        )));
    }
    if witness.last() != Some(witness_script.as_bytes()) {
        return Err(ambiguous(
            "witness script does not match the htlc".to_string(),
        ));
    }

    let selector = witness
        .nth(HTLC_SELECTOR_INDEX)
        .ok_or_else(|| ambiguous("missing branch selector".to_string()))?;

    if !spec.payment_hash.is_hash_of(selector) {
        return Ok(HtlcSpend::Refunded { txid });
    }
    match Preimage::from_slice(selector) {
        Ok(preimage) => Ok(HtlcSpend::Redeemed { txid, preimage }),
        Err(_) => Ok(HtlcSpend::UnusableSecret {
            txid,
            len: selector.len(),
        }),
    }
}
