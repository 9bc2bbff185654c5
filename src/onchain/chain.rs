use std::sync::Arc;

use bitcoin::{Block, BlockHash, OutPoint, Transaction, Txid};

use crate::error::NodeError;
use crate::onchain::htlc::FundingUtxo;

/// Read and broadcast access to a Bitcoin full node.
#[tonic::async_trait]
pub trait ChainClient: Send + Sync {
    /// Returns `None` when the output is spent or unknown.
    async fn get_utxo(&self, outpoint: OutPoint) -> Result<Option<FundingUtxo>, NodeError>;

    async fn best_block_hash(&self) -> Result<BlockHash, NodeError>;

    async fn block(&self, hash: BlockHash) -> Result<Block, NodeError>;

    async fn send_raw_transaction(&self, tx: &Transaction) -> Result<Txid, NodeError>;
}

#[tonic::async_trait]
impl<C: ChainClient + ?Sized> ChainClient for Arc<C> {
    async fn get_utxo(&self, outpoint: OutPoint) -> Result<Option<FundingUtxo>, NodeError> {
        (**self).get_utxo(outpoint).await
    }

    async fn best_block_hash(&self) -> Result<BlockHash, NodeError> {
        (**self).best_block_hash().await
    }

    async fn block(&self, hash: BlockHash) -> Result<Block, NodeError> {
        (**self).block(hash).await
    }

    async fn send_raw_transaction(&self, tx: &Transaction) -> Result<Txid, NodeError> {
        (**self).send_raw_transaction(tx).await
    }
}
