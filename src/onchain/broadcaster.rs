use bitcoin::{Transaction, Txid};

use crate::error::{NodeError, SwapError};
use crate::onchain::chain::ChainClient;

/// Submits signed transactions. Rejections are returned to the caller as-is and
/// never retried here.
#[derive(Debug, Clone)]
pub struct Broadcaster<C> {
    chain: C,
}

impl<C: ChainClient> Broadcaster<C> {
    pub fn new(chain: C) -> Self {
        Self { chain }
    }

    pub async fn broadcast(&self, tx: &Transaction) -> Result<Txid, SwapError> {
        let local_txid = tx.compute_txid();

        let txid = self
            .chain
            .send_raw_transaction(tx)
            .await
            .map_err(|e| match e {
                NodeError::Rejected(reason) => SwapError::BroadcastRejected(reason),
                NodeError::Unavailable(source) => SwapError::unavailable("bitcoin node", source),
            })?;

        if txid != local_txid {
            tracing::warn!(%txid, %local_txid, "node reported a different txid than computed locally");
        }
        tracing::info!(%txid, "broadcast transaction");

        Ok(txid)
    }
}
