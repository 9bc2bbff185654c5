use std::sync::Arc;

use anyhow::{Context as _, Result};
use bitcoin::{Block, BlockHash, OutPoint, ScriptBuf, Transaction, Txid};
use bitcoincore_rpc::{Auth, Client, RpcApi as _};

use crate::error::NodeError;
use crate::onchain::chain::ChainClient;
use crate::onchain::htlc::FundingUtxo;

/// [`ChainClient`] backed by Bitcoin Core's JSON-RPC interface.
///
/// `bitcoincore-rpc` is blocking, so every call runs on the blocking thread pool.
#[derive(Clone)]
pub struct BitcoindClient {
    client: Arc<Client>,
}

impl BitcoindClient {
    pub fn new(rpc_url: &str, rpc_user: &str, rpc_password: &str) -> Result<Self> {
        let auth = Auth::UserPass(rpc_user.to_string(), rpc_password.to_string());
        let client = Client::new(rpc_url, auth)
            .with_context(|| format!("create bitcoind rpc client for {rpc_url}"))?;
        Ok(Self {
            client: Arc::new(client),
        })
    }

    async fn call<T, F>(&self, label: &'static str, f: F) -> Result<T, NodeError>
    where
        T: Send + 'static,
        F: FnOnce(&Client) -> bitcoincore_rpc::Result<T> + Send + 'static,
    {
        let client = self.client.clone();
        tokio::task::spawn_blocking(move || f(&client))
            .await
            .map_err(|e| NodeError::Unavailable(anyhow::anyhow!("join {label}: {e}")))?
            .map_err(|e| classify_rpc_error(label, e))
    }
}

fn classify_rpc_error(label: &'static str, err: bitcoincore_rpc::Error) -> NodeError {
    match err {
        bitcoincore_rpc::Error::JsonRpc(bitcoincore_rpc::jsonrpc::Error::Rpc(rpc)) => {
            NodeError::Rejected(format!("{label}: {} (code {})", rpc.message, rpc.code))
        }
        other => NodeError::Unavailable(anyhow::Error::new(other).context(label)),
    }
}

#[tonic::async_trait]
impl ChainClient for BitcoindClient {
    async fn get_utxo(&self, outpoint: OutPoint) -> Result<Option<FundingUtxo>, NodeError> {
        let out = self
            .call("gettxout", move |c| {
                c.get_tx_out(&outpoint.txid, outpoint.vout, Some(true))
            })
            .await?;

        Ok(out.map(|out| FundingUtxo {
            outpoint,
            value: out.value,
            script_pubkey: ScriptBuf::from(out.script_pub_key.hex),
        }))
    }

    async fn best_block_hash(&self) -> Result<BlockHash, NodeError> {
        self.call("getbestblockhash", |c| c.get_best_block_hash())
            .await
    }

    async fn block(&self, hash: BlockHash) -> Result<Block, NodeError> {
        self.call("getblock", move |c| c.get_block(&hash)).await
    }

    async fn send_raw_transaction(&self, tx: &Transaction) -> Result<Txid, NodeError> {
        let tx = tx.clone();
        self.call("sendrawtransaction", move |c| c.send_raw_transaction(&tx))
            .await
    }
}
