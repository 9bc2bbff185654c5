use std::future::Future;
use std::time::Duration;

use bitcoin::{Amount, Network, OutPoint, PrivateKey, PubkeyHash};
use uuid::Uuid;

use crate::error::{NodeError, SwapError};
use crate::lightning::controller::{DEFAULT_CLTV_EXPIRY, InvoiceController};
use crate::lightning::node::HoldInvoiceNode;
use crate::onchain::broadcaster::Broadcaster;
use crate::onchain::chain::ChainClient;
use crate::onchain::fee::FeePolicy;
use crate::onchain::htlc::{FundingUtxo, HtlcBuilder};
use crate::onchain::watcher::{ChainWatcher, HtlcSpend, HtlcWatch, WatcherConfig};
use crate::swap::abort::AbortSignal;
use crate::swap::secret::PaymentHash;
use crate::swap::{FundsLocation, SwapRecord, SwapStatus};

pub const DEFAULT_CSV_DELAY: u16 = 20;

const STAGE_PREFLIGHT: &str = "checking the swap terms";
const STAGE_PAYMENT: &str = "waiting for the invoice payment";
const STAGE_FUNDING: &str = "funding the htlc";
const STAGE_SPEND: &str = "waiting for the htlc spend";

/// What a single loop-out swap trades.
#[derive(Debug, Clone)]
pub struct SwapParams {
    pub payment_hash: PaymentHash,
    pub amount: Amount,
    pub funding_outpoint: OutPoint,
    pub owner_key: PrivateKey,
    /// Paid by the hash branch of the HTLC.
    pub counterparty_pubkey_hash: PubkeyHash,
    /// Paid by the timeout branch of the HTLC.
    pub refund_pubkey_hash: PubkeyHash,
    pub network: Network,
}

#[derive(Debug, Clone)]
pub struct SwapConfig {
    pub cltv_expiry: u64,
    pub csv_delay: u16,
    pub payment_timeout: Option<Duration>,
    pub spend_timeout: Option<Duration>,
    pub watcher: WatcherConfig,
}

impl Default for SwapConfig {
    fn default() -> Self {
        Self {
            cltv_expiry: DEFAULT_CLTV_EXPIRY,
            csv_delay: DEFAULT_CSV_DELAY,
            payment_timeout: None,
            spend_timeout: None,
            watcher: WatcherConfig::default(),
        }
    }
}

/// A swap that stopped before settling, with the last record so the caller
/// knows where the funds are.
#[derive(Debug, thiserror::Error)]
#[error(
    "swap {} stopped at {:?}: {error}; {}",
    .record.swap_id,
    .record.status,
    .record.funds_location()
)]
pub struct SwapFailure {
    pub error: SwapError,
    pub record: SwapRecord,
}

impl SwapFailure {
    pub fn funds_location(&self) -> FundsLocation {
        self.record.funds_location()
    }
}

/// Drives one loop-out swap from invoice issue to settlement.
///
/// The orchestrator is the only writer of the [`SwapRecord`]; `run` consumes it
/// so a swap cannot be driven twice.
pub struct Orchestrator<N, C, F> {
    params: SwapParams,
    config: SwapConfig,
    invoices: InvoiceController<N>,
    builder: HtlcBuilder<F>,
    chain: C,
    broadcaster: Broadcaster<C>,
    watcher: ChainWatcher<C>,
    abort: AbortSignal,
    record: SwapRecord,
    /// The funding broadcast failed without a definite answer from the node.
    funding_uncertain: bool,
}

impl<N, C, F> Orchestrator<N, C, F>
where
    N: HoldInvoiceNode,
    C: ChainClient + Clone,
    F: FeePolicy,
{
    pub fn new(params: SwapParams, config: SwapConfig, node: N, chain: C, fee_policy: F) -> Self {
        let record = SwapRecord {
            swap_id: Uuid::new_v4().to_string(),
            payment_hash: params.payment_hash.to_string(),
            amount_sats: params.amount.to_sat(),
            funding_outpoint: params.funding_outpoint.to_string(),
            payment_request: None,
            htlc_address: None,
            witness_script_hex: None,
            funding_txid: None,
            htlc_outpoint: None,
            funding_fee_sats: None,
            change_sats: None,
            spend_txid: None,
            preimage_hex: None,
            status: SwapStatus::Open,
            aborted_from: None,
        };

        Self {
            invoices: InvoiceController::new(node, config.cltv_expiry),
            builder: HtlcBuilder::new(config.csv_delay, fee_policy),
            broadcaster: Broadcaster::new(chain.clone()),
            watcher: ChainWatcher::new(chain.clone(), config.watcher.clone()),
            chain,
            params,
            config,
            abort: AbortSignal::never(),
            record,
            funding_uncertain: false,
        }
    }

    pub fn with_abort(mut self, abort: AbortSignal) -> Self {
        self.abort = abort;
        self
    }

    pub fn record(&self) -> &SwapRecord {
        &self.record
    }

    /// Runs the swap to completion. `on_transition` sees the record after every
    /// state change, starting with the initial `Open` snapshot.
    pub async fn run(
        mut self,
        mut on_transition: impl FnMut(&SwapRecord),
    ) -> Result<SwapRecord, SwapFailure> {
        tracing::info!(
            swap_id = %self.record.swap_id,
            payment_hash = %self.params.payment_hash,
            amount_sats = self.record.amount_sats,
            funding_outpoint = %self.params.funding_outpoint,
            "starting loop-out swap"
        );
        on_transition(&self.record);

        match self.drive(&mut on_transition).await {
            Ok(()) => Ok(self.record),
            Err(error) => {
                if self.invoice_cancellable() {
                    self.cancel_invoice().await;
                }

                let from = self.record.status;
                if error.is_abort() && from.can_transition_to(SwapStatus::Aborted) {
                    self.record.aborted_from = Some(from);
                    self.record.status = SwapStatus::Aborted;
                    tracing::info!(swap_id = %self.record.swap_id, ?from, "swap aborted");
                    on_transition(&self.record);
                }

                tracing::error!(
                    swap_id = %self.record.swap_id,
                    status = ?self.record.status,
                    funds = %self.record.funds_location(),
                    error = %error,
                    "swap failed"
                );
                Err(SwapFailure {
                    error,
                    record: self.record,
                })
            }
        }
    }

    async fn drive(&mut self, on_transition: &mut dyn FnMut(&SwapRecord)) -> Result<(), SwapError> {
        let payment_hash = self.params.payment_hash;

        // Nothing is issued until the funding side is known to work.
        self.preflight().await?;

        // Open -> InvoiceIssued
        let invoice = self
            .invoices
            .issue(payment_hash, self.params.amount.to_sat())
            .await?;
        self.record.payment_request = Some(invoice.payment_request);
        self.advance(SwapStatus::InvoiceIssued, on_transition)?;

        // InvoiceIssued -> Paid
        suspend(
            STAGE_PAYMENT,
            self.config.payment_timeout,
            self.abort.clone(),
            self.invoices.await_acceptance(payment_hash),
        )
        .await?;
        self.advance(SwapStatus::Paid, on_transition)?;

        // Paid -> Funded
        let watch = self.fund().await?;
        self.advance(SwapStatus::Funded, on_transition)?;

        // Funded -> Spent | Refunded
        let spend = suspend(
            STAGE_SPEND,
            self.config.spend_timeout,
            self.abort.clone(),
            self.watcher.await_spend(&watch),
        )
        .await?;

        let preimage = match spend {
            HtlcSpend::Redeemed { txid, preimage } => {
                self.record.spend_txid = Some(txid.to_string());
                self.record.preimage_hex = Some(preimage.to_string());
                self.advance(SwapStatus::Spent, on_transition)?;
                preimage
            }
            HtlcSpend::Refunded { txid } => {
                self.record.spend_txid = Some(txid.to_string());
                self.advance(SwapStatus::Refunded, on_transition)?;
                return Err(SwapError::HtlcRefunded {
                    outpoint: watch.outpoint,
                    txid,
                });
            }
            HtlcSpend::UnusableSecret { txid, len } => {
                self.record.spend_txid = Some(txid.to_string());
                self.advance(SwapStatus::Spent, on_transition)?;
                return Err(SwapError::UnusableSecret {
                    outpoint: watch.outpoint,
                    txid,
                    len,
                });
            }
        };

        // Spent -> Settled
        self.invoices
            .settle(payment_hash, preimage.as_bytes())
            .await?;
        self.advance(SwapStatus::Settled, on_transition)?;

        tracing::info!(swap_id = %self.record.swap_id, %payment_hash, "swap settled");
        Ok(())
    }

    /// Checks the terms and the funding UTXO against the fee policy while the
    /// swap is still `Open`.
    async fn preflight(&self) -> Result<(), SwapError> {
        if self.abort.is_aborted() {
            return Err(SwapError::Aborted {
                stage: STAGE_PREFLIGHT,
            });
        }

        let utxo = self.funding_utxo().await?;
        self.builder
            .preflight(self.params.amount, &self.params.owner_key, &utxo)?;
        tracing::debug!(
            swap_id = %self.record.swap_id,
            utxo_sat = utxo.value.to_sat(),
            "funding utxo passed preflight"
        );
        Ok(())
    }

    async fn funding_utxo(&self) -> Result<FundingUtxo, SwapError> {
        let outpoint = self.params.funding_outpoint;
        self.chain
            .get_utxo(outpoint)
            .await
            .map_err(|e| chain_error(format_args!("look up funding utxo {outpoint}"), e))?
            .ok_or(SwapError::FundingUtxoMissing { outpoint })
    }

    async fn fund(&mut self) -> Result<HtlcWatch, SwapError> {
        if self.abort.is_aborted() {
            return Err(SwapError::Aborted {
                stage: STAGE_FUNDING,
            });
        }

        // The utxo may have been spent while the invoice was outstanding.
        let utxo = self.funding_utxo().await?;

        let funding = self.builder.build(
            self.params.payment_hash.as_bytes(),
            self.params.amount,
            self.params.counterparty_pubkey_hash,
            self.params.refund_pubkey_hash,
            &self.params.owner_key,
            &utxo,
        )?;

        let witness_script = funding.spec.witness_script();
        self.record.htlc_address = Some(funding.spec.address(self.params.network).to_string());
        self.record.witness_script_hex = Some(hex::encode(witness_script.as_bytes()));
        self.record.funding_fee_sats = Some(funding.fee.to_sat());
        self.record.change_sats = funding.change.map(Amount::to_sat);

        let start_block = self
            .chain
            .best_block_hash()
            .await
            .map_err(|e| chain_error(format_args!("read chain tip"), e))?;

        let txid = match self.broadcaster.broadcast(&funding.tx).await {
            Ok(txid) => txid,
            Err(err) => {
                if !matches!(err, SwapError::BroadcastRejected(_)) {
                    self.funding_uncertain = true;
                }
                return Err(err);
            }
        };

        let htlc_outpoint = OutPoint::new(txid, funding.htlc_vout);
        self.record.funding_txid = Some(txid.to_string());
        self.record.htlc_outpoint = Some(htlc_outpoint.to_string());

        tracing::info!(
            swap_id = %self.record.swap_id,
            %htlc_outpoint,
            fee_sat = funding.fee.to_sat(),
            change_sat = ?funding.change.map(Amount::to_sat),
            "htlc funded"
        );

        Ok(HtlcWatch {
            outpoint: htlc_outpoint,
            spec: funding.spec,
            start_block: Some(start_block),
        })
    }

    fn advance(
        &mut self,
        next: SwapStatus,
        on_transition: &mut dyn FnMut(&SwapRecord),
    ) -> Result<(), SwapError> {
        let from = self.record.status;
        if !from.can_transition_to(next) {
            return Err(SwapError::InvalidTransition { from, to: next });
        }

        self.record.status = next;
        tracing::info!(swap_id = %self.record.swap_id, ?from, to = ?next, "swap transition");
        on_transition(&self.record);
        Ok(())
    }

    /// The payer's HTLC can be failed back when our on-chain funds never left the
    /// funding UTXO, or came back through the refund branch.
    fn invoice_cancellable(&self) -> bool {
        match self.record.status {
            SwapStatus::InvoiceIssued | SwapStatus::Paid => !self.funding_uncertain,
            SwapStatus::Refunded => true,
            _ => false,
        }
    }

    async fn cancel_invoice(&self) {
        if let Err(err) = self.invoices.cancel(self.params.payment_hash).await {
            tracing::warn!(
                swap_id = %self.record.swap_id,
                error = %err,
                "failed to cancel hold invoice"
            );
        }
    }
}

fn chain_error(context: impl std::fmt::Display, err: NodeError) -> SwapError {
    match err {
        NodeError::Rejected(reason) => SwapError::InvalidInput(format!("{context}: {reason}")),
        NodeError::Unavailable(source) => SwapError::unavailable("bitcoin node", source),
    }
}

/// Waits on `fut` unless the swap is aborted or `deadline` passes first.
async fn suspend<T>(
    stage: &'static str,
    deadline: Option<Duration>,
    mut abort: AbortSignal,
    fut: impl Future<Output = Result<T, SwapError>>,
) -> Result<T, SwapError> {
    if abort.is_aborted() {
        return Err(SwapError::Aborted { stage });
    }

    let bounded = async move {
        match deadline {
            Some(after) => match tokio::time::timeout(after, fut).await {
                Ok(result) => result,
                Err(_) => Err(SwapError::DeadlineExceeded { stage, after }),
            },
            None => fut.await,
        }
    };

    tokio::select! {
        result = bounded => result,
        () = abort.aborted() => Err(SwapError::Aborted { stage }),
    }
}
