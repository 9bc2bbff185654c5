use crate::error::{NodeError, SwapError};
use crate::lightning::invoice::decode_bolt11;
use crate::lightning::node::{HoldInvoiceNode, HoldInvoiceRequest, InvoiceState, IssuedInvoice};
use crate::swap::secret::{PaymentHash, Preimage};

pub const DEFAULT_CLTV_EXPIRY: u64 = 80;

const LIGHTNING_NODE: &str = "lightning node";

/// Drives one hold invoice through issue, acceptance and settle or cancel.
#[derive(Debug, Clone)]
pub struct InvoiceController<N> {
    node: N,
    cltv_expiry: u64,
}

impl<N: HoldInvoiceNode> InvoiceController<N> {
    pub fn new(node: N, cltv_expiry: u64) -> Self {
        Self { node, cltv_expiry }
    }

    /// Creates the hold invoice and checks that the returned payment request
    /// commits to `payment_hash` and the requested amount.
    pub async fn issue(
        &self,
        payment_hash: PaymentHash,
        amount_sats: u64,
    ) -> Result<IssuedInvoice, SwapError> {
        if amount_sats == 0 {
            return Err(SwapError::InvalidInput(
                "invoice amount must be greater than zero".to_string(),
            ));
        }
        let amount_msat = amount_sats.checked_mul(1_000).ok_or_else(|| {
            SwapError::InvalidInput(format!("invoice amount {amount_sats} sat overflows msat"))
        })?;

        let issued = self
            .node
            .create_hold_invoice(HoldInvoiceRequest {
                payment_hash,
                amount_msat,
                cltv_expiry: self.cltv_expiry,
                memo: format!("loop out {amount_sats} sat"),
            })
            .await
            .map_err(|e| match e {
                NodeError::Rejected(reason) => SwapError::InvoiceCreationFailed(reason),
                NodeError::Unavailable(source) => SwapError::unavailable(LIGHTNING_NODE, source),
            })?;

        let decoded = decode_bolt11(&issued.payment_request).map_err(|e| {
            SwapError::InvoiceCreationFailed(format!("node returned an unreadable invoice: {e:#}"))
        })?;
        if decoded.payment_hash != payment_hash {
            return Err(SwapError::InvoiceCreationFailed(format!(
                "invoice commits to payment hash {}, expected {payment_hash}",
                decoded.payment_hash
            )));
        }
        if decoded.amount_msat != Some(amount_msat) {
            return Err(SwapError::InvoiceCreationFailed(format!(
                "invoice amount {:?} msat, expected {amount_msat} msat",
                decoded.amount_msat
            )));
        }

        tracing::info!(%payment_hash, amount_msat, cltv_expiry = self.cltv_expiry, "hold invoice issued");

        Ok(IssuedInvoice {
            payment_request: issued.payment_request,
            payment_hash,
            amount_msat,
            cltv_expiry: self.cltv_expiry,
        })
    }

    /// Resolves once the payer's HTLC is locked in. `Open` updates are skipped;
    /// a settled or canceled invoice, or the end of the subscription, fails the wait.
    pub async fn await_acceptance(&self, payment_hash: PaymentHash) -> Result<(), SwapError> {
        let mut updates = self
            .node
            .subscribe_invoice(payment_hash)
            .await
            .map_err(|e| match e {
                NodeError::Rejected(reason) => SwapError::InvoiceNotAccepted(reason),
                NodeError::Unavailable(source) => SwapError::unavailable(LIGHTNING_NODE, source),
            })?;

        while let Some(update) = updates.recv().await {
            let state = update.map_err(|e| match e {
                NodeError::Rejected(reason) => SwapError::InvoiceNotAccepted(reason),
                NodeError::Unavailable(source) => SwapError::unavailable(LIGHTNING_NODE, source),
            })?;
            tracing::debug!(%payment_hash, ?state, "invoice update");

            match state {
                InvoiceState::Open => continue,
                InvoiceState::Accepted => {
                    tracing::info!(%payment_hash, "invoice accepted");
                    return Ok(());
                }
                InvoiceState::Settled => {
                    return Err(SwapError::InvoiceNotAccepted(
                        "invoice was settled before it was accepted".to_string(),
                    ));
                }
                InvoiceState::Canceled => {
                    return Err(SwapError::InvoiceNotAccepted(
                        "invoice was canceled".to_string(),
                    ));
                }
            }
        }

        Err(SwapError::InvoiceNotAccepted(
            "invoice subscription closed".to_string(),
        ))
    }

    /// Releases the held payment to us. The preimage is checked locally first and
    /// never sent to the node when it does not hash to `payment_hash`.
    pub async fn settle(&self, payment_hash: PaymentHash, preimage: &[u8]) -> Result<(), SwapError> {
        let preimage = Preimage::from_slice(preimage)?;
        if !preimage.matches(&payment_hash) {
            return Err(SwapError::InvalidPreimage(format!(
                "preimage does not hash to {payment_hash}"
            )));
        }

        self.node
            .settle_invoice(preimage)
            .await
            .map_err(|e| match e {
                NodeError::Rejected(reason) => SwapError::InvalidPreimage(reason),
                NodeError::Unavailable(source) => SwapError::unavailable(LIGHTNING_NODE, source),
            })?;

        tracing::info!(%payment_hash, "invoice settled");
        Ok(())
    }

    /// Fails the held payment back to the payer.
    pub async fn cancel(&self, payment_hash: PaymentHash) -> Result<(), SwapError> {
        self.node
            .cancel_invoice(payment_hash)
            .await
            .map_err(|e| match e {
                NodeError::Rejected(reason) => SwapError::InvoiceCancelRejected(reason),
                NodeError::Unavailable(source) => SwapError::unavailable(LIGHTNING_NODE, source),
            })?;

        tracing::info!(%payment_hash, "invoice canceled");
        Ok(())
    }
}
