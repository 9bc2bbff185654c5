use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::NodeError;
use crate::swap::secret::{PaymentHash, Preimage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoldInvoiceRequest {
    pub payment_hash: PaymentHash,
    pub amount_msat: u64,
    /// Final CLTV delta the payer's last hop must leave, in blocks.
    pub cltv_expiry: u64,
    pub memo: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedInvoice {
    /// BOLT11 string handed to the payer.
    pub payment_request: String,
    pub payment_hash: PaymentHash,
    pub amount_msat: u64,
    pub cltv_expiry: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceState {
    Open,
    /// The payer's HTLC is locked in and waits for settle or cancel.
    Accepted,
    Settled,
    Canceled,
}

/// Stream of state updates for one invoice. Closed by the node side when the
/// subscription ends.
pub type InvoiceUpdates = mpsc::Receiver<Result<InvoiceState, NodeError>>;

/// Off-chain node able to hold incoming payments until a preimage is supplied.
#[tonic::async_trait]
pub trait HoldInvoiceNode: Send + Sync {
    async fn create_hold_invoice(
        &self,
        request: HoldInvoiceRequest,
    ) -> Result<IssuedInvoice, NodeError>;

    async fn subscribe_invoice(&self, payment_hash: PaymentHash)
    -> Result<InvoiceUpdates, NodeError>;

    async fn settle_invoice(&self, preimage: Preimage) -> Result<(), NodeError>;

    async fn cancel_invoice(&self, payment_hash: PaymentHash) -> Result<(), NodeError>;
}

#[tonic::async_trait]
impl<N: HoldInvoiceNode + ?Sized> HoldInvoiceNode for Arc<N> {
    async fn create_hold_invoice(
        &self,
        request: HoldInvoiceRequest,
    ) -> Result<IssuedInvoice, NodeError> {
        (**self).create_hold_invoice(request).await
    }

    async fn subscribe_invoice(
        &self,
        payment_hash: PaymentHash,
    ) -> Result<InvoiceUpdates, NodeError> {
        (**self).subscribe_invoice(payment_hash).await
    }

    async fn settle_invoice(&self, preimage: Preimage) -> Result<(), NodeError> {
        (**self).settle_invoice(preimage).await
    }

    async fn cancel_invoice(&self, payment_hash: PaymentHash) -> Result<(), NodeError> {
        (**self).cancel_invoice(payment_hash).await
    }
}
