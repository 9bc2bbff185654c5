use std::time::Duration;

use bitcoin::{Amount, OutPoint, Txid};
use thiserror::Error;

use crate::swap::SwapStatus;

/// Failure reported by an external node (Lightning or Bitcoin).
#[derive(Debug, Error)]
pub enum NodeError {
    /// The node processed the request and refused it.
    #[error("rejected: {0}")]
    Rejected(String),
    /// The node could not be reached or the call did not complete.
    #[error("unavailable: {0:#}")]
    Unavailable(anyhow::Error),
}

#[derive(Debug, Error)]
pub enum SwapError {
    #[error("payment hash must be 32 bytes, got {0}")]
    InvalidHashLength(usize),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(
        "insufficient funds: utxo holds {utxo_value}, swap needs {amount} plus {fee} fee"
    )]
    InsufficientFunds {
        utxo_value: Amount,
        amount: Amount,
        fee: Amount,
    },

    #[error("funding utxo {outpoint} is not locked to the owner key")]
    FundingUtxoMismatch { outpoint: OutPoint },

    #[error("funding utxo {outpoint} is spent or unknown")]
    FundingUtxoMissing { outpoint: OutPoint },

    #[error("invoice creation failed: {0}")]
    InvoiceCreationFailed(String),

    #[error("invoice was not accepted: {0}")]
    InvoiceNotAccepted(String),

    #[error("invoice cancel rejected: {0}")]
    InvoiceCancelRejected(String),

    #[error("invalid preimage: {0}")]
    InvalidPreimage(String),

    #[error("broadcast rejected: {0}")]
    BroadcastRejected(String),

    #[error("ambiguous spend of {outpoint} by {txid}: {reason}")]
    AmbiguousSpend {
        outpoint: OutPoint,
        txid: Txid,
        reason: String,
    },

    #[error("htlc {outpoint} was spent through the refund branch by {txid}")]
    HtlcRefunded { outpoint: OutPoint, txid: Txid },

    #[error(
        "htlc {outpoint} was claimed by {txid} with a {len}-byte secret that cannot settle the invoice"
    )]
    UnusableSecret {
        outpoint: OutPoint,
        txid: Txid,
        len: usize,
    },

    #[error("{collaborator} unavailable: {source:#}")]
    CollaboratorUnavailable {
        collaborator: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("swap aborted while {stage}")]
    Aborted { stage: &'static str },

    #[error("deadline of {after:?} exceeded while {stage}")]
    DeadlineExceeded {
        stage: &'static str,
        after: Duration,
    },

    #[error("invalid swap transition {from:?} -> {to:?}")]
    InvalidTransition { from: SwapStatus, to: SwapStatus },
}

impl SwapError {
    pub(crate) fn unavailable(collaborator: &'static str, source: anyhow::Error) -> Self {
        Self::CollaboratorUnavailable {
            collaborator,
            source,
        }
    }

    /// True for errors raised by cancellation or an expired deadline rather than by a
    /// collaborator or a validation check.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted { .. } | Self::DeadlineExceeded { .. })
    }
}
