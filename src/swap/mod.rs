pub mod abort;
pub mod orchestrator;
pub mod secret;

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapStatus {
    Open,
    InvoiceIssued,
    Paid,
    Funded,
    Spent,
    Settled,
    Refunded,
    Aborted,
}

impl SwapStatus {
    pub fn can_transition_to(self, next: SwapStatus) -> bool {
        use SwapStatus::*;

        matches!(
            (self, next),
            (Open, InvoiceIssued)
                | (InvoiceIssued, Paid)
                | (Paid, Funded)
                | (Funded, Spent)
                | (Spent, Settled)
                | (Funded, Refunded)
                | (Open | InvoiceIssued | Paid | Funded | Spent, Aborted)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Settled | Self::Refunded | Self::Aborted)
    }

    fn funds_location(self) -> FundsLocation {
        match self {
            Self::Open | Self::InvoiceIssued | Self::Paid | Self::Aborted => {
                FundsLocation::FundingUtxo
            }
            Self::Funded => FundsLocation::Htlc,
            Self::Spent => FundsLocation::ClaimedAwaitingSettlement,
            Self::Settled => FundsLocation::Settled,
            Self::Refunded => FundsLocation::Refunded,
        }
    }
}

/// Where the owner's on-chain funds are at a given point of the swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FundsLocation {
    /// Still in the funding UTXO; nothing was broadcast.
    FundingUtxo,
    /// Locked in the HTLC output.
    Htlc,
    /// Claimed on-chain by the counterparty; the hold invoice still awaits settlement.
    ClaimedAwaitingSettlement,
    Settled,
    /// Returned to the owner through the refund branch.
    Refunded,
}

impl fmt::Display for FundsLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::FundingUtxo => "funds are still in the funding utxo",
            Self::Htlc => "funds are locked in the htlc output",
            Self::ClaimedAwaitingSettlement => {
                "htlc claimed by counterparty, invoice not yet settled"
            }
            Self::Settled => "swap settled",
            Self::Refunded => "funds refunded to the owner",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapRecord {
    pub swap_id: String,
    pub payment_hash: String,
    pub amount_sats: u64,
    pub funding_outpoint: String,

    pub payment_request: Option<String>,

    pub htlc_address: Option<String>,
    pub witness_script_hex: Option<String>,
    pub funding_txid: Option<String>,
    pub htlc_outpoint: Option<String>,
    pub funding_fee_sats: Option<u64>,
    pub change_sats: Option<u64>,

    pub spend_txid: Option<String>,
    pub preimage_hex: Option<String>,

    pub status: SwapStatus,
    /// Status the swap was in when it was aborted.
    pub aborted_from: Option<SwapStatus>,
}

impl SwapRecord {
    pub fn funds_location(&self) -> FundsLocation {
        match (self.status, self.aborted_from) {
            (SwapStatus::Aborted, Some(from)) => from.funds_location(),
            (status, _) => status.funds_location(),
        }
    }
}
