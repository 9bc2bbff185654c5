use std::str::FromStr as _;

use anyhow::Result;
use bitcoin::hashes::Hash as _;
use lightning_invoice::Bolt11Invoice;

use crate::swap::secret::PaymentHash;

/// The parts of a BOLT11 payment request a hold invoice must commit to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInvoice {
    pub payment_hash: PaymentHash,
    pub amount_msat: Option<u64>,
    pub min_final_cltv_expiry_delta: u64,
}

pub fn decode_bolt11(payment_request: &str) -> Result<DecodedInvoice> {
    let invoice = Bolt11Invoice::from_str(payment_request.trim())
        .map_err(|e| anyhow::anyhow!("parse BOLT11 invoice: {e:?}"))?;

    Ok(DecodedInvoice {
        payment_hash: PaymentHash::from(invoice.payment_hash().to_byte_array()),
        amount_msat: invoice.amount_milli_satoshis(),
        min_final_cltv_expiry_delta: invoice.min_final_cltv_expiry_delta(),
    })
}
