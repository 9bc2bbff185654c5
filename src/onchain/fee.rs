use bitcoin::{Amount, FeeRate};

use crate::error::SwapError;

/// Virtual size of the funding transaction: one P2WPKH input, one P2WPKH change
/// output and one P2WSH output.
pub const FUNDING_TX_VBYTES: u64 = 153;

pub const DEFAULT_FUNDING_FEE: Amount = Amount::from_sat(3_000);

pub trait FeePolicy {
    fn funding_fee(&self) -> Result<Amount, SwapError>;
}

/// Pays the same absolute fee regardless of network conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedFee(pub Amount);

impl Default for FixedFee {
    fn default() -> Self {
        Self(DEFAULT_FUNDING_FEE)
    }
}

impl FeePolicy for FixedFee {
    fn funding_fee(&self) -> Result<Amount, SwapError> {
        Ok(self.0)
    }
}

/// Pays `rate` for the estimated size of the funding transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeRatePolicy(pub FeeRate);

impl FeeRatePolicy {
    pub fn from_sat_per_vb(sat_per_vb: u64) -> Result<Self, SwapError> {
        FeeRate::from_sat_per_vb(sat_per_vb)
            .map(Self)
            .ok_or_else(|| {
                SwapError::InvalidInput(format!("fee rate {sat_per_vb} sat/vB overflows"))
            })
    }
}

impl FeePolicy for FeeRatePolicy {
    fn funding_fee(&self) -> Result<Amount, SwapError> {
        self.0.fee_vb(FUNDING_TX_VBYTES).ok_or_else(|| {
            SwapError::InvalidInput(format!(
                "fee for {FUNDING_TX_VBYTES} vB at {:?} overflows",
                self.0
            ))
        })
    }
}

impl<P: FeePolicy + ?Sized> FeePolicy for Box<P> {
    fn funding_fee(&self) -> Result<Amount, SwapError> {
        (**self).funding_fee()
    }
}
