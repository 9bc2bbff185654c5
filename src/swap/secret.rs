use std::fmt;
use std::str::FromStr;

use bitcoin::hashes::{Hash as _, sha256};

use crate::error::SwapError;

/// SHA-256 commitment shared by the hold invoice and the on-chain HTLC.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PaymentHash([u8; 32]);

impl PaymentHash {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, SwapError> {
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SwapError::InvalidHashLength(bytes.len()))?;
        Ok(Self(bytes))
    }

    pub fn to_byte_array(self) -> [u8; 32] {
        self.0
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Whether `secret` hashes to this value, whatever its length.
    pub fn is_hash_of(&self, secret: &[u8]) -> bool {
        sha256::Hash::hash(secret).to_byte_array() == self.0
    }
}

impl From<[u8; 32]> for PaymentHash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl FromStr for PaymentHash {
    type Err = SwapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| SwapError::InvalidInput(format!("payment hash is not hex: {e}")))?;
        Self::from_slice(&bytes)
    }
}

impl fmt::Display for PaymentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PaymentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PaymentHash({self})")
    }
}

/// The 32-byte secret whose SHA-256 is the [`PaymentHash`].
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Preimage([u8; 32]);

impl Preimage {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, SwapError> {
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| {
            SwapError::InvalidPreimage(format!("expected 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self(bytes))
    }

    pub fn payment_hash(&self) -> PaymentHash {
        PaymentHash(sha256::Hash::hash(&self.0).to_byte_array())
    }

    pub fn matches(&self, payment_hash: &PaymentHash) -> bool {
        self.payment_hash() == *payment_hash
    }

    pub fn to_byte_array(self) -> [u8; 32] {
        self.0
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for Preimage {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl FromStr for Preimage {
    type Err = SwapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| SwapError::InvalidInput(format!("preimage is not hex: {e}")))?;
        Self::from_slice(&bytes)
    }
}

impl fmt::Display for Preimage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Preimage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Preimage({self})")
    }
}
