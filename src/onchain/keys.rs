use std::str::FromStr as _;

use anyhow::{Context as _, Result};
use bitcoin::hashes::Hash as _;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::{Address, CompressedPublicKey, Network, NetworkKind, PrivateKey, PubkeyHash};

use crate::onchain::htlc::pubkey_hash_from_p2wpkh_address;

/// Accepts a WIF string or 32 hex-encoded secret key bytes.
pub fn parse_private_key(input: &str, network: Network) -> Result<PrivateKey> {
    let input = input.trim();
    if input.len() == 64 && input.bytes().all(|b| b.is_ascii_hexdigit()) {
        let bytes = hex::decode(input).context("decode private key hex")?;
        return PrivateKey::from_slice(&bytes, network).context("invalid secret key");
    }

    let key = PrivateKey::from_wif(input).context("private key is neither WIF nor 32-byte hex")?;
    anyhow::ensure!(key.compressed, "private key must be compressed");
    anyhow::ensure!(
        key.network == NetworkKind::from(network),
        "private key is encoded for {:?}, not {network}",
        key.network
    );
    Ok(key)
}

/// Resolves the hash-branch recipient: a P2WPKH address for `network`, or a
/// 20-byte hex pubkey hash.
pub fn parse_pubkey_hash_target(input: &str, network: Network) -> Result<PubkeyHash> {
    let input = input.trim();
    if input.len() == 40 && input.bytes().all(|b| b.is_ascii_hexdigit()) {
        let bytes = hex::decode(input).context("decode pubkey hash hex")?;
        return PubkeyHash::from_slice(&bytes).context("invalid pubkey hash");
    }

    let address = parse_address(input, network)?;
    pubkey_hash_from_p2wpkh_address(&address).context("address must be P2WPKH")
}

pub fn parse_address(input: &str, network: Network) -> Result<Address> {
    Address::from_str(input.trim())
        .with_context(|| format!("parse address {input}"))?
        .require_network(network)
        .with_context(|| format!("address {input} is not for {network}"))
}

pub fn owner_pubkey_hash(key: &PrivateKey) -> Result<PubkeyHash> {
    let secp = Secp256k1::new();
    let pubkey =
        CompressedPublicKey::from_private_key(&secp, key).context("private key must be compressed")?;
    Ok(pubkey.pubkey_hash())
}

pub fn owner_address(key: &PrivateKey, network: Network) -> Result<Address> {
    let secp = Secp256k1::new();
    let pubkey =
        CompressedPublicKey::from_private_key(&secp, key).context("private key must be compressed")?;
    Ok(Address::p2wpkh(&pubkey, network))
}
