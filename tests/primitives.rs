use std::time::Duration;

use anyhow::{Context as _, Result};
use bitcoin::{Amount, Network, PrivateKey};
use ln_loop_out::error::SwapError;
use ln_loop_out::lightning::invoice::decode_bolt11;
use ln_loop_out::onchain::fee::{FUNDING_TX_VBYTES, FeePolicy as _, FeeRatePolicy, FixedFee};
use ln_loop_out::onchain::keys::{
    owner_address, owner_pubkey_hash, parse_private_key, parse_pubkey_hash_target,
};
use ln_loop_out::swap::abort::{AbortSignal, abort_pair};
use ln_loop_out::swap::secret::{PaymentHash, Preimage};
use ln_loop_out::swap::{FundsLocation, SwapRecord, SwapStatus};

#[test]
fn zero_preimage_hashes_to_known_digest() {
    let preimage = Preimage::from([0u8; 32]);
    assert_eq!(
        preimage.payment_hash().to_string(),
        "66687aadf862bd776c8fc18b8e9f8e20089714856ee233b3902a591d0d5f2925"
    );
    assert!(preimage.matches(&preimage.payment_hash()));
    assert!(preimage.payment_hash().is_hash_of(preimage.as_bytes()));
    assert!(!Preimage::from([1u8; 32]).matches(&preimage.payment_hash()));
}

#[test]
fn secrets_reject_wrong_lengths() {
    let err = PaymentHash::from_slice(&[7u8; 31]).unwrap_err();
    assert!(matches!(err, SwapError::InvalidHashLength(31)));

    let err = "abcd".parse::<PaymentHash>().unwrap_err();
    assert!(matches!(err, SwapError::InvalidHashLength(2)));

    let err = "zz".parse::<PaymentHash>().unwrap_err();
    assert!(matches!(err, SwapError::InvalidInput(_)));

    let err = Preimage::from_slice(&[]).unwrap_err();
    assert!(matches!(err, SwapError::InvalidPreimage(_)));
}

#[test]
fn hex_and_wif_keys_resolve_to_same_hash() -> Result<()> {
    let key = parse_private_key(&"01".repeat(32), Network::Regtest)?;
    let again = parse_private_key(&key.to_wif(), Network::Regtest)?;
    assert_eq!(owner_pubkey_hash(&key)?, owner_pubkey_hash(&again)?);
    Ok(())
}

#[test]
fn wif_for_another_network_is_rejected() -> Result<()> {
    let mainnet = PrivateKey::from_slice(&[1u8; 32], Network::Bitcoin).context("mainnet key")?;
    let err = parse_private_key(&mainnet.to_wif(), Network::Regtest).unwrap_err();
    assert!(err.to_string().contains("not regtest"), "{err:#}");

    let testnet = PrivateKey::from_slice(&[1u8; 32], Network::Testnet).context("testnet key")?;
    assert!(parse_private_key(&testnet.to_wif(), Network::Bitcoin).is_err());
    // Testnet, signet and regtest share one WIF prefix.
    parse_private_key(&testnet.to_wif(), Network::Regtest)?;
    Ok(())
}

#[test]
fn counterparty_target_accepts_address_or_hash() -> Result<()> {
    let key = parse_private_key(&"02".repeat(32), Network::Regtest)?;
    let expected = owner_pubkey_hash(&key)?;

    let address = owner_address(&key, Network::Regtest)?;
    assert_eq!(
        parse_pubkey_hash_target(&address.to_string(), Network::Regtest)?,
        expected
    );
    assert_eq!(
        parse_pubkey_hash_target(&expected.to_string(), Network::Regtest)?,
        expected
    );
    assert!(parse_pubkey_hash_target(&address.to_string(), Network::Bitcoin).is_err());
    Ok(())
}

#[test]
fn fee_policies() -> Result<()> {
    assert_eq!(FixedFee::default().funding_fee()?, Amount::from_sat(3_000));

    let policy = FeeRatePolicy::from_sat_per_vb(10)?;
    assert_eq!(policy.funding_fee()?, Amount::from_sat(10 * FUNDING_TX_VBYTES));
    Ok(())
}

#[test]
fn garbage_is_not_an_invoice() {
    assert!(decode_bolt11("lnbcrt1garbage").is_err());
    assert!(decode_bolt11("").is_err());
}

#[test]
fn happy_path_transitions_are_sequential() {
    use SwapStatus::*;

    let path = [Open, InvoiceIssued, Paid, Funded, Spent, Settled];
    for pair in path.windows(2) {
        assert!(pair[0].can_transition_to(pair[1]), "{pair:?}");
    }

    assert!(!Open.can_transition_to(Paid));
    assert!(!Paid.can_transition_to(Spent));
    assert!(!Settled.can_transition_to(Aborted));
    assert!(!Funded.can_transition_to(Funded));
    assert!(!Paid.can_transition_to(Refunded));
    assert!(Funded.can_transition_to(Refunded));
}

#[test]
fn aborted_record_reports_where_it_stopped() {
    let mut record = SwapRecord {
        swap_id: "s".to_string(),
        payment_hash: "00".to_string(),
        amount_sats: 1,
        funding_outpoint: "x:0".to_string(),
        payment_request: None,
        htlc_address: None,
        witness_script_hex: None,
        funding_txid: None,
        htlc_outpoint: None,
        funding_fee_sats: None,
        change_sats: None,
        spend_txid: None,
        preimage_hex: None,
        status: SwapStatus::Aborted,
        aborted_from: Some(SwapStatus::Funded),
    };
    assert_eq!(record.funds_location(), FundsLocation::Htlc);

    record.aborted_from = Some(SwapStatus::InvoiceIssued);
    assert_eq!(record.funds_location(), FundsLocation::FundingUtxo);
}

#[tokio::test]
async fn abort_signal_fires_only_after_abort() -> Result<()> {
    let (handle, mut signal) = abort_pair();
    assert!(!signal.is_aborted());

    let waiter = tokio::spawn(async move { signal.aborted().await });
    handle.abort();
    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .context("abort not observed")?
        .context("join waiter")?;

    let (handle, mut orphaned) = abort_pair();
    drop(handle);
    let res = tokio::time::timeout(Duration::from_millis(50), orphaned.aborted()).await;
    assert!(res.is_err());

    let mut never = AbortSignal::never();
    let res = tokio::time::timeout(Duration::from_millis(50), never.aborted()).await;
    assert!(res.is_err());
    Ok(())
}
