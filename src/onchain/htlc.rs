use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash as _;
use bitcoin::opcodes::all as opcodes;
use bitcoin::script::{Builder, Instruction};
use bitcoin::secp256k1::{All, Message, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, CompressedPublicKey, Network, OutPoint, PrivateKey, PubkeyHash, Script,
    ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness, ecdsa,
};

use crate::error::SwapError;
use crate::onchain::fee::FeePolicy;
use crate::swap::secret::{PaymentHash, Preimage};

/// Outputs below these values are rejected by standard relay policy.
pub const P2WPKH_DUST_LIMIT: Amount = Amount::from_sat(294);
pub const P2WSH_DUST_LIMIT: Amount = Amount::from_sat(330);

/// Number of witness elements of either HTLC spend: signature, pubkey, branch
/// selector, witness script.
pub const HTLC_SPEND_WITNESS_LEN: usize = 4;
/// Position of the element hashed by the script to pick the branch.
pub const HTLC_SELECTOR_INDEX: usize = 2;
/// The script only accepts selectors of this size, on either branch.
pub const HTLC_SELECTOR_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtlcSpec {
    pub payment_hash: PaymentHash,
    /// Paid by the hash branch.
    pub counterparty_pubkey_hash: PubkeyHash,
    /// Paid by the timeout branch.
    pub refund_pubkey_hash: PubkeyHash,
    /// Relative timelock of the refund branch, in blocks.
    pub csv_delay: u16,
}

impl HtlcSpec {
    pub fn witness_script(&self) -> ScriptBuf {
        Builder::new()
            .push_opcode(opcodes::OP_SIZE)
            .push_int(HTLC_SELECTOR_LEN as i64)
            .push_opcode(opcodes::OP_EQUALVERIFY)
            .push_opcode(opcodes::OP_SHA256)
            .push_slice(self.payment_hash.as_bytes())
            .push_opcode(opcodes::OP_EQUAL)
            .push_opcode(opcodes::OP_IF)
            .push_opcode(opcodes::OP_DUP)
            .push_opcode(opcodes::OP_HASH160)
            .push_slice(self.counterparty_pubkey_hash)
            .push_opcode(opcodes::OP_ELSE)
            .push_int(i64::from(self.csv_delay))
            .push_opcode(opcodes::OP_CSV)
            .push_opcode(opcodes::OP_DROP)
            .push_opcode(opcodes::OP_DUP)
            .push_opcode(opcodes::OP_HASH160)
            .push_slice(self.refund_pubkey_hash)
            .push_opcode(opcodes::OP_ENDIF)
            .push_opcode(opcodes::OP_EQUALVERIFY)
            .push_opcode(opcodes::OP_CHECKSIG)
            .into_script()
    }

    pub fn script_pubkey(&self) -> ScriptBuf {
        ScriptBuf::new_p2wsh(&self.witness_script().wscript_hash())
    }

    pub fn address(&self, network: Network) -> Address {
        Address::p2wsh(&self.witness_script(), network)
    }

    /// Decodes a witness script produced by [`HtlcSpec::witness_script`], rejecting
    /// any other shape.
    pub fn parse_witness_script(witness_script: &Script) -> anyhow::Result<Self> {
        use anyhow::Context as _;

        fn next_instruction<'a>(
            iter: &mut impl Iterator<
                Item = std::result::Result<Instruction<'a>, bitcoin::script::Error>,
            >,
        ) -> anyhow::Result<Instruction<'a>> {
            iter.next()
                .transpose()
                .map_err(|e| anyhow::anyhow!("decode witness script instruction: {e}"))?
                .context("unexpected end of witness script")
        }

        fn expect_op(
            actual: Instruction<'_>,
            expected: bitcoin::opcodes::Opcode,
        ) -> anyhow::Result<()> {
            match actual {
                Instruction::Op(op) if op == expected => Ok(()),
                other => {
                    anyhow::bail!("unexpected instruction: expected {expected:?}, got {other:?}")
                }
            }
        }

        fn parse_script_num(actual: Instruction<'_>) -> anyhow::Result<i64> {
            match actual {
                Instruction::PushBytes(bytes) => decode_script_num(bytes.as_bytes()),
                Instruction::Op(op) => {
                    let code = op.to_u8();
                    if code == opcodes::OP_PUSHNUM_NEG1.to_u8() {
                        return Ok(-1);
                    }

                    let one = opcodes::OP_PUSHNUM_1.to_u8();
                    let sixteen = opcodes::OP_PUSHNUM_16.to_u8();
                    if (one..=sixteen).contains(&code) {
                        return Ok(i64::from(code - one + 1));
                    }

                    anyhow::bail!("unexpected opcode where script number expected: {op:?}");
                }
            }
        }

        fn decode_script_num(bytes: &[u8]) -> anyhow::Result<i64> {
            if bytes.is_empty() {
                return Ok(0);
            }
            anyhow::ensure!(bytes.len() <= 4, "script number too large: {} bytes", bytes.len());

            let mut magnitude = bytes.to_vec();
            let negative = magnitude.last().is_some_and(|b| (b & 0x80) != 0);
            if let Some(last) = magnitude.last_mut() {
                *last &= 0x7f;
            }

            let mut value: i64 = 0;
            for (i, b) in magnitude.iter().enumerate() {
                value |= i64::from(*b) << (8 * i);
            }

            Ok(if negative { -value } else { value })
        }

        fn expect_push<const N: usize>(actual: Instruction<'_>) -> anyhow::Result<[u8; N]> {
            match actual {
                Instruction::PushBytes(bytes) if bytes.len() == N => {
                    let mut out = [0u8; N];
                    out.copy_from_slice(bytes.as_bytes());
                    Ok(out)
                }
                other => {
                    anyhow::bail!("unexpected instruction: expected push {N} bytes, got {other:?}")
                }
            }
        }

        let mut iter = witness_script.instructions_minimal();

        expect_op(next_instruction(&mut iter)?, opcodes::OP_SIZE)?;
        let selector_len = parse_script_num(next_instruction(&mut iter)?)?;
        anyhow::ensure!(
            selector_len == HTLC_SELECTOR_LEN as i64,
            "unexpected selector size {selector_len}"
        );
        expect_op(next_instruction(&mut iter)?, opcodes::OP_EQUALVERIFY)?;
        expect_op(next_instruction(&mut iter)?, opcodes::OP_SHA256)?;
        let payment_hash = PaymentHash::from(expect_push::<32>(next_instruction(&mut iter)?)?);
        expect_op(next_instruction(&mut iter)?, opcodes::OP_EQUAL)?;

        expect_op(next_instruction(&mut iter)?, opcodes::OP_IF)?;
        expect_op(next_instruction(&mut iter)?, opcodes::OP_DUP)?;
        expect_op(next_instruction(&mut iter)?, opcodes::OP_HASH160)?;
        let counterparty_pubkey_hash =
            PubkeyHash::from_byte_array(expect_push::<20>(next_instruction(&mut iter)?)?);

        expect_op(next_instruction(&mut iter)?, opcodes::OP_ELSE)?;
        let csv_delay = parse_script_num(next_instruction(&mut iter)?)?;
        let csv_delay = u16::try_from(csv_delay)
            .map_err(|_| anyhow::anyhow!("csv_delay out of range: {csv_delay}"))?;
        expect_op(next_instruction(&mut iter)?, opcodes::OP_CSV)?;
        expect_op(next_instruction(&mut iter)?, opcodes::OP_DROP)?;
        expect_op(next_instruction(&mut iter)?, opcodes::OP_DUP)?;
        expect_op(next_instruction(&mut iter)?, opcodes::OP_HASH160)?;
        let refund_pubkey_hash =
            PubkeyHash::from_byte_array(expect_push::<20>(next_instruction(&mut iter)?)?);

        expect_op(next_instruction(&mut iter)?, opcodes::OP_ENDIF)?;
        expect_op(next_instruction(&mut iter)?, opcodes::OP_EQUALVERIFY)?;
        expect_op(next_instruction(&mut iter)?, opcodes::OP_CHECKSIG)?;

        anyhow::ensure!(
            iter.next().is_none(),
            "unexpected trailing instructions in witness script"
        );

        Ok(Self {
            payment_hash,
            counterparty_pubkey_hash,
            refund_pubkey_hash,
            csv_delay,
        })
    }
}

/// The owner's coin that pays for the HTLC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FundingUtxo {
    pub outpoint: OutPoint,
    pub value: Amount,
    pub script_pubkey: ScriptBuf,
}

#[derive(Debug, Clone)]
pub struct FundingTransaction {
    pub tx: Transaction,
    pub spec: HtlcSpec,
    pub htlc_vout: u32,
    /// `None` when the change was below dust and folded into the fee.
    pub change: Option<Amount>,
    pub fee: Amount,
}

impl FundingTransaction {
    pub fn htlc_output(&self) -> &TxOut {
        &self.tx.output[self.htlc_vout as usize]
    }
}

/// Static limits on the swap terms; nothing here needs the chain.
pub fn check_htlc_terms(amount: Amount, csv_delay: u16) -> Result<(), SwapError> {
    if amount < P2WSH_DUST_LIMIT {
        return Err(SwapError::InvalidInput(format!(
            "swap amount {amount} is below the htlc dust limit {P2WSH_DUST_LIMIT}"
        )));
    }
    if csv_delay == 0 {
        return Err(SwapError::InvalidInput(
            "csv_delay must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

struct FundingPlan {
    owner_pubkey: CompressedPublicKey,
    change_script: ScriptBuf,
    change: Option<Amount>,
    fee: Amount,
}

#[derive(Debug, Clone)]
pub struct HtlcBuilder<F> {
    pub csv_delay: u16,
    pub fee_policy: F,
}

impl<F: FeePolicy> HtlcBuilder<F> {
    pub fn new(csv_delay: u16, fee_policy: F) -> Self {
        Self {
            csv_delay,
            fee_policy,
        }
    }

    /// Runs every check [`HtlcBuilder::build`] makes without signing anything, so a
    /// swap can be refused before its invoice exists.
    pub fn preflight(
        &self,
        amount: Amount,
        owner_key: &PrivateKey,
        utxo: &FundingUtxo,
    ) -> Result<(), SwapError> {
        self.plan(amount, owner_key, utxo).map(|_| ())
    }

    fn plan(
        &self,
        amount: Amount,
        owner_key: &PrivateKey,
        utxo: &FundingUtxo,
    ) -> Result<FundingPlan, SwapError> {
        check_htlc_terms(amount, self.csv_delay)?;

        let fee = self.fee_policy.funding_fee()?;
        let change = amount
            .checked_add(fee)
            .and_then(|needed| utxo.value.checked_sub(needed))
            .ok_or(SwapError::InsufficientFunds {
                utxo_value: utxo.value,
                amount,
                fee,
            })?;

        let owner_pubkey = compressed_pubkey(&Secp256k1::new(), owner_key)?;
        let change_script = ScriptBuf::new_p2wpkh(&owner_pubkey.wpubkey_hash());
        if utxo.script_pubkey != change_script {
            return Err(SwapError::FundingUtxoMismatch {
                outpoint: utxo.outpoint,
            });
        }

        let (change, fee) = if change < P2WPKH_DUST_LIMIT {
            (None, fee + change)
        } else {
            (Some(change), fee)
        };

        Ok(FundingPlan {
            owner_pubkey,
            change_script,
            change,
            fee,
        })
    }

    /// Builds and signs the transaction moving `utxo` into the HTLC.
    ///
    /// Outputs are `[change, htlc]`, or only `[htlc]` when the change would be below
    /// the P2WPKH dust limit, in which case the remainder goes to the fee.
    pub fn build(
        &self,
        payment_hash: &[u8],
        amount: Amount,
        counterparty_pubkey_hash: PubkeyHash,
        refund_pubkey_hash: PubkeyHash,
        owner_key: &PrivateKey,
        utxo: &FundingUtxo,
    ) -> Result<FundingTransaction, SwapError> {
        let payment_hash = PaymentHash::from_slice(payment_hash)?;
        let FundingPlan {
            owner_pubkey,
            change_script,
            change,
            fee,
        } = self.plan(amount, owner_key, utxo)?;

        let spec = HtlcSpec {
            payment_hash,
            counterparty_pubkey_hash,
            refund_pubkey_hash,
            csv_delay: self.csv_delay,
        };
        let secp = Secp256k1::new();

        let mut output = Vec::with_capacity(2);
        if let Some(change) = change {
            output.push(TxOut {
                value: change,
                script_pubkey: change_script,
            });
        }
        let htlc_vout = output.len() as u32;
        output.push(TxOut {
            value: amount,
            script_pubkey: spec.script_pubkey(),
        });

        let mut tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: utxo.outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            }],
            output,
        };

        let sighash = SighashCache::new(&tx)
            .p2wpkh_signature_hash(0, &utxo.script_pubkey, utxo.value, EcdsaSighashType::All)
            .map_err(|e| SwapError::InvalidInput(format!("funding sighash: {e}")))?;
        let signature = sign(&secp, sighash.to_byte_array(), owner_key);
        tx.input[0].witness = Witness::p2wpkh(&signature, &owner_pubkey.0);

        Ok(FundingTransaction {
            tx,
            spec,
            htlc_vout,
            change,
            fee,
        })
    }
}

/// Spends the HTLC through the hash branch, revealing `preimage`.
pub fn claim_tx(
    spec: &HtlcSpec,
    htlc_outpoint: OutPoint,
    htlc_value: Amount,
    destination: &Script,
    claim_key: &PrivateKey,
    preimage: &Preimage,
    fee: Amount,
) -> Result<Transaction, SwapError> {
    if !preimage.matches(&spec.payment_hash) {
        return Err(SwapError::InvalidPreimage(format!(
            "preimage does not hash to {}",
            spec.payment_hash
        )));
    }

    spend_htlc(
        spec,
        htlc_outpoint,
        htlc_value,
        destination,
        claim_key,
        spec.counterparty_pubkey_hash,
        Sequence::ENABLE_RBF_NO_LOCKTIME,
        preimage.as_bytes(),
        fee,
    )
}

/// Spends the HTLC through the timeout branch once `csv_delay` blocks have passed
/// since the funding transaction confirmed.
pub fn refund_tx(
    spec: &HtlcSpec,
    htlc_outpoint: OutPoint,
    htlc_value: Amount,
    destination: &Script,
    refund_key: &PrivateKey,
    fee: Amount,
) -> Result<Transaction, SwapError> {
    spend_htlc(
        spec,
        htlc_outpoint,
        htlc_value,
        destination,
        refund_key,
        spec.refund_pubkey_hash,
        Sequence::from_height(spec.csv_delay),
        &refund_selector(&spec.payment_hash),
        fee,
    )
}

/// A selector of the size the script demands that does not open the hash branch.
fn refund_selector(payment_hash: &PaymentHash) -> [u8; HTLC_SELECTOR_LEN] {
    let zeros = [0u8; HTLC_SELECTOR_LEN];
    if Preimage::from(zeros).matches(payment_hash) {
        [1u8; HTLC_SELECTOR_LEN]
    } else {
        zeros
    }
}

#[allow(clippy::too_many_arguments)]
fn spend_htlc(
    spec: &HtlcSpec,
    htlc_outpoint: OutPoint,
    htlc_value: Amount,
    destination: &Script,
    key: &PrivateKey,
    expected_pubkey_hash: PubkeyHash,
    sequence: Sequence,
    selector: &[u8],
    fee: Amount,
) -> Result<Transaction, SwapError> {
    let secp = Secp256k1::new();
    let pubkey = compressed_pubkey(&secp, key)?;
    if pubkey.pubkey_hash() != expected_pubkey_hash {
        return Err(SwapError::InvalidInput(format!(
            "signing key hash {} does not match htlc key hash {expected_pubkey_hash}",
            pubkey.pubkey_hash()
        )));
    }

    let value = htlc_value
        .checked_sub(fee)
        .filter(|v| *v >= P2WPKH_DUST_LIMIT)
        .ok_or_else(|| {
            SwapError::InvalidInput(format!(
                "fee {fee} leaves no spendable output from htlc value {htlc_value}"
            ))
        })?;

    let mut tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: htlc_outpoint,
            script_sig: ScriptBuf::new(),
            sequence,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value,
            script_pubkey: destination.to_owned(),
        }],
    };

    let witness_script = spec.witness_script();
    let sighash = SighashCache::new(&tx)
        .p2wsh_signature_hash(0, &witness_script, htlc_value, EcdsaSighashType::All)
        .map_err(|e| SwapError::InvalidInput(format!("htlc sighash: {e}")))?;
    let signature = sign(&secp, sighash.to_byte_array(), key);

    let mut witness = Witness::new();
    witness.push(signature.to_vec());
    witness.push(pubkey.to_bytes());
    witness.push(selector);
    witness.push(witness_script.as_bytes());
    tx.input[0].witness = witness;

    Ok(tx)
}

fn sign(secp: &Secp256k1<All>, sighash: [u8; 32], key: &PrivateKey) -> ecdsa::Signature {
    let msg = Message::from_digest(sighash);
    ecdsa::Signature {
        signature: secp.sign_ecdsa(&msg, &key.inner),
        sighash_type: EcdsaSighashType::All,
    }
}

fn compressed_pubkey(
    secp: &Secp256k1<All>,
    key: &PrivateKey,
) -> Result<CompressedPublicKey, SwapError> {
    CompressedPublicKey::from_private_key(secp, key)
        .map_err(|_| SwapError::InvalidInput("private key must be compressed".to_string()))
}

pub fn pubkey_hash_from_p2wpkh_address(address: &Address) -> anyhow::Result<PubkeyHash> {
    pubkey_hash_from_p2wpkh_script(&address.script_pubkey())
}

pub fn pubkey_hash_from_p2wpkh_script(script_pubkey: &Script) -> anyhow::Result<PubkeyHash> {
    let bytes = script_pubkey.as_bytes();
    if bytes.len() != 22 || bytes[0] != 0x00 || bytes[1] != 0x14 {
        anyhow::bail!("expected P2WPKH script_pubkey (0x0014..), got {script_pubkey:?}");
    }
    let mut out = [0u8; 20];
    out.copy_from_slice(&bytes[2..22]);
    Ok(PubkeyHash::from_byte_array(out))
}
