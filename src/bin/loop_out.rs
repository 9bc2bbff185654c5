use std::path::PathBuf;
use std::str::FromStr as _;
use std::time::Duration;

use anyhow::{Context as _, Result};
use bitcoin::{Amount, Network, OutPoint, ScriptBuf};
use clap::{Args as ClapArgs, Parser as _, Subcommand};
use ln_loop_out::lightning::lnd::LndInvoicesClient;
use ln_loop_out::onchain::bitcoind::BitcoindClient;
use ln_loop_out::onchain::broadcaster::Broadcaster;
use ln_loop_out::onchain::fee::{FeePolicy, FeeRatePolicy, FixedFee};
use ln_loop_out::onchain::htlc::{HtlcSpec, check_htlc_terms, claim_tx, refund_tx};
use ln_loop_out::onchain::keys::{
    owner_pubkey_hash, parse_address, parse_private_key, parse_pubkey_hash_target,
};
use ln_loop_out::onchain::watcher::WatcherConfig;
use ln_loop_out::swap::abort::abort_pair;
use ln_loop_out::swap::orchestrator::{Orchestrator, SwapConfig, SwapParams};
use ln_loop_out::swap::secret::{PaymentHash, Preimage};
use serde_json::json;

#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long, default_value = "regtest")]
    network: Network,

    #[arg(long, default_value = "http://127.0.0.1:18443")]
    bitcoind_rpc_url: String,

    #[arg(long, default_value = "")]
    bitcoind_rpc_user: String,

    #[arg(long, default_value = "")]
    bitcoind_rpc_password: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a loop-out swap as the owner of the on-chain funds.
    Run(RunArgs),
    /// Spend an HTLC through the hash branch by revealing the preimage.
    Claim(ClaimArgs),
    /// Spend an HTLC through the timeout branch after the CSV delay.
    Refund(RefundArgs),
}

#[derive(Debug, ClapArgs)]
struct RunArgs {
    #[arg(long)]
    payment_hash: String,

    #[arg(long)]
    amount_sats: u64,

    /// WIF or 32-byte hex secret key owning the funding UTXO.
    #[arg(long)]
    owner_key: String,

    /// `txid:vout` of a P2WPKH output of the owner key.
    #[arg(long)]
    funding_utxo: String,

    /// P2WPKH address or 20-byte hex pubkey hash paid by the hash branch.
    #[arg(long)]
    counterparty: String,

    /// Pubkey hash paid by the refund branch; defaults to the owner key.
    #[arg(long)]
    refund_pubkey_hash: Option<String>,

    #[arg(long, default_value = "https://127.0.0.1:10009")]
    lnd_grpc_url: String,

    #[arg(long)]
    lnd_tls_cert: Option<PathBuf>,

    #[arg(long)]
    lnd_macaroon: Option<PathBuf>,

    #[arg(long, default_value_t = 3_000)]
    fee_sats: u64,

    /// Overrides `--fee-sats` with a rate applied to the funding transaction size.
    #[arg(long)]
    fee_rate_sat_vb: Option<u64>,

    #[arg(long, default_value_t = 20)]
    csv_delay: u16,

    #[arg(long, default_value_t = 80)]
    cltv_expiry: u64,

    #[arg(long, default_value_t = 5)]
    poll_interval_secs: u64,

    #[arg(long)]
    payment_timeout_secs: Option<u64>,

    #[arg(long)]
    spend_timeout_secs: Option<u64>,
}

#[derive(Debug, ClapArgs)]
struct HtlcArgs {
    #[arg(long)]
    witness_script: String,

    /// `txid:vout` of the HTLC output.
    #[arg(long)]
    htlc_outpoint: String,

    #[arg(long)]
    htlc_value_sats: u64,

    #[arg(long)]
    destination: String,

    #[arg(long, default_value_t = 500)]
    fee_sats: u64,
}

#[derive(Debug, ClapArgs)]
struct ClaimArgs {
    #[command(flatten)]
    htlc: HtlcArgs,

    #[arg(long)]
    preimage: String,

    /// Key whose hash the hash branch pays.
    #[arg(long)]
    claim_key: String,
}

#[derive(Debug, ClapArgs)]
struct RefundArgs {
    #[command(flatten)]
    htlc: HtlcArgs,

    /// Key whose hash the refund branch pays.
    #[arg(long)]
    refund_key: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    ln_loop_out::logging::init().ok();
    let args = Args::parse();

    let out = match args.command {
        Command::Run(ref run) => run_swap(&args, run).await?,
        Command::Claim(ref claim) => claim_htlc(&args, claim).await?,
        Command::Refund(ref refund) => refund_htlc(&args, refund).await?,
    };

    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn bitcoind(args: &Args) -> Result<BitcoindClient> {
    BitcoindClient::new(
        &args.bitcoind_rpc_url,
        &args.bitcoind_rpc_user,
        &args.bitcoind_rpc_password,
    )
}

fn parse_outpoint(input: &str, what: &str) -> Result<OutPoint> {
    OutPoint::from_str(input.trim()).with_context(|| format!("parse {what} {input} as txid:vout"))
}

async fn run_swap(args: &Args, run: &RunArgs) -> Result<serde_json::Value> {
    let network = args.network;

    let payment_hash = PaymentHash::from_str(&run.payment_hash).context("parse payment hash")?;
    anyhow::ensure!(run.amount_sats > 0, "amount_sats must be greater than zero");
    check_htlc_terms(Amount::from_sat(run.amount_sats), run.csv_delay)?;
    let owner_key = parse_private_key(&run.owner_key, network).context("parse owner key")?;
    let funding_outpoint = parse_outpoint(&run.funding_utxo, "funding utxo")?;
    let counterparty_pubkey_hash = parse_pubkey_hash_target(&run.counterparty, network)
        .context("parse counterparty")?;
    let refund_pubkey_hash = match &run.refund_pubkey_hash {
        Some(target) => {
            parse_pubkey_hash_target(target, network).context("parse refund pubkey hash")?
        }
        None => owner_pubkey_hash(&owner_key)?,
    };

    let fee_policy: Box<dyn FeePolicy + Send + Sync> = match run.fee_rate_sat_vb {
        Some(rate) => Box::new(FeeRatePolicy::from_sat_per_vb(rate)?),
        None => Box::new(FixedFee(Amount::from_sat(run.fee_sats))),
    };
    let config = SwapConfig {
        cltv_expiry: run.cltv_expiry,
        csv_delay: run.csv_delay,
        payment_timeout: run.payment_timeout_secs.map(Duration::from_secs),
        spend_timeout: run.spend_timeout_secs.map(Duration::from_secs),
        watcher: WatcherConfig {
            poll_interval: Duration::from_secs(run.poll_interval_secs),
            ..WatcherConfig::default()
        },
    };
    let params = SwapParams {
        payment_hash,
        amount: Amount::from_sat(run.amount_sats),
        funding_outpoint,
        owner_key,
        counterparty_pubkey_hash,
        refund_pubkey_hash,
        network,
    };

    let chain = bitcoind(args)?;
    let node = LndInvoicesClient::connect(
        &run.lnd_grpc_url,
        run.lnd_tls_cert.as_deref(),
        run.lnd_macaroon.as_deref(),
    )
    .await?;

    let (abort, signal) = abort_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("ctrl-c received; aborting swap");
            abort.abort();
        }
    });

    let orchestrator =
        Orchestrator::new(params, config, node, chain, fee_policy).with_abort(signal);

    let result = orchestrator
        .run(|record| match serde_json::to_string(record) {
            Ok(line) => println!("{line}"),
            Err(err) => tracing::warn!(error = %err, "encode swap record"),
        })
        .await;

    match result {
        Ok(record) => Ok(json!({
          "swap_id": record.swap_id,
          "status": record.status,
          "funds": record.funds_location(),
          "preimage_hex": record.preimage_hex,
          "spend_txid": record.spend_txid,
        })),
        Err(failure) => {
            eprintln!(
                "{}",
                serde_json::to_string_pretty(&json!({
                  "swap_id": failure.record.swap_id,
                  "status": failure.record.status,
                  "aborted_from": failure.record.aborted_from,
                  "funds": failure.funds_location(),
                  "htlc_outpoint": failure.record.htlc_outpoint,
                  "witness_script_hex": failure.record.witness_script_hex,
                  "error": failure.error.to_string(),
                }))?
            );
            Err(failure.into())
        }
    }
}

struct ParsedHtlc {
    spec: HtlcSpec,
    outpoint: OutPoint,
    value: Amount,
    destination: ScriptBuf,
    fee: Amount,
}

fn parse_htlc(args: &HtlcArgs, network: Network) -> Result<ParsedHtlc> {
    let script = hex::decode(args.witness_script.trim()).context("decode witness script hex")?;
    let spec = HtlcSpec::parse_witness_script(&ScriptBuf::from_bytes(script))
        .context("witness script is not a loop-out htlc")?;

    Ok(ParsedHtlc {
        spec,
        outpoint: parse_outpoint(&args.htlc_outpoint, "htlc outpoint")?,
        value: Amount::from_sat(args.htlc_value_sats),
        destination: parse_address(&args.destination, network)?.script_pubkey(),
        fee: Amount::from_sat(args.fee_sats),
    })
}

async fn claim_htlc(args: &Args, claim: &ClaimArgs) -> Result<serde_json::Value> {
    let htlc = parse_htlc(&claim.htlc, args.network)?;
    let preimage = Preimage::from_str(&claim.preimage).context("parse preimage")?;
    let key = parse_private_key(&claim.claim_key, args.network).context("parse claim key")?;

    let tx = claim_tx(
        &htlc.spec,
        htlc.outpoint,
        htlc.value,
        &htlc.destination,
        &key,
        &preimage,
        htlc.fee,
    )?;

    let txid = Broadcaster::new(bitcoind(args)?).broadcast(&tx).await?;
    Ok(json!({
      "branch": "claim",
      "txid": txid.to_string(),
      "payment_hash": htlc.spec.payment_hash.to_string(),
    }))
}

async fn refund_htlc(args: &Args, refund: &RefundArgs) -> Result<serde_json::Value> {
    let htlc = parse_htlc(&refund.htlc, args.network)?;
    let key = parse_private_key(&refund.refund_key, args.network).context("parse refund key")?;

    let tx = refund_tx(
        &htlc.spec,
        htlc.outpoint,
        htlc.value,
        &htlc.destination,
        &key,
        htlc.fee,
    )?;

    let txid = Broadcaster::new(bitcoind(args)?).broadcast(&tx).await?;
    Ok(json!({
      "branch": "refund",
      "txid": txid.to_string(),
      "csv_delay": htlc.spec.csv_delay,
    }))
}
