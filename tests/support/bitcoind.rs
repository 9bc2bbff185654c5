use std::fs::File;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::Context as _;
use bitcoincore_rpc::bitcoin::address::NetworkChecked;
use bitcoincore_rpc::bitcoin::{Address, Amount, Network, OutPoint};
use bitcoincore_rpc::{Auth, Client, RpcApi as _};
use tempfile::TempDir;

use super::port::get_available_port;

const RPC_USER: &str = "loopout";
const RPC_PASSWORD: &str = "loopout";
const READY_TIMEOUT: Duration = Duration::from_secs(30);

/// A throwaway regtest `bitcoind` living in a temp datadir.
pub struct BitcoindProcess {
    datadir: Option<TempDir>,
    rpc_port: u16,
    child: Child,
}

impl BitcoindProcess {
    pub fn start() -> anyhow::Result<Self> {
        let datadir = tempfile::tempdir().context("create bitcoind datadir")?;
        let rpc_port = get_available_port().context("pick bitcoind rpc port")?;
        let p2p_port = get_available_port().context("pick bitcoind p2p port")?;

        let conf_path = datadir.path().join("bitcoin.conf");
        std::fs::write(
            &conf_path,
            format!(
                "regtest=1\nserver=1\ntxindex=1\nrpcuser={RPC_USER}\nrpcpassword={RPC_PASSWORD}\n\
                 [regtest]\nfallbackfee=0.0001\nrpcbind=127.0.0.1\nrpcallowip=127.0.0.1\n\
                 rpcport={rpc_port}\nport={p2p_port}\n"
            ),
        )
        .context("write bitcoin.conf")?;

        let log_path = datadir.path().join("bitcoind.log");
        let log = File::create(&log_path).context("create bitcoind log")?;
        let child = Command::new("bitcoind")
            .arg(format!("-datadir={}", datadir.path().display()))
            .arg(format!("-conf={}", conf_path.display()))
            .arg("-printtoconsole=1")
            .stdout(Stdio::from(log.try_clone().context("clone bitcoind log")?))
            .stderr(Stdio::from(log))
            .spawn()
            .context("spawn bitcoind")?;

        let mut process = Self {
            datadir: Some(datadir),
            rpc_port,
            child,
        };
        process.wait_until_ready(&log_path)?;
        Ok(process)
    }

    fn wait_until_ready(&mut self, log_path: &Path) -> anyhow::Result<()> {
        let client = self.client()?;
        let deadline = Instant::now() + READY_TIMEOUT;
        while client.get_blockchain_info().is_err() {
            if let Some(status) = self.child.try_wait().context("poll bitcoind")? {
                anyhow::bail!("bitcoind exited with {status}; see {}", log_path.display());
            }
            if Instant::now() >= deadline {
                anyhow::bail!("bitcoind rpc not ready; see {}", log_path.display());
            }
            std::thread::sleep(Duration::from_millis(200));
        }
        Ok(())
    }

    pub fn rpc_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.rpc_port)
    }

    pub fn rpc_user(&self) -> &str {
        RPC_USER
    }

    pub fn rpc_password(&self) -> &str {
        RPC_PASSWORD
    }

    pub fn client(&self) -> anyhow::Result<Client> {
        rpc_client(&self.rpc_url())
    }

    fn wallet(&self, name: &str) -> anyhow::Result<Client> {
        let client = self.client()?;
        let loaded = client.list_wallets().context("list wallets")?;
        if !loaded.iter().any(|w| w == name) {
            client
                .create_wallet(name, None, None, None, None)
                .with_context(|| format!("create wallet {name}"))?;
        }
        rpc_client(&format!("{}/wallet/{name}", self.rpc_url()))
    }

    /// Mines `blocks` to a fresh address of `wallet`, creating the wallet if needed.
    pub fn mine_blocks(&self, wallet: &str, blocks: u64) -> anyhow::Result<()> {
        let address = self
            .wallet(wallet)?
            .get_new_address(None, None)
            .context("get mining address")?
            .require_network(Network::Regtest)
            .context("mining address network")?;
        self.client()?
            .generate_to_address(blocks, &address)
            .context("generate blocks")?;
        Ok(())
    }

    /// Pays `sats` to `address` from `wallet` and returns the output it created.
    pub fn fund_address(
        &self,
        wallet: &str,
        address: &Address<NetworkChecked>,
        sats: u64,
    ) -> anyhow::Result<OutPoint> {
        let wallet = self.wallet(wallet)?;
        let txid = wallet
            .send_to_address(
                address,
                Amount::from_sat(sats),
                None,
                None,
                None,
                None,
                None,
                None,
            )
            .context("send to funding address")?;

        let tx = wallet
            .get_raw_transaction(&txid, None)
            .context("fetch funding transaction")?;
        let script_pubkey = address.script_pubkey();
        let vout = tx
            .output
            .iter()
            .position(|o| o.script_pubkey == script_pubkey)
            .context("funding transaction does not pay the address")?;
        Ok(OutPoint::new(txid, vout as u32))
    }
}

impl Drop for BitcoindProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();

        let keep = std::thread::panicking()
            || std::env::var("KEEP_REGTEST_ARTIFACTS").is_ok_and(|v| v == "1");
        if keep && let Some(datadir) = self.datadir.take() {
            eprintln!("keeping bitcoind datadir {}", datadir.keep().display());
        }
    }
}

fn rpc_client(url: &str) -> anyhow::Result<Client> {
    Client::new(
        url,
        Auth::UserPass(RPC_USER.to_string(), RPC_PASSWORD.to_string()),
    )
    .with_context(|| format!("connect to bitcoind at {url}"))
}
