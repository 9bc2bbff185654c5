pub mod bitcoind;
pub mod broadcaster;
pub mod chain;
pub mod fee;
pub mod htlc;
pub mod keys;
pub mod watcher;
