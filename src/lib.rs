pub mod error;
pub mod lightning;
pub mod logging;
pub mod onchain;
pub mod proto;
pub mod swap;
