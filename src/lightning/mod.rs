pub mod controller;
pub mod invoice;
pub mod lnd;
pub mod node;
