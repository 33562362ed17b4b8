//! Networking: the master/worker architecture of spec §4.7/§4.8.

pub mod pool;
pub mod server;
pub mod signal;
