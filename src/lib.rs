pub mod cache;
pub mod config;
pub mod metrics;
pub mod router;
pub mod rpc;
pub mod server;
pub mod upstream;
