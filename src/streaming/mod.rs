pub mod backfill;
pub mod client;
pub mod connection_manager;
pub mod subscription_group;

pub use client::ClientHandle;
pub use connection_manager::{ConnectionManager, ConnectionMetrics};
