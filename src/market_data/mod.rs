pub mod aggregator;
pub mod heikin_ashi;
pub mod tick_bus;
pub mod upstream;

// Re-export the shared bus for the service container
// (e.g. `use crate::market_data::TickBus`).
pub use tick_bus::TickBus;
