// =============================================================================
// Server Configuration — JSON file + environment overrides
// =============================================================================
//
// Every tunable of the live bar server lives here. All fields carry
// `#[serde(default)]` so that adding new fields never breaks loading an older
// config file. Environment variables (`LIVEBAR_*`, also read from `.env`)
// override the file for the settings operators change per deployment.
//
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::IntervalDefaults;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_upstream_reconnect_secs() -> u64 {
    5
}

fn default_cleanup_interval_secs() -> u64 {
    60
}

fn default_tick_buffer_capacity() -> usize {
    200_000
}

fn default_tick_buffer_window_secs() -> u64 {
    86_400
}

fn default_backfill_chunk_size() -> usize {
    25_000
}

fn default_client_queue_capacity() -> usize {
    1_024
}

fn default_tick_count() -> u32 {
    1_000
}

fn default_time_interval_secs() -> i64 {
    60
}

// =============================================================================
// ServerConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the HTTP/WebSocket server binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// WebSocket URL of the external tick publisher. `None` runs without an
    /// external feed (ticks can still be published into the bus in-process).
    #[serde(default)]
    pub upstream_url: Option<String>,

    /// Delay before reconnecting to the publisher after a disconnect.
    #[serde(default = "default_upstream_reconnect_secs")]
    pub upstream_reconnect_secs: u64,

    /// Period of the idle subscription group sweep.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    // --- Backfill buffer ----------------------------------------------------

    /// Maximum raw ticks retained per symbol for backfill.
    #[serde(default = "default_tick_buffer_capacity")]
    pub tick_buffer_capacity: usize,

    /// Age window (by tick timestamp) retained per symbol for backfill.
    #[serde(default = "default_tick_buffer_window_secs")]
    pub tick_buffer_window_secs: u64,

    /// Ticks replayed between cooperative yields during backfill.
    #[serde(default = "default_backfill_chunk_size")]
    pub backfill_chunk_size: usize,

    // --- Channels -----------------------------------------------------------

    /// Outbound queue depth per client connection.
    #[serde(default = "default_client_queue_capacity")]
    pub client_queue_capacity: usize,

    // --- Interval fallbacks -------------------------------------------------

    /// Tick count used when a `<N>tick` interval does not parse.
    #[serde(default = "default_tick_count")]
    pub default_tick_count: u32,

    /// Bar length used when a time interval does not parse.
    #[serde(default = "default_time_interval_secs")]
    pub default_time_interval_secs: i64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            upstream_url: None,
            upstream_reconnect_secs: default_upstream_reconnect_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            tick_buffer_capacity: default_tick_buffer_capacity(),
            tick_buffer_window_secs: default_tick_buffer_window_secs(),
            backfill_chunk_size: default_backfill_chunk_size(),
            client_queue_capacity: default_client_queue_capacity(),
            default_tick_count: default_tick_count(),
            default_time_interval_secs: default_time_interval_secs(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read server config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse server config from {}", path.display()))?;

        info!(
            path = %path.display(),
            bind_addr = %config.bind_addr,
            upstream = ?config.upstream_url,
            "server config loaded"
        );

        Ok(config)
    }

    /// Apply `LIVEBAR_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(addr) = lookup("LIVEBAR_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Some(url) = lookup("LIVEBAR_UPSTREAM_URL") {
            self.upstream_url = Some(url).filter(|u| !u.trim().is_empty());
        }
        if let Some(raw) = lookup("LIVEBAR_CLEANUP_INTERVAL_SECS") {
            match raw.parse() {
                Ok(secs) => self.cleanup_interval_secs = secs,
                Err(e) => warn!(value = %raw, error = %e, "ignoring invalid LIVEBAR_CLEANUP_INTERVAL_SECS"),
            }
        }
    }

    /// Clamp values that would stall the server to their smallest safe value.
    pub fn sanitize(mut self) -> Self {
        fn at_least_one<T: PartialOrd + From<u8> + Copy>(name: &str, value: &mut T) {
            if *value < T::from(1) {
                warn!(field = name, "config value must be positive, clamping to 1");
                *value = T::from(1);
            }
        }

        at_least_one("cleanup_interval_secs", &mut self.cleanup_interval_secs);
        at_least_one("tick_buffer_capacity", &mut self.tick_buffer_capacity);
        at_least_one("backfill_chunk_size", &mut self.backfill_chunk_size);
        at_least_one("client_queue_capacity", &mut self.client_queue_capacity);
        at_least_one("default_tick_count", &mut self.default_tick_count);
        at_least_one("default_time_interval_secs", &mut self.default_time_interval_secs);
        self
    }

    pub fn interval_defaults(&self) -> IntervalDefaults {
        IntervalDefaults {
            tick_count: self.default_tick_count,
            time_secs: self.default_time_interval_secs,
        }
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn upstream_reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.upstream_reconnect_secs)
    }
}
