// =============================================================================
// Shared types used across the live bar server
// =============================================================================
//
// Ticks arrive as raw JSON text from the upstream channel and are validated
// into `Tick` exactly once per group. Bars and Heikin-Ashi bars are the
// outbound units; their JSON shape is what chart clients already consume
// (`unix_timestamp` carries the folded bar start).
// =============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Errors
// =============================================================================

/// Reasons an upstream tick message is rejected.
#[derive(Debug, Error)]
pub enum TickError {
    #[error("tick is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("tick is missing field `{0}`")]
    MissingField(&'static str),

    #[error("tick field `{field}` is not finite: {value}")]
    NotFinite { field: &'static str, value: f64 },
}

/// Reasons an interval specifier cannot be parsed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IntervalError {
    #[error("interval `{0}` is empty")]
    Empty(String),

    #[error("interval `{0}` has no numeric prefix")]
    BadCount(String),

    #[error("interval `{0}` must be greater than zero")]
    Zero(String),

    #[error("interval `{0}` has unknown unit")]
    UnknownUnit(String),

    #[error("interval `{0}` is too long")]
    Overflow(String),
}

// =============================================================================
// Ticks
// =============================================================================

/// Upstream tick exactly as published. Every field is optional so a partial
/// message is reported as malformed instead of failing deserialisation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawTick {
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub volume: Option<f64>,
    #[serde(default)]
    pub timestamp: Option<f64>,
}

/// A validated trade tick. `timestamp` is epoch seconds (fractional allowed).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tick {
    pub price: f64,
    pub volume: i64,
    pub timestamp: f64,
}

impl Tick {
    pub fn new(price: f64, volume: i64, timestamp: f64) -> Self {
        Self {
            price,
            volume,
            timestamp,
        }
    }

    /// Parse and validate one tick from its JSON text.
    pub fn parse(text: &str) -> Result<Self, TickError> {
        let raw: RawTick = serde_json::from_str(text)?;
        Self::try_from(raw)
    }
}

impl TryFrom<RawTick> for Tick {
    type Error = TickError;

    fn try_from(raw: RawTick) -> Result<Self, Self::Error> {
        let price = raw.price.ok_or(TickError::MissingField("price"))?;
        let volume = raw.volume.ok_or(TickError::MissingField("volume"))?;
        let timestamp = raw.timestamp.ok_or(TickError::MissingField("timestamp"))?;

        for (field, value) in [("price", price), ("volume", volume), ("timestamp", timestamp)] {
            if !value.is_finite() {
                return Err(TickError::NotFinite { field, value });
            }
        }

        // Volume is an integer count upstream; fractional input is truncated.
        Ok(Self::new(price, volume.trunc() as i64, timestamp))
    }
}

// =============================================================================
// Bars
// =============================================================================

/// An OHLCV bar. `bar_start` is the folded (local-wall-clock-as-UTC) start
/// instant in epoch seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: Option<f64>,
    #[serde(rename = "unix_timestamp")]
    pub bar_start: f64,
}

impl Bar {
    /// Open a new bar with `tick` as its first sample.
    pub fn opening(tick: &Tick, bar_start: f64) -> Self {
        Self {
            open: tick.price,
            high: tick.price,
            low: tick.price,
            close: tick.price,
            volume: Some(tick.volume as f64),
            bar_start,
        }
    }

    /// Fold another tick into the bar. `open` never changes.
    pub fn absorb(&mut self, tick: &Tick) {
        if tick.price > self.high {
            self.high = tick.price;
        }
        if tick.price < self.low {
            self.low = tick.price;
        }
        self.close = tick.price;
        self.volume = Some(self.volume.unwrap_or(0.0) + tick.volume as f64);
    }

    /// OHLC integrity: high bounds every price, low is bounded by every price.
    #[cfg(test)]
    pub fn is_valid(&self) -> bool {
        self.high >= self.open.max(self.close)
            && self.low <= self.open.min(self.close)
            && self.high >= self.low
    }
}

/// A Heikin-Ashi bar derived from a raw bar plus the prior HA open/close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeikinAshiBar {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: Option<f64>,
    #[serde(rename = "unix_timestamp")]
    pub bar_start: f64,
    #[serde(default)]
    pub regular_open: Option<f64>,
    #[serde(default)]
    pub regular_close: Option<f64>,
}

/// Outbound per-tick payload. `completed_bar` is only present on the tick
/// that closes a bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivePayload<B> {
    pub completed_bar: Option<B>,
    pub current_bar: Option<B>,
}

// =============================================================================
// Intervals and keys
// =============================================================================

/// Which derived stream a connection receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewType {
    Regular,
    HeikinAshi,
    Tick,
}

impl ViewType {
    /// Resolve the view from the subscribe route: the HA route always wins,
    /// otherwise a tick-count interval selects the tick view.
    pub fn for_route(interval: &str, heikin_ashi_route: bool) -> Self {
        if heikin_ashi_route {
            Self::HeikinAshi
        } else if Interval::looks_like_ticks(interval) {
            Self::Tick
        } else {
            Self::Regular
        }
    }
}

impl fmt::Display for ViewType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Regular => write!(f, "regular"),
            Self::HeikinAshi => write!(f, "heikin_ashi"),
            Self::Tick => write!(f, "tick"),
        }
    }
}

/// Parsed interval specifier, decided once when an aggregator is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interval {
    /// Close a bar every N ticks.
    Ticks(u32),
    /// Close a bar on every wall-clock boundary of this many seconds.
    Seconds(i64),
}

/// Fallbacks used when a client sends an interval that does not parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalDefaults {
    pub tick_count: u32,
    pub time_secs: i64,
}

impl Default for IntervalDefaults {
    fn default() -> Self {
        Self {
            tick_count: 1000,
            time_secs: 60,
        }
    }
}

impl Interval {
    pub(crate) fn looks_like_ticks(text: &str) -> bool {
        text.contains("tick")
    }

    /// Strict parse of `<N>tick` or `<N>s|m|h|d`.
    pub fn parse(text: &str) -> Result<Self, IntervalError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(IntervalError::Empty(text.to_string()));
        }

        if let Some(count) = trimmed.strip_suffix("tick") {
            let n: u32 = count
                .parse()
                .map_err(|_| IntervalError::BadCount(text.to_string()))?;
            if n == 0 {
                return Err(IntervalError::Zero(text.to_string()));
            }
            return Ok(Self::Ticks(n));
        }

        let unit_start = trimmed.char_indices().last().map_or(0, |(i, _)| i);
        let (value, unit) = trimmed.split_at(unit_start);
        let multiplier = match unit {
            "s" => 1,
            "m" => 60,
            "h" => 3_600,
            "d" => 86_400,
            _ => return Err(IntervalError::UnknownUnit(text.to_string())),
        };
        let n: i64 = value
            .parse()
            .map_err(|_| IntervalError::BadCount(text.to_string()))?;
        if n <= 0 {
            return Err(IntervalError::Zero(text.to_string()));
        }
        n.checked_mul(multiplier)
            .map(Self::Seconds)
            .ok_or_else(|| IntervalError::Overflow(text.to_string()))
    }

    /// Parse, falling back to a safe default (and logging) instead of
    /// rejecting the connection.
    pub fn parse_or_default(text: &str, defaults: IntervalDefaults) -> Self {
        match Self::parse(text) {
            Ok(interval) => interval,
            Err(e) if Self::looks_like_ticks(text) => {
                tracing::warn!(error = %e, fallback = defaults.tick_count, "invalid tick interval, using default");
                Self::Ticks(defaults.tick_count)
            }
            Err(e) => {
                tracing::warn!(error = %e, fallback_secs = defaults.time_secs, "invalid time interval, using default");
                Self::Seconds(defaults.time_secs)
            }
        }
    }
}

/// `(interval specifier, timezone name)` identifies one aggregator within
/// a subscription group. The raw client strings are kept so payload routing
/// matches exactly what each connection asked for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GranularityKey {
    pub interval: String,
    pub timezone: String,
}

impl GranularityKey {
    pub fn new(interval: impl Into<String>, timezone: impl Into<String>) -> Self {
        Self {
            interval: interval.into(),
            timezone: timezone.into(),
        }
    }
}

impl fmt::Display for GranularityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.interval, self.timezone)
    }
}

/// `(view type, granularity key)` identifies the payload a connection gets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ViewKey {
    pub view: ViewType,
    pub granularity: GranularityKey,
}

impl ViewKey {
    pub fn new(view: ViewType, granularity: GranularityKey) -> Self {
        Self { view, granularity }
    }
}

impl fmt::Display for ViewKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.view, self.granularity)
    }
}
