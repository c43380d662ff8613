// =============================================================================
// Bar Aggregators — tick stream to time-based or count-based bars
// =============================================================================
//
// Pure state machines: no I/O, no locking. Each aggregator consumes one tick
// at a time, optionally returns the bar that the tick closed, and exposes the
// in-progress bar.
//
// Timestamps are "folded": the tick instant is converted into the configured
// timezone and the local wall-clock fields are re-read as if they were UTC.
// Charts plotting raw epoch seconds then show local-looking gridlines.
// =============================================================================

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use thiserror::Error;
use tracing::warn;

use crate::types::{Bar, Interval, Tick};

/// Smallest step used to keep count-bar timestamps strictly increasing.
const MONOTONIC_BUMP_SECS: f64 = 0.000_001;

#[derive(Debug, Error, PartialEq)]
pub enum AggregateError {
    #[error("timestamp {0} is outside the representable range")]
    TimestampOutOfRange(f64),
}

// =============================================================================
// Timezone folding
// =============================================================================

/// Resolve an IANA timezone name, falling back to UTC with a warning.
pub fn resolve_timezone(name: &str) -> Tz {
    match name.parse::<Tz>() {
        Ok(tz) => tz,
        Err(_) => {
            warn!(timezone = %name, "unknown timezone, defaulting to UTC");
            Tz::UTC
        }
    }
}

/// Re-express an epoch instant as the local wall clock in `tz`, marked UTC.
/// Microsecond precision is preserved.
pub fn fold_timestamp(timestamp: f64, tz: Tz) -> Result<f64, AggregateError> {
    let secs = timestamp.floor();
    let nanos = ((timestamp - secs) * 1e9).round().min(999_999_999.0) as u32;
    let utc = DateTime::from_timestamp(secs as i64, nanos)
        .ok_or(AggregateError::TimestampOutOfRange(timestamp))?;

    let local = utc.with_timezone(&tz).naive_local();
    let folded = Utc.from_utc_datetime(&local);

    Ok(folded.timestamp() as f64 + f64::from(folded.timestamp_subsec_micros()) / 1e6)
}

// =============================================================================
// Time-based aggregator
// =============================================================================

/// Closes a bar whenever a tick lands in a later wall-clock bucket.
#[derive(Debug, Clone)]
pub struct TimeBarAggregator {
    interval_secs: i64,
    tz: Tz,
    current: Option<Bar>,
}

impl TimeBarAggregator {
    pub fn new(interval_secs: i64, tz: Tz) -> Self {
        Self {
            interval_secs: interval_secs.max(1),
            tz,
            current: None,
        }
    }

    /// Folded start of the bucket containing `timestamp`. Flooring happens in
    /// local wall-clock space so buckets line up with local gridlines.
    pub fn bucket_start(&self, timestamp: f64) -> Result<f64, AggregateError> {
        let local = fold_timestamp(timestamp, self.tz)?.floor() as i64;
        Ok((local.div_euclid(self.interval_secs) * self.interval_secs) as f64)
    }

    pub fn update(&mut self, tick: &Tick) -> Result<Option<Bar>, AggregateError> {
        let bar_start = self.bucket_start(tick.timestamp)?;

        match self.current.as_mut() {
            None => {
                self.current = Some(Bar::opening(tick, bar_start));
                Ok(None)
            }
            Some(bar) if bar_start > bar.bar_start => {
                let completed = std::mem::replace(bar, Bar::opening(tick, bar_start));
                Ok(Some(completed))
            }
            Some(bar) => {
                bar.absorb(tick);
                Ok(None)
            }
        }
    }

    pub fn current_bar(&self) -> Option<&Bar> {
        self.current.as_ref()
    }
}

// =============================================================================
// Count-based aggregator
// =============================================================================

/// Closes a bar every `ticks_per_bar` ticks.
///
/// Bars carry a synthetic start no earlier than one microsecond after the
/// last completed bar, so bursts of identical tick times still produce
/// strictly increasing bar timestamps. Under heavy bursts these drift from
/// the real tick times; charts only need the ordering.
#[derive(Debug, Clone)]
pub struct TickBarAggregator {
    ticks_per_bar: u32,
    tz: Tz,
    current: Option<Bar>,
    tick_count: u32,
    last_completed_ts: Option<f64>,
}

impl TickBarAggregator {
    pub fn new(ticks_per_bar: u32, tz: Tz) -> Self {
        Self {
            ticks_per_bar: ticks_per_bar.max(1),
            tz,
            current: None,
            tick_count: 0,
            last_completed_ts: None,
        }
    }

    pub fn update(&mut self, tick: &Tick) -> Result<Option<Bar>, AggregateError> {
        let mut timestamp = fold_timestamp(tick.timestamp, self.tz)?;
        if let Some(last) = self.last_completed_ts {
            if timestamp <= last {
                timestamp = last + MONOTONIC_BUMP_SECS;
            }
        }

        match self.current.as_mut() {
            None => self.current = Some(Bar::opening(tick, timestamp)),
            Some(bar) => bar.absorb(tick),
        }
        self.tick_count += 1;

        if self.tick_count < self.ticks_per_bar {
            return Ok(None);
        }

        self.tick_count = 0;
        let completed = self.current.take();
        if let Some(bar) = &completed {
            self.last_completed_ts = Some(bar.bar_start);
        }
        Ok(completed)
    }

    pub fn current_bar(&self) -> Option<&Bar> {
        self.current.as_ref()
    }

    /// Ticks accumulated into the in-progress bar.
    #[cfg(test)]
    pub fn pending_ticks(&self) -> u32 {
        self.tick_count
    }
}

// =============================================================================
// Aggregator — variant chosen once from the parsed interval
// =============================================================================

#[derive(Debug, Clone)]
pub enum Aggregator {
    Time(TimeBarAggregator),
    Count(TickBarAggregator),
}

impl Aggregator {
    pub fn new(interval: Interval, tz: Tz) -> Self {
        match interval {
            Interval::Ticks(n) => Self::Count(TickBarAggregator::new(n, tz)),
            Interval::Seconds(secs) => Self::Time(TimeBarAggregator::new(secs, tz)),
        }
    }

    /// Consume one tick; returns the bar it closed, if any.
    pub fn update(&mut self, tick: &Tick) -> Result<Option<Bar>, AggregateError> {
        match self {
            Self::Time(agg) => agg.update(tick),
            Self::Count(agg) => agg.update(tick),
        }
    }

    pub fn current_bar(&self) -> Option<&Bar> {
        match self {
            Self::Time(agg) => agg.current_bar(),
            Self::Count(agg) => agg.current_bar(),
        }
    }

    pub fn is_tick_based(&self) -> bool {
        matches!(self, Self::Count(_))
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic pseudo-random tick stream (LCG), no external RNG needed.
    fn synthetic_ticks(n: usize, seed: u64) -> Vec<Tick> {
        let mut state = seed;
        let mut price = 100.0;
        let mut ts = 1_700_000_000.0;
        (0..n)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let step = ((state >> 33) % 200) as f64 / 100.0 - 1.0;
                price = (price + step).max(1.0);
                ts += ((state >> 20) % 7) as f64;
                Tick::new(price, ((state >> 40) % 50) as i64 + 1, ts)
            })
            .collect()
    }

    fn utc_minute() -> Aggregator {
        Aggregator::new(Interval::Seconds(60), Tz::UTC)
    }

    #[test]
    fn time_bar_scenario_closes_on_next_bucket() {
        let mut agg = utc_minute();

        assert_eq!(agg.update(&Tick::new(100.0, 10, 0.0)).unwrap(), None);
        assert_eq!(agg.update(&Tick::new(105.0, 5, 30.0)).unwrap(), None);

        let current = agg.current_bar().unwrap();
        assert_eq!(
            (current.open, current.high, current.low, current.close, current.volume),
            (100.0, 105.0, 100.0, 105.0, Some(15.0))
        );

        let completed = agg.update(&Tick::new(95.0, 7, 65.0)).unwrap().unwrap();
        assert_eq!(
            completed,
            Bar {
                open: 100.0,
                high: 105.0,
                low: 100.0,
                close: 105.0,
                volume: Some(15.0),
                bar_start: 0.0,
            }
        );

        let current = agg.current_bar().unwrap();
        assert_eq!(
            *current,
            Bar {
                open: 95.0,
                high: 95.0,
                low: 95.0,
                close: 95.0,
                volume: Some(7.0),
                bar_start: 60.0,
            }
        );
    }

    #[test]
    fn time_bar_late_tick_updates_current() {
        let mut agg = utc_minute();
        agg.update(&Tick::new(100.0, 1, 70.0)).unwrap();
        // Out-of-order tick from an earlier bucket must not reopen anything.
        assert_eq!(agg.update(&Tick::new(90.0, 1, 10.0)).unwrap(), None);
        let bar = agg.current_bar().unwrap();
        assert_eq!(bar.bar_start, 60.0);
        assert_eq!(bar.open, 100.0);
        assert_eq!(bar.low, 90.0);
    }

    #[test]
    fn time_bars_satisfy_ohlc_invariant() {
        let mut agg = Aggregator::new(Interval::Seconds(30), Tz::UTC);
        let mut completed = 0;
        for tick in synthetic_ticks(5_000, 7) {
            if let Some(bar) = agg.update(&tick).unwrap() {
                assert!(bar.high >= bar.open.max(bar.close));
                assert!(bar.low <= bar.open.min(bar.close));
                completed += 1;
            }
        }
        assert!(completed > 100);
    }

    #[test]
    fn timezone_folding_shifts_bar_start() {
        let ny: Tz = "America/New_York".parse().unwrap();
        // 2024-01-15 14:30:10 UTC == 09:30:10 EST.
        let ts = 1_705_329_010.0;
        let folded = fold_timestamp(ts, ny).unwrap();
        assert_eq!(folded, ts - 5.0 * 3_600.0);

        let mut agg = Aggregator::new(Interval::Seconds(3_600), ny);
        agg.update(&Tick::new(1.0, 1, ts)).unwrap();
        // 09:00 local expressed as UTC.
        assert_eq!(agg.current_bar().unwrap().bar_start, 1_705_309_200.0);
    }

    #[test]
    fn half_hour_offset_zone_floors_on_local_hours() {
        let kolkata: Tz = "Asia/Kolkata".parse().unwrap();
        // 2024-01-15 04:10:00 UTC == 09:40 IST -> local hour bucket 09:00.
        let ts = 1_705_291_800.0;
        let agg = TimeBarAggregator::new(3_600, kolkata);
        let start = agg.bucket_start(ts).unwrap();
        assert_eq!(start, 1_705_309_200.0);
    }

    #[test]
    fn unknown_timezone_falls_back_to_utc() {
        assert_eq!(resolve_timezone("Mars/Olympus"), Tz::UTC);
        assert_eq!(resolve_timezone("Europe/London"), Tz::Europe__London);
    }

    #[test]
    fn count_bar_scenario_three_ticks_four_fed() {
        let mut agg = Aggregator::new(Interval::Ticks(3), Tz::UTC);
        let ticks = [
            Tick::new(10.0, 1, 100.0),
            Tick::new(12.0, 2, 101.0),
            Tick::new(9.0, 3, 102.0),
            Tick::new(11.0, 4, 103.0),
        ];

        let mut completed = Vec::new();
        for tick in &ticks {
            if let Some(bar) = agg.update(tick).unwrap() {
                completed.push(bar);
            }
        }

        assert_eq!(completed.len(), 1);
        let bar = &completed[0];
        assert_eq!((bar.open, bar.high, bar.low, bar.close), (10.0, 12.0, 9.0, 9.0));
        assert_eq!(bar.volume, Some(6.0));

        let current = agg.current_bar().unwrap();
        assert_eq!((current.open, current.close, current.volume), (11.0, 11.0, Some(4.0)));
        match &agg {
            Aggregator::Count(inner) => assert_eq!(inner.pending_ticks(), 1),
            Aggregator::Time(_) => unreachable!(),
        }
    }

    #[test]
    fn count_bars_one_per_n_ticks_with_increasing_timestamps() {
        let n = 5;
        let mut agg = Aggregator::new(Interval::Ticks(n), Tz::UTC);
        let mut completed = Vec::new();
        // Every tick shares one timestamp: worst case for monotonicity.
        for i in 0..53 {
            if let Some(bar) = agg.update(&Tick::new(100.0 + i as f64, 1, 1_700_000_000.0)).unwrap() {
                completed.push(bar);
            }
        }
        assert_eq!(completed.len(), 53 / n as usize);
        for pair in completed.windows(2) {
            assert!(pair[1].bar_start > pair[0].bar_start);
        }
    }

    #[test]
    fn replay_is_deterministic() {
        let ticks = synthetic_ticks(2_000, 42);
        let run = |interval| {
            let mut agg = Aggregator::new(interval, Tz::UTC);
            ticks
                .iter()
                .filter_map(|t| agg.update(t).unwrap())
                .collect::<Vec<_>>()
        };
        assert_eq!(run(Interval::Seconds(60)), run(Interval::Seconds(60)));
        assert_eq!(run(Interval::Ticks(17)), run(Interval::Ticks(17)));
    }

    #[test]
    fn out_of_range_timestamp_leaves_state_untouched() {
        let mut agg = utc_minute();
        agg.update(&Tick::new(100.0, 1, 0.0)).unwrap();
        let err = agg.update(&Tick::new(200.0, 1, 1e20)).unwrap_err();
        assert!(matches!(err, AggregateError::TimestampOutOfRange(_)));
        assert_eq!(agg.current_bar().unwrap().high, 100.0);
    }
}
