// =============================================================================
// Heikin-Ashi Transform — incremental smoothing over a bar stream
// =============================================================================
//
//   ha_close = (open + high + low + close) / 4
//   ha_open  = (prev_ha_open + prev_ha_close) / 2   once primed
//            = (open + close) / 2                   bootstrap
//   ha_high  = max(high, ha_open, ha_close)
//   ha_low   = min(low,  ha_open, ha_close)
//
// Completed bars advance the running state; the in-progress bar is only
// peeked, since it will keep changing until it closes.
// =============================================================================

use tracing::info;

use crate::types::{Bar, HeikinAshiBar};

#[derive(Debug, Clone, Default)]
pub struct HeikinAshiTransform {
    /// `(prev_ha_open, prev_ha_close)` from the last completed HA bar.
    prev: Option<(f64, f64)>,
}

impl HeikinAshiTransform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the running state from the tail of a historical HA series so
    /// live continuation has no discontinuity.
    pub fn seed_from_history(&mut self, history: &[HeikinAshiBar]) {
        if let Some(last) = history.last() {
            self.prev = Some((last.open, last.close));
            info!(prev_ha_open = last.open, prev_ha_close = last.close, "heikin-ashi transform seeded");
        }
    }

    /// Whether at least one completed bar (or a seed) has been applied.
    #[cfg(test)]
    pub fn is_primed(&self) -> bool {
        self.prev.is_some()
    }

    /// Transform a completed bar and advance the running state.
    pub fn advance(&mut self, completed: &Bar) -> HeikinAshiBar {
        let ha = self.compute(completed);
        self.prev = Some((ha.open, ha.close));
        ha
    }

    /// Transform the in-progress bar without touching the running state.
    pub fn peek(&self, current: &Bar) -> HeikinAshiBar {
        self.compute(current)
    }

    fn compute(&self, bar: &Bar) -> HeikinAshiBar {
        let close = (bar.open + bar.high + bar.low + bar.close) / 4.0;
        let open = match self.prev {
            Some((prev_open, prev_close)) => (prev_open + prev_close) / 2.0,
            None => (bar.open + bar.close) / 2.0,
        };

        HeikinAshiBar {
            open,
            high: bar.high.max(open).max(close),
            low: bar.low.min(open).min(close),
            close,
            volume: bar.volume,
            bar_start: bar.bar_start,
            regular_open: Some(bar.open),
            regular_close: Some(bar.close),
        }
    }
}

/// Transform a full series of completed bars from a fresh state.
pub fn heikin_ashi_series(bars: &[Bar]) -> Vec<HeikinAshiBar> {
    let mut transform = HeikinAshiTransform::new();
    bars.iter().map(|bar| transform.advance(bar)).collect()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn bar(open: f64, high: f64, low: f64, close: f64, start: f64) -> Bar {
        Bar {
            open,
            high,
            low,
            close,
            volume: Some(1.0),
            bar_start: start,
        }
    }

    fn assert_envelope(raw: &Bar, ha: &HeikinAshiBar) {
        assert_eq!(ha.high, raw.high.max(ha.open).max(ha.close));
        assert_eq!(ha.low, raw.low.min(ha.open).min(ha.close));
    }

    #[test]
    fn bootstrap_uses_bar_open_close() {
        let mut transform = HeikinAshiTransform::new();
        let raw = bar(10.0, 14.0, 8.0, 12.0, 0.0);
        let ha = transform.advance(&raw);
        assert_eq!(ha.close, 11.0);
        assert_eq!(ha.open, 11.0);
        assert_eq!(ha.regular_open, Some(10.0));
        assert_eq!(ha.regular_close, Some(12.0));
        assert_envelope(&raw, &ha);
    }

    #[test]
    fn advance_chains_previous_state() {
        let mut transform = HeikinAshiTransform::new();
        transform.advance(&bar(10.0, 14.0, 8.0, 12.0, 0.0));
        let raw = bar(12.0, 20.0, 11.0, 19.0, 60.0);
        let ha = transform.advance(&raw);
        // prev (11, 11) -> open 11; close (12+20+11+19)/4 = 15.5
        assert_eq!(ha.open, 11.0);
        assert_eq!(ha.close, 15.5);
        assert_eq!(ha.high, 20.0);
        assert_eq!(ha.low, 11.0);
    }

    #[test]
    fn peek_does_not_mutate() {
        let mut transform = HeikinAshiTransform::new();
        transform.advance(&bar(10.0, 14.0, 8.0, 12.0, 0.0));

        let in_progress = bar(30.0, 40.0, 25.0, 35.0, 60.0);
        let first = transform.peek(&in_progress);
        let second = transform.peek(&in_progress);
        assert_eq!(first, second);

        // Advancing afterwards still chains from the first completed bar.
        let ha = transform.advance(&in_progress);
        assert_eq!(ha.open, 11.0);
    }

    #[test]
    fn low_extends_below_raw_when_ha_open_is_lower() {
        let mut transform = HeikinAshiTransform::new();
        transform.seed_from_history(&[HeikinAshiBar {
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: None,
            bar_start: 0.0,
            regular_open: None,
            regular_close: None,
        }]);
        let raw = bar(50.0, 55.0, 45.0, 52.0, 60.0);
        let ha = transform.peek(&raw);
        assert_eq!(ha.open, 1.0);
        assert_eq!(ha.low, 1.0);
        assert_envelope(&raw, &ha);
    }

    #[test]
    fn seeding_matches_series_continuation() {
        let history = vec![
            bar(10.0, 12.0, 9.0, 11.0, 0.0),
            bar(11.0, 13.0, 10.0, 12.5, 60.0),
            bar(12.5, 12.8, 10.2, 10.4, 120.0),
        ];
        let next = bar(10.4, 11.0, 9.8, 10.9, 180.0);

        let mut full = history.clone();
        full.push(next.clone());
        let expected = heikin_ashi_series(&full).pop().unwrap();

        let mut live = HeikinAshiTransform::new();
        assert!(!live.is_primed());
        live.seed_from_history(&heikin_ashi_series(&history));
        assert!(live.is_primed());
        assert_eq!(live.advance(&next), expected);
    }

    #[test]
    fn series_envelope_holds_everywhere() {
        let bars: Vec<Bar> = (0..50)
            .map(|i| {
                let base = 100.0 + (i as f64 * 0.7).sin() * 5.0;
                bar(base, base + 2.0, base - 3.0, base + 0.5, i as f64 * 60.0)
            })
            .collect();
        for (raw, ha) in bars.iter().zip(heikin_ashi_series(&bars)) {
            assert_envelope(raw, &ha);
        }
    }
}
