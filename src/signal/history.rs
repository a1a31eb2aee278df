use std::collections::BTreeMap;

use crate::time::seconds_to_micros;
use crate::value::TimeSeriesValue;

/// Time-ordered samples of one signal, bounded by a retention span.
///
/// Keys are microsecond timestamps. After every insertion, entries older than
/// the retention span relative to the newest key are dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct History {
    entries: BTreeMap<u64, TimeSeriesValue>,
    retention_us: u64,
}

#[allow(missing_docs)]
impl History {
    #[must_use]
    pub fn new(retention_secs: u64) -> Self {
        Self {
            entries: BTreeMap::new(),
            retention_us: seconds_to_micros(retention_secs),
        }
    }

    /// Records a sample and prunes. A sample at an existing timestamp
    /// replaces it.
    pub fn insert(&mut self, timestamp: u64, value: TimeSeriesValue) {
        self.entries.insert(timestamp, value);
        self.prune();
    }

    fn prune(&mut self) {
        let Some(newest) = self.newest() else {
            return;
        };
        let cutoff = newest.saturating_sub(self.retention_us);
        if cutoff > 0 {
            self.entries = self.entries.split_off(&cutoff);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn newest(&self) -> Option<u64> {
        self.entries.keys().next_back().copied()
    }

    #[must_use]
    pub fn oldest(&self) -> Option<u64> {
        self.entries.keys().next().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &TimeSeriesValue)> + '_ {
        self.entries.iter().map(|(ts, v)| (*ts, v))
    }

    /// Samples no older than `seconds` before the newest one. Zero selects
    /// everything retained.
    pub fn window(&self, seconds: u64) -> impl Iterator<Item = (u64, &TimeSeriesValue)> + '_ {
        let start = match (seconds, self.newest()) {
            (0, _) | (_, None) => 0,
            (s, Some(newest)) => newest.saturating_sub(seconds_to_micros(s)),
        };
        self.entries.range(start..).map(|(ts, v)| (*ts, v))
    }

    fn numbers(&self, seconds: u64) -> impl Iterator<Item = f64> + '_ {
        self.window(seconds).filter_map(|(_, v)| v.as_number())
    }

    /// Mean of the numeric samples in the window.
    #[must_use]
    pub fn average(&self, seconds: u64) -> Option<f64> {
        let (sum, count) = self
            .numbers(seconds)
            .fold((0.0, 0_u32), |(sum, count), n| (sum + n, count + 1));
        (count > 0).then(|| sum / f64::from(count))
    }

    #[must_use]
    pub fn minimum(&self, seconds: u64) -> Option<f64> {
        self.numbers(seconds).reduce(f64::min)
    }

    #[must_use]
    pub fn maximum(&self, seconds: u64) -> Option<f64> {
        self.numbers(seconds).reduce(f64::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: u64 = 1_000_000;

    fn numeric(values: &[(u64, f64)]) -> History {
        let mut h = History::new(30);
        for (ts, v) in values {
            h.insert(*ts, TimeSeriesValue::Number(*v));
        }
        h
    }

    #[test]
    fn test_statistics() {
        let h = numeric(&[(SEC, 1.0), (2 * SEC, 2.0), (3 * SEC, 3.0)]);
        assert_eq!(h.average(0), Some(2.0));
        assert_eq!(h.minimum(0), Some(1.0));
        assert_eq!(h.maximum(0), Some(3.0));
    }

    #[test]
    fn test_statistics_window() {
        let h = numeric(&[(SEC, 1.0), (2 * SEC, 2.0), (3 * SEC, 3.0)]);
        // One second back from the newest sample covers the last two.
        assert_eq!(h.average(1), Some(2.5));
        assert_eq!(h.minimum(1), Some(2.0));
        assert_eq!(h.window(1).count(), 2);
    }

    #[test]
    fn test_statistics_without_numbers() {
        let mut h = History::new(30);
        h.insert(SEC, TimeSeriesValue::from("open"));
        h.insert(2 * SEC, TimeSeriesValue::from(true));
        assert_eq!(h.average(0), None);
        assert_eq!(h.minimum(0), None);
        assert_eq!(h.maximum(0), None);
        assert_eq!(History::new(30).average(0), None);
    }

    #[test]
    fn test_mixed_history_skips_non_numeric() {
        let mut h = numeric(&[(SEC, 4.0)]);
        h.insert(2 * SEC, TimeSeriesValue::from("n/a"));
        h.insert(3 * SEC, TimeSeriesValue::from(8.0));
        assert_eq!(h.average(0), Some(6.0));
    }

    #[test]
    fn test_retention_prunes_relative_to_newest() {
        let mut h = History::new(10);
        for s in 0..=25 {
            h.insert(s * SEC, TimeSeriesValue::from(1.0));
        }
        assert_eq!(h.newest(), Some(25 * SEC));
        assert_eq!(h.oldest(), Some(15 * SEC));
        assert_eq!(h.len(), 11);
    }

    #[test]
    fn test_same_timestamp_replaces() {
        let mut h = History::new(10);
        h.insert(SEC, TimeSeriesValue::from(1.0));
        h.insert(SEC, TimeSeriesValue::from(2.0));
        assert_eq!(h.len(), 1);
        assert_eq!(h.iter().next().map(|(_, v)| v.clone()), Some(TimeSeriesValue::from(2.0)));
    }
}
