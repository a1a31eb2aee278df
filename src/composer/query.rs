//! Read-only queries over the composer: search, listing and value readings.
//!
//! Queries never fail. Unknown names give empty results and signals without
//! data give [`Reading::NoData`].

use std::sync::Arc;

use serde::{Deserialize, Serialize, Serializer};

use crate::signal::{Signal, SignalDescription, SignalResolver};
use crate::value::TimeSeriesValue;

use super::Composer;

/// Name matching every signal.
pub const ALL_SIGNALS: &str = "*";

/// Text reported in place of a value when a signal has none.
pub const NO_DATA_MARKER: &str = "No recorded value so far.";

/// Statistics requested from [`Composer::get_signal_value`].
///
/// Each present field selects one statistic; its number is the trailing
/// window in seconds (0 = whole retained history). The window of `last` is
/// ignored.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValueOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last: Option<u64>,
}

#[allow(missing_docs)]
impl ValueOptions {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.average.is_none() && self.minimum.is_none() && self.maximum.is_none() && self.last.is_none()
    }
}

/// A value, or the explicit absence of one.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    Value(TimeSeriesValue),
    NoData,
}

#[allow(missing_docs)]
impl Reading {
    fn number(n: Option<f64>) -> Self {
        n.map_or(Self::NoData, |n| Self::Value(TimeSeriesValue::Number(n)))
    }

    #[must_use]
    pub const fn value(&self) -> Option<&TimeSeriesValue> {
        match self {
            Self::Value(v) => Some(v),
            Self::NoData => None,
        }
    }

    #[must_use]
    pub const fn is_no_data(&self) -> bool {
        matches!(self, Self::NoData)
    }
}

impl From<Option<TimeSeriesValue>> for Reading {
    fn from(value: Option<TimeSeriesValue>) -> Self {
        value.map_or(Self::NoData, Self::Value)
    }
}

impl Serialize for Reading {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Value(v) => v.serialize(serializer),
            Self::NoData => serializer.serialize_str(NO_DATA_MARKER),
        }
    }
}

/// Result of a value query for one signal.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalReading {
    pub signal: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Reading>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average: Option<Reading>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum: Option<Reading>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum: Option<Reading>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last: Option<Reading>,
}

impl SignalReading {
    fn read(signal: &Signal, options: Option<&ValueOptions>) -> Self {
        let mut reading = Self {
            signal: signal.id().to_string(),
            value: None,
            average: None,
            minimum: None,
            maximum: None,
            last: None,
        };
        match options.filter(|o| !o.is_empty()) {
            None => reading.value = Some(signal.last().into()),
            Some(o) => {
                reading.average = o.average.map(|s| Reading::number(signal.average(s)));
                reading.minimum = o.minimum.map(|s| Reading::number(signal.minimum(s)));
                reading.maximum = o.maximum.map(|s| Reading::number(signal.maximum(s)));
                reading.last = o.last.map(|_| signal.last().into());
            }
        }
        reading
    }
}

impl Composer {
    /// All signals of active sources.
    #[must_use]
    pub fn get_all_signals(&self) -> Vec<Arc<Signal>> {
        self.active_sources().iter().flat_map(|s| s.signals()).collect()
    }

    /// Signals matching `name`.
    ///
    /// `"<api>/<name>"` searches only the source with that api, `"*"`
    /// returns every signal, anything else is matched against all signals.
    #[must_use]
    pub fn search_signals(&self, name: &str) -> Vec<Arc<Signal>> {
        if name == ALL_SIGNALS {
            return self.get_all_signals();
        }
        if let Some((api, _)) = name.split_once('/') {
            return self
                .get_source_api(api)
                .map(|source| source.search_signals(name))
                .unwrap_or_default();
        }
        self.get_all_signals().into_iter().filter(|s| s.matches(name)).collect()
    }

    /// Signal with exactly this id, in any source.
    #[must_use]
    pub fn find_signal(&self, id: &str) -> Option<Arc<Signal>> {
        self.all_sources().iter().find_map(|s| s.find_signal(id))
    }

    /// Descriptions of every signal.
    #[must_use]
    pub fn list(&self) -> Vec<SignalDescription> {
        self.get_all_signals().iter().map(|s| s.describe()).collect()
    }

    /// Value readings for every signal matching `name`.
    ///
    /// Without options each reading carries the last value. With options
    /// only the requested statistics are filled in.
    #[must_use]
    pub fn get_signal_value(&self, name: &str, options: Option<&ValueOptions>) -> Vec<SignalReading> {
        self.search_signals(name)
            .iter()
            .map(|signal| SignalReading::read(signal, options))
            .collect()
    }
}

impl SignalResolver for Composer {
    fn find_signal(&self, id: &str) -> Option<Arc<Signal>> {
        Composer::find_signal(self, id)
    }

    fn search_signals(&self, name: &str) -> Vec<Arc<Signal>> {
        Composer::search_signals(self, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reading_serialization() {
        let no_data = serde_json::to_value(Reading::NoData).unwrap();
        assert_eq!(no_data, json!("No recorded value so far."));
        let value = serde_json::to_value(Reading::Value(TimeSeriesValue::from(2.5))).unwrap();
        assert_eq!(value, json!(2.5));
    }

    #[test]
    fn test_signal_reading_without_options() {
        let signal = Signal::builder("speed").event("low-can/speed").build().unwrap();
        let reading = SignalReading::read(&signal, None);
        assert_eq!(reading.value, Some(Reading::NoData));
        assert_eq!(
            serde_json::to_value(&reading).unwrap(),
            json!({"signal": "speed", "value": "No recorded value so far."})
        );
    }

    #[test]
    fn test_signal_reading_with_options() {
        let signal = Signal::builder("speed").event("low-can/speed").build().unwrap();
        for (ts, v) in [(1_000_000, 1.0), (2_000_000, 2.0), (3_000_000, 3.0)] {
            signal.set(ts, TimeSeriesValue::from(v));
        }
        let options = ValueOptions {
            average: Some(0),
            maximum: Some(1),
            ..ValueOptions::default()
        };
        let reading = SignalReading::read(&signal, Some(&options));
        assert_eq!(reading.value, None);
        assert_eq!(reading.average, Some(Reading::Value(TimeSeriesValue::from(2.0))));
        assert_eq!(reading.maximum, Some(Reading::Value(TimeSeriesValue::from(3.0))));
        assert_eq!(reading.minimum, None);
        assert_eq!(reading.last, None);
    }

    #[test]
    fn test_empty_options_behave_like_none() {
        let signal = Signal::builder("s").event("a/s").build().unwrap();
        signal.set(1, TimeSeriesValue::from("on"));
        let reading = SignalReading::read(&signal, Some(&ValueOptions::default()));
        assert_eq!(reading.value, Some(Reading::Value(TimeSeriesValue::from("on"))));
    }

    #[test]
    fn test_value_options_reject_unknown() {
        let res: Result<ValueOptions, _> = serde_json::from_value(json!({"median": 3}));
        assert!(res.is_err());
    }
}
