//! Values recorded in signal histories.
//!
//! A signal carries exactly one of three scalar kinds. Provider payloads are
//! loosely typed JSON documents; conversion happens once at the boundary so the
//! rest of the engine only sees [`TimeSeriesValue`].

use serde::{Deserialize, Serialize};

/// A single recorded signal value.
///
/// # Examples
///
/// ```
/// use signal_composer::TimeSeriesValue;
///
/// let speed = TimeSeriesValue::from(42.5);
/// let door = TimeSeriesValue::from(true);
///
/// assert_eq!(speed.as_number(), Some(42.5));
/// assert!(door.is_bool());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TimeSeriesValue {
    /// Switch or flag state.
    Bool(bool),
    /// Any numeric reading. Integers from providers are widened.
    Number(f64),
    /// Enumerated or textual state.
    String(String),
}

#[allow(missing_docs)]
impl TimeSeriesValue {
    pub const fn is_bool(&self) -> bool {
        matches!(self, Self::Bool(_))
    }

    pub const fn is_number(&self) -> bool {
        matches!(self, Self::Number(_))
    }

    pub const fn is_string(&self) -> bool {
        matches!(self, Self::String(_))
    }

    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub const fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    /// Returns a human-readable type name.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Number(_) => "number",
            Self::String(_) => "string",
        }
    }

    /// Converts a provider payload scalar.
    ///
    /// Returns `None` for null, arrays and objects.
    #[must_use]
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(Self::Bool(*b)),
            serde_json::Value::Number(n) => n.as_f64().map(Self::Number),
            serde_json::Value::String(s) => Some(Self::String(s.clone())),
            _ => None,
        }
    }

    /// Converts to a response document scalar.
    ///
    /// Non-finite numbers have no JSON representation and become `null`.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Number(n) => serde_json::Number::from_f64(*n)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Self::String(s) => serde_json::Value::String(s.clone()),
        }
    }
}

impl std::fmt::Display for TimeSeriesValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Number(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "{v:?}"),
        }
    }
}

impl From<bool> for TimeSeriesValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for TimeSeriesValue {
    fn from(v: i32) -> Self {
        Self::Number(f64::from(v))
    }
}

impl From<f64> for TimeSeriesValue {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<String> for TimeSeriesValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for TimeSeriesValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_kinds() {
        assert!(TimeSeriesValue::from(true).is_bool());
        assert!(TimeSeriesValue::from(1.5).is_number());
        assert!(TimeSeriesValue::from("open").is_string());
        assert_eq!(TimeSeriesValue::from(7).as_number(), Some(7.0));
        assert_eq!(TimeSeriesValue::from("open").as_str(), Some("open"));
        assert_eq!(TimeSeriesValue::from(false).type_name(), "bool");
    }

    #[test]
    fn test_value_type_mismatch() {
        let val = TimeSeriesValue::Bool(true);
        assert!(val.as_number().is_none());
        assert!(val.as_str().is_none());
    }

    #[test]
    fn test_from_json_scalars() {
        assert_eq!(TimeSeriesValue::from_json(&json!(10)), Some(TimeSeriesValue::Number(10.0)));
        assert_eq!(TimeSeriesValue::from_json(&json!(true)), Some(TimeSeriesValue::Bool(true)));
        assert_eq!(
            TimeSeriesValue::from_json(&json!("closed")),
            Some(TimeSeriesValue::String("closed".into()))
        );
        assert_eq!(TimeSeriesValue::from_json(&json!(null)), None);
        assert_eq!(TimeSeriesValue::from_json(&json!({"value": 1})), None);
    }

    #[test]
    fn test_to_json_non_finite() {
        assert_eq!(TimeSeriesValue::Number(f64::NAN).to_json(), serde_json::Value::Null);
        assert_eq!(TimeSeriesValue::Number(2.5).to_json(), json!(2.5));
    }

    #[test]
    fn test_untagged_serialization() {
        let json = serde_json::to_value(TimeSeriesValue::Number(3.0)).unwrap();
        assert_eq!(json, json!(3.0));
        let back: TimeSeriesValue = serde_json::from_value(json!(12)).unwrap();
        assert_eq!(back, TimeSeriesValue::Number(12.0));
    }

    #[test]
    fn test_value_display() {
        assert_eq!(format!("{}", TimeSeriesValue::Bool(true)), "true");
        assert_eq!(format!("{}", TimeSeriesValue::String("hi".into())), "\"hi\"");
    }
}
