//! Engine settings and source/signal declarations.
//!
//! A [`ConfigDocument`] keeps its `sources` and `signals` entries as raw JSON
//! so that one malformed entry can be reported and skipped without losing
//! the rest of the document. Each entry is parsed on its own into a
//! [`SourceConfig`] or [`SignalConfig`].

use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as Json;

use crate::action::ActionDescriptor;
use crate::error::ConfigError;
use crate::signal::DEFAULT_RETENTION_SECS;
use crate::source::SELF_SOURCE_API;

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComposerConfig {
    /// Engine name. The self source takes it as its api.
    pub name: String,
    /// Retention, in seconds, for signals and sources that set none.
    pub default_retention: u64,
    /// Per-client push buffer capacity.
    pub stream_capacity: usize,
}

impl Default for ComposerConfig {
    fn default() -> Self {
        Self {
            name: SELF_SOURCE_API.to_string(),
            default_retention: DEFAULT_RETENTION_SECS,
            stream_capacity: 256,
        }
    }
}

#[allow(missing_docs)]
impl ComposerConfig {
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Document metadata block.
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Metadata {
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Engine name override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
    /// Provider apis the document expects to be available.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub require: Vec<String>,
}

/// A configuration document: metadata plus source and signal entries.
///
/// # Examples
///
/// ```
/// use signal_composer::ConfigDocument;
///
/// let doc = ConfigDocument::from_json_str(r#"{
///     "sources": {"uid": "can", "api": "low-can"},
///     "signals": [
///         {"uid": "speed", "event": "low-can/speed", "unit": "km/h"},
///         {"uid": "speed_avg", "depends": "speed"}
///     ]
/// }"#).unwrap();
///
/// assert_eq!(doc.sources.len(), 1);
/// assert_eq!(doc.signals.len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    /// Source entries. A single object is accepted in place of an array.
    #[serde(default, deserialize_with = "one_or_many")]
    pub sources: Vec<Json>,
    /// Signal entries. A single object is accepted in place of an array.
    #[serde(default, deserialize_with = "one_or_many")]
    pub signals: Vec<Json>,
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<Json>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Json::deserialize(deserializer)? {
        Json::Array(items) => items,
        Json::Null => Vec::new(),
        single => vec![single],
    })
}

impl ConfigDocument {
    /// Parses a JSON document.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Malformed` when the text is not a valid document.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(|e| ConfigError::Malformed {
            kind: "document",
            reason: e.to_string(),
        })
    }

    /// Reads and parses a JSON document from disk.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Malformed` when the file cannot be read or parsed.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Malformed {
            kind: "document",
            reason: format!("{}: {e}", path.display()),
        })?;
        Self::from_json_str(&text)
    }

    /// Engine name requested by the metadata block, if any.
    #[must_use]
    pub fn engine_name(&self) -> Option<&str> {
        self.metadata.as_ref().and_then(|m| m.api.as_deref())
    }
}

/// One source declaration.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct SourceConfig {
    pub uid: String,
    /// Provider api. Defaults to the uid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<ActionDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get_signals: Option<ActionDescriptor>,
    /// Default `onReceived` for the source's signals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_received: Option<ActionDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention: Option<u64>,
}

#[allow(missing_docs)]
impl SourceConfig {
    /// Parses one `sources` entry.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingField` without a `uid`, or
    /// `ConfigError::Malformed` for any other shape problem.
    pub fn from_json(entry: &Json) -> Result<Self, ConfigError> {
        parse_entry(entry, "source")
    }

    #[must_use]
    pub fn api(&self) -> &str {
        self.api.as_deref().unwrap_or(&self.uid)
    }
}

/// A `depends` field: one id or a list of ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Depends {
    One(String),
    Many(Vec<String>),
}

#[allow(missing_docs)]
impl Depends {
    #[must_use]
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Self::One(id) => vec![id.clone()],
            Self::Many(ids) => ids.clone(),
        }
    }
}

/// One signal declaration.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct SignalConfig {
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends: Option<Depends>,
    /// Forwarded verbatim to the provider when subscribing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get_signals_args: Option<Json>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_received: Option<ActionDescriptor>,
}

#[allow(missing_docs)]
impl SignalConfig {
    /// Parses one `signals` entry and checks its shape.
    ///
    /// # Errors
    ///
    /// Besides parse errors: `ConfigError::AmbiguousSignal` unless exactly one
    /// of `event`/`depends` is present, `ConfigError::InvalidEvent` for an
    /// event without `/`, `ConfigError::QualifiedDependency` for a dependency
    /// naming a provider channel instead of a signal id.
    pub fn from_json(entry: &Json) -> Result<Self, ConfigError> {
        let config: Self = parse_entry(entry, "signal")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.event.is_some() == self.depends.is_some() {
            return Err(ConfigError::AmbiguousSignal { id: self.uid.clone() });
        }
        if let Some(event) = &self.event {
            if !event.contains('/') {
                return Err(ConfigError::InvalidEvent { event: event.clone() });
            }
        }
        if let Some(dependency) = self.depends_list().into_iter().find(|d| d.contains('/')) {
            return Err(ConfigError::QualifiedDependency {
                id: self.uid.clone(),
                dependency,
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn depends_list(&self) -> Vec<String> {
        self.depends.as_ref().map(Depends::to_vec).unwrap_or_default()
    }

    /// Api of the source named by `event`.
    #[must_use]
    pub fn event_api(&self) -> Option<&str> {
        self.event.as_deref().and_then(|e| e.split_once('/')).map(|(api, _)| api)
    }
}

fn parse_entry<T: serde::de::DeserializeOwned>(entry: &Json, kind: &'static str) -> Result<T, ConfigError> {
    if entry.get("uid").and_then(Json::as_str).is_none() {
        return Err(ConfigError::MissingField { field: "uid".into() });
    }
    T::deserialize(entry).map_err(|e| ConfigError::Malformed {
        kind,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_composer_config_defaults() {
        let config = ComposerConfig::default();
        assert_eq!(config.name, "signal-composer");
        assert_eq!(config.default_retention, 30);
        let named = ComposerConfig::named("sc");
        assert_eq!(named.name, "sc");
        assert_eq!(named.stream_capacity, config.stream_capacity);
    }

    #[test]
    fn test_composer_config_partial_json() {
        let config: ComposerConfig = serde_json::from_value(json!({"default_retention": 5})).unwrap();
        assert_eq!(config.default_retention, 5);
        assert_eq!(config.name, "signal-composer");
    }

    #[test]
    fn test_source_entry() {
        let source = SourceConfig::from_json(&json!({
            "uid": "CAN-service",
            "api": "low-can",
            "info": "Low level CAN bus",
            "getSignals": {"function": "plugin://low-can/subscribeToLow"},
            "retention": 10
        }))
        .unwrap();
        assert_eq!(source.api(), "low-can");
        assert_eq!(source.retention, Some(10));
        assert!(source.get_signals.is_some());

        let bare = SourceConfig::from_json(&json!({"uid": "gps"})).unwrap();
        assert_eq!(bare.api(), "gps");
    }

    #[test]
    fn test_source_entry_errors() {
        assert_eq!(
            SourceConfig::from_json(&json!({"api": "x"})).unwrap_err(),
            ConfigError::MissingField { field: "uid".into() }
        );
        assert!(matches!(
            SourceConfig::from_json(&json!({"uid": "x", "colour": "red"})).unwrap_err(),
            ConfigError::Malformed { kind: "source", .. }
        ));
    }

    #[test]
    fn test_signal_entry_depends_forms() {
        let one = SignalConfig::from_json(&json!({"uid": "v", "depends": "speed"})).unwrap();
        assert_eq!(one.depends_list(), vec!["speed".to_string()]);
        let many = SignalConfig::from_json(&json!({"uid": "v", "depends": ["a", "b"]})).unwrap();
        assert_eq!(many.depends_list(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_signal_entry_validation() {
        let both = SignalConfig::from_json(&json!({"uid": "x", "event": "a/b", "depends": "y"}));
        assert_eq!(both.unwrap_err(), ConfigError::AmbiguousSignal { id: "x".into() });

        let neither = SignalConfig::from_json(&json!({"uid": "x"}));
        assert_eq!(neither.unwrap_err(), ConfigError::AmbiguousSignal { id: "x".into() });

        let event = SignalConfig::from_json(&json!({"uid": "x", "event": "speed"}));
        assert!(matches!(event.unwrap_err(), ConfigError::InvalidEvent { .. }));

        let qualified = SignalConfig::from_json(&json!({"uid": "x", "depends": ["low-can/speed"]}));
        assert!(matches!(qualified.unwrap_err(), ConfigError::QualifiedDependency { .. }));
    }

    #[test]
    fn test_signal_entry_event_api() {
        let raw = SignalConfig::from_json(&json!({"uid": "s", "event": "low-can/messages.vehicle.speed"})).unwrap();
        assert_eq!(raw.event_api(), Some("low-can"));
    }

    #[test]
    fn test_document_single_entries_and_metadata() {
        let doc = ConfigDocument::from_json_str(
            r#"{"metadata": {"uid": "sig", "api": "composer"}, "sources": {"uid": "a"}, "signals": []}"#,
        )
        .unwrap();
        assert_eq!(doc.engine_name(), Some("composer"));
        assert_eq!(doc.sources.len(), 1);
        assert!(doc.signals.is_empty());
    }

    #[test]
    fn test_document_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"signals": [{{"uid": "s", "event": "a/b"}}]}}"#).unwrap();
        let doc = ConfigDocument::from_path(file.path()).unwrap();
        assert_eq!(doc.signals.len(), 1);

        let missing = ConfigDocument::from_path("/definitely/not/here.json").unwrap_err();
        assert!(matches!(missing, ConfigError::Malformed { kind: "document", .. }));
    }

    #[test]
    fn test_document_rejects_garbage() {
        assert!(ConfigDocument::from_json_str("not json").is_err());
    }
}
