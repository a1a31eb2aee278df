//! Executable actions attached to sources and signals.
//!
//! Configuration names an action with a URI:
//!
//! - `plugin://<plugin>/<function>`: a native callback provided by a plugin
//! - `api://<api>/<verb>`: a call to another service's verb
//! - `lua://[<path>/]<function>`: a scripted function
//!
//! The URI is parsed once at load time into an [`ActionRef`]. Running it is
//! delegated to an [`ActionExecutor`]; the engine never inspects how.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ExecutionError};
use crate::signal::{Signal, SignalResolver};
use crate::time::USEC_TIMESTAMP_THRESHOLD;
use crate::value::TimeSeriesValue;

/// Action declaration as written in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionDescriptor {
    /// Function URI.
    pub function: String,
    /// Accepted for compatibility; the plugin is named by the URI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
    /// Named arguments handed to the function on every call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<serde_json::Value>,
}

impl ActionDescriptor {
    /// Creates a descriptor with no arguments.
    #[must_use]
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            plugin: None,
            args: None,
        }
    }

    /// Attaches an argument bundle.
    #[must_use]
    pub fn with_args(mut self, args: serde_json::Value) -> Self {
        self.args = Some(args);
        self
    }
}

/// Resolved executable backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ActionKind {
    /// Function exported by a native plugin.
    NativeCallback { plugin: String, function: String },
    /// Verb of another service.
    RemoteCall { api: String, verb: String },
    /// Function of a script, optionally loaded from `file`.
    ScriptedFunction { file: Option<String>, function: String },
}

impl ActionKind {
    /// Short name of the backend.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::NativeCallback { .. } => "plugin",
            Self::RemoteCall { .. } => "api",
            Self::ScriptedFunction { .. } => "lua",
        }
    }
}

/// A resolved action plus its argument bundle.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRef {
    uid: String,
    kind: ActionKind,
    args: Option<serde_json::Value>,
}

#[allow(missing_docs)]
impl ActionRef {
    /// Creates an action directly from its parts.
    #[must_use]
    pub fn new(uid: impl Into<String>, kind: ActionKind, args: Option<serde_json::Value>) -> Self {
        Self {
            uid: uid.into(),
            kind,
            args,
        }
    }

    /// Resolves a configuration descriptor.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidActionUri` when the scheme is unknown or
    /// the path does not have the shape the scheme requires.
    pub fn from_descriptor(uid: impl Into<String>, descriptor: &ActionDescriptor) -> Result<Self, ConfigError> {
        let kind = parse_function_uri(&descriptor.function)?;
        Ok(Self::new(uid, kind, descriptor.args.clone()))
    }

    /// Default subscription action of a source: `api://<api>/subscribe`.
    #[must_use]
    pub fn subscribe_verb(api: &str) -> Self {
        Self::new(
            "getSignals",
            ActionKind::RemoteCall {
                api: api.to_string(),
                verb: "subscribe".to_string(),
            },
            None,
        )
    }

    #[must_use]
    pub fn uid(&self) -> &str {
        &self.uid
    }

    #[must_use]
    pub const fn kind(&self) -> &ActionKind {
        &self.kind
    }

    #[must_use]
    pub const fn args(&self) -> Option<&serde_json::Value> {
        self.args.as_ref()
    }

    /// Same action under another uid.
    #[must_use]
    pub fn with_uid(&self, uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            ..self.clone()
        }
    }

    #[must_use]
    pub const fn is_scripted(&self) -> bool {
        matches!(self.kind, ActionKind::ScriptedFunction { .. })
    }
}

impl std::fmt::Display for ActionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ActionKind::NativeCallback { plugin, function } => write!(f, "plugin://{plugin}/{function}"),
            ActionKind::RemoteCall { api, verb } => write!(f, "api://{api}/{verb}"),
            ActionKind::ScriptedFunction { file: Some(file), function } => write!(f, "lua://{file}/{function}"),
            ActionKind::ScriptedFunction { file: None, function } => write!(f, "lua://{function}"),
        }
    }
}

/// Splits a URI path on `/`, dropping empty segments.
#[must_use]
pub fn parse_uri(uri: &str) -> Vec<String> {
    uri.split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_function_uri(function: &str) -> Result<ActionKind, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidActionUri {
        uri: function.to_string(),
        reason: reason.to_string(),
    };

    if let Some(rest) = function.strip_prefix("plugin://") {
        let parts = parse_uri(rest);
        let [plugin, name] = parts.as_slice() else {
            return Err(invalid("expected plugin://<plugin-name>/<function-name>"));
        };
        return Ok(ActionKind::NativeCallback {
            plugin: plugin.clone(),
            function: name.clone(),
        });
    }

    if let Some(rest) = function.strip_prefix("api://") {
        let parts = parse_uri(rest);
        let [api, verb] = parts.as_slice() else {
            return Err(invalid("expected api://<api-name>/<verb-name>"));
        };
        return Ok(ActionKind::RemoteCall {
            api: api.clone(),
            verb: verb.clone(),
        });
    }

    if let Some(rest) = function.strip_prefix("lua://") {
        let mut parts = parse_uri(rest);
        let Some(name) = parts.pop() else {
            return Err(invalid("expected lua://[<file-path>/]<function-name>"));
        };
        let file = if parts.is_empty() { None } else { Some(parts.join("/")) };
        return Ok(ActionKind::ScriptedFunction { file, function: name });
    }

    Err(invalid("scheme must be one of 'lua://', 'plugin://' or 'api://'"))
}

/// Execution context handed to an action.
///
/// Gives the action its uid, the signal it runs on behalf of (if any) and a
/// way to reach sibling signals by name.
pub struct ActionContext<'a> {
    uid: &'a str,
    signal: Option<&'a Signal>,
    resolver: Option<Arc<dyn SignalResolver>>,
}

#[allow(missing_docs)]
impl<'a> ActionContext<'a> {
    #[must_use]
    pub fn new(uid: &'a str, signal: Option<&'a Signal>, resolver: Option<Arc<dyn SignalResolver>>) -> Self {
        Self { uid, signal, resolver }
    }

    #[must_use]
    pub const fn uid(&self) -> &str {
        self.uid
    }

    #[must_use]
    pub const fn signal(&self) -> Option<&'a Signal> {
        self.signal
    }

    /// Signals matching `name`, empty when no resolver is attached.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Vec<Arc<Signal>> {
        self.resolver
            .as_ref()
            .map(|r| r.search_signals(name))
            .unwrap_or_default()
    }

    /// Records a value on the context's signal.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::ActionFailed` when the action does not run on
    /// behalf of a signal.
    pub fn set_signal_value(&self, timestamp: u64, value: TimeSeriesValue) -> Result<(), ExecutionError> {
        let signal = self
            .signal
            .ok_or_else(|| ExecutionError::failed(self.uid, "no signal bound to this action"))?;
        signal.set(timestamp, value);
        Ok(())
    }

    /// Records a value on every signal matching `name`. Returns how many were set.
    pub fn search_and_set(&self, name: &str, timestamp: u64, value: &TimeSeriesValue) -> usize {
        let targets = self.resolve(name);
        for signal in &targets {
            signal.set(timestamp, value.clone());
        }
        targets.len()
    }
}

impl std::fmt::Debug for ActionContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionContext")
            .field("uid", &self.uid)
            .field("signal", &self.signal.map(Signal::id))
            .field("resolver", &self.resolver.is_some())
            .finish()
    }
}

/// Runs actions.
///
/// Implementations own their timeout policy; the engine waits for `execute`
/// to return.
pub trait ActionExecutor: Send + Sync {
    /// Executes `action` with an optional payload.
    ///
    /// # Errors
    ///
    /// Returns an `ExecutionError` when the action cannot run or fails.
    fn execute(
        &self,
        action: &ActionRef,
        ctx: &ActionContext<'_>,
        payload: Option<&serde_json::Value>,
    ) -> Result<(), ExecutionError>;
}

/// Rewrites microsecond epoch integers as seconds for scripted callbacks.
#[must_use]
pub fn script_payload(payload: &serde_json::Value) -> serde_json::Value {
    let serde_json::Value::Object(map) = payload else {
        return payload.clone();
    };
    let converted = map
        .iter()
        .map(|(k, v)| {
            let v = match v.as_i64() {
                Some(n) if n > USEC_TIMESTAMP_THRESHOLD => serde_json::Value::from(n / 1_000_000),
                _ => v.clone(),
            };
            (k.clone(), v)
        })
        .collect();
    serde_json::Value::Object(converted)
}
