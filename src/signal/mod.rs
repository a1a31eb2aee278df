//! Signals: the nodes of the composition graph.
//!
//! A raw signal is bound to a provider event (`"<api>/<channel>"`). A virtual
//! signal observes the signals listed in its `depends` and recomputes itself
//! whenever one of them changes. Every signal keeps a retention-bounded
//! history answering statistical queries.

mod history;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, trace, warn};

use crate::action::{script_payload, ActionContext, ActionExecutor, ActionRef};
use crate::error::{ConfigError, ExecutionError, GraphError};
use crate::observer::{addr_of, Notifiable, Notifier, Observable, Subscriptions};
use crate::time::monotonic_micros;
use crate::value::TimeSeriesValue;

pub use history::History;

/// Retention used when neither the signal nor its source sets one.
pub const DEFAULT_RETENTION_SECS: u64 = 30;

/// Lookup of signals by id or name, used for wiring and by actions.
pub trait SignalResolver: Send + Sync {
    /// Signal with exactly this id.
    fn find_signal(&self, id: &str) -> Option<Arc<Signal>>;

    /// Signals matching `name` (see [`Signal::matches`]).
    fn search_signals(&self, name: &str) -> Vec<Arc<Signal>>;
}

/// Lifecycle of a signal. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalPhase {
    /// Parsed, not yet graph-checked.
    Staged,
    /// Graph-checked and accepting events.
    Active,
    /// Subscription request sent to the provider.
    Subscribed,
}

/// Serializable view of a signal.
///
/// This is the shape sent to providers when subscribing and returned to
/// clients when listing signals or pushing updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalDescription {
    /// Signal id.
    pub uid: String,
    /// Provider event, raw signals only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    /// Upstream signal ids, virtual signals only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends: Vec<String>,
    /// Unit label.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub unit: String,
    /// Rate hint in Hz, omitted when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency: Option<f64>,
    /// Latest timestamp in microseconds, omitted before the first sample.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    /// Latest value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<TimeSeriesValue>,
    /// Extra arguments forwarded to the provider's `getSignals` action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get_signals_args: Option<Json>,
}

impl SignalDescription {
    /// JSON form, `null` if serialization fails.
    #[must_use]
    pub fn to_json(&self) -> Json {
        serde_json::to_value(self).unwrap_or(Json::Null)
    }
}

/// Builder for [`Signal`].
///
/// # Examples
///
/// ```
/// use signal_composer::Signal;
///
/// let speed = Signal::builder("vehicle_speed")
///     .event("low-can/messages.vehicle.speed")
///     .unit("km/h")
///     .retention(10)
///     .build()
///     .unwrap();
///
/// speed.set(1_000_000, 42.0.into());
/// assert_eq!(speed.last().and_then(|v| v.as_number()), Some(42.0));
/// ```
#[must_use]
pub struct SignalBuilder {
    id: String,
    event: Option<String>,
    depends: Vec<String>,
    unit: String,
    frequency: f64,
    retention: u64,
    on_received: Option<ActionRef>,
    get_signals_args: Option<Json>,
    executor: Option<Arc<dyn ActionExecutor>>,
    resolver: Option<Weak<dyn SignalResolver>>,
}

impl SignalBuilder {
    fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            event: None,
            depends: Vec::new(),
            unit: String::new(),
            frequency: 0.0,
            retention: DEFAULT_RETENTION_SECS,
            on_received: None,
            get_signals_args: None,
            executor: None,
            resolver: None,
        }
    }

    /// Provider event that feeds this signal, as `<api>/<event>`.
    pub fn event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    /// Upstream signal ids. Makes the signal virtual.
    pub fn depends<I, S>(mut self, depends: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends = depends.into_iter().map(Into::into).collect();
        self
    }

    /// Unit label, informational only.
    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    /// Polling/subscription rate hint, in Hz.
    pub const fn frequency(mut self, frequency: f64) -> Self {
        self.frequency = frequency;
        self
    }

    /// History span in seconds.
    pub const fn retention(mut self, seconds: u64) -> Self {
        self.retention = seconds;
        self
    }

    /// Action run for each provider event or upstream change.
    pub fn on_received(mut self, action: ActionRef) -> Self {
        self.on_received = Some(action);
        self
    }

    /// Arguments forwarded to the source's `getSignals` action for this signal.
    pub fn get_signals_args(mut self, args: Json) -> Self {
        self.get_signals_args = Some(args);
        self
    }

    /// Executor for the `on_received` action.
    pub fn executor(mut self, executor: Arc<dyn ActionExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Registry through which actions reach sibling signals.
    pub fn resolver(mut self, resolver: Weak<dyn SignalResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Builds the signal.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::AmbiguousSignal` unless exactly one of `event`
    /// and `depends` is set, and `ConfigError::InvalidEvent` when the event is
    /// not of the form `<api>/<channel>`.
    pub fn build(self) -> Result<Arc<Signal>, ConfigError> {
        if self.id.is_empty() {
            return Err(ConfigError::MissingField { field: "uid".into() });
        }
        if self.event.is_some() == !self.depends.is_empty() {
            return Err(ConfigError::AmbiguousSignal { id: self.id });
        }
        if let Some(event) = &self.event {
            match event.split_once('/') {
                Some((api, channel)) if !api.is_empty() && !channel.is_empty() => {}
                _ => return Err(ConfigError::InvalidEvent { event: event.clone() }),
            }
        }

        Ok(Arc::new(Signal {
            state: RwLock::new(SignalState {
                value: None,
                timestamp: 0,
                history: History::new(self.retention),
            }),
            id: self.id,
            event: self.event,
            depends: self.depends,
            unit: self.unit,
            frequency: self.frequency,
            retention: self.retention,
            on_received: self.on_received,
            get_signals_args: self.get_signals_args,
            active: AtomicBool::new(false),
            subscribed: AtomicBool::new(false),
            observable: Observable::new(),
            subscriptions: Subscriptions::new(),
            executor: self.executor,
            resolver: self.resolver,
        }))
    }
}

#[derive(Debug)]
struct SignalState {
    value: Option<TimeSeriesValue>,
    timestamp: u64,
    history: History,
}

/// A node of the composition graph.
pub struct Signal {
    id: String,
    event: Option<String>,
    depends: Vec<String>,
    unit: String,
    frequency: f64,
    retention: u64,
    on_received: Option<ActionRef>,
    get_signals_args: Option<Json>,
    state: RwLock<SignalState>,
    active: AtomicBool,
    subscribed: AtomicBool,
    observable: Observable<Signal>,
    subscriptions: Subscriptions<Signal>,
    executor: Option<Arc<dyn ActionExecutor>>,
    resolver: Option<Weak<dyn SignalResolver>>,
}

impl Signal {
    /// Starts building a signal with the given id.
    pub fn builder(id: impl Into<String>) -> SignalBuilder {
        SignalBuilder::new(id)
    }

    /// Signal id, unique across the engine.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Provider event, `None` for virtual signals.
    #[must_use]
    pub fn event(&self) -> Option<&str> {
        self.event.as_deref()
    }

    /// Provider api named by the event, if this is a raw signal.
    #[must_use]
    pub fn event_api(&self) -> Option<&str> {
        self.event.as_deref().and_then(|e| e.split_once('/')).map(|(api, _)| api)
    }

    /// Upstream signal ids.
    #[must_use]
    pub fn depends(&self) -> &[String] {
        &self.depends
    }

    /// True when the signal is composed from other signals.
    #[must_use]
    pub fn is_virtual(&self) -> bool {
        self.event.is_none()
    }

    /// Unit label.
    #[must_use]
    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Rate hint in Hz.
    #[must_use]
    pub const fn frequency(&self) -> f64 {
        self.frequency
    }

    /// History span in seconds.
    #[must_use]
    pub const fn retention(&self) -> u64 {
        self.retention
    }

    /// Action run for each event, `None` for default extraction.
    #[must_use]
    pub const fn on_received(&self) -> Option<&ActionRef> {
        self.on_received.as_ref()
    }

    /// Arguments forwarded to the provider's `getSignals` action.
    #[must_use]
    pub const fn get_signals_args(&self) -> Option<&Json> {
        self.get_signals_args.as_ref()
    }

    fn read(&self) -> RwLockReadGuard<'_, SignalState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, SignalState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a sample: history, current value and timestamp.
    ///
    /// Observers are not notified.
    pub fn set(&self, timestamp: u64, value: TimeSeriesValue) {
        trace!(signal = %self.id, timestamp, %value, "set");
        let mut state = self.write();
        state.history.insert(timestamp, value.clone());
        state.value = Some(value);
        state.timestamp = timestamp;
    }

    /// Timestamp of the last sample, 0 before the first one.
    #[must_use]
    pub fn timestamp(&self) -> u64 {
        self.read().timestamp
    }

    /// Most recently set value, of any kind.
    #[must_use]
    pub fn last(&self) -> Option<TimeSeriesValue> {
        self.read().value.clone()
    }

    /// Mean of the numeric samples over the trailing `seconds` (0 = all).
    #[must_use]
    pub fn average(&self, seconds: u64) -> Option<f64> {
        self.read().history.average(seconds)
    }

    /// Smallest numeric sample over the trailing `seconds` (0 = all).
    #[must_use]
    pub fn minimum(&self, seconds: u64) -> Option<f64> {
        self.read().history.minimum(seconds)
    }

    /// Largest numeric sample over the trailing `seconds` (0 = all).
    #[must_use]
    pub fn maximum(&self, seconds: u64) -> Option<f64> {
        self.read().history.maximum(seconds)
    }

    /// Copy of the retained history.
    #[must_use]
    pub fn history(&self) -> History {
        self.read().history.clone()
    }

    /// Lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> SignalPhase {
        if self.subscribed.load(Ordering::Acquire) {
            SignalPhase::Subscribed
        } else if self.active.load(Ordering::Acquire) {
            SignalPhase::Active
        } else {
            SignalPhase::Staged
        }
    }

    /// True once the provider subscription request was sent.
    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::Acquire)
    }

    pub(crate) fn activate(&self) {
        self.active.store(true, Ordering::Release);
    }

    /// Returns false if the signal was already marked.
    pub(crate) fn mark_subscribed(&self) -> bool {
        !self.subscribed.swap(true, Ordering::AcqRel)
    }

    /// True when the id equals `name` or the id or event contains it.
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        self.id == name || self.id.contains(name) || self.event.as_deref().is_some_and(|e| e.contains(name))
    }

    /// Snapshot of the signal's settings and latest sample.
    #[must_use]
    pub fn describe(&self) -> SignalDescription {
        let state = self.read();
        SignalDescription {
            uid: self.id.clone(),
            event: self.event.clone(),
            depends: self.depends.clone(),
            unit: self.unit.clone(),
            frequency: (self.frequency != 0.0).then_some(self.frequency),
            timestamp: (state.timestamp != 0).then_some(state.timestamp),
            value: state.value.clone(),
            get_signals_args: self.get_signals_args.clone(),
        }
    }

    /// Handles new data for this signal and notifies observers.
    ///
    /// Runs the `on_received` action when one is configured, otherwise
    /// [`Self::default_received_cb`]. Observers are only notified when the
    /// handler succeeds.
    ///
    /// # Errors
    ///
    /// Returns the handler's error.
    pub fn on_received_cb(&self, payload: &Json) -> Result<(), ExecutionError> {
        self.run_received(payload)?;
        self.notify();
        Ok(())
    }

    fn run_received(&self, payload: &Json) -> Result<(), ExecutionError> {
        let Some(action) = &self.on_received else {
            return self.default_received_cb(payload);
        };
        let executor = self.executor.as_ref().ok_or_else(|| ExecutionError::Unsupported {
            kind: action.kind().label(),
            action: action.to_string(),
        })?;

        let converted;
        let payload = if action.is_scripted() {
            converted = script_payload(payload);
            &converted
        } else {
            payload
        };

        let resolver = self.resolver.as_ref().and_then(Weak::upgrade);
        let ctx = ActionContext::new(&self.id, Some(self), resolver);
        executor.execute(action, &ctx, Some(payload))
    }

    /// Extracts a value and a timestamp from a provider payload and records them.
    ///
    /// Keys are compared case-insensitively: a key containing `timestamp`
    /// supplies the timestamp, a key `value` (or containing `value` or the
    /// signal id) supplies the value. A bare scalar payload is the value.
    /// Without a timestamp the monotonic clock is used.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::NoData` when no scalar value is found.
    pub fn default_received_cb(&self, payload: &Json) -> Result<(), ExecutionError> {
        let (value, timestamp) = match payload {
            Json::Object(map) => {
                let id = self.id.to_lowercase();
                let mut exact = None;
                let mut fuzzy = None;
                let mut timestamp = None;
                for (key, field) in map {
                    let key = key.to_lowercase();
                    if key.contains("timestamp") {
                        timestamp = timestamp.or_else(|| field.as_u64());
                    } else if key == "value" {
                        exact = TimeSeriesValue::from_json(field);
                    } else if fuzzy.is_none() && (key.contains("value") || key.contains(&id)) {
                        fuzzy = TimeSeriesValue::from_json(field);
                    }
                }
                (exact.or(fuzzy), timestamp)
            }
            scalar => (TimeSeriesValue::from_json(scalar), None),
        };

        let Some(value) = value else {
            warn!(signal = %self.id, payload = %payload, "no data found to set signal");
            return Err(ExecutionError::NoData { signal: self.id.clone() });
        };
        let timestamp = timestamp.filter(|ts| *ts != 0).unwrap_or_else(monotonic_micros);
        self.set(timestamp, value);
        Ok(())
    }

    /// Makes this signal an observer of each dependency named by id.
    ///
    /// Qualified names (containing `/`) refer to provider channels and are
    /// skipped. Returns the number of edges attached.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::UnknownDependency` for the first id the resolver
    /// does not know. Edges attached before it are kept.
    pub fn attach_to_source_signals(this: &Arc<Self>, resolver: &dyn SignalResolver) -> Result<usize, GraphError> {
        let observer: Arc<dyn Notifiable<Signal>> = this.clone();
        let mut attached = 0;
        for dependency in this.depends.iter().filter(|d| !d.contains('/')) {
            let target = resolver
                .find_signal(dependency)
                .ok_or_else(|| GraphError::UnknownDependency {
                    signal: this.id.clone(),
                    dependency: dependency.clone(),
                })?;
            debug!(signal = %this.id, dependency = %dependency, "attaching");
            Signal::add_observer(&target, &observer);
            attached += 1;
        }
        Ok(attached)
    }

    /// Removes every graph edge touching this signal.
    pub fn detach(&self) {
        self.subscriptions.release(self);
        self.observable.release(self);
    }

    /// Looks for a path from this signal's observers back to itself.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::Cycle` when one exists.
    pub fn initial_recursion_check(&self) -> Result<(), GraphError> {
        self.recursion_check(self)
    }

    /// Looks for a path from this signal's observers to `origin`.
    ///
    /// Each node is expanded at most once, so the walk terminates on any
    /// graph.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::Cycle` when `origin` is reachable.
    pub fn recursion_check(&self, origin: &Signal) -> Result<(), GraphError> {
        let mut visited = HashSet::new();
        self.walk_observers(origin, &mut visited)
    }

    fn walk_observers(&self, origin: &Signal, visited: &mut HashSet<usize>) -> Result<(), GraphError> {
        for observer in self.observable.snapshot() {
            let Some(node) = observer.as_node() else {
                continue;
            };
            if std::ptr::eq(node, origin) {
                return Err(GraphError::Cycle {
                    origin: origin.id.clone(),
                    through: self.id.clone(),
                });
            }
            if visited.insert(addr_of(node)) {
                node.walk_observers(origin, visited)?;
            }
        }
        Ok(())
    }

    /// Signals observing this one.
    #[must_use]
    pub fn observers(&self) -> Vec<Arc<dyn Notifiable<Signal>>> {
        self.observable.snapshot()
    }

    /// Signals this one observes.
    #[must_use]
    pub fn sources(&self) -> Vec<Arc<Signal>> {
        self.subscriptions.snapshot()
    }
}

impl Notifier for Signal {
    fn observable(&self) -> &Observable<Signal> {
        &self.observable
    }
}

impl Notifiable<Signal> for Signal {
    fn update(&self, source: &Signal) {
        let payload = source.describe().to_json();
        match self.run_received(&payload) {
            Ok(()) => self.notify(),
            Err(err) => warn!(signal = %self.id, upstream = %source.id, error = %err, "recomputation failed"),
        }
    }

    fn subscriptions(&self) -> &Subscriptions<Signal> {
        &self.subscriptions
    }

    fn as_node(&self) -> Option<&Signal> {
        Some(self)
    }
}

impl Drop for Signal {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("id", &self.id)
            .field("event", &self.event)
            .field("depends", &self.depends)
            .field("phase", &self.phase())
            .field("last", &self.last())
            .finish_non_exhaustive()
    }
}
