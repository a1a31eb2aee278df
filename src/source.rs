//! Signal sources.
//!
//! A [`SourceApi`] groups the signals fed by one external provider. It holds
//! the defaults its signals inherit and drives the provider-facing protocol:
//! a one-time `init` action and a batched `get_signals` subscription.
//!
//! Signals go through two maps. New signals are *staged* until every
//! signal of a load exists, so that dependencies can be resolved in any
//! order; after wiring and the recursion check they are promoted to
//! *active*.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, error, info, warn};

use crate::action::{ActionContext, ActionExecutor, ActionRef};
use crate::error::{lock_err, ComposerResult, ConfigError, ExecutionError, GraphError};
use crate::signal::{Signal, SignalResolver, DEFAULT_RETENTION_SECS};

/// Uid of the source that owns virtual signals.
pub const SELF_SOURCE_UID: &str = "Signal-Composer-service";

/// Api of the self source until it is reconciled with the engine name.
pub const SELF_SOURCE_API: &str = "signal-composer";

type SignalMap = BTreeMap<String, Arc<Signal>>;

/// Policy inherited by the signals of a source.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalDefaults {
    /// Action run when a signal has none of its own.
    pub on_received: Option<ActionRef>,
    /// History span in seconds.
    pub retention: u64,
}

impl Default for SignalDefaults {
    fn default() -> Self {
        Self {
            on_received: None,
            retention: DEFAULT_RETENTION_SECS,
        }
    }
}

/// Outcome of promoting staged signals.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActivationReport {
    /// Ids promoted to the active map.
    pub activated: Vec<String>,
    /// Graph errors of the signals that were dropped.
    pub rejected: Vec<GraphError>,
}

/// A group of signals fed by one provider.
pub struct SourceApi {
    uid: String,
    api: RwLock<String>,
    info: String,
    init_action: Option<ActionRef>,
    get_signals: Option<ActionRef>,
    defaults: SignalDefaults,
    initialized: AtomicBool,
    staged: RwLock<SignalMap>,
    active: RwLock<SignalMap>,
}

impl SourceApi {
    /// Source with no actions and default signal settings.
    #[must_use]
    pub fn new(uid: impl Into<String>, api: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            api: RwLock::new(api.into()),
            info: String::new(),
            init_action: None,
            get_signals: None,
            defaults: SignalDefaults::default(),
            initialized: AtomicBool::new(false),
            staged: RwLock::new(BTreeMap::new()),
            active: RwLock::new(BTreeMap::new()),
        }
    }

    /// The synthetic source owning virtual signals.
    #[must_use]
    pub fn self_source(default_retention: u64) -> Self {
        Self::new(SELF_SOURCE_UID, SELF_SOURCE_API)
            .with_info("Api on behalf the virtual signals are sent")
            .with_defaults(SignalDefaults {
                on_received: None,
                retention: default_retention,
            })
    }

    /// Free-form description.
    #[must_use]
    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.info = info.into();
        self
    }

    /// Action run once before the first subscription.
    #[must_use]
    pub fn with_init(mut self, action: ActionRef) -> Self {
        self.init_action = Some(action);
        self
    }

    /// Action that subscribes each signal at the provider.
    #[must_use]
    pub fn with_get_signals(mut self, action: ActionRef) -> Self {
        self.get_signals = Some(action);
        self
    }

    /// Settings inherited by signals that do not set their own.
    #[must_use]
    pub fn with_defaults(mut self, defaults: SignalDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Source uid.
    #[must_use]
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Provider api name.
    #[must_use]
    pub fn api(&self) -> String {
        self.api.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Free-form description.
    #[must_use]
    pub fn info(&self) -> &str {
        &self.info
    }

    /// Settings inherited by this source's signals.
    #[must_use]
    pub const fn defaults(&self) -> &SignalDefaults {
        &self.defaults
    }

    /// True for the engine's own source, which owns virtual signals.
    #[must_use]
    pub fn is_self(&self) -> bool {
        self.uid == SELF_SOURCE_UID
    }

    /// Subscription action: the configured one, or `api://<api>/subscribe`.
    #[must_use]
    pub fn get_signals_action(&self) -> ActionRef {
        self.get_signals
            .clone()
            .unwrap_or_else(|| ActionRef::subscribe_verb(&self.api()))
    }

    /// Stages a signal. No graph work happens here.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::DuplicateSignal` when this source already holds
    /// a signal with the same id.
    pub fn add_signal(&self, signal: Arc<Signal>) -> ComposerResult<()> {
        if self.find_signal(signal.id()).is_some() {
            return Err(ConfigError::DuplicateSignal {
                id: signal.id().to_string(),
            }
            .into());
        }
        let mut staged = self.staged.write().map_err(|_| lock_err("source.add_signal"))?;
        debug!(source = %self.uid, signal = %signal.id(), "signal staged");
        staged.insert(signal.id().to_string(), signal);
        Ok(())
    }

    /// Wires staged signals and promotes those that pass the recursion check.
    ///
    /// Every staged signal is attached before any is checked, and every
    /// check completes before failing signals are detached, so all members
    /// of a cycle are rejected together.
    ///
    /// # Errors
    ///
    /// Only fails on a poisoned lock. Graph errors are reported in the
    /// returned [`ActivationReport`].
    pub fn init_signals(&self, resolver: &dyn SignalResolver) -> ComposerResult<ActivationReport> {
        // The resolver reads our maps, so attach from a snapshot.
        let pending: Vec<Arc<Signal>> = self
            .staged
            .read()
            .map_err(|_| lock_err("source.init_signals"))?
            .values()
            .cloned()
            .collect();

        let mut failures: BTreeMap<String, GraphError> = BTreeMap::new();
        for signal in &pending {
            if let Err(err) = Signal::attach_to_source_signals(signal, resolver) {
                failures.insert(signal.id().to_string(), err);
            }
        }
        for signal in &pending {
            if failures.contains_key(signal.id()) {
                continue;
            }
            if let Err(err) = signal.initial_recursion_check() {
                failures.insert(signal.id().to_string(), err);
            }
        }

        let mut report = ActivationReport::default();
        {
            let mut staged = self.staged.write().map_err(|_| lock_err("source.init_signals"))?;
            let mut active = self.active.write().map_err(|_| lock_err("source.init_signals"))?;
            for signal in pending {
                let id = signal.id().to_string();
                staged.remove(&id);
                match failures.remove(&id) {
                    Some(err) => {
                        error!(source = %self.uid, signal = %id, error = %err, "signal rejected");
                        signal.detach();
                        report.rejected.push(err);
                    }
                    None => {
                        signal.activate();
                        active.insert(id.clone(), signal);
                        report.activated.push(id);
                    }
                }
            }
        }

        info!(
            source = %self.uid,
            activated = report.activated.len(),
            rejected = report.rejected.len(),
            "signals initialized"
        );
        Ok(report)
    }

    /// Runs the one-time `init` action. Without one, the self source takes
    /// the engine name as its api. Later calls do nothing.
    ///
    /// # Errors
    ///
    /// Returns the `init` action's execution error.
    pub fn init(&self, executor: &dyn ActionExecutor, engine_name: &str) -> ComposerResult<()> {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(action) = &self.init_action {
            debug!(source = %self.uid, action = %action, "running init action");
            let ctx = ActionContext::new(action.uid(), None, None);
            executor.execute(action, &ctx, None)?;
        } else if self.is_self() {
            *self.api.write().map_err(|_| lock_err("source.init"))? = engine_name.to_string();
        }
        Ok(())
    }

    /// Follows an engine rename. Only the self source carries the engine name.
    pub(crate) fn rename_api(&self, api: &str) -> ComposerResult<()> {
        if self.is_self() {
            *self.api.write().map_err(|_| lock_err("source.api"))? = api.to_string();
        }
        Ok(())
    }

    /// Sends the subscription request for every active signal not yet
    /// subscribed, then calls `get_signals` once more without payload so the
    /// provider can flush a batched request.
    ///
    /// Signals are marked subscribed whether or not their call succeeded.
    /// Returns the number of newly subscribed signals.
    ///
    /// # Errors
    ///
    /// Returns the first execution error. All signals are still processed.
    pub fn make_subscription(&self, executor: &dyn ActionExecutor) -> ComposerResult<usize> {
        let action = self.get_signals_action();
        let pending: Vec<Arc<Signal>> = self
            .active_signals()
            .into_iter()
            .filter(|s| !s.is_subscribed())
            .collect();

        let mut first_err: Option<ExecutionError> = None;
        let mut count = 0;
        for signal in &pending {
            let description = signal.describe().to_json();
            let ctx = ActionContext::new(signal.id(), Some(signal.as_ref()), None);
            if let Err(err) = executor.execute(&action, &ctx, Some(&description)) {
                warn!(source = %self.uid, signal = %signal.id(), error = %err, "subscription request failed");
                first_err.get_or_insert(err);
            }
            if signal.mark_subscribed() {
                count += 1;
            }
        }

        let flush = ActionContext::new("", None, None);
        if let Err(err) = executor.execute(&action, &flush, None) {
            warn!(source = %self.uid, error = %err, "subscription flush failed");
            first_err.get_or_insert(err);
        }

        debug!(source = %self.uid, count, "subscriptions sent");
        match first_err {
            Some(err) => Err(err.into()),
            None => Ok(count),
        }
    }

    /// Signals matching `name`: an exact id hit in the active then staged
    /// map, else every signal whose id or event contains `name`.
    #[must_use]
    pub fn search_signals(&self, name: &str) -> Vec<Arc<Signal>> {
        if let Some(hit) = self.find_signal(name) {
            return vec![hit];
        }
        self.signals().into_iter().filter(|s| s.matches(name)).collect()
    }

    /// Signal with exactly this id, active or staged.
    #[must_use]
    pub fn find_signal(&self, id: &str) -> Option<Arc<Signal>> {
        let active = self.active.read().unwrap_or_else(PoisonError::into_inner).get(id).cloned();
        if active.is_some() {
            return active;
        }
        self.staged.read().unwrap_or_else(PoisonError::into_inner).get(id).cloned()
    }

    /// Active then staged signals.
    #[must_use]
    pub fn signals(&self) -> Vec<Arc<Signal>> {
        let mut all = self.active_signals();
        all.extend(self.staged_signals());
        all
    }

    /// Signals that passed the graph checks.
    #[must_use]
    pub fn active_signals(&self) -> Vec<Arc<Signal>> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Signals added but not yet checked.
    #[must_use]
    pub fn staged_signals(&self) -> Vec<Arc<Signal>> {
        self.staged
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Drops every signal of this source and its graph edges.
    pub fn clear(&self) {
        let mut drained: Vec<Arc<Signal>> = Vec::new();
        for map in [&self.active, &self.staged] {
            let mut guard = map.write().unwrap_or_else(PoisonError::into_inner);
            drained.extend(std::mem::take(&mut *guard).into_values());
        }
        for signal in &drained {
            signal.detach();
        }
    }
}

impl std::fmt::Debug for SourceApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceApi")
            .field("uid", &self.uid)
            .field("api", &self.api())
            .field("active", &self.active_signals().len())
            .field("staged", &self.staged_signals().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::SignalPhase;
    use serde_json::json;
    use std::sync::Mutex;

    /// Resolves ids against one source only.
    struct Local<'a>(&'a SourceApi);

    impl SignalResolver for Local<'_> {
        fn find_signal(&self, id: &str) -> Option<Arc<Signal>> {
            self.0.find_signal(id)
        }

        fn search_signals(&self, name: &str) -> Vec<Arc<Signal>> {
            self.0.search_signals(name)
        }
    }

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(String, Option<serde_json::Value>)>>,
        fail_on: Option<&'static str>,
    }

    impl ActionExecutor for Recorder {
        fn execute(
            &self,
            _action: &ActionRef,
            ctx: &ActionContext<'_>,
            payload: Option<&serde_json::Value>,
        ) -> Result<(), ExecutionError> {
            self.calls
                .lock()
                .unwrap()
                .push((ctx.uid().to_string(), payload.cloned()));
            if self.fail_on == Some(ctx.uid()) {
                return Err(ExecutionError::failed(ctx.uid(), "provider refused"));
            }
            Ok(())
        }
    }

    fn raw(id: &str) -> Arc<Signal> {
        Signal::builder(id).event(format!("low-can/{id}")).build().unwrap()
    }

    fn virt(id: &str, depends: &[&str]) -> Arc<Signal> {
        Signal::builder(id).depends(depends.iter().copied()).build().unwrap()
    }

    #[test]
    fn test_add_signal_stages_without_wiring() {
        let source = SourceApi::new("can", "low-can");
        source.add_signal(raw("speed")).unwrap();
        assert_eq!(source.staged_signals().len(), 1);
        assert!(source.active_signals().is_empty());
        assert_eq!(source.find_signal("speed").unwrap().phase(), SignalPhase::Staged);

        let err = source.add_signal(raw("speed")).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_init_signals_rejects_cycle_keeps_unrelated() {
        let source = SourceApi::self_source(30);
        source.add_signal(virt("a", &["b"])).unwrap();
        source.add_signal(virt("b", &["a"])).unwrap();
        source.add_signal(raw("r")).unwrap();
        source.add_signal(virt("c", &["r"])).unwrap();

        let report = source.init_signals(&Local(&source)).unwrap();
        assert_eq!(report.activated, vec!["c".to_string(), "r".to_string()]);
        assert_eq!(report.rejected.len(), 2);
        assert!(source.find_signal("a").is_none());
        assert!(source.find_signal("b").is_none());
        assert!(source.staged_signals().is_empty());
        assert_eq!(source.find_signal("c").unwrap().phase(), SignalPhase::Active);
    }

    #[test]
    fn test_init_signals_rejects_unknown_dependency() {
        let source = SourceApi::self_source(30);
        source.add_signal(virt("v", &["missing"])).unwrap();
        let report = source.init_signals(&Local(&source)).unwrap();
        assert!(report.activated.is_empty());
        assert!(matches!(report.rejected[0], GraphError::UnknownDependency { .. }));
    }

    #[test]
    fn test_make_subscription_batches_with_flush() {
        let source = SourceApi::new("can", "low-can");
        source.add_signal(raw("rpm")).unwrap();
        source.add_signal(raw("speed")).unwrap();
        source.init_signals(&Local(&source)).unwrap();

        let recorder = Recorder::default();
        assert_eq!(source.make_subscription(&recorder).unwrap(), 2);

        let calls = recorder.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].0, "rpm");
        assert_eq!(calls[0].1.as_ref().unwrap()["event"], json!("low-can/rpm"));
        assert_eq!(calls[2], (String::new(), None));

        // Already subscribed: only the flush goes out.
        assert_eq!(source.make_subscription(&recorder).unwrap(), 0);
        assert_eq!(recorder.calls.lock().unwrap().len(), 4);
    }

    #[test]
    fn test_make_subscription_marks_failed_signals() {
        let source = SourceApi::new("can", "low-can");
        source.add_signal(raw("rpm")).unwrap();
        source.init_signals(&Local(&source)).unwrap();

        let recorder = Recorder {
            fail_on: Some("rpm"),
            ..Recorder::default()
        };
        let err = source.make_subscription(&recorder).unwrap_err();
        assert!(err.is_execution());
        assert_eq!(source.find_signal("rpm").unwrap().phase(), SignalPhase::Subscribed);
    }

    #[test]
    fn test_default_get_signals_action() {
        let source = SourceApi::new("gps", "gps");
        assert_eq!(source.get_signals_action().to_string(), "api://gps/subscribe");
    }

    #[test]
    fn test_init_reconciles_self_source_once() {
        let source = SourceApi::self_source(30);
        let recorder = Recorder::default();
        source.init(&recorder, "composer").unwrap();
        assert_eq!(source.api(), "composer");
        source.init(&recorder, "other").unwrap();
        assert_eq!(source.api(), "composer");
        assert!(recorder.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_init_runs_action() {
        let source = SourceApi::new("can", "low-can").with_init(ActionRef::subscribe_verb("low-can").with_uid("init"));
        let recorder = Recorder::default();
        source.init(&recorder, "composer").unwrap();
        assert_eq!(recorder.calls.lock().unwrap()[0].0, "init");
        assert_eq!(source.api(), "low-can");
    }

    #[test]
    fn test_search_signals() {
        let source = SourceApi::new("door", "door");
        source.add_signal(raw("door.front_left")).unwrap();
        source.add_signal(raw("door.front_right")).unwrap();

        let left = source.search_signals("front_left");
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id(), "door.front_left");
        assert_eq!(source.search_signals("door").len(), 2);
        assert_eq!(source.search_signals("door.front_right").len(), 1);
        assert!(source.search_signals("trunk").is_empty());
    }

    #[test]
    fn test_clear_releases_edges() {
        let source = SourceApi::self_source(30);
        let r = raw("r");
        source.add_signal(r.clone()).unwrap();
        source.add_signal(virt("v", &["r"])).unwrap();
        source.init_signals(&Local(&source)).unwrap();
        assert_eq!(r.observers().len(), 1);

        source.clear();
        assert!(source.signals().is_empty());
        assert!(r.observers().is_empty());
    }
}
