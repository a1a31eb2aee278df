//! The composer: registry of sources, signals and client sessions.
//!
//! Loading runs in a fixed order: sources are parsed and initialized, then
//! signals are parsed and staged, then every source wires and activates its
//! staged signals, and finally subscription requests go out to providers.
//! A bad entry only takes itself out of the load.

/// Search, listing and value queries.
pub mod query;

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};

use serde_json::Value as Json;
use tracing::{debug, error, info, warn};

use crate::action::{ActionExecutor, ActionRef};
use crate::client::{ClientSession, ClientStream, DispatchRound, SessionId};
use crate::config::{ComposerConfig, ConfigDocument, SignalConfig, SourceConfig};
use crate::error::{lock_err, ComposerError, ComposerResult, ConfigError, ExecutionError};
use crate::signal::{Signal, SignalResolver};
use crate::source::{SignalDefaults, SourceApi};
use crate::value::TimeSeriesValue;

pub use query::{Reading, SignalReading, ValueOptions, ALL_SIGNALS, NO_DATA_MARKER};

/// What a load did.
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    pub sources_loaded: usize,
    pub sources_rejected: usize,
    /// Signals that reached the active set.
    pub signals_loaded: usize,
    /// Signals rejected by configuration or graph checks.
    pub signals_rejected: usize,
    /// Signals whose subscription request was sent.
    pub subscribed: usize,
    /// Every error met along the way, in order.
    pub errors: Vec<ComposerError>,
}

impl LoadReport {
    /// True when nothing was rejected and nothing failed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Process-wide registry of the composition graph.
///
/// Built with [`Composer::new`] and shared as `Arc<Composer>`; signals reach
/// their siblings through a weak handle to it.
pub struct Composer {
    config: ComposerConfig,
    engine_name: RwLock<String>,
    executor: Arc<dyn ActionExecutor>,
    me: Weak<Composer>,
    sources: RwLock<Vec<Arc<SourceApi>>>,
    staged_sources: RwLock<Vec<Arc<SourceApi>>>,
    sessions: RwLock<HashMap<SessionId, Arc<ClientSession>>>,
}

impl Composer {
    /// Creates a composer holding only the self source.
    #[must_use]
    pub fn new(config: ComposerConfig, executor: Arc<dyn ActionExecutor>) -> Arc<Self> {
        let self_source = Arc::new(SourceApi::self_source(config.default_retention));
        Arc::new_cyclic(|me| Self {
            engine_name: RwLock::new(config.name.clone()),
            config,
            executor,
            me: me.clone(),
            sources: RwLock::new(Vec::new()),
            staged_sources: RwLock::new(vec![self_source]),
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// Configuration the composer was built with.
    #[must_use]
    pub const fn config(&self) -> &ComposerConfig {
        &self.config
    }

    /// Executor shared by every signal and source.
    #[must_use]
    pub fn executor(&self) -> Arc<dyn ActionExecutor> {
        Arc::clone(&self.executor)
    }

    /// Name the self source is reconciled with.
    #[must_use]
    pub fn engine_name(&self) -> String {
        self.engine_name.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn resolver(&self) -> Weak<dyn SignalResolver> {
        self.me.clone()
    }

    pub(crate) fn active_sources(&self) -> Vec<Arc<SourceApi>> {
        self.sources.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn all_sources(&self) -> Vec<Arc<SourceApi>> {
        let mut all = self.active_sources();
        all.extend(
            self.staged_sources
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .cloned(),
        );
        all
    }

    fn self_source(&self) -> Option<Arc<SourceApi>> {
        self.all_sources().into_iter().find(|s| s.is_self())
    }

    /// Source with this api, active or staged.
    #[must_use]
    pub fn get_source_api(&self, api: &str) -> Option<Arc<SourceApi>> {
        self.all_sources().into_iter().find(|s| s.api() == api)
    }

    /// Loads a configuration document.
    ///
    /// The metadata `api`, when present, replaces the engine name and the
    /// api of the self source.
    ///
    /// # Errors
    ///
    /// Only fails on a poisoned lock. Rejected entries are logged and listed
    /// in the returned [`LoadReport`].
    pub fn load_config(&self, document: &ConfigDocument) -> ComposerResult<LoadReport> {
        if let Some(name) = document.engine_name() {
            *self.engine_name.write().map_err(|_| lock_err("composer.engine_name"))? = name.to_string();
            if let Some(own) = self.self_source() {
                own.rename_api(name)?;
            }
        }
        self.add_objects(document)
    }

    /// Loads more sources and signals into a running composer.
    ///
    /// # Errors
    ///
    /// Only fails on a poisoned lock.
    pub fn add_objects(&self, document: &ConfigDocument) -> ComposerResult<LoadReport> {
        let mut report = self.load_sources(&document.sources)?;
        self.init_sources_api()?;

        let signals = self.load_signals(&document.signals)?;
        report.signals_rejected += signals.signals_rejected;
        report.errors.extend(signals.errors);

        let activation = self.init_signals()?;
        report.signals_loaded += activation.signals_loaded;
        report.signals_rejected += activation.signals_rejected;
        report.errors.extend(activation.errors);

        let subscription = self.exec_signals_subscription();
        report.subscribed += subscription.subscribed;
        report.errors.extend(subscription.errors);

        info!(
            sources = report.sources_loaded,
            signals = report.signals_loaded,
            rejected = report.sources_rejected + report.signals_rejected,
            "configuration loaded"
        );
        Ok(report)
    }

    /// Parses and stages source entries.
    ///
    /// # Errors
    ///
    /// Only fails on a poisoned lock.
    pub fn load_sources(&self, entries: &[Json]) -> ComposerResult<LoadReport> {
        let mut report = LoadReport::default();
        for entry in entries {
            match self.load_one_source(entry) {
                Ok(()) => report.sources_loaded += 1,
                Err(err) if err.is_internal() => return Err(err),
                Err(err) => {
                    error!(error = %err, entry = %entry, "source rejected");
                    report.sources_rejected += 1;
                    report.errors.push(err);
                }
            }
        }
        Ok(report)
    }

    fn load_one_source(&self, entry: &Json) -> ComposerResult<()> {
        let config = SourceConfig::from_json(entry)?;
        if self.all_sources().iter().any(|s| s.uid() == config.uid) {
            return Err(ConfigError::DuplicateSource { uid: config.uid }.into());
        }

        let on_received = config
            .on_received
            .as_ref()
            .map(|d| ActionRef::from_descriptor("onReceived", d))
            .transpose()?;
        let retention = config
            .retention
            .filter(|r| *r > 0)
            .unwrap_or(self.config.default_retention);

        let mut source = SourceApi::new(config.uid.clone(), config.api())
            .with_info(config.info.clone().unwrap_or_default())
            .with_defaults(SignalDefaults { on_received, retention });
        if let Some(init) = &config.init {
            source = source.with_init(ActionRef::from_descriptor("init", init)?);
        }
        if let Some(get_signals) = &config.get_signals {
            source = source.with_get_signals(ActionRef::from_descriptor("getSignals", get_signals)?);
        }

        debug!(uid = %config.uid, api = %config.api(), "source staged");
        self.staged_sources
            .write()
            .map_err(|_| lock_err("composer.load_sources"))?
            .push(Arc::new(source));
        Ok(())
    }

    /// Runs `init` on every staged source and makes it active.
    ///
    /// Init failures are logged; the source is activated anyway.
    ///
    /// # Errors
    ///
    /// Only fails on a poisoned lock.
    pub fn init_sources_api(&self) -> ComposerResult<usize> {
        let staged = std::mem::take(
            &mut *self
                .staged_sources
                .write()
                .map_err(|_| lock_err("composer.init_sources_api"))?,
        );
        let engine_name = self.engine_name();
        let count = staged.len();
        for source in &staged {
            if let Err(err) = source.init(self.executor.as_ref(), &engine_name) {
                error!(source = %source.uid(), error = %err, "source init failed");
            }
        }
        self.sources
            .write()
            .map_err(|_| lock_err("composer.init_sources_api"))?
            .extend(staged);
        Ok(count)
    }

    /// Parses signal entries and stages them in their sources.
    ///
    /// Raw signals go to the source named by their event, virtual signals to
    /// the self source.
    ///
    /// # Errors
    ///
    /// Only fails on a poisoned lock.
    pub fn load_signals(&self, entries: &[Json]) -> ComposerResult<LoadReport> {
        let mut report = LoadReport::default();
        for entry in entries {
            match self.load_one_signal(entry) {
                Ok(()) => {}
                Err(err) if err.is_internal() => return Err(err),
                Err(err) => {
                    error!(error = %err, entry = %entry, "signal rejected");
                    report.signals_rejected += 1;
                    report.errors.push(err);
                }
            }
        }
        Ok(report)
    }

    fn load_one_signal(&self, entry: &Json) -> ComposerResult<()> {
        let config = SignalConfig::from_json(entry)?;
        if self.find_signal(&config.uid).is_some() {
            return Err(ConfigError::DuplicateSignal { id: config.uid }.into());
        }

        let source = match config.event_api() {
            Some(api) => self
                .get_source_api(api)
                .ok_or_else(|| ConfigError::UnknownSource { api: api.to_string() })?,
            None => self
                .self_source()
                .ok_or_else(|| ComposerError::internal("self source missing"))?,
        };

        let action_uid = format!("onReceived_{}", config.uid);
        let on_received = match &config.on_received {
            Some(descriptor) => Some(ActionRef::from_descriptor(action_uid, descriptor)?),
            None => source.defaults().on_received.as_ref().map(|a| a.with_uid(action_uid)),
        };
        let retention = config
            .retention
            .filter(|r| *r > 0)
            .unwrap_or(source.defaults().retention);

        let mut builder = Signal::builder(config.uid.clone())
            .unit(config.unit.clone().unwrap_or_default())
            .frequency(config.frequency.unwrap_or(0.0))
            .retention(retention)
            .executor(Arc::clone(&self.executor))
            .resolver(self.resolver());
        builder = match &config.event {
            Some(event) => builder.event(event.clone()),
            None => builder.depends(config.depends_list()),
        };
        if let Some(action) = on_received {
            builder = builder.on_received(action);
        }
        if let Some(args) = &config.get_signals_args {
            builder = builder.get_signals_args(args.clone());
        }

        source.add_signal(builder.build()?)
    }

    /// Wires and activates the staged signals of every active source.
    ///
    /// # Errors
    ///
    /// Only fails on a poisoned lock.
    pub fn init_signals(&self) -> ComposerResult<LoadReport> {
        let mut report = LoadReport::default();
        for source in self.active_sources() {
            let activation = source.init_signals(self)?;
            report.signals_loaded += activation.activated.len();
            report.signals_rejected += activation.rejected.len();
            report.errors.extend(activation.rejected.into_iter().map(ComposerError::from));
        }
        Ok(report)
    }

    /// Sends pending subscription requests of every source except the one
    /// serving the engine itself.
    pub fn exec_signals_subscription(&self) -> LoadReport {
        let engine_name = self.engine_name();
        let mut report = LoadReport::default();
        for source in self.active_sources() {
            if source.is_self() || source.api() == engine_name {
                continue;
            }
            // Count what went out even when a provider refused some of it.
            let before = source.active_signals().iter().filter(|s| s.is_subscribed()).count();
            if let Err(err) = source.make_subscription(self.executor.as_ref()) {
                warn!(source = %source.uid(), error = %err, "subscription incomplete");
                report.errors.push(err);
            }
            let after = source.active_signals().iter().filter(|s| s.is_subscribed()).count();
            report.subscribed += after.saturating_sub(before);
        }
        report
    }

    /// Routes a provider event to the signals it concerns.
    ///
    /// When several signals match `channel`, string values of the payload
    /// that match some of them narrow the delivery to those; otherwise every
    /// match receives the event. All notifications run in one
    /// [`DispatchRound`]. Returns the number of signals that handled the
    /// event.
    ///
    /// # Errors
    ///
    /// Returns the first handler error. Every target is still attempted.
    pub fn dispatch_event(&self, channel: &str, payload: &Json) -> ComposerResult<usize> {
        let candidates: Vec<Arc<Signal>> = self
            .search_signals(channel)
            .into_iter()
            .filter(|s| s.phase() != crate::signal::SignalPhase::Staged)
            .collect();
        if candidates.is_empty() {
            debug!(channel, "event matches no signal");
            return Ok(0);
        }

        let targets = if candidates.len() > 1 {
            narrow_targets(&candidates, payload)
        } else {
            candidates
        };

        let _round = DispatchRound::begin();
        let mut handled = 0;
        let mut first_err: Option<ExecutionError> = None;
        for signal in &targets {
            match signal.on_received_cb(payload) {
                Ok(()) => handled += 1,
                Err(err) => {
                    warn!(signal = %signal.id(), channel, error = %err, "event not applied");
                    first_err.get_or_insert(err);
                }
            }
        }
        match first_err {
            Some(err) if handled == 0 => Err(err.into()),
            _ => Ok(handled),
        }
    }

    /// Records a value on every signal matching `name`, without notifying.
    /// Returns the number of signals set.
    pub fn search_and_set(&self, name: &str, timestamp: u64, value: &TimeSeriesValue) -> usize {
        let targets = self.search_signals(name);
        for signal in &targets {
            signal.set(timestamp, value.clone());
        }
        targets.len()
    }

    /// Opens a client session.
    ///
    /// # Errors
    ///
    /// Only fails on a poisoned lock.
    pub fn open_session(&self) -> ComposerResult<(SessionId, ClientStream)> {
        let (session, stream) = ClientSession::open(self.config.stream_capacity);
        let id = session.id();
        let mut sessions = self.sessions.write().map_err(|_| lock_err("composer.open_session"))?;
        sessions.retain(|_, s| !s.is_closed());
        sessions.insert(id, session);
        debug!(session = %id, "session opened");
        Ok((id, stream))
    }

    fn session(&self, id: SessionId) -> ComposerResult<Arc<ClientSession>> {
        self.sessions
            .read()
            .map_err(|_| lock_err("composer.session"))?
            .get(&id)
            .cloned()
            .ok_or_else(|| ExecutionError::SessionNotFound { id: id.to_string() }.into())
    }

    /// Subscribes a session to every signal matching any of `names`.
    ///
    /// Overlapping names never register a signal twice. Returns the number
    /// of signals newly observed.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::SessionNotFound` for an unknown session.
    pub fn subscribe(&self, id: SessionId, names: &[&str]) -> ComposerResult<usize> {
        let session = self.session(id)?;
        let signals: Vec<Arc<Signal>> = names.iter().flat_map(|n| self.search_signals(n)).collect();
        let added = ClientSession::subscribe(&session, &signals);
        debug!(session = %id, added, "session subscribed");
        Ok(added)
    }

    /// Stops a session observing every signal matching any of `names`.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::SessionNotFound` for an unknown session.
    pub fn unsubscribe(&self, id: SessionId, names: &[&str]) -> ComposerResult<()> {
        let session = self.session(id)?;
        let signals: Vec<Arc<Signal>> = names.iter().flat_map(|n| self.search_signals(n)).collect();
        session.unsubscribe(&signals);
        Ok(())
    }

    /// Signal ids a session observes.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::SessionNotFound` for an unknown session.
    pub fn session_signals(&self, id: SessionId) -> ComposerResult<Vec<String>> {
        Ok(self.session(id)?.subscribed())
    }

    /// Closes a session and detaches it from its signals.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::SessionNotFound` for an unknown session.
    pub fn close_session(&self, id: SessionId) -> ComposerResult<()> {
        let session = self
            .sessions
            .write()
            .map_err(|_| lock_err("composer.close_session"))?
            .remove(&id)
            .ok_or_else(|| ComposerError::from(ExecutionError::SessionNotFound { id: id.to_string() }))?;
        session.close();
        Ok(())
    }

    /// Number of open sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|s| !s.is_closed())
            .count()
    }

    /// Releases sessions, sources and signals.
    ///
    /// The composer is left with an uninitialized self source, as after
    /// [`Composer::new`].
    pub fn teardown(&self) {
        let sessions = std::mem::take(&mut *self.sessions.write().unwrap_or_else(PoisonError::into_inner));
        for session in sessions.values() {
            session.close();
        }
        let mut sources = std::mem::take(&mut *self.sources.write().unwrap_or_else(PoisonError::into_inner));
        sources.extend(std::mem::take(
            &mut *self.staged_sources.write().unwrap_or_else(PoisonError::into_inner),
        ));
        for source in &sources {
            source.clear();
        }
        self.staged_sources
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(SourceApi::self_source(self.config.default_retention)));
        info!(sources = sources.len(), sessions = sessions.len(), "composer torn down");
    }
}

fn narrow_targets(candidates: &[Arc<Signal>], payload: &Json) -> Vec<Arc<Signal>> {
    let names: Vec<&str> = match payload {
        Json::Object(map) => map.values().filter_map(Json::as_str).collect(),
        _ => Vec::new(),
    };
    let narrowed: Vec<Arc<Signal>> = candidates
        .iter()
        .filter(|s| names.iter().any(|n| s.matches(n)))
        .cloned()
        .collect();
    if narrowed.is_empty() {
        candidates.to_vec()
    } else {
        narrowed
    }
}

impl std::fmt::Debug for Composer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Composer")
            .field("engine_name", &self.engine_name())
            .field("sources", &self.all_sources().len())
            .field("sessions", &self.session_count())
            .finish_non_exhaustive()
    }
}
