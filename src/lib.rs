//! # Signal Composer - vehicle signal composition engine
//!
//! The composer gathers low level signals from external providers (CAN bus,
//! GPS, sensors), keeps a short time-windowed history of each, and lets
//! configuration declare *virtual* signals computed from other signals.
//! Interested clients subscribe by name and receive pushes whenever a signal
//! they watch changes.
//!
//! ## Core Concepts
//!
//! - **Signal**: a named time series with a bounded history and statistics
//! - **SourceApi**: the group of signals fed by one provider
//! - **Virtual signal**: a signal whose `depends` list names other signals;
//!   it observes them and runs its `onReceived` action when they change
//! - **Composer**: the registry owning sources, signals and client sessions
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use signal_composer::{Composer, ComposerConfig, ConfigDocument, PluginRegistry};
//!
//! let composer = Composer::new(ComposerConfig::default(), Arc::new(PluginRegistry::with_builtin()));
//! composer.load_config(&ConfigDocument::from_path("signals.json")?)?;
//!
//! let (session, stream) = composer.open_session()?;
//! composer.subscribe(session, &["vehicle_speed"])?;
//!
//! composer.dispatch_event("low-can/messages.vehicle.speed", &serde_json::json!({"value": 42.0}))?;
//! let push = stream.recv()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod error;
pub mod time;
pub mod value;

// Graph
pub mod observer;
pub mod signal;
pub mod source;

// Actions and configuration
pub mod action;
pub mod config;
pub mod plugins;

// Runtime
pub mod client;
pub mod composer;

pub use action::{ActionContext, ActionDescriptor, ActionExecutor, ActionKind, ActionRef};
pub use client::{ClientSession, ClientStream, DispatchRound, SessionId, SignalEvent};
pub use composer::{Composer, LoadReport, Reading, SignalReading, ValueOptions};
pub use config::{ComposerConfig, ConfigDocument, SignalConfig, SourceConfig};
pub use error::{ComposerError, ComposerResult, ConfigError, ExecutionError, GraphError};
pub use observer::{Notifiable, Notifier};
pub use plugins::{BuiltinPlugin, Plugin, PluginRegistry};
pub use signal::{Signal, SignalBuilder, SignalDescription, SignalPhase, SignalResolver};
pub use source::{SignalDefaults, SourceApi};
pub use value::TimeSeriesValue;
