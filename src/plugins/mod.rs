//! Native plugins and the default action executor.
//!
//! A [`Plugin`] exports named functions reachable through `plugin://` action
//! URIs and keeps whatever private state it needs inside itself. The
//! [`PluginRegistry`] routes native callbacks to registered plugins and hands
//! every other action kind to an optional fallback executor.

/// Built-in helper functions.
pub mod builtin;

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use crate::action::{ActionContext, ActionExecutor, ActionKind, ActionRef};
use crate::error::ExecutionError;

pub use builtin::BuiltinPlugin;

/// A native plugin.
pub trait Plugin: Send + Sync {
    /// Name used in `plugin://<name>/<function>` URIs.
    fn name(&self) -> &str;

    /// Runs `function` on behalf of `action`.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::UnknownFunction` when the plugin does not
    /// export `function`, or any error the function itself produces.
    fn call(
        &self,
        function: &str,
        action: &ActionRef,
        ctx: &ActionContext<'_>,
        payload: Option<&serde_json::Value>,
    ) -> Result<(), ExecutionError>;
}

/// Executor backed by registered native plugins.
pub struct PluginRegistry {
    plugins: RwLock<HashMap<String, Arc<dyn Plugin>>>,
    fallback: Option<Arc<dyn ActionExecutor>>,
}

impl PluginRegistry {
    /// Creates an empty registry with no fallback.
    #[must_use]
    pub fn new() -> Self {
        Self {
            plugins: RwLock::new(HashMap::new()),
            fallback: None,
        }
    }

    /// Creates a registry with the [`BuiltinPlugin`] already registered.
    #[must_use]
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(BuiltinPlugin));
        registry
    }

    /// Executor used for remote and scripted actions.
    #[must_use]
    pub fn with_fallback(mut self, fallback: Arc<dyn ActionExecutor>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Registers a plugin under its name. Returns the plugin it replaced.
    pub fn register(&self, plugin: Arc<dyn Plugin>) -> Option<Arc<dyn Plugin>> {
        let name = plugin.name().to_string();
        debug!(plugin = %name, "registering plugin");
        self.plugins
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, plugin)
    }

    /// Plugin registered under `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Registered plugin names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.names())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl ActionExecutor for PluginRegistry {
    fn execute(
        &self,
        action: &ActionRef,
        ctx: &ActionContext<'_>,
        payload: Option<&serde_json::Value>,
    ) -> Result<(), ExecutionError> {
        match action.kind() {
            ActionKind::NativeCallback { plugin, function } => {
                // Clone out of the map so the lock is not held during the call.
                let target = self.get(plugin).ok_or_else(|| ExecutionError::UnknownPlugin {
                    plugin: plugin.clone(),
                })?;
                target.call(function, action, ctx, payload)
            }
            kind => match &self.fallback {
                Some(fallback) => fallback.execute(action, ctx, payload),
                None => Err(ExecutionError::Unsupported {
                    kind: kind.label(),
                    action: action.to_string(),
                }),
            },
        }
    }
}
