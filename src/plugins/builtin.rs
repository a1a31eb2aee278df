use serde_json::Value as Json;
use tracing::debug;

use crate::action::{ActionContext, ActionRef};
use crate::error::ExecutionError;
use crate::plugins::Plugin;
use crate::time::{monotonic_micros, seconds_to_micros};
use crate::value::TimeSeriesValue;

/// Plugin exported as `builtin`.
///
/// - `defaultOnReceived`: records the payload's `value`/`timestamp` on the
///   signal the action runs for.
/// - `setSignalValue`: takes `{name, value, timestamp?}` and sets the bound
///   signal, or every signal matching `name` when the action is not bound to
///   one. A payload timestamp is in microseconds, like the provider events and
///   upstream descriptions that feed it. A timestamp given in the action's
///   `args` is in seconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinPlugin;

impl BuiltinPlugin {
    fn default_on_received(ctx: &ActionContext<'_>, payload: Option<&Json>) -> Result<(), ExecutionError> {
        let signal = ctx
            .signal()
            .ok_or_else(|| ExecutionError::failed(ctx.uid(), "defaultOnReceived needs a signal"))?;
        signal.default_received_cb(payload.unwrap_or(&Json::Null))
    }

    fn set_signal_value(
        action: &ActionRef,
        ctx: &ActionContext<'_>,
        payload: Option<&Json>,
    ) -> Result<(), ExecutionError> {
        let field = |key: &str| {
            payload
                .and_then(|p| p.get(key))
                .or_else(|| action.args().and_then(|a| a.get(key)))
        };

        let name = field("name")
            .and_then(Json::as_str)
            .ok_or_else(|| ExecutionError::failed(ctx.uid(), "missing string argument 'name'"))?;
        let value = field("value")
            .and_then(TimeSeriesValue::from_json)
            .ok_or_else(|| ExecutionError::failed(ctx.uid(), "missing scalar argument 'value'"))?;
        let timestamp = payload
            .and_then(|p| p.get("timestamp"))
            .and_then(Json::as_u64)
            .or_else(|| {
                action
                    .args()
                    .and_then(|a| a.get("timestamp"))
                    .and_then(Json::as_u64)
                    .map(seconds_to_micros)
            })
            .unwrap_or_else(monotonic_micros);

        if ctx.signal().is_some() {
            return ctx.set_signal_value(timestamp, value);
        }

        let count = ctx.search_and_set(name, timestamp, &value);
        debug!(name, count, "setSignalValue");
        if count == 0 {
            return Err(ExecutionError::NoData { signal: name.to_string() });
        }
        Ok(())
    }
}

impl Plugin for BuiltinPlugin {
    fn name(&self) -> &str {
        "builtin"
    }

    fn call(
        &self,
        function: &str,
        action: &ActionRef,
        ctx: &ActionContext<'_>,
        payload: Option<&Json>,
    ) -> Result<(), ExecutionError> {
        match function {
            "defaultOnReceived" => Self::default_on_received(ctx, payload),
            "setSignalValue" => Self::set_signal_value(action, ctx, payload),
            other => Err(ExecutionError::UnknownFunction {
                plugin: self.name().to_string(),
                function: other.to_string(),
            }),
        }
    }
}
