//! Named debugger commands.
//!
//! A controller that talks to the debugger through messages rather than through the Rust
//! API sends commands by name with JSON parameters. The built-in commands are registered
//! in every [`CommandTable`]; anything else goes to an optional fallback callback.

use std::sync::Arc;

use log::debug;
use rustc_hash::FxHashMap;
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Value, json};

use super::{
    BreakpointId, Debugger, ScriptId,
    host::{EvaluationTarget, Host, stack_trace_frames},
};
use crate::DebugError;

/// A built-in command.
pub type CommandHandler = fn(&mut Debugger, &mut dyn Host, Value) -> Result<Value, DebugError>;

/// Receives the commands no handler is registered for, with their name.
pub type CommandCallback =
    Arc<dyn Fn(&mut Debugger, &mut dyn Host, &str, Value) -> Result<Value, DebugError> + Send + Sync>;

/// Maps command names to their handlers.
pub struct CommandTable {
    handlers: FxHashMap<&'static str, CommandHandler>,
    fallback: Option<CommandCallback>,
}

impl std::fmt::Debug for CommandTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.handlers.keys().collect();
        names.sort_unstable();
        f.debug_struct("CommandTable")
            .field("handlers", &names)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl Default for CommandTable {
    fn default() -> Self {
        let mut table = Self {
            handlers: FxHashMap::default(),
            fallback: None,
        };
        table.register("Debugger.getPossibleBreakpoints", get_possible_breakpoints);
        table.register("Debugger.setBreakpoint", set_breakpoint);
        table.register("Debugger.removeBreakpoint", remove_breakpoint);
        table.register("Debugger.setBreakpointsActive", set_breakpoints_active);
        table.register("Debugger.evaluate", evaluate);
        table.register("Target.countStackFrames", count_stack_frames);
        table.register("Target.getStackFunctionIDs", get_stack_function_ids);
        table.register("Target.currentGeneratorId", current_generator_id);
        table
    }
}

impl CommandTable {
    /// Registers `handler` under `name`, replacing any previous handler.
    pub fn register(&mut self, name: &'static str, handler: CommandHandler) {
        self.handlers.insert(name, handler);
    }

    /// The handler registered under `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<CommandHandler> {
        self.handlers.get(name).copied()
    }

    /// Installs or removes the fallback for unregistered commands.
    pub fn set_fallback(&mut self, callback: Option<CommandCallback>) {
        self.fallback = callback;
    }
}

impl Debugger {
    /// Runs the command `name` with `params`.
    ///
    /// A command without a handler goes to the fallback callback. Without one, the result is
    /// `{"error": "Command callback not installed"}`.
    ///
    /// # Errors
    ///
    /// Returns [`DebugError::InvalidParams`] if `params` do not fit the command, or the
    /// command's own failure.
    pub fn dispatch_command(
        &mut self,
        host: &mut dyn Host,
        name: &str,
        params: Value,
    ) -> Result<Value, DebugError> {
        if let Some(handler) = self.commands.get(name) {
            return handler(self, host, params);
        }
        let Some(fallback) = self.commands.fallback.clone() else {
            debug!("no handler for command `{name}`");
            return Ok(json!({ "error": "Command callback not installed" }));
        };
        fallback(self, host, name, params)
    }

    /// Registers `handler` under `name`.
    pub fn register_command(&mut self, name: &'static str, handler: CommandHandler) {
        self.commands.register(name, handler);
    }

    /// Installs or removes the fallback for unregistered commands.
    pub fn set_command_callback(&mut self, callback: Option<CommandCallback>) {
        self.commands.set_fallback(callback);
    }
}

fn params<T: DeserializeOwned>(params: Value) -> Result<T, DebugError> {
    // Commands without parameters may be sent with `null`.
    let params = if params.is_null() { json!({}) } else { params };
    serde_json::from_value(params).map_err(DebugError::InvalidParams)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PossibleBreakpointsParams {
    script_id: u32,
    start: i32,
    end: i32,
    #[serde(default)]
    restrict_to_function: bool,
}

fn get_possible_breakpoints(
    debugger: &mut Debugger,
    host: &mut dyn Host,
    value: Value,
) -> Result<Value, DebugError> {
    let p: PossibleBreakpointsParams = params(value)?;
    let locations = debugger
        .get_possible_breakpoints(host, ScriptId(p.script_id), p.start, p.end, p.restrict_to_function)
        .unwrap_or_default();
    let locations: Vec<Value> = locations
        .iter()
        .map(|location| {
            json!({
                "position": location.position(),
                "codeOffset": location.code_offset(),
                "type": location.location_type(),
            })
        })
        .collect();
    Ok(json!({ "locations": locations }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetBreakpointParams {
    script_id: u32,
    position: i32,
    #[serde(default)]
    condition: Option<String>,
}

fn set_breakpoint(debugger: &mut Debugger, host: &mut dyn Host, value: Value) -> Result<Value, DebugError> {
    let p: SetBreakpointParams = params(value)?;
    let mut position = p.position;
    let id = debugger.set_breakpoint_for_script(
        host,
        ScriptId(p.script_id),
        p.condition.as_deref(),
        &mut position,
    );
    Ok(json!({
        "breakpointId": id.map(|id| id.0),
        "actualPosition": position,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoveBreakpointParams {
    breakpoint_id: u32,
}

fn remove_breakpoint(debugger: &mut Debugger, host: &mut dyn Host, value: Value) -> Result<Value, DebugError> {
    let p: RemoveBreakpointParams = params(value)?;
    debugger.remove_breakpoint(host, BreakpointId(p.breakpoint_id));
    Ok(json!({}))
}

#[derive(Debug, Deserialize)]
struct SetBreakpointsActiveParams {
    active: bool,
}

fn set_breakpoints_active(
    debugger: &mut Debugger,
    _host: &mut dyn Host,
    value: Value,
) -> Result<Value, DebugError> {
    let p: SetBreakpointsActiveParams = params(value)?;
    debugger.set_break_points_active(p.active);
    Ok(json!({}))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EvaluateParams {
    expression: String,
    #[serde(default)]
    throw_on_side_effect: bool,
}

fn evaluate(debugger: &mut Debugger, host: &mut dyn Host, value: Value) -> Result<Value, DebugError> {
    let p: EvaluateParams = params(value)?;
    let target = debugger
        .break_frame_id()
        .map_or(EvaluationTarget::Global, |frame| EvaluationTarget::Local {
            frame,
            inlined_index: 0,
        });
    let result = debugger.evaluate(host, target, &p.expression, p.throw_on_side_effect)?;
    Ok(json!({ "result": result }))
}

fn count_stack_frames(
    debugger: &mut Debugger,
    host: &mut dyn Host,
    _value: Value,
) -> Result<Value, DebugError> {
    Ok(json!({ "count": debugger.current_frame_count(host) }))
}

fn get_stack_function_ids(
    debugger: &mut Debugger,
    host: &mut dyn Host,
    _value: Value,
) -> Result<Value, DebugError> {
    let mut ids = Vec::new();
    for frame in stack_trace_frames(host) {
        for summary in frame.summaries.iter().rev() {
            ids.push(debugger.get_function_debugging_id(host, summary.function));
        }
    }
    Ok(json!({ "functionIds": ids }))
}

fn current_generator_id(
    debugger: &mut Debugger,
    _host: &mut dyn Host,
    _value: Value,
) -> Result<Value, DebugError> {
    Ok(json!({
        "generatorId": debugger.suspended_generator().map(|generator| generator.address()),
    }))
}
