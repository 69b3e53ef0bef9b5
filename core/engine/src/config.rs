//! Debugger configuration.

use serde::{Deserialize, Serialize};

use crate::DebugError;

/// Runtime configuration of a [`Debugger`](crate::Debugger).
///
/// The configuration can be built in code or decoded from a JSON document:
///
/// ```
/// use tripwire_engine::DebugConfig;
///
/// let config = DebugConfig::from_json(r#"{ "breakOnUncaughtException": true }"#).unwrap();
/// assert!(config.break_on_uncaught_exception);
/// assert!(config.break_points_active);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
#[allow(clippy::struct_excessive_bools)]
pub struct DebugConfig {
    /// Whether user breakpoints are evaluated when reached.
    pub break_points_active: bool,
    /// Report every thrown exception to the delegate.
    pub break_on_exception: bool,
    /// Report exceptions that are predicted to be uncaught.
    pub break_on_uncaught_exception: bool,
    /// Log the location of every reported break at `trace` level.
    pub print_break_location: bool,
    /// Log why side-effect-free evaluation failed at `trace` level.
    pub trace_side_effect_free_debug_evaluate: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            break_points_active: true,
            break_on_exception: false,
            break_on_uncaught_exception: false,
            print_break_location: false,
            trace_side_effect_free_debug_evaluate: false,
        }
    }
}

impl DebugConfig {
    /// Decodes a configuration from JSON. Missing fields take their default value.
    ///
    /// # Errors
    ///
    /// Returns [`DebugError::Config`] if the document is not a valid configuration.
    pub fn from_json(source: &str) -> Result<Self, DebugError> {
        serde_json::from_str(source).map_err(DebugError::Config)
    }

    /// Sets whether user breakpoints are active.
    #[must_use]
    pub const fn with_break_points_active(mut self, active: bool) -> Self {
        self.break_points_active = active;
        self
    }

    /// Sets the exception reporting flags.
    #[must_use]
    pub const fn with_break_on_exception(mut self, all: bool, uncaught: bool) -> Self {
        self.break_on_exception = all;
        self.break_on_uncaught_exception = uncaught;
        self
    }

    /// Enables break location logging.
    #[must_use]
    pub const fn with_print_break_location(mut self, enabled: bool) -> Self {
        self.print_break_location = enabled;
        self
    }
}
