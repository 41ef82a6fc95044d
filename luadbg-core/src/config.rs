//! Debugger configuration

use serde::{Deserialize, Serialize};

use crate::error::DebuggerError;

/// Tunables for a [`Debugger`](crate::Debugger) instance.
///
/// All fields have defaults, so a TOML file only needs the keys it changes:
///
/// ```toml
/// tick_interval = 500
/// max_depth = 8
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebuggerConfig {
    /// Number of VM instructions between two tick events. `0` disables ticks.
    pub tick_interval: u32,
    /// Table nesting depth after which marshaling stops descending.
    pub max_depth: usize,
    /// Name of the synthetic local that carries extra variadic arguments.
    pub vararg_name: String,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            tick_interval: 1000,
            max_depth: 16,
            vararg_name: "(*vararg)".to_string(),
        }
    }
}

impl DebuggerConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, DebuggerError> {
        let config: DebuggerConfig =
            toml::from_str(text).map_err(|e| DebuggerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), DebuggerError> {
        if self.max_depth == 0 {
            return Err(DebuggerError::Config("max_depth must be at least 1".to_string()));
        }
        if self.tick_interval > i32::MAX as u32 {
            return Err(DebuggerError::Config(format!(
                "tick_interval {} is out of range",
                self.tick_interval
            )));
        }
        if self.vararg_name.is_empty() {
            return Err(DebuggerError::Config("vararg_name must not be empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = DebuggerConfig::from_toml_str("tick_interval = 250").unwrap();
        assert_eq!(config.tick_interval, 250);
        assert_eq!(config.max_depth, 16);
        assert_eq!(config.vararg_name, "(*vararg)");
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(
            DebuggerConfig::from_toml_str("max_depth = 0"),
            Err(DebuggerError::Config(_))
        ));
        assert!(matches!(
            DebuggerConfig::from_toml_str("tick_interval = \"often\""),
            Err(DebuggerError::Config(_))
        ));
    }
}
