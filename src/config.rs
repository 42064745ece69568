//! Run configuration shared by every VM in a batch.
//!
//! Values come from the environment first and command-line flags override
//! them:
//!
//! | variable | flag | meaning |
//! |---|---|---|
//! | `REGVM_TRACE` | `-t`, `--trace` | log every fetched instruction and the register file |
//! | `REGVM_MAX_STEPS` | `--max-steps <n>` | fault a VM after `n` executed instructions |

use thiserror::Error;

pub const ENV_TRACE: &str = "REGVM_TRACE";
pub const ENV_MAX_STEPS: &str = "REGVM_MAX_STEPS";

/// Raised while reading run configuration from the environment or command line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{key} expects a non-negative integer, got '{value}'")]
    InvalidNumber { key: String, value: String },
    #[error("{flag} requires an argument")]
    MissingArgument { flag: String },
}

/// Per-VM execution settings. The default reproduces plain run-to-halt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunConfig {
    /// Log each instruction before it executes.
    pub trace: bool,
    /// Upper bound on executed instructions; `None` runs until halt or fault.
    pub max_steps: Option<u64>,
}

impl RunConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let trace = lookup(ENV_TRACE).is_some_and(|v| parse_bool(&v));
        let max_steps = match lookup(ENV_MAX_STEPS) {
            Some(raw) if !raw.trim().is_empty() => Some(parse_steps(ENV_MAX_STEPS, &raw)?),
            _ => None,
        };
        Ok(Self { trace, max_steps })
    }

    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    pub fn with_max_steps(mut self, max_steps: Option<u64>) -> Self {
        self.max_steps = max_steps;
        self
    }
}

/// Parses a step count for the given key or flag name.
pub fn parse_steps(key: &str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidNumber {
            key: key.to_string(),
            value: raw.to_string(),
        })
}

fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
