mod backend;
mod observability;
mod session;
mod template;

pub use backend::*;
pub use observability::*;
pub use session::*;
pub use template::*;

use serde::{Deserialize, Serialize};
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub template: TemplateConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if self.session.max_tool_turns == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "session.max_tool_turns".into(),
                message: "0 disables tool dispatch entirely".into(),
            });
        }

        for (i, stop) in self.session.stop_sequences.iter().enumerate() {
            if stop.is_empty() {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: format!("session.stop_sequences[{i}]"),
                    message: "stop sequence must not be empty".into(),
                });
            }
        }

        if self.session.event_buffer == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "session.event_buffer".into(),
                message: "event buffer must be greater than 0".into(),
            });
        }

        let retry = &self.session.retry;
        if retry.backoff_factor < 1.0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "session.retry.backoff_factor".into(),
                message: "backoff factor must be at least 1.0".into(),
            });
        }
        if retry.max_delay_ms < retry.base_delay_ms {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "session.retry.max_delay_ms".into(),
                message: "max delay is below the base delay; every retry waits max_delay_ms"
                    .into(),
            });
        }

        match self.backend.kind {
            BackendKind::Loopback if self.backend.loopback.base_url.is_empty() => {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: "backend.loopback.base_url".into(),
                    message: "base_url must not be empty".into(),
                });
            }
            BackendKind::Replay if self.backend.replay.script.is_none() => {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Warning,
                    field: "backend.replay.script".into(),
                    message: "no replay script configured; pass --replay".into(),
                });
            }
            _ => {}
        }

        errors
    }
}
