//! Environment-loadable pieces of a process launch: binary overrides,
//! restart policy tuning, the default working directory, and the
//! container image to use for containerized sessions.
//!
//! Mirrors the teacher's `SessionConfig` pattern: every field carries a
//! `#[serde(default = "...")]` plus a hand-written [`Default`] impl, so a
//! partial JSON or environment snapshot still produces a complete,
//! sensible config. No command-line flag parsing lives here — this is a
//! data object the embedding application populates.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

fn default_agent_binary() -> String {
    "plural-agent".to_string()
}

fn default_container_runtime() -> String {
    "docker".to_string()
}

fn default_container_image() -> String {
    "plural-agent:latest".to_string()
}

fn default_max_restarts() -> u32 {
    3
}

fn default_restart_delay_ms() -> u64 {
    500
}

/// Environmental configuration for a [`crate::session_runner::SessionRunner`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Name or path of the agent binary the supervisor launches.
    #[serde(default = "default_agent_binary")]
    pub agent_binary: String,

    /// Container runtime binary used to wrap containerized launches.
    #[serde(default = "default_container_runtime")]
    pub container_runtime: String,

    /// Default container image, used when a session enables containerized
    /// mode without naming one explicitly.
    #[serde(default = "default_container_image")]
    pub default_container_image: String,

    /// Working directory new sessions start in absent an explicit override.
    #[serde(default)]
    pub default_working_dir: Option<PathBuf>,

    /// Maximum number of in-place restarts the supervisor attempts before
    /// giving up and reporting a fatal error.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Fixed delay, in milliseconds, before each restart attempt.
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            agent_binary: default_agent_binary(),
            container_runtime: default_container_runtime(),
            default_container_image: default_container_image(),
            default_working_dir: None,
            max_restarts: default_max_restarts(),
            restart_delay_ms: default_restart_delay_ms(),
        }
    }
}

impl RunnerConfig {
    /// Build a config from well-known environment variables, falling back
    /// to defaults for anything unset or unparseable.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(bin) = std::env::var("PLURAL_AGENT_BIN") {
            if !bin.is_empty() {
                config.agent_binary = bin;
            }
        }
        if let Ok(runtime) = std::env::var("PLURAL_CONTAINER_RUNTIME") {
            if !runtime.is_empty() {
                config.container_runtime = runtime;
            }
        }
        if let Ok(image) = std::env::var("PLURAL_CONTAINER_IMAGE") {
            if !image.is_empty() {
                config.default_container_image = image;
            }
        }
        if let Ok(dir) = std::env::var("PLURAL_WORKING_DIR") {
            if !dir.is_empty() {
                config.default_working_dir = Some(PathBuf::from(dir));
            }
        }
        if let Ok(max_restarts) = std::env::var("PLURAL_MAX_RESTARTS") {
            if let Ok(value) = max_restarts.parse() {
                config.max_restarts = value;
            }
        }
        if let Ok(delay) = std::env::var("PLURAL_RESTART_DELAY_MS") {
            if let Ok(value) = delay.parse() {
                config.restart_delay_ms = value;
            }
        }

        config
    }

    #[must_use]
    pub fn restart_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.restart_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sensible_values() {
        let config = RunnerConfig::default();
        assert_eq!(config.agent_binary, "plural-agent");
        assert_eq!(config.max_restarts, 3);
        assert!(config.default_working_dir.is_none());
    }

    #[test]
    fn deserializing_an_empty_object_fills_in_defaults() {
        let config: RunnerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, RunnerConfig::default());
    }

    #[test]
    fn deserializing_a_partial_object_overrides_only_named_fields() {
        let config: RunnerConfig =
            serde_json::from_str(r#"{"agent_binary":"custom-agent","max_restarts":7}"#).unwrap();
        assert_eq!(config.agent_binary, "custom-agent");
        assert_eq!(config.max_restarts, 7);
        assert_eq!(config.container_runtime, "docker");
    }

    #[test]
    fn env_override_takes_precedence_over_default() {
        std::env::set_var("PLURAL_AGENT_BIN", "env-agent");
        std::env::set_var("PLURAL_MAX_RESTARTS", "9");
        let config = RunnerConfig::from_env();
        assert_eq!(config.agent_binary, "env-agent");
        assert_eq!(config.max_restarts, 9);
        std::env::remove_var("PLURAL_AGENT_BIN");
        std::env::remove_var("PLURAL_MAX_RESTARTS");
    }
}
