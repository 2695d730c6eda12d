//! Server configuration.
//!
//! Loaded from a YAML file (`chatrelay.yaml` by default); a missing file
//! yields the defaults. `${VAR}` and `${VAR:-default}` references are
//! expanded from the environment before parsing.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::fs;

use crate::dispatch::RetryPolicy;
use crate::janitor::JanitorConfig;
use crate::session::LifecycleTimeouts;

// ============================================================================
// Config (root)
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub challenge: ChallengeSection,
    #[serde(default)]
    pub dispatch: DispatchSection,
    #[serde(default)]
    pub janitor: JanitorSection,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("environment variable '{0}' is not set")]
    MissingEnvVar(String),

    #[error("unclosed variable reference '${{' (missing '}}')")]
    UnclosedVarReference,
}

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        let expanded = expand_env_vars(&contents)?;
        Ok(serde_yaml::from_str(&expanded)?)
    }
}

/// Resolve a path relative to the config file directory.
///
/// Absolute paths are returned as-is; relative paths are joined with the
/// config file's parent directory so behavior does not depend on the
/// current working directory.
pub fn resolve_path(config_path: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }

    let config_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    config_dir.join(path)
}

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    pub request_timeout_seconds: u64,
    pub max_connections: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout_seconds: 300,
            max_connections: 256,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TransportSection {
    /// `loopback` or `subprocess`.
    pub mode: String,
    /// Command to spawn per identity (subprocess mode).
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    /// Root directory for per-identity transport state.
    pub state_dir: Option<PathBuf>,
    pub init_timeout_seconds: u64,
    pub destroy_timeout_seconds: u64,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            mode: "loopback".to_string(),
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            state_dir: None,
            init_timeout_seconds: 90,
            destroy_timeout_seconds: 15,
        }
    }
}

impl TransportSection {
    pub fn lifecycle_timeouts(&self) -> LifecycleTimeouts {
        LifecycleTimeouts {
            initialize: Duration::from_secs(self.init_timeout_seconds),
            destroy: Duration::from_secs(self.destroy_timeout_seconds),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ChallengeSection {
    pub ttl_minutes: u64,
    /// How long the challenge endpoint waits for a challenge to appear.
    pub wait_seconds: u64,
}

impl Default for ChallengeSection {
    fn default() -> Self {
        Self {
            ttl_minutes: 10,
            wait_seconds: 10,
        }
    }
}

impl ChallengeSection {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.ttl_minutes as i64)
    }

    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_seconds)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DispatchSection {
    pub max_attempts: u32,
    pub attempt_timeout_seconds: u64,
    pub retry_delay_seconds: u64,
    pub reinit_delay_seconds: u64,
    pub address_suffix: String,
    pub crash_signatures: Vec<String>,
}

impl Default for DispatchSection {
    fn default() -> Self {
        let defaults = RetryPolicy::default();
        Self {
            max_attempts: defaults.max_attempts,
            attempt_timeout_seconds: defaults.attempt_timeout.as_secs(),
            retry_delay_seconds: defaults.retry_delay.as_secs(),
            reinit_delay_seconds: defaults.reinit_delay.as_secs(),
            address_suffix: defaults.address_suffix,
            crash_signatures: defaults.crash_signatures,
        }
    }
}

impl DispatchSection {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            attempt_timeout: Duration::from_secs(self.attempt_timeout_seconds),
            retry_delay: Duration::from_secs(self.retry_delay_seconds),
            reinit_delay: Duration::from_secs(self.reinit_delay_seconds),
            address_suffix: self.address_suffix.clone(),
            crash_signatures: self.crash_signatures.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct JanitorSection {
    pub interval_seconds: u64,
    pub bringup_window_seconds: u64,
}

impl Default for JanitorSection {
    fn default() -> Self {
        Self {
            interval_seconds: 60,
            bringup_window_seconds: 300,
        }
    }
}

impl JanitorSection {
    pub fn janitor_config(&self) -> JanitorConfig {
        JanitorConfig {
            interval: Duration::from_secs(self.interval_seconds),
            bringup_window: chrono::Duration::seconds(self.bringup_window_seconds as i64),
            ..JanitorConfig::default()
        }
    }
}

// ============================================================================
// Environment Variable Expansion
// ============================================================================

/// Expand `${VAR}` and `${VAR:-default}` references.
///
/// `$$` escapes a literal `$`; a `$` not followed by `{` is kept as-is.
/// Nested references are not supported, and an unclosed `${` is an error.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(idx) = rest.find('$') {
        out.push_str(&rest[..idx]);
        let tail = &rest[idx + 1..];

        if let Some(after) = tail.strip_prefix('$') {
            out.push('$');
            rest = after;
        } else if let Some(after) = tail.strip_prefix('{') {
            let Some(end) = after.find('}') else {
                return Err(ConfigError::UnclosedVarReference);
            };
            let reference = &after[..end];
            let (name, default) = match reference.split_once(":-") {
                Some((name, default)) => (name, Some(default)),
                None => (reference, None),
            };
            match std::env::var(name) {
                Ok(value) => out.push_str(&value),
                Err(_) => match default {
                    Some(default) => out.push_str(default),
                    None => return Err(ConfigError::MissingEnvVar(name.to_string())),
                },
            }
            rest = &after[end + 1..];
        } else {
            out.push('$');
            rest = tail;
        }
    }

    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let config = Config::load("/nonexistent/chatrelay.yaml").await.unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.transport.mode, "loopback");
        assert_eq!(config.challenge.ttl_minutes, 10);
        assert_eq!(config.dispatch.max_attempts, 5);
        assert_eq!(config.janitor.interval_seconds, 60);
    }

    #[tokio::test]
    async fn parses_yaml_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chatrelay.yaml");
        std::fs::write(
            &path,
            r#"
server:
  port: 9999
transport:
  mode: subprocess
  command: /usr/local/bin/wa-transport
  args: ["--headless"]
dispatch:
  max_attempts: 3
  crash_signatures: ["boom"]
challenge:
  ttl_minutes: 2
"#,
        )
        .unwrap();

        let config = Config::load(&path).await.unwrap();
        assert_eq!(config.server.port, 9999);
        assert_eq!(config.transport.mode, "subprocess");
        assert_eq!(
            config.transport.command.as_deref(),
            Some("/usr/local/bin/wa-transport")
        );
        assert_eq!(config.dispatch.max_attempts, 3);
        assert_eq!(config.dispatch.crash_signatures, vec!["boom".to_string()]);
        assert_eq!(config.challenge.ttl(), chrono::Duration::minutes(2));

        // Untouched sections keep their defaults.
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.dispatch.address_suffix, "@c.us");
    }

    #[test]
    fn retry_policy_conversion() {
        let section = DispatchSection {
            max_attempts: 7,
            retry_delay_seconds: 1,
            ..DispatchSection::default()
        };
        let policy = section.retry_policy();
        assert_eq!(policy.max_attempts, 7);
        assert_eq!(policy.retry_delay, Duration::from_secs(1));
        assert_eq!(policy.attempt_timeout, Duration::from_secs(30));
    }

    #[test]
    fn expands_set_variables() {
        // Use a variable name unlikely to collide across parallel tests.
        std::env::set_var("CHATRELAY_TEST_EXPAND_A", "hello");
        let out = expand_env_vars("value: ${CHATRELAY_TEST_EXPAND_A}").unwrap();
        assert_eq!(out, "value: hello");
    }

    #[test]
    fn expands_defaults_for_unset_variables() {
        let out = expand_env_vars("host: ${CHATRELAY_TEST_UNSET_B:-0.0.0.0}").unwrap();
        assert_eq!(out, "host: 0.0.0.0");

        let out = expand_env_vars("key: ${CHATRELAY_TEST_UNSET_B:-}").unwrap();
        assert_eq!(out, "key: ");
    }

    #[test]
    fn missing_required_variable_errors() {
        let result = expand_env_vars("token: ${CHATRELAY_TEST_UNSET_C}");
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(_))));
    }

    #[test]
    fn escaped_and_plain_dollars_pass_through() {
        assert_eq!(expand_env_vars("price: $100").unwrap(), "price: $100");
        assert_eq!(expand_env_vars("raw: $${NOT_A_VAR}").unwrap(), "raw: ${NOT_A_VAR}");
    }

    #[test]
    fn unclosed_reference_errors() {
        let result = expand_env_vars("broken: ${OOPS");
        assert!(matches!(result, Err(ConfigError::UnclosedVarReference)));
    }

    #[test]
    fn resolve_path_behavior() {
        let config_path = Path::new("/etc/chatrelay/chatrelay.yaml");
        assert_eq!(
            resolve_path(config_path, Path::new("state")),
            PathBuf::from("/etc/chatrelay/state")
        );
        assert_eq!(
            resolve_path(config_path, Path::new("/var/lib/state")),
            PathBuf::from("/var/lib/state")
        );
    }
}
