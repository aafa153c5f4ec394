//! Agent configuration

use crate::error::ConfigError;
use crate::rpc::{Framing, TransportConfig, DEFAULT_MAX_FRAME_BYTES};
use crate::types::ExtensionConfiguration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

pub const ENV_AGENT_COMMAND: &str = "AGENTLINK_AGENT_COMMAND";
pub const ENV_SERVER_ENDPOINT: &str = "AGENTLINK_SERVER_ENDPOINT";
pub const ENV_ACCESS_TOKEN: &str = "AGENTLINK_ACCESS_TOKEN";

/// How to launch and talk to the worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    pub framing: Framing,
    pub max_frame_bytes: usize,
    pub timeouts: TimeoutConfig,
    pub restart: RestartPolicy,
    pub client: ClientSettings,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "cody-agent".to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            framing: Framing::default(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            timeouts: TimeoutConfig::default(),
            restart: RestartPolicy::default(),
            client: ClientSettings::default(),
        }
    }
}

impl AgentConfig {
    /// `<config dir>/agentlink/agent.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("agentlink").join("agent.json"))
    }

    /// Parse a configuration file. The result is validated by
    /// [`AgentConfig::resolve`], after environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let shown = path.display().to_string();
        debug!("Loading agent configuration from {}", shown);

        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: shown.clone(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse { path: shown, source })
    }

    /// Load from `path` if given, else from the default path if it exists,
    /// else defaults. Environment overrides are applied last.
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::resolve_with(path, |key| std::env::var(key).ok())
    }

    fn resolve_with(
        path: Option<&Path>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(path) => Self::load(path)?,
                None => {
                    info!("No agent configuration file found, using defaults");
                    Self::default()
                }
            },
        };
        config.apply_overrides_from(lookup);
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(command) = lookup(ENV_AGENT_COMMAND).filter(|v| !v.is_empty()) {
            debug!("Agent command overridden by {}", ENV_AGENT_COMMAND);
            self.command = command;
        }

        let endpoint = lookup(ENV_SERVER_ENDPOINT).filter(|v| !v.is_empty());
        let token = lookup(ENV_ACCESS_TOKEN).filter(|v| !v.is_empty());
        if endpoint.is_none() && token.is_none() {
            return;
        }

        let extension = self
            .client
            .extension_configuration
            .get_or_insert_with(ExtensionConfiguration::default);
        if let Some(endpoint) = endpoint {
            extension.server_endpoint = endpoint;
        }
        if let Some(token) = token {
            extension.access_token = token;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command.trim().is_empty() {
            return Err(ConfigError::Invalid("command must not be empty".to_string()));
        }
        if self.max_frame_bytes == 0 {
            return Err(ConfigError::Invalid("maxFrameBytes must be positive".to_string()));
        }
        self.timeouts.validate()?;
        self.restart.validate()?;
        Ok(())
    }

    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            framing: self.framing,
            max_frame_bytes: self.max_frame_bytes,
            ..TransportConfig::default()
        }
    }
}

/// Deadlines, in milliseconds on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeoutConfig {
    pub handshake_ms: u64,
    pub shutdown_ms: u64,
    /// Short interactive requests (autocomplete, chat/new)
    pub interactive_ms: u64,
    /// Long-running generation requests (chat replies, commands)
    pub generation_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            handshake_ms: 20_000,
            shutdown_ms: 5_000,
            interactive_ms: 5_000,
            generation_ms: 120_000,
        }
    }
}

impl TimeoutConfig {
    pub fn handshake(&self) -> Duration {
        Duration::from_millis(self.handshake_ms)
    }

    pub fn shutdown(&self) -> Duration {
        Duration::from_millis(self.shutdown_ms)
    }

    pub fn interactive(&self) -> Duration {
        Duration::from_millis(self.interactive_ms)
    }

    pub fn generation(&self) -> Duration {
        Duration::from_millis(self.generation_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let all = [
            ("handshakeMs", self.handshake_ms),
            ("shutdownMs", self.shutdown_ms),
            ("interactiveMs", self.interactive_ms),
            ("generationMs", self.generation_ms),
        ];
        if let Some((name, _)) = all.iter().find(|(_, ms)| *ms == 0) {
            return Err(ConfigError::Invalid(format!("timeouts.{} must be positive", name)));
        }
        Ok(())
    }
}

/// Crash-restart backoff
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RestartPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Crashes tolerated inside `window_ms`; one more is fatal
    pub max_restarts: usize,
    pub window_ms: u64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            max_restarts: 5,
            window_ms: 5 * 60 * 1000,
        }
    }
}

impl RestartPolicy {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "restart.multiplier must be >= 1, got {}",
                self.multiplier
            )));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(ConfigError::Invalid(
                "restart.maxDelayMs must not be below restart.initialDelayMs".to_string(),
            ));
        }
        if self.window_ms == 0 {
            return Err(ConfigError::Invalid("restart.windowMs must be positive".to_string()));
        }
        Ok(())
    }
}

/// What the client reports about itself during the handshake
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_root_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extension_configuration: Option<ExtensionConfiguration>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_load_partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "command": "/opt/agent/bin/agent",
                "args": ["--stdio"],
                "framing": "newline",
                "timeouts": {{ "interactiveMs": 1500 }},
                "client": {{ "workspaceRootUri": "file:///work" }}
            }}"#
        )
        .unwrap();

        let config = AgentConfig::load(file.path()).unwrap();
        assert_eq!(config.command, "/opt/agent/bin/agent");
        assert_eq!(config.args, vec!["--stdio".to_string()]);
        assert_eq!(config.framing, Framing::Newline);
        assert_eq!(config.timeouts.interactive(), Duration::from_millis(1500));
        assert_eq!(config.timeouts.shutdown(), Duration::from_secs(5));
        assert_eq!(config.restart.max_restarts, 5);
        assert_eq!(config.client.workspace_root_uri.as_deref(), Some("file:///work"));
    }

    #[test]
    fn test_load_reports_parse_and_read_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(
            AgentConfig::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));

        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            AgentConfig::load(dir.path().join("missing.json")),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_validation() {
        let mut config = AgentConfig::default();
        assert_ok!(config.validate());

        config.command = "  ".to_string();
        assert_err!(config.validate());

        let mut config = AgentConfig::default();
        config.restart.multiplier = 0.5;
        assert_err!(config.validate());

        let mut config = AgentConfig::default();
        config.restart.max_delay_ms = 10;
        assert_err!(config.validate());

        let mut config = AgentConfig::default();
        config.timeouts.handshake_ms = 0;
        assert_err!(config.validate());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = AgentConfig::default();
        config.apply_overrides_from(|key| match key {
            ENV_AGENT_COMMAND => Some("/usr/local/bin/agent".to_string()),
            ENV_ACCESS_TOKEN => Some("sgp_secret".to_string()),
            _ => None,
        });

        assert_eq!(config.command, "/usr/local/bin/agent");
        let extension = config.client.extension_configuration.unwrap();
        assert_eq!(extension.access_token, "sgp_secret");
        assert!(!format!("{:?}", extension).contains("sgp_secret"));
    }

    #[test]
    fn test_env_command_completes_file_without_one() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "command": "", "args": ["--stdio"] }}"#).unwrap();

        let config = AgentConfig::resolve_with(Some(file.path()), |key| {
            (key == ENV_AGENT_COMMAND).then(|| "/opt/agent".to_string())
        })
        .unwrap();
        assert_eq!(config.command, "/opt/agent");
        assert_eq!(config.args, vec!["--stdio".to_string()]);

        assert!(matches!(
            AgentConfig::resolve_with(Some(file.path()), |_| None),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_no_env_leaves_extension_unset() {
        let mut config = AgentConfig::default();
        config.apply_overrides_from(|_| None);
        assert!(config.client.extension_configuration.is_none());
    }
}
