//! Configuration management.
//!
//! A single TOML file (default `config.toml`) layered with environment
//! variable overrides for every secret-bearing field. Validation runs at
//! startup and missing tokens are fatal there, never mid-task.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::convert::ConversionConfig;
use crate::dialogue::DialogueSettings;
use crate::error::{AgentError, Result};
use crate::llm::LlmConfig;
use crate::log_debug;
use crate::mcp::McpConfig;
use crate::task::{LabelNames, Platform};

pub const DEFAULT_CONFIG_FILENAME: &str = "config.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubSettings {
    pub owner: String,
    pub repo: String,
    #[serde(default)]
    pub labels: LabelNames,
    #[serde(default)]
    pub bot_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitLabSettings {
    pub project_id: u64,
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub labels: LabelNames,
    #[serde(default)]
    pub bot_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    #[default]
    Memory,
    Broker,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    #[serde(default)]
    pub backend: QueueBackend,
    #[serde(default = "default_broker_path")]
    pub broker_path: PathBuf,
}

fn default_broker_path() -> PathBuf {
    PathBuf::from("contexts/broker.db")
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            backend: QueueBackend::Memory,
            broker_path: default_broker_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSettings {
    #[serde(default = "default_webhook_host")]
    pub host: String,
    #[serde(default = "default_webhook_port")]
    pub port: u16,
    #[serde(default)]
    pub github_secret: Option<String>,
    #[serde(default)]
    pub gitlab_token: Option<String>,
    #[serde(default)]
    pub gitlab_system_hook_token: Option<String>,
}

fn default_webhook_host() -> String {
    // Binding all interfaces is required inside containers; production
    // deployments sit behind a reverse proxy.
    "0.0.0.0".to_string()
}

fn default_webhook_port() -> u16 {
    8000
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            host: default_webhook_host(),
            port: default_webhook_port(),
            github_secret: None,
            gitlab_token: None,
            gitlab_system_hook_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerSettings {
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,
    #[serde(default)]
    pub delay_first_run: bool,
}

fn default_interval_minutes() -> u64 {
    5
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            interval_minutes: default_interval_minutes(),
            delay_first_run: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerSettings {
    #[serde(default = "default_queue_timeout")]
    pub queue_timeout_seconds: u64,
    #[serde(default)]
    pub min_interval_seconds: u64,
}

fn default_queue_timeout() -> u64 {
    30
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            queue_timeout_seconds: default_queue_timeout(),
            min_interval_seconds: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthcheckSettings {
    #[serde(default = "default_healthcheck_dir")]
    pub dir: PathBuf,
}

fn default_healthcheck_dir() -> PathBuf {
    PathBuf::from("healthcheck")
}

impl Default for HealthcheckSettings {
    fn default() -> Self {
        Self {
            dir: default_healthcheck_dir(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContinuousSettings {
    #[serde(default)]
    pub producer: ProducerSettings,
    #[serde(default)]
    pub consumer: ConsumerSettings,
    #[serde(default)]
    pub healthcheck: HealthcheckSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfigApiSettings {
    /// Base URL the workers resolve per-user configuration from.
    pub url: String,
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
    #[serde(default = "default_users_db")]
    pub users_db: PathBuf,
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8001
}

fn default_users_db() -> PathBuf {
    PathBuf::from("contexts/users.db")
}

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub github: Option<GitHubSettings>,
    #[serde(default)]
    pub gitlab: Option<GitLabSettings>,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub mcp: Option<McpConfig>,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub webhook: WebhookSettings,
    #[serde(default)]
    pub continuous: ContinuousSettings,
    #[serde(default)]
    pub dialogue: DialogueSettings,
    #[serde(default)]
    pub conversion: ConversionConfig,
    #[serde(default)]
    pub user_config_api: Option<UserConfigApiSettings>,
    /// Directory for checkpoints, the tasks database, and the broker file.
    #[serde(default = "default_context_dir")]
    pub context_dir: PathBuf,
    /// Worker pool size.
    #[serde(default = "default_max_llm_process_num")]
    pub max_llm_process_num: usize,
    /// Override for the embedded system prompt.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Override for the embedded first-user-prompt template.
    #[serde(default)]
    pub first_user_prompt: Option<String>,
}

fn default_context_dir() -> PathBuf {
    PathBuf::from("contexts")
}

fn default_max_llm_process_num() -> usize {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            github: None,
            gitlab: None,
            llm: LlmConfig::default(),
            mcp: None,
            queue: QueueSettings::default(),
            webhook: WebhookSettings::default(),
            continuous: ContinuousSettings::default(),
            dialogue: DialogueSettings::default(),
            conversion: ConversionConfig::default(),
            user_config_api: None,
            context_dir: default_context_dir(),
            max_llm_process_num: default_max_llm_process_num(),
            system_prompt: None,
            first_user_prompt: None,
        }
    }
}

impl Config {
    /// Load configuration from a file (or defaults when absent) and apply
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILENAME));

        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            toml::from_str(&content).map_err(|e| {
                AgentError::Config(format!("invalid {}: {e}", path.display()))
            })?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        log_debug!("configuration loaded from {}", path.display());
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(name) = std::env::var("GITHUB_BOT_NAME") {
            if let Some(github) = &mut self.github {
                github.bot_name = Some(name);
            }
        }
        if let Ok(name) = std::env::var("GITLAB_BOT_NAME") {
            if let Some(gitlab) = &mut self.gitlab {
                gitlab.bot_name = Some(name);
            }
        }
        if let Ok(url) = std::env::var("GITLAB_API_URL") {
            if let Some(gitlab) = &mut self.gitlab {
                gitlab.api_url = Some(url);
            }
        }
        if let Ok(secret) = std::env::var("GITHUB_WEBHOOK_SECRET") {
            self.webhook.github_secret = Some(secret);
        }
        if let Ok(token) = std::env::var("GITLAB_WEBHOOK_TOKEN") {
            self.webhook.gitlab_token = Some(token);
        }
        if let Ok(token) = std::env::var("GITLAB_SYSTEM_HOOK_TOKEN") {
            self.webhook.gitlab_system_hook_token = Some(token);
        }
        self.conversion.apply_env_override();
    }

    /// Startup validation: at least one forge must be configured, and the
    /// worker pool must not be empty.
    pub fn validate(&self) -> Result<()> {
        if self.github.is_none() && self.gitlab.is_none() {
            return Err(AgentError::Config(
                "no forge configured: add a [github] or [gitlab] section".to_string(),
            ));
        }
        if self.max_llm_process_num == 0 {
            return Err(AgentError::Config(
                "max_llm_process_num must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn labels_for(&self, platform: Platform) -> LabelNames {
        match platform {
            Platform::GitHub => self
                .github
                .as_ref()
                .map(|g| g.labels.clone())
                .unwrap_or_default(),
            Platform::GitLab => self
                .gitlab
                .as_ref()
                .map(|g| g.labels.clone())
                .unwrap_or_default(),
        }
    }

    pub fn bot_name_for(&self, platform: Platform) -> Option<String> {
        match platform {
            Platform::GitHub => self.github.as_ref().and_then(|g| g.bot_name.clone()),
            Platform::GitLab => self.gitlab.as_ref().and_then(|g| g.bot_name.clone()),
        }
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.context_dir.join("checkpoints")
    }

    pub fn tasks_db_path(&self) -> PathBuf {
        self.context_dir.join("tasks.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.max_llm_process_num, 1);
        assert_eq!(config.queue.backend, QueueBackend::Memory);
        assert_eq!(config.continuous.producer.interval_minutes, 5);
        assert_eq!(config.continuous.consumer.queue_timeout_seconds, 30);
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_round_trip_with_forge_section() {
        let toml_src = r#"
            max_llm_process_num = 3

            [github]
            owner = "acme"
            repo = "widgets"

            [queue]
            backend = "broker"
        "#;
        let config: Config = toml::from_str(toml_src).expect("parse");
        assert!(config.validate().is_ok());
        assert_eq!(config.max_llm_process_num, 3);
        assert_eq!(config.queue.backend, QueueBackend::Broker);
        let github = config.github.expect("github section");
        assert_eq!(github.owner, "acme");
        assert_eq!(github.labels.bot, "coding agent");
    }
}
