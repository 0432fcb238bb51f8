use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::models::DeliveryMethod;
use crate::queue::QueueLimits;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    #[default]
    Memory,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub name: String,
    pub storage: StorageKind,
    pub data_dir: Option<PathBuf>,
    pub max_size: usize,
    /// Seconds; unset means messages never expire
    pub default_ttl: Option<u64>,
    pub cleanup_interval: u64,
    pub history_retention: u64,
    pub max_history: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "agent_messages".to_string(),
            storage: StorageKind::Memory,
            data_dir: None,
            max_size: 1000,
            default_ttl: None,
            cleanup_interval: 300,
            history_retention: 24 * 60 * 60,
            max_history: 10_000,
        }
    }
}

impl QueueConfig {
    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl.map(Duration::from_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval.max(1))
    }

    pub fn limits(&self) -> QueueLimits {
        QueueLimits {
            max_size: self.max_size,
            history_retention: Duration::from_secs(self.history_retention),
            max_history: self.max_history,
        }
    }

    /// Explicit `data_dir`, else `<data_dir>/missive`.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("missive")
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Milliseconds
    pub poll_interval: u64,
    pub inbox_capacity: usize,
    /// Seconds
    pub delivery_timeout: u64,
    pub shutdown_timeout: u64,
    pub health_interval: u64,
    /// Agents without a heartbeat or delivery for longer go offline.
    /// Unset disables the sweep.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_timeout: Option<u64>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            poll_interval: 250,
            inbox_capacity: 8,
            delivery_timeout: 30,
            shutdown_timeout: 10,
            health_interval: 30,
            agent_timeout: None,
        }
    }
}

impl DispatchConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval.max(1))
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery_timeout)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval.max(1))
    }

    pub fn agent_timeout(&self) -> Option<Duration> {
        self.agent_timeout.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UrgentConfig {
    pub trigger_count: usize,
    /// Milliseconds
    pub trigger_window: u64,
    /// Seconds
    pub mode_duration: u64,
}

impl Default for UrgentConfig {
    fn default() -> Self {
        Self {
            trigger_count: 2,
            trigger_window: 1500,
            mode_duration: 30,
        }
    }
}

impl UrgentConfig {
    pub fn trigger_window(&self) -> Duration {
        Duration::from_millis(self.trigger_window)
    }

    pub fn mode_duration(&self) -> Duration {
        Duration::from_secs(self.mode_duration)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InjectionConfig {
    pub tmux_binary: String,
    pub text_roles: Vec<String>,
    pub surface_hints: Vec<String>,
    pub submit_hints: Vec<String>,
    pub commit_key: String,
}

impl Default for InjectionConfig {
    fn default() -> Self {
        let strings = |items: &[&str]| -> Vec<String> { items.iter().map(|s| s.to_string()).collect() };
        Self {
            tmux_binary: "tmux".to_string(),
            text_roles: strings(&["textarea", "textbox", "edit", "document", "terminal", "input"]),
            surface_hints: strings(&["message", "prompt", "chat", "ask", "reply", "type"]),
            submit_hints: strings(&["send", "submit"]),
            commit_key: "Enter".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteDebugConfig {
    pub endpoint: String,
    /// Seconds
    pub request_timeout: u64,
}

impl Default for RemoteDebugConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:9222".to_string(),
            request_timeout: 5,
        }
    }
}

impl RemoteDebugConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub dir: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub delivery_methods: Vec<DeliveryMethod>,
    pub target: String,
}

impl AgentConfig {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub queue: QueueConfig,
    pub dispatch: DispatchConfig,
    pub urgent: UrgentConfig,
    pub injection: InjectionConfig,
    pub remote_debug: RemoteDebugConfig,
    pub log: LogConfig,
    pub agents: Vec<AgentConfig>,
}

impl Config {
    pub fn load(config_path: Option<PathBuf>) -> Result<Self> {
        let path = config_path.unwrap_or_else(Self::default_config_path);

        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            let config: Config = serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    pub fn default_config_path() -> PathBuf {
        if let Some(config_path) = std::env::var_os("MISSIVE_CONFIG") {
            PathBuf::from(config_path)
        } else {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("missive")
                .join("config.yaml")
        }
    }

    pub fn get_agent(&self, id: &str) -> Option<&AgentConfig> {
        self.agents.iter().find(|a| a.id == id)
    }

    pub fn with_storage(mut self, storage: StorageKind) -> Self {
        self.queue.storage = storage;
        self
    }

    pub fn with_data_dir(mut self, data_dir: PathBuf) -> Self {
        self.queue.data_dir = Some(data_dir);
        self
    }
}
