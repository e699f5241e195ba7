//! Orchestrator configuration, loaded from an optional JSON file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::notify::NotificationTarget;
use crate::workflow::MonitorDefaults;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrchestratorConfig {
    /// Delay between monitor ticks (seconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Tick budget per monitoring run.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Bound on a single Cluster Executor call (seconds).
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    /// Where persisted monitor state lives.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default = "default_topic")]
    pub notification_topic: String,

    #[serde(default = "default_source")]
    pub notification_source: String,
}

fn default_poll_interval() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    960
}

fn default_call_timeout() -> u64 {
    60
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".evalwatch/state")
}

fn default_topic() -> String {
    "evaluation-progress".into()
}

fn default_source() -> String {
    "evalwatch".into()
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            max_attempts: default_max_attempts(),
            call_timeout_secs: default_call_timeout(),
            state_dir: default_state_dir(),
            notification_topic: default_topic(),
            notification_source: default_source(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid("poll_interval_secs must be positive".into()));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be positive".into()));
        }
        if self.call_timeout_secs == 0 {
            return Err(ConfigError::Invalid("call_timeout_secs must be positive".into()));
        }
        if self.notification_topic.trim().is_empty() {
            return Err(ConfigError::Invalid("notification_topic must not be empty".into()));
        }
        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn monitor_defaults(&self) -> MonitorDefaults {
        MonitorDefaults {
            poll_interval_secs: self.poll_interval_secs,
            max_attempts: self.max_attempts,
            call_timeout: self.call_timeout(),
        }
    }

    /// Routing for one workflow's notifications.
    pub fn notification_target(&self, workflow_id: impl Into<String>) -> NotificationTarget {
        NotificationTarget {
            workflow_id: workflow_id.into(),
            topic: self.notification_topic.clone(),
            source: self.notification_source.clone(),
        }
    }
}
