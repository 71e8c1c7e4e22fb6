//! Configuration data structures

use crate::models::schedule::CreateScheduleRequest;
use crate::models::workflow::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Logging level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub enum LogLevel {
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "info")]
    #[default]
    Info,
    #[serde(rename = "debug")]
    Debug,
    #[serde(rename = "trace")]
    Trace,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Logging verbosity level
    pub log_level: LogLevel,
    /// Server bind address
    pub server_host: String,
    /// Server port number
    pub server_port: u16,
    /// JSON checkpoint file; checkpoints stay in memory when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_path: Option<PathBuf>,
    /// Directory of YAML workflow definitions loaded at startup
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflows_dir: Option<PathBuf>,
    pub engine: EngineConfig,
    pub hil: HilConfig,
    pub scheduler: SchedulerConfig,
    /// Schedules registered at startup
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub schedules: Vec<CreateScheduleRequest>,
}

/// Execution engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Step invocations allowed per execution before it fails
    pub max_iterations: u32,
    /// Handler timeout when the step declares none
    pub step_timeout_seconds: u64,
    /// Extra attempts for a failed checkpoint write
    pub checkpoint_retries: u32,
    pub checkpoint_retry_delay_ms: u64,
    /// Applied to steps without their own retry policy
    pub retry_policy: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            step_timeout_seconds: 120,
            checkpoint_retries: 3,
            checkpoint_retry_delay_ms: 50,
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_seconds)
    }
}

/// Human-in-the-loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HilConfig {
    pub sweep_interval_seconds: u64,
    /// Lifetime of a request that declares no timeout
    pub default_ttl_minutes: u32,
}

impl Default for HilConfig {
    fn default() -> Self {
        Self {
            sweep_interval_seconds: 30,
            default_ttl_minutes: 24 * 60,
        }
    }
}

/// Scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Run the poll loop; webhook, event and manual triggers work either way
    pub enabled: bool,
    pub tick_seconds: u64,
    /// How often monitors poll a triggered execution
    pub monitor_interval_ms: u64,
    /// Upper bound for a caller waiting on a triggered run
    pub max_wait_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_seconds: 10,
            monitor_interval_ms: 500,
            max_wait_seconds: 30,
        }
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            server_host: "127.0.0.1".to_string(),
            server_port: 8080,
            store_path: None,
            workflows_dir: None,
            engine: EngineConfig::default(),
            hil: HilConfig::default(),
            scheduler: SchedulerConfig::default(),
            schedules: Vec::new(),
        }
    }
}

impl Configuration {
    /// Load configuration from file
    pub fn load_from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Configuration = toml::from_str(&content)?;
            Ok(config)
        } else {
            // Return default configuration if file doesn't exist
            Ok(Configuration::default())
        }
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the XDG config directory path
    pub fn default_config_path() -> Result<PathBuf, Box<dyn std::error::Error>> {
        let config_dir = dirs::config_dir().ok_or("Could not determine config directory")?;
        Ok(config_dir.join("flowpilot").join("config.toml"))
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server_port < 1024 {
            errors.push(
                "server_port must be at least 1024 (privileged ports not allowed)".to_string(),
            );
        }

        if self.engine.max_iterations == 0 {
            errors.push("engine.max_iterations must be at least 1".to_string());
        }

        if self.engine.step_timeout_seconds == 0 {
            errors.push("engine.step_timeout_seconds must be at least 1".to_string());
        }

        if !(1..=10).contains(&self.engine.retry_policy.max_attempts) {
            errors.push("engine.retry_policy.max_attempts must be between 1 and 10".to_string());
        }

        if self.hil.sweep_interval_seconds == 0 {
            errors.push("hil.sweep_interval_seconds must be at least 1".to_string());
        }

        if self.scheduler.tick_seconds == 0 {
            errors.push("scheduler.tick_seconds must be at least 1".to_string());
        }

        if self.scheduler.max_wait_seconds > 3600 {
            errors.push("scheduler.max_wait_seconds cannot exceed 3600 (1 hour)".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_configuration() {
        let config = Configuration::default();
        assert_eq!(config.server_port, 8080);
        assert_eq!(config.scheduler.tick_seconds, 10);
        assert_eq!(config.engine.max_iterations, 25);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_configuration_validation() {
        let mut config = Configuration {
            server_port: 80,
            ..Configuration::default()
        };
        config.engine.max_iterations = 0;
        config.scheduler.tick_seconds = 0;

        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("server_port")));
        assert!(errors.iter().any(|e| e.contains("max_iterations")));
        assert!(errors.iter().any(|e| e.contains("tick_seconds")));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Configuration = toml::from_str(
            r#"
server_port = 9090

[scheduler]
tick_seconds = 5
"#,
        )
        .unwrap();
        assert_eq!(config.server_port, 9090);
        assert_eq!(config.scheduler.tick_seconds, 5);
        assert_eq!(config.scheduler.max_wait_seconds, 30);
        assert_eq!(config.hil.default_ttl_minutes, 1440);
    }

    #[test]
    fn test_config_file_operations() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("test_config.toml");

        let config = Configuration {
            server_port: 9191,
            store_path: Some(temp_dir.path().join("checkpoints.json")),
            ..Configuration::default()
        };

        config.save_to_file(&config_path).unwrap();
        assert!(config_path.exists());

        let loaded_config = Configuration::load_from_file(&config_path).unwrap();
        assert_eq!(loaded_config.server_port, 9191);
        assert_eq!(loaded_config.store_path, config.store_path);
    }
}
