use std::time::Duration;

use serde::Deserialize;

use crate::domain::flow::ValidationLimits;

/// Application configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
        }
    }
}

/// Bounds and retry policy handed to the scheduler at construction
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Deepest AND/OR nesting accepted at validation time
    pub max_condition_depth: usize,

    /// Deepest subprocess call chain
    pub max_subprocess_depth: usize,

    /// Upper bound for any loop node's `max_iterations`
    pub max_loop_iterations: u32,

    /// Retries the timeout sweep may spend on one execution
    pub max_retries: u32,

    /// Running executions idle for longer than this are swept
    pub sweep_timeout_secs: u64,

    pub sweep_page_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_condition_depth: 3,
            max_subprocess_depth: 3,
            max_loop_iterations: 1000,
            max_retries: 3,
            sweep_timeout_secs: 300,
            sweep_page_size: 50,
        }
    }
}

impl EngineConfig {
    pub fn sweep_timeout(&self) -> Duration {
        Duration::from_secs(self.sweep_timeout_secs)
    }

    pub fn validation_limits(&self) -> ValidationLimits {
        ValidationLimits {
            max_condition_depth: self.max_condition_depth,
            max_loop_iterations: self.max_loop_iterations,
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}
