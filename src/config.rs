use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::Deserialize;

use crate::runner::RunnerSettings;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub simulator: SimulatorConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: Option<u32>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:pipelines.db?mode=rwc".to_string(),
            max_connections: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SimulatorConfig {
    /// Multiplier applied to simulated job durations; 0 runs jobs back to back.
    pub time_scale: Option<f64>,
    pub min_duration_seconds: Option<i64>,
    pub duration_span_seconds: Option<i64>,
    pub failure_threshold: Option<f64>,
    /// Pushes to branches that don't match are acknowledged but not run.
    pub branch_filter_regex: Option<String>,
}

impl SimulatorConfig {
    pub fn runner_settings(&self) -> RunnerSettings {
        let defaults = RunnerSettings::default();
        RunnerSettings {
            min_duration_seconds: self.min_duration_seconds.unwrap_or(defaults.min_duration_seconds),
            duration_span_seconds: self
                .duration_span_seconds
                .unwrap_or(defaults.duration_span_seconds)
                .max(1),
            failure_threshold: self.failure_threshold.unwrap_or(defaults.failure_threshold),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CacheConfig {
    pub ttl_seconds: Option<u64>,
    pub capacity: Option<u64>,
}

impl Config {
    /// Reads `config.{toml,yaml,json}` from the working directory if present, then
    /// `PIPELINE_SIM__SECTION__KEY` environment overrides.
    pub fn new() -> Result<Self, ConfigError> {
        Self::load("config", false)
    }

    pub fn load(path: &str, required: bool) -> Result<Self, ConfigError> {
        let s = ConfigLoader::builder()
            .add_source(File::with_name(path).required(required))
            .add_source(Environment::with_prefix("PIPELINE_SIM").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}
