// 🛠️ Configuration - YAML file with a default for every key
//
//   database:  { path: subledger.db }
//   rules:     { path: rules.json }          # optional; otherwise the ledger_rules table
//   fields:    { valuation: valuationDt, account: account, entity: eagleEntityId }
//   engine:    { overlap_policy: passthrough, workers: 1 }
//   output:    { path: sub_ledger_results.json, format: json }
//   logging:   { level: info }

use crate::error::ConfigError;
use crate::plan::{BaseFields, OverlapPolicy, PlanOptions};
use crate::processor::RunOptions;
use crate::sink::OutputFormat;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("subledger.db")
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

/// Rule file (JSON or CSV); when absent rules come from the database
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RulesConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub overlap_policy: OverlapPolicy,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_workers() -> usize {
    1
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            overlap_policy: OverlapPolicy::default(),
            workers: default_workers(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_path")]
    pub path: PathBuf,
    #[serde(default)]
    pub format: OutputFormat,
}

fn default_output_path() -> PathBuf {
    PathBuf::from("sub_ledger_results.json")
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: default_output_path(),
            format: OutputFormat::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub rules: RulesConfig,
    /// Base field names shared by every source dataset
    #[serde(default)]
    pub fields: BaseFields,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source,
        })?;

        let config = Self::from_yaml(&content)?;
        Ok(config)
    }

    /// Parse and validate YAML text
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "engine.workers".to_string(),
                reason: "Workers must be at least 1".to_string(),
            });
        }

        for (name, value) in [
            ("fields.valuation", &self.fields.valuation),
            ("fields.account", &self.fields.account),
            ("fields.entity", &self.fields.entity),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: name.to_string(),
                    reason: "Field name cannot be empty".to_string(),
                });
            }
        }

        if self.fields.valuation == self.fields.account {
            return Err(ConfigError::InvalidValue {
                field: "fields.account".to_string(),
                reason: "Group key fields must differ".to_string(),
            });
        }

        if self.logging.level.parse::<log::LevelFilter>().is_err() {
            return Err(ConfigError::InvalidValue {
                field: "logging.level".to_string(),
                reason: format!("Unknown log level '{}'", self.logging.level),
            });
        }

        Ok(())
    }

    pub fn plan_options(&self) -> PlanOptions {
        PlanOptions {
            base_fields: self.fields.clone(),
            overlap: self.engine.overlap_policy,
        }
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            plan: self.plan_options(),
            workers: self.engine.workers,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
