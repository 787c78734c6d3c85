//! Bridge configuration (TOML file plus `TETHER_*` environment overrides)

use crate::error::{BridgeError, Result};
use crate::foreign::MethodKey;
use crate::logging::{parse_level, LogConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub table: TableConfig,

    #[serde(default)]
    pub audit: AuditConfig,

    #[serde(default)]
    pub frames: FrameConfig,

    #[serde(default)]
    pub logging: LoggingSection,

    /// Method binds resolved at init when the bridge is started through the
    /// C entry point; operation indices follow this order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<MethodKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableConfig {
    /// Slots allocated eagerly at init
    #[serde(default = "default_prewarm")]
    pub prewarm: usize,
}

/// What scope teardown does about handles that were adopted but never released
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default)]
    pub mode: AuditMode,

    /// Release outstanding handles at teardown instead of leaking them
    #[serde(default = "default_true")]
    pub reclaim_leaks: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditMode {
    /// No leak reporting
    Off,
    /// Log leaks at `warn`
    #[default]
    Warn,
    /// Fail teardown with `FrameLeak`
    Strict,
}

impl AuditMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "off" | "none" => Some(Self::Off),
            "warn" => Some(Self::Warn),
            "strict" => Some(Self::Strict),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameConfig {
    /// Frame buffers cached per thread
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,

    #[serde(default)]
    pub file: Option<String>,

    #[serde(default)]
    pub spans: bool,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            prewarm: default_prewarm(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            mode: AuditMode::Warn,
            reclaim_leaks: true,
        }
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
            file: None,
            spans: false,
        }
    }
}

fn default_true() -> bool { true }
fn default_prewarm() -> usize { 64 }
fn default_pool_size() -> usize { 32 }
fn default_level() -> String { "info".to_string() }

impl BridgeConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `TETHER_AUDIT` and `TETHER_TABLE_PREWARM` overrides
    pub fn apply_env(mut self) -> Result<Self> {
        if let Ok(mode) = std::env::var("TETHER_AUDIT") {
            self.audit.mode = AuditMode::parse(&mode)
                .ok_or_else(|| BridgeError::Config(format!("TETHER_AUDIT: unknown mode {:?}", mode)))?;
        }

        if let Ok(prewarm) = std::env::var("TETHER_TABLE_PREWARM") {
            self.table.prewarm = prewarm.trim().parse().map_err(|e| {
                BridgeError::Config(format!("TETHER_TABLE_PREWARM: {}", e))
            })?;
        }

        Ok(self)
    }

    /// Logging settings as a [`LogConfig`], `TETHER_LOG_*` still taking precedence
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: parse_level(&self.logging.level),
            file_output: self.logging.file.is_some(),
            log_path: self.logging.file.clone(),
            json_format: self.logging.json,
            show_spans: self.logging.spans,
            ..LogConfig::default()
        }
        .with_env()
    }

    /// Generate default configuration file content
    pub fn generate_default() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# failed to generate config"))
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| BridgeError::Config(format!("failed to serialize config: {}", e)))?;
        fs::write(path, content)?;
        Ok(())
    }
}
