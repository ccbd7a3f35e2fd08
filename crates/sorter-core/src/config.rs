//! Configuration management for the sorter
//!
//! Handles loading and validation of sorter.toml configuration files.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, RegistryError};
use crate::intake::IntakeSettings;
use crate::logging::{LogConfig, LogLevel};
use crate::registry::{CommandDefinition, CommandRegistry};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LogConfig,

    /// Intake settings
    #[serde(default)]
    pub intake: IntakeConfig,

    /// Remote session settings
    #[serde(default)]
    pub sessions: SessionConfig,

    /// Command table; the built-in registry is used when empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<CommandDefinition>,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Machine identifier, used as the actor of implicit session rollovers
    #[serde(default = "default_machine_id")]
    pub machine_id: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            machine_id: default_machine_id(),
        }
    }
}

fn default_machine_id() -> String {
    "MACHINE001".to_string()
}

/// Intake configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeConfig {
    /// Seconds a call-center command masks a panel selection of the same class
    #[serde(default = "default_panel_echo_window_secs")]
    pub panel_echo_window_secs: u64,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            panel_echo_window_secs: default_panel_echo_window_secs(),
        }
    }
}

fn default_panel_echo_window_secs() -> u64 {
    60
}

/// Remote session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Expire sessions on a timer in addition to lazily at intake
    #[serde(default)]
    pub active_expiry_sweep: bool,

    /// Sweep interval in milliseconds
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            active_expiry_sweep: false,
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

fn default_sweep_interval_ms() -> u64 {
    1000
}

const MAX_PANEL_ECHO_WINDOW_SECS: u64 = 3600;

impl Config {
    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(display));
        }
        let text = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::ReadFailed(display, err.to_string()))?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!(path = %path.display(), "config loaded");
        Ok(config)
    }

    /// Parse and validate configuration text
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(text).map_err(|err| ConfigError::ParseFailed(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.general.machine_id.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "general.machine_id must not be empty".to_string(),
            ));
        }
        if self.intake.panel_echo_window_secs > MAX_PANEL_ECHO_WINDOW_SECS {
            return Err(ConfigError::ValidationError(format!(
                "intake.panel_echo_window_secs must be at most {MAX_PANEL_ECHO_WINDOW_SECS}"
            )));
        }
        if self.sessions.sweep_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "sessions.sweep_interval_ms must be positive".to_string(),
            ));
        }
        LogLevel::from_str(&self.logging.level).map_err(ConfigError::ValidationError)?;
        self.registry()
            .map_err(|err| ConfigError::ValidationError(format!("commands: {err}")))?;
        Ok(())
    }

    /// Command registry described by this config
    pub fn registry(&self) -> Result<CommandRegistry, RegistryError> {
        if self.commands.is_empty() {
            Ok(CommandRegistry::builtin())
        } else {
            CommandRegistry::new(self.commands.clone())
        }
    }

    #[must_use]
    pub fn intake_settings(&self) -> IntakeSettings {
        let secs = i64::try_from(self.intake.panel_echo_window_secs).unwrap_or(i64::MAX);
        IntakeSettings {
            machine_id: self.general.machine_id.clone(),
            panel_echo_window: TimeDelta::try_seconds(secs).unwrap_or(TimeDelta::MAX),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => f.write_str("pretty"),
            Self::Json => f.write_str("json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected one of: pretty, json")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{OperatingMode, PanelClass};

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.general.machine_id, "MACHINE001");
        assert_eq!(config.intake.panel_echo_window_secs, 60);
        assert!(!config.sessions.active_expiry_sweep);
        assert_eq!(config.logging.format, LogFormat::Pretty);
        config.validate().unwrap();
    }

    #[test]
    fn empty_toml_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.sessions.sweep_interval_ms, 1000);
        assert!(config.commands.is_empty());
        assert!(config.registry().unwrap().contains("start_aa"));
    }

    #[test]
    fn parses_sections_and_command_table() {
        let config = Config::from_toml_str(
            r#"
[general]
machine_id = "SORTER-7"

[logging]
level = "debug"
format = "json"

[intake]
panel_echo_window_secs = 30

[sessions]
active_expiry_sweep = true
sweep_interval_ms = 250

[[commands]]
token = "self_stop"
actuator_command = "ALL_STOP"
panel_class = "off"
mode = "operational"
timeout_secs = 100

[[commands]]
token = "start_color"
actuator_command = "ALL_START"
panel_class = "color"
mode = "operational"
"#,
        )
        .unwrap();

        assert_eq!(config.general.machine_id, "SORTER-7");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(config.sessions.active_expiry_sweep);
        let registry = config.registry().unwrap();
        assert!(registry.contains("start_color"));
        assert!(!registry.contains("start_aa"));
        assert!(registry.contains("panel_aa"));
        let def = registry.lookup("start_color").unwrap();
        assert_eq!(def.panel_class, PanelClass::Color);
        assert_eq!(def.mode, OperatingMode::Operational);

        let settings = config.intake_settings();
        assert_eq!(settings.machine_id, "SORTER-7");
        assert_eq!(settings.panel_echo_window, TimeDelta::seconds(30));
    }

    #[test]
    fn command_table_without_self_stop_is_invalid() {
        let err = Config::from_toml_str(
            r#"
[[commands]]
token = "stop"
actuator_command = "ALL_STOP"
panel_class = "off"
mode = "operational"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(msg) if msg.contains("self_stop")));
    }

    #[test]
    fn panel_row_remapped_to_another_class_is_invalid() {
        let err = Config::from_toml_str(
            r#"
[[commands]]
token = "self_stop"
actuator_command = "ALL_STOP"
panel_class = "off"
mode = "operational"

[[commands]]
token = "panel_off"
actuator_command = "ALL_START"
panel_class = "aa"
mode = "operational"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(msg) if msg.contains("panel_off")));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            Config::from_toml_str("[general]\nmachine_id = \"  \"\n").unwrap_err(),
            ConfigError::ValidationError(_)
        ));
        assert!(matches!(
            Config::from_toml_str("[sessions]\nsweep_interval_ms = 0\n").unwrap_err(),
            ConfigError::ValidationError(_)
        ));
        assert!(matches!(
            Config::from_toml_str("[intake]\npanel_echo_window_secs = 86400\n").unwrap_err(),
            ConfigError::ValidationError(_)
        ));
        assert!(matches!(
            Config::from_toml_str("[logging]\nlevel = \"loud\"\n").unwrap_err(),
            ConfigError::ValidationError(_)
        ));
    }

    #[test]
    fn syntax_error_is_parse_failure() {
        assert!(matches!(
            Config::from_toml_str("[general\n").unwrap_err(),
            ConfigError::ParseFailed(_)
        ));
    }

    #[test]
    fn load_from_reads_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("sorter.toml");
        std::fs::write(&path, "[general]\nmachine_id = \"FROM-FILE\"\n").unwrap();
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.general.machine_id, "FROM-FILE");
    }

    #[test]
    fn load_from_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = Config::load_from(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn log_format_from_str() {
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
        assert_eq!(LogFormat::Json.to_string(), "json");
    }
}
