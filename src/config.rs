//! TOML configuration for the sequencer runtime.
//!
//! Everything here can also be set from the CLI; the file just gives a
//! setup a durable home. Unknown keys are ignored and missing keys fall
//! back to defaults, so configs stay forward compatible.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Initial tempo. Ignored when following an external clock.
    #[serde(default = "default_bpm")]
    pub bpm: f64,
    #[serde(default)]
    pub clock: ClockConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub transport: TransportConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bpm: default_bpm(),
            clock: ClockConfig::default(),
            output: OutputConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockSource {
    #[default]
    Internal,
    External,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClockConfig {
    #[serde(default)]
    pub source: ClockSource,
    /// Input port hint when `source = "external"`. First port when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_port: Option<String>,
    /// Spin for the final sub-millisecond of each pulse wait. Disable to
    /// trade timing precision for CPU.
    #[serde(default = "default_true")]
    pub spin_wait: bool,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            source: ClockSource::Internal,
            input_port: None,
            spin_wait: true,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Output port hint (case-insensitive substring). First port when
    /// absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    /// Send MIDI clock ticks so downstream hardware can follow.
    #[serde(default)]
    pub clock_output: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Stop automatically once nothing remains scheduled.
    #[serde(default)]
    pub auto_stop: bool,
}

fn default_bpm() -> f64 {
    120.0
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = self.to_toml()?;
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_is_all_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.bpm, 120.0);
        assert_eq!(config.clock.source, ClockSource::Internal);
        assert!(config.clock.spin_wait);
        assert!(config.output.port.is_none());
        assert!(!config.output.clock_output);
        assert!(!config.transport.auto_stop);
    }

    #[test]
    fn parses_full_config() {
        let config: Config = toml::from_str(
            r#"
            bpm = 93.5

            [clock]
            source = "external"
            input_port = "Beatstep"
            spin_wait = false

            [output]
            port = "IAC"
            clock_output = true

            [transport]
            auto_stop = true
            "#,
        )
        .unwrap();

        assert_eq!(config.bpm, 93.5);
        assert_eq!(config.clock.source, ClockSource::External);
        assert_eq!(config.clock.input_port.as_deref(), Some("Beatstep"));
        assert!(!config.clock.spin_wait);
        assert_eq!(config.output.port.as_deref(), Some("IAC"));
        assert!(config.output.clock_output);
        assert!(config.transport.auto_stop);
    }

    #[test]
    fn round_trips_through_a_file() {
        let mut config = Config::default();
        config.bpm = 140.0;
        config.output.port = Some("Synth".to_string());
        config.clock.source = ClockSource::External;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sequencer.toml");
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.bpm, 140.0);
        assert_eq!(loaded.output.port.as_deref(), Some("Synth"));
        assert_eq!(loaded.clock.source, ClockSource::External);
    }

    #[test]
    fn missing_file_reports_the_path() {
        let err = Config::load(Path::new("/nonexistent/sequencer.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
        assert!(err.to_string().contains("/nonexistent/sequencer.toml"));
    }
}
