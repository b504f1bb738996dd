//! Configuration loading and parsing

use anyhow::{Context, Result};
use can_pipeline::{BusConfig, PipelineConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Application configuration (loaded from config.toml)
///
/// Every section is optional; command-line flags take precedence.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    /// DBC file loaded at startup
    pub dbc: Option<PathBuf>,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OutputConfig {
    /// Print JSON lines instead of text
    #[serde(default)]
    pub json: bool,
}

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    config
        .bus
        .validate()
        .with_context(|| format!("Invalid [bus] section in {:?}", path))?;
    config
        .pipeline
        .validate()
        .with_context(|| format!("Invalid [pipeline] section in {:?}", path))?;

    Ok(config)
}

/// Load `path` if given, otherwise fall back to defaults
pub fn load_or_default(path: Option<&Path>) -> Result<AppConfig> {
    match path {
        Some(path) => {
            log::info!("Loading configuration from: {:?}", path);
            load_config(path)
        }
        None => Ok(AppConfig::default()),
    }
}

impl AppConfig {
    /// DBC path from the command line, else from the file
    pub fn dbc_path(&self, cli: Option<&Path>) -> Option<PathBuf> {
        cli.map(Path::to_path_buf).or_else(|| self.dbc.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_deserialization() {
        let toml_content = r#"
            dbc = "vehicle.dbc"

            [bus]
            channel = "vcan1"
            bitrate = 250000

            [pipeline]
            history_capacity = 500
        "#;

        let config: AppConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.dbc, Some(PathBuf::from("vehicle.dbc")));
        assert_eq!(config.bus.channel, "vcan1");
        assert_eq!(config.bus.interface, "virtual");
        assert_eq!(config.bus.bitrate, 250_000);
        assert_eq!(config.pipeline.history_capacity, 500);
        assert_eq!(config.pipeline.receive_timeout_ms, 100);
        assert!(!config.output.json);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert!(config.dbc.is_none());
        assert_eq!(config.bus, BusConfig::default());
        assert_eq!(config.pipeline, PipelineConfig::default());
    }

    #[test]
    fn test_invalid_section_is_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[pipeline]\nhistory_capacity = 0").unwrap();
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn test_cli_dbc_wins() {
        let config = AppConfig {
            dbc: Some(PathBuf::from("from_file.dbc")),
            ..AppConfig::default()
        };
        assert_eq!(
            config.dbc_path(Some(Path::new("cli.dbc"))),
            Some(PathBuf::from("cli.dbc"))
        );
        assert_eq!(config.dbc_path(None), Some(PathBuf::from("from_file.dbc")));
    }
}
