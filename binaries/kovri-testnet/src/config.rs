//! CLI configuration.
//!
//! The configuration file has a `[testnet]` table holding the testnet
//! options and a `[logging]` table. Command-line flags are merged on top.

use anyhow::Context;
use kovri_testnet::TestnetConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Complete CLI configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Testnet options.
    pub testnet: TestnetConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: String,

    /// Log format (pretty, json, compact).
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl CliConfig {
    /// Loads configuration from a TOML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Merges command-line arguments into the configuration.
    pub fn merge_cli_args(&mut self, args: &super::CliArgs) -> anyhow::Result<()> {
        if let Some(ref level) = args.log_level {
            self.logging.level = level.clone();
        }

        if let Some(ref network) = args.network {
            self.testnet.network = network.clone();
        }

        if let Some(ref workspace) = args.workspace {
            self.testnet.workspace = workspace.clone();
        }

        self.testnet
            .apply_fields(args.set.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .context("Invalid --set value")?;

        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!("Invalid log level: {}", self.logging.level);
        }

        let valid_formats = ["pretty", "json", "compact"];
        if !valid_formats.contains(&self.logging.format.to_lowercase().as_str()) {
            anyhow::bail!("Invalid log format: {}", self.logging.format);
        }

        self.testnet.validate()?;
        Ok(())
    }
}

/// Parses a `key=value` pair.
pub fn parse_key_value(input: &str) -> Result<(String, String), String> {
    let (key, value) = input
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{input}`"))?;
    if key.trim().is_empty() {
        return Err(format!("empty key in `{input}`"));
    }
    Ok((key.trim().to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CliConfig::default();

        assert_eq!(config.logging.level, "info");
        assert_eq!(config.testnet.nb_base, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = CliConfig::default();

        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());
        config.logging.level = "debug".to_string();

        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
        config.logging.format = "json".to_string();

        config.testnet.nb_base = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_key_value() {
        assert_eq!(
            parse_key_value("nb_fw=3").unwrap(),
            ("nb_fw".to_string(), "3".to_string())
        );
        assert_eq!(
            parse_key_value("bin_args=--floodfill=1").unwrap(),
            ("bin_args".to_string(), "--floodfill=1".to_string())
        );
        assert!(parse_key_value("nb_fw").is_err());
        assert!(parse_key_value("=3").is_err());
    }

    #[test]
    fn test_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("testnet.toml");
        std::fs::write(
            &path,
            r#"
[testnet]
network = "smoke"
nb_base = 4
nb_fw = 2
cleanup = true

[logging]
format = "compact"
"#,
        )
        .unwrap();

        let config = CliConfig::from_file(&path).unwrap();
        assert_eq!(config.testnet.network, "smoke");
        assert_eq!(config.testnet.instance_count(), 6);
        assert!(config.testnet.cleanup);
        assert_eq!(config.logging.format, "compact");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_config_serialization() {
        let config = CliConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();

        let parsed: CliConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.testnet, config.testnet);
    }
}
