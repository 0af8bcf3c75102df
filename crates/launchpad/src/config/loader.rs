//! Configuration file loading for Launchpad
//!
//! Handles loading and parsing configuration files using the config crate.

use std::path::Path;

use config::{Config as ConfigBuilder, File, FileFormat};

use crate::config::{Config, ConfigError};

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::ReadFile {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            });
        }

        let config = ConfigBuilder::builder()
            .add_source(File::from(path))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config = ConfigBuilder::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<(), ConfigError> {
        for (name, command) in [
            ("install", &self.commands.install),
            ("build", &self.commands.build),
            ("start", &self.commands.start),
        ] {
            if command.is_empty() || command[0].is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "commands.{name} must name a program"
                )));
            }
        }

        if self.commands.port_env.is_empty() {
            return Err(ConfigError::Invalid(
                "commands.port_env must not be empty".to_string(),
            ));
        }

        if self.ports.min == 0 {
            return Err(ConfigError::Invalid("ports.min must be non-zero".to_string()));
        }
        if self.ports.min > self.ports.max {
            return Err(ConfigError::Invalid(format!(
                "ports.min ({}) is greater than ports.max ({})",
                self.ports.min, self.ports.max
            )));
        }

        if self.timeouts.startup == 0 {
            return Err(ConfigError::Invalid(
                "timeouts.startup must be non-zero".to_string(),
            ));
        }

        if self.readiness.phrases.is_empty() || self.readiness.phrases.iter().any(String::is_empty)
        {
            return Err(ConfigError::Invalid(
                "readiness.phrases must be a non-empty list of non-empty strings".to_string(),
            ));
        }

        if !self.health_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "health_path '{}' must start with '/'",
                self.health_path
            )));
        }

        if self.manifest.file_name.is_empty() {
            return Err(ConfigError::Invalid(
                "manifest.file_name must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}
