use super::types::StoreConfig;
use anyhow::{Context, Result};
use config::{Config, Environment, File};

/// Configuration loader with builder pattern
pub struct ConfigLoader {
    config_file: Option<String>,
    load_env: bool,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self {
            config_file: None,
            load_env: false,
        }
    }

    /// Load configuration from file
    pub fn load_from_file(mut self, path: Option<&str>) -> Self {
        self.config_file = path.map(String::from);
        self
    }

    /// Load configuration from environment variables (`COMPLIANCE_` prefix)
    pub fn load_from_env(mut self) -> Self {
        self.load_env = true;
        self
    }

    /// Build and validate the final configuration
    pub fn build(self) -> Result<StoreConfig> {
        let mut builder =
            Config::builder().add_source(Config::try_from(&StoreConfig::default())?);

        if let Some(config_path) = &self.config_file {
            builder = builder.add_source(File::with_name(config_path).required(false));
        } else {
            builder = builder
                .add_source(File::with_name("compliance-store").required(false))
                .add_source(File::with_name("config/compliance-store").required(false));
        }

        if self.load_env {
            builder = builder.add_source(
                Environment::with_prefix("COMPLIANCE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config: StoreConfig = builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config
            .validate()
            .context("Configuration validation failed")?;

        Ok(config)
    }

    /// サンプル設定ファイル（TOML）を生成
    pub fn sample_toml() -> Result<String> {
        toml::to_string_pretty(&StoreConfig::default())
            .context("Failed to render sample configuration")
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
