//! Configuration loader implementation

use std::path::{Path, PathBuf};

use config::{Config, Environment, File};
use log::debug;

use crate::common::Result;
use crate::config::defaults::{DEFAULT_CONFIG_FILE, ENV_PREFIX, ENV_SEPARATOR};
use crate::config::ProxyConfig;

/// Trait for loading configuration from layered sources
pub trait ConfigLoader {
    /// Load configuration with this priority, lowest first:
    /// 1. Default values
    /// 2. Configuration file (`path`, or `config/hiproxy.yaml` if present)
    /// 3. Environment variables (`HIPROXY_LOG_LEVEL`, `HIPROXY_AGENT__URL`, ...)
    fn load(path: Option<&Path>) -> Result<Self> where Self: Sized;

    /// Load from one explicit file without the environment layer
    fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> where Self: Sized;
}

impl ConfigLoader for ProxyConfig {
    fn load(path: Option<&Path>) -> Result<Self> {
        // An explicit path must exist; the default location is optional
        let (config_path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };

        let built = Config::builder()
            .add_source(File::from(config_path.clone()).required(required))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()?;

        let config: ProxyConfig = built.try_deserialize()?;
        if config_path.exists() {
            debug!("Configuration loaded from {}", config_path.display());
        } else {
            debug!("No configuration file at {}, using defaults and environment", config_path.display());
        }
        Ok(config)
    }

    fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let built = Config::builder()
            .add_source(File::from(path.as_ref()).required(true))
            .build()?;
        Ok(built.try_deserialize()?)
    }
}
