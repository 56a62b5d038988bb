//! Daemon configuration
//!
//! Loaded once at start-up from TOML and handed to the engine unchanged.
//!
//! ```toml
//! target_path = "/[%s/%s]"
//! source_pattern = "java.lang:*"
//! service_names = ["billing", "orders"]
//! connect_timeout_secs = 10
//!
//! [connection_options]
//! credentials = "monitor"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use common::cascade::{CascadeSettings, CascadingService, DEFAULT_DELEGATE_NAME};
use common::name::{NameError, NamePattern, ObjectName};
use common::path::DEFAULT_TARGET_PATH;
use serde::{Deserialize, Serialize};

use crate::discovery::{DiscoveryError, DiscoveryFeed};
use crate::listener::{DiscoveryListener, ListenerOptions};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config from {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid name in config: {0}")]
    InvalidName(#[from] NameError),
    #[error("discovery error: {0}")]
    Discovery(#[from] DiscoveryError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Target path template; empty mounts at the root
    pub target_path: String,
    /// Restricts which remote objects get mounted
    pub source_pattern: Option<String>,
    pub connection_options: BTreeMap<String, String>,
    /// Abstract service types to listen for
    pub service_names: Vec<String>,
    pub delegate_name: String,
    pub connect_timeout_secs: u64,
    pub enumerate_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target_path: DEFAULT_TARGET_PATH.to_string(),
            source_pattern: None,
            connection_options: BTreeMap::new(),
            service_names: Vec::new(),
            delegate_name: DEFAULT_DELEGATE_NAME.to_string(),
            connect_timeout_secs: 30,
            enumerate_timeout_secs: 30,
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn settings(&self) -> Result<CascadeSettings, ConfigError> {
        Ok(CascadeSettings {
            delegate_name: ObjectName::parse(&self.delegate_name)?,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            enumerate_timeout: Duration::from_secs(self.enumerate_timeout_secs),
        })
    }

    pub fn listener_options(&self) -> Result<ListenerOptions, ConfigError> {
        let source_pattern = self
            .source_pattern
            .as_deref()
            .map(NamePattern::parse)
            .transpose()?;
        Ok(ListenerOptions {
            target_path: Some(self.target_path.clone()).filter(|t| !t.is_empty()),
            source_pattern,
            connection_options: self.connection_options.clone(),
        })
    }

    /// Build a listener over `feed` and subscribe it for every service name
    pub fn construct(
        &self,
        feed: Arc<dyn DiscoveryFeed>,
        service: CascadingService,
    ) -> Result<DiscoveryListener, ConfigError> {
        let listener = DiscoveryListener::new(feed, service, self.listener_options()?)?;
        for service_name in &self.service_names {
            listener.listen_for_service(service_name)?;
        }
        tracing::info!(
            services = self.service_names.len(),
            target_path = %self.target_path,
            "discovery listener constructed"
        );
        Ok(listener)
    }
}
