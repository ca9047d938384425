//! Service configuration.
//!
//! Everything has a default, so an empty TOML file is a valid
//! configuration:
//!
//! ```toml
//! database_path = "/var/lib/cloudmount/service.db"
//! cache_dir = "/var/cache/cloudmount"
//!
//! [executor]
//! min_workers = 0
//! max_workers = 4
//! idle_time_secs = 30
//!
//! [inode_cache]
//! clean_age_threshold_secs = 300
//! clean_interval_secs = 300
//! clean_size_threshold = 65536
//!
//! [unmount]
//! max_attempts = 5
//! backoff_millis = 200
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use common::task::ExecutorConfig;
use serde::{Deserialize, Serialize};

use crate::fuse::{InodeCacheConfig, UnmountPolicy};
use crate::service::ServiceError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Where mount definitions are stored. In memory when unset.
    pub database_path: Option<PathBuf>,
    /// Where file content is staged. A private temporary directory when
    /// unset.
    pub cache_dir: Option<PathBuf>,
    pub executor: ExecutorSettings,
    pub inode_cache: InodeCacheSettings,
    pub unmount: UnmountSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    pub min_workers: usize,
    pub max_workers: usize,
    pub idle_time_secs: u64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            min_workers: 0,
            max_workers: 4,
            idle_time_secs: 30,
        }
    }
}

impl From<&ExecutorSettings> for ExecutorConfig {
    fn from(settings: &ExecutorSettings) -> Self {
        ExecutorConfig {
            min_workers: settings.min_workers,
            max_workers: settings.max_workers,
            idle_time: Duration::from_secs(settings.idle_time_secs),
            name: "cloudmount-worker".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InodeCacheSettings {
    pub clean_age_threshold_secs: u64,
    pub clean_interval_secs: u64,
    pub clean_size_threshold: usize,
}

impl Default for InodeCacheSettings {
    fn default() -> Self {
        let defaults = InodeCacheConfig::default();
        Self {
            clean_age_threshold_secs: defaults.clean_age_threshold.as_secs(),
            clean_interval_secs: defaults.clean_interval.as_secs(),
            clean_size_threshold: defaults.clean_size_threshold,
        }
    }
}

impl From<&InodeCacheSettings> for InodeCacheConfig {
    fn from(settings: &InodeCacheSettings) -> Self {
        InodeCacheConfig {
            clean_age_threshold: Duration::from_secs(settings.clean_age_threshold_secs),
            clean_interval: Duration::from_secs(settings.clean_interval_secs),
            clean_size_threshold: settings.clean_size_threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnmountSettings {
    pub max_attempts: u32,
    pub backoff_millis: u64,
}

impl Default for UnmountSettings {
    fn default() -> Self {
        let defaults = UnmountPolicy::default();
        Self {
            max_attempts: defaults.max_attempts,
            backoff_millis: defaults.backoff.as_millis() as u64,
        }
    }
}

impl From<&UnmountSettings> for UnmountPolicy {
    fn from(settings: &UnmountSettings) -> Self {
        UnmountPolicy {
            max_attempts: settings.max_attempts,
            backoff: Duration::from_millis(settings.backoff_millis),
        }
    }
}

impl ServiceConfig {
    /// Read and validate a TOML configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ServiceError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: ServiceConfig = toml::from_str(&text)
            .map_err(|e| ServiceError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ServiceError> {
        if self.executor.max_workers == 0 {
            return Err(ServiceError::Config("executor.max_workers must be at least 1".into()));
        }
        if self.executor.min_workers > self.executor.max_workers {
            return Err(ServiceError::Config(
                "executor.min_workers must not exceed executor.max_workers".into(),
            ));
        }
        if self.unmount.max_attempts == 0 {
            return Err(ServiceError::Config("unmount.max_attempts must be at least 1".into()));
        }
        Ok(())
    }
}
