//! Configuration for watch pipelines.
//!
//! Settings are merged from several sources with increasing priority:
//! 1. Default values (hardcoded)
//! 2. Optional TOML file
//! 3. Environment variables prefixed with `KVSTRUCT__`
//!

mod retry;
pub use retry::*;


//---
use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::ConfigurationError;
use crate::Result;

/// Environment variable prefix recognised by [`WatchConfig::load`]
pub const ENV_PREFIX: &str = "KVSTRUCT";

/// Watch-side settings of a pipeline
///
/// How long a single long-poll may block is a property of the store
/// ([`MemoryStore::with_wait_time`](crate::MemoryStore::with_wait_time),
/// `ConsulStoreConfig::wait_time_ms`), not of the watch loop.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct WatchConfig {
    /// Key prefix of the watched subtree, e.g. `service/web/`
    #[serde(default)]
    pub prefix: String,

    /// Delay policy between failed store calls
    #[serde(default)]
    pub backoff: BackoffPolicy,
}

impl WatchConfig {
    /// Load configuration with priority: defaults, then the file at `path`
    /// (if any), then `KVSTRUCT__*` environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .ignore_empty(true)
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Same settings with a different watched prefix
    pub fn with_prefix(
        mut self,
        prefix: impl Into<String>,
    ) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigurationError> {
        if self.prefix.is_empty() {
            return Err(ConfigurationError::EmptyPrefix);
        }
        self.backoff.validate()
    }
}
