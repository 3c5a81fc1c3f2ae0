//! Plugin-side settings, read from a TOML file next to the plugin.
//!
//! ```toml
//! [trampoline]
//! capacity = 28
//! prefer_host_pool = true
//!
//! [offsets]
//! table = "offsets.json"
//!
//! [log]
//! level = "debug"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::logging::LogConfig;

/// Bytes reserved for branch stubs when nothing else is configured.
pub const DEFAULT_TRAMPOLINE_CAPACITY: usize = 28;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub trampoline: TrampolineConfig,
    #[serde(default)]
    pub offsets: OffsetsConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrampolineConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Reserve from the loader's branch pool before allocating our own region
    #[serde(default = "default_true")]
    pub prefer_host_pool: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetsConfig {
    /// JSON version table merged over the built-in offsets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<PathBuf>,
}

fn default_capacity() -> usize {
    DEFAULT_TRAMPOLINE_CAPACITY
}

fn default_true() -> bool {
    true
}

impl Default for TrampolineConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_TRAMPOLINE_CAPACITY,
            prefer_host_pool: true,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Read `path`, or return the defaults when it does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path).map_err(Error::from) {
            Ok(content) => {
                let mut config: Self = toml::from_str(&content)?;
                config.resolve_relative_to(path.parent());
                debug!("Loaded configuration from {}", path.display());
                Ok(config)
            }
            Err(e) if e.is_not_found() => {
                debug!("No configuration at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e),
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Offset table paths are relative to the file that named them.
    fn resolve_relative_to(&mut self, dir: Option<&Path>) {
        if let (Some(dir), Some(table)) = (dir, self.offsets.table.as_mut()) {
            if table.is_relative() {
                *table = dir.join(&*table);
            }
        }
    }
}

/// Builder for [`Config`]; unset fields keep their defaults.
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    capacity: Option<usize>,
    prefer_host_pool: Option<bool>,
    table: Option<PathBuf>,
    log: Option<LogConfig>,
}

impl ConfigBuilder {
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn prefer_host_pool(mut self, prefer: bool) -> Self {
        self.prefer_host_pool = Some(prefer);
        self
    }

    pub fn offset_table(mut self, path: impl Into<PathBuf>) -> Self {
        self.table = Some(path.into());
        self
    }

    pub fn log(mut self, log: LogConfig) -> Self {
        self.log = Some(log);
        self
    }

    pub fn build(self) -> Config {
        let defaults = TrampolineConfig::default();
        Config {
            trampoline: TrampolineConfig {
                capacity: self.capacity.unwrap_or(defaults.capacity),
                prefer_host_pool: self.prefer_host_pool.unwrap_or(defaults.prefer_host_pool),
            },
            offsets: OffsetsConfig { table: self.table },
            log: self.log.unwrap_or_default(),
        }
    }
}
