//! Subscriber setup for plugins embedding the engine.
//!
//! Hosts rarely give a plugin a console, so output goes to stderr by default and can be
//! redirected to a file next to the plugin.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::error::Result;

/// Target every engine event is emitted under.
pub const TARGET: &str = "relpatch";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Level for the `relpatch` target when `RUST_LOG` is unset
    #[serde(default = "default_level")]
    pub level: String,
    /// Append to this file instead of writing to stderr
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub ansi: bool,
    #[serde(default)]
    pub file_info: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            file: None,
            ansi: true,
            file_info: false,
            show_target: true,
        }
    }
}

impl LogConfig {
    pub fn with_level(mut self, level: &str) -> Self {
        self.level = level.to_string();
        self
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Filter built from `RUST_LOG` with the configured level added for the engine target.
    ///
    /// An unparseable level counts as `info`.
    pub fn filter(&self) -> EnvFilter {
        let level = self.level.parse::<LevelFilter>().unwrap_or(LevelFilter::INFO);
        let filter = EnvFilter::from_default_env();
        match format!("{}={}", TARGET, level).parse() {
            Ok(directive) => filter.add_directive(directive),
            Err(_) => filter,
        }
    }
}

/// Install the global subscriber.
///
/// Only the first call in a process installs anything; later calls return `Ok(false)`.
pub fn init(config: &LogConfig) -> Result<bool> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(config.filter())
        .with_target(config.show_target)
        .with_file(config.file_info)
        .with_line_number(config.file_info);

    let installed = match &config.file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
                .is_ok()
        }
        None => builder
            .with_ansi(config.ansi)
            .with_writer(std::io::stderr)
            .try_init()
            .is_ok(),
    };

    Ok(installed)
}
