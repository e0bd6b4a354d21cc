//! Configuration for the binary engine.
//!
//! An [`EngineConfig`] is handed to [`BinaryRegistry::new`](crate::BinaryRegistry::new) and
//! shared by every binary that registry loads.

use std::{path::PathBuf, time::Duration};

use crate::{binary::BinaryLoadOptions, signing::TIMESTAMP_SERVERS};

/// Configuration for a [`BinaryRegistry`](crate::BinaryRegistry).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Directory holding the private working copies (default: the system temp directory).
    pub working_directory: PathBuf,

    /// Timestamp authorities, tried in order when signing.
    pub timestamp_servers: Vec<String>,

    /// How many times the full list of timestamp authorities is tried (default: 3).
    pub timestamp_rounds: usize,

    /// Options used by [`BinaryRegistry::load_default`](crate::BinaryRegistry::load_default).
    pub default_options: BinaryLoadOptions,

    /// Upper bound for each save in [`BinaryRegistry::save_all`](crate::BinaryRegistry::save_all);
    /// `None` waits indefinitely.
    pub save_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            working_directory: std::env::temp_dir(),
            timestamp_servers: TIMESTAMP_SERVERS.iter().map(ToString::to_string).collect(),
            timestamp_rounds: 3,
            default_options: BinaryLoadOptions::DELAY_LOAD,
            save_timeout: None,
        }
    }
}

impl EngineConfig {
    /// Sets the directory for working copies.
    ///
    /// # Returns
    ///
    /// The modified configuration (builder pattern).
    #[must_use]
    pub fn with_working_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.working_directory = directory.into();
        self
    }

    /// Replaces the timestamp authorities and the number of rounds through them.
    #[must_use]
    pub fn with_timestamp_servers(mut self, servers: Vec<String>, rounds: usize) -> Self {
        self.timestamp_servers = servers;
        self.timestamp_rounds = rounds;
        self
    }

    /// Sets the options used by `load_default`.
    #[must_use]
    pub fn with_default_options(mut self, options: BinaryLoadOptions) -> Self {
        self.default_options = options;
        self
    }

    /// Bounds each save performed by `save_all`.
    #[must_use]
    pub fn with_save_timeout(mut self, timeout: Duration) -> Self {
        self.save_timeout = Some(timeout);
        self
    }
}
