// Engine configuration

//! # Configuration
//!
//! `EngineConfig` is read from, in increasing priority:
//! 1. built-in defaults
//! 2. an optional TOML/JSON/YAML file (`actionflow.toml` by default)
//! 3. `ACTIONFLOW_*` environment variables (e.g. `ACTIONFLOW_VERIFY_FUNCTIONS=true`)
//!
//! Binaries call `dotenv()` first so a local `.env` file can supply the
//! environment variables.

use std::path::Path;

use ::config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Default config file name (extension resolved by the `config` crate)
pub const DEFAULT_CONFIG_NAME: &str = "actionflow";

/// Environment variable prefix
pub const ENV_PREFIX: &str = "ACTIONFLOW";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Separator between capability and entry point in function names
    pub function_delimiter: String,

    /// Entry point used when a function name has none
    pub default_entry_point: String,

    /// Reject definitions that reference unregistered functions on save
    pub verify_functions: bool,

    /// Capacity of the lifecycle event channel
    pub event_buffer: usize,

    /// Log filter used by the binaries when `RUST_LOG` is unset
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            function_delimiter: "@".to_string(),
            default_entry_point: "handle".to_string(),
            verify_functions: false,
            event_buffer: 1000,
            log_level: "info".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from an optional file plus the environment
    ///
    /// A missing file is not an error; a malformed one is.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name(DEFAULT_CONFIG_NAME).required(false),
        };

        let config = Config::builder()
            .add_source(file)
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?;

        Ok(config.try_deserialize()?)
    }
}
