//! Engine Configuration
//!
//! Configuration is plain data that embedding applications can load from
//! their own settings files. Every field has a default, so an empty document
//! (`{}`) is a valid configuration.
//!
//! ```rust,ignore
//! let config = Config::from_json_str(r#"{ "scheduler": { "flush_limit": 500 } }"#)?;
//! let scheduler = Scheduler::with_config(config.scheduler);
//! let graph = Graph::with_config(&config.graph);
//! ```

use serde::Deserialize;

use crate::error::{Error, Result};

/// Default upper bound on evaluations performed by a single flush.
pub const DEFAULT_FLUSH_LIMIT: usize = 100_000;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub graph: GraphConfig,
}

impl Config {
    /// Parse a configuration from JSON.
    pub fn from_json_str(input: &str) -> Result<Self> {
        serde_json::from_str(input).map_err(|e| Error::Config(e.to_string()))
    }
}

/// Scheduler settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of node evaluations in one synchronous flush. Nodes
    /// still pending after that wait for the next flush.
    pub flush_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            flush_limit: DEFAULT_FLUSH_LIMIT,
        }
    }
}

/// Graph settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub key_encoding: KeyEncoding,
}

/// Which key codec a graph uses to turn identifiers into keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyEncoding {
    /// Opaque MessagePack encoding.
    #[default]
    MessagePack,
    /// Raw UTF-8 bytes of the identifier.
    Utf8,
}
