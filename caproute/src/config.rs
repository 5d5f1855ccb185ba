//! Engine configuration.
//!
//! Per-request `timeout`/`max_retries` overrides take precedence; these
//! values are the fallbacks applied by the executors when a request leaves
//! them unset.

use crate::error::{DispatchError, DispatchResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Per-attempt timeout applied when the request does not set one.
    pub default_timeout_ms: u64,
    /// Retries per handler (in addition to the first attempt).
    pub default_max_retries: u32,
    /// Minimum trimmed length accepted by the text validators.
    pub min_text_chars: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            default_max_retries: 1,
            min_text_chars: 2,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> DispatchResult<Self> {
        toml::from_str(raw).map_err(|e| DispatchError::InvalidConfig(e.to_string()))
    }
}
