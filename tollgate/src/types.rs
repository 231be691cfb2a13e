//! Common type definitions shared across the pricing and streaming layers.
//!
//! - [`ModelKey`]: the (provider, model, endpoint) triple that scopes a price
//!   card, serialized on the wire as `"<provider>:<model>:<endpoint>"`
//! - [`FinalizeReason`]: why a streamed request's usage was finalized
//! - ID aliases for request/team identifiers

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// Type aliases for IDs
pub type RequestId = Uuid;
pub type TeamId = Uuid;

/// Separator used in catalog `model_key` values.
pub const MODEL_KEY_SEPARATOR: char = ':';

/// Identifies one (provider, model, endpoint) pricing scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelKey {
    pub provider: String,
    pub model: String,
    pub endpoint: String,
}

impl ModelKey {
    pub fn new(provider: impl Into<String>, model: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            endpoint: endpoint.into(),
        }
    }

    /// Parses a `"<provider>:<model>:<endpoint>"` catalog key. Missing
    /// segments become empty strings rather than errors, matching how the
    /// catalog treats malformed keys (the row simply never matches a lookup).
    pub fn parse(key: &str) -> Self {
        let mut parts = key.splitn(3, MODEL_KEY_SEPARATOR);
        Self {
            provider: parts.next().unwrap_or_default().to_string(),
            model: parts.next().unwrap_or_default().to_string(),
            endpoint: parts.next().unwrap_or_default().to_string(),
        }
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.provider, self.model, self.endpoint)
    }
}

/// Why a streamed request's usage was finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalizeReason {
    /// A terminal frame carrying (or implying) a usage snapshot was seen.
    Complete,
    /// The stream ended, errored, or was cancelled before any terminal frame.
    Aborted,
}

impl fmt::Display for FinalizeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinalizeReason::Complete => write!(f, "complete"),
            FinalizeReason::Aborted => write!(f, "aborted"),
        }
    }
}
