//! Data-model types for the sensitive-data mapping (see `sa-engine::sensitive`
//! for the masking/unmasking algorithm that operates on these).

use serde::{Deserialize, Serialize};

/// A recorded mapping from a masked or identifier value back to the
/// original JSON value, scoped to one conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensitiveMappingEntry {
    pub identifier: String,
    pub masked_value: String,
    pub original: serde_json::Value,
    /// Unix millis at which this entry was (re)written; used to compute TTL
    /// expiry relative to `SensitiveDataConfig`'s implicit 7-day default.
    pub stored_at_millis: i64,
}

/// Default TTL for sensitive mappings, in seconds (7 days).
pub const DEFAULT_SENSITIVE_TTL_SECS: i64 = 7 * 24 * 60 * 60;

/// Build the identifier form `__SENSITIVE_DATA_<conv>_<tag>__`.
pub fn make_identifier(conversation_id: &str, tag: &str) -> String {
    format!("__SENSITIVE_DATA_{conversation_id}_{tag}__")
}
