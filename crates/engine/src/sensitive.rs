//! Sensitive-Data Processor — masks configured response fields before they
//! reach the model, and recovers the original values when a later tool call
//! needs them, without ever putting the original into the model-facing
//! transcript.
//!
//! Ported from the masking/unmasking engine this loop was distilled from
//! (field-path addressing, full/partial/pattern mask types, dual forward +
//! reverse TTL-backed lookup, and the documented "first stored candidate
//! wins" ambiguity rule for pattern-based recovery).

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use regex::Regex;
use serde_json::Value;

use sa_domain::http_tool::{MaskType, SensitiveDataConfig, SensitiveFieldConfig};

use crate::error::{EngineError, Result};

const DEFAULT_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const DEFAULT_FULL_MASK_LEN: usize = 8;
const DEFAULT_PARTIAL_MASK_LEN: usize = 10;
const DEFAULT_MASK_PERCENTAGE: u8 = 60;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone)]
struct StoredEntry {
    original: Value,
    masked_value: Option<String>,
    stored_at: Instant,
}

/// Backing store for sensitive-data mappings. A trait seam so a conversation
/// id's forward/reverse hashes can later be backed by Redis (out of scope
/// here) without changing `SensitiveDataProcessor`.
pub trait SensitiveStore: Send + Sync {
    fn store(&self, conversation_id: &str, identifier: &str, masked: Option<&str>, original: &Value);
    fn get_by_identifier(&self, conversation_id: &str, identifier: &str) -> Option<Value>;
    fn get_by_masked(&self, conversation_id: &str, masked: &str) -> Option<Value>;
    /// All (identifier, original) pairs for a conversation in insertion
    /// order, for the pattern-matching recovery heuristics.
    fn scan(&self, conversation_id: &str) -> Vec<(String, Value)>;
    fn clear_conversation(&self, conversation_id: &str);
}

/// In-memory, TTL-backed implementation. Mirrors the per-conversation
/// forward (`identifier -> original`) and reverse (`masked -> original`)
/// hash pair, default TTL 7 days.
#[derive(Default)]
pub struct InMemorySensitiveStore {
    // conversation_id -> ordered forward entries
    forward: RwLock<HashMap<String, Vec<(String, StoredEntry)>>>,
    ttl: Duration,
}

impl InMemorySensitiveStore {
    pub fn new() -> Self {
        Self {
            forward: RwLock::new(HashMap::new()),
            ttl: DEFAULT_TTL,
        }
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            forward: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    fn expired(&self, entry: &StoredEntry) -> bool {
        entry.stored_at.elapsed() > self.ttl
    }
}

impl SensitiveStore for InMemorySensitiveStore {
    fn store(&self, conversation_id: &str, identifier: &str, masked: Option<&str>, original: &Value) {
        let mut map = self.forward.write();
        let entries = map.entry(conversation_id.to_string()).or_default();
        entries.retain(|(id, _)| id != identifier);
        entries.push((
            identifier.to_string(),
            StoredEntry {
                original: original.clone(),
                masked_value: masked.map(|s| s.to_string()),
                stored_at: Instant::now(),
            },
        ));
    }

    fn get_by_identifier(&self, conversation_id: &str, identifier: &str) -> Option<Value> {
        let map = self.forward.read();
        let entries = map.get(conversation_id)?;
        let (_, entry) = entries.iter().find(|(id, _)| id == identifier)?;
        if self.expired(entry) {
            return None;
        }
        Some(entry.original.clone())
    }

    fn get_by_masked(&self, conversation_id: &str, masked: &str) -> Option<Value> {
        let map = self.forward.read();
        let entries = map.get(conversation_id)?;
        let (_, entry) = entries
            .iter()
            .find(|(_, e)| e.masked_value.as_deref() == Some(masked))?;
        if self.expired(entry) {
            return None;
        }
        Some(entry.original.clone())
    }

    fn scan(&self, conversation_id: &str) -> Vec<(String, Value)> {
        let map = self.forward.read();
        let Some(entries) = map.get(conversation_id) else {
            return Vec::new();
        };
        entries
            .iter()
            .filter(|(_, e)| !self.expired(e))
            .map(|(id, e)| (id.clone(), e.original.clone()))
            .collect()
    }

    fn clear_conversation(&self, conversation_id: &str) {
        self.forward.write().remove(conversation_id);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Processor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SensitiveDataProcessor {
    conversation_id: String,
    store: std::sync::Arc<dyn SensitiveStore>,
}

impl SensitiveDataProcessor {
    pub fn new(conversation_id: impl Into<String>, store: std::sync::Arc<dyn SensitiveStore>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            store,
        }
    }

    /// Mask configured response fields in place, returning the processed
    /// (deep-cloned) response value.
    pub fn process_tool_response(&self, response: &Value, config: &SensitiveDataConfig) -> Value {
        if config.response.sensitive_fields.is_empty() {
            return response.clone();
        }
        let mut processed = response.clone();
        for field in &config.response.sensitive_fields {
            let Some(value) = get_value_by_path(&processed, &field.path) else {
                continue;
            };
            let (masked, identifier) = self.mask_value(&value, field);
            if !identifier.is_empty() {
                let masked_str = masked.as_str().map(|s| s.to_string()).or_else(|| {
                    masked.get("value").and_then(|v| v.as_str()).map(|s| s.to_string())
                });
                self.store
                    .store(&self.conversation_id, &identifier, masked_str.as_deref(), &value);
            }
            set_value_by_path(&mut processed, &field.path, masked);
        }
        processed
    }

    /// Recover sensitive parameters on the way into a tool call.
    pub fn process_tool_parameters(&self, parameters: &Value, config: &SensitiveDataConfig) -> Value {
        let mut processed = parameters.clone();

        if !config.parameters.recoverable_fields.is_empty() {
            for bucket in ["query", "header", "path", "params"] {
                if let Some(val) = processed.get(bucket).cloned() {
                    let recovered = self.recover_parameters(&val, &config.parameters.recoverable_fields);
                    if let Some(obj) = processed.as_object_mut() {
                        obj.insert(bucket.to_string(), recovered);
                    }
                }
            }
        }

        if !config.parameters.nested_fields.is_empty() {
            if let Some(body) = processed.get("body").cloned() {
                let mut body = body;
                for path in &config.parameters.nested_fields {
                    let Some(value) = get_value_by_path(&body, path) else {
                        continue;
                    };
                    let as_str = match &value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    if let Some(original) = self.get_original_value(&as_str) {
                        set_value_by_path(&mut body, path, original);
                    }
                }
                if let Some(obj) = processed.as_object_mut() {
                    obj.insert("body".to_string(), body);
                }
            }
        }

        processed
    }

    fn recover_parameters(&self, params: &Value, recoverable_fields: &[String]) -> Value {
        match params {
            Value::Object(map) => {
                let mut result = serde_json::Map::new();
                for (key, value) in map {
                    let mut should_recover = recoverable_fields.iter().any(|f| f == key);
                    let mut value = value.clone();

                    if let Value::Object(inner) = &value {
                        if inner.get("__sensitive").and_then(Value::as_bool) == Some(true) {
                            should_recover = true;
                            let binding_key = inner.get("__binding_key").and_then(Value::as_str);
                            let actual_value = inner.get("value").cloned().unwrap_or(Value::Null);

                            if let Some(binding_key) = binding_key {
                                let identifier = sa_domain::sensitive::make_identifier(
                                    &self.conversation_id,
                                    binding_key,
                                );
                                if let Some(original) =
                                    self.store.get_by_identifier(&self.conversation_id, &identifier)
                                {
                                    result.insert(key.clone(), original);
                                    continue;
                                }
                            }
                            value = actual_value;
                        }
                    }

                    if should_recover {
                        if let Value::String(s) = &value {
                            let original = self.get_original_value(s);
                            result.insert(key.clone(), original.unwrap_or(value.clone()));
                            continue;
                        }
                    }
                    result.insert(key.clone(), self.recover_parameters(&value, recoverable_fields));
                }
                Value::Object(result)
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.recover_parameters(item, recoverable_fields))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Three-tier recovery: direct identifier lookup, reverse masked lookup,
    /// then pattern-matching heuristics. Returns `None` on a miss — callers
    /// treat a miss as `SensitiveLookupMiss`, which is non-fatal: the masked
    /// value flows through unchanged.
    pub fn get_original_value(&self, value: &str) -> Option<Value> {
        if value.starts_with("__SENSITIVE_DATA_") && value.ends_with("__") {
            if let Some(v) = self.store.get_by_identifier(&self.conversation_id, value) {
                return Some(v);
            }
        }

        if let Some(v) = self.store.get_by_masked(&self.conversation_id, value) {
            return Some(v);
        }

        let entries = self.store.scan(&self.conversation_id);

        let full_mask_re = Regex::new(r"^\*+$").unwrap();
        if full_mask_re.is_match(value) {
            for (_, original) in &entries {
                if let Value::String(s) = original {
                    if value.len() == 8 || (s.len() as i64 - value.len() as i64).abs() < 5 {
                        return Some(original.clone());
                    }
                }
            }
        } else if value.contains('*') {
            let prefix = value.split('*').next().unwrap_or("");
            let suffix = value.rsplit('*').next().unwrap_or("");
            for (_, original) in &entries {
                if let Value::String(s) = original {
                    if s.starts_with(prefix) && s.ends_with(suffix) {
                        return Some(original.clone());
                    }
                }
            }
        } else {
            let last4_re = Regex::new(r"\*+-\d{4}$").unwrap();
            if last4_re.is_match(value) && value.len() >= 4 {
                let last4 = &value[value.len() - 4..];
                for (_, original) in &entries {
                    if let Value::String(s) = original {
                        if s.ends_with(last4) {
                            return Some(original.clone());
                        }
                    }
                }
            }
        }

        None
    }

    /// Look up a value, returning `SensitiveLookupMiss` on failure so callers
    /// that need an explicit error (rather than pass-through) can surface one.
    pub fn recover_or_err(&self, value: &str) -> Result<Value> {
        self.get_original_value(value)
            .ok_or_else(|| EngineError::SensitiveLookupMiss(value.to_string()))
    }

    pub fn clear(&self) {
        self.store.clear_conversation(&self.conversation_id);
    }

    fn mask_value(&self, value: &Value, field: &SensitiveFieldConfig) -> (Value, String) {
        let Value::String(s) = value else {
            return (value.clone(), String::new());
        };

        let tag = field
            .identifier
            .clone()
            .unwrap_or_else(|| hash_value(s).to_string());
        let identifier = sa_domain::sensitive::make_identifier(&self.conversation_id, &tag);

        let masked_value = match field.mask_type {
            MaskType::Full => {
                let max_len = field.max_mask_length.unwrap_or(DEFAULT_FULL_MASK_LEN);
                "*".repeat(max_len.min(s.chars().count()))
            }
            MaskType::Partial => {
                let pct = field.mask_percentage.unwrap_or(DEFAULT_MASK_PERCENTAGE);
                let max_len = field.max_mask_length.unwrap_or(DEFAULT_PARTIAL_MASK_LEN);
                partial_mask(s, pct, max_len)
            }
            MaskType::Pattern => {
                let pattern = field.pattern.clone().unwrap_or_else(|| "{value}".to_string());
                pattern_mask(s, &pattern)
            }
        };

        if field.add_flag {
            let mut obj = serde_json::Map::new();
            obj.insert("__sensitive".to_string(), Value::Bool(true));
            obj.insert("value".to_string(), Value::String(masked_value));
            if let Some(custom) = &field.identifier {
                obj.insert("__binding_key".to_string(), Value::String(custom.clone()));
            }
            (Value::Object(obj), identifier)
        } else {
            (Value::String(masked_value), identifier)
        }
    }
}

fn hash_value(value: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Preserve ~1 char per end (fewer for long values), fill the middle with
/// `*` up to `max_mask_length`, proportion masked defaults to 60%.
fn partial_mask(value: &str, mask_percentage: u8, max_mask_length: usize) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 3 {
        return value.to_string();
    }

    let mask_length = (chars.len() * mask_percentage as usize) / 100;
    let mask_length = mask_length.min(max_mask_length);

    let mut preserve_each_end = (chars.len().saturating_sub(mask_length)) / 2;
    preserve_each_end = preserve_each_end.max(1);
    if chars.len() > 30 {
        preserve_each_end = preserve_each_end.min(3);
    }

    let prefix: String = chars.iter().take(preserve_each_end).collect();
    let suffix: String = chars.iter().rev().take(preserve_each_end).collect::<Vec<_>>().into_iter().rev().collect();
    format!("{prefix}{}{suffix}", "*".repeat(mask_length))
}

fn pattern_mask(value: &str, pattern: &str) -> String {
    if pattern.contains("{value}") {
        pattern.replace("{value}", value)
    } else if pattern.contains("{username}") && value.contains('@') {
        let username = value.split('@').next().unwrap_or("");
        pattern.replace("{username}", username)
    } else if pattern.contains("{last4}") && value.chars().count() >= 4 {
        let last4: String = value.chars().rev().take(4).collect::<Vec<_>>().into_iter().rev().collect();
        pattern.replace("{last4}", &last4)
    } else {
        pattern.to_string()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dot-notation + bracket-index path addressing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn split_path(path: &str) -> Vec<String> {
    if path.contains('[') {
        path.split(|c| c == '.' || c == '[' || c == ']')
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect()
    } else {
        path.split('.').map(|s| s.to_string()).collect()
    }
}

pub fn get_value_by_path(data: &Value, path: &str) -> Option<Value> {
    if path.is_empty() {
        return None;
    }
    let parts = split_path(path);
    let mut current = data;
    for part in &parts {
        if let Ok(idx) = part.parse::<usize>() {
            current = current.as_array()?.get(idx)?;
        } else {
            current = current.as_object()?.get(part)?;
        }
    }
    Some(current.clone())
}

pub fn set_value_by_path(data: &mut Value, path: &str, value: Value) {
    if path.is_empty() {
        return;
    }
    let parts = split_path(path);
    let mut current = data;
    for (i, part) in parts.iter().enumerate() {
        let is_last = i == parts.len() - 1;
        if let Ok(idx) = part.parse::<usize>() {
            if !current.is_array() {
                *current = Value::Array(Vec::new());
            }
            let arr = current.as_array_mut().unwrap();
            while arr.len() <= idx {
                arr.push(Value::Null);
            }
            if is_last {
                arr[idx] = value;
                return;
            }
            current = &mut arr[idx];
        } else {
            if !current.is_object() {
                *current = Value::Object(serde_json::Map::new());
            }
            let obj = current.as_object_mut().unwrap();
            if is_last {
                obj.insert(part.clone(), value);
                return;
            }
            current = obj.entry(part.clone()).or_insert(Value::Object(serde_json::Map::new()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sa_domain::http_tool::{ParametersSensitiveConfig, ResponseSensitiveConfig};
    use std::sync::Arc;

    fn processor() -> SensitiveDataProcessor {
        SensitiveDataProcessor::new("conv1", Arc::new(InMemorySensitiveStore::new()))
    }

    #[test]
    fn full_mask_round_trips_via_identifier() {
        let p = processor();
        let field = SensitiveFieldConfig {
            path: "token".into(),
            mask_type: MaskType::Full,
            identifier: Some("tok".into()),
            add_flag: false,
            pattern: None,
            mask_percentage: None,
            max_mask_length: None,
        };
        let config = SensitiveDataConfig {
            response: ResponseSensitiveConfig {
                sensitive_fields: vec![field],
            },
            parameters: ParametersSensitiveConfig::default(),
        };
        let response = serde_json::json!({ "token": "sk-abc123456789" });
        let processed = p.process_tool_response(&response, &config);
        let masked = processed["token"].as_str().unwrap();
        assert_eq!(masked, "********");

        let identifier = sa_domain::sensitive::make_identifier("conv1", "tok");
        let recovered = p.get_original_value(&identifier).unwrap();
        assert_eq!(recovered, serde_json::json!("sk-abc123456789"));
    }

    #[test]
    fn pattern_mask_username_round_trips_via_reverse_lookup() {
        let p = processor();
        let field = SensitiveFieldConfig {
            path: "email".into(),
            mask_type: MaskType::Pattern,
            identifier: None,
            add_flag: false,
            pattern: Some("{username}@***".into()),
            mask_percentage: None,
            max_mask_length: None,
        };
        let config = SensitiveDataConfig {
            response: ResponseSensitiveConfig {
                sensitive_fields: vec![field],
            },
            parameters: ParametersSensitiveConfig::default(),
        };
        let response = serde_json::json!({ "email": "alice@example.com" });
        let processed = p.process_tool_response(&response, &config);
        assert_eq!(processed["email"], serde_json::json!("alice@***"));

        let recovered = p.get_original_value("alice@***").unwrap();
        assert_eq!(recovered, serde_json::json!("alice@example.com"));
    }

    #[test]
    fn partial_mask_preserves_ends() {
        assert_eq!(partial_mask("1234567890", 60, 10), "12******90");
    }

    #[test]
    fn lookup_miss_is_non_fatal() {
        let p = processor();
        assert!(p.get_original_value("no-such-identifier").is_none());
        assert!(p.recover_or_err("no-such-identifier").is_err());
    }

    #[test]
    fn clear_removes_both_mappings() {
        let p = processor();
        let field = SensitiveFieldConfig {
            path: "token".into(),
            mask_type: MaskType::Full,
            identifier: Some("tok".into()),
            add_flag: false,
            pattern: None,
            mask_percentage: None,
            max_mask_length: None,
        };
        let config = SensitiveDataConfig {
            response: ResponseSensitiveConfig {
                sensitive_fields: vec![field],
            },
            parameters: ParametersSensitiveConfig::default(),
        };
        let response = serde_json::json!({ "token": "sk-abc123456789" });
        p.process_tool_response(&response, &config);
        p.clear();
        let identifier = sa_domain::sensitive::make_identifier("conv1", "tok");
        assert!(p.get_original_value(&identifier).is_none());
    }
}
