//! Tool descriptors for the reason-act loop's registry: local functions,
//! remote HTTP APIs, and MCP-exposed tools, all addressed by the same
//! `ToolDescriptor` shape so the dispatcher can switch on `kind` without
//! caring how a tool is actually implemented.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A tool the registry knows how to invoke.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub id: String,
    pub name: String,
    pub kind: ToolKind,
    pub description: String,
    /// JSON Schema for the tool's parameters, as surfaced to the model.
    pub parameters_schema: serde_json::Value,
}

/// How a tool is actually reached.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ToolKind {
    /// A local async-generator-shaped function, registered by name.
    Local,
    /// A remote HTTP API.
    Http(HttpToolConfig),
    /// A tool exposed by an MCP server.
    Mcp(McpToolRef),
}

/// Reference to a tool exposed by a configured MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolRef {
    pub server_id: String,
    pub tool_name: String,
}

/// Configuration for an HTTP-backed tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpToolConfig {
    /// Base URL, e.g. `https://api.example.com`.
    pub origin: String,
    /// Path template, e.g. `/v1/accounts/{account_id}/transactions`.
    pub path: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub parameter_partition: ParameterPartition,
    #[serde(default)]
    pub auth_config: Option<ToolAuthConfig>,
    /// When true, the response is a line-oriented stream forwarded verbatim
    /// (no masking is applied to streaming bodies).
    #[serde(default)]
    pub is_stream: bool,
    #[serde(default)]
    pub sensitive_data_config: Option<SensitiveDataConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

/// Declares which of the four buckets an argument key belongs to, plus
/// per-bucket defaults applied when the model omits a key.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ParameterPartition {
    #[serde(default)]
    pub header: Vec<String>,
    #[serde(default)]
    pub query: Vec<String>,
    #[serde(default)]
    pub path: Vec<String>,
    #[serde(default)]
    pub body: Vec<String>,
    /// Default values applied per bucket when the model omits a declared key.
    #[serde(default)]
    pub defaults: HashMap<String, serde_json::Value>,
}

/// Where and how to inject a tool's credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolAuthConfig {
    pub location: ToolAuthLocation,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolAuthLocation {
    Header,
    #[serde(rename = "param")]
    Query,
}

/// Per-tool sensitive-data handling: which response fields get masked on
/// the way out, and which request parameters are recoverable on the way in.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SensitiveDataConfig {
    #[serde(default)]
    pub response: ResponseSensitiveConfig,
    #[serde(default)]
    pub parameters: ParametersSensitiveConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResponseSensitiveConfig {
    #[serde(default)]
    pub sensitive_fields: Vec<SensitiveFieldConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ParametersSensitiveConfig {
    /// Parameter names that should be checked for recoverable sensitive
    /// values on the way in.
    #[serde(default)]
    pub recoverable_fields: Vec<String>,
    /// Dot-notation paths within the body bucket that should be recovered
    /// structurally rather than by top-level key.
    #[serde(default)]
    pub nested_fields: Vec<String>,
}

/// Describes how to mask one field path in a tool's JSON response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensitiveFieldConfig {
    /// Dot notation plus bracketed indices, e.g. `data.accounts[0].token`.
    pub path: String,
    pub mask_type: MaskType,
    /// Caller-supplied binding key. If absent, the tag is a hash of the
    /// original value.
    #[serde(default)]
    pub identifier: Option<String>,
    /// Wrap the masked value in `{"__sensitive":true,"value":...}` so callers
    /// can recover unambiguously via the binding key.
    #[serde(default)]
    pub add_flag: bool,
    /// Template for `MaskType::Pattern`, e.g. `"{username}@***"`.
    #[serde(default)]
    pub pattern: Option<String>,
    /// Proportion of the value masked under `MaskType::Partial` (default 60).
    #[serde(default)]
    pub mask_percentage: Option<u8>,
    /// Cap on the number of `*` characters emitted (default 8).
    #[serde(default)]
    pub max_mask_length: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaskType {
    Full,
    Partial,
    Pattern,
}
