//! Tool Dispatcher — recognizes tool invocations embedded in model output as
//! fenced JSON blocks, looks the tool name up in the registry, and invokes
//! it. Enforces the concurrency contract: at most one tool invocation is
//! in-flight per executor; invocations are sequential with respect to the
//! loop, even when a single model turn requests several tools (a deliberate
//! deviation from this repo's forebear, which dispatched concurrently via
//! `join_all` — see DESIGN.md).

use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use sa_domain::http_tool::ToolKind;
use sa_mcp_client::McpManager;

use crate::error::{EngineError, Result};
use crate::sensitive::SensitiveDataProcessor;
use crate::tools::http::HttpToolInvoker;
use crate::tools::registry::ToolRegistry;

/// Context threaded into tool invocation to break the executor <-> dispatcher
/// cycle (the executor's conversation id and sensitive-processor handle,
/// rather than a back-pointer to the executor itself).
#[derive(Clone)]
pub struct ExecutorContext {
    pub conversation_id: String,
    pub sensitive: Arc<SensitiveDataProcessor>,
}

/// One frame produced by a local tool's lazy output sequence. `Finish` is an
/// explicit sentinel (not stream closure) so that an `Output` carrying an
/// error can still be followed by further frames before the tool concludes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ToolFrame {
    Output { kind: String, data: Value },
    Finish,
}

pub type LocalToolFn = Arc<
    dyn Fn(Value, ExecutorContext) -> futures_core::future::BoxFuture<'static, Vec<ToolFrame>>
        + Send
        + Sync,
>;

/// One of the three fenced-JSON shapes the model may emit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationKind {
    Function,
    Api,
    Mcp,
}

#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub kind: InvocationKind,
    pub name: String,
    pub parameters: Value,
}

/// Extract the first fenced code block whose language hint is `json` or
/// absent, and parse it as a tool invocation. Returns `None` (treat as plain
/// visible text) if no fenced block is present or it fails to parse as one
/// of the three recognized shapes — this never raises.
pub fn parse_tool_invocation(text: &str) -> Option<ToolInvocation> {
    let fence_re = Regex::new(r"```(\w*)\n([\s\S]*?)```").ok()?;
    for cap in fence_re.captures_iter(text) {
        let lang = cap.get(1).map(|m| m.as_str()).unwrap_or("");
        if !(lang.is_empty() || lang.eq_ignore_ascii_case("json")) {
            continue;
        }
        let body = cap.get(2)?.as_str();
        let Ok(value) = serde_json::from_str::<Value>(body) else {
            continue;
        };
        if let Some(invocation) = shape_to_invocation(&value) {
            return Some(invocation);
        }
    }
    None
}

fn shape_to_invocation(value: &Value) -> Option<ToolInvocation> {
    let kind = match value.get("type")?.as_str()? {
        "function" => InvocationKind::Function,
        "api" => InvocationKind::Api,
        "mcp" => InvocationKind::Mcp,
        _ => return None,
    };
    let function = value.get("function")?;
    let name = function.get("name")?.as_str()?.to_string();
    let parameters = function.get("parameters").cloned().unwrap_or(Value::Null);
    Some(ToolInvocation {
        kind,
        name,
        parameters,
    })
}

pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    locals: std::collections::HashMap<String, LocalToolFn>,
    http: HttpToolInvoker,
    mcp: Option<Arc<McpManager>>,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>, http: HttpToolInvoker, mcp: Option<Arc<McpManager>>) -> Self {
        Self {
            registry,
            locals: std::collections::HashMap::new(),
            http,
            mcp,
        }
    }

    pub fn register_local(&mut self, name: impl Into<String>, f: LocalToolFn) {
        self.locals.insert(name.into(), f);
    }

    /// Dispatch one invocation to completion, fully draining any lazy frame
    /// sequence (or its explicit `Finish`) before returning. Returns the
    /// frames to forward to the event sink and the text to append to memory
    /// as a `tool-result` turn.
    pub async fn dispatch(
        &self,
        invocation: &ToolInvocation,
        ctx: &ExecutorContext,
    ) -> (Vec<ToolFrame>, String, bool) {
        let Some(descriptor) = self.registry.get(&invocation.name) else {
            let err = EngineError::ToolNotFound(invocation.name.clone());
            return (vec![], err.to_string(), true);
        };

        match &descriptor.kind {
            ToolKind::Local => match self.locals.get(&invocation.name) {
                Some(f) => {
                    let frames = f(invocation.parameters.clone(), ctx.clone()).await;
                    let text = frames_to_text(&frames);
                    (frames, text, false)
                }
                None => {
                    let err = EngineError::ToolNotFound(invocation.name.clone());
                    (vec![], err.to_string(), true)
                }
            },
            ToolKind::Http(config) => {
                match self
                    .http
                    .invoke(config, &invocation.parameters, ctx, &self.http_sensitive_config(descriptor))
                    .await
                {
                    Ok((frames, is_error)) => {
                        let text = frames_to_text(&frames);
                        (frames, text, is_error)
                    }
                    Err(e) => (vec![], e.to_string(), true),
                }
            }
            ToolKind::Mcp(mcp_ref) => {
                let Some(mcp) = &self.mcp else {
                    let err = EngineError::ToolTransport {
                        tool_name: invocation.name.clone(),
                        message: "no MCP manager configured".into(),
                    };
                    return (vec![], err.to_string(), true);
                };
                match mcp
                    .call_tool(&mcp_ref.server_id, &mcp_ref.tool_name, invocation.parameters.clone())
                    .await
                {
                    Ok(result) => {
                        let text = result
                            .content
                            .iter()
                            .map(|c| c.text.as_str())
                            .collect::<Vec<_>>()
                            .join("\n");
                        let is_error = result.is_error;
                        let data = serde_json::to_value(&result).unwrap_or(Value::Null);
                        (
                            vec![ToolFrame::Output {
                                kind: "mcp".into(),
                                data,
                            }],
                            text,
                            is_error,
                        )
                    }
                    Err(e) => (vec![], e.to_string(), true),
                }
            }
        }
    }

    fn http_sensitive_config<'a>(
        &self,
        descriptor: &'a sa_domain::http_tool::ToolDescriptor,
    ) -> Option<&'a sa_domain::http_tool::SensitiveDataConfig> {
        match &descriptor.kind {
            ToolKind::Http(config) => config.sensitive_data_config.as_ref(),
            _ => None,
        }
    }
}

fn frames_to_text(frames: &[ToolFrame]) -> String {
    frames
        .iter()
        .filter_map(|f| match f {
            ToolFrame::Output { data, .. } => Some(match data {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
            ToolFrame::Finish => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_function_shape() {
        let text = "here you go:\n```json\n{\"type\":\"function\",\"function\":{\"name\":\"get_time\",\"parameters\":{}}}\n```\nthanks";
        let inv = parse_tool_invocation(text).unwrap();
        assert_eq!(inv.kind, InvocationKind::Function);
        assert_eq!(inv.name, "get_time");
    }

    #[test]
    fn parses_api_shape_with_four_buckets() {
        let text = "```\n{\"type\":\"api\",\"function\":{\"name\":\"lookup\",\"parameters\":{\"header\":{},\"query\":{\"q\":\"x\"},\"path\":{},\"body\":{}}}}\n```";
        let inv = parse_tool_invocation(text).unwrap();
        assert_eq!(inv.kind, InvocationKind::Api);
        assert_eq!(inv.parameters["query"]["q"], "x");
    }

    #[test]
    fn invalid_json_in_fence_falls_back_to_none() {
        let text = "```json\nnot json at all {{{\n```";
        assert!(parse_tool_invocation(text).is_none());
    }

    #[test]
    fn no_fence_is_none() {
        assert!(parse_tool_invocation("just plain text").is_none());
    }

    #[test]
    fn unrecognized_type_is_none() {
        let text = "```json\n{\"type\":\"unknown\",\"function\":{\"name\":\"x\",\"parameters\":{}}}\n```";
        assert!(parse_tool_invocation(text).is_none());
    }
}
