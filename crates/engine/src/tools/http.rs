//! HTTP Tool Invoker — turns a `HttpToolConfig` plus a nested
//! `{"header":{...},"query":{...},"path":{...},"body":{...}}` parameter
//! object into an outbound request: reads the four buckets, recovers
//! sensitive placeholders, injects auth, retries transport failures with
//! backoff, and masks sensitive response fields before the result is handed
//! back to the loop.
//!
//! URL building and auth-header conventions are ported from
//! `openai_compat.rs`'s `authed_post`; unary/streaming response handling
//! follows the chunk-buffer-drain shape of `sse.rs`'s `sse_response_stream`
//! (reimplemented here rather than reused, since that helper is private to
//! the providers crate and tied to `StreamEvent` rather than raw tool output).

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;

use sa_domain::http_tool::{
    HttpMethod, HttpToolConfig, ParameterPartition, SensitiveDataConfig, ToolAuthLocation,
};

use crate::error::{EngineError, Result};
use crate::tools::dispatch::{ExecutorContext, ToolFrame};

const UNARY_TIMEOUT: Duration = Duration::from_secs(60);
const STREAM_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(10);

pub struct HttpToolInvoker {
    client: reqwest::Client,
}

impl HttpToolInvoker {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .build()
                .expect("reqwest client builds with default tls config"),
        }
    }

    pub async fn invoke(
        &self,
        config: &HttpToolConfig,
        parameters: &Value,
        ctx: &ExecutorContext,
        sensitive: &Option<&SensitiveDataConfig>,
    ) -> Result<(Vec<ToolFrame>, bool)> {
        let recovered = match sensitive {
            Some(cfg) => ctx.sensitive.process_tool_parameters(parameters, cfg),
            None => parameters.clone(),
        };

        let path_bucket = recovered.get("path").cloned().unwrap_or(Value::Null);
        let url = build_url(config, &path_bucket)?;
        let mut request = self.client.request(
            reqwest::Method::from_bytes(config.method.as_str().as_bytes())
                .map_err(|e| EngineError::Internal(e.to_string()))?,
            url,
        );

        // Parameters arrive (and are recovered) in the api-shape nested form
        // `{"header":{...},"query":{...},"path":{...},"body":{...}}`, matching
        // `build_url` above and `SensitiveDataProcessor::process_tool_parameters`.
        let mut header_bucket = bucket_or_empty(&recovered, "header");
        let mut query_bucket = bucket_or_empty(&recovered, "query");
        let mut body = bucket_or_empty(&recovered, "body");
        fill_bucket_defaults(&mut header_bucket, &config.parameter_partition.header, &config.parameter_partition.defaults);
        fill_bucket_defaults(&mut query_bucket, &config.parameter_partition.query, &config.parameter_partition.defaults);
        fill_bucket_defaults(&mut body, &config.parameter_partition.body, &config.parameter_partition.defaults);

        request = apply_headers(request, &header_bucket);
        request = apply_query(request, &query_bucket);
        request = apply_auth(request, config);

        if !matches!(config.method, HttpMethod::Get) && !body.as_object().is_none_or(|m| m.is_empty()) {
            request = request.json(&body);
        }

        request = request.timeout(if config.is_stream {
            STREAM_TIMEOUT
        } else {
            UNARY_TIMEOUT
        });

        if config.is_stream {
            self.invoke_streaming(request).await
        } else {
            self.invoke_unary(request, config, ctx, sensitive).await
        }
    }

    async fn invoke_unary(
        &self,
        request: reqwest::RequestBuilder,
        _config: &HttpToolConfig,
        ctx: &ExecutorContext,
        sensitive: &Option<&SensitiveDataConfig>,
    ) -> Result<(Vec<ToolFrame>, bool)> {
        let response = self.send_with_retry(request).await?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| EngineError::ToolTransport {
                tool_name: "http".into(),
                message: e.to_string(),
            })?;

        let value: Value = serde_json::from_str(&text).unwrap_or(Value::String(text));
        let masked = match sensitive {
            Some(cfg) => ctx.sensitive.process_tool_response(&value, cfg),
            None => value,
        };

        let is_error = !status.is_success();
        Ok((
            vec![ToolFrame::Output {
                kind: "http".into(),
                data: masked,
            }],
            is_error,
        ))
    }

    /// Stream line-by-line without masking: a streamed HTTP tool response is
    /// forwarded to the caller live, so there is no point to recover
    /// placeholders against before the caller has even seen the value.
    async fn invoke_streaming(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<(Vec<ToolFrame>, bool)> {
        let response = self.send_with_retry(request).await?;
        let status = response.status();
        let mut response = response;
        let mut buffer = String::new();
        let mut frames = Vec::new();

        loop {
            match response.chunk().await {
                Ok(Some(bytes)) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));
                    while let Some(pos) = buffer.find('\n') {
                        let line: String = buffer.drain(..=pos).collect();
                        let line = line.trim();
                        if !line.is_empty() {
                            frames.push(ToolFrame::Output {
                                kind: "http_stream".into(),
                                data: Value::String(line.to_string()),
                            });
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    return Err(EngineError::ToolTransport {
                        tool_name: "http".into(),
                        message: e.to_string(),
                    })
                }
            }
        }
        if !buffer.trim().is_empty() {
            frames.push(ToolFrame::Output {
                kind: "http_stream".into(),
                data: Value::String(buffer.trim().to_string()),
            });
        }
        frames.push(ToolFrame::Finish);
        Ok((frames, !status.is_success()))
    }

    /// Retry only transport-class failures (connect/timeout); an HTTP
    /// response that simply carries an error status is returned as-is for
    /// the caller to interpret, not retried.
    async fn send_with_retry(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let Some(cloned) = request.try_clone() else {
                return request.send().await.map_err(|e| EngineError::ToolTransport {
                    tool_name: "http".into(),
                    message: e.to_string(),
                });
            };
            match cloned.send().await {
                Ok(response) => return Ok(response),
                Err(e) if attempt >= MAX_ATTEMPTS => {
                    return Err(if e.is_timeout() {
                        EngineError::ToolTimeout {
                            tool_name: "http".into(),
                        }
                    } else {
                        EngineError::ToolTransport {
                            tool_name: "http".into(),
                            message: e.to_string(),
                        }
                    })
                }
                Err(_) => {
                    let delay = backoff_for(attempt);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

impl Default for HttpToolInvoker {
    fn default() -> Self {
        Self::new()
    }
}

fn backoff_for(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
    exp.min(BACKOFF_CAP)
}

/// Pull one of the four nested buckets (`header`/`query`/`path`/`body`) out
/// of a recovered api-shape parameter object, defaulting to an empty object
/// rather than `null` so downstream default-filling can always treat it as a
/// map.
fn bucket_or_empty(params: &Value, name: &str) -> Value {
    params
        .get(name)
        .cloned()
        .filter(Value::is_object)
        .unwrap_or_else(|| Value::Object(serde_json::Map::new()))
}

/// Fill missing keys in one bucket from the descriptor's defaults — applied
/// identically to the header, query, and body buckets, each checking
/// presence against its own bucket rather than a flat top-level object.
fn fill_bucket_defaults(bucket: &mut Value, keys: &[String], defaults: &HashMap<String, Value>) {
    if defaults.is_empty() {
        return;
    }
    let Some(obj) = bucket.as_object_mut() else {
        return;
    };
    for key in keys {
        if obj.contains_key(key) {
            continue;
        }
        if let Some(default) = defaults.get(key) {
            obj.insert(key.clone(), default.clone());
        }
    }
}

fn build_url(config: &HttpToolConfig, path_params: &Value) -> Result<String> {
    let mut path = config.path.clone();
    if let Some(obj) = path_params.as_object() {
        for (k, v) in obj {
            let token = format!("{{{k}}}");
            let rendered = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            path = path.replace(&token, &rendered);
        }
    }
    Ok(format!(
        "{}/{}",
        config.origin.trim_end_matches('/'),
        path.trim_start_matches('/')
    ))
}

fn apply_headers(mut request: reqwest::RequestBuilder, header_bucket: &Value) -> reqwest::RequestBuilder {
    if let Some(obj) = header_bucket.as_object() {
        for (k, v) in obj {
            let value = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            request = request.header(k, value);
        }
    }
    request
}

fn apply_query(mut request: reqwest::RequestBuilder, query_bucket: &Value) -> reqwest::RequestBuilder {
    if let Some(obj) = query_bucket.as_object() {
        if !obj.is_empty() {
            request = request.query(&obj.iter().collect::<Vec<_>>());
        }
    }
    request
}

fn apply_auth(mut request: reqwest::RequestBuilder, config: &HttpToolConfig) -> reqwest::RequestBuilder {
    if let Some(auth) = &config.auth_config {
        request = match auth.location {
            ToolAuthLocation::Header => request.header(&auth.key, &auth.value),
            ToolAuthLocation::Query => request.query(&[(&auth.key, &auth.value)]),
        };
    }
    request
}
