//! Executor — the reason-act loop: render the transcript, call the model,
//! demultiplex its output into visible/think chunks, recognize and dispatch
//! at most one tool invocation per iteration, and repeat until a stop
//! condition fires or the loop bound is hit.
//!
//! Grounded in `crates/gateway/src/runtime/turn.rs`'s `run_turn`/`run_turn_inner`
//! shape — spawn a task, return a channel of output frames, register a
//! cancel token — and in `DeepAgentExecutor.stream()`'s step ordering: add
//! the task to memory, loop generating a response, execute at most one tool
//! call per iteration, check the stop predicate, merge all responses on
//! exit. `ExecMode::DeepThink` is grounded in `DeepThinkingExecutor`, which
//! bypasses the local loop entirely and streams from an external cognitive
//! service instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;

use sa_domain::tool::{Message, ToolDefinition};
use sa_providers::traits::ChatRequest;

use crate::frame::FrameKind;
use crate::memory::{flatten_history, MemoryRecord, MemoryStore, ShortMemory};
use crate::model_client::{ModelChunk, ModelClient};
use crate::sensitive::SensitiveDataProcessor;
use crate::tools::dispatch::{parse_tool_invocation, ExecutorContext, ToolDispatcher, ToolFrame};

/// A safety ceiling applied even in `LoopBound::Auto` mode, so a model that
/// never stops cannot run the executor forever. Mirrors the gateway turn
/// loop's `MAX_TOOL_LOOPS`.
const AUTO_LOOP_SAFETY_CAP: u32 = 25;

const DEEP_THINK_TIMEOUT: Duration = Duration::from_secs(120);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cancellation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A cancellation token that can be checked by the loop. Ported from the
/// gateway's per-session `CancelToken`, unchanged in shape: this crate
/// cannot depend on the gateway, so the gateway re-exports this type rather
/// than keeping its own duplicate.
#[derive(Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How many reason-act iterations an agent may run before it is force-
/// stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopBound {
    Fixed(u32),
    Auto,
}

/// Which execution strategy the agent uses. `Prompt` and `DeepThink` are
/// both single-pass variants that skip the tool-call loop entirely; `ReAct`
/// is the full reason-act loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    ReAct,
    Prompt,
    DeepThink,
}

/// Static configuration for one agent's executor run. Grounded in
/// `DeepAgentExecutor.__init__`'s constructor parameters, re-targeted onto
/// explicit dependency injection (see [`ExecutorDeps`]) instead of
/// constructor-time global wiring.
#[derive(Debug, Clone)]
pub struct AgentExecConfig {
    pub name: String,
    pub mode: ExecMode,
    pub model_ref: Option<String>,
    pub system_prompt: String,
    pub role_settings: String,
    pub tool_prompt: String,
    pub max_loops: LoopBound,
    pub stop_words: Vec<String>,
    pub tools: Vec<ToolDefinition>,
    pub description: String,
    pub retry_attempts: u32,
}

impl Default for AgentExecConfig {
    fn default() -> Self {
        Self {
            name: "assistant".into(),
            mode: ExecMode::ReAct,
            model_ref: None,
            system_prompt: "You are a helpful assistant.".into(),
            role_settings: String::new(),
            tool_prompt: String::new(),
            max_loops: LoopBound::Fixed(1),
            stop_words: Vec::new(),
            tools: Vec::new(),
            description: String::new(),
            retry_attempts: 3,
        }
    }
}

/// Configuration for the `DeepThink` execution mode's external service call.
#[derive(Debug, Clone)]
pub struct DeepThinkConfig {
    pub api_base: String,
    pub api_key: String,
}

/// Explicit handles the executor needs, in place of the module-level/global
/// state the source this loop was distilled from relied on.
pub struct ExecutorDeps {
    pub model_client: Arc<ModelClient>,
    pub dispatcher: Arc<ToolDispatcher>,
    pub memory_store: Arc<dyn MemoryStore>,
    pub sensitive: Arc<SensitiveDataProcessor>,
    pub memory_size: usize,
    pub deep_think: Option<DeepThinkConfig>,
    pub http_client: reqwest::Client,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LoopState
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Mutable state threaded through one executor run's reason-act loop.
#[derive(Debug, Default)]
struct LoopState {
    loop_index: u32,
    should_stop: bool,
    success: bool,
    response_buffer: String,
    all_responses: Vec<String>,
    is_finalized: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Executor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Executor {
    config: AgentExecConfig,
    deps: ExecutorDeps,
}

impl Executor {
    pub fn new(config: AgentExecConfig, deps: ExecutorDeps) -> Self {
        Self { config, deps }
    }

    /// Spawn the executor run and return a channel of output frames. The
    /// channel's final message on every exit path — success, error,
    /// cancellation, or loop-bound exhaustion — is a `FrameKind::Finish`.
    pub fn stream(
        self: Arc<Self>,
        query: String,
        conversation_id: String,
        cancel: CancelToken,
    ) -> mpsc::Receiver<FrameKind> {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            self.run(query, conversation_id, cancel, tx).await;
        });
        rx
    }

    async fn run(
        &self,
        query: String,
        conversation_id: String,
        cancel: CancelToken,
        tx: mpsc::Sender<FrameKind>,
    ) {
        if query.trim().is_empty() {
            let _ = tx
                .send(FrameKind::Error {
                    message: crate::error::EngineError::InvalidInput("query must not be empty".into())
                        .to_string(),
                })
                .await;
            return;
        }

        let mut state = LoopState::default();

        match self.config.mode {
            ExecMode::Prompt => self.run_prompt(&query, &conversation_id, &tx, &mut state).await,
            ExecMode::DeepThink => {
                self.run_deep_think(&query, &conversation_id, &cancel, &tx, &mut state)
                    .await
            }
            ExecMode::ReAct => {
                self.run_react(&query, &conversation_id, &cancel, &tx, &mut state)
                    .await
            }
        }

        self.finalize(&query, &conversation_id, &tx, &mut state).await;
    }

    // ── ReAct mode ───────────────────────────────────────────────

    async fn run_react(
        &self,
        query: &str,
        conversation_id: &str,
        cancel: &CancelToken,
        tx: &mpsc::Sender<FrameKind>,
        state: &mut LoopState,
    ) {
        let _ = tx
            .send(FrameKind::Status {
                message: "task understanding".into(),
                tool: None,
            })
            .await;

        let mut memory = self.build_short_memory(conversation_id, query).await;

        let loop_cap = match self.config.max_loops {
            LoopBound::Fixed(n) => n,
            LoopBound::Auto => AUTO_LOOP_SAFETY_CAP,
        };

        while state.loop_index < loop_cap {
            if cancel.is_cancelled() {
                let _ = tx
                    .send(FrameKind::Error {
                        message: "cancelled".into(),
                    })
                    .await;
                return;
            }

            state.loop_index += 1;
            let transcript = memory.render();

            let Some(response) = self
                .generate_with_retry(&transcript, cancel, tx, state)
                .await
            else {
                // Retries exhausted — stop the loop, nothing further to try.
                break;
            };

            memory.add(self.config.name.clone(), response.clone());
            state.all_responses.push(response.clone());
            state.success = true;

            if self.stop_word_hit(&response) {
                state.should_stop = true;
                break;
            }

            match parse_tool_invocation(&response) {
                Some(invocation) => {
                    let _ = tx
                        .send(FrameKind::Status {
                            message: format!("invoking tool: {}", invocation.name),
                            tool: Some(invocation.name.clone()),
                        })
                        .await;

                    let ctx = ExecutorContext {
                        conversation_id: conversation_id.to_string(),
                        sensitive: self.deps.sensitive.clone(),
                    };
                    let (frames, text, is_error) = self.deps.dispatcher.dispatch(&invocation, &ctx).await;
                    for frame in &frames {
                        if let ToolFrame::Output { kind, data } = frame {
                            let _ = tx
                                .send(FrameKind::Tool {
                                    name: invocation.name.clone(),
                                    data: serde_json::json!({ "kind": kind, "data": data, "error": is_error }),
                                })
                                .await;
                        }
                    }
                    memory.add("tool-result", text);
                }
                // No tool invocation recognized in the model's reply: treat
                // this as the final answer and stop the reason-act loop.
                None => {
                    state.should_stop = true;
                }
            }

            if state.should_stop {
                break;
            }
        }
    }

    /// Up to `retry_attempts` calls to the model for one loop iteration,
    /// streaming visible/think chunks as they demultiplex. Returns the full
    /// visible response text, or `None` if every attempt failed.
    async fn generate_with_retry(
        &self,
        transcript: &str,
        cancel: &CancelToken,
        tx: &mpsc::Sender<FrameKind>,
        state: &mut LoopState,
    ) -> Option<String> {
        let req = ChatRequest {
            messages: vec![Message::user(transcript)],
            tools: self.config.tools.clone(),
            model: self.config.model_ref.clone(),
            ..Default::default()
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            state.response_buffer.clear();

            match self.deps.model_client.stream_turn(&req).await {
                Ok(mut chunks) => {
                    let mut transport_failed = false;
                    while let Some(next) = chunks.next().await {
                        if cancel.is_cancelled() {
                            return None;
                        }
                        match next {
                            Ok(ModelChunk::Visible(text)) => {
                                state.response_buffer.push_str(&text);
                                let _ = tx.send(FrameKind::Message { text }).await;
                            }
                            Ok(ModelChunk::Think(text)) => {
                                let _ = tx.send(FrameKind::Think { text }).await;
                            }
                            Ok(ModelChunk::ToolCall(call)) => {
                                // Native provider-level tool calls are
                                // surfaced the same way a fenced-JSON
                                // invocation in the visible text would be:
                                // appended so the ordinary
                                // parse_tool_invocation path picks it up
                                // downstream.
                                let encoded = serde_json::json!({
                                    "type": "function",
                                    "function": { "name": call.tool_name, "parameters": call.arguments },
                                });
                                state
                                    .response_buffer
                                    .push_str(&format!("\n```json\n{encoded}\n```\n"));
                            }
                            Ok(ModelChunk::Done) => break,
                            Err(_) => {
                                transport_failed = true;
                                break;
                            }
                        }
                    }

                    if !transport_failed {
                        return Some(state.response_buffer.clone());
                    }
                }
                Err(_) => {}
            }

            if attempt >= self.config.retry_attempts {
                return None;
            }
        }
    }

    fn stop_word_hit(&self, response: &str) -> bool {
        !self.config.stop_words.is_empty()
            && self
                .config
                .stop_words
                .iter()
                .any(|w| response.contains(w.as_str()))
    }

    // ── Prompt mode ──────────────────────────────────────────────

    /// Single pass: no tool parsing, no stop predicate, no incremental
    /// delivery — the model is called once and the whole response is
    /// emitted as a single message frame.
    async fn run_prompt(
        &self,
        query: &str,
        conversation_id: &str,
        tx: &mpsc::Sender<FrameKind>,
        state: &mut LoopState,
    ) {
        let memory = self.build_short_memory(conversation_id, query).await;
        let req = ChatRequest {
            messages: vec![Message::user(memory.render())],
            model: self.config.model_ref.clone(),
            ..Default::default()
        };

        match self.deps.model_client.complete(&req).await {
            Ok(text) => {
                let _ = tx
                    .send(FrameKind::Message { text: text.clone() })
                    .await;
                state.all_responses.push(text);
                state.success = true;
            }
            Err(e) => {
                let _ = tx
                    .send(FrameKind::Error {
                        message: e.to_string(),
                    })
                    .await;
            }
        }
        state.loop_index = 1;
    }

    // ── DeepThink mode ───────────────────────────────────────────

    /// Delegates entirely to an external cognitive-processing service.
    /// Memory is read-only in this mode: persistent history is read for
    /// context but the turn's own output is not appended back.
    async fn run_deep_think(
        &self,
        query: &str,
        conversation_id: &str,
        cancel: &CancelToken,
        tx: &mpsc::Sender<FrameKind>,
        state: &mut LoopState,
    ) {
        let Some(deep_think) = &self.deps.deep_think else {
            let _ = tx
                .send(FrameKind::Error {
                    message: "deep-think mode requires a configured cognitive service".into(),
                })
                .await;
            return;
        };

        let history = self.load_history_text(conversation_id).await;
        let prompt = if history.is_empty() {
            query.to_string()
        } else {
            format!("{query}\n\nConversation history:\n{history}")
        };

        let url = format!("{}/p/agent/stream/deep-think", deep_think.api_base.trim_end_matches('/'));
        let response = self
            .deps
            .http_client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("x-api-key", &deep_think.api_key)
            .json(&serde_json::json!({ "q": prompt }))
            .timeout(DEEP_THINK_TIMEOUT)
            .send()
            .await;

        let mut response = match response {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                let _ = tx
                    .send(FrameKind::Error {
                        message: format!("deep-think service responded with {}", r.status()),
                    })
                    .await;
                return;
            }
            Err(e) => {
                let _ = tx
                    .send(FrameKind::Error {
                        message: format!("deep-think request failed: {e}"),
                    })
                    .await;
                return;
            }
        };

        let mut buffer = String::new();
        loop {
            if cancel.is_cancelled() {
                return;
            }
            match response.chunk().await {
                Ok(Some(bytes)) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));
                    while let Some(pos) = buffer.find('\n') {
                        let line: String = buffer.drain(..=pos).collect();
                        if let Some(text) = extract_deep_think_text(line.trim()) {
                            let _ = tx.send(FrameKind::Message { text: text.clone() }).await;
                            state.response_buffer.push_str(&text);
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = tx
                        .send(FrameKind::Error {
                            message: format!("deep-think stream error: {e}"),
                        })
                        .await;
                    break;
                }
            }
        }

        state.success = !state.response_buffer.is_empty();
        if state.success {
            state.all_responses.push(state.response_buffer.clone());
        }
        state.loop_index = 1;
    }

    // ── Shared helpers ───────────────────────────────────────────

    async fn build_short_memory(&self, conversation_id: &str, query: &str) -> ShortMemory {
        let mut memory = ShortMemory::new();
        memory.add("system", self.config.system_prompt.clone());
        if !self.config.tools.is_empty() && !self.config.tool_prompt.is_empty() {
            memory.add("system", self.config.tool_prompt.clone());
        }
        if !self.config.role_settings.is_empty() {
            memory.add("system", self.config.role_settings.clone());
        }

        let history = self.load_history_text(conversation_id).await;
        if !history.is_empty() {
            memory.add("history", history);
        }

        memory.add("user", query.to_string());
        memory
    }

    async fn load_history_text(&self, conversation_id: &str) -> String {
        match self
            .deps
            .memory_store
            .load_recent(conversation_id, self.deps.memory_size)
        {
            Ok(records) => flatten_history(&records),
            Err(e) => {
                tracing::warn!(conversation_id, error = %e, "failed to load persistent memory, continuing without history");
                String::new()
            }
        }
    }

    /// Always runs, on every exit path: persists the turn (except in
    /// `DeepThink` mode, which is memory read-only), clears the sensitive
    /// mapping store, and emits the terminating `Finish` frame.
    async fn finalize(
        &self,
        query: &str,
        conversation_id: &str,
        tx: &mpsc::Sender<FrameKind>,
        state: &mut LoopState,
    ) {
        if state.is_finalized {
            return;
        }
        state.is_finalized = true;

        let final_text = state.all_responses.join("\n\n");

        if self.config.mode != ExecMode::DeepThink && state.success {
            let record = MemoryRecord {
                input: query.to_string(),
                output: final_text.clone(),
                time: chrono::Utc::now(),
                temp_data: Value::Null,
            };
            if let Err(e) = self.deps.memory_store.append(conversation_id, &record) {
                tracing::warn!(conversation_id, error = %e, "failed to persist turn, continuing");
            }
        }

        self.deps.sensitive.clear();

        let _ = tx.send(FrameKind::Finish { text: final_text }).await;
    }
}

/// Parse one SSE `data:` line from the deep-think service and return the
/// visible text, stripping the service's `"Solution: "` prefix and
/// `" Next request."` suffix. Only `role_ai_markdown`-typed payloads carry
/// user-visible text; everything else yields nothing.
fn extract_deep_think_text(line: &str) -> Option<String> {
    let payload = line.strip_prefix("data:")?.trim();
    let value: Value = serde_json::from_str(payload).ok()?;
    if value.get("type")?.as_str()? != "role_ai_markdown" {
        return None;
    }
    let mut text = value.get("text")?.as_str()?.to_string();
    if let Some(stripped) = text.strip_prefix("Solution: ") {
        text = stripped.to_string();
    }
    if let Some(stripped) = text.strip_suffix(" Next request.") {
        text = stripped.to_string();
    }
    Some(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_lifecycle() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn extract_deep_think_text_strips_markers() {
        let line = r#"data: {"type":"role_ai_markdown","text":"Solution: the answer is 42 Next request."}"#;
        assert_eq!(extract_deep_think_text(line).as_deref(), Some("the answer is 42"));
    }

    #[test]
    fn extract_deep_think_text_ignores_other_types() {
        let line = r#"data: {"type":"status","text":"thinking"}"#;
        assert!(extract_deep_think_text(line).is_none());
    }

    #[test]
    fn extract_deep_think_text_ignores_malformed_json() {
        assert!(extract_deep_think_text("data: not json").is_none());
        assert!(extract_deep_think_text("not even a data line").is_none());
    }
}
