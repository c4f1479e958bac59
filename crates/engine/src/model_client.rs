//! Model Client — wraps an `sa_providers::LlmProvider` stream and folds it
//! through the stream demultiplexer, so the executor sees only two kinds of
//! output: visible text chunks and hidden reasoning chunks, regardless of
//! whether the underlying model expresses reasoning via `<think>` tags in
//! the token stream or via a native `reasoning_content`/`Thinking` channel.
//!
//! Grounded in `sse.rs`'s SSE parsing (reused indirectly through the
//! provider's `chat_stream`) and in `turn.rs`'s event-folding loop that
//! drives a provider stream into the executor's own output channel.

use std::sync::Arc;

use futures_util::{Stream, StreamExt};

use sa_domain::stream::{BoxStream, StreamEvent};
use sa_domain::tool::ToolCall;
use sa_providers::traits::{ChatRequest, LlmProvider};

use crate::demux::{DemuxEvent, StreamDemultiplexer};
use crate::error::{EngineError, Result};

/// One piece of a model turn, folded from the provider's raw token stream.
#[derive(Debug, Clone)]
pub enum ModelChunk {
    Visible(String),
    Think(String),
    ToolCall(ToolCall),
    Done,
}

pub struct ModelClient {
    provider: Arc<dyn LlmProvider>,
}

impl ModelClient {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self { provider }
    }

    /// Stream one model turn as it arrives, demultiplexing `<think>` spans
    /// embedded in the visible token stream and passing through model-native
    /// `Thinking` events as hidden chunks directly (they never enter the
    /// demux window, since they are already known to be reasoning).
    ///
    /// Returns a live stream rather than a buffered `Vec`: the executor needs
    /// to forward each visible/think chunk to its event sink as soon as it is
    /// demultiplexed, not after the whole model turn has finished.
    pub async fn stream_turn(
        &self,
        req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<ModelChunk>>> {
        let provider_stream = self
            .provider
            .chat_stream(req)
            .await
            .map_err(|e| EngineError::ModelTransport(e.to_string()))?;

        Ok(Box::pin(fold_provider_stream(provider_stream)))
    }

    /// Non-streaming request, used by the `Prompt` execution mode which
    /// needs no incremental delivery.
    pub async fn complete(&self, req: &ChatRequest) -> Result<String> {
        let response = self
            .provider
            .chat(req)
            .await
            .map_err(|e| EngineError::ModelTransport(e.to_string()))?;
        Ok(response.content)
    }
}

/// Fold a provider's raw token stream into `ModelChunk`s, yielding each as
/// soon as the demultiplexer resolves it instead of waiting for the whole
/// turn to finish.
fn fold_provider_stream(
    mut provider_stream: BoxStream<'static, Result<StreamEvent, sa_domain::Error>>,
) -> impl Stream<Item = Result<ModelChunk>> {
    async_stream::stream! {
        let mut demux = StreamDemultiplexer::default();
        let mut finished_cleanly = false;

        while let Some(event) = provider_stream.next().await {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    yield Err(EngineError::ModelTransport(e.to_string()));
                    return;
                }
            };
            match event {
                StreamEvent::Token { text } => {
                    for ev in demux.feed_str(&text) {
                        yield Ok(demux_to_chunk(ev));
                    }
                }
                StreamEvent::Thinking { text } => {
                    yield Ok(ModelChunk::Think(text));
                }
                StreamEvent::ToolCallFinished { call_id, tool_name, arguments } => {
                    yield Ok(ModelChunk::ToolCall(ToolCall { call_id, tool_name, arguments }));
                }
                StreamEvent::ToolCallStarted { .. } | StreamEvent::ToolCallDelta { .. } => {}
                StreamEvent::Error { message } => {
                    yield Err(EngineError::ModelTransport(message));
                    return;
                }
                StreamEvent::Done { .. } => {
                    let (visible, think) = demux.drain();
                    if let Some(text) = visible {
                        yield Ok(ModelChunk::Visible(text));
                    }
                    if let Some(text) = think {
                        yield Ok(ModelChunk::Think(text));
                    }
                    yield Ok(ModelChunk::Done);
                    finished_cleanly = true;
                }
            }
        }

        if !finished_cleanly {
            let (visible, think) = demux.drain();
            if let Some(text) = visible {
                yield Ok(ModelChunk::Visible(text));
            }
            if let Some(text) = think {
                yield Ok(ModelChunk::Think(text));
            }
            yield Ok(ModelChunk::Done);
        }
    }
}

fn demux_to_chunk(event: DemuxEvent) -> ModelChunk {
    match event {
        DemuxEvent::Visible(text) => ModelChunk::Visible(text),
        DemuxEvent::Think(text) => ModelChunk::Think(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demux_to_chunk_preserves_kind() {
        assert!(matches!(
            demux_to_chunk(DemuxEvent::Visible("a".into())),
            ModelChunk::Visible(_)
        ));
        assert!(matches!(
            demux_to_chunk(DemuxEvent::Think("b".into())),
            ModelChunk::Think(_)
        ));
    }
}
