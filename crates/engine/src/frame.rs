//! Event Envelope — the tagged-union output frame the executor emits, and
//! its SSE serialization.
//!
//! Replaces the source's abstract output-class hierarchy with a single
//! `FrameKind` enum, per the redesign noted for this loop: serialization is
//! a pure function of the tag, there is no inheritance to dispatch through.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FrameKind {
    Status {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool: Option<String>,
    },
    Think {
        text: String,
    },
    Message {
        text: String,
    },
    Tool {
        name: String,
        data: serde_json::Value,
    },
    Wallet(WalletPayload),
    Error {
        message: String,
    },
    /// Terminator. Always the last frame on the channel, on every exit path.
    Finish {
        text: String,
    },
}

/// Wallet tool output — ported from the source's dedicated wallet tool
/// frame. Mostly a passthrough shape; this engine has no wallet domain logic
/// of its own, only the frame contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletPayload {
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(default)]
    pub extra: serde_json::Value,
}

impl FrameKind {
    /// The SSE `event:` name for this frame.
    pub fn event_name(&self) -> &'static str {
        match self {
            FrameKind::Status { .. } => "status",
            FrameKind::Think { .. } => "think",
            FrameKind::Message { .. } => "message",
            FrameKind::Tool { .. } => "tool",
            FrameKind::Wallet(_) => "wallet",
            FrameKind::Error { .. } => "error",
            FrameKind::Finish { .. } => "message",
        }
    }

    /// Render as `event: <kind>\ndata: <json>\n\n`.
    pub fn to_sse(&self) -> String {
        let data = serde_json::to_string(self).unwrap_or_default();
        format!("event: {}\ndata: {data}\n\n", self.event_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_format_matches_event_data_shape() {
        let frame = FrameKind::Think { text: "reason".into() };
        let sse = frame.to_sse();
        assert!(sse.starts_with("event: think\n"));
        assert!(sse.ends_with("\n\n"));
        assert!(sse.contains(r#""text":"reason""#));
    }

    #[test]
    fn finish_frame_shares_message_event_name() {
        let frame = FrameKind::Finish { text: "done".into() };
        assert_eq!(frame.event_name(), "message");
    }
}
