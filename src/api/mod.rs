use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::message::{Message, Usage};

/// One unit of the transport-level streaming protocol. Every adapter
/// normalizes its wire format into this union before anything downstream
/// sees it; chunks are ephemeral and never stored past the reconciliation
/// pass except when captured by the chunk log.
///
/// The `[DONE]` sentinel is a line-level marker handled by the receiver and
/// deliberately has no variant here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Chunk {
    #[serde(rename_all = "camelCase")]
    TextDelta {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        delta: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolInputStart {
        tool_call_id: String,
        tool_name: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolInputDelta {
        tool_call_id: String,
        input_text_delta: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolInputAvailable {
        tool_call_id: String,
        tool_name: String,
        input: Value,
    },
    #[serde(rename_all = "camelCase")]
    ToolApprovalRequest {
        tool_call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
        approval_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        original_tool_call_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ToolOutputAvailable {
        tool_call_id: String,
        output: Value,
    },
    #[serde(rename_all = "camelCase")]
    ToolOutputError {
        tool_call_id: String,
        error_text: String,
    },
    /// Base64-encoded 16-bit PCM frames; diverted to the audio side channel
    /// by the receiver and never forwarded to the reconciler.
    DataPcm { data: String },
    Finish {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
    Ping { timestamp: u64 },
    Pong { timestamp: u64 },
}

impl Chunk {
    pub fn type_name(&self) -> &'static str {
        match self {
            Chunk::TextDelta { .. } => "text-delta",
            Chunk::ToolInputStart { .. } => "tool-input-start",
            Chunk::ToolInputDelta { .. } => "tool-input-delta",
            Chunk::ToolInputAvailable { .. } => "tool-input-available",
            Chunk::ToolApprovalRequest { .. } => "tool-approval-request",
            Chunk::ToolOutputAvailable { .. } => "tool-output-available",
            Chunk::ToolOutputError { .. } => "tool-output-error",
            Chunk::DataPcm { .. } => "data-pcm",
            Chunk::Finish { .. } => "finish",
            Chunk::Ping { .. } => "ping",
            Chunk::Pong { .. } => "pong",
        }
    }
}

/// The approval decision the client sends back. Always keyed by the approval
/// id, never by the tool-call id it gates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalReply {
    pub id: String,
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Request body for the direct provider endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub stream: bool,
}

/// Request envelope posted to the SSE bridge or framed over the WebSocket
/// bridge; the bridge owns model selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeRequest {
    pub messages: Vec<Message>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chunk_wire_tags_round_trip() {
        let chunk: Chunk = serde_json::from_str(
            r#"{"type":"text-delta","messageId":"a1","delta":"Hi"}"#,
        )
        .unwrap();
        assert_eq!(
            chunk,
            Chunk::TextDelta {
                message_id: Some("a1".into()),
                delta: "Hi".into(),
            }
        );

        let chunk: Chunk = serde_json::from_str(
            r#"{"type":"tool-approval-request","toolCallId":"T1","approvalId":"A1"}"#,
        )
        .unwrap();
        match &chunk {
            Chunk::ToolApprovalRequest {
                tool_call_id,
                approval_id,
                ..
            } => {
                assert_eq!(tool_call_id, "T1");
                assert_eq!(approval_id, "A1");
            }
            other => panic!("unexpected chunk: {other:?}"),
        }
        let round = serde_json::to_value(&chunk).unwrap();
        assert_eq!(round["type"], "tool-approval-request");
        assert_eq!(round["toolCallId"], "T1");
    }

    #[test]
    fn unknown_chunk_type_is_a_parse_error() {
        let parsed = serde_json::from_str::<Chunk>(r#"{"type":"telemetry","n":1}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn finish_usage_is_optional() {
        let chunk: Chunk = serde_json::from_str(r#"{"type":"finish"}"#).unwrap();
        assert_eq!(chunk, Chunk::Finish { usage: None });

        let chunk: Chunk = serde_json::from_value(json!({
            "type": "finish",
            "usage": {"prompt_tokens": 12, "completion_tokens": 34},
        }))
        .unwrap();
        match chunk {
            Chunk::Finish { usage: Some(usage) } => {
                assert_eq!(usage.prompt_tokens, 12);
                assert_eq!(usage.completion_tokens, 34);
            }
            other => panic!("unexpected chunk: {other:?}"),
        }
    }

    #[test]
    fn approval_reply_uses_the_approval_id() {
        let reply = ApprovalReply {
            id: "A1".into(),
            approved: false,
            reason: Some("not today".into()),
        };
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(value, json!({"id": "A1", "approved": false, "reason": "not today"}));
    }
}
