use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn is_user(self) -> bool {
        self == Role::User
    }

    pub fn is_assistant(self) -> bool {
        self == Role::Assistant
    }
}

impl AsRef<str> for Role {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

/// Token accounting reported by the backend on the `finish` chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<Citation>,
}

/// The confirmation handshake attached to a tool invocation. Its `id` is
/// distinct from the tool-call id it gates and must be treated as opaque.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalResponse {
    pub id: String,
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Lifecycle of one tool invocation. Each variant carries exactly the payload
/// that is legal in that state, so a result without an output (or an approval
/// without a verdict) cannot be constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum ToolState {
    InputStreaming {
        #[serde(default)]
        partial: String,
    },
    InputAvailable {
        input: Value,
    },
    ApprovalRequested {
        input: Value,
        approval: ApprovalRequest,
    },
    ApprovalResponded {
        input: Value,
        approval: ApprovalResponse,
    },
    OutputAvailable {
        input: Value,
        output: Value,
        #[serde(default)]
        provider_executed: bool,
    },
    OutputError {
        input: Value,
        error_text: String,
        #[serde(default)]
        provider_executed: bool,
    },
}

impl ToolState {
    pub fn input(&self) -> Option<&Value> {
        match self {
            ToolState::InputStreaming { .. } => None,
            ToolState::InputAvailable { input }
            | ToolState::ApprovalRequested { input, .. }
            | ToolState::ApprovalResponded { input, .. }
            | ToolState::OutputAvailable { input, .. }
            | ToolState::OutputError { input, .. } => Some(input),
        }
    }

    pub fn is_terminal_output(&self) -> bool {
        matches!(
            self,
            ToolState::OutputAvailable { .. } | ToolState::OutputError { .. }
        )
    }

    /// Terminal output that the backend itself produced and therefore already
    /// knows about. Locally injected results report `false` here.
    pub fn is_provider_terminal(&self) -> bool {
        matches!(
            self,
            ToolState::OutputAvailable {
                provider_executed: true,
                ..
            } | ToolState::OutputError {
                provider_executed: true,
                ..
            }
        )
    }

    pub fn is_confirmation_related(&self) -> bool {
        matches!(
            self,
            ToolState::ApprovalRequested { .. } | ToolState::ApprovalResponded { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool_call_id: String,
    pub tool_name: String,
    /// For synthetic confirmation calls: the id of the invocation this
    /// approval gates. Results are matched against that id, not this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_tool_call_id: Option<String>,
    #[serde(flatten)]
    pub state: ToolState,
}

impl ToolInvocation {
    pub fn new(tool_call_id: impl Into<String>, tool_name: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            original_tool_call_id: None,
            state: ToolState::InputStreaming {
                partial: String::new(),
            },
        }
    }

    /// Attempt a lifecycle transition. Only the forward edges of the tool
    /// state machine are accepted; anything else leaves the invocation
    /// untouched and returns `false`. A responded approval is immutable, and
    /// an unanswered approval request cannot jump straight to an output.
    pub fn advance(&mut self, next: ToolState) -> bool {
        use ToolState::*;
        let legal = matches!(
            (&self.state, &next),
            (InputStreaming { .. }, InputAvailable { .. })
                | (InputStreaming { .. }, ApprovalRequested { .. })
                | (InputAvailable { .. }, ApprovalRequested { .. })
                | (InputAvailable { .. }, OutputAvailable { .. })
                | (InputAvailable { .. }, OutputError { .. })
                | (ApprovalRequested { .. }, ApprovalResponded { .. })
                | (ApprovalResponded { .. }, OutputAvailable { .. })
                | (ApprovalResponded { .. }, OutputError { .. })
        );
        if legal {
            self.state = next;
        }
        legal
    }

    pub fn approval_id(&self) -> Option<&str> {
        match &self.state {
            ToolState::ApprovalRequested { approval, .. } => Some(&approval.id),
            ToolState::ApprovalResponded { approval, .. } => Some(&approval.id),
            _ => None,
        }
    }
}

/// One semantic piece of a message's content. PCM audio payloads are consumed
/// by the audio side channel and never appear here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Part {
    Text {
        text: String,
    },
    File {
        name: String,
        media_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    Image {
        media_type: String,
        data: String,
    },
    Tool(ToolInvocation),
}

impl Part {
    pub fn as_tool(&self) -> Option<&ToolInvocation> {
        match self {
            Part::Tool(tool) => Some(tool),
            _ => None,
        }
    }

    pub fn as_tool_mut(&mut self) -> Option<&mut ToolInvocation> {
        match self {
            Part::Tool(tool) => Some(tool),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub parts: Vec<Part>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role: Role::User,
            parts: vec![Part::Text { text: text.into() }],
            metadata: None,
        }
    }

    pub fn assistant(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::Assistant,
            parts: Vec::new(),
            metadata: None,
        }
    }

    /// Concatenated text runs, for display and logging.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let Part::Text { text } = part {
                out.push_str(text);
            }
        }
        out
    }

    pub fn tools(&self) -> impl Iterator<Item = &ToolInvocation> {
        self.parts.iter().filter_map(Part::as_tool)
    }

    pub fn find_tool_mut(&mut self, tool_call_id: &str) -> Option<&mut ToolInvocation> {
        self.parts
            .iter_mut()
            .filter_map(Part::as_tool_mut)
            .find(|tool| tool.tool_call_id == tool_call_id)
    }

    /// Append a text delta, extending the current run when the last part is
    /// already text so one run never splits into several parts.
    pub fn append_text_delta(&mut self, delta: &str) {
        match self.parts.last_mut() {
            Some(Part::Text { text }) => text.push_str(delta),
            _ => self.parts.push(Part::Text {
                text: delta.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn invocation_in(state: ToolState) -> ToolInvocation {
        let mut tool = ToolInvocation::new("T1", "transfer");
        tool.state = state;
        tool
    }

    #[test]
    fn text_runs_stay_contiguous() {
        let mut msg = Message::assistant("a1");
        msg.append_text_delta("Hel");
        msg.append_text_delta("lo");
        assert_eq!(msg.parts.len(), 1);
        msg.parts.push(Part::Tool(ToolInvocation::new("T1", "calc")));
        msg.append_text_delta(" world");
        assert_eq!(msg.parts.len(), 3);
        assert_eq!(msg.text(), "Hello world");
    }

    #[test]
    fn advance_follows_forward_edges_only() {
        let mut tool = ToolInvocation::new("T1", "transfer");
        assert!(tool.advance(ToolState::InputAvailable {
            input: json!({"amount": 30}),
        }));
        assert!(tool.advance(ToolState::ApprovalRequested {
            input: json!({"amount": 30}),
            approval: ApprovalRequest {
                id: "A1".into(),
                reason: None,
            },
        }));
        // An unanswered request cannot jump straight to an output.
        assert!(!tool.advance(ToolState::OutputAvailable {
            input: json!({"amount": 30}),
            output: json!({"ok": true}),
            provider_executed: true,
        }));
        assert!(tool.advance(ToolState::ApprovalResponded {
            input: json!({"amount": 30}),
            approval: ApprovalResponse {
                id: "A1".into(),
                approved: true,
                reason: None,
            },
        }));
        assert!(tool.advance(ToolState::OutputAvailable {
            input: json!({"amount": 30}),
            output: json!({"ok": true}),
            provider_executed: true,
        }));
    }

    #[test]
    fn responded_approval_is_immutable() {
        let mut tool = invocation_in(ToolState::ApprovalResponded {
            input: json!({}),
            approval: ApprovalResponse {
                id: "A1".into(),
                approved: true,
                reason: None,
            },
        });
        assert!(!tool.advance(ToolState::ApprovalResponded {
            input: json!({}),
            approval: ApprovalResponse {
                id: "A1".into(),
                approved: false,
                reason: None,
            },
        }));
        match &tool.state {
            ToolState::ApprovalResponded { approval, .. } => assert!(approval.approved),
            other => panic!("unexpected state: {other:?}"),
        }
    }

    #[test]
    fn skipping_confirmation_is_legal() {
        let mut tool = invocation_in(ToolState::InputAvailable { input: json!({}) });
        assert!(tool.advance(ToolState::OutputError {
            input: json!({}),
            error_text: "boom".into(),
            provider_executed: true,
        }));
        assert!(tool.state.is_terminal_output());
    }

    #[test]
    fn file_and_image_parts_round_trip() {
        let parts = vec![
            Part::File {
                name: "notes.pdf".into(),
                media_type: "application/pdf".into(),
                url: None,
            },
            Part::Image {
                media_type: "image/png".into(),
                data: "aGk=".into(),
            },
        ];
        let value = serde_json::to_value(&parts).unwrap();
        assert_eq!(value[0]["type"], "file");
        assert_eq!(value[1]["type"], "image");
        let back: Vec<Part> = serde_json::from_value(value).unwrap();
        assert_eq!(back, parts);
    }

    #[test]
    fn tool_state_tags_are_kebab_case() {
        let tool = invocation_in(ToolState::InputAvailable {
            input: json!({"city": "Paris"}),
        });
        let value = serde_json::to_value(&tool).unwrap();
        assert_eq!(value["state"], "input-available");
        assert_eq!(value["tool_call_id"], "T1");
        assert_eq!(value["input"]["city"], "Paris");
    }
}
