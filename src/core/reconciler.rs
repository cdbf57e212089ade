//! Folds protocol chunks into the message list and decides when a follow-up
//! request must be sent without user input.
//!
//! `apply_chunk` mutates text runs in place for streaming efficiency, but the
//! observable result is that of a pure fold: the same chunk sequence always
//! produces the same list. `send_automatically_when` is the predicate that
//! closes the tool-approval loop; a false positive here is an infinite
//! request loop, a false negative is a visibly stalled conversation.

use serde_json::Value;
use tracing::debug;

use crate::api::Chunk;
use crate::core::message::{
    ApprovalRequest, ApprovalResponse, Message, MessageMetadata, Part, Role, ToolInvocation,
    ToolState,
};

/// Apply one chunk to the message list, creating the target assistant message
/// on first reference. Chunks that imply a backward tool transition or refer
/// to an unknown tool call are ignored.
pub fn apply_chunk(messages: &mut Vec<Message>, chunk: Chunk) {
    apply_chunk_scoped(messages, chunk, None)
}

/// Like [`apply_chunk`], but chunks that carry no message id of their own
/// land in the message identified by `default_id`. The turn driver mints a
/// fresh id per response turn so a follow-up never bleeds into the previous
/// turn's assistant message.
pub fn apply_chunk_scoped(messages: &mut Vec<Message>, chunk: Chunk, default_id: Option<&str>) {
    match chunk {
        Chunk::TextDelta { message_id, delta } => {
            if delta.is_empty() {
                return;
            }
            target_assistant(messages, message_id.as_deref().or(default_id))
                .append_text_delta(&delta);
        }
        Chunk::ToolInputStart {
            tool_call_id,
            tool_name,
        } => {
            let msg = target_assistant(messages, default_id);
            if msg.find_tool_mut(&tool_call_id).is_some() {
                return;
            }
            msg.parts
                .push(Part::Tool(ToolInvocation::new(tool_call_id, tool_name)));
        }
        Chunk::ToolInputDelta {
            tool_call_id,
            input_text_delta,
        } => {
            if let Some(tool) = find_tool(messages, &tool_call_id) {
                if let ToolState::InputStreaming { partial } = &mut tool.state {
                    partial.push_str(&input_text_delta);
                }
            }
        }
        Chunk::ToolInputAvailable {
            tool_call_id,
            tool_name,
            input,
        } => {
            if let Some(tool) = find_tool(messages, &tool_call_id) {
                tool.advance(ToolState::InputAvailable { input });
                return;
            }
            let mut tool = ToolInvocation::new(tool_call_id, tool_name);
            tool.state = ToolState::InputAvailable { input };
            target_assistant(messages, default_id)
                .parts
                .push(Part::Tool(tool));
        }
        Chunk::ToolApprovalRequest {
            tool_call_id,
            tool_name,
            approval_id,
            original_tool_call_id,
            reason,
        } => {
            let approval = ApprovalRequest {
                id: approval_id,
                reason,
            };
            if let Some(tool) = find_tool(messages, &tool_call_id) {
                if original_tool_call_id.is_some() {
                    tool.original_tool_call_id = original_tool_call_id;
                }
                let input = tool.state.input().cloned().unwrap_or(Value::Null);
                tool.advance(ToolState::ApprovalRequested { input, approval });
                return;
            }
            // A synthetic confirmation call arrives fully formed.
            let mut tool = ToolInvocation::new(
                tool_call_id,
                tool_name.unwrap_or_else(|| "confirmation".to_string()),
            );
            tool.original_tool_call_id = original_tool_call_id;
            tool.state = ToolState::ApprovalRequested {
                input: Value::Null,
                approval,
            };
            target_assistant(messages, default_id)
                .parts
                .push(Part::Tool(tool));
        }
        Chunk::ToolOutputAvailable {
            tool_call_id,
            output,
        } => {
            if let Some(tool) = find_tool(messages, &tool_call_id) {
                let input = tool.state.input().cloned().unwrap_or(Value::Null);
                tool.advance(ToolState::OutputAvailable {
                    input,
                    output,
                    provider_executed: true,
                });
            } else {
                debug!(tool_call_id = %tool_call_id, "Result for unknown tool call ignored");
            }
        }
        Chunk::ToolOutputError {
            tool_call_id,
            error_text,
        } => {
            if let Some(tool) = find_tool(messages, &tool_call_id) {
                let input = tool.state.input().cloned().unwrap_or(Value::Null);
                tool.advance(ToolState::OutputError {
                    input,
                    error_text,
                    provider_executed: true,
                });
            } else {
                debug!(tool_call_id = %tool_call_id, "Error for unknown tool call ignored");
            }
        }
        Chunk::Finish { usage } => {
            if let Some(usage) = usage {
                if let Some(msg) = last_assistant_mut(messages) {
                    msg.metadata
                        .get_or_insert_with(MessageMetadata::default)
                        .usage = Some(usage);
                }
            }
        }
        // Side-channel and control chunks never reach the message model; the
        // receiver diverts them, so these arms are belt and braces.
        Chunk::DataPcm { .. } | Chunk::Ping { .. } | Chunk::Pong { .. } => {}
    }
}

/// The invocation an approval decision unblocks: either the original tool
/// call a synthetic confirmation referenced, or the approval-carrying call
/// itself.
#[derive(Debug, Clone, PartialEq)]
pub struct GatedCall {
    pub tool_call_id: String,
    pub tool_name: String,
    pub input: Value,
}

/// Record the user's decision for the approval identified by `approval_id`
/// (matched by equality only; the id is opaque). Returns the gated call when
/// a pending request was found and transitioned.
pub fn respond_to_approval(
    messages: &mut [Message],
    approval_id: &str,
    approved: bool,
    reason: Option<String>,
) -> Option<GatedCall> {
    for msg in messages.iter_mut().rev() {
        if !msg.role.is_assistant() {
            continue;
        }
        let Some(idx) = msg.parts.iter().position(|part| {
            matches!(
                part.as_tool().map(|t| &t.state),
                Some(ToolState::ApprovalRequested { approval, .. }) if approval.id == approval_id
            )
        }) else {
            continue;
        };

        let (input, gated_id) = {
            let tool = msg.parts[idx].as_tool_mut().unwrap();
            let input = tool.state.input().cloned().unwrap_or(Value::Null);
            tool.advance(ToolState::ApprovalResponded {
                input: input.clone(),
                approval: ApprovalResponse {
                    id: approval_id.to_string(),
                    approved,
                    reason: reason.clone(),
                },
            });
            let gated_id = tool
                .original_tool_call_id
                .clone()
                .unwrap_or_else(|| tool.tool_call_id.clone());
            (input, gated_id)
        };

        let gated = msg
            .parts
            .iter()
            .filter_map(Part::as_tool)
            .find(|t| t.tool_call_id == gated_id);
        return Some(match gated {
            Some(gated) => GatedCall {
                tool_call_id: gated.tool_call_id.clone(),
                tool_name: gated.tool_name.clone(),
                input: gated.state.input().cloned().unwrap_or(input),
            },
            None => {
                let tool = msg.parts[idx].as_tool().unwrap();
                GatedCall {
                    tool_call_id: tool.tool_call_id.clone(),
                    tool_name: tool.tool_name.clone(),
                    input,
                }
            }
        });
    }
    None
}

/// Inject a locally produced result for `tool_call_id` (Frontend Execute).
/// The output is marked as not provider-executed so the auto-send loop knows
/// it still has to be flushed to the backend.
pub fn inject_local_output(
    messages: &mut [Message],
    tool_call_id: &str,
    result: Result<Value, String>,
) -> bool {
    let Some(tool) = find_tool(messages, tool_call_id) else {
        return false;
    };
    let input = tool.state.input().cloned().unwrap_or(Value::Null);
    let next = match result {
        Ok(output) => ToolState::OutputAvailable {
            input,
            output,
            provider_executed: false,
        },
        Err(error_text) => ToolState::OutputError {
            input,
            error_text,
            provider_executed: false,
        },
    };
    tool.advance(next)
}

/// The auto-send decision, evaluated after every reconciliation step.
///
/// Returns `true` exactly when a freshly answered approval still has to be
/// forwarded to the backend. Unanswered approvals, already-settled approval
/// rounds, and tool failures all hold the turn for the user.
pub fn send_automatically_when(messages: &[Message]) -> bool {
    let Some(last) = messages.last() else {
        return false;
    };
    if !last.role.is_assistant() {
        return false;
    }
    let tools: Vec<&ToolInvocation> = last.tools().collect();

    if !tools.iter().any(|t| t.state.is_confirmation_related()) {
        return false;
    }

    // The critical wait state: sending now would race the user's decision.
    if tools
        .iter()
        .any(|t| matches!(t.state, ToolState::ApprovalRequested { .. }))
    {
        return false;
    }

    // Tool failures are terminal; never auto-retry them.
    if tools
        .iter()
        .any(|t| matches!(t.state, ToolState::OutputError { .. }))
    {
        return false;
    }

    let responded: Vec<&ToolInvocation> = tools
        .iter()
        .copied()
        .filter(|t| matches!(t.state, ToolState::ApprovalResponded { .. }))
        .collect();
    if responded.is_empty() {
        return false;
    }

    // Redundant-resend guard: when the backend has already executed and
    // returned the gated call's result, another send would replay the same
    // approval round forever.
    let gated_ids: Vec<&str> = responded
        .iter()
        .map(|t| {
            t.original_tool_call_id
                .as_deref()
                .unwrap_or(t.tool_call_id.as_str())
        })
        .collect();
    let all_settled = responded.iter().zip(&gated_ids).all(|(t, gated_id)| {
        let gated_done = tools
            .iter()
            .find(|g| g.tool_call_id == **gated_id)
            .is_some_and(|g| g.state.is_provider_terminal());
        t.state.is_provider_terminal() || (t.tool_call_id != **gated_id && gated_done)
    });
    if all_settled {
        return false;
    }

    // A sibling result the backend already produced means this approval
    // round has been handled out from under us.
    let sibling_done = tools.iter().any(|t| {
        t.state.is_provider_terminal() && !gated_ids.contains(&t.tool_call_id.as_str())
    });
    !sibling_done
}

fn target_assistant<'a>(messages: &'a mut Vec<Message>, id: Option<&str>) -> &'a mut Message {
    if let Some(id) = id {
        if let Some(pos) = messages.iter().position(|m| m.id == id) {
            return &mut messages[pos];
        }
        messages.push(Message::assistant(id));
        return messages.last_mut().unwrap();
    }
    let is_assistant = matches!(messages.last(), Some(m) if m.role == Role::Assistant);
    if !is_assistant {
        messages.push(Message::assistant(uuid::Uuid::new_v4().to_string()));
    }
    messages.last_mut().unwrap()
}

fn find_tool<'a>(
    messages: &'a mut [Message],
    tool_call_id: &str,
) -> Option<&'a mut ToolInvocation> {
    for msg in messages.iter_mut().rev() {
        if !msg.role.is_assistant() {
            continue;
        }
        if let Some(tool) = msg.find_tool_mut(tool_call_id) {
            return Some(tool);
        }
    }
    None
}

fn last_assistant_mut(messages: &mut [Message]) -> Option<&mut Message> {
    messages.iter_mut().rev().find(|m| m.role.is_assistant())
}
