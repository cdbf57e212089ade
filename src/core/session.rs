//! Owns one conversation's message list and drives the auto-send loop.
//!
//! A turn is: invoke the transport, fold the resulting chunk stream to
//! completion, then decide whether a follow-up must go out without user
//! input. The follow-up only ever starts after the previous stream's end was
//! observed, and a short settle delay keeps the loop from spinning tightly
//! on a state transition.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::ApprovalReply;
use crate::chunklog::{ChunkLogger, LogDirection};
use crate::core::message::Message;
use crate::core::reconciler::{
    apply_chunk_scoped, inject_local_output, respond_to_approval, send_automatically_when,
};
use crate::core::tools::LocalExecutorRegistry;
use crate::transport::{Transport, TransportError, TransportEvent};

pub const AUTO_SEND_SETTLE_DELAY: Duration = Duration::from_millis(50);

pub struct TurnSession {
    messages: Vec<Message>,
    transport: Box<dyn Transport>,
    executors: LocalExecutorRegistry,
    logger: Option<ChunkLogger>,
    settle_delay: Duration,
    pending_local_flush: bool,
    cancel: CancellationToken,
    requests_sent: u64,
}

impl TurnSession {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            messages: Vec::new(),
            transport,
            executors: LocalExecutorRegistry::new(),
            logger: None,
            settle_delay: AUTO_SEND_SETTLE_DELAY,
            pending_local_flush: false,
            cancel: CancellationToken::new(),
            requests_sent: 0,
        }
    }

    pub fn with_logger(mut self, logger: ChunkLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn requests_sent(&self) -> u64 {
        self.requests_sent
    }

    pub fn executors_mut(&mut self) -> &mut LocalExecutorRegistry {
        &mut self.executors
    }

    pub fn logger(&self) -> Option<&ChunkLogger> {
        self.logger.as_ref()
    }

    pub fn logger_mut(&mut self) -> Option<&mut ChunkLogger> {
        self.logger.as_mut()
    }

    /// Token a caller can use to interrupt the in-flight stream. Partial
    /// state stays visible; nothing is rolled back.
    pub fn interrupt_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Swap the backing transport. Any in-flight stream is cancelled and its
    /// remaining chunks are discarded rather than merged.
    pub fn set_transport(&mut self, transport: Box<dyn Transport>) {
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        self.transport = transport;
    }

    /// Replace the whole history (the only way messages are ever deleted).
    pub fn replace_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.pending_local_flush = false;
    }

    /// Append a user message and run turns until no automatic follow-up is
    /// due.
    pub async fn submit(&mut self, text: impl Into<String>) -> Result<(), TransportError> {
        self.messages.push(Message::user(text));
        self.run_single_turn().await?;
        self.drive_auto_send().await
    }

    /// Record the user's approval decision, run a registered local executor
    /// for the gated tool if there is one, and forward the outcome. The
    /// reply is keyed by the approval id, never the tool-call id.
    pub async fn respond_to_approval(
        &mut self,
        reply: ApprovalReply,
    ) -> Result<bool, TransportError> {
        let ApprovalReply {
            id,
            approved,
            reason,
        } = reply;
        let Some(gated) = respond_to_approval(&mut self.messages, &id, approved, reason) else {
            debug!(approval_id = %id, "No pending approval matches this id");
            return Ok(false);
        };

        if approved {
            if let Some(result) = self.executors.run(&gated.tool_name, &gated.input) {
                if inject_local_output(&mut self.messages, &gated.tool_call_id, result) {
                    // The locally produced result must be flushed back to the
                    // backend exactly once.
                    self.pending_local_flush = true;
                }
            }
        }

        self.drive_auto_send().await?;
        Ok(true)
    }

    async fn drive_auto_send(&mut self) -> Result<(), TransportError> {
        while self.should_auto_send() {
            tokio::time::sleep(self.settle_delay).await;
            self.run_single_turn().await?;
        }
        Ok(())
    }

    /// Predicate evaluation is defensive: a panic maps to `false`, because a
    /// crash-to-loop failure mode is strictly worse than not auto-sending.
    fn should_auto_send(&mut self) -> bool {
        let flush = std::mem::take(&mut self.pending_local_flush);
        let messages = &self.messages;
        let decision = catch_unwind(AssertUnwindSafe(|| send_automatically_when(messages)))
            .unwrap_or_else(|_| {
                warn!("Auto-send predicate panicked; treating as no-send");
                false
            });
        decision || flush
    }

    async fn run_single_turn(&mut self) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }
        let cancel = self.cancel.clone();
        self.requests_sent += 1;
        let mut stream = self.transport.send_messages(&self.messages).await?;
        let location = self.transport.kind().as_str();
        // Chunks without an explicit message id all land in this turn's
        // assistant message, never in one from an earlier turn.
        let turn_message_id = uuid::Uuid::new_v4().to_string();

        loop {
            let event = tokio::select! {
                event = stream.recv() => event,
                _ = cancel.cancelled() => {
                    debug!("Stream interrupted; keeping partial state");
                    return Ok(());
                }
            };
            match event {
                Some(TransportEvent::Chunk(chunk)) => {
                    if let Some(logger) = self.logger.as_mut() {
                        logger.record(location, LogDirection::Inbound, &chunk);
                    }
                    apply_chunk_scoped(&mut self.messages, chunk, Some(&turn_message_id));
                }
                Some(TransportEvent::Error(message)) => {
                    return Err(TransportError::Stream(message));
                }
                Some(TransportEvent::End) | None => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Chunk;
    use crate::core::message::{Part, Role, ToolState};
    use crate::transport::{ChunkStream, TransportKind};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Plays back one scripted chunk stream per invocation.
    struct ScriptedTransport {
        scripts: Mutex<VecDeque<Vec<TransportEvent>>>,
    }

    impl ScriptedTransport {
        fn new(scripts: Vec<Vec<Chunk>>) -> Self {
            let scripts = scripts
                .into_iter()
                .map(|chunks| {
                    let mut events: Vec<TransportEvent> =
                        chunks.into_iter().map(TransportEvent::Chunk).collect();
                    events.push(TransportEvent::End);
                    events
                })
                .collect();
            Self {
                scripts: Mutex::new(scripts),
            }
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send_messages(
            &self,
            _messages: &[Message],
        ) -> Result<ChunkStream, TransportError> {
            let events = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| TransportError::Connect("script exhausted".into()))?;
            Ok(ChunkStream::from_events(events))
        }

        fn kind(&self) -> TransportKind {
            TransportKind::Direct
        }
    }

    fn session_with(scripts: Vec<Vec<Chunk>>) -> TurnSession {
        TurnSession::new(Box::new(ScriptedTransport::new(scripts)))
            .with_settle_delay(Duration::ZERO)
    }

    fn reply(id: &str, approved: bool, reason: Option<&str>) -> ApprovalReply {
        ApprovalReply {
            id: id.into(),
            approved,
            reason: reason.map(str::to_string),
        }
    }

    fn approval_turn() -> Vec<Chunk> {
        vec![
            Chunk::ToolInputAvailable {
                tool_call_id: "T1".into(),
                tool_name: "transfer".into(),
                input: json!({"amount": 30}),
            },
            Chunk::ToolApprovalRequest {
                tool_call_id: "T1".into(),
                tool_name: Some("transfer".into()),
                approval_id: "A1".into(),
                original_tool_call_id: None,
                reason: Some("moves money".into()),
            },
            Chunk::Finish { usage: None },
        ]
    }

    #[tokio::test]
    async fn simple_approve_takes_at_most_two_requests() {
        let mut session = session_with(vec![
            approval_turn(),
            vec![
                Chunk::ToolOutputAvailable {
                    tool_call_id: "T1".into(),
                    output: json!({"ok": true}),
                },
                Chunk::TextDelta {
                    message_id: None,
                    delta: "Transfer completed.".into(),
                },
                Chunk::Finish { usage: None },
            ],
        ]);

        session.submit("transfer $30").await.unwrap();
        assert_eq!(session.requests_sent(), 1);

        let responded = session
            .respond_to_approval(reply("A1", true, None))
            .await
            .unwrap();
        assert!(responded);
        assert_eq!(session.requests_sent(), 2);

        let last = session.messages().last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert!(last.text().contains("completed"));
    }

    #[tokio::test]
    async fn deny_then_a_new_request_works_normally() {
        let mut session = session_with(vec![
            approval_turn(),
            vec![
                Chunk::TextDelta {
                    message_id: None,
                    delta: "Okay, I won't do that.".into(),
                },
                Chunk::Finish { usage: None },
            ],
            vec![
                Chunk::TextDelta {
                    message_id: None,
                    delta: "Sure - here's a haiku.".into(),
                },
                Chunk::Finish { usage: None },
            ],
        ]);

        session.submit("transfer $30").await.unwrap();
        session
            .respond_to_approval(reply("A1", false, Some("changed my mind")))
            .await
            .unwrap();
        assert_eq!(session.requests_sent(), 2);
        assert!(session
            .messages()
            .last()
            .unwrap()
            .text()
            .contains("won't do that"));

        session.submit("write a haiku").await.unwrap();
        assert_eq!(session.requests_sent(), 3);
        assert!(session.messages().last().unwrap().text().contains("haiku"));
    }

    #[tokio::test]
    async fn frontend_execute_flushes_the_local_result_once() {
        let mut session = session_with(vec![
            vec![
                Chunk::ToolInputAvailable {
                    tool_call_id: "T1".into(),
                    tool_name: "add".into(),
                    input: json!({"a": 2, "b": 3}),
                },
                Chunk::ToolApprovalRequest {
                    tool_call_id: "C1".into(),
                    tool_name: Some("confirmation".into()),
                    approval_id: "A1".into(),
                    original_tool_call_id: Some("T1".into()),
                    reason: None,
                },
                Chunk::Finish { usage: None },
            ],
            vec![
                Chunk::TextDelta {
                    message_id: None,
                    delta: "2 + 3 = 5.".into(),
                },
                Chunk::Finish { usage: None },
            ],
        ]);
        session.executors_mut().register("add", |input| {
            let a = input["a"].as_i64().ok_or("missing a")?;
            let b = input["b"].as_i64().ok_or("missing b")?;
            Ok(json!({"sum": a + b}))
        });

        session.submit("what is 2 + 3, with confirmation").await.unwrap();
        session
            .respond_to_approval(reply("A1", true, None))
            .await
            .unwrap();
        assert_eq!(session.requests_sent(), 2);

        let injected = session.messages()[1]
            .parts
            .iter()
            .filter_map(Part::as_tool)
            .find(|t| t.tool_call_id == "T1")
            .unwrap();
        match &injected.state {
            ToolState::OutputAvailable {
                output,
                provider_executed,
                ..
            } => {
                assert_eq!(output["sum"], 5);
                assert!(!provider_executed);
            }
            other => panic!("unexpected state: {other:?}"),
        }
    }

    #[tokio::test]
    async fn zero_chunk_stream_is_handled() {
        let mut session = session_with(vec![vec![]]);
        session.submit("hello?").await.unwrap();
        assert_eq!(session.requests_sent(), 1);
        assert_eq!(session.messages().len(), 1);
    }

    #[tokio::test]
    async fn transport_error_keeps_accumulated_messages() {
        let mut session = TurnSession::new(Box::new(ScriptedTransport::new(vec![])))
            .with_settle_delay(Duration::ZERO);
        let err = session.submit("hi").await.unwrap_err();
        assert!(matches!(err, TransportError::Connect(_)));
        assert_eq!(session.messages().len(), 1);
        assert_eq!(session.messages()[0].text(), "hi");
    }

    #[tokio::test]
    async fn stream_error_surfaces_without_corrupting_the_list() {
        let events = vec![
            TransportEvent::Chunk(Chunk::TextDelta {
                message_id: None,
                delta: "partial".into(),
            }),
            TransportEvent::Error("boom".into()),
        ];
        let transport = ScriptedTransport {
            scripts: Mutex::new(VecDeque::from(vec![events])),
        };
        let mut session =
            TurnSession::new(Box::new(transport)).with_settle_delay(Duration::ZERO);

        let err = session.submit("hi").await.unwrap_err();
        assert!(matches!(err, TransportError::Stream(_)));
        // Partial assistant text remains visible.
        assert_eq!(session.messages().len(), 2);
        assert_eq!(session.messages()[1].text(), "partial");
    }

    #[tokio::test]
    async fn unknown_approval_id_sends_nothing() {
        let mut session = session_with(vec![approval_turn()]);
        session.submit("transfer $30").await.unwrap();
        let responded = session
            .respond_to_approval(reply("A9", true, None))
            .await
            .unwrap();
        assert!(!responded);
        assert_eq!(session.requests_sent(), 1);
    }

    #[tokio::test]
    async fn logger_captures_inbound_chunks_per_location() {
        let mut logger = ChunkLogger::new("s1", "direct");
        logger.start();
        let mut session = session_with(vec![vec![
            Chunk::TextDelta {
                message_id: None,
                delta: "hi".into(),
            },
            Chunk::Finish { usage: None },
        ]])
        .with_logger(logger);

        session.submit("hello").await.unwrap();
        let records = session.logger().unwrap().records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].location, "direct");
        assert_eq!(records[0].sequence_number, 1);
        assert_eq!(records[1].sequence_number, 2);
    }
}
