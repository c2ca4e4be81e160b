//! Drives one conversation: opens streams, feeds their events through the
//! reducer into the active assistant message, and runs the confirmation
//! sub-protocol between rounds.
//!
//! A session is owned by a single task. Stopping is the only operation that
//! may come from elsewhere, through the shared [`CancellationGovernor`].

use crate::cancel::{CancellationGovernor, StreamHandle};
use crate::client::Transport;
use crate::confirmation::{
    ConfirmationCoordinator, DEFAULT_MAX_CONFIRMATION_ROUNDS, PendingOperation, Resolution,
};
use crate::error::{ProtocolError, SessionError, SessionResult};
use crate::protocol::{ConfirmRequest, Event, QueryRequest, StreamRequest};
use crate::reducer::{Effect, ReducerState};
use crate::stream::EventStream;
use crate::transcript::{ConversationSession, Message, Mode, Query, StreamingState};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub mode: Mode,
    pub model: String,
    pub max_confirmation_rounds: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Ask,
            model: DEFAULT_MODEL.to_string(),
            max_confirmation_rounds: DEFAULT_MAX_CONFIRMATION_ROUNDS,
        }
    }
}

/// How a round ended when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    Completed,
    AwaitingConfirmation(PendingOperation),
    Rejected,
    Cancelled,
}

/// What observers see after every applied event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    pub conversation_id: Option<i64>,
    pub active: Option<Message>,
    pub status: Option<String>,
    pub streaming: StreamingState,
    pub pending: Option<PendingOperation>,
}

pub struct ChatSession<T> {
    transport: T,
    model: String,
    conversation: ConversationSession,
    coordinator: ConfirmationCoordinator,
    governor: CancellationGovernor,
    reducer: Option<ReducerState>,
    updates: watch::Sender<SessionSnapshot>,
}

impl<T: Transport> ChatSession<T> {
    pub fn new(transport: T, config: SessionConfig) -> Self {
        let (updates, _) = watch::channel(SessionSnapshot::default());
        Self {
            transport,
            model: config.model,
            conversation: ConversationSession::new(config.mode),
            coordinator: ConfirmationCoordinator::new(config.max_confirmation_rounds),
            governor: CancellationGovernor::new(),
            reducer: None,
            updates,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn conversation(&self) -> &ConversationSession {
        &self.conversation
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn set_model(&mut self, model: impl Into<String>) {
        self.model = model.into();
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.conversation.mode = mode;
    }

    /// Handle for stopping the in-flight stream from another task.
    pub fn governor(&self) -> CancellationGovernor {
        self.governor.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.updates.subscribe()
    }

    pub fn pending_operation(&self) -> Option<&PendingOperation> {
        self.coordinator.pending()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            conversation_id: self.conversation.id,
            active: self.conversation.active_message().cloned(),
            status: self
                .reducer
                .as_ref()
                .and_then(|reducer| reducer.status().map(str::to_string)),
            streaming: self.conversation.streaming,
            pending: self.coordinator.pending().cloned(),
        }
    }

    /// Sends a user query on the endpoint selected by the conversation mode.
    pub async fn send(&mut self, query: Query) -> SessionResult<RoundOutcome> {
        if self.coordinator.is_awaiting() {
            return Err(ProtocolError::ConfirmationPending.into());
        }
        self.coordinator.reset();
        self.conversation.release_active();
        self.conversation.push_user(&query);
        self.reducer = Some(ReducerState::new(self.conversation.mode, self.model.as_str()));

        let body = QueryRequest {
            query: query.text,
            conversation_id: self.conversation.id,
            model: self.model.clone(),
            selected_tables: query.selected_tables,
            attachments: query.attachments,
        };
        let request = match self.conversation.mode {
            Mode::Ask => StreamRequest::Ask(body),
            Mode::Agent => StreamRequest::Agent(body),
        };
        info!(mode = ?self.conversation.mode, "sending query");
        self.run_round(request).await
    }

    /// Approves or rejects the operation awaiting confirmation.
    pub async fn resolve(&mut self, confirmed: bool) -> SessionResult<RoundOutcome> {
        let resolution = match self.coordinator.resolve(confirmed) {
            Ok(resolution) => resolution,
            Err(err) => return Err(self.fail_detached(err.into())),
        };
        self.governor.set_awaiting_confirmation(false);

        match resolution {
            Resolution::Reject(op) => {
                info!(operation = %op.operation, "operation rejected");
                if let Some(conversation_id) = self.conversation.id {
                    self.notify_rejection(op.confirm_request(conversation_id, false))
                        .await;
                }
                self.reducer_mut().apply(&Event::Cancelled { message: None });
                self.sync_message();
                self.conversation.streaming = StreamingState::Idle;
                self.publish();
                Ok(RoundOutcome::Rejected)
            }
            Resolution::Execute(op) => {
                let Some(conversation_id) = self.conversation.id else {
                    return Err(self.fail(ProtocolError::MissingConversation.into()));
                };
                info!(operation = %op.operation, "operation approved");
                let reducer = self.reducer_mut();
                reducer.retire_directive();
                reducer.note_operation(&op.operation);
                self.sync_message();
                self.run_round(StreamRequest::Confirm(op.confirm_request(conversation_id, true)))
                    .await
            }
        }
    }

    async fn notify_rejection(&self, request: ConfirmRequest) {
        match self.transport.open(StreamRequest::Confirm(request)).await {
            Ok(_) => debug!("backend notified of rejection"),
            Err(err) => warn!(error = %err, "failed to notify backend of rejection"),
        }
    }

    async fn run_round(&mut self, request: StreamRequest) -> SessionResult<RoundOutcome> {
        let handle = self.governor.open_round();
        self.reducer_mut().begin_round();
        self.conversation.streaming = StreamingState::Streaming {
            round: handle.round(),
        };
        self.publish();
        debug!(round = handle.round(), path = request.path(), "opening round");

        let token = handle.token();
        let opened = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            result = self.transport.open(request) => Some(result),
        };
        let bytes = match opened {
            None => return Ok(self.cancelled(&handle)),
            Some(Err(err)) => {
                self.governor.close_round(&handle);
                return Err(self.fail(err));
            }
            Some(Ok(bytes)) => bytes,
        };

        let mut events = EventStream::new(bytes, token);
        loop {
            let next = events.next().await;
            if handle.is_cancelled() {
                return Ok(self.cancelled(&handle));
            }

            let envelope = match next {
                Some(Ok(envelope)) => envelope,
                Some(Err(err)) => {
                    self.governor.close_round(&handle);
                    return Err(self.fail(err));
                }
                None => {
                    self.governor.close_round(&handle);
                    if self.coordinator.is_awaiting() {
                        return Ok(self.await_decision());
                    }
                    return Err(
                        self.fail(SessionError::Stream("stream ended before done".to_string()))
                    );
                }
            };

            match self.reducer_mut().apply_envelope(&envelope) {
                Effect::Unchanged => continue,
                Effect::ContentUpdated | Effect::StatusUpdated => {}
                Effect::ConfirmationRequested(op) => {
                    if let Err(err) = self.coordinator.request(op) {
                        self.governor.close_round(&handle);
                        return Err(self.fail(err.into()));
                    }
                }
                Effect::ConfirmationWithdrawn => {
                    if self.coordinator.is_awaiting() {
                        self.coordinator.reset();
                    }
                }
                Effect::Failed(message) => {
                    self.governor.close_round(&handle);
                    return Err(self.fail(SessionError::Backend(message)));
                }
                Effect::Finished(info) => {
                    self.governor.close_round(&handle);
                    if self.conversation.adopt_id(info.conversation_id) {
                        info!(conversation_id = ?info.conversation_id, "conversation id assigned");
                    }
                    self.sync_message();
                    if let Some(reducer) = &self.reducer {
                        debug!(
                            round = handle.round(),
                            skipped = reducer.skipped_duplicates(),
                            "round finished"
                        );
                    }
                    if self.coordinator.is_awaiting() {
                        return Ok(self.await_decision());
                    }
                    if let Some(op) = self.coordinator.finish_round() {
                        debug!(operation = %op.operation, "confirmed operation finished");
                    }
                    self.conversation.streaming = StreamingState::Idle;
                    self.publish();
                    return Ok(RoundOutcome::Completed);
                }
            }
            self.sync_message();
            self.publish();
        }
    }

    fn await_decision(&mut self) -> RoundOutcome {
        self.governor.set_awaiting_confirmation(true);
        self.conversation.streaming = StreamingState::AwaitingConfirmation;
        self.publish();
        match self.coordinator.pending() {
            Some(op) => RoundOutcome::AwaitingConfirmation(op.clone()),
            None => RoundOutcome::Completed,
        }
    }

    /// Leaves the message exactly as it was when the stream was stopped.
    fn cancelled(&mut self, handle: &StreamHandle) -> RoundOutcome {
        info!(round = handle.round(), "round cancelled");
        self.governor.close_round(handle);
        if let Some(op) = self.coordinator.pending().filter(|_| self.coordinator.is_awaiting()) {
            warn!(
                operation = %op.operation,
                "stream stopped after a confirmation request; the request is dropped"
            );
        }
        self.coordinator.reset();
        if let Some(reducer) = self.reducer.as_mut() {
            reducer.clear_status();
        }
        self.conversation.streaming = StreamingState::Idle;
        self.publish();
        RoundOutcome::Cancelled
    }

    /// Records `err` as the trailing error entry of the active message.
    fn fail(&mut self, err: SessionError) -> SessionError {
        warn!(error = %err, "round failed");
        self.coordinator.reset();
        self.governor.set_awaiting_confirmation(false);
        self.reducer_mut().record_error(&err.to_string());
        self.sync_message();
        self.conversation.streaming = StreamingState::Idle;
        self.publish();
        err
    }

    /// Reports an error that belongs to no round in a message of its own,
    /// leaving finished or stopped messages untouched.
    fn fail_detached(&mut self, err: SessionError) -> SessionError {
        self.conversation.release_active();
        self.reducer = None;
        self.fail(err)
    }

    fn reducer_mut(&mut self) -> &mut ReducerState {
        let mode = self.conversation.mode;
        let model = &self.model;
        self.reducer
            .get_or_insert_with(|| ReducerState::new(mode, model.as_str()))
    }

    fn sync_message(&mut self) {
        let Some(reducer) = self.reducer.as_ref() else {
            return;
        };
        let content = reducer.compose();
        if content.is_empty() && self.conversation.active_message().is_none() {
            return;
        }
        self.conversation.ensure_active(&self.model).content = content;
    }

    fn publish(&self) {
        self.updates.send_replace(self.snapshot());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ByteStream;
    use crate::confirmation::OperationKind;
    use crate::error::StopError;
    use crate::reducer::CONFIRMATION_WARNING;
    use crate::transcript::Role;
    use futures::stream;
    use pretty_assertions::assert_eq;
    use serde_json::{Value, json};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    enum Script {
        Frames(Vec<Value>),
        StopAt {
            frames: Vec<Value>,
            index: usize,
            governor: CancellationGovernor,
        },
        Status(u16),
    }

    #[derive(Clone, Default)]
    struct ScriptedTransport {
        scripts: Arc<Mutex<VecDeque<Script>>>,
        requests: Arc<Mutex<Vec<StreamRequest>>>,
    }

    impl ScriptedTransport {
        fn push(&self, script: Script) {
            self.scripts.lock().unwrap().push_back(script);
        }

        fn frames(&self, frames: Vec<Value>) {
            self.push(Script::Frames(frames));
        }

        fn requests(&self) -> Vec<StreamRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    fn line(frame: &Value) -> Vec<u8> {
        format!("data: {frame}\n\n").into_bytes()
    }

    impl Transport for ScriptedTransport {
        async fn open(&self, request: StreamRequest) -> SessionResult<ByteStream> {
            self.requests.lock().unwrap().push(request);
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Script::Frames(Vec::new()));
            match script {
                Script::Frames(frames) => Ok(Box::pin(stream::iter(
                    frames.into_iter().map(|frame| Ok(line(&frame))),
                ))),
                Script::StopAt {
                    frames,
                    index,
                    governor,
                } => Ok(Box::pin(stream::iter(frames.into_iter().enumerate().map(
                    move |(i, frame)| {
                        if i == index {
                            let _ = governor.stop();
                        }
                        Ok(line(&frame))
                    },
                )))),
                Script::Status(status) => Err(SessionError::Status {
                    status,
                    body: "boom".to_string(),
                }),
            }
        }
    }

    fn session(mode: Mode) -> (ChatSession<ScriptedTransport>, ScriptedTransport) {
        let transport = ScriptedTransport::default();
        let session = ChatSession::new(
            transport.clone(),
            SessionConfig {
                mode,
                ..SessionConfig::default()
            },
        );
        (session, transport)
    }

    fn confirmation(op: &str, sql: &str) -> Value {
        json!({
            "type": "confirmation_required",
            "content": {"operation": op, "sql": sql, "message": format!("{op} operation")}
        })
    }

    fn done(conversation_id: i64) -> Value {
        json!({"type": "done", "conversation_id": conversation_id})
    }

    fn content(session: &ChatSession<ScriptedTransport>) -> String {
        session
            .conversation()
            .active_message()
            .map(|message| message.content.clone())
            .unwrap_or_default()
    }

    async fn await_delete(
        session: &mut ChatSession<ScriptedTransport>,
        transport: &ScriptedTransport,
    ) -> PendingOperation {
        transport.frames(vec![
            json!({"type": "ai_response", "content": "I will delete the stale rows."}),
            confirmation("DELETE", "DELETE FROM t WHERE stale = 1"),
            done(9),
        ]);
        match session.send(Query::new("remove stale rows")).await.unwrap() {
            RoundOutcome::AwaitingConfirmation(op) => op,
            other => panic!("expected a pending operation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ask_round_builds_message_and_adopts_id() {
        let (mut session, transport) = session(Mode::Ask);
        transport.frames(vec![
            json!({"type": "ai_response", "content": "Let me check"}),
            json!({"type": "sql_query", "content": "SELECT 1"}),
            json!({"type": "sql_result", "content": {"success": true, "row_count": 1, "data": [{"x": 1}]}}),
            json!({"type": "final_answer_chunk", "content": "The "}),
            json!({"type": "final_answer_chunk", "content": "answer is 1."}),
            done(42),
        ]);

        let outcome = session
            .send(Query::parse("what is @numbers"))
            .await
            .unwrap();
        assert_eq!(outcome, RoundOutcome::Completed);
        assert_eq!(session.conversation().id, Some(42));
        assert_eq!(session.conversation().messages.len(), 2);
        assert_eq!(session.conversation().messages[1].role, Role::Assistant);
        assert!(content(&session).starts_with("Let me check\n\n**Executed SQL Query:**"));
        assert!(content(&session).ends_with("**💡 Conclusion:**\nThe answer is 1."));

        let requests = transport.requests();
        let StreamRequest::Ask(body) = &requests[0] else {
            panic!("expected an ask request");
        };
        assert_eq!(body.selected_tables, vec!["numbers"]);
        assert_eq!(body.conversation_id, None);

        transport.frames(vec![done(42)]);
        session.send(Query::new("again")).await.unwrap();
        let StreamRequest::Ask(body) = &transport.requests()[1] else {
            panic!("expected an ask request");
        };
        assert_eq!(body.conversation_id, Some(42));
    }

    #[tokio::test]
    async fn approval_executes_on_the_same_message() {
        let (mut session, transport) = session(Mode::Agent);
        let op = await_delete(&mut session, &transport).await;
        assert_eq!(op.operation, OperationKind::Delete);
        assert!(content(&session).contains(CONFIRMATION_WARNING));
        assert_eq!(
            session.conversation().streaming,
            StreamingState::AwaitingConfirmation
        );
        assert_eq!(
            session.governor().stop(),
            Err(StopError::AwaitingConfirmation)
        );

        transport.frames(vec![
            json!({"type": "sql_result", "content": {"success": true, "row_count": 3}}),
            done(9),
        ]);
        assert_eq!(session.resolve(true).await.unwrap(), RoundOutcome::Completed);

        let message = content(&session);
        assert!(message.starts_with("I will delete the stale rows."));
        assert!(message.contains("**SQL to Execute:**\n```sql\nDELETE FROM t WHERE stale = 1\n```"));
        assert!(!message.contains(CONFIRMATION_WARNING));
        assert!(message.ends_with("**✅ Result:** Successfully deleted 3 record(s)."));
        assert_eq!(session.conversation().messages.len(), 2);
        assert!(session.pending_operation().is_none());

        let requests = transport.requests();
        let StreamRequest::Confirm(confirm) = &requests[1] else {
            panic!("expected a confirm request");
        };
        assert!(confirm.confirmed);
        assert_eq!(confirm.conversation_id, 9);
        assert_eq!(confirm.sql_query, "DELETE FROM t WHERE stale = 1");
    }

    #[tokio::test]
    async fn rejection_never_sends_an_execute_request() {
        let (mut session, transport) = session(Mode::Agent);
        await_delete(&mut session, &transport).await;

        assert_eq!(session.resolve(false).await.unwrap(), RoundOutcome::Rejected);
        assert!(!content(&session).contains(CONFIRMATION_WARNING));
        assert!(!content(&session).contains("<confirmation"));
        assert!(session.pending_operation().is_none());
        assert_eq!(session.conversation().streaming, StreamingState::Idle);

        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests.iter().all(|request| !request.is_execute()));
        assert!(matches!(&requests[1], StreamRequest::Confirm(c) if !c.confirmed));
    }

    #[tokio::test]
    async fn chained_confirmations_feed_one_message() {
        let (mut session, transport) = session(Mode::Agent);
        await_delete(&mut session, &transport).await;

        transport.frames(vec![
            json!({"type": "sql_result", "content": {"success": true, "row_count": 1}}),
            confirmation("UPDATE", "UPDATE t SET archived = 1"),
            done(9),
        ]);
        let outcome = session.resolve(true).await.unwrap();
        assert!(matches!(
            outcome,
            RoundOutcome::AwaitingConfirmation(ref op) if op.operation == OperationKind::Update
        ));

        transport.frames(vec![
            json!({"type": "sql_result", "content": {"success": true, "row_count": 2}}),
            json!({"type": "final_answer_complete", "content": "Cleaned up."}),
            done(9),
        ]);
        assert_eq!(session.resolve(true).await.unwrap(), RoundOutcome::Completed);

        let message = content(&session);
        assert!(message.contains("Successfully deleted 1 record(s)."));
        assert!(message.contains("Successfully updated 2 record(s)."));
        assert!(message.ends_with("Cleaned up."));
        assert!(!message.contains(CONFIRMATION_WARNING));
        assert_eq!(session.conversation().messages.len(), 2);
    }

    #[tokio::test]
    async fn stop_freezes_content_at_the_last_applied_event() {
        let frames = vec![
            json!({"type": "ai_response", "content": "Looking"}),
            json!({"type": "sql_query", "content": "SELECT * FROM sales"}),
            json!({"type": "sql_result", "content": {"success": true, "row_count": 1, "data": [{"x": 1}]}}),
            json!({"type": "final_answer_chunk", "content": "Sales "}),
            json!({"type": "final_answer_chunk", "content": "grew."}),
            done(5),
        ];
        let stop_at = 3;

        let mut expected = ReducerState::new(Mode::Ask, DEFAULT_MODEL);
        for frame in &frames[..stop_at] {
            for envelope in crate::decoder::EventDecoder::new().decode(&line(frame)) {
                expected.apply_envelope(&envelope);
            }
        }

        let (mut session, transport) = session(Mode::Ask);
        transport.push(Script::StopAt {
            frames,
            index: stop_at,
            governor: session.governor(),
        });

        let outcome = session.send(Query::new("sales?")).await.unwrap();
        assert_eq!(outcome, RoundOutcome::Cancelled);
        assert_eq!(content(&session), expected.compose());
        assert!(!content(&session).contains("Error"));
        assert_eq!(session.conversation().id, None);
        assert_eq!(session.conversation().streaming, StreamingState::Idle);
        assert_eq!(session.governor().stop(), Ok(false));
    }

    #[tokio::test]
    async fn transport_failure_becomes_an_error_entry() {
        let (mut session, transport) = session(Mode::Ask);
        transport.push(Script::Status(502));

        let err = session.send(Query::new("hi")).await.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(content(&session), "**❌ Error:** backend returned 502: boom");
        assert_eq!(session.conversation().streaming, StreamingState::Idle);
        assert!(!session.governor().is_streaming());
    }

    #[tokio::test]
    async fn backend_error_frame_ends_the_round() {
        let (mut session, transport) = session(Mode::Agent);
        transport.frames(vec![
            json!({"type": "ai_response", "content": "Working"}),
            json!({"error": "User not found"}),
            done(1),
        ]);
        let err = session.send(Query::new("hi")).await.unwrap_err();
        assert!(matches!(err, SessionError::Backend(ref m) if m == "User not found"));
        assert_eq!(
            content(&session),
            "Working\n\n**❌ Error:** backend error: User not found"
        );
    }

    #[tokio::test]
    async fn stream_without_done_is_an_error() {
        let (mut session, transport) = session(Mode::Ask);
        transport.frames(vec![json!({"type": "ai_response", "content": "Partial"})]);
        let err = session.send(Query::new("hi")).await.unwrap_err();
        assert!(matches!(err, SessionError::Stream(_)));
        assert!(content(&session).starts_with("Partial"));
    }

    #[tokio::test]
    async fn resolve_without_pending_operation_is_rejected() {
        let (mut session, _transport) = session(Mode::Agent);
        let err = session.resolve(true).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Protocol(ProtocolError::NoPendingOperation)
        ));
        assert!(content(&session).contains("no operation is awaiting confirmation"));
    }

    #[tokio::test]
    async fn stray_resolve_leaves_finished_message_alone() {
        let (mut session, transport) = session(Mode::Agent);
        transport.frames(vec![
            json!({"type": "ai_response", "content": "Hello"}),
            json!({"type": "final_answer", "content": "Done."}),
            done(1),
        ]);
        session.send(Query::new("hi")).await.unwrap();
        let finished = content(&session);
        assert_eq!(finished, "Hello\n\nDone.");

        let err = session.resolve(true).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Protocol(ProtocolError::NoPendingOperation)
        ));
        let messages = &session.conversation().messages;
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].content, finished);
        assert_eq!(
            messages[2].content,
            "**❌ Error:** no operation is awaiting confirmation"
        );
    }

    #[tokio::test]
    async fn stray_resolve_leaves_stopped_message_frozen() {
        let (mut session, transport) = session(Mode::Agent);
        transport.push(Script::StopAt {
            frames: vec![
                json!({"type": "ai_response", "content": "I will delete rows."}),
                confirmation("DELETE", "DELETE FROM t"),
                done(3),
            ],
            index: 2,
            governor: session.governor(),
        });
        let outcome = session.send(Query::new("clean up")).await.unwrap();
        assert_eq!(outcome, RoundOutcome::Cancelled);
        assert!(session.pending_operation().is_none());
        let frozen = content(&session);

        session.resolve(false).await.unwrap_err();
        let messages = &session.conversation().messages;
        assert_eq!(messages[1].content, frozen);
        assert!(!messages[1].content.contains("Error"));
        assert!(messages[2].content.starts_with("**❌ Error:**"));
        assert_eq!(session.governor().rounds_opened(), 1);
    }

    #[tokio::test]
    async fn send_is_refused_while_a_decision_is_outstanding() {
        let (mut session, transport) = session(Mode::Agent);
        await_delete(&mut session, &transport).await;
        let err = session.send(Query::new("something else")).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Protocol(ProtocolError::ConfirmationPending)
        ));
        assert!(session.pending_operation().is_some());
    }

    #[tokio::test]
    async fn confirmation_chain_is_bounded() {
        let transport = ScriptedTransport::default();
        let mut session = ChatSession::new(
            transport.clone(),
            SessionConfig {
                mode: Mode::Agent,
                max_confirmation_rounds: 1,
                ..SessionConfig::default()
            },
        );
        await_delete(&mut session, &transport).await;
        transport.frames(vec![
            confirmation("DELETE", "DELETE FROM u"),
            done(9),
        ]);
        let err = session.resolve(true).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Protocol(ProtocolError::ChainTooDeep { limit: 1 })
        ));
        assert!(session.pending_operation().is_none());
    }

    #[tokio::test]
    async fn snapshots_follow_the_active_message() {
        let (mut session, transport) = session(Mode::Ask);
        let updates = session.subscribe();
        transport.frames(vec![
            json!({"type": "loading", "content": "AI is thinking..."}),
            json!({"type": "final_answer", "content": "Hello."}),
            done(2),
        ]);
        session.send(Query::new("hi")).await.unwrap();

        let snapshot = updates.borrow().clone();
        assert_eq!(snapshot.conversation_id, Some(2));
        assert_eq!(snapshot.active.map(|m| m.content), Some("Hello.".to_string()));
        assert_eq!(snapshot.status, None);
        assert_eq!(snapshot.streaming, StreamingState::Idle);
    }
}
