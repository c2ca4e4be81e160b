use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const ASK_STREAM_PATH: &str = "/api/ask/stream";
pub const AGENT_STREAM_PATH: &str = "/api/agent";
pub const CONFIRM_EXECUTE_PATH: &str = "/api/agent/confirm";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub filename: String,
    pub file_type: String,
    pub size: u64,
}

/// Body of the ask-stream and agent-stream requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<i64>,
    pub model: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selected_tables: Vec<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// Body of the confirm-execute request. `confirmed: false` is the backend's
/// cancel signal and never executes anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmRequest {
    pub conversation_id: i64,
    pub operation: String,
    pub sql_query: String,
    pub explanation: String,
    pub confirmed: bool,
    pub model: String,
}

/// One request that opens one event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamRequest {
    Ask(QueryRequest),
    Agent(QueryRequest),
    Confirm(ConfirmRequest),
}

impl StreamRequest {
    pub fn path(&self) -> &'static str {
        match self {
            StreamRequest::Ask(_) => ASK_STREAM_PATH,
            StreamRequest::Agent(_) => AGENT_STREAM_PATH,
            StreamRequest::Confirm(_) => CONFIRM_EXECUTE_PATH,
        }
    }

    pub fn is_execute(&self) -> bool {
        matches!(self, StreamRequest::Confirm(request) if request.confirmed)
    }
}

/// Wire discriminant carried in the `type` field of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    AiResponse,
    SqlQuery,
    StepIndicator,
    BriefReasoning,
    SqlResult,
    ChartConfig,
    FinalAnswerChunk,
    FinalAnswerComplete,
    FinalAnswer,
    GraphDecision,
    ConfirmationRequired,
    Cancelled,
    Loading,
    Error,
    Done,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::AiResponse => "ai_response",
            EventKind::SqlQuery => "sql_query",
            EventKind::StepIndicator => "step_indicator",
            EventKind::BriefReasoning => "brief_reasoning",
            EventKind::SqlResult => "sql_result",
            EventKind::ChartConfig => "chart_config",
            EventKind::FinalAnswerChunk => "final_answer_chunk",
            EventKind::FinalAnswerComplete => "final_answer_complete",
            EventKind::FinalAnswer => "final_answer",
            EventKind::GraphDecision => "graph_decision",
            EventKind::ConfirmationRequired => "confirmation_required",
            EventKind::Cancelled => "cancelled",
            EventKind::Loading => "loading",
            EventKind::Error => "error",
            EventKind::Done => "done",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SqlResult {
    #[serde(default)]
    pub success: bool,
    #[serde(default, alias = "rowCount")]
    pub row_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    Rows,
    Mutation,
}

impl SqlResult {
    /// A payload carrying `data` or `columns` (even empty) came from a
    /// row-returning query; anything else is a mutation report.
    pub fn shape(&self) -> ResultShape {
        if self.data.is_some() || self.columns.is_some() {
            ResultShape::Rows
        } else {
            ResultShape::Mutation
        }
    }

    pub fn rows(&self) -> u64 {
        self.row_count
            .unwrap_or_else(|| self.data.as_ref().map_or(0, |data| data.len() as u64))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationPayload {
    pub operation: String,
    pub sql: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DoneInfo {
    pub conversation_id: Option<i64>,
    pub user_message_id: Option<i64>,
    pub assistant_message_id: Option<i64>,
}

/// One typed unit of progress from the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    AiResponse(String),
    SqlQuery(String),
    StepIndicator(String),
    BriefReasoning(String),
    SqlResult(SqlResult),
    ChartConfig(Value),
    FinalAnswerChunk(String),
    FinalAnswerComplete(String),
    FinalAnswer(String),
    GraphDecision(Value),
    ConfirmationRequired(ConfirmationPayload),
    Cancelled { message: Option<String> },
    Loading(String),
    Error(String),
    Done(DoneInfo),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::AiResponse(_) => EventKind::AiResponse,
            Event::SqlQuery(_) => EventKind::SqlQuery,
            Event::StepIndicator(_) => EventKind::StepIndicator,
            Event::BriefReasoning(_) => EventKind::BriefReasoning,
            Event::SqlResult(_) => EventKind::SqlResult,
            Event::ChartConfig(_) => EventKind::ChartConfig,
            Event::FinalAnswerChunk(_) => EventKind::FinalAnswerChunk,
            Event::FinalAnswerComplete(_) => EventKind::FinalAnswerComplete,
            Event::FinalAnswer(_) => EventKind::FinalAnswer,
            Event::GraphDecision(_) => EventKind::GraphDecision,
            Event::ConfirmationRequired(_) => EventKind::ConfirmationRequired,
            Event::Cancelled { .. } => EventKind::Cancelled,
            Event::Loading(_) => EventKind::Loading,
            Event::Error(_) => EventKind::Error,
            Event::Done(_) => EventKind::Done,
        }
    }

    /// Whether applying this event writes persisted message content.
    pub fn carries_content(&self) -> bool {
        !matches!(
            self,
            Event::Loading(_) | Event::GraphDecision(_) | Event::Done(_) | Event::Cancelled { .. }
        )
    }
}

/// An event plus the backend-issued fragment sequence number, when present.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub seq: Option<u64>,
    pub event: Event,
}

impl From<Event> for Envelope {
    fn from(event: Event) -> Self {
        Self { seq: None, event }
    }
}
