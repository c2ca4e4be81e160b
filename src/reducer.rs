//! Folds backend events into the content of one assistant message.
//!
//! The state keeps three regions that are composed on demand:
//!
//! * `base`: the opening narrative from `ai_response`,
//! * `accumulated`: queries, results, charts and notes in arrival order,
//! * `final_answer`: the conclusion, streamed token by token and replaced
//!   wholesale by `final_answer_complete`.
//!
//! Only the final-answer region is ever rewritten, so everything composed in
//! front of it is stable once written. The confirmation directive is the one
//! exception: it is removed again when the operation is resolved.

use crate::confirmation::{OperationKind, PendingOperation};
use crate::dedup::{DedupPolicy, DeduplicationGuard};
use crate::protocol::{
    ConfirmationPayload, DoneInfo, Envelope, Event, ResultShape, SqlResult,
};
use crate::transcript::Mode;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::Value;
use tracing::{debug, trace};

pub const CONFIRMATION_WARNING: &str =
    "**⚠️ This operation will modify your data. Please confirm:**";

const BLOCK_SEPARATOR: &str = "\n\n";
const CONCLUSION_HEADING: &str = "**💡 Conclusion:**";
const SUMMARY_HEADING: &str = "**💡 Summary:**";

/// What the caller has to do after an event was applied.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Unchanged,
    ContentUpdated,
    StatusUpdated,
    ConfirmationRequested(PendingOperation),
    ConfirmationWithdrawn,
    Finished(DoneInfo),
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct ReducerState {
    mode: Mode,
    model: String,
    base: String,
    accumulated: String,
    final_answer: String,
    status: Option<String>,
    directive: Option<String>,
    error: Option<String>,
    referenced_rows: bool,
    last_operation: Option<OperationKind>,
    finalized: bool,
    guard: DeduplicationGuard,
}

impl ReducerState {
    pub fn new(mode: Mode, model: impl Into<String>) -> Self {
        Self {
            mode,
            model: model.into(),
            base: String::new(),
            accumulated: String::new(),
            final_answer: String::new(),
            status: None,
            directive: None,
            error: None,
            referenced_rows: false,
            last_operation: None,
            finalized: false,
            guard: DeduplicationGuard::new(),
        }
    }

    /// Applies an event unless its sequence number has been seen already.
    pub fn apply_envelope(&mut self, envelope: &Envelope) -> Effect {
        if !self.guard.admit_seq(envelope.seq) {
            return Effect::Unchanged;
        }
        self.apply(&envelope.event)
    }

    pub fn apply(&mut self, event: &Event) -> Effect {
        trace!(kind = event.kind().as_str(), "applying event");
        match event {
            Event::AiResponse(text) => {
                if self.base == *text {
                    return Effect::Unchanged;
                }
                self.base = text.clone();
                Effect::ContentUpdated
            }
            Event::SqlQuery(sql) => {
                self.referenced_rows = true;
                let block = format!("**Executed SQL Query:**\n```sql\n{}\n```", sql.trim());
                self.push_block(block, DedupPolicy::Contained)
            }
            Event::StepIndicator(title) => {
                let block = format!("---\n\n**{}**", title.trim());
                self.push_block(block, DedupPolicy::Contained)
            }
            Event::BriefReasoning(note) => {
                let block = format!("💭 **Next Step:** {}", clean_reasoning(note));
                self.push_block(block, DedupPolicy::Contained)
            }
            Event::SqlResult(result) => {
                let block = self.result_block(result);
                self.push_block(block, DedupPolicy::Trailing)
            }
            Event::ChartConfig(config) => {
                let block = format!("**📊 Visualization:**\n```chart\n{}\n```", pretty(config));
                self.push_block(block, DedupPolicy::Contained)
            }
            Event::FinalAnswerChunk(chunk) => {
                if chunk.is_empty() {
                    return Effect::Unchanged;
                }
                self.final_answer.push_str(chunk);
                Effect::ContentUpdated
            }
            Event::FinalAnswerComplete(text) | Event::FinalAnswer(text) => {
                if self.final_answer == *text {
                    return Effect::Unchanged;
                }
                self.final_answer = text.clone();
                Effect::ContentUpdated
            }
            Event::GraphDecision(_) => Effect::Unchanged,
            Event::ConfirmationRequired(payload) => self.request_confirmation(payload),
            Event::Cancelled { message } => {
                debug!(message = message.as_deref().unwrap_or(""), "operation cancelled");
                if self.retire_directive() {
                    Effect::ConfirmationWithdrawn
                } else {
                    Effect::Unchanged
                }
            }
            Event::Loading(status) => {
                self.status = Some(status.clone());
                Effect::StatusUpdated
            }
            Event::Error(message) => {
                self.record_error(message);
                Effect::Failed(message.clone())
            }
            Event::Done(info) => {
                self.status = None;
                self.finalized = true;
                Effect::Finished(*info)
            }
        }
    }

    /// Prepares the state for another stream feeding the same message.
    pub fn begin_round(&mut self) {
        self.guard.reset_sequence();
        self.finalized = false;
        self.status = None;
    }

    /// Remembers which operation the next mutation result reports on.
    pub fn note_operation(&mut self, operation: &OperationKind) {
        self.last_operation = Some(operation.clone());
    }

    /// Removes the confirmation warning and directive, keeping the SQL
    /// description in front of them.
    pub fn retire_directive(&mut self) -> bool {
        let Some(directive) = self.directive.take() else {
            return false;
        };
        match self.accumulated.rfind(&directive) {
            Some(pos) => {
                self.accumulated.replace_range(pos..pos + directive.len(), "");
                true
            }
            None => false,
        }
    }

    pub fn record_error(&mut self, message: &str) {
        self.status = None;
        self.error = Some(message.to_string());
    }

    pub fn clear_status(&mut self) {
        self.status = None;
    }

    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn has_directive(&self) -> bool {
        self.directive.is_some()
    }

    pub fn accumulated(&self) -> &str {
        &self.accumulated
    }

    pub fn final_answer(&self) -> &str {
        &self.final_answer
    }

    pub fn skipped_duplicates(&self) -> usize {
        self.guard.skipped()
    }

    /// Everything in front of the final-answer region.
    pub fn prefix(&self) -> String {
        if self.base.is_empty() {
            self.accumulated.trim_start_matches('\n').to_string()
        } else {
            format!("{}{}", self.base, self.accumulated)
        }
    }

    /// The final answer wrapped for display, including its separator.
    pub fn final_section(&self) -> String {
        let answer = self.final_answer.trim();
        if answer.is_empty() {
            return String::new();
        }
        if self.accumulated.is_empty() {
            if self.base.is_empty() {
                return self.final_answer.clone();
            }
            if self.base.contains(answer) {
                return String::new();
            }
            return format!("{BLOCK_SEPARATOR}{}", self.final_answer);
        }
        let heading = if self.mode == Mode::Agent && !self.referenced_rows {
            SUMMARY_HEADING
        } else {
            CONCLUSION_HEADING
        };
        format!("{BLOCK_SEPARATOR}---{BLOCK_SEPARATOR}{heading}\n{}", self.final_answer)
    }

    /// The display content of the message.
    pub fn compose(&self) -> String {
        let mut content = self.prefix();
        content.push_str(&self.final_section());
        if let Some(error) = &self.error {
            if !content.is_empty() {
                content.push_str(BLOCK_SEPARATOR);
            }
            content.push_str("**❌ Error:** ");
            content.push_str(error);
        }
        content
    }

    fn push_block(&mut self, block: String, policy: DedupPolicy) -> Effect {
        let prefix = self.prefix();
        if !self.guard.admit(&prefix, &block, policy) {
            return Effect::Unchanged;
        }
        self.accumulated.push_str(BLOCK_SEPARATOR);
        self.accumulated.push_str(&block);
        Effect::ContentUpdated
    }

    fn result_block(&mut self, result: &SqlResult) -> String {
        match result.shape() {
            ResultShape::Rows => {
                self.referenced_rows = true;
                if !result.success {
                    return format!("**❌ Error:** {}", error_text(result));
                }
                let rows = result.rows();
                let plural = if rows == 1 { "" } else { "s" };
                let mut block = format!("**📋 Query Result:** ({rows} row{plural} returned)\n\n");
                match result.data.as_deref() {
                    Some(data) if rows > 0 && !data.is_empty() => {
                        block.push_str(&format!(
                            "```table\n{}\n```",
                            pretty(&Value::Array(data.to_vec()))
                        ));
                    }
                    _ => block.push_str("*No rows returned.*"),
                }
                block
            }
            ResultShape::Mutation => {
                if !result.success {
                    return format!("**❌ Error:** Operation failed: {}", error_text(result));
                }
                let rows = result.rows();
                match self.last_operation.as_ref().and_then(OperationKind::past_tense) {
                    Some(verb) => format!("**✅ Result:** Successfully {verb} {rows} record(s)."),
                    None => format!(
                        "**✅ Result:** Operation completed successfully. {rows} row(s) affected."
                    ),
                }
            }
        }
    }

    fn request_confirmation(&mut self, payload: &ConfirmationPayload) -> Effect {
        let op = PendingOperation::from_payload(payload, &self.model);
        let directive = format!(
            "{BLOCK_SEPARATOR}{CONFIRMATION_WARNING}{BLOCK_SEPARATOR}<confirmation operation=\"{}\" sql=\"{}\" message=\"{}\" model=\"{}\" />",
            op.operation,
            BASE64.encode(op.sql.as_bytes()),
            BASE64.encode(op.explanation.as_bytes()),
            op.model,
        );

        if self.directive.as_deref() == Some(directive.as_str()) {
            return Effect::ConfirmationRequested(op);
        }
        self.retire_directive();

        let sql = op.sql.trim();
        let described = format!("```sql\n{sql}\n```");
        if !self.prefix().trim_end().ends_with(&described) {
            self.accumulated.push_str(BLOCK_SEPARATOR);
            self.accumulated.push_str("**SQL to Execute:**\n");
            self.accumulated.push_str(&described);
        }
        self.accumulated.push_str(&directive);
        self.directive = Some(directive);
        Effect::ConfirmationRequested(op)
    }
}

fn clean_reasoning(note: &str) -> &str {
    let note = note.trim();
    note.strip_suffix("**").map_or(note, str::trim_end)
}

fn error_text(result: &SqlResult) -> &str {
    result
        .error
        .as_deref()
        .or(result.message.as_deref())
        .unwrap_or("Unknown error")
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
