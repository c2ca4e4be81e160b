use crate::protocol::Attachment;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use uuid::Uuid;

static TABLE_MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@(\w+)").expect("mention pattern is valid"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Read-only questions answered with queries.
    #[default]
    Ask,
    /// Data operations, including mutations that need confirmation.
    Agent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl Message {
    pub fn user(content: impl Into<String>, attachments: Vec<Attachment>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now(),
            model: None,
            attachments,
        }
    }

    pub fn assistant(model: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role: Role::Assistant,
            content: String::new(),
            timestamp: Utc::now(),
            model: Some(model.into()),
            attachments: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StreamingState {
    #[default]
    Idle,
    Streaming {
        round: u32,
    },
    AwaitingConfirmation,
}

/// What the user typed, plus the datasets and files it refers to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    pub text: String,
    pub selected_tables: Vec<String>,
    pub attachments: Vec<Attachment>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// Builds a query from free text, selecting every `@table` it mentions.
    pub fn parse(input: &str) -> Self {
        let mut selected_tables: Vec<String> = Vec::new();
        for capture in TABLE_MENTION.captures_iter(input) {
            let table = capture[1].to_string();
            if !selected_tables.contains(&table) {
                selected_tables.push(table);
            }
        }
        Self {
            text: input.trim().to_string(),
            selected_tables,
            attachments: Vec::new(),
        }
    }

    pub fn with_tables(mut self, tables: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.selected_tables = tables.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationSession {
    pub id: Option<i64>,
    pub messages: Vec<Message>,
    pub mode: Mode,
    pub streaming: StreamingState,
    #[serde(skip)]
    active: Option<usize>,
}

impl ConversationSession {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn push_user(&mut self, query: &Query) {
        self.messages
            .push(Message::user(query.text.clone(), query.attachments.clone()));
    }

    /// Returns the active assistant message, creating it on first use.
    pub fn ensure_active(&mut self, model: &str) -> &mut Message {
        let idx = match self.active {
            Some(idx) => idx,
            None => {
                self.messages.push(Message::assistant(model));
                let idx = self.messages.len() - 1;
                self.active = Some(idx);
                idx
            }
        };
        &mut self.messages[idx]
    }

    pub fn active_message(&self) -> Option<&Message> {
        self.active.and_then(|idx| self.messages.get(idx))
    }

    /// Detaches the active message; the next assistant reply starts a new one.
    pub fn release_active(&mut self) {
        self.active = None;
    }

    /// Adopts the backend-assigned id unless one is already known.
    pub fn adopt_id(&mut self, id: Option<i64>) -> bool {
        match (self.id, id) {
            (None, Some(id)) => {
                self.id = Some(id);
                true
            }
            _ => false,
        }
    }
}
