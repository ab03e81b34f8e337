//! Data model shared by the engine, the session directory and the task tracker.

use crate::protocol::Role;
use chrono::{DateTime, Local, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Namespace prefix of session keys created from this kiosk.
pub const SESSION_PREFIX: &str = "voice:";

/// Distinguishes regular turns from server-reported errors in the transcript.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Normal,
    Error,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub text: String,
    #[serde(default)]
    pub kind: MessageKind,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            kind: MessageKind::Normal,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            kind: MessageKind::Normal,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            kind: MessageKind::Error,
        }
    }

    pub fn is_error(&self) -> bool {
        self.kind == MessageKind::Error
    }
}

/// Rendering hint from the server's voice activity detector.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VoiceActivity {
    pub is_speech: bool,
    /// Always within `[0, 1]`.
    pub probability: f32,
}

impl VoiceActivity {
    pub fn clamp_probability(p: f32) -> f32 {
        if p.is_nan() { 0.0 } else { p.clamp(0.0, 1.0) }
    }
}

/// One line of the instructional overlay pushed by `command_tip`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTip {
    pub role: Role,
    pub text: String,
}

/// One entry of the session directory listing.
///
/// Timestamps are kept as the server sent them; [`parse_timestamp`] reads both RFC 3339
/// and naive ISO-8601 forms.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub key: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl SessionInfo {
    pub fn updated(&self) -> Option<DateTime<Utc>> {
        self.updated_at.as_deref().and_then(parse_timestamp)
    }

    /// Human label: the key without its `voice:` namespace, plus the local date of the last update.
    pub fn label(&self) -> String {
        let name = display_name(&self.key);
        match self.updated() {
            Some(ts) => format!(
                "{} ({})",
                name,
                ts.with_timezone(&Local).format("%Y-%m-%d")
            ),
            None => name.to_string(),
        }
    }
}

/// Parses a server timestamp; naive values are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .map(|naive| naive.and_utc())
}

/// Strips the session namespace for display.
pub fn display_name(key: &str) -> &str {
    key.strip_prefix(SESSION_PREFIX).unwrap_or(key)
}

/// Lifecycle of a background task. Terminal states are final.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Running,
    Completed,
    Error,
}

impl TaskStatus {
    /// Maps a server status string; anything that is neither running nor error counts as completed.
    pub fn from_wire(s: &str) -> Self {
        match s {
            "running" => TaskStatus::Running,
            "error" => TaskStatus::Error,
            _ => TaskStatus::Completed,
        }
    }

    pub fn is_terminal(self) -> bool {
        self != TaskStatus::Running
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackgroundTask {
    pub task_id: String,
    pub description: String,
    pub status: TaskStatus,
    pub started_at: Option<DateTime<Utc>>,
    /// Session on the secondary event source the task runs in, once known.
    pub bound_session_id: Option<String>,
}

/// Server-side listing entry for a background task.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct TaskSnapshot {
    pub task_id: String,
    #[serde(default)]
    pub description: String,
    pub status: String,
    /// Unix seconds.
    #[serde(default)]
    pub started_at: Option<f64>,
    #[serde(default)]
    pub oc_session_id: Option<String>,
}

impl TaskSnapshot {
    pub fn started_at_utc(&self) -> Option<DateTime<Utc>> {
        let secs = self.started_at?;
        DateTime::from_timestamp_millis((secs * 1000.0) as i64)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Todo {
    pub content: String,
    pub status: TodoStatus,
    #[serde(default)]
    pub priority: Option<String>,
}

/// Completed and total todo counts, plus the rounded percentage.
pub fn todo_progress(todos: &[Todo]) -> (usize, usize, u8) {
    let total = todos.len();
    let done = todos
        .iter()
        .filter(|t| t.status == TodoStatus::Completed)
        .count();
    let pct = if total == 0 {
        0
    } else {
        ((done as f64 / total as f64) * 100.0).round() as u8
    };
    (done, total, pct)
}

/// Formats elapsed seconds as `MM:SS`.
pub fn format_elapsed(secs: u64) -> String {
    format!("{:02}:{:02}", secs / 60, secs % 60)
}
