//! Defines the realtime envelope protocol between the kiosk and the voice pipeline server.
//!
//! Both directions are JSON objects tagged by a `type` field. Inbound envelopes that fail
//! to parse are dropped by [`ServerEnvelope::parse`]; unrecognised tags decode to
//! [`ServerEnvelope::Unknown`] so the engine can ignore them explicitly.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Server-owned state of the voice pipeline. The client only ever mirrors it.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    #[default]
    Idle,
    Triggered,
    Recording,
    Transcribing,
    Thinking,
    Responding,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Idle => "idle",
            PipelineState::Triggered => "triggered",
            PipelineState::Recording => "recording",
            PipelineState::Transcribing => "transcribing",
            PipelineState::Thinking => "thinking",
            PipelineState::Responding => "responding",
        };
        f.write_str(name)
    }
}

/// Interaction mode of the pipeline: push-to-talk or always-listening.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Ptt,
    Natural,
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ptt" => Ok(Mode::Ptt),
            "natural" => Ok(Mode::Natural),
            other => Err(format!("unknown mode '{other}'")),
        }
    }
}

/// Logical interaction track a session is driven from.
///
/// `voice` is one shared pipeline followed by every connected client; `keyboard` is a
/// per-connection session that must never drive the session `voice` currently owns.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    #[default]
    Voice,
    Keyboard,
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "voice" => Ok(Channel::Voice),
            "keyboard" => Ok(Channel::Keyboard),
            other => Err(format!("unknown channel '{other}'")),
        }
    }
}

/// Speaker of a chat turn or a command tip line.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Envelopes broadcast by the server.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEnvelope {
    StateChanged {
        state: PipelineState,
        /// Kept as a raw string: an unknown mode must not discard the state update.
        #[serde(default)]
        mode: Option<String>,
        #[serde(default)]
        info: Option<String>,
    },
    UserText {
        text: String,
        #[serde(default)]
        session_key: Option<String>,
    },
    AssistantText {
        text: String,
        #[serde(default)]
        session_key: Option<String>,
    },
    AssistantChunk {
        text: String,
        done: bool,
        #[serde(default)]
        session_key: Option<String>,
    },
    VadStatus {
        is_speech: bool,
        probability: f32,
    },
    VadSpeechStart {
        probability: f32,
    },
    VadSpeechEnd {
        probability: f32,
    },
    Error {
        text: String,
    },
    SessionSwitched {
        key: String,
    },
    SessionUpdated {
        key: String,
    },
    SessionDeleted {
        key: String,
    },
    SessionInit {
        current: String,
    },
    ChannelSwitched {
        channel: Channel,
        #[serde(default)]
        session_key: Option<String>,
    },
    CommandTip {
        role: Role,
        text: String,
    },
    TaskStarted {
        task_id: String,
        description: String,
    },
    TaskCompletedOtherSession {
        task_id: String,
        session_key: String,
        status: String,
    },
    TaskCompleted {
        task_id: String,
        session_key: String,
        status: String,
    },
    /// Any tag this client does not know about.
    #[serde(other)]
    Unknown,
}

impl ServerEnvelope {
    /// Parses one text frame. Malformed JSON or a known tag with a bad payload yields `None`.
    pub fn parse(text: &str) -> Option<Self> {
        match serde_json::from_str(text) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                tracing::debug!(error = %e, "Discarding malformed envelope");
                None
            }
        }
    }
}

/// Commands sent from the kiosk to the server.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEnvelope {
    PttStart,
    PttStop,
    SetMode { mode: Mode },
    TextInput { text: String },
    SwitchSession { key: String },
    SetChannel { channel: Channel },
    CancelCommand,
}

impl ClientEnvelope {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
