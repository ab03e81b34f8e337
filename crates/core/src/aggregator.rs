//! Incremental event aggregator.
//!
//! Rebuilds assistant messages from the secondary event stream. A `message.part.updated`
//! snapshot inserts a part or replaces it in place; a `message.part.delta` appends text
//! to a part that already exists. Part ids are never duplicated. Deltas for parts that
//! were never snapshotted are dropped.

use crate::protocol::Role;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

/// A renderable piece of an assistant message.
#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
    },
    ToolInvocation {
        tool_name: String,
        state: String,
        input: Option<Value>,
        output: Option<String>,
    },
}

impl Part {
    fn append(&mut self, delta: &str) -> bool {
        match self {
            Part::Text { text } | Part::Reasoning { text } => {
                text.push_str(delta);
                true
            }
            Part::ToolInvocation { .. } => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedMessage {
    pub id: String,
    pub role: Role,
    part_ids: Vec<String>,
    parts: Vec<Part>,
}

impl AggregatedMessage {
    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    fn position(&self, part_id: &str) -> Option<usize> {
        self.part_ids.iter().position(|id| id == part_id)
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ToolState {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub output: Option<Value>,
}

/// Full state of one part as sent by the event source.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct PartSnapshot {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, rename = "sessionID")]
    pub session_id: Option<String>,
    #[serde(default, rename = "messageID")]
    pub message_id: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub state: Option<ToolState>,
}

impl PartSnapshot {
    /// Maps the source part type; step markers and anything else unknown give `None`.
    pub fn to_part(&self) -> Option<Part> {
        match self.kind.as_deref()? {
            "text" => Some(Part::Text {
                text: self.text.clone().unwrap_or_default(),
            }),
            "reasoning" => Some(Part::Reasoning {
                text: self.text.clone().unwrap_or_default(),
            }),
            "tool" => {
                let state = self.state.clone().unwrap_or_default();
                Some(Part::ToolInvocation {
                    tool_name: self.tool.clone().unwrap_or_else(|| "tool".to_string()),
                    state: state.status.unwrap_or_else(|| "pending".to_string()),
                    input: state.input,
                    output: state.output.map(|v| match v {
                        Value::String(s) => s,
                        other => other.to_string(),
                    }),
                })
            }
            _ => None,
        }
    }
}

/// Delta text arrives either as `{"text": ".."}` or as a bare string.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum DeltaPayload {
    Bare(String),
    Object {
        #[serde(default)]
        text: Option<String>,
    },
}

impl DeltaPayload {
    pub fn text(&self) -> Option<&str> {
        match self {
            DeltaPayload::Bare(text) => Some(text),
            DeltaPayload::Object { text } => text.as_deref(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct MessageInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, rename = "sessionID")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct EventProperties {
    #[serde(default, rename = "sessionID")]
    pub session_id: Option<String>,
    #[serde(default, rename = "partID")]
    pub part_id: Option<String>,
    #[serde(default)]
    pub part: Option<PartSnapshot>,
    #[serde(default)]
    pub delta: Option<DeltaPayload>,
    #[serde(default)]
    pub info: Option<MessageInfo>,
}

impl EventProperties {
    fn session_id(&self) -> Option<&str> {
        self.session_id
            .as_deref()
            .or_else(|| self.part.as_ref().and_then(|p| p.session_id.as_deref()))
            .or_else(|| self.info.as_ref().and_then(|i| i.session_id.as_deref()))
    }
}

/// One payload from the secondary event source.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum SourceEvent {
    #[serde(rename = "message.part.updated")]
    PartUpdated {
        #[serde(default)]
        properties: EventProperties,
    },
    #[serde(rename = "message.part.delta")]
    PartDelta {
        #[serde(default)]
        properties: EventProperties,
    },
    #[serde(rename = "message.updated")]
    MessageUpdated {
        #[serde(default)]
        properties: EventProperties,
    },
    /// Session status, heartbeats and anything newer.
    #[serde(other)]
    Other,
}

impl SourceEvent {
    pub fn parse(data: &str) -> Option<Self> {
        match serde_json::from_str(data) {
            Ok(event) => Some(event),
            Err(e) => {
                debug!(error = %e, "Discarding malformed source event");
                None
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PartAggregator {
    session_id: Option<String>,
    messages: Vec<AggregatedMessage>,
}

impl PartAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn messages(&self) -> &[AggregatedMessage] {
        &self.messages
    }

    /// Starts over for a new subscription. Nothing carries across sessions.
    pub fn reset(&mut self, session_id: Option<String>) {
        self.session_id = session_id;
        self.messages.clear();
    }

    /// Applies one event. Returns whether the message list changed.
    pub fn apply(&mut self, event: SourceEvent) -> bool {
        let Some(subscribed) = self.session_id.as_deref() else {
            return false;
        };
        match event {
            SourceEvent::PartUpdated { properties } => {
                if properties.session_id().is_some_and(|id| id != subscribed) {
                    return false;
                }
                match properties.part {
                    Some(snapshot) => self.upsert(&snapshot),
                    None => false,
                }
            }
            SourceEvent::PartDelta { properties } => {
                if properties.session_id().is_some_and(|id| id != subscribed) {
                    return false;
                }
                let (Some(part_id), Some(text)) = (
                    properties.part_id.as_deref(),
                    properties.delta.as_ref().and_then(DeltaPayload::text),
                ) else {
                    return false;
                };
                !text.is_empty() && self.append_delta(part_id, text)
            }
            SourceEvent::MessageUpdated { properties } => {
                debug!(info = ?properties.info, "Message metadata updated");
                false
            }
            SourceEvent::Other => false,
        }
    }

    fn upsert(&mut self, snapshot: &PartSnapshot) -> bool {
        let (Some(part_id), Some(message_id)) =
            (snapshot.id.as_deref(), snapshot.message_id.as_deref())
        else {
            return false;
        };
        let Some(part) = snapshot.to_part() else {
            return false;
        };

        // Part ids are unique across the whole model, not just within a message.
        let known = self.messages.iter_mut().rev().find_map(|m| {
            let idx = m.position(part_id)?;
            Some((m, idx))
        });
        if let Some((message, idx)) = known {
            message.parts[idx] = part;
            return true;
        }

        match self.messages.iter_mut().find(|m| m.id == message_id) {
            Some(message) => {
                message.part_ids.push(part_id.to_string());
                message.parts.push(part);
            }
            None => self.messages.push(AggregatedMessage {
                id: message_id.to_string(),
                role: Role::Assistant,
                part_ids: vec![part_id.to_string()],
                parts: vec![part],
            }),
        }
        true
    }

    fn append_delta(&mut self, part_id: &str, text: &str) -> bool {
        // Deltas nearly always target the newest message.
        for message in self.messages.iter_mut().rev() {
            if let Some(idx) = message.position(part_id) {
                return message.parts[idx].append(text);
            }
        }
        debug!(%part_id, "Dropping delta for unknown part");
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn subscribed(session: &str) -> PartAggregator {
        let mut agg = PartAggregator::new();
        agg.reset(Some(session.to_string()));
        agg
    }

    fn updated(session: &str, message: &str, part: &str, kind: &str, text: &str) -> SourceEvent {
        SourceEvent::parse(
            &json!({
                "type": "message.part.updated",
                "properties": {
                    "part": {
                        "id": part, "sessionID": session, "messageID": message,
                        "type": kind, "text": text
                    }
                }
            })
            .to_string(),
        )
        .unwrap()
    }

    fn delta(session: &str, part: &str, text: &str) -> SourceEvent {
        SourceEvent::parse(
            &json!({
                "type": "message.part.delta",
                "properties": { "sessionID": session, "partID": part, "delta": { "text": text } }
            })
            .to_string(),
        )
        .unwrap()
    }

    fn texts(agg: &PartAggregator) -> Vec<Vec<Part>> {
        agg.messages().iter().map(|m| m.parts().to_vec()).collect()
    }

    #[test]
    fn test_snapshot_then_delta_extends_single_part() {
        let mut agg = subscribed("ses_1");
        assert!(agg.apply(updated("ses_1", "msg_1", "prt_1", "text", "hello")));
        assert!(agg.apply(delta("ses_1", "prt_1", " world")));
        assert_eq!(
            texts(&agg),
            vec![vec![Part::Text {
                text: "hello world".into()
            }]]
        );
    }

    #[test]
    fn test_snapshot_replaces_in_place() {
        let mut agg = subscribed("ses_1");
        agg.apply(updated("ses_1", "msg_1", "prt_1", "text", "draft"));
        agg.apply(updated("ses_1", "msg_1", "prt_2", "reasoning", "hmm"));
        agg.apply(updated("ses_1", "msg_1", "prt_1", "text", "final"));
        assert_eq!(
            texts(&agg),
            vec![vec![
                Part::Text {
                    text: "final".into()
                },
                Part::Reasoning { text: "hmm".into() },
            ]]
        );
    }

    #[test]
    fn test_known_part_under_other_message_is_not_duplicated() {
        let mut agg = subscribed("ses_1");
        agg.apply(updated("ses_1", "msg_1", "prt_1", "text", "first"));
        assert!(agg.apply(updated("ses_1", "msg_2", "prt_1", "text", "second")));
        assert_eq!(agg.messages().len(), 1);
        assert_eq!(
            texts(&agg),
            vec![vec![Part::Text {
                text: "second".into()
            }]]
        );
    }

    #[test]
    fn test_delta_for_unknown_part_is_dropped() {
        let mut agg = subscribed("ses_1");
        agg.apply(updated("ses_1", "msg_1", "prt_1", "text", "a"));
        let before = agg.messages().to_vec();
        assert!(!agg.apply(delta("ses_1", "prt_unknown", "zzz")));
        assert_eq!(agg.messages(), before.as_slice());
    }

    #[test]
    fn test_messages_are_ordered_by_first_sight() {
        let mut agg = subscribed("ses_1");
        agg.apply(updated("ses_1", "msg_1", "prt_1", "text", "one"));
        agg.apply(updated("ses_1", "msg_2", "prt_2", "text", "two"));
        agg.apply(delta("ses_1", "prt_1", "!"));
        let ids: Vec<_> = agg.messages().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["msg_1", "msg_2"]);
        assert_eq!(
            agg.messages()[0].parts(),
            &[Part::Text {
                text: "one!".into()
            }]
        );
    }

    #[test]
    fn test_other_sessions_are_ignored() {
        let mut agg = subscribed("ses_1");
        assert!(!agg.apply(updated("ses_2", "msg_1", "prt_1", "text", "x")));
        assert!(agg.messages().is_empty());
    }

    #[test]
    fn test_step_markers_are_dropped() {
        let mut agg = subscribed("ses_1");
        assert!(!agg.apply(updated("ses_1", "msg_1", "prt_1", "step-start", "")));
        assert!(agg.messages().is_empty());
    }

    #[test]
    fn test_tool_part_mapping_and_no_text_append() {
        let mut agg = subscribed("ses_1");
        let event = SourceEvent::parse(
            &json!({
                "type": "message.part.updated",
                "properties": { "part": {
                    "id": "prt_t", "sessionID": "ses_1", "messageID": "msg_1", "type": "tool",
                    "tool": "bash",
                    "state": { "status": "completed", "input": {"cmd": "ls"}, "output": "a.txt" }
                }}
            })
            .to_string(),
        )
        .unwrap();
        agg.apply(event);
        assert!(!agg.apply(delta("ses_1", "prt_t", "ignored")));
        assert_eq!(
            agg.messages()[0].parts(),
            &[Part::ToolInvocation {
                tool_name: "bash".into(),
                state: "completed".into(),
                input: Some(json!({"cmd": "ls"})),
                output: Some("a.txt".into()),
            }]
        );
    }

    #[test]
    fn test_tool_defaults() {
        let snap = PartSnapshot {
            kind: Some("tool".into()),
            ..Default::default()
        };
        assert_eq!(
            snap.to_part(),
            Some(Part::ToolInvocation {
                tool_name: "tool".into(),
                state: "pending".into(),
                input: None,
                output: None,
            })
        );
    }

    #[test]
    fn test_reset_clears_state() {
        let mut agg = subscribed("ses_1");
        agg.apply(updated("ses_1", "msg_1", "prt_1", "text", "a"));
        agg.reset(Some("ses_2".into()));
        assert!(agg.messages().is_empty());
        assert!(!agg.apply(delta("ses_2", "prt_1", "b")));
        assert!(agg.messages().is_empty());
    }

    #[test]
    fn test_bare_string_delta_and_missing_session() {
        let mut agg = subscribed("ses_1");
        agg.apply(updated("ses_1", "msg_1", "prt_1", "text", "a"));
        let event = SourceEvent::parse(
            r#"{"type":"message.part.delta","properties":{"partID":"prt_1","delta":"b"}}"#,
        )
        .unwrap();
        assert!(agg.apply(event));
        assert_eq!(
            agg.messages()[0].parts(),
            &[Part::Text { text: "ab".into() }]
        );
    }

    #[test]
    fn test_unsubscribed_and_noise_events() {
        let mut agg = PartAggregator::new();
        assert!(!agg.apply(updated("ses_1", "msg_1", "prt_1", "text", "a")));
        let mut agg = subscribed("ses_1");
        assert_eq!(
            SourceEvent::parse(r#"{"type":"server.heartbeat","properties":{}}"#),
            Some(SourceEvent::Other)
        );
        assert!(!agg.apply(SourceEvent::Other));
        assert!(SourceEvent::parse("{not json").is_none());
    }
}
