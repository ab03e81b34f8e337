//! Read-only snapshot of everything the presentation layer renders.

use kiosk_core::{
    aggregator::AggregatedMessage,
    directory::SessionOption,
    models::{BackgroundTask, ChatMessage, CommandTip, Todo, VoiceActivity},
    protocol::{Channel, Mode, PipelineState},
};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct KioskView {
    pub connected: bool,
    pub state: PipelineState,
    pub mode: Mode,
    pub info: Option<String>,
    pub channel: Channel,
    pub session_key: String,
    pub history: Vec<ChatMessage>,
    pub subtitle: String,
    pub vad: VoiceActivity,
    pub tips: Vec<CommandTip>,
    pub toast: Option<String>,
    pub sessions: Vec<SessionOption>,
    pub tasks: Vec<BackgroundTask>,
    pub running_tasks: usize,
    pub inspector: Option<InspectorView>,
}

/// Detail panel of the inspected background task.
#[derive(Debug, Clone, PartialEq)]
pub struct InspectorView {
    pub task: BackgroundTask,
    /// `MM:SS` since the task started.
    pub elapsed: String,
    /// Session the task runs in on the event feed, once resolved.
    pub feed_session: Option<String>,
    pub todos: Vec<Todo>,
    /// Completed todos, total todos and rounded percentage.
    pub progress: (usize, usize, u8),
    pub messages: Vec<AggregatedMessage>,
}
