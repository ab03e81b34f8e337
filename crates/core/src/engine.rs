//! Session synchronization engine.
//!
//! Holds the local mirror of the server-owned pipeline: state, mode, the displayed
//! session and channel, transcript, subtitle, voice activity, command tips and the
//! background task registry. The engine performs no I/O. Every handler returns the
//! [`Effect`]s the runtime must carry out, in order.
//!
//! Content-bearing envelopes are filtered against the *displayed* session: the voice
//! channel is shared, so another client may be driving a different session at the same
//! time.

use crate::models::{
    BackgroundTask, ChatMessage, CommandTip, TaskStatus, VoiceActivity, display_name,
};
use crate::protocol::{Channel, ClientEnvelope, Mode, PipelineState, ServerEnvelope};
use crate::tasks::{Finish, TASK_DISPLAY_WINDOW, TaskTracker};
use chrono::Utc;
use std::time::Duration;
use tracing::{debug, info};

/// Command tips close after this much time without a new tip.
pub const COMMAND_TIP_IDLE: Duration = Duration::from_secs(120);
pub const TOAST_DURATION: Duration = Duration::from_secs(4);

/// Timers the runtime arms on the engine's behalf.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Timer {
    CommandTip,
    Toast,
    TaskEviction(String),
}

/// What the session directory needs to hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryNotice {
    /// The displayed session changed (server-driven or user-driven).
    Current { key: String, channel: Channel },
    Updated(String),
    Deleted(String),
}

/// Side effects requested by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Send(ClientEnvelope),
    LoadHistory(String),
    Directory(DirectoryNotice),
    /// Arms the timer, replacing any pending instance of it.
    Schedule(Timer, Duration),
    Cancel(Timer),
}

#[derive(Debug, Clone)]
pub struct SyncEngine {
    state: PipelineState,
    mode: Mode,
    info: Option<String>,
    channel: Channel,
    session_key: String,
    history: Vec<ChatMessage>,
    subtitle: String,
    vad: VoiceActivity,
    tips: Vec<CommandTip>,
    toast: Option<String>,
    connected: bool,
    tasks: TaskTracker,
}

impl SyncEngine {
    /// Creates an engine showing `default_session` until the server announces its own.
    pub fn new(default_session: impl Into<String>) -> Self {
        Self {
            state: PipelineState::Idle,
            mode: Mode::Ptt,
            info: None,
            channel: Channel::Voice,
            session_key: default_session.into(),
            history: Vec::new(),
            subtitle: String::new(),
            vad: VoiceActivity::default(),
            tips: Vec::new(),
            toast: None,
            connected: false,
            tasks: TaskTracker::new(),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn info(&self) -> Option<&str> {
        self.info.as_deref()
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn subtitle(&self) -> &str {
        &self.subtitle
    }

    pub fn vad(&self) -> VoiceActivity {
        self.vad
    }

    pub fn tips(&self) -> &[CommandTip] {
        &self.tips
    }

    pub fn toast(&self) -> Option<&str> {
        self.toast.as_deref()
    }

    pub fn connected(&self) -> bool {
        self.connected
    }

    pub fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    pub fn tasks_mut(&mut self) -> &mut TaskTracker {
        &mut self.tasks
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    fn is_displayed(&self, session_key: Option<&str>) -> bool {
        session_key.is_none_or(|key| key == self.session_key)
    }

    /// Adopts `key` as the displayed session and asks for its history.
    fn adopt_session(&mut self, key: String, effects: &mut Vec<Effect>) {
        info!(session_key = %key, channel = ?self.channel, "Displayed session changed");
        self.session_key = key.clone();
        self.history.clear();
        self.subtitle.clear();
        effects.push(Effect::LoadHistory(key.clone()));
        effects.push(Effect::Directory(DirectoryNotice::Current {
            key,
            channel: self.channel,
        }));
    }

    fn finish_task(&mut self, task_id: &str, status: &str, effects: &mut Vec<Effect>) {
        if self.tasks.finish(task_id, TaskStatus::from_wire(status)) == Finish::Retained {
            effects.push(Effect::Schedule(
                Timer::TaskEviction(task_id.to_string()),
                TASK_DISPLAY_WINDOW,
            ));
        }
    }

    /// Applies one inbound envelope to the mirror.
    pub fn handle(&mut self, envelope: ServerEnvelope) -> Vec<Effect> {
        let mut effects = Vec::new();
        match envelope {
            ServerEnvelope::StateChanged { state, mode, info } => {
                self.state = state;
                if let Some(mode) = mode.as_deref().and_then(|m| m.parse().ok()) {
                    self.mode = mode;
                }
                self.info = info;
            }
            ServerEnvelope::UserText { text, session_key } => {
                if self.is_displayed(session_key.as_deref()) {
                    self.history.push(ChatMessage::user(text));
                    self.subtitle.clear();
                }
            }
            ServerEnvelope::AssistantChunk {
                text,
                done,
                session_key,
            } => {
                if !done && self.is_displayed(session_key.as_deref()) {
                    self.subtitle.push_str(&text);
                }
            }
            ServerEnvelope::AssistantText { text, session_key } => {
                if self.is_displayed(session_key.as_deref()) {
                    self.history.push(ChatMessage::assistant(text));
                    self.subtitle.clear();
                }
            }
            ServerEnvelope::Error { text } => {
                self.history.push(ChatMessage::error(text));
            }
            ServerEnvelope::SessionInit { current } => {
                // The server's current session wins over whatever this client remembered.
                self.adopt_session(current, &mut effects);
            }
            ServerEnvelope::SessionSwitched { key } => {
                self.adopt_session(key, &mut effects);
            }
            ServerEnvelope::ChannelSwitched {
                channel,
                session_key,
            } => {
                info!(?channel, "Channel switched");
                self.channel = channel;
                if let Some(key) = session_key {
                    self.adopt_session(key, &mut effects);
                }
            }
            ServerEnvelope::SessionUpdated { key } => {
                effects.push(Effect::Directory(DirectoryNotice::Updated(key)));
            }
            ServerEnvelope::SessionDeleted { key } => {
                effects.push(Effect::Directory(DirectoryNotice::Deleted(key)));
            }
            ServerEnvelope::CommandTip { role, text } => {
                self.tips.push(CommandTip { role, text });
                effects.push(Effect::Schedule(Timer::CommandTip, COMMAND_TIP_IDLE));
            }
            ServerEnvelope::VadSpeechStart { probability } => {
                self.vad = VoiceActivity {
                    is_speech: true,
                    probability: VoiceActivity::clamp_probability(probability),
                };
            }
            ServerEnvelope::VadSpeechEnd { probability } => {
                self.vad = VoiceActivity {
                    is_speech: false,
                    probability: VoiceActivity::clamp_probability(probability),
                };
            }
            ServerEnvelope::VadStatus { probability, .. } => {
                self.vad.probability = VoiceActivity::clamp_probability(probability);
            }
            ServerEnvelope::TaskStarted {
                task_id,
                description,
            } => {
                info!(%task_id, "Background task started");
                self.tasks.start(&task_id, &description, Utc::now());
            }
            ServerEnvelope::TaskCompletedOtherSession {
                task_id,
                session_key,
                status,
            } => {
                let verb = if TaskStatus::from_wire(&status) == TaskStatus::Error {
                    "failed"
                } else {
                    "finished"
                };
                self.toast = Some(format!(
                    "Background task {} in session {}",
                    verb,
                    display_name(&session_key)
                ));
                effects.push(Effect::Schedule(Timer::Toast, TOAST_DURATION));
                self.finish_task(&task_id, &status, &mut effects);
            }
            ServerEnvelope::TaskCompleted {
                task_id, status, ..
            } => {
                self.finish_task(&task_id, &status, &mut effects);
            }
            ServerEnvelope::Unknown => {
                debug!("Ignoring envelope with unknown type");
            }
        }
        effects
    }

    /// Installs a fetched transcript if it still belongs to the displayed session.
    pub fn apply_history(&mut self, key: &str, messages: Vec<ChatMessage>) -> bool {
        if key != self.session_key {
            debug!(session_key = %key, "Discarding stale history");
            return false;
        }
        self.history = messages;
        true
    }

    pub fn timer_fired(&mut self, timer: Timer) -> Vec<Effect> {
        match timer {
            Timer::CommandTip => self.cancel_command(),
            Timer::Toast => {
                self.toast = None;
                Vec::new()
            }
            Timer::TaskEviction(task_id) => {
                self.tasks.evict(&task_id);
                Vec::new()
            }
        }
    }

    pub fn ptt_start(&self) -> Vec<Effect> {
        vec![Effect::Send(ClientEnvelope::PttStart)]
    }

    pub fn ptt_stop(&self) -> Vec<Effect> {
        vec![Effect::Send(ClientEnvelope::PttStop)]
    }

    /// Requests a mode change; the mirror changes when `state_changed` echoes it.
    pub fn set_mode(&self, mode: Mode) -> Vec<Effect> {
        vec![Effect::Send(ClientEnvelope::SetMode { mode })]
    }

    pub fn send_text(&self, text: &str) -> Vec<Effect> {
        let text = text.trim();
        if text.is_empty() {
            return Vec::new();
        }
        vec![Effect::Send(ClientEnvelope::TextInput {
            text: text.to_string(),
        })]
    }

    /// Switches the displayed session right away and tells the server.
    pub fn switch_session(&mut self, key: &str) -> Vec<Effect> {
        let mut effects = vec![Effect::Send(ClientEnvelope::SwitchSession {
            key: key.to_string(),
        })];
        self.adopt_session(key.to_string(), &mut effects);
        effects
    }

    /// Requests a channel change; the mirror changes on `channel_switched`.
    pub fn switch_channel(&self, channel: Channel) -> Vec<Effect> {
        vec![Effect::Send(ClientEnvelope::SetChannel { channel })]
    }

    /// Dismisses the command tips and cancels the in-flight command.
    pub fn cancel_command(&mut self) -> Vec<Effect> {
        self.tips.clear();
        vec![
            Effect::Cancel(Timer::CommandTip),
            Effect::Send(ClientEnvelope::CancelCommand),
        ]
    }

    pub fn inspect_task(&mut self, task_id: &str) -> bool {
        self.tasks.inspect(task_id)
    }

    /// Closes the task inspector. A retained terminal task goes with it.
    pub fn close_inspector(&mut self) -> Vec<Effect> {
        match self.tasks.close_inspector() {
            Some(task_id) => vec![Effect::Cancel(Timer::TaskEviction(task_id))],
            None => Vec::new(),
        }
    }

    pub fn remove_task(&mut self, task_id: &str) -> Vec<Effect> {
        self.tasks.evict(task_id);
        vec![Effect::Cancel(Timer::TaskEviction(task_id.to_string()))]
    }

    pub fn inspected_task(&self) -> Option<&BackgroundTask> {
        self.tasks.inspected()
    }
}
