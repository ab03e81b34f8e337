//! The kiosk event loop.
//!
//! One task owns the synchronization engine, the session directory, the event aggregator
//! and the timers. Transport envelopes, feed events, user commands, timer expiries and
//! HTTP completions all arrive through the same `select!`, so state is only ever touched
//! from here. HTTP calls run in spawned tasks and post a [`Completion`] back; nothing
//! they return is applied once the runtime's token is cancelled.

use crate::{
    api::{HttpApi, SessionApi},
    config::Config,
    feed::{self, FeedEvent},
    state::AppState,
    timers::Timers,
    view::{InspectorView, KioskView},
    ws::{self, TransportEvent, TransportHandle},
};
use chrono::{Local, Utc};
use kiosk_core::{
    aggregator::PartAggregator,
    backoff::Backoff,
    directory::{DirectoryListing, SessionDirectory},
    engine::{DirectoryNotice, Effect, SyncEngine, Timer},
    models::{ChatMessage, TaskSnapshot, Todo, format_elapsed, todo_progress},
    protocol::{Channel, Mode, PipelineState},
    tasks::TASK_DISPLAY_WINDOW,
};
use std::{future::Future, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Task listing refresh while a task is inspected.
pub const TASK_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Todo list refresh for the inspected task's session.
pub const TODO_POLL_INTERVAL: Duration = Duration::from_secs(3);
/// Refresh of the inspected task's elapsed time.
pub const ELAPSED_TICK: Duration = Duration::from_secs(1);

/// Everything the presentation layer can ask for.
#[derive(Debug, Clone, PartialEq)]
pub enum UserCommand {
    PttStart,
    PttStop,
    SetMode(Mode),
    SetChannel(Channel),
    SendText(String),
    SwitchSession(String),
    /// Creates `voice:<name>` and switches to it without waiting for the server.
    CreateSession(String),
    /// Deletes the given session, or the displayed one.
    DeleteSession(Option<String>),
    RefreshSessions,
    CancelCommand,
    /// Inspects the given task, or the first running one.
    InspectTask(Option<String>),
    CloseInspector,
    /// Aborts the inspected task.
    AbortTask,
}

/// Results of spawned HTTP calls.
#[derive(Debug)]
enum Completion {
    Listing(DirectoryListing),
    /// A create call returned. `key` is what the server assigned, if anything.
    Created {
        requested: String,
        key: Option<String>,
        listing: Option<DirectoryListing>,
    },
    History {
        key: String,
        messages: Vec<ChatMessage>,
    },
    /// `key` was deleted, here or elsewhere, and the directory was fetched again.
    SessionGone {
        key: String,
        listing: Option<DirectoryListing>,
    },
    Tasks(Vec<TaskSnapshot>),
    Todos {
        session_id: String,
        todos: Vec<Todo>,
    },
    Aborted {
        task_id: String,
    },
}

/// Receiving ends the runtime reads from.
pub struct Inputs {
    pub transport: mpsc::Receiver<TransportEvent>,
    pub feed: mpsc::Receiver<FeedEvent>,
    pub commands: mpsc::Receiver<UserCommand>,
}

pub struct Runtime {
    state: AppState,
    engine: SyncEngine,
    directory: SessionDirectory,
    aggregator: PartAggregator,
    timers: Timers,
    todos: Vec<Todo>,
    transport: TransportHandle,
    feed_target: watch::Sender<Option<String>>,
    completions: mpsc::UnboundedSender<Completion>,
    completion_rx: mpsc::UnboundedReceiver<Completion>,
    view: watch::Sender<KioskView>,
    token: CancellationToken,
}

impl Runtime {
    pub fn new(
        state: AppState,
        transport: TransportHandle,
        feed_target: watch::Sender<Option<String>>,
        view: watch::Sender<KioskView>,
        token: CancellationToken,
    ) -> Self {
        let (completions, completion_rx) = mpsc::unbounded_channel();
        let engine = SyncEngine::new(state.config.default_session.clone());
        Self {
            state,
            engine,
            directory: SessionDirectory::new(),
            aggregator: PartAggregator::new(),
            timers: Timers::new(),
            todos: Vec::new(),
            transport,
            feed_target,
            completions,
            completion_rx,
            view,
            token,
        }
    }

    #[instrument(skip_all)]
    pub async fn run(mut self, mut inputs: Inputs) {
        let mut refresh = time::interval(self.state.config.directory_refresh);
        let mut task_poll = time::interval(TASK_POLL_INTERVAL);
        let mut todo_poll = time::interval(TODO_POLL_INTERVAL);
        let mut elapsed = time::interval(ELAPSED_TICK);
        for interval in [&mut refresh, &mut task_poll, &mut todo_poll, &mut elapsed] {
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        self.publish();
        loop {
            let inspecting = self.engine.inspected_task().is_some();
            let following = self.aggregator.session_id().is_some();
            tokio::select! {
                _ = self.token.cancelled() => break,
                Some(event) = inputs.transport.recv() => self.on_transport(event),
                Some(event) = inputs.feed.recv() => self.on_feed(event),
                Some(completion) = self.completion_rx.recv() => self.on_completion(completion),
                Some(command) = inputs.commands.recv() => self.on_command(command),
                Some(timer) = self.timers.next() => self.on_timer(timer),
                _ = refresh.tick() => self.refresh_directory(),
                _ = task_poll.tick(), if inspecting => self.poll_tasks(),
                _ = todo_poll.tick(), if following => self.poll_todos(),
                _ = elapsed.tick(), if inspecting => {}
            }
            self.sync_feed_target();
            self.publish();
        }

        self.timers.clear();
        info!("Runtime stopped");
    }

    fn on_transport(&mut self, event: TransportEvent) {
        if self.token.is_cancelled() {
            return;
        }
        match event {
            TransportEvent::Opened => {
                self.engine.set_connected(true);
                self.refresh_directory();
            }
            TransportEvent::Envelope(envelope) => {
                let effects = self.engine.handle(envelope);
                self.apply(effects);
            }
            TransportEvent::Closed { retry_in } => {
                debug!(retry_in_ms = retry_in.as_millis() as u64, "Transport down");
                self.engine.set_connected(false);
            }
        }
    }

    fn on_feed(&mut self, event: FeedEvent) {
        if self.token.is_cancelled() {
            return;
        }
        match event {
            FeedEvent::Opened { session_id } => {
                if self.aggregator.session_id() == Some(session_id.as_str()) {
                    self.aggregator.reset(Some(session_id));
                }
            }
            FeedEvent::Source { session_id, event } => {
                if self.aggregator.session_id() != Some(session_id.as_str()) {
                    debug!(%session_id, "Dropping event from a previous subscription");
                    return;
                }
                self.aggregator.apply(event);
            }
        }
    }

    fn on_timer(&mut self, timer: Timer) {
        if self.token.is_cancelled() {
            return;
        }
        let effects = self.engine.timer_fired(timer);
        self.apply(effects);
    }

    fn on_command(&mut self, command: UserCommand) {
        if self.token.is_cancelled() {
            return;
        }
        let effects = match command {
            UserCommand::PttStart => self.engine.ptt_start(),
            UserCommand::PttStop => self.engine.ptt_stop(),
            UserCommand::SetMode(mode) => {
                if self.engine.state() != PipelineState::Idle {
                    info!(state = %self.engine.state(), "Mode can only change while idle");
                    return;
                }
                self.engine.set_mode(mode)
            }
            UserCommand::SetChannel(channel) => self.engine.switch_channel(channel),
            UserCommand::SendText(text) => self.engine.send_text(&text),
            UserCommand::SwitchSession(key) => return self.switch_session(&key),
            UserCommand::CreateSession(name) => return self.create_session(&name),
            UserCommand::DeleteSession(key) => {
                let key = key.unwrap_or_else(|| self.engine.session_key().to_string());
                return self.delete_session(key);
            }
            UserCommand::RefreshSessions => return self.refresh_directory(),
            UserCommand::CancelCommand => self.engine.cancel_command(),
            UserCommand::InspectTask(task_id) => {
                let task_id = task_id.or_else(|| {
                    let first = self.engine.tasks().running().next();
                    first.map(|task| task.task_id.clone())
                });
                if task_id
                    .as_deref()
                    .is_some_and(|id| self.engine.inspect_task(id))
                {
                    self.poll_tasks();
                } else {
                    debug!(?task_id, "No such task to inspect");
                }
                return;
            }
            UserCommand::CloseInspector => self.engine.close_inspector(),
            UserCommand::AbortTask => return self.abort_task(),
        };
        self.apply(effects);
    }

    fn on_completion(&mut self, completion: Completion) {
        if self.token.is_cancelled() {
            return;
        }
        match completion {
            Completion::Listing(listing) => self.directory.apply_listing(listing),
            Completion::Created {
                requested,
                key,
                listing,
            } => {
                if let Some(listing) = listing {
                    self.directory.apply_listing(listing);
                }
                let Some(key) = key.filter(|key| *key != requested) else {
                    return;
                };
                info!(%requested, session_key = %key, "Server assigned a different session key");
                self.directory.drop_pending(&requested);
                if !self.directory.is_persisted(&key) {
                    self.directory.add_pending(&key);
                }
                if self.engine.session_key() == requested {
                    self.switch_session(&key);
                }
            }
            Completion::History { key, messages } => {
                if self.engine.apply_history(&key, messages) {
                    debug!(session_key = %key, "History loaded");
                }
            }
            Completion::SessionGone { key, listing } => {
                if let Some(listing) = listing {
                    self.directory.apply_listing(listing);
                }
                if key != self.engine.session_key() {
                    self.directory.drop_pending(&key);
                    return;
                }
                let failover = self
                    .directory
                    .failover(&key, self.engine.channel(), Local::now());
                info!(deleted = %key, next = ?failover, "Displayed session is gone");
                let effects = self.engine.switch_session(failover.key());
                self.apply(effects);
            }
            Completion::Tasks(snapshot) => {
                for task_id in self.engine.tasks_mut().apply_snapshot(snapshot) {
                    self.timers
                        .schedule(Timer::TaskEviction(task_id), TASK_DISPLAY_WINDOW);
                }
            }
            Completion::Todos { session_id, todos } => {
                if self.aggregator.session_id() == Some(session_id.as_str()) {
                    self.todos = todos;
                }
            }
            Completion::Aborted { task_id } => {
                let effects = self.engine.remove_task(&task_id);
                self.apply(effects);
            }
        }
    }

    /// Carries out engine effects in order.
    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send(envelope) => {
                    self.transport.send(envelope);
                }
                Effect::LoadHistory(key) => self.load_history(key),
                Effect::Directory(notice) => self.on_directory_notice(notice),
                Effect::Schedule(timer, after) => self.timers.schedule(timer, after),
                Effect::Cancel(timer) => {
                    self.timers.cancel(&timer);
                }
            }
        }
    }

    fn on_directory_notice(&mut self, notice: DirectoryNotice) {
        match notice {
            DirectoryNotice::Current { key, channel } => {
                if channel == Channel::Voice {
                    self.directory.set_voice_current(&key);
                }
                if !self.directory.is_known(&key) {
                    self.refresh_directory();
                }
            }
            DirectoryNotice::Updated(_) => self.refresh_directory(),
            DirectoryNotice::Deleted(key) => {
                if key == self.engine.session_key() {
                    let sessions = self.state.sessions.clone();
                    self.spawn(async move {
                        let listing = sessions
                            .list()
                            .await
                            .inspect_err(|e| warn!(error = %e, "Directory refresh failed"))
                            .ok();
                        Some(Completion::SessionGone { key, listing })
                    });
                } else {
                    self.directory.drop_pending(&key);
                    self.refresh_directory();
                }
            }
        }
    }

    fn switch_session(&mut self, key: &str) {
        let key = key.trim();
        if key.is_empty() || key == self.engine.session_key() {
            return;
        }
        if !self.directory.is_selectable(key, self.engine.channel()) {
            warn!(session_key = %key, "Session is driven by the voice channel, not switching");
            return;
        }
        let effects = self.engine.switch_session(key);
        self.apply(effects);
    }

    fn create_session(&mut self, name: &str) {
        let Some(key) = SessionDirectory::key_for_name(name) else {
            debug!("Ignoring blank session name");
            return;
        };
        if !self.directory.is_selectable(&key, self.engine.channel()) {
            warn!(session_key = %key, "Session is driven by the voice channel, not switching");
            return;
        }
        self.directory.add_pending(&key);
        let effects = self.engine.switch_session(&key);
        self.apply(effects);

        let sessions = self.state.sessions.clone();
        let name = name.trim().to_string();
        self.spawn(async move {
            let created = sessions
                .create(name)
                .await
                .inspect_err(|e| warn!(error = %e, "Session create failed"))
                .ok()
                .flatten();
            let listing = sessions
                .list()
                .await
                .inspect_err(|e| warn!(error = %e, "Directory refresh failed"))
                .ok();
            Some(Completion::Created {
                requested: key,
                key: created,
                listing,
            })
        });
    }

    fn delete_session(&mut self, key: String) {
        info!(session_key = %key, "Deleting session");
        self.directory.drop_pending(&key);
        let sessions = self.state.sessions.clone();
        self.spawn(async move {
            match sessions.delete(key.clone()).await {
                Ok(()) => {
                    let listing = sessions
                        .list()
                        .await
                        .inspect_err(|e| warn!(error = %e, "Directory refresh failed"))
                        .ok();
                    Some(Completion::SessionGone { key, listing })
                }
                Err(e) => {
                    warn!(error = %e, session_key = %key, "Session delete failed");
                    list_sessions(sessions.as_ref()).await
                }
            }
        });
    }

    fn abort_task(&mut self) {
        let Some(task_id) = self.engine.inspected_task().map(|t| t.task_id.clone()) else {
            debug!("No inspected task to abort");
            return;
        };
        let Some(session_id) = self.engine.tasks().resolve_session(&task_id) else {
            let effects = self.engine.remove_task(&task_id);
            return self.apply(effects);
        };
        info!(%task_id, %session_id, "Aborting background task");
        let tasks = self.state.tasks.clone();
        self.spawn(async move {
            if let Err(e) = tasks.abort(session_id).await {
                warn!(error = %e, "Task abort failed");
            }
            Some(Completion::Aborted { task_id })
        });
    }

    fn refresh_directory(&self) {
        let sessions = self.state.sessions.clone();
        self.spawn(async move { list_sessions(sessions.as_ref()).await });
    }

    fn load_history(&self, key: String) {
        let sessions = self.state.sessions.clone();
        self.spawn(async move {
            match sessions.history(key.clone()).await {
                Ok(messages) => Some(Completion::History { key, messages }),
                Err(e) => {
                    warn!(error = %e, session_key = %key, "History fetch failed");
                    None
                }
            }
        });
    }

    fn poll_tasks(&self) {
        let tasks = self.state.tasks.clone();
        self.spawn(async move {
            tasks
                .list_tasks()
                .await
                .inspect_err(|e| warn!(error = %e, "Task listing failed"))
                .ok()
                .map(Completion::Tasks)
        });
    }

    fn poll_todos(&self) {
        let Some(session_id) = self.aggregator.session_id().map(str::to_string) else {
            return;
        };
        let tasks = self.state.tasks.clone();
        self.spawn(async move {
            match tasks.todos(session_id.clone()).await {
                Ok(todos) => Some(Completion::Todos { session_id, todos }),
                Err(e) => {
                    warn!(error = %e, %session_id, "Todo fetch failed");
                    None
                }
            }
        });
    }

    /// Points the event feed at the inspected task's session, if it has one.
    fn sync_feed_target(&mut self) {
        let target = self
            .engine
            .inspected_task()
            .and_then(|task| self.engine.tasks().resolve_session(&task.task_id));
        if target.as_deref() == self.aggregator.session_id() {
            return;
        }
        info!(session_id = ?target, "Following event feed session");
        self.aggregator.reset(target.clone());
        self.todos.clear();
        let follow = target.is_some();
        self.feed_target.send_replace(target);
        if follow {
            self.poll_todos();
        }
    }

    fn spawn<F>(&self, work: F)
    where
        F: Future<Output = Option<Completion>> + Send + 'static,
    {
        let completions = self.completions.clone();
        let token = self.token.clone();
        tokio::spawn(async move {
            let completion = work.await;
            if token.is_cancelled() {
                return;
            }
            if let Some(completion) = completion {
                let _ = completions.send(completion);
            }
        });
    }

    fn snapshot(&self) -> KioskView {
        let tasks = self.engine.tasks();
        let inspector = self.engine.inspected_task().map(|task| InspectorView {
            task: task.clone(),
            elapsed: format_elapsed(tasks.elapsed_secs(&task.task_id, Utc::now()).unwrap_or(0)),
            feed_session: self.aggregator.session_id().map(str::to_string),
            todos: self.todos.clone(),
            progress: todo_progress(&self.todos),
            messages: self.aggregator.messages().to_vec(),
        });
        KioskView {
            connected: self.engine.connected(),
            state: self.engine.state(),
            mode: self.engine.mode(),
            info: self.engine.info().map(str::to_string),
            channel: self.engine.channel(),
            session_key: self.engine.session_key().to_string(),
            history: self.engine.history().to_vec(),
            subtitle: self.engine.subtitle().to_string(),
            vad: self.engine.vad(),
            tips: self.engine.tips().to_vec(),
            toast: self.engine.toast().map(str::to_string),
            sessions: self
                .directory
                .options(self.engine.session_key(), self.engine.channel()),
            tasks: tasks.all().to_vec(),
            running_tasks: tasks.running_count(),
            inspector,
        }
    }

    fn publish(&self) {
        let view = self.snapshot();
        self.view.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
    }
}

async fn list_sessions(sessions: &dyn SessionApi) -> Option<Completion> {
    sessions
        .list()
        .await
        .inspect_err(|e| warn!(error = %e, "Directory refresh failed"))
        .ok()
        .map(Completion::Listing)
}

/// A running kiosk: the view to render, the command inbox and the background tasks.
pub struct Kiosk {
    pub view: watch::Receiver<KioskView>,
    pub commands: mpsc::Sender<UserCommand>,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Kiosk {
    /// Wires the transport, the event feed and the runtime together and starts them.
    pub fn launch(config: Config, token: CancellationToken) -> Self {
        let api = Arc::new(HttpApi::new(
            config.http_base.clone(),
            config.task_base.clone(),
        ));

        let (transport_tx, transport_rx) = mpsc::channel(256);
        let (transport, transport_task) = ws::spawn(
            config.ws_url.clone(),
            Backoff::new(config.reconnect_base, config.reconnect_max),
            transport_tx,
            token.child_token(),
        );

        let (feed_target, feed_target_rx) = watch::channel(None);
        let (feed_tx, feed_rx) = mpsc::channel(256);
        let feed_task = feed::spawn(
            api.client().clone(),
            api.task_base(),
            Backoff::new(config.feed_reconnect_base, config.reconnect_max),
            feed_target_rx,
            feed_tx,
            token.child_token(),
        );

        let (commands, command_rx) = mpsc::channel(64);
        let (view_tx, view) = watch::channel(KioskView::default());
        let state = AppState {
            config: Arc::new(config),
            sessions: api.clone(),
            tasks: api,
        };
        let runtime = Runtime::new(state, transport, feed_target, view_tx, token.child_token());
        let runtime_task = tokio::spawn(runtime.run(Inputs {
            transport: transport_rx,
            feed: feed_rx,
            commands: command_rx,
        }));

        Self {
            view,
            commands,
            token,
            tasks: vec![transport_task, feed_task, runtime_task],
        }
    }

    /// Cancels everything and waits for the background tasks to finish.
    pub async fn shutdown(self) {
        self.token.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Kiosk task failed");
            }
        }
    }
}
