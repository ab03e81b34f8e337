//! Line-oriented front end: parses console input into commands and turns view changes
//! into printable lines.

use crate::{runtime::UserCommand, view::KioskView};
use kiosk_core::{
    aggregator::Part,
    models::{ChatMessage, display_name},
    protocol::Role,
};

pub const HELP: &str = "\
/ptt                     start capture
/stop                    stop capture
/mode ptt|natural        change interaction mode (only while idle)
/channel voice|keyboard  change channel
/session <key>           switch session
/new <name>              create a session and switch to it
/delete [key]            delete a session (default: the displayed one)
/sessions                list sessions
/cancel                  cancel the running command
/tasks                   list background tasks
/task [id]               inspect a task (default: first running)
/close                   close the task inspector
/abort                   abort the inspected task
/quit, /exit             exit
anything else            sent as text";

#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Command(UserCommand),
    /// Refresh and print the session list.
    Sessions,
    Tasks,
    Help,
    Quit,
    Invalid(String),
}

/// Parses one console line. Blank lines yield `None`.
pub fn parse(line: &str) -> Option<Input> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Some(Input::Command(UserCommand::SendText(line.to_string())));
    };
    let (verb, arg) = match rest.split_once(char::is_whitespace) {
        Some((verb, arg)) => (verb, arg.trim()),
        None => (rest, ""),
    };
    let arg = (!arg.is_empty()).then(|| arg.to_string());

    let input = match (verb, arg) {
        ("ptt", None) => Input::Command(UserCommand::PttStart),
        ("stop", None) => Input::Command(UserCommand::PttStop),
        ("mode", Some(mode)) => match mode.parse() {
            Ok(mode) => Input::Command(UserCommand::SetMode(mode)),
            Err(e) => Input::Invalid(e),
        },
        ("channel", Some(channel)) => match channel.parse() {
            Ok(channel) => Input::Command(UserCommand::SetChannel(channel)),
            Err(e) => Input::Invalid(e),
        },
        ("session", Some(key)) => Input::Command(UserCommand::SwitchSession(key)),
        ("new", Some(name)) => Input::Command(UserCommand::CreateSession(name)),
        ("delete", key) => Input::Command(UserCommand::DeleteSession(key)),
        ("sessions", None) => Input::Sessions,
        ("cancel", None) => Input::Command(UserCommand::CancelCommand),
        ("tasks", None) => Input::Tasks,
        ("task", id) => Input::Command(UserCommand::InspectTask(id)),
        ("close", None) => Input::Command(UserCommand::CloseInspector),
        ("abort", None) => Input::Command(UserCommand::AbortTask),
        ("help", None) => Input::Help,
        ("quit" | "exit", None) => Input::Quit,
        (verb, _) => Input::Invalid(format!("unknown or malformed command '/{verb}', try /help")),
    };
    Some(input)
}

fn message_line(message: &ChatMessage) -> String {
    let speaker = match message.role {
        Role::User => "you",
        Role::Assistant => "assistant",
    };
    if message.is_error() {
        format!("[!] {}: {}", speaker, message.text)
    } else {
        format!("{}: {}", speaker, message.text)
    }
}

fn part_line(part: &Part) -> String {
    match part {
        Part::Text { text } => format!("    {}", text),
        Part::Reasoning { text } => format!("    (thinking) {}", text),
        Part::ToolInvocation {
            tool_name, state, ..
        } => format!("    [{}] {}", tool_name, state),
    }
}

/// Lines describing what changed between two views.
pub fn changes(prev: &KioskView, next: &KioskView) -> Vec<String> {
    let mut lines = Vec::new();

    if prev.connected != next.connected {
        lines.push(if next.connected {
            "* connected".to_string()
        } else {
            "* disconnected, reconnecting".to_string()
        });
    }
    if prev.state != next.state || prev.mode != next.mode || prev.info != next.info {
        let info = next.info.as_deref().map(|i| format!(" ({i})")).unwrap_or_default();
        lines.push(format!("* {} [{:?}]{}", next.state, next.mode, info));
    }
    if prev.channel != next.channel {
        lines.push(format!("* channel: {:?}", next.channel));
    }

    let same_session = prev.session_key == next.session_key;
    if !same_session {
        lines.push(format!("* session: {}", display_name(&next.session_key)));
    }
    let appended = same_session
        && next.history.len() >= prev.history.len()
        && next.history.starts_with(&prev.history);
    let fresh = if appended {
        &next.history[prev.history.len()..]
    } else {
        &next.history[..]
    };
    lines.extend(fresh.iter().map(message_line));

    if prev.subtitle != next.subtitle && !next.subtitle.is_empty() {
        lines.push(format!("  ... {}", next.subtitle));
    }

    let tips_appended = next.tips.len() > prev.tips.len() && next.tips.starts_with(&prev.tips);
    if tips_appended {
        lines.extend(
            next.tips[prev.tips.len()..]
                .iter()
                .map(|tip| format!("  tip: {}", tip.text)),
        );
    } else if next.tips.is_empty() && !prev.tips.is_empty() {
        lines.push("  tips dismissed".to_string());
    }

    if let Some(toast) = next.toast.as_deref() {
        if prev.toast.as_deref() != Some(toast) {
            lines.push(format!("! {}", toast));
        }
    }

    if prev.running_tasks != next.running_tasks {
        lines.push(format!("* background tasks running: {}", next.running_tasks));
    }

    match (&prev.inspector, &next.inspector) {
        (_, Some(next_inspector)) => {
            let task = &next_inspector.task;
            let status_changed = prev
                .inspector
                .as_ref()
                .is_none_or(|p| p.task.task_id != task.task_id || p.task.status != task.status);
            if status_changed {
                lines.push(format!(
                    "# task {} [{:?}] {}",
                    task.task_id, task.status, task.description
                ));
            }
            let progress_changed = prev
                .inspector
                .as_ref()
                .is_none_or(|p| p.progress != next_inspector.progress);
            if progress_changed && next_inspector.progress.1 > 0 {
                let (done, total, pct) = next_inspector.progress;
                lines.push(format!("# todos {done}/{total} ({pct}%)"));
            }
            let messages_changed = prev
                .inspector
                .as_ref()
                .is_none_or(|p| p.messages != next_inspector.messages);
            if messages_changed {
                if let Some(last) = next_inspector.messages.last() {
                    lines.extend(last.parts().iter().map(part_line));
                }
            }
        }
        (Some(_), None) => lines.push("# inspector closed".to_string()),
        (None, None) => {}
    }

    lines
}

/// The session picker as printable lines.
pub fn session_list(view: &KioskView) -> Vec<String> {
    view.sessions
        .iter()
        .map(|option| {
            let marker = if option.key == view.session_key { '>' } else { ' ' };
            let mut line = format!("{} {} [{}]", marker, option.label, option.key);
            if option.pending {
                line.push_str(" (pending)");
            }
            if !option.selectable {
                line.push_str(" (in use by voice)");
            }
            line
        })
        .collect()
}

pub fn task_list(view: &KioskView) -> Vec<String> {
    if view.tasks.is_empty() {
        return vec!["no background tasks".to_string()];
    }
    view.tasks
        .iter()
        .map(|task| format!("{} [{:?}] {}", task.task_id, task.status, task.description))
        .collect()
}
