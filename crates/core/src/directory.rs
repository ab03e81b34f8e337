//! Session directory: reconciles locally created sessions with the server listing.
//!
//! Two explicit sets are kept. `persisted` is whatever the last directory refresh
//! returned; `pending` holds keys this client created and switched to before the server
//! confirmed them. A refresh drops every pending key the listing now contains.

use crate::models::{SESSION_PREFIX, SessionInfo, display_name};
use crate::protocol::Channel;
use chrono::{DateTime, Local};
use serde::Deserialize;
use std::collections::BTreeSet;

/// Response of the directory listing endpoint.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct DirectoryListing {
    #[serde(default)]
    pub sessions: Vec<SessionInfo>,
    /// Current session of the shared voice pipeline.
    #[serde(default)]
    pub current: Option<String>,
}

/// Where to go after the displayed session was deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failover {
    /// The most recently updated remaining persisted session.
    Existing(String),
    /// Nothing left: a freshly synthesized key, already marked pending.
    Placeholder(String),
}

impl Failover {
    pub fn key(&self) -> &str {
        match self {
            Failover::Existing(key) | Failover::Placeholder(key) => key,
        }
    }
}

/// One row of the session picker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOption {
    pub key: String,
    pub label: String,
    pub pending: bool,
    pub selectable: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SessionDirectory {
    persisted: Vec<SessionInfo>,
    pending: BTreeSet<String>,
    voice_current: Option<String>,
}

impl SessionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_persisted(&self, key: &str) -> bool {
        self.persisted.iter().any(|s| s.key == key)
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.pending.contains(key)
    }

    pub fn is_known(&self, key: &str) -> bool {
        self.is_persisted(key) || self.is_pending(key)
    }

    pub fn persisted(&self) -> &[SessionInfo] {
        &self.persisted
    }

    pub fn pending(&self) -> impl Iterator<Item = &str> {
        self.pending.iter().map(String::as_str)
    }

    pub fn voice_current(&self) -> Option<&str> {
        self.voice_current.as_deref()
    }

    pub fn set_voice_current(&mut self, key: &str) {
        self.voice_current = Some(key.to_string());
    }

    pub fn add_pending(&mut self, key: &str) {
        if !self.is_persisted(key) {
            self.pending.insert(key.to_string());
        }
    }

    pub fn drop_pending(&mut self, key: &str) -> bool {
        self.pending.remove(key)
    }

    /// Replaces the persisted set and confirms pending keys it now contains.
    pub fn apply_listing(&mut self, listing: DirectoryListing) {
        self.persisted = listing.sessions;
        let persisted = &self.persisted;
        self.pending
            .retain(|key| !persisted.iter().any(|s| &s.key == key));
        if let Some(current) = listing.current {
            self.voice_current = Some(current);
        }
    }

    /// Key for a user-named session, or `None` for a blank name.
    pub fn key_for_name(name: &str) -> Option<String> {
        let name = name.trim();
        if name.is_empty() {
            None
        } else {
            Some(format!("{SESSION_PREFIX}{name}"))
        }
    }

    pub fn placeholder_key(now: DateTime<Local>) -> String {
        format!("{SESSION_PREFIX}session-{}", now.format("%Y%m%d-%H%M%S"))
    }

    /// Picks the session to show after `deleted` went away. Call after the refresh that
    /// follows the delete. Sessions `channel` may not drive are skipped. A placeholder is
    /// added to the pending set.
    pub fn failover(
        &mut self,
        deleted: &str,
        channel: Channel,
        now: DateTime<Local>,
    ) -> Failover {
        self.pending.remove(deleted);
        let best = self
            .persisted
            .iter()
            .filter(|s| s.key != deleted && self.is_selectable(&s.key, channel))
            .fold(None::<&SessionInfo>, |best, candidate| match best {
                Some(b) if b.updated() >= candidate.updated() => Some(b),
                _ => Some(candidate),
            });
        match best {
            Some(session) => Failover::Existing(session.key.clone()),
            None => {
                let key = Self::placeholder_key(now);
                self.pending.insert(key.clone());
                Failover::Placeholder(key)
            }
        }
    }

    /// A session the voice pipeline currently owns cannot be picked from the keyboard.
    pub fn is_selectable(&self, key: &str, channel: Channel) -> bool {
        channel != Channel::Keyboard || self.voice_current.as_deref() != Some(key)
    }

    /// Picker rows: persisted sessions, then unconfirmed ones. With nothing known, the
    /// displayed key is offered on its own.
    pub fn options(&self, current_key: &str, channel: Channel) -> Vec<SessionOption> {
        let mut options: Vec<SessionOption> = self
            .persisted
            .iter()
            .map(|s| SessionOption {
                key: s.key.clone(),
                label: s.label(),
                pending: false,
                selectable: self.is_selectable(&s.key, channel),
            })
            .collect();
        options.extend(self.pending.iter().map(|key| SessionOption {
            key: key.clone(),
            label: display_name(key).to_string(),
            pending: true,
            selectable: self.is_selectable(key, channel),
        }));
        if options.is_empty() {
            options.push(SessionOption {
                key: current_key.to_string(),
                label: display_name(current_key).to_string(),
                pending: false,
                selectable: true,
            });
        }
        options
    }
}
