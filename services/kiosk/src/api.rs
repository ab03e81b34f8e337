//! HTTP collaborators: the session directory/history service and the background task
//! service. The runtime only sees the traits, so tests can swap in mocks.

use anyhow::{Context, Result};
use async_trait::async_trait;
use kiosk_core::{
    directory::DirectoryListing,
    models::{ChatMessage, TaskSnapshot, Todo},
};
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

/// Session listing, creation, deletion and transcript history.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionApi: Send + Sync {
    async fn list(&self) -> Result<DirectoryListing>;
    /// Returns the key the server assigned, if it sent one.
    async fn create(&self, name: String) -> Result<Option<String>>;
    async fn delete(&self, key: String) -> Result<()>;
    async fn history(&self, key: String) -> Result<Vec<ChatMessage>>;
}

/// Background task listing, per-session todo lists and abort.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskApi: Send + Sync {
    async fn list_tasks(&self) -> Result<Vec<TaskSnapshot>>;
    async fn todos(&self, session_id: String) -> Result<Vec<Todo>>;
    async fn abort(&self, session_id: String) -> Result<()>;
}

#[derive(Deserialize)]
struct CreatedSession {
    key: Option<String>,
}

#[derive(Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    messages: Vec<ChatMessage>,
}

#[derive(Deserialize)]
struct TaskListResponse {
    #[serde(default)]
    tasks: Vec<TaskSnapshot>,
}

/// The todo endpoint answers with either a bare array or `{todos: [...]}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum TodoResponse {
    Bare(Vec<Todo>),
    Wrapped {
        #[serde(default)]
        todos: Vec<Todo>,
    },
}

impl TodoResponse {
    fn into_todos(self) -> Vec<Todo> {
        match self {
            TodoResponse::Bare(todos) | TodoResponse::Wrapped { todos } => todos,
        }
    }
}

/// Appends percent-encoded path segments to `base`.
fn endpoint(base: &str, segments: &[&str]) -> Result<Url> {
    let mut url = Url::parse(base).with_context(|| format!("Invalid base URL '{}'", base))?;
    url.path_segments_mut()
        .map_err(|_| anyhow::anyhow!("Base URL '{}' cannot carry a path", base))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// `reqwest` implementation of both collaborator traits.
#[derive(Clone)]
pub struct HttpApi {
    client: Client,
    http_base: String,
    task_base: String,
}

impl HttpApi {
    pub fn new(http_base: impl Into<String>, task_base: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            http_base: http_base.into(),
            task_base: task_base.into(),
        }
    }

    /// Base URL of the task service, which also serves the event feed.
    pub fn task_base(&self) -> &str {
        &self.task_base
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl SessionApi for HttpApi {
    async fn list(&self) -> Result<DirectoryListing> {
        let url = endpoint(&self.http_base, &["sessions"])?;
        let listing = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to request session listing")?
            .error_for_status()?
            .json::<DirectoryListing>()
            .await
            .context("Failed to decode session listing")?;
        Ok(listing)
    }

    async fn create(&self, name: String) -> Result<Option<String>> {
        let url = endpoint(&self.http_base, &["sessions"])?;
        let created = self
            .client
            .post(url)
            .json(&json!({ "name": name }))
            .send()
            .await
            .context("Failed to create session")?
            .error_for_status()?
            .json::<CreatedSession>()
            .await
            .context("Failed to decode created session")?;
        debug!(key = ?created.key, "Session created");
        Ok(created.key)
    }

    async fn delete(&self, key: String) -> Result<()> {
        let url = endpoint(&self.http_base, &["sessions", &key])?;
        self.client
            .delete(url)
            .send()
            .await
            .with_context(|| format!("Failed to delete session {}", key))?
            .error_for_status()?;
        Ok(())
    }

    async fn history(&self, key: String) -> Result<Vec<ChatMessage>> {
        let url = endpoint(&self.http_base, &["sessions", &key, "history"])?;
        let history = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to request history for {}", key))?
            .error_for_status()?
            .json::<HistoryResponse>()
            .await
            .context("Failed to decode history")?;
        Ok(history.messages)
    }
}

#[async_trait]
impl TaskApi for HttpApi {
    async fn list_tasks(&self) -> Result<Vec<TaskSnapshot>> {
        let url = endpoint(&self.task_base, &["tasks"])?;
        let listing = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to request task listing")?
            .error_for_status()?
            .json::<TaskListResponse>()
            .await
            .context("Failed to decode task listing")?;
        Ok(listing.tasks)
    }

    async fn todos(&self, session_id: String) -> Result<Vec<Todo>> {
        let url = endpoint(&self.task_base, &["session", &session_id, "todo"])?;
        let todos = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to request todos")?
            .error_for_status()?
            .json::<TodoResponse>()
            .await
            .context("Failed to decode todos")?;
        Ok(todos.into_todos())
    }

    async fn abort(&self, session_id: String) -> Result<()> {
        let url = endpoint(&self.task_base, &["session", &session_id, "abort"])?;
        self.client
            .post(url)
            .send()
            .await
            .context("Failed to abort task session")?
            .error_for_status()?;
        Ok(())
    }
}
