//! Shared Application State
//!
//! Configuration and the HTTP collaborators, created once at startup and handed to the
//! runtime.

use crate::api::{SessionApi, TaskApi};
use crate::config::Config;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sessions: Arc<dyn SessionApi>,
    pub tasks: Arc<dyn TaskApi>,
}
