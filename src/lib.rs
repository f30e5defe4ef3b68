//! Vista - conversational wellbeing support client core
//!
//! Manages persona-based chat sessions against a remote chat gateway,
//! persists conversation history locally, and plays synthesized speech for
//! assistant replies. The `vista` binary exposes the session over HTTP.

pub mod config;
pub mod conversation;
pub mod core;
pub mod providers;
pub mod routes;

use std::sync::Arc;

use crate::config::Config;
use crate::core::SessionController;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub session: Arc<SessionController>,
}
