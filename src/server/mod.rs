//! # Server Adapter
//!
//! Exposes the core over HTTP and WebSocket with axum. Nothing here knows how
//! providers work; routes call into the registry and the chat loop hands each
//! frame to [`ChatSession`].
//!
//! - `GET  /api/models`          combined model catalog
//! - `GET  /api/health`          liveness check
//! - `GET  /api/models/status`   which provider caches are loaded
//! - `POST /api/models/refresh`  clear caches, reload, report counts
//! - `GET  /ws/chat`             streaming chat, one exchange at a time

mod router;
mod routes;
mod ws;

use std::fmt;
use std::io;
use std::sync::Arc;

use crate::core::registry::ModelRegistry;
use crate::core::session::ChatSession;

pub use router::{build_router, serve};

/// Shared handles for every route.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ModelRegistry>,
    pub session: Arc<ChatSession>,
}

impl AppState {
    pub fn new(session: Arc<ChatSession>) -> Self {
        Self {
            registry: session.registry().clone(),
            session,
        }
    }
}

#[derive(Debug)]
pub enum ServerError {
    Bind { addr: String, source: io::Error },
    Serve(io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Bind { addr, source } => write!(f, "failed to bind {addr}: {source}"),
            ServerError::Serve(e) => write!(f, "server error: {e}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Bind { source, .. } => Some(source),
            ServerError::Serve(e) => Some(e),
        }
    }
}
