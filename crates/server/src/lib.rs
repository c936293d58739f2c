//! Serving shell for duplex
//!
//! Thin HTTP/WebSocket surface over the session pipeline: admission under
//! the backpressure ladder, the reliable control channel, the media
//! channel and the analytics sink.

pub mod analytics;
pub mod http;
pub mod session;
pub mod state;
pub mod websocket;

pub use analytics::{AnalyticsSink, EventRecord, InMemoryAnalytics, SessionRecord};
pub use http::create_router;
pub use session::{Session, SessionManager};
pub use state::AppState;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("session error: {0}")]
    Session(String),

    #[error(transparent)]
    Core(#[from] duplex_core::Error),

    #[error("config error: {0}")]
    Config(#[from] duplex_config::ConfigError),
}
