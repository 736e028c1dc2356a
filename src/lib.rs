#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! agentmux library — browser access to long-lived agent sessions.
//!
//! - `protocol` — frame types and the MessagePack/JSON codecs
//! - `process` — PTY, stream-JSON and SSH backed processes, graceful termination
//! - `sessions` — session registry, replay history, output fan-out, reaper
//! - `chat` — agent record translation and the conversation log
//! - `mux` — WebSocket connections and the subscription hub
//! - `store` — session metadata and remote host credentials
//! - `routes` — REST handlers
//! - `auth` — API key checks
//! - `config` — configuration loading

pub mod auth;
pub mod chat;
pub mod config;
pub mod error;
pub mod mux;
pub mod process;
pub mod protocol;
pub mod routes;
pub mod sessions;
pub mod state;
pub mod store;
pub mod util;

use axum::{
    middleware,
    routing::{delete, get},
    Extension, Router,
};
use tower_http::trace::TraceLayer;

pub use auth::ApiKey;
pub use config::Config;
pub use sessions::SessionRegistry;
pub use state::AppState;

/// Build the full HTTP/WebSocket router.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/api/health", get(routes::health::health))
        .route("/api/ws", get(mux::ws_upgrade));

    let authed_routes = Router::new()
        .route("/api/sessions", get(routes::sessions::list_sessions))
        .route("/api/sessions/{id}", delete(routes::sessions::close_session))
        .layer(middleware::from_fn(auth::require_api_key));

    Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .layer(Extension(ApiKey(state.config.auth.api_key.clone())))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
