//! bfr-daemon
//!
//! The HTTP/WebSocket surface the fabric owns: execution intake (async and
//! sync paths), cancellation, execution reads, the webhook endpoint, and
//! WebSocket sessions fanned out from the cross-process pub/sub.
//!
//! `build_router` is the single entry point; `main.rs` attaches middleware.
//! Handlers are kept thin — semantics live in the worker/events crates.

pub mod auth;
pub mod routes;
pub mod state;
pub mod ws;

pub use auth::{AuthUser, EnvTokenVerifier, TokenVerifier};
pub use state::AppState;
pub use ws::Hub;
