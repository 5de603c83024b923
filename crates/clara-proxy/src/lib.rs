//! OpenAI-compatible HTTP surface for claracore.
//!
//! Routes inference requests to the multiplexer by the `model` field of
//! the JSON body, streams responses through without buffering, and
//! exposes the admin endpoints (model listing, unload, restart, log
//! tailing).

#![deny(unsafe_code)]

pub mod body;
pub mod forward;
pub mod handlers;
pub mod models;
pub mod server;

pub use handlers::AppState;
pub use server::{router, serve};
