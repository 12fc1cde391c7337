//! Kinship realtime delivery.
//!
//! The server half (REST + push channel) lives in `messages`, `notifications`
//! and `ws`; the client delivery core lives in `client`. Both speak the types
//! in `wire`. The binary entry point is in main.rs.

pub mod auth;
pub mod client;
pub mod config;
pub mod db;
pub mod messages;
pub mod notifications;
pub mod profiles;
pub mod routes;
pub mod state;
pub mod wire;
pub mod ws;
