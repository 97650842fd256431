// onezone-relay: collaborative page sessions behind an HTTP and WebSocket
// gateway.

pub mod api;
pub mod auth;
pub mod config;
pub mod cors;
pub mod db;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod ownership;
pub mod presence;
pub mod rate_limit;
pub mod server;
pub mod session;
pub mod store;
pub mod versions;
pub mod ws;
