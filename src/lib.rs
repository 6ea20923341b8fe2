//! livesync - change-data-capture streaming over WebSockets
//!
//! Clients declare which rows they already hold and which rows they want;
//! the server reconciles that against the database, then streams every
//! insert, update, and delete that affects the client's view.

pub mod cli;
pub mod config;
pub mod http_server;
pub mod memory;
pub mod observability;
pub mod realtime;
pub mod stream;
