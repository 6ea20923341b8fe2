//! # HTTP Server Module
//!
//! axum server exposing the streaming service.
//!
//! # Endpoints
//!
//! - `/stream` - WebSocket stream (`?token=<username>`)
//! - `/rows/:kind/:id` - Row mutations
//! - `/permissions/:user_id/workspaces/:workspace_id` - Role assignments
//! - `/health`, `/metrics` - Observability

pub mod config;
pub mod data_routes;
pub mod observability_routes;
pub mod server;
pub mod stream_routes;

pub use config::HttpServerConfig;
pub use server::{AppState, HttpServer};
