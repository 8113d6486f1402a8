//! Stock import service
//!
//! Bulk CSV imports for inventory workspaces: uploads are stored and recorded
//! as jobs, processed in the background by checkpointing workers, and
//! reported back through polling endpoints and a server-sent event stream.

pub mod app_state;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
pub mod store;
pub mod telemetry;
