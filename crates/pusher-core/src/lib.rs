//! `Pusher` Core Library
//!
//! Shared functionality for the `Pusher` gateway:
//! - Gateway configuration resolution and hierarchy
//! - `SQLite` pool helpers and the `define_database!` macro
//! - Tracing subscriber initialisation
//! - Common error types

pub mod config;
pub mod db;
pub mod error;
pub mod tracing_init;

pub use config::GatewayConfig;
pub use error::{Error, Result};
