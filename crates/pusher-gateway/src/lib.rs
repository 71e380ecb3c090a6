//! Pusher APNS Gateway Library
//!
//! Core functionality for the gateway:
//! - APNS wire layer (notifications, error taxonomy, HTTP/2 client)
//! - Provider-token signing
//! - Credential registry and per-identity delivery pools
//! - `SQLite` device-token store
//! - Delivery coordinator and its HTTP surface

pub mod apns;
pub mod auth;
pub mod coordinator;
pub mod pool;
pub mod registry;
pub mod server;
pub mod storage;

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod test_helpers;
