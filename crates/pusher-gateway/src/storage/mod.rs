//! `SQLite` storage for device tokens.
//!
//! Tokens live in buckets named after their topic; sandbox buckets carry a
//! `~` prefix so the two environments never mix.

mod db;
mod record;
mod tokens;


pub use db::{DatabaseError, TokenDatabase};
pub use record::{TokenRecord, bucket_name};
