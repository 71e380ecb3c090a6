//! Database connection and initialization.

pub use pusher_core::db::DatabaseError;

pusher_core::define_database!(TokenDatabase, "Token store migrations complete");
