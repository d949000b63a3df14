//! Data layer module
//!
//! Handles all data persistence:
//! - SQLite database operations
//! - Entity models shared by the federation engine and local services

mod database;
mod models;

pub use database::Database;
pub use models::*;
