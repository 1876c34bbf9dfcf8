//! Persistence - settings, network backup and mode history

mod database;

pub use database::Database;
