//! Persistent block store

pub mod database;

pub use database::Database;
