//! Storage layer
//!
//! The storage port: the only component that speaks SQL. Everything else
//! goes through [`SqliteStore`]'s typed operations. The vector half of
//! the store is the in-process HNSW index, rebuilt from the `memories`
//! table on open and maintained on every write.

pub mod migrations;
mod sqlite;

pub use sqlite::{NewMemory, SqliteStore};
