//! Vector search
//!
//! HNSW approximate-nearest-neighbour index over live memory embeddings.
//! The index mirrors the `memories` table: rows enter on insert, leave on
//! soft delete, and are re-pointed when a fold evolution replaces an
//! embedding.

mod vector;

pub use vector::{VectorIndex, VectorIndexConfig, VectorSearchError};
