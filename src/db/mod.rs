// src/db/mod.rs
// Embedded storage: pooled SQLite with sqlite-vec, schema, ingestor state.

pub mod pool;
pub mod schema;
pub mod state;

pub use pool::DatabasePool;
pub use state::{IngestorState, StateStore};
