//! Persistence for the dispatch job queue.
//!
//! This crate provides the [`JobStore`] seam the queue actors write through,
//! with a SurrealDB implementation and an in-memory one.
//!
//! # Features
//!
//! - `memory` (default): Use in-memory SurrealDB storage
//! - `rocksdb`: Use RocksDB for persistent file-based storage

mod connection;
mod memory;
mod schema;
mod store;
pub mod repositories;

pub use connection::{Database, DbConfig, DbError, connect};
pub use memory::MemoryStore;
pub use schema::init_schema;
pub use store::{JobStore, StoreFuture, SurrealStore};
