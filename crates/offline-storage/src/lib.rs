//! Offline Cache Storage Layer
//!
//! This crate provides the generation-aware key-value store behind the
//! offline cache, with in-memory and local disk backends.

pub mod backend;
pub mod entry;
pub mod error;
pub mod local;
pub mod memory;

pub use backend::{CacheStore, GenerationFilter, validate_generation};
pub use entry::{RequestKey, StoredResponse};
pub use error::StorageError;
pub use local::LocalStore;
pub use memory::MemoryStore;
