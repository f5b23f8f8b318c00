//! Storage layer of the Quiver control plane: Postgres metadata store, the
//! collection metadata cache, the pgvector-backed vector store driver, and
//! the collection lifecycle manager. In-memory twins of both stores back
//! tests and local development.

pub mod cache;
pub mod filter_sql;
pub mod lifecycle;
pub mod memory;
pub mod metadata;
pub mod pool;
pub mod schema;
pub mod vector;

pub use cache::CollectionCache;
pub use lifecycle::CollectionLifecycle;
pub use memory::{InMemoryMetadataStore, InMemoryVectorStore};
pub use metadata::PgMetadataStore;
pub use pool::connect;
pub use vector::{OPTIMIZATIONS, PgVectorStore};
