//! Tiered conversation/fact persistence on SQLite.
//!
//! Two concerns live here: session history (sliding-window pruned, with a
//! short head summary and TTL timestamps) and user profiles carrying three
//! fact tiers — curated (high importance, no TTL), daily (60-day TTL), and
//! a read-only legacy bucket. Document-shaped payloads are JSON columns;
//! Mongo-style TTL indexes are emulated by `expires_at` columns swept once
//! a day by the scheduler crate.

pub mod catalog;
pub mod db;
pub mod error;
pub mod facts;
pub mod store;
pub mod types;

pub use catalog::ProductCatalog;
pub use error::MemoryError;
pub use facts::{cosine_similarity, FactInsert, FactInsertOutcome, FactQuery};
pub use store::MemoryStore;
pub use types::{Fact, FactSource, FactTier, SessionMetadata, StoredSession, UserProfile};
