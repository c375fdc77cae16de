//! Per-session document storage for the Breach module runtime.
//!
//! The module registry keeps one small document collection per session
//! (`modules.db`). This crate provides the storage contract and its two
//! backends:
//!
//! | Backend | Session kind | Persistence |
//! |---------|--------------|-------------|
//! | [`FileStore`] | Normal | One JSON array file, atomic rewrites |
//! | [`MemoryStore`] | Off-the-record | None (dies with the session) |
//!
//! The contract is deliberately tiny (equality-query [`find`],
//! [`upsert`], and [`remove`]) because that is all the registry needs.
//!
//! [`find`]: DocumentStore::find
//! [`upsert`]: DocumentStore::upsert
//! [`remove`]: DocumentStore::remove

mod error;
mod file;
mod memory;
mod store;

pub use error::StoreError;
pub use file::FileStore;
pub use memory::MemoryStore;
pub use store::{DocumentStore, Query};
