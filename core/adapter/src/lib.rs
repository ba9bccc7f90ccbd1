//! Remote adapter abstraction for SyncBridge.
//!
//! This module provides the trait-based interface the sync engine uses to
//! talk to each remote system, plus an in-memory adapter for tests and
//! local development.
//!
//! # Design Principles
//! - Adapter isolation: no remote-specific logic (auth, pagination,
//!   webhook formats) leaks into the sync engine
//! - Async operations: all remote calls are async
//! - `NotFound` is data, not an error: `fetch` returns `None`

pub mod adapter;
pub mod memory;

pub use adapter::{ChangeBatch, RemoteAdapter, RemoteSnapshot};
pub use memory::MemoryAdapter;
