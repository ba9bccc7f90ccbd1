//! Common utilities and types shared across SyncBridge modules.
//!
//! This module provides the foundational types every other crate speaks:
//! the error taxonomy, source identifiers, entity references, entity
//! payloads and the fixed-arity version vector used for causality.

pub mod error;
pub mod types;
pub mod vector;

pub use error::{Error, Result};
pub use types::{EntityRef, EntityState, Payload, Source};
pub use vector::{CausalOrder, VersionVector};
