//! `courier-core`: identifiers and error primitives shared by the delivery queue.
//!
//! This crate contains **no infrastructure** (no database, no runtime).

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{DestinationId, EntryId, TenantId};
