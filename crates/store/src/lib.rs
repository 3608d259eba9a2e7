//! Substate store for the Spindle ledger engine.
//!
//! The engine consumes storage through the [`EngineStore`] contract:
//! a transactional key-value store of substates with indexed scans by
//! substate type tag. This crate provides:
//!
//! - The collaborator traits ([`EngineStore`], [`StoreTransaction`],
//!   [`SubstateReadView`]) and the persisted record types
//! - [`MemStore`], an in-memory transactional implementation
//! - [`TransientStore`], a copy-on-write overlay used by engine
//!   branches for speculative execution
//!
//! Storage engine internals (B-tree/LSM, paging, crash safety) are out
//! of scope; a persistent backend only needs to satisfy the same
//! traits.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod mem;
mod traits;
mod transient;

pub use mem::{MemStore, MemTransaction};
pub use traits::{
    EngineStore, ProcessedRecord, StoreError, StoreTransaction, SubstateOp, SubstateReadView,
};
pub use transient::{TransientStore, TransientTransaction};
