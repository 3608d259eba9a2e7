//! Shared data model for the Spindle ledger engine.
//!
//! This crate defines the vocabulary shared between the substate store
//! and the state-transition engine:
//!
//! - Transaction and substate identifiers with stable byte encodings
//! - The substate spin lifecycle (`Neutral -> Up -> Down`)
//! - 256-bit token amounts and the widened 512-bit accumulator
//! - Postcard codec helpers with unified error handling

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod amount;
mod codec;
mod id;
mod spin;

pub use amount::{Amount, AmountError, WideAmount};
pub use codec::{decode, encode, CodecError};
pub use id::{SubstateId, SubstateIdError, TxnId};
pub use spin::Spin;
