//! Constraint scrypts: bundles of substate types and procedures.
//!
//! The system scrypt is always loaded first and owns the low type
//! tags; application scrypts layer on top of it.

pub mod stake;
pub mod system;
pub mod tokens;
