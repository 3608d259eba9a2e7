//! Constraint-checked state-transition engine for the Spindle ledger.
//!
//! State is a set of substates, each created (`Up`) exactly once and
//! consumed (`Down`) at most once. A transaction is an instruction
//! stream over substates; the [`ConstraintMachine`] verifies streams
//! against a registry of substate types and transition procedures, and
//! the [`LedgerEngine`] executes verified batches atomically over an
//! [`spindle_store::EngineStore`].
//!
//! The registry is assembled from scrypts: the system scrypt (epochs)
//! plus application scrypts for tokens and staking. Transactions are
//! built from high-level actions by the construction layer, including
//! a bounded fee-convergence protocol.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod builder;
mod context;
mod engine;
mod error;
mod machine;
mod meter;
mod parser;
mod particles;
mod reducer;
mod registry;
pub mod scrypts;

pub use builder::{
    ActionCompiler, BuildOutcome, ConstructionRequest, DefaultCompiler, SubstateSource, TxnAction,
    TxnBuilder, TxnConstructor,
};
pub use context::{Event, ExecutionContext, PermissionLevel};
pub use engine::{
    EngineConfig, LedgerEngine, PostProcessor, ProcessedTransaction, MAX_FEE_ATTEMPTS,
};
pub use error::{
    BuildError, ConfigError, ConstraintError, EngineError, MeterError, ParseError,
    PostProcessError, ProcedureError, SubstateDecodeError, TxnError,
};
pub use machine::{ConstraintMachine, MachineLimits};
pub use meter::{CostMeter, Meter, NoMeter};
pub use parser::{
    seal_envelope, signing_hash, EnvelopeParser, Instruction, ParsedTxn, RawTxn, SubstateRef,
    TxnEnvelope, TxnParser, TxnSignature, FLAG_NO_RESOURCE_BOOKKEEPING,
};
pub use particles::{KeyBytes, Particle, ParticleError, ParticleKind, ResourceAddr};
pub use reducer::{ReducerKind, ReducerState};
pub use registry::{
    ConstraintScrypt, KeyCodec, OpKey, Procedure, ProcedureKey, ProcedureParam, ProcedureResult,
    Registry, ScryptEnv, SubstateDefinition,
};
