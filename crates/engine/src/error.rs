//! Engine error taxonomy.
//!
//! Failures are layered the way verification is: [`ParseError`] for
//! malformed bytes, [`ConstraintError`] for instruction streams the
//! machine rejects, [`ProcedureError`] for scrypt-level rule
//! violations, and [`EngineError`] for batch-level outcomes. A batch
//! failure always carries the index of the offending transaction and
//! the cause chain below it.

use snafu::Snafu;

use spindle_types::{Amount, AmountError, CodecError, SubstateId, TxnId, WideAmount};

use crate::context::PermissionLevel;
use crate::particles::{KeyBytes, ParticleError, ParticleKind, ResourceAddr};
use crate::registry::ProcedureKey;
use crate::reducer::ReducerKind;

/// Errors turning raw transaction bytes into an instruction stream.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ParseError {
    /// The envelope bytes did not decode.
    #[snafu(display("Malformed transaction envelope"))]
    Malformed {
        /// Underlying codec failure.
        source: CodecError,
    },

    /// The signature field had the wrong length.
    #[snafu(display("Invalid signature length: {len}"))]
    InvalidSignatureLength {
        /// Observed signature length.
        len: usize,
    },

    /// The envelope carried flag bits this version does not define.
    #[snafu(display("Unknown envelope flags: {flags:#04x}"))]
    UnknownFlags {
        /// The offending flag byte.
        flags: u8,
    },
}

/// Errors loading substate types and procedures into a registry.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    /// A substate type tag was registered twice.
    #[snafu(display("Substate type tag {tag} already registered"))]
    DuplicateTypeTag {
        /// The conflicting tag.
        tag: u8,
    },

    /// A particle kind was registered twice.
    #[snafu(display("Particle kind {kind:?} already registered"))]
    DuplicateKind {
        /// The conflicting kind.
        kind: ParticleKind,
    },

    /// A procedure key was registered twice, in this scrypt or an
    /// earlier layer.
    #[snafu(display("Procedure {key:?} already registered"))]
    DuplicateProcedure {
        /// The conflicting key.
        key: ProcedureKey,
    },
}

/// Errors decoding a tagged substate payload or key via the registry.
#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum SubstateDecodeError {
    /// The payload was empty, so no tag byte was present.
    #[snafu(display("Empty substate payload"))]
    Empty,

    /// The leading type tag is not registered.
    #[snafu(display("Unknown substate type tag: {tag}"))]
    UnknownTag {
        /// Observed tag byte.
        tag: u8,
    },

    /// The particle kind is not registered.
    #[snafu(display("Unknown particle kind: {kind:?}"))]
    UnknownKind {
        /// The unregistered kind.
        kind: ParticleKind,
    },

    /// The type is registered but has no key codec, so it cannot be
    /// addressed by key.
    #[snafu(display("Substate type tag {tag} is not key-addressable"))]
    NotAddressable {
        /// The tag lacking a key codec.
        tag: u8,
    },

    /// The untagged body failed its type codec.
    #[snafu(display("Particle decoding failed"))]
    Particle {
        /// Underlying codec failure.
        source: ParticleError,
    },
}

/// Errors raised by scrypt authorizers and transition procedures.
#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum ProcedureError {
    /// The required key did not sign the transaction.
    #[snafu(display("Missing required signature"))]
    MissingRequiredSignature,

    /// Mint or burn was attempted on a fixed-supply resource.
    #[snafu(display("Resource supply is fixed"))]
    FixedSupply,

    /// A particle referenced a different resource than the chain.
    #[snafu(display("Resource mismatch"))]
    ResourceMismatch,

    /// A holding amount is not a multiple of the resource granularity.
    #[snafu(display("Amount {amount} violates granularity {granularity}"))]
    GranularityViolation {
        /// The offending amount.
        amount: Amount,
        /// The resource's granularity.
        granularity: Amount,
    },

    /// A group ended with unequal input and output totals.
    #[snafu(display("Unbalanced group: input {input}, output {output}"))]
    UnbalancedGroup {
        /// Sum of consumed amounts.
        input: WideAmount,
        /// Sum of created amounts.
        output: WideAmount,
    },

    /// A fee substate did not claim exactly the group remainder.
    #[snafu(display("Fee {fee} does not close the group: input {input}, output {output}"))]
    FeeMismatch {
        /// The claimed fee.
        fee: Amount,
        /// Sum of consumed amounts at the time of the claim.
        input: WideAmount,
        /// Sum of created amounts at the time of the claim.
        output: WideAmount,
    },

    /// A stake was below the configured minimum.
    #[snafu(display("Stake {amount} below minimum {minimum}"))]
    MinimumStake {
        /// The offending stake amount.
        amount: Amount,
        /// The configured minimum.
        minimum: Amount,
    },

    /// Delegation targeted an unregistered validator.
    #[snafu(display("Validator {key:?} is not registered"))]
    ValidatorNotRegistered {
        /// The unregistered validator key.
        key: KeyBytes,
    },

    /// A replacement substate named a different key than the one
    /// consumed.
    #[snafu(display("Replacement does not match the consumed key"))]
    KeyMismatch,

    /// An epoch successor was not the direct increment.
    #[snafu(display("Epoch successor {actual} does not follow {expected}"))]
    WrongSuccessor {
        /// The only permitted successor.
        expected: u64,
        /// The epoch actually supplied.
        actual: u64,
    },

    /// A procedure received a parameter shape it does not accept.
    #[snafu(display("Unexpected procedure parameter"))]
    UnexpectedParam,

    /// Amount arithmetic failed inside a procedure.
    #[snafu(display("Amount arithmetic failed"))]
    Arithmetic {
        /// Underlying arithmetic failure.
        source: AmountError,
    },
}

/// Errors raised by the metering hook.
#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum MeterError {
    /// Cumulative cost exceeded the configured limit.
    #[snafu(display("Cost limit exceeded: {used} of {limit} units"))]
    CostExceeded {
        /// Units charged so far.
        used: u64,
        /// The configured limit.
        limit: u64,
    },
}

/// An instruction stream the constraint machine rejected. Every
/// variant that blames a single instruction carries its index.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConstraintError {
    /// A substate payload or key failed to decode.
    #[snafu(display("Instruction {index}: substate decoding failed"))]
    Decode {
        /// Offending instruction index.
        index: u32,
        /// Underlying decode failure.
        source: SubstateDecodeError,
    },

    /// A freshly created particle failed its static check.
    #[snafu(display("Instruction {index}: static check failed"))]
    StaticCheck {
        /// Offending instruction index.
        index: u32,
        /// Underlying check failure.
        source: ParticleError,
    },

    /// No procedure is registered for this state and operation.
    #[snafu(display("Instruction {index}: no procedure for {key:?}"))]
    MissingProcedure {
        /// Offending instruction index.
        index: u32,
        /// The procedure key that missed.
        key: ProcedureKey,
    },

    /// The context's permission level is below the procedure's
    /// requirement.
    #[snafu(display(
        "Instruction {index}: requires {required:?} permission, executing at {actual:?}"
    ))]
    PermissionDenied {
        /// Offending instruction index.
        index: u32,
        /// The procedure's required level.
        required: PermissionLevel,
        /// The context's actual level.
        actual: PermissionLevel,
    },

    /// The procedure's authorizer rejected the transaction.
    #[snafu(display("Instruction {index}: not authorized"))]
    Unauthorized {
        /// Offending instruction index.
        index: u32,
        /// Underlying authorizer failure.
        source: ProcedureError,
    },

    /// The transition procedure rejected the operation.
    #[snafu(display("Instruction {index}: procedure failed"))]
    Procedure {
        /// Offending instruction index.
        index: u32,
        /// Underlying procedure failure.
        source: ProcedureError,
    },

    /// An up-operation targeted an id that is already up or downed.
    #[snafu(display("Instruction {index}: spin conflict on {id:?}"))]
    SpinConflict {
        /// Offending instruction index.
        index: u32,
        /// The conflicting substate id.
        id: SubstateId,
    },

    /// A down or read referenced a substate that is not up.
    #[snafu(display("Instruction {index}: substate {id:?} not found or not live"))]
    SubstateNotFound {
        /// Offending instruction index.
        index: u32,
        /// The missing substate id.
        id: SubstateId,
    },

    /// A local reference pointed at an instruction that created
    /// nothing, or lies ahead of the referencing one.
    #[snafu(display("Instruction {index}: no local substate at instruction {target}"))]
    LocalRefNotFound {
        /// Offending instruction index.
        index: u32,
        /// The referenced instruction index.
        target: u32,
    },

    /// A virtual operation targeted a particle no virtualizer accepts.
    #[snafu(display("Instruction {index}: particle is not virtualizable"))]
    NotVirtualizable {
        /// Offending instruction index.
        index: u32,
    },

    /// A virtual substate was already consumed.
    #[snafu(display("Instruction {index}: virtual substate {id:?} already consumed"))]
    VirtualSubstateDowned {
        /// Offending instruction index.
        index: u32,
        /// The consumed virtual id.
        id: SubstateId,
    },

    /// The stream carried more messages than permitted.
    #[snafu(display("Instruction {index}: message count exceeds limit {limit}"))]
    TooManyMessages {
        /// Offending instruction index.
        index: u32,
        /// The configured message count limit.
        limit: u32,
    },

    /// A message exceeded the byte-length limit.
    #[snafu(display("Instruction {index}: message of {len} bytes exceeds limit {limit}"))]
    MessageTooLong {
        /// Offending instruction index.
        index: u32,
        /// Observed message length.
        len: usize,
        /// The configured byte limit.
        limit: usize,
    },

    /// A completed chain was not followed by `End`.
    #[snafu(display("Instruction {index}: expected End after completed chain"))]
    MissingExpectedEnd {
        /// Index where `End` was expected (the stream length when the
        /// stream finished early).
        index: u32,
    },

    /// An `End` procedure returned an intermediate state instead of
    /// completing.
    #[snafu(display("Instruction {index}: End procedure did not complete the chain"))]
    EndNotTerminal {
        /// Offending instruction index.
        index: u32,
    },

    /// The stream finished with a chain still open.
    #[snafu(display("Stream ended with unterminated {kind:?} chain"))]
    DanglingChain {
        /// The reducer kind left open.
        kind: ReducerKind,
    },

    /// The metering hook rejected the stream.
    #[snafu(display("Instruction {index}: metering rejected the stream"))]
    Metering {
        /// Offending instruction index.
        index: u32,
        /// Underlying metering failure.
        source: MeterError,
    },
}

/// Why one transaction in a batch was rejected.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TxnError {
    /// The raw bytes did not parse.
    #[snafu(display("Transaction failed to parse"))]
    Parse {
        /// Underlying parse failure.
        source: ParseError,
    },

    /// The signature-verification budget was exhausted.
    #[snafu(display("Signature verification budget exhausted"))]
    SignatureBudgetExceeded,

    /// The envelope disabled conservation bookkeeping below the
    /// required permission level.
    #[snafu(display("Disabling resource bookkeeping requires super-user permission"))]
    BookkeepingNotPermitted,

    /// The carried signature did not verify against the payload.
    #[snafu(display("Invalid transaction signature"))]
    SignatureInvalid,

    /// The constraint machine rejected the instruction stream.
    #[snafu(display("Constraint verification failed"))]
    Constraint {
        /// Underlying constraint failure.
        source: ConstraintError,
    },

    /// The store refused the processed record.
    #[snafu(display("Store rejected the transaction"))]
    Store {
        /// Underlying store failure.
        source: spindle_store::StoreError,
    },
}

/// A post-processor veto over an otherwise valid batch.
#[derive(Debug, Snafu)]
#[snafu(display("Post-process check failed: {message}"))]
pub struct PostProcessError {
    /// What the post-processor objected to.
    pub message: String,
}

/// Errors constructing a transaction from actions.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum BuildError {
    /// The source account lacks spendable holdings.
    #[snafu(display("Insufficient balance: need {required}, have {available}"))]
    InsufficientBalance {
        /// Amount the action needs.
        required: Amount,
        /// Spendable amount found.
        available: Amount,
    },

    /// No live substate defines the referenced resource.
    #[snafu(display("Unknown resource {addr:?}"))]
    ResourceNotFound {
        /// The missing resource address.
        addr: ResourceAddr,
    },

    /// No registered validator substate exists for the key.
    #[snafu(display("No registered validator {key:?}"))]
    ValidatorNotFound {
        /// The missing validator key.
        key: KeyBytes,
    },

    /// A particle failed to serialize.
    #[snafu(display("Particle encoding failed"))]
    Encode {
        /// Underlying encode failure.
        source: SubstateDecodeError,
    },

    /// The envelope failed to encode or sign.
    #[snafu(display("Envelope sealing failed"))]
    Envelope {
        /// Underlying sealing failure.
        source: ParseError,
    },

    /// Amount arithmetic failed while selecting inputs.
    #[snafu(context(false), display("Amount arithmetic failed"))]
    AmountMath {
        /// Underlying arithmetic failure.
        source: AmountError,
    },

}

/// Batch-level engine outcomes.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EngineError {
    /// Transaction `index` of the batch failed; nothing was applied.
    #[snafu(display("Transaction {index} of {total} failed in batch"))]
    Batch {
        /// Zero-based position of the failed transaction.
        index: usize,
        /// Number of transactions in the batch.
        total: usize,
        /// Id of the failed transaction.
        txn_id: TxnId,
        /// Why it failed.
        source: TxnError,
    },

    /// A commit was attempted while speculative branches were open.
    #[snafu(display("{count} speculative branches still outstanding"))]
    BranchesOutstanding {
        /// Number of branches created and not yet deleted.
        count: usize,
    },

    /// The post-processor vetoed the batch; nothing was applied.
    #[snafu(context(false), display("Batch vetoed by post-processor"))]
    PostProcess {
        /// The veto.
        source: PostProcessError,
    },

    /// The store failed to commit the batch.
    #[snafu(display("Store commit failed"))]
    Commit {
        /// Underlying store failure.
        source: spindle_store::StoreError,
    },

    /// Fee construction failed to converge within the attempt limit.
    #[snafu(display("Fee construction did not converge after {attempts} attempts"))]
    FeeConvergence {
        /// Attempts made.
        attempts: u32,
        /// The last fee tried.
        last_fee: Amount,
    },

    /// Transaction construction failed.
    #[snafu(display("Transaction construction failed"))]
    Build {
        /// Underlying build failure.
        source: BuildError,
    },

    /// A stored payload failed to decode during a read operation.
    #[snafu(display("Stored substate failed to decode"))]
    CorruptSubstate {
        /// Underlying decode failure.
        source: SubstateDecodeError,
    },

    /// Aggregation overflowed during a read operation.
    #[snafu(display("Read aggregation failed"))]
    ReadAggregation {
        /// Underlying arithmetic failure.
        source: AmountError,
    },
}
