//! Reducer states threaded through instruction chains.
//!
//! A verification group starts in [`ReducerState::Void`], moves
//! through intermediate states as transition procedures fire, and must
//! return to `Void` (via a completing procedure and an `End`) before
//! the group closes. The set of states is closed: procedures are keyed
//! by [`ReducerKind`] discriminants, so an unknown state can never
//! reach dispatch.

use spindle_types::{Amount, WideAmount};

use crate::particles::{KeyBytes, ResourceAddr};

/// Discriminant of a [`ReducerState`] variant, used for procedure
/// lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReducerKind {
    /// No chain in progress.
    Void,
    /// An epoch substate has been consumed; its successor is expected.
    EpochUpdate,
    /// A token resource definition has been read into hand.
    ResourceInHand,
    /// New supply of a resource is being minted.
    ResourceMint,
    /// Supply of a resource is being burned.
    ResourceBurn,
    /// Token inputs and outputs of one resource are being balanced.
    TokenHoldings,
    /// A validator flag has been read into hand.
    ValidatorInHand,
    /// A validator flag has been consumed; its replacement is expected.
    ValidatorUpdate,
    /// Tokens are being converted into stake for one delegate.
    StakePrep,
}

/// Accumulated state of the instruction chain currently in progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReducerState {
    /// No chain in progress; the next operation opens one.
    Void,

    /// The previous epoch substate was downed; the chain must up
    /// `prev + 1` before it ends.
    EpochUpdate {
        /// The consumed epoch number.
        prev: u64,
    },

    /// A resource definition is in hand, either freshly created or
    /// read from the store; the chain may now mint against it or burn
    /// into it.
    ResourceInHand {
        /// The resource's address.
        addr: ResourceAddr,
        /// Supply controller, if mutable.
        owner: Option<KeyBytes>,
        /// Granularity constraint on holdings.
        granularity: Amount,
        /// Whether this chain created the definition. Initial supply
        /// may be minted at creation even for fixed-supply resources.
        just_created: bool,
    },

    /// Minting in progress.
    ResourceMint {
        /// The resource being minted.
        addr: ResourceAddr,
        /// Granularity constraint on holdings.
        granularity: Amount,
        /// Total minted so far in this chain.
        minted: WideAmount,
    },

    /// Burning in progress.
    ResourceBurn {
        /// The resource being burned.
        addr: ResourceAddr,
        /// Total burned so far in this chain.
        burned: WideAmount,
    },

    /// Transfer bookkeeping: inputs consumed and outputs created for
    /// one resource. The chain may only end once the two are equal, or
    /// the difference is claimed as a fee.
    TokenHoldings {
        /// The resource being moved.
        resource: ResourceAddr,
        /// Sum of consumed holdings.
        input: WideAmount,
        /// Sum of created holdings.
        output: WideAmount,
    },

    /// A validator flag was read; staking against it may follow.
    ValidatorInHand {
        /// Validator identity.
        key: KeyBytes,
        /// Registration flag at read time.
        registered: bool,
    },

    /// A validator flag was downed; the chain must up a replacement
    /// for the same key before it ends.
    ValidatorUpdate {
        /// Validator identity.
        key: KeyBytes,
    },

    /// Staking in progress: token inputs are being converted into
    /// stake substates for `delegate`, with optional token change.
    StakePrep {
        /// Validator receiving the delegation.
        delegate: KeyBytes,
        /// Resource the consumed holdings are denominated in.
        resource: ResourceAddr,
        /// Sum of consumed token holdings.
        input: WideAmount,
        /// Sum of created stake substates.
        staked: WideAmount,
        /// Sum of token change returned to the staker.
        change: WideAmount,
    },
}

impl ReducerState {
    /// The variant's kind discriminant.
    #[must_use]
    pub fn kind(&self) -> ReducerKind {
        match self {
            ReducerState::Void => ReducerKind::Void,
            ReducerState::EpochUpdate { .. } => ReducerKind::EpochUpdate,
            ReducerState::ResourceInHand { .. } => ReducerKind::ResourceInHand,
            ReducerState::ResourceMint { .. } => ReducerKind::ResourceMint,
            ReducerState::ResourceBurn { .. } => ReducerKind::ResourceBurn,
            ReducerState::TokenHoldings { .. } => ReducerKind::TokenHoldings,
            ReducerState::ValidatorInHand { .. } => ReducerKind::ValidatorInHand,
            ReducerState::ValidatorUpdate { .. } => ReducerKind::ValidatorUpdate,
            ReducerState::StakePrep { .. } => ReducerKind::StakePrep,
        }
    }

    /// Whether this is the chain-closed sentinel.
    #[must_use]
    pub fn is_void(&self) -> bool {
        matches!(self, ReducerState::Void)
    }
}
