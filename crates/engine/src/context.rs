//! Per-transaction execution context.

use spindle_types::Amount;

use crate::particles::{KeyBytes, ResourceAddr};

/// Privilege tier a transaction executes under. Ordered: a procedure
/// requiring a level is satisfied by that level or any higher one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PermissionLevel {
    /// Ordinary signed user transactions.
    User,
    /// Privileged operations such as epoch advancement.
    SuperUser,
    /// Internal system execution; metering is skipped at this level.
    System,
}

/// Domain event emitted while verifying a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// New supply was minted.
    TokensMinted {
        /// Resource minted.
        resource: ResourceAddr,
        /// Total minted by the chain.
        amount: Amount,
    },
    /// Supply was burned.
    TokensBurned {
        /// Resource burned.
        resource: ResourceAddr,
        /// Total burned by the chain.
        amount: Amount,
    },
    /// A fee was paid.
    FeePaid {
        /// Account the fee was drawn from.
        payer: KeyBytes,
        /// Fee amount.
        amount: Amount,
    },
    /// Tokens were delegated to a validator.
    Staked {
        /// Validator receiving the delegation.
        delegate: KeyBytes,
        /// Total newly staked by the chain.
        amount: Amount,
    },
    /// A validator flag changed.
    ValidatorUpdated {
        /// Validator identity.
        key: KeyBytes,
        /// New registration flag.
        registered: bool,
    },
    /// The epoch advanced.
    EpochAdvanced {
        /// The new epoch number.
        epoch: u64,
    },
    /// An attached message instruction.
    Message {
        /// Message bytes as carried in the transaction.
        bytes: Vec<u8>,
    },
}

/// Mutable state carried across the instructions of one transaction:
/// authorization inputs, metering counters, and emitted events.
#[derive(Debug)]
pub struct ExecutionContext {
    level: PermissionLevel,
    skip_authorization: bool,
    signer: Option<KeyBytes>,
    sig_checks_remaining: u32,
    cost_used: u64,
    resource_bookkeeping: bool,
    message_count: u32,
    events: Vec<Event>,
}

impl ExecutionContext {
    /// Creates a context at the given level with a signature budget.
    #[must_use]
    pub fn new(level: PermissionLevel, sig_checks_remaining: u32) -> Self {
        Self {
            level,
            skip_authorization: false,
            signer: None,
            sig_checks_remaining,
            cost_used: 0,
            resource_bookkeeping: true,
            message_count: 0,
            events: Vec::new(),
        }
    }

    /// Disables authorizer checks for this transaction.
    #[must_use]
    pub fn with_skip_authorization(mut self, skip: bool) -> Self {
        self.skip_authorization = skip;
        self
    }

    /// Disables token conservation bookkeeping for this transaction.
    #[must_use]
    pub fn with_resource_bookkeeping(mut self, enabled: bool) -> Self {
        self.resource_bookkeeping = enabled;
        self
    }

    /// The execution privilege tier.
    #[must_use]
    pub fn level(&self) -> PermissionLevel {
        self.level
    }

    /// Whether authorizer checks are skipped.
    #[must_use]
    pub fn skips_authorization(&self) -> bool {
        self.skip_authorization
    }

    /// Whether token conservation bookkeeping applies.
    #[must_use]
    pub fn resource_bookkeeping(&self) -> bool {
        self.resource_bookkeeping
    }

    /// Records the verified transaction signer.
    pub fn set_signer(&mut self, signer: KeyBytes) {
        self.signer = Some(signer);
    }

    /// The verified signer, if the transaction carried a signature.
    #[must_use]
    pub fn signer(&self) -> Option<&KeyBytes> {
        self.signer.as_ref()
    }

    /// Whether the transaction was signed by `key`.
    #[must_use]
    pub fn is_signed_by(&self, key: &KeyBytes) -> bool {
        self.signer.as_ref() == Some(key)
    }

    /// Consumes one unit of the signature-verification budget.
    /// Returns `false` when the budget is exhausted.
    pub fn try_charge_sig_check(&mut self) -> bool {
        if self.sig_checks_remaining == 0 {
            return false;
        }
        self.sig_checks_remaining -= 1;
        true
    }

    /// Remaining signature-verification budget.
    #[must_use]
    pub fn sig_checks_remaining(&self) -> u32 {
        self.sig_checks_remaining
    }

    /// Adds metering cost; returns the cumulative total.
    pub fn add_cost(&mut self, units: u64) -> u64 {
        self.cost_used = self.cost_used.saturating_add(units);
        self.cost_used
    }

    /// Cumulative metering cost charged so far.
    #[must_use]
    pub fn cost_used(&self) -> u64 {
        self.cost_used
    }

    /// Counts a message instruction; returns the new total.
    pub fn count_message(&mut self) -> u32 {
        self.message_count += 1;
        self.message_count
    }

    /// Records a domain event.
    pub fn emit(&mut self, event: Event) {
        self.events.push(event);
    }

    /// Drains the events emitted so far, in order.
    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_levels_are_ordered() {
        assert!(PermissionLevel::User < PermissionLevel::SuperUser);
        assert!(PermissionLevel::SuperUser < PermissionLevel::System);
    }

    #[test]
    fn test_sig_budget_depletes() {
        let mut ctx = ExecutionContext::new(PermissionLevel::User, 2);
        assert!(ctx.try_charge_sig_check());
        assert!(ctx.try_charge_sig_check());
        assert!(!ctx.try_charge_sig_check());
        assert_eq!(ctx.sig_checks_remaining(), 0);
    }

    #[test]
    fn test_signer_tracking() {
        let mut ctx = ExecutionContext::new(PermissionLevel::User, 1);
        assert!(!ctx.is_signed_by(&[7; 32]));
        ctx.set_signer([7; 32]);
        assert!(ctx.is_signed_by(&[7; 32]));
        assert!(!ctx.is_signed_by(&[8; 32]));
    }
}
