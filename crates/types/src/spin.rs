//! Substate spin lifecycle.
//!
//! Every substate has exactly one spin at any point in history. The
//! spin only ever moves forward: `Neutral -> Up -> Down`. A substate
//! that has been consumed (`Down`) can never come back up, and a
//! substate can never be consumed before it exists.

use serde::{Deserialize, Serialize};

/// Lifecycle marker of a substate: not-yet-existing, live, or consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Spin {
    /// The substate has never been written.
    Neutral = 0,
    /// The substate is live and may be consumed or read.
    Up = 1,
    /// The substate has been consumed. Terminal.
    Down = 2,
}

impl Spin {
    /// Returns the spin that follows this one, or `None` if terminal.
    #[must_use]
    pub const fn next(self) -> Option<Spin> {
        match self {
            Spin::Neutral => Some(Spin::Up),
            Spin::Up => Some(Spin::Down),
            Spin::Down => None,
        }
    }

    /// Returns the spin preceding this one, or `None` for `Neutral`.
    #[must_use]
    pub const fn prev(self) -> Option<Spin> {
        match self {
            Spin::Neutral => None,
            Spin::Up => Some(Spin::Neutral),
            Spin::Down => Some(Spin::Up),
        }
    }

    /// Whether a transition from `self` to `to` is permitted.
    ///
    /// Only the single forward step is ever legal.
    #[must_use]
    pub const fn can_transition_to(self, to: Spin) -> bool {
        matches!(
            (self, to),
            (Spin::Neutral, Spin::Up) | (Spin::Up, Spin::Down)
        )
    }

    /// Converts from a raw byte, returning `None` for unknown values.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Spin::Neutral),
            1 => Some(Spin::Up),
            2 => Some(Spin::Down),
            _ => None,
        }
    }

    /// Returns the raw byte value.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spin_sequence_is_linear() {
        assert_eq!(Spin::Neutral.next(), Some(Spin::Up));
        assert_eq!(Spin::Up.next(), Some(Spin::Down));
        assert_eq!(Spin::Down.next(), None);
    }

    #[test]
    fn test_prev_inverts_next() {
        for spin in [Spin::Neutral, Spin::Up, Spin::Down] {
            if let Some(next) = spin.next() {
                assert_eq!(next.prev(), Some(spin));
            }
        }
    }

    #[test]
    fn test_only_forward_transitions_allowed() {
        assert!(Spin::Neutral.can_transition_to(Spin::Up));
        assert!(Spin::Up.can_transition_to(Spin::Down));

        assert!(!Spin::Neutral.can_transition_to(Spin::Down));
        assert!(!Spin::Up.can_transition_to(Spin::Up));
        assert!(!Spin::Down.can_transition_to(Spin::Up));
        assert!(!Spin::Down.can_transition_to(Spin::Neutral));
        assert!(!Spin::Up.can_transition_to(Spin::Neutral));
    }

    #[test]
    fn test_byte_round_trip() {
        for spin in [Spin::Neutral, Spin::Up, Spin::Down] {
            assert_eq!(Spin::from_u8(spin.as_u8()), Some(spin));
        }
        assert_eq!(Spin::from_u8(3), None);
        assert_eq!(Spin::from_u8(255), None);
    }
}
