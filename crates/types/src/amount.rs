//! Token amounts and overflow-safe aggregation.
//!
//! An [`Amount`] is an unsigned 256-bit quantity with a fixed 32-byte
//! little-endian wire encoding. The fixed width keeps transaction
//! sizes independent of magnitude, which the fee-construction loop
//! depends on for convergence.
//!
//! A [`WideAmount`] is a 512-bit accumulator used when summing amounts
//! across many substates; the doubled width means no realistic number
//! of 256-bit contributions can wrap it.

use core::fmt;

use primitive_types::{U256, U512};
use snafu::Snafu;

/// Errors from amount arithmetic and decoding.
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum AmountError {
    /// Addition or subtraction left the representable range.
    #[snafu(display("Amount arithmetic overflow"))]
    Overflow,

    /// Subtraction went below zero.
    #[snafu(display("Amount arithmetic underflow"))]
    Underflow,

    /// The wire encoding was not exactly 32 bytes.
    #[snafu(display("Invalid amount encoding length: {len}"))]
    InvalidLength {
        /// Observed buffer length.
        len: usize,
    },

    /// An accumulated total does not fit back into 256 bits.
    #[snafu(display("Accumulated total exceeds the 256-bit range"))]
    TotalOutOfRange,
}

/// Unsigned 256-bit token amount.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount(U256);

impl Amount {
    /// The zero amount.
    pub const ZERO: Amount = Amount(U256::zero());

    /// Size of the wire encoding in bytes.
    pub const ENCODED_LEN: usize = 32;

    /// Largest representable amount.
    #[must_use]
    pub fn max_value() -> Self {
        Self(U256::MAX)
    }

    /// Constructs an amount from a `u64`.
    #[must_use]
    pub fn from_u64(value: u64) -> Self {
        Self(U256::from(value))
    }

    /// Checked addition.
    pub fn checked_add(self, other: Amount) -> Result<Amount, AmountError> {
        self.0
            .checked_add(other.0)
            .map(Amount)
            .ok_or(AmountError::Overflow)
    }

    /// Checked subtraction.
    pub fn checked_sub(self, other: Amount) -> Result<Amount, AmountError> {
        self.0
            .checked_sub(other.0)
            .map(Amount)
            .ok_or(AmountError::Underflow)
    }

    /// Checked multiplication by a scalar, used for per-byte fee rates.
    pub fn checked_mul_u64(self, factor: u64) -> Result<Amount, AmountError> {
        self.0
            .checked_mul(U256::from(factor))
            .map(Amount)
            .ok_or(AmountError::Overflow)
    }

    /// Whether this amount is zero.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Whether this amount is an exact multiple of `granularity`.
    ///
    /// A zero granularity never matches.
    #[must_use]
    pub fn is_multiple_of(&self, granularity: Amount) -> bool {
        if granularity.0.is_zero() {
            return false;
        }
        (self.0 % granularity.0).is_zero()
    }

    /// Fixed 32-byte little-endian encoding.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut buf = [0u8; Self::ENCODED_LEN];
        self.0.to_little_endian(&mut buf);
        buf
    }

    /// Decodes the encoding produced by [`Amount::to_bytes`].
    pub fn from_bytes(buf: &[u8]) -> Result<Self, AmountError> {
        if buf.len() != Self::ENCODED_LEN {
            return Err(AmountError::InvalidLength { len: buf.len() });
        }
        Ok(Self(U256::from_little_endian(buf)))
    }
}

impl From<u64> for Amount {
    fn from(value: u64) -> Self {
        Self::from_u64(value)
    }
}

impl fmt::Debug for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Amount({})", self.0)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 512-bit accumulator for summing many 256-bit amounts.
///
/// Summation across substates must never silently wrap the base
/// integer's range, so totals are carried at double width and only
/// narrowed back on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WideAmount(U512);

impl WideAmount {
    /// The zero total.
    pub const ZERO: WideAmount = WideAmount(U512::zero());

    /// Adds a 256-bit amount to the running total.
    ///
    /// The accumulator would need more than 2^256 contributions of the
    /// maximum amount to wrap, which no store can hold; an overflow
    /// here is therefore treated as an arithmetic error rather than a
    /// reachable state.
    pub fn add_amount(self, amount: Amount) -> Result<WideAmount, AmountError> {
        let widened = U512::from_little_endian(&amount.to_bytes());
        self.0
            .checked_add(widened)
            .map(WideAmount)
            .ok_or(AmountError::Overflow)
    }

    /// Narrows the total back to a 256-bit amount if it fits.
    pub fn try_to_amount(self) -> Result<Amount, AmountError> {
        let mut buf = [0u8; 64];
        self.0.to_little_endian(&mut buf);
        if buf[32..].iter().any(|&b| b != 0) {
            return Err(AmountError::TotalOutOfRange);
        }
        Amount::from_bytes(&buf[..32])
    }

    /// Whether the total exceeds the 256-bit range.
    #[must_use]
    pub fn exceeds_base_range(&self) -> bool {
        self.0 > U512::from_little_endian(&Amount::max_value().to_bytes())
    }
}

impl fmt::Display for WideAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checked_add_and_sub() {
        let a = Amount::from_u64(100);
        let b = Amount::from_u64(42);
        assert_eq!(a.checked_add(b).expect("add"), Amount::from_u64(142));
        assert_eq!(a.checked_sub(b).expect("sub"), Amount::from_u64(58));
        assert_eq!(b.checked_sub(a), Err(AmountError::Underflow));
        assert_eq!(
            Amount::max_value().checked_add(Amount::from_u64(1)),
            Err(AmountError::Overflow)
        );
    }

    #[test]
    fn test_encoding_is_fixed_width() {
        for value in [0u64, 1, u64::MAX] {
            let amount = Amount::from_u64(value);
            let bytes = amount.to_bytes();
            assert_eq!(bytes.len(), Amount::ENCODED_LEN);
            assert_eq!(Amount::from_bytes(&bytes).expect("decode"), amount);
        }
        assert!(Amount::from_bytes(&[0u8; 31]).is_err());
        assert!(Amount::from_bytes(&[0u8; 33]).is_err());
    }

    #[test]
    fn test_granularity_check() {
        let granularity = Amount::from_u64(10);
        assert!(Amount::from_u64(0).is_multiple_of(granularity));
        assert!(Amount::from_u64(30).is_multiple_of(granularity));
        assert!(!Amount::from_u64(35).is_multiple_of(granularity));
        assert!(!Amount::from_u64(35).is_multiple_of(Amount::ZERO));
    }

    #[test]
    fn test_wide_accumulator_survives_many_max_values() {
        let mut total = WideAmount::ZERO;
        for _ in 0..64 {
            total = total.add_amount(Amount::max_value()).expect("accumulate");
        }
        assert!(total.exceeds_base_range());
        assert_eq!(total.try_to_amount(), Err(AmountError::TotalOutOfRange));
    }

    #[test]
    fn test_wide_accumulator_narrows_when_in_range() {
        let total = WideAmount::ZERO
            .add_amount(Amount::from_u64(40))
            .and_then(|t| t.add_amount(Amount::from_u64(2)))
            .expect("accumulate");
        assert_eq!(total.try_to_amount().expect("narrow"), Amount::from_u64(42));
    }
}
