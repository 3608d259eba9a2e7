//! Transaction and substate identifiers.
//!
//! A [`TxnId`] is the SHA-256 digest of a transaction's raw bytes. A
//! [`SubstateId`] names one substate: either a physical substate
//! created by a specific instruction of a specific transaction, or a
//! virtual substate addressed by its tagged key bytes (leading type
//! tag byte followed by the registry's key encoding).

use core::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use snafu::Snafu;

/// Errors decoding identifier bytes.
#[derive(Debug, Snafu)]
pub enum SubstateIdError {
    /// The byte buffer is too short or has an invalid length.
    #[snafu(display("Invalid substate id length: {len}"))]
    InvalidLength {
        /// Observed buffer length.
        len: usize,
    },

    /// The leading discriminant byte is unknown.
    #[snafu(display("Unknown substate id discriminant: {value}"))]
    UnknownDiscriminant {
        /// Observed discriminant byte.
        value: u8,
    },
}

/// Identifier of a transaction: SHA-256 of its raw bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxnId([u8; 32]);

impl TxnId {
    /// Computes the id of a raw transaction payload.
    #[must_use]
    pub fn from_payload(raw: &[u8]) -> Self {
        let digest = Sha256::digest(raw);
        Self(digest.into())
    }

    /// Wraps pre-computed digest bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxnId(")?;
        for byte in &self.0[..4] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..)")
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Identifier of one substate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SubstateId {
    /// A substate physically created by instruction `index` of
    /// transaction `txn_id`.
    Physical {
        /// Creating transaction.
        txn_id: TxnId,
        /// Index of the creating instruction within that transaction.
        index: u32,
    },
    /// A virtual substate addressed by tagged key bytes. The first
    /// byte is the substate type tag; the remainder is the key
    /// encoding registered for that type.
    Virtual {
        /// Tagged key bytes.
        key: Vec<u8>,
    },
}

const PHYSICAL_DISCRIMINANT: u8 = 0;
const VIRTUAL_DISCRIMINANT: u8 = 1;
const PHYSICAL_LEN: usize = 1 + 32 + 4;

impl SubstateId {
    /// Id of the substate created by instruction `index` of `txn_id`.
    #[must_use]
    pub const fn of_substate(txn_id: TxnId, index: u32) -> Self {
        Self::Physical { txn_id, index }
    }

    /// Id of a virtual substate with the given tagged key bytes.
    #[must_use]
    pub fn of_virtual(key: impl Into<Vec<u8>>) -> Self {
        Self::Virtual { key: key.into() }
    }

    /// Whether this id addresses a virtual substate.
    #[must_use]
    pub const fn is_virtual(&self) -> bool {
        matches!(self, Self::Virtual { .. })
    }

    /// Stable byte encoding: a discriminant byte followed by either
    /// `txn_id || index_be` or the tagged key bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Physical { txn_id, index } => {
                let mut buf = Vec::with_capacity(PHYSICAL_LEN);
                buf.push(PHYSICAL_DISCRIMINANT);
                buf.extend_from_slice(txn_id.as_bytes());
                buf.extend_from_slice(&index.to_be_bytes());
                buf
            }
            Self::Virtual { key } => {
                let mut buf = Vec::with_capacity(1 + key.len());
                buf.push(VIRTUAL_DISCRIMINANT);
                buf.extend_from_slice(key);
                buf
            }
        }
    }

    /// Decodes the encoding produced by [`SubstateId::to_bytes`].
    pub fn from_bytes(buf: &[u8]) -> Result<Self, SubstateIdError> {
        let (&discriminant, rest) = buf
            .split_first()
            .ok_or(SubstateIdError::InvalidLength { len: buf.len() })?;
        match discriminant {
            PHYSICAL_DISCRIMINANT => {
                if buf.len() != PHYSICAL_LEN {
                    return Err(SubstateIdError::InvalidLength { len: buf.len() });
                }
                let mut digest = [0u8; 32];
                digest.copy_from_slice(&rest[..32]);
                let mut index_bytes = [0u8; 4];
                index_bytes.copy_from_slice(&rest[32..36]);
                Ok(Self::Physical {
                    txn_id: TxnId::from_bytes(digest),
                    index: u32::from_be_bytes(index_bytes),
                })
            }
            VIRTUAL_DISCRIMINANT => {
                if rest.is_empty() {
                    return Err(SubstateIdError::InvalidLength { len: buf.len() });
                }
                Ok(Self::Virtual { key: rest.to_vec() })
            }
            value => Err(SubstateIdError::UnknownDiscriminant { value }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_txn_id_is_deterministic() {
        let a = TxnId::from_payload(b"payload");
        let b = TxnId::from_payload(b"payload");
        let c = TxnId::from_payload(b"other");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_physical_id_round_trip() {
        let id = SubstateId::of_substate(TxnId::from_payload(b"tx"), 7);
        let decoded = SubstateId::from_bytes(&id.to_bytes()).expect("decode");
        assert_eq!(id, decoded);
        assert!(!id.is_virtual());
    }

    #[test]
    fn test_virtual_id_round_trip() {
        let id = SubstateId::of_virtual(vec![4u8, 1, 2, 3]);
        let decoded = SubstateId::from_bytes(&id.to_bytes()).expect("decode");
        assert_eq!(id, decoded);
        assert!(id.is_virtual());
    }

    #[test]
    fn test_decode_rejects_bad_input() {
        assert!(SubstateId::from_bytes(&[]).is_err());
        assert!(SubstateId::from_bytes(&[0, 1, 2]).is_err());
        assert!(SubstateId::from_bytes(&[1]).is_err());
        assert!(SubstateId::from_bytes(&[9, 0, 0]).is_err());
    }

    #[test]
    fn test_distinct_instructions_get_distinct_ids() {
        let txn = TxnId::from_payload(b"tx");
        let a = SubstateId::of_substate(txn, 0);
        let b = SubstateId::of_substate(txn, 1);
        assert_ne!(a, b);
        assert_ne!(a.to_bytes(), b.to_bytes());
    }
}
