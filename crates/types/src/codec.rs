//! Centralized serialization and deserialization functions.
//!
//! Stored records (processed transactions, metadata) are encoded with
//! postcard. Substate payloads do NOT pass through here; those use the
//! per-type byte codecs registered with the engine.

use serde::{de::DeserializeOwned, Serialize};
use snafu::Snafu;

/// Error type for codec operations.
#[derive(Debug, Snafu)]
pub enum CodecError {
    /// Encoding failed.
    #[snafu(display("Encoding failed: {source}"))]
    Encode {
        /// The underlying postcard error.
        source: postcard::Error,
    },

    /// Decoding failed.
    #[snafu(display("Decoding failed: {source}"))]
    Decode {
        /// The underlying postcard error.
        source: postcard::Error,
    },
}

/// Encodes a value to bytes using postcard serialization.
///
/// # Errors
///
/// Returns `CodecError::Encode` if serialization fails.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(value).map_err(|source| CodecError::Encode { source })
}

/// Decodes bytes to a value using postcard deserialization.
///
/// # Errors
///
/// Returns `CodecError::Decode` if deserialization fails.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    postcard::from_bytes(bytes).map_err(|source| CodecError::Decode { source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SubstateId, TxnId};

    #[test]
    fn test_substate_id_round_trip() {
        let ids = [
            SubstateId::of_substate(TxnId::from_payload(b"a"), 3),
            SubstateId::of_virtual(vec![1u8, 2, 3]),
        ];
        for id in ids {
            let bytes = encode(&id).expect("encode");
            let decoded: SubstateId = decode(&bytes).expect("decode");
            assert_eq!(id, decoded);
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let result: Result<SubstateId, _> = decode(&[0xFF, 0xFF, 0xFF]);
        assert!(result.is_err());
    }
}
