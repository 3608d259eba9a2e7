//! Transaction envelope parsing and signing.
//!
//! A raw transaction is a postcard-encoded [`TxnEnvelope`]: a flag
//! byte, the ordered instruction stream, and an optional Ed25519
//! signature over the signing hash (SHA-256 of the flag byte followed
//! by the encoded instructions). The signature envelope carries the
//! verifying key, so no key recovery is involved.

use ed25519_dalek::{Signer, SigningKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use snafu::ResultExt;

use spindle_types::{decode, encode, SubstateId, TxnId};

use crate::error::{MalformedSnafu, ParseError};

/// Envelope flag: token conservation bookkeeping is disabled.
pub const FLAG_NO_RESOURCE_BOOKKEEPING: u8 = 0b0000_0001;

const KNOWN_FLAGS: u8 = FLAG_NO_RESOURCE_BOOKKEEPING;
const SIGNATURE_LEN: usize = 64;

/// Reference to a substate from within an instruction stream: either
/// a full id, or the index of an earlier instruction in the same
/// stream that created the substate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubstateRef {
    /// A substate identified globally.
    Id(SubstateId),
    /// The substate created by instruction `index` of this stream.
    Local {
        /// Creating instruction index.
        index: u32,
    },
}

/// One instruction of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instruction {
    /// Create a substate from a tagged payload.
    Up {
        /// Tagged particle payload.
        payload: Vec<u8>,
    },
    /// Instantiate a virtual substate from its tagged key.
    VirtualUp {
        /// Tagged key bytes.
        key: Vec<u8>,
    },
    /// Consume a substate.
    Down {
        /// The substate to consume.
        substate: SubstateRef,
    },
    /// Read a substate without consuming it.
    Read {
        /// The substate to read.
        substate: SubstateRef,
    },
    /// Close the current group.
    End,
    /// Attach an opaque message.
    Msg {
        /// Message bytes.
        bytes: Vec<u8>,
    },
}

/// Detached signature envelope: verifying key plus signature bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnSignature {
    /// Ed25519 verifying key of the signer.
    pub public_key: [u8; 32],
    /// 64-byte Ed25519 signature over the signing hash.
    pub signature: Vec<u8>,
}

/// The wire shape of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnEnvelope {
    /// Envelope flags; unknown bits are rejected.
    pub flags: u8,
    /// Ordered instruction stream.
    pub instructions: Vec<Instruction>,
    /// Optional signature over the signing hash.
    pub signature: Option<TxnSignature>,
}

impl TxnEnvelope {
    /// The hash a signature over this envelope must cover.
    pub fn signing_hash(&self) -> Result<[u8; 32], ParseError> {
        signing_hash(self.flags, &self.instructions)
    }
}

/// Computes the signing hash for a flag byte and instruction stream.
pub fn signing_hash(flags: u8, instructions: &[Instruction]) -> Result<[u8; 32], ParseError> {
    let body = encode(&instructions).context(MalformedSnafu)?;
    let mut hasher = Sha256::new();
    hasher.update([flags]);
    hasher.update(&body);
    Ok(hasher.finalize().into())
}

/// Encodes and optionally signs an envelope into raw transaction
/// bytes.
pub fn seal_envelope(
    flags: u8,
    instructions: Vec<Instruction>,
    signer: Option<&SigningKey>,
) -> Result<RawTxn, ParseError> {
    let signature = match signer {
        Some(key) => {
            let hash = signing_hash(flags, &instructions)?;
            let signature = key.sign(&hash);
            Some(TxnSignature {
                public_key: key.verifying_key().to_bytes(),
                signature: signature.to_bytes().to_vec(),
            })
        }
        None => None,
    };
    let envelope = TxnEnvelope {
        flags,
        instructions,
        signature,
    };
    let bytes = encode(&envelope).context(MalformedSnafu)?;
    Ok(RawTxn::new(bytes))
}

/// A raw transaction: submitted bytes plus the derived id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTxn {
    /// SHA-256 of `bytes`.
    pub id: TxnId,
    /// The raw envelope bytes.
    pub bytes: Vec<u8>,
}

impl RawTxn {
    /// Wraps raw bytes, computing the id.
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            id: TxnId::from_payload(&bytes),
            bytes,
        }
    }
}

/// A parsed transaction ready for verification.
#[derive(Debug)]
pub struct ParsedTxn {
    /// Transaction id.
    pub txn_id: TxnId,
    /// Ordered instruction stream.
    pub instructions: Vec<Instruction>,
    /// Carried signature, if any.
    pub signature: Option<TxnSignature>,
    /// The hash the signature must cover.
    pub signing_hash: [u8; 32],
    /// Whether the envelope disables conservation bookkeeping.
    pub disable_resource_bookkeeping: bool,
}

/// Turns raw bytes into a [`ParsedTxn`].
pub trait TxnParser: Send + Sync {
    /// Parses and structurally validates raw transaction bytes.
    fn parse(&self, raw: &RawTxn) -> Result<ParsedTxn, ParseError>;
}

/// The default postcard envelope parser.
pub struct EnvelopeParser;

impl TxnParser for EnvelopeParser {
    fn parse(&self, raw: &RawTxn) -> Result<ParsedTxn, ParseError> {
        let envelope: TxnEnvelope = decode(&raw.bytes).context(MalformedSnafu)?;
        if envelope.flags & !KNOWN_FLAGS != 0 {
            return Err(ParseError::UnknownFlags {
                flags: envelope.flags,
            });
        }
        if let Some(signature) = &envelope.signature {
            if signature.signature.len() != SIGNATURE_LEN {
                return Err(ParseError::InvalidSignatureLength {
                    len: signature.signature.len(),
                });
            }
        }
        let signing_hash = envelope.signing_hash()?;
        Ok(ParsedTxn {
            txn_id: raw.id,
            instructions: envelope.instructions,
            signature: envelope.signature,
            signing_hash,
            disable_resource_bookkeeping: envelope.flags & FLAG_NO_RESOURCE_BOOKKEEPING != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signing_key() -> SigningKey {
        SigningKey::from_bytes(&[7u8; 32])
    }

    #[test]
    fn test_unsigned_round_trip() {
        let raw = seal_envelope(0, vec![Instruction::End], None).expect("seal");
        let parsed = EnvelopeParser.parse(&raw).expect("parse");
        assert_eq!(parsed.txn_id, raw.id);
        assert_eq!(parsed.instructions, vec![Instruction::End]);
        assert!(parsed.signature.is_none());
        assert!(!parsed.disable_resource_bookkeeping);
    }

    #[test]
    fn test_signed_envelope_carries_verifying_key() {
        let key = signing_key();
        let raw = seal_envelope(0, vec![Instruction::End], Some(&key)).expect("seal");
        let parsed = EnvelopeParser.parse(&raw).expect("parse");
        let signature = parsed.signature.expect("signature");
        assert_eq!(signature.public_key, key.verifying_key().to_bytes());
        assert_eq!(signature.signature.len(), 64);
    }

    #[test]
    fn test_unknown_flags_rejected() {
        let envelope = TxnEnvelope {
            flags: 0b1000_0000,
            instructions: vec![],
            signature: None,
        };
        let raw = RawTxn::new(encode(&envelope).expect("encode"));
        assert!(matches!(
            EnvelopeParser.parse(&raw),
            Err(ParseError::UnknownFlags { .. })
        ));
    }

    #[test]
    fn test_garbage_bytes_rejected() {
        let raw = RawTxn::new(vec![0xFF; 40]);
        assert!(matches!(
            EnvelopeParser.parse(&raw),
            Err(ParseError::Malformed { .. })
        ));
    }

    #[test]
    fn test_bookkeeping_flag_round_trips() {
        let raw = seal_envelope(FLAG_NO_RESOURCE_BOOKKEEPING, vec![], None).expect("seal");
        let parsed = EnvelopeParser.parse(&raw).expect("parse");
        assert!(parsed.disable_resource_bookkeeping);
    }
}
