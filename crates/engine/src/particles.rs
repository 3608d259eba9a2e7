//! The closed set of particle types and their byte codecs.
//!
//! Every substate payload is a tagged encoding of one [`Particle`]
//! variant: a leading type tag byte assigned at registry load time,
//! followed by the fixed-layout encoding defined here. Codecs are
//! length-checked in both directions; a payload with trailing bytes is
//! rejected rather than silently truncated.

use snafu::Snafu;

use spindle_types::Amount;

/// 32-byte Ed25519 public key, used as both account address and
/// validator identity.
pub type KeyBytes = [u8; 32];

/// Opaque address of a token resource definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceAddr([u8; 32]);

impl ResourceAddr {
    /// Wraps raw address bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derives a resource address from its creator key and symbol.
    #[must_use]
    pub fn derive(creator: &KeyBytes, symbol: &[u8]) -> Self {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(creator);
        hasher.update(symbol);
        Self(hasher.finalize().into())
    }

    /// Returns the address bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Errors decoding or validating particle bytes.
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum ParticleError {
    /// The encoding has the wrong length for its type.
    #[snafu(display("Particle encoding has length {actual}, expected {expected}"))]
    Truncated {
        /// Required encoding length.
        expected: usize,
        /// Observed encoding length.
        actual: usize,
    },

    /// A boolean or option flag byte held an unknown value.
    #[snafu(display("Invalid particle flag byte: {value}"))]
    InvalidFlag {
        /// Observed flag byte.
        value: u8,
    },

    /// A particle was handed to a codec of a different kind.
    #[snafu(display("Particle kind mismatch: expected {expected:?}"))]
    WrongKind {
        /// The kind the codec expected.
        expected: ParticleKind,
    },

    /// A structural constraint on the particle's fields failed.
    #[snafu(display("Invalid particle: {reason}"))]
    Invalid {
        /// What was wrong.
        reason: &'static str,
    },
}

/// Discriminant of a [`Particle`] variant, used for procedure lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ParticleKind {
    /// System epoch counter.
    Epoch,
    /// Token resource definition.
    TokenResource,
    /// Fungible token holding.
    Tokens,
    /// Validator registration flag.
    Validator,
    /// Tokens delegated to a validator.
    Stake,
    /// Fee paid out of a token group.
    FeePaid,
}

/// One unit of ledger state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Particle {
    /// The system epoch counter. Exactly one instance is live at any
    /// time; epoch zero exists virtually before the first advance.
    Epoch {
        /// Current epoch number.
        epoch: u64,
    },

    /// Definition of a token resource. A present `owner` may mint and
    /// authorize burns; an absent one fixes the supply forever.
    TokenResource {
        /// Address of the resource.
        addr: ResourceAddr,
        /// Every holding of this resource must be a multiple of this.
        granularity: Amount,
        /// Supply controller, if the supply is mutable.
        owner: Option<KeyBytes>,
    },

    /// A fungible holding of `amount` tokens of `resource` spendable
    /// by `owner`.
    Tokens {
        /// Resource held.
        resource: ResourceAddr,
        /// Account that may spend this holding.
        owner: KeyBytes,
        /// Quantity held.
        amount: Amount,
    },

    /// A validator's registration flag. Unregistered validators exist
    /// virtually, so registration downs the virtual default.
    Validator {
        /// Validator identity key.
        key: KeyBytes,
        /// Whether the validator currently accepts delegation.
        registered: bool,
    },

    /// Tokens delegated by `owner` to validator `delegate`.
    Stake {
        /// Validator receiving the delegation.
        delegate: KeyBytes,
        /// Account that staked.
        owner: KeyBytes,
        /// Quantity staked.
        amount: Amount,
    },

    /// Record of a fee paid by `payer`, closing a token group whose
    /// inputs exceed its outputs by exactly `amount`.
    FeePaid {
        /// Account the fee was drawn from.
        payer: KeyBytes,
        /// Fee amount.
        amount: Amount,
    },
}

impl Particle {
    /// The variant's kind discriminant.
    #[must_use]
    pub fn kind(&self) -> ParticleKind {
        match self {
            Particle::Epoch { .. } => ParticleKind::Epoch,
            Particle::TokenResource { .. } => ParticleKind::TokenResource,
            Particle::Tokens { .. } => ParticleKind::Tokens,
            Particle::Validator { .. } => ParticleKind::Validator,
            Particle::Stake { .. } => ParticleKind::Stake,
            Particle::FeePaid { .. } => ParticleKind::FeePaid,
        }
    }
}

const EPOCH_LEN: usize = 8;
const RESOURCE_BASE_LEN: usize = 32 + Amount::ENCODED_LEN + 1;
const TOKENS_LEN: usize = 32 + 32 + Amount::ENCODED_LEN;
const VALIDATOR_LEN: usize = 32 + 1;
const STAKE_LEN: usize = 32 + 32 + Amount::ENCODED_LEN;
const FEE_PAID_LEN: usize = 32 + Amount::ENCODED_LEN;

fn read_key(buf: &[u8]) -> KeyBytes {
    let mut key = [0u8; 32];
    key.copy_from_slice(&buf[..32]);
    key
}

fn check_len(expected: usize, actual: usize) -> Result<(), ParticleError> {
    if actual != expected {
        return Err(ParticleError::Truncated { expected, actual });
    }
    Ok(())
}

/// Serializes an epoch particle (untagged).
pub fn serialize_epoch(particle: &Particle, out: &mut Vec<u8>) -> Result<(), ParticleError> {
    let Particle::Epoch { epoch } = particle else {
        return Err(ParticleError::WrongKind {
            expected: ParticleKind::Epoch,
        });
    };
    out.extend_from_slice(&epoch.to_be_bytes());
    Ok(())
}

/// Deserializes an epoch particle (untagged).
pub fn deserialize_epoch(buf: &[u8]) -> Result<Particle, ParticleError> {
    check_len(EPOCH_LEN, buf.len())?;
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(buf);
    Ok(Particle::Epoch {
        epoch: u64::from_be_bytes(bytes),
    })
}

/// Serializes a token resource definition (untagged).
pub fn serialize_token_resource(
    particle: &Particle,
    out: &mut Vec<u8>,
) -> Result<(), ParticleError> {
    let Particle::TokenResource {
        addr,
        granularity,
        owner,
    } = particle
    else {
        return Err(ParticleError::WrongKind {
            expected: ParticleKind::TokenResource,
        });
    };
    out.extend_from_slice(addr.as_bytes());
    out.extend_from_slice(&granularity.to_bytes());
    match owner {
        Some(key) => {
            out.push(1);
            out.extend_from_slice(key);
        }
        None => out.push(0),
    }
    Ok(())
}

/// Deserializes a token resource definition (untagged).
pub fn deserialize_token_resource(buf: &[u8]) -> Result<Particle, ParticleError> {
    if buf.len() < RESOURCE_BASE_LEN {
        return Err(ParticleError::Truncated {
            expected: RESOURCE_BASE_LEN,
            actual: buf.len(),
        });
    }
    let addr = ResourceAddr::from_bytes(read_key(buf));
    let granularity = Amount::from_bytes(&buf[32..32 + Amount::ENCODED_LEN])
        .map_err(|_| ParticleError::Invalid {
            reason: "granularity encoding",
        })?;
    let flag = buf[RESOURCE_BASE_LEN - 1];
    let owner = match flag {
        0 => {
            check_len(RESOURCE_BASE_LEN, buf.len())?;
            None
        }
        1 => {
            check_len(RESOURCE_BASE_LEN + 32, buf.len())?;
            Some(read_key(&buf[RESOURCE_BASE_LEN..]))
        }
        value => return Err(ParticleError::InvalidFlag { value }),
    };
    Ok(Particle::TokenResource {
        addr,
        granularity,
        owner,
    })
}

/// Serializes a token holding (untagged).
pub fn serialize_tokens(particle: &Particle, out: &mut Vec<u8>) -> Result<(), ParticleError> {
    let Particle::Tokens {
        resource,
        owner,
        amount,
    } = particle
    else {
        return Err(ParticleError::WrongKind {
            expected: ParticleKind::Tokens,
        });
    };
    out.extend_from_slice(resource.as_bytes());
    out.extend_from_slice(owner);
    out.extend_from_slice(&amount.to_bytes());
    Ok(())
}

/// Deserializes a token holding (untagged).
pub fn deserialize_tokens(buf: &[u8]) -> Result<Particle, ParticleError> {
    check_len(TOKENS_LEN, buf.len())?;
    Ok(Particle::Tokens {
        resource: ResourceAddr::from_bytes(read_key(buf)),
        owner: read_key(&buf[32..]),
        amount: Amount::from_bytes(&buf[64..]).map_err(|_| ParticleError::Invalid {
            reason: "amount encoding",
        })?,
    })
}

/// Serializes a validator flag (untagged).
pub fn serialize_validator(particle: &Particle, out: &mut Vec<u8>) -> Result<(), ParticleError> {
    let Particle::Validator { key, registered } = particle else {
        return Err(ParticleError::WrongKind {
            expected: ParticleKind::Validator,
        });
    };
    out.extend_from_slice(key);
    out.push(u8::from(*registered));
    Ok(())
}

/// Deserializes a validator flag (untagged).
pub fn deserialize_validator(buf: &[u8]) -> Result<Particle, ParticleError> {
    check_len(VALIDATOR_LEN, buf.len())?;
    let registered = match buf[32] {
        0 => false,
        1 => true,
        value => return Err(ParticleError::InvalidFlag { value }),
    };
    Ok(Particle::Validator {
        key: read_key(buf),
        registered,
    })
}

/// Serializes a stake holding (untagged).
pub fn serialize_stake(particle: &Particle, out: &mut Vec<u8>) -> Result<(), ParticleError> {
    let Particle::Stake {
        delegate,
        owner,
        amount,
    } = particle
    else {
        return Err(ParticleError::WrongKind {
            expected: ParticleKind::Stake,
        });
    };
    out.extend_from_slice(delegate);
    out.extend_from_slice(owner);
    out.extend_from_slice(&amount.to_bytes());
    Ok(())
}

/// Deserializes a stake holding (untagged).
pub fn deserialize_stake(buf: &[u8]) -> Result<Particle, ParticleError> {
    check_len(STAKE_LEN, buf.len())?;
    Ok(Particle::Stake {
        delegate: read_key(buf),
        owner: read_key(&buf[32..]),
        amount: Amount::from_bytes(&buf[64..]).map_err(|_| ParticleError::Invalid {
            reason: "amount encoding",
        })?,
    })
}

/// Serializes a fee record (untagged).
pub fn serialize_fee_paid(particle: &Particle, out: &mut Vec<u8>) -> Result<(), ParticleError> {
    let Particle::FeePaid { payer, amount } = particle else {
        return Err(ParticleError::WrongKind {
            expected: ParticleKind::FeePaid,
        });
    };
    out.extend_from_slice(payer);
    out.extend_from_slice(&amount.to_bytes());
    Ok(())
}

/// Deserializes a fee record (untagged).
pub fn deserialize_fee_paid(buf: &[u8]) -> Result<Particle, ParticleError> {
    check_len(FEE_PAID_LEN, buf.len())?;
    Ok(Particle::FeePaid {
        payer: read_key(buf),
        amount: Amount::from_bytes(&buf[32..]).map_err(|_| ParticleError::Invalid {
            reason: "amount encoding",
        })?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(
        particle: Particle,
        serialize: fn(&Particle, &mut Vec<u8>) -> Result<(), ParticleError>,
        deserialize: fn(&[u8]) -> Result<Particle, ParticleError>,
    ) {
        let mut buf = Vec::new();
        serialize(&particle, &mut buf).expect("serialize");
        let decoded = deserialize(&buf).expect("deserialize");
        assert_eq!(particle, decoded);
    }

    #[test]
    fn test_codecs_round_trip() {
        round_trip(
            Particle::Epoch { epoch: 42 },
            serialize_epoch,
            deserialize_epoch,
        );
        round_trip(
            Particle::TokenResource {
                addr: ResourceAddr::from_bytes([1; 32]),
                granularity: Amount::from_u64(1),
                owner: Some([2; 32]),
            },
            serialize_token_resource,
            deserialize_token_resource,
        );
        round_trip(
            Particle::TokenResource {
                addr: ResourceAddr::from_bytes([1; 32]),
                granularity: Amount::from_u64(100),
                owner: None,
            },
            serialize_token_resource,
            deserialize_token_resource,
        );
        round_trip(
            Particle::Tokens {
                resource: ResourceAddr::from_bytes([3; 32]),
                owner: [4; 32],
                amount: Amount::from_u64(1000),
            },
            serialize_tokens,
            deserialize_tokens,
        );
        round_trip(
            Particle::Validator {
                key: [5; 32],
                registered: true,
            },
            serialize_validator,
            deserialize_validator,
        );
        round_trip(
            Particle::Stake {
                delegate: [6; 32],
                owner: [7; 32],
                amount: Amount::from_u64(500),
            },
            serialize_stake,
            deserialize_stake,
        );
        round_trip(
            Particle::FeePaid {
                payer: [8; 32],
                amount: Amount::from_u64(12),
            },
            serialize_fee_paid,
            deserialize_fee_paid,
        );
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        assert!(deserialize_epoch(&[0u8; 7]).is_err());
        assert!(deserialize_tokens(&[0u8; 95]).is_err());
        assert!(deserialize_tokens(&[0u8; 97]).is_err());
        assert!(deserialize_validator(&[0u8; 34]).is_err());
    }

    #[test]
    fn test_decode_rejects_bad_flags() {
        let mut buf = vec![0u8; VALIDATOR_LEN];
        buf[32] = 2;
        assert_eq!(
            deserialize_validator(&buf),
            Err(ParticleError::InvalidFlag { value: 2 })
        );
    }

    #[test]
    fn test_serialize_rejects_wrong_kind() {
        let mut buf = Vec::new();
        assert!(serialize_epoch(
            &Particle::Tokens {
                resource: ResourceAddr::from_bytes([0; 32]),
                owner: [0; 32],
                amount: Amount::ZERO,
            },
            &mut buf,
        )
        .is_err());
    }

    #[test]
    fn test_resource_addr_derivation_is_deterministic() {
        let a = ResourceAddr::derive(&[1; 32], b"XRD");
        let b = ResourceAddr::derive(&[1; 32], b"XRD");
        let c = ResourceAddr::derive(&[1; 32], b"USD");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
