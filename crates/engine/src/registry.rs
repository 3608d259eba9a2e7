//! The substate type and procedure registry.
//!
//! A registry is assembled in two layers: the system layer installed
//! by [`Registry::with_base`], then any number of application scrypts
//! loaded on top. Both layers share one namespace, so a duplicate type
//! tag, particle kind, or procedure key is rejected no matter which
//! layer it collides with.
//!
//! Dispatch is total over registered keys and closed otherwise: the
//! machine looks up `(reducer kind, operation)` and a miss is a
//! constraint violation, never a fallback.

use std::collections::BTreeMap;

use spindle_types::{Spin, SubstateId};

use crate::context::{ExecutionContext, PermissionLevel};
use crate::error::{ConfigError, SubstateDecodeError};
use crate::particles::{Particle, ParticleError, ParticleKind};
use crate::reducer::{ReducerKind, ReducerState};

/// Operation half of a procedure key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OpKey {
    /// Creation of a particle of the given kind.
    Up(ParticleKind),
    /// Consumption of a particle of the given kind.
    Down(ParticleKind),
    /// Non-consuming read of a particle of the given kind.
    Read(ParticleKind),
    /// Group boundary.
    End,
}

/// Lookup key for a transition procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcedureKey {
    /// Reducer state the chain is currently in.
    pub reducer: ReducerKind,
    /// Operation being applied.
    pub op: OpKey,
}

impl ProcedureKey {
    /// Builds a key from its halves.
    #[must_use]
    pub const fn new(reducer: ReducerKind, op: OpKey) -> Self {
        Self { reducer, op }
    }
}

/// Parameter handed to authorizers and transitions: the particle for
/// up/down/read operations, or the group boundary marker.
#[derive(Debug, Clone, Copy)]
pub enum ProcedureParam<'a> {
    /// The particle the operation targets.
    Particle(&'a Particle),
    /// An `End` instruction.
    End,
}

/// Outcome of a transition procedure.
#[derive(Debug)]
pub enum ProcedureResult {
    /// The chain continues in a new state.
    Next(ReducerState),
    /// The chain is complete; the next instruction must be `End`.
    Complete,
}

/// Authorization predicate evaluated before a transition fires.
pub type AuthorizerFn = fn(
    &ReducerState,
    ProcedureParam<'_>,
    &ExecutionContext,
) -> Result<(), crate::error::ProcedureError>;

/// State transition applied when a procedure fires.
pub type TransitionFn = fn(
    ReducerState,
    ProcedureParam<'_>,
    &mut ExecutionContext,
) -> Result<ProcedureResult, crate::error::ProcedureError>;

/// One registered transition procedure.
pub struct Procedure {
    /// Minimum permission level required to fire this procedure.
    pub required_level: PermissionLevel,
    /// Authorization predicate, if any.
    pub authorizer: Option<AuthorizerFn>,
    /// The transition itself.
    pub transition: TransitionFn,
}

/// Untagged particle serializer.
pub type SerializeFn = fn(&Particle, &mut Vec<u8>) -> Result<(), ParticleError>;
/// Untagged particle deserializer.
pub type DeserializeFn = fn(&[u8]) -> Result<Particle, ParticleError>;
/// Structural validity check applied to freshly created particles.
pub type StaticCheckFn = fn(&Particle) -> Result<(), ParticleError>;
/// Predicate deciding whether a never-written particle counts as UP.
pub type VirtualizerFn = fn(&Particle) -> bool;

/// Bidirectional mapping between a particle and its addressable key.
pub struct KeyCodec {
    /// Extracts the key bytes of an addressable particle.
    pub key_of: fn(&Particle) -> Option<Vec<u8>>,
    /// Reconstructs the default particle for a key.
    pub particle_of: fn(&[u8]) -> Result<Particle, ParticleError>,
}

/// Everything the machine needs to know about one substate type.
pub struct SubstateDefinition {
    /// The particle kind this definition covers.
    pub kind: ParticleKind,
    /// Type tag carried as the leading payload byte.
    pub type_tag: u8,
    /// Untagged body serializer.
    pub serialize: SerializeFn,
    /// Untagged body deserializer.
    pub deserialize: DeserializeFn,
    /// Structural check on creation, if any.
    pub static_check: Option<StaticCheckFn>,
    /// Key codec, for types addressable by key.
    pub key_codec: Option<KeyCodec>,
    /// Virtual-UP predicate, for types with virtual defaults.
    pub virtualizer: Option<VirtualizerFn>,
}

/// A loadable bundle of substate types and procedures.
pub trait ConstraintScrypt {
    /// Registers this scrypt's types and procedures into `env`.
    fn main(&self, env: &mut ScryptEnv<'_>) -> Result<(), ConfigError>;
}

/// Registration facade handed to a scrypt while it loads.
pub struct ScryptEnv<'a> {
    registry: &'a mut Registry,
}

impl ScryptEnv<'_> {
    /// Registers a substate type definition.
    pub fn register_substate(&mut self, definition: SubstateDefinition) -> Result<(), ConfigError> {
        self.registry.register_substate(definition)
    }

    /// Registers a transition procedure.
    pub fn register_procedure(
        &mut self,
        key: ProcedureKey,
        procedure: Procedure,
    ) -> Result<(), ConfigError> {
        self.registry.register_procedure(key, procedure)
    }
}

/// The assembled substate type and procedure tables.
pub struct Registry {
    definitions: BTreeMap<u8, SubstateDefinition>,
    tags: BTreeMap<ParticleKind, u8>,
    procedures: BTreeMap<ProcedureKey, Procedure>,
}

impl Registry {
    /// An empty registry with no system layer. Useful for tests that
    /// want full control over what is registered.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            definitions: BTreeMap::new(),
            tags: BTreeMap::new(),
            procedures: BTreeMap::new(),
        }
    }

    /// A registry with the system layer (epoch tracking) installed.
    pub fn with_base() -> Result<Self, ConfigError> {
        let mut registry = Self::empty();
        registry.load(&crate::scrypts::system::SystemScrypt)?;
        Ok(registry)
    }

    /// Loads an application scrypt on top of what is already present.
    pub fn load(&mut self, scrypt: &dyn ConstraintScrypt) -> Result<(), ConfigError> {
        let mut env = ScryptEnv { registry: self };
        scrypt.main(&mut env)
    }

    fn register_substate(&mut self, definition: SubstateDefinition) -> Result<(), ConfigError> {
        if self.definitions.contains_key(&definition.type_tag) {
            return Err(ConfigError::DuplicateTypeTag {
                tag: definition.type_tag,
            });
        }
        if self.tags.contains_key(&definition.kind) {
            return Err(ConfigError::DuplicateKind {
                kind: definition.kind,
            });
        }
        self.tags.insert(definition.kind, definition.type_tag);
        self.definitions.insert(definition.type_tag, definition);
        Ok(())
    }

    fn register_procedure(
        &mut self,
        key: ProcedureKey,
        procedure: Procedure,
    ) -> Result<(), ConfigError> {
        if self.procedures.contains_key(&key) {
            return Err(ConfigError::DuplicateProcedure { key });
        }
        self.procedures.insert(key, procedure);
        Ok(())
    }

    /// Looks up the procedure for a state/operation pair.
    #[must_use]
    pub fn procedure(&self, key: &ProcedureKey) -> Option<&Procedure> {
        self.procedures.get(key)
    }

    /// The type tag assigned to a particle kind.
    #[must_use]
    pub fn tag_of(&self, kind: ParticleKind) -> Option<u8> {
        self.tags.get(&kind).copied()
    }

    /// The definition registered under a type tag.
    #[must_use]
    pub fn definition(&self, tag: u8) -> Option<&SubstateDefinition> {
        self.definitions.get(&tag)
    }

    /// Decodes a tagged payload into its tag and particle.
    pub fn decode_payload(&self, payload: &[u8]) -> Result<(u8, Particle), SubstateDecodeError> {
        let (&tag, body) = payload.split_first().ok_or(SubstateDecodeError::Empty)?;
        let definition = self
            .definitions
            .get(&tag)
            .ok_or(SubstateDecodeError::UnknownTag { tag })?;
        let particle = (definition.deserialize)(body)
            .map_err(|source| SubstateDecodeError::Particle { source })?;
        Ok((tag, particle))
    }

    /// Encodes a particle into its tagged payload.
    pub fn encode_particle(&self, particle: &Particle) -> Result<Vec<u8>, SubstateDecodeError> {
        let kind = particle.kind();
        let tag = self
            .tag_of(kind)
            .ok_or(SubstateDecodeError::UnknownKind { kind })?;
        let definition = &self.definitions[&tag];
        let mut payload = vec![tag];
        (definition.serialize)(particle, &mut payload)
            .map_err(|source| SubstateDecodeError::Particle { source })?;
        Ok(payload)
    }

    /// Reconstructs the default particle for a tagged virtual key.
    pub fn key_to_particle(&self, tagged_key: &[u8]) -> Result<(u8, Particle), SubstateDecodeError> {
        let (&tag, key) = tagged_key.split_first().ok_or(SubstateDecodeError::Empty)?;
        let definition = self
            .definitions
            .get(&tag)
            .ok_or(SubstateDecodeError::UnknownTag { tag })?;
        let codec = definition
            .key_codec
            .as_ref()
            .ok_or(SubstateDecodeError::NotAddressable { tag })?;
        let particle = (codec.particle_of)(key)
            .map_err(|source| SubstateDecodeError::Particle { source })?;
        Ok((tag, particle))
    }

    /// The virtual substate id of an addressable particle, if its type
    /// carries a key codec and the particle has a key.
    #[must_use]
    pub fn virtual_id(&self, particle: &Particle) -> Option<SubstateId> {
        let tag = self.tag_of(particle.kind())?;
        let codec = self.definitions[&tag].key_codec.as_ref()?;
        let key = (codec.key_of)(particle)?;
        let mut tagged = Vec::with_capacity(1 + key.len());
        tagged.push(tag);
        tagged.extend_from_slice(&key);
        Some(SubstateId::of_virtual(tagged))
    }

    /// The spin a never-written particle holds: `Up` when a registered
    /// virtualizer accepts it, otherwise `Neutral`.
    #[must_use]
    pub fn virtual_spin(&self, tag: u8, particle: &Particle) -> Spin {
        let accepted = self
            .definitions
            .get(&tag)
            .and_then(|definition| definition.virtualizer)
            .is_some_and(|virtualizer| virtualizer(particle));
        if accepted {
            Spin::Up
        } else {
            Spin::Neutral
        }
    }

    /// Runs the static check registered for a tag, if any.
    pub fn static_check(&self, tag: u8, particle: &Particle) -> Result<(), ParticleError> {
        if let Some(check) = self
            .definitions
            .get(&tag)
            .and_then(|definition| definition.static_check)
        {
            check(particle)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::particles::{
        deserialize_epoch, deserialize_tokens, serialize_epoch, serialize_tokens,
    };
    use crate::scrypts::system::EPOCH_TAG;

    struct RedundantEpochScrypt;

    impl ConstraintScrypt for RedundantEpochScrypt {
        fn main(&self, env: &mut ScryptEnv<'_>) -> Result<(), ConfigError> {
            env.register_substate(SubstateDefinition {
                kind: ParticleKind::Epoch,
                type_tag: 200,
                serialize: serialize_epoch,
                deserialize: deserialize_epoch,
                static_check: None,
                key_codec: None,
                virtualizer: None,
            })
        }
    }

    #[test]
    fn test_base_layer_registers_epoch() {
        let registry = Registry::with_base().expect("base registry");
        let tag = registry.tag_of(ParticleKind::Epoch).expect("epoch tag");
        let payload = registry
            .encode_particle(&Particle::Epoch { epoch: 9 })
            .expect("encode");
        assert_eq!(payload[0], tag);
        let (decoded_tag, particle) = registry.decode_payload(&payload).expect("decode");
        assert_eq!(decoded_tag, tag);
        assert_eq!(particle, Particle::Epoch { epoch: 9 });
    }

    struct TagReuseScrypt;

    impl ConstraintScrypt for TagReuseScrypt {
        fn main(&self, env: &mut ScryptEnv<'_>) -> Result<(), ConfigError> {
            env.register_substate(SubstateDefinition {
                kind: ParticleKind::Tokens,
                type_tag: EPOCH_TAG,
                serialize: serialize_tokens,
                deserialize: deserialize_tokens,
                static_check: None,
                key_codec: None,
                virtualizer: None,
            })
        }
    }

    #[test]
    fn test_duplicate_kind_rejected_across_layers() {
        let mut registry = Registry::with_base().expect("base registry");
        let result = registry.load(&RedundantEpochScrypt);
        assert!(matches!(
            result,
            Err(ConfigError::DuplicateKind {
                kind: ParticleKind::Epoch
            })
        ));
    }

    #[test]
    fn test_duplicate_type_tag_rejected_across_layers() {
        let mut registry = Registry::with_base().expect("base registry");
        let result = registry.load(&TagReuseScrypt);
        assert!(matches!(
            result,
            Err(ConfigError::DuplicateTypeTag { tag: EPOCH_TAG })
        ));

        // The squatter registered nothing and the first registration
        // still decodes under its tag.
        assert_eq!(registry.tag_of(ParticleKind::Tokens), None);
        let payload = registry
            .encode_particle(&Particle::Epoch { epoch: 3 })
            .expect("encode");
        let (tag, particle) = registry.decode_payload(&payload).expect("decode");
        assert_eq!(tag, EPOCH_TAG);
        assert_eq!(particle, Particle::Epoch { epoch: 3 });
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let registry = Registry::empty();
        assert_eq!(
            registry.decode_payload(&[99, 0, 0]),
            Err(SubstateDecodeError::UnknownTag { tag: 99 })
        );
        assert_eq!(
            registry.decode_payload(&[]),
            Err(SubstateDecodeError::Empty)
        );
    }
}
