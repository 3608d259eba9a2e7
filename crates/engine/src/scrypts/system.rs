//! System scrypt: the epoch counter.
//!
//! Exactly one epoch substate is live at a time. Epoch zero is never
//! written; it exists virtually until the first advance consumes it.
//! Advancing requires super-user permission and must up the direct
//! successor of the consumed epoch.

use spindle_types::AmountError;

use crate::context::{Event, ExecutionContext, PermissionLevel};
use crate::error::{ConfigError, ProcedureError};
use crate::particles::{
    deserialize_epoch, serialize_epoch, Particle, ParticleError, ParticleKind,
};
use crate::reducer::{ReducerKind, ReducerState};
use crate::registry::{
    ConstraintScrypt, KeyCodec, OpKey, Procedure, ProcedureKey, ProcedureParam, ProcedureResult,
    ScryptEnv, SubstateDefinition,
};

/// Type tag of the epoch substate.
pub const EPOCH_TAG: u8 = 0;

fn epoch_key_of(particle: &Particle) -> Option<Vec<u8>> {
    // The epoch is a singleton; its key is empty.
    matches!(particle, Particle::Epoch { .. }).then(Vec::new)
}

fn epoch_of_key(key: &[u8]) -> Result<Particle, ParticleError> {
    if !key.is_empty() {
        return Err(ParticleError::Truncated {
            expected: 0,
            actual: key.len(),
        });
    }
    Ok(Particle::Epoch { epoch: 0 })
}

fn is_genesis_epoch(particle: &Particle) -> bool {
    matches!(particle, Particle::Epoch { epoch: 0 })
}

fn down_epoch(
    _state: ReducerState,
    param: ProcedureParam<'_>,
    _ctx: &mut ExecutionContext,
) -> Result<ProcedureResult, ProcedureError> {
    let ProcedureParam::Particle(Particle::Epoch { epoch }) = param else {
        return Err(ProcedureError::UnexpectedParam);
    };
    Ok(ProcedureResult::Next(ReducerState::EpochUpdate {
        prev: *epoch,
    }))
}

fn up_epoch(
    state: ReducerState,
    param: ProcedureParam<'_>,
    ctx: &mut ExecutionContext,
) -> Result<ProcedureResult, ProcedureError> {
    let ReducerState::EpochUpdate { prev } = state else {
        return Err(ProcedureError::UnexpectedParam);
    };
    let ProcedureParam::Particle(Particle::Epoch { epoch }) = param else {
        return Err(ProcedureError::UnexpectedParam);
    };
    let expected = prev.checked_add(1).ok_or(ProcedureError::Arithmetic {
        source: AmountError::Overflow,
    })?;
    if *epoch != expected {
        return Err(ProcedureError::WrongSuccessor {
            expected,
            actual: *epoch,
        });
    }
    ctx.emit(Event::EpochAdvanced { epoch: *epoch });
    Ok(ProcedureResult::Complete)
}

/// The always-loaded system scrypt.
pub struct SystemScrypt;

impl ConstraintScrypt for SystemScrypt {
    fn main(&self, env: &mut ScryptEnv<'_>) -> Result<(), ConfigError> {
        env.register_substate(SubstateDefinition {
            kind: ParticleKind::Epoch,
            type_tag: EPOCH_TAG,
            serialize: serialize_epoch,
            deserialize: deserialize_epoch,
            static_check: None,
            key_codec: Some(KeyCodec {
                key_of: epoch_key_of,
                particle_of: epoch_of_key,
            }),
            virtualizer: Some(is_genesis_epoch),
        })?;

        env.register_procedure(
            ProcedureKey::new(ReducerKind::Void, OpKey::Down(ParticleKind::Epoch)),
            Procedure {
                required_level: PermissionLevel::SuperUser,
                authorizer: None,
                transition: down_epoch,
            },
        )?;
        env.register_procedure(
            ProcedureKey::new(ReducerKind::EpochUpdate, OpKey::Up(ParticleKind::Epoch)),
            Procedure {
                required_level: PermissionLevel::SuperUser,
                authorizer: None,
                transition: up_epoch,
            },
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(PermissionLevel::SuperUser, 0)
    }

    #[test]
    fn test_up_epoch_requires_direct_successor() {
        let particle = Particle::Epoch { epoch: 6 };
        let result = up_epoch(
            ReducerState::EpochUpdate { prev: 4 },
            ProcedureParam::Particle(&particle),
            &mut ctx(),
        );
        assert!(matches!(
            result,
            Err(ProcedureError::WrongSuccessor {
                expected: 5,
                actual: 6,
            })
        ));
    }

    #[test]
    fn test_up_epoch_rejects_counter_wrap() {
        let particle = Particle::Epoch { epoch: 0 };
        let result = up_epoch(
            ReducerState::EpochUpdate { prev: u64::MAX },
            ProcedureParam::Particle(&particle),
            &mut ctx(),
        );
        assert!(matches!(result, Err(ProcedureError::Arithmetic { .. })));
    }
}
