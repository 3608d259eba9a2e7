//! Stake scrypt: validator registration and delegation.
//!
//! Validators exist virtually in the unregistered state, so the first
//! registration consumes the virtual default. Delegation reads the
//! validator flag first and only proceeds when it is registered; token
//! inputs convert into stake substates plus optional change, with the
//! same conservation discipline as transfers.

use snafu::ResultExt;

use spindle_types::{Amount, WideAmount};

use crate::context::{Event, ExecutionContext, PermissionLevel};
use crate::error::{ArithmeticSnafu, ConfigError, ProcedureError};
use crate::particles::{
    deserialize_stake, deserialize_validator, serialize_stake, serialize_validator, Particle,
    ParticleError, ParticleKind,
};
use crate::reducer::{ReducerKind, ReducerState};
use crate::registry::{
    ConstraintScrypt, KeyCodec, OpKey, Procedure, ProcedureKey, ProcedureParam, ProcedureResult,
    ScryptEnv, SubstateDefinition,
};

/// Type tag of validator flag substates.
pub const VALIDATOR_TAG: u8 = 4;
/// Type tag of stake substates.
pub const STAKE_TAG: u8 = 5;

/// Minimum stake per created stake substate, in base units.
pub const MINIMUM_STAKE: u64 = 100;

fn check_stake(particle: &Particle) -> Result<(), ParticleError> {
    let Particle::Stake { amount, .. } = particle else {
        return Err(ParticleError::WrongKind {
            expected: ParticleKind::Stake,
        });
    };
    if amount.is_zero() {
        return Err(ParticleError::Invalid {
            reason: "zero amount",
        });
    }
    Ok(())
}

fn validator_key_of(particle: &Particle) -> Option<Vec<u8>> {
    let Particle::Validator { key, .. } = particle else {
        return None;
    };
    Some(key.to_vec())
}

fn validator_of_key(key: &[u8]) -> Result<Particle, ParticleError> {
    if key.len() != 32 {
        return Err(ParticleError::Truncated {
            expected: 32,
            actual: key.len(),
        });
    }
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(key);
    Ok(Particle::Validator {
        key: bytes,
        registered: false,
    })
}

fn is_unregistered(particle: &Particle) -> bool {
    matches!(
        particle,
        Particle::Validator {
            registered: false,
            ..
        }
    )
}

fn validator_self_auth(
    _state: &ReducerState,
    param: ProcedureParam<'_>,
    ctx: &ExecutionContext,
) -> Result<(), ProcedureError> {
    let ProcedureParam::Particle(Particle::Validator { key, .. }) = param else {
        return Err(ProcedureError::UnexpectedParam);
    };
    if !ctx.is_signed_by(key) {
        return Err(ProcedureError::MissingRequiredSignature);
    }
    Ok(())
}

fn stake_tokens_auth(
    _state: &ReducerState,
    param: ProcedureParam<'_>,
    ctx: &ExecutionContext,
) -> Result<(), ProcedureError> {
    let ProcedureParam::Particle(Particle::Tokens { owner, .. }) = param else {
        return Err(ProcedureError::UnexpectedParam);
    };
    if !ctx.is_signed_by(owner) {
        return Err(ProcedureError::MissingRequiredSignature);
    }
    Ok(())
}

fn read_validator(
    _state: ReducerState,
    param: ProcedureParam<'_>,
    _ctx: &mut ExecutionContext,
) -> Result<ProcedureResult, ProcedureError> {
    let ProcedureParam::Particle(Particle::Validator { key, registered }) = param else {
        return Err(ProcedureError::UnexpectedParam);
    };
    Ok(ProcedureResult::Next(ReducerState::ValidatorInHand {
        key: *key,
        registered: *registered,
    }))
}

fn down_validator(
    _state: ReducerState,
    param: ProcedureParam<'_>,
    _ctx: &mut ExecutionContext,
) -> Result<ProcedureResult, ProcedureError> {
    let ProcedureParam::Particle(Particle::Validator { key, .. }) = param else {
        return Err(ProcedureError::UnexpectedParam);
    };
    Ok(ProcedureResult::Next(ReducerState::ValidatorUpdate {
        key: *key,
    }))
}

fn up_validator(
    state: ReducerState,
    param: ProcedureParam<'_>,
    ctx: &mut ExecutionContext,
) -> Result<ProcedureResult, ProcedureError> {
    let ReducerState::ValidatorUpdate { key } = state else {
        return Err(ProcedureError::UnexpectedParam);
    };
    let ProcedureParam::Particle(Particle::Validator {
        key: new_key,
        registered,
    }) = param
    else {
        return Err(ProcedureError::UnexpectedParam);
    };
    if *new_key != key {
        return Err(ProcedureError::KeyMismatch);
    }
    ctx.emit(Event::ValidatorUpdated {
        key,
        registered: *registered,
    });
    Ok(ProcedureResult::Complete)
}

fn open_stake(
    state: ReducerState,
    param: ProcedureParam<'_>,
    _ctx: &mut ExecutionContext,
) -> Result<ProcedureResult, ProcedureError> {
    let ReducerState::ValidatorInHand { key, registered } = state else {
        return Err(ProcedureError::UnexpectedParam);
    };
    if !registered {
        return Err(ProcedureError::ValidatorNotRegistered { key });
    }
    let ProcedureParam::Particle(Particle::Tokens {
        resource, amount, ..
    }) = param
    else {
        return Err(ProcedureError::UnexpectedParam);
    };
    Ok(ProcedureResult::Next(ReducerState::StakePrep {
        delegate: key,
        resource: *resource,
        input: WideAmount::ZERO
            .add_amount(*amount)
            .context(ArithmeticSnafu)?,
        staked: WideAmount::ZERO,
        change: WideAmount::ZERO,
    }))
}

fn stake_down_tokens(
    state: ReducerState,
    param: ProcedureParam<'_>,
    _ctx: &mut ExecutionContext,
) -> Result<ProcedureResult, ProcedureError> {
    let ReducerState::StakePrep {
        delegate,
        resource,
        input,
        staked,
        change,
    } = state
    else {
        return Err(ProcedureError::UnexpectedParam);
    };
    let ProcedureParam::Particle(Particle::Tokens {
        resource: particle_resource,
        amount,
        ..
    }) = param
    else {
        return Err(ProcedureError::UnexpectedParam);
    };
    if *particle_resource != resource {
        return Err(ProcedureError::ResourceMismatch);
    }
    Ok(ProcedureResult::Next(ReducerState::StakePrep {
        delegate,
        resource,
        input: input.add_amount(*amount).context(ArithmeticSnafu)?,
        staked,
        change,
    }))
}

fn up_stake(
    state: ReducerState,
    param: ProcedureParam<'_>,
    _ctx: &mut ExecutionContext,
) -> Result<ProcedureResult, ProcedureError> {
    let ReducerState::StakePrep {
        delegate,
        resource,
        input,
        staked,
        change,
    } = state
    else {
        return Err(ProcedureError::UnexpectedParam);
    };
    let ProcedureParam::Particle(Particle::Stake {
        delegate: particle_delegate,
        amount,
        ..
    }) = param
    else {
        return Err(ProcedureError::UnexpectedParam);
    };
    if *particle_delegate != delegate {
        return Err(ProcedureError::KeyMismatch);
    }
    let minimum = Amount::from_u64(MINIMUM_STAKE);
    if *amount < minimum {
        return Err(ProcedureError::MinimumStake {
            amount: *amount,
            minimum,
        });
    }
    Ok(ProcedureResult::Next(ReducerState::StakePrep {
        delegate,
        resource,
        input,
        staked: staked.add_amount(*amount).context(ArithmeticSnafu)?,
        change,
    }))
}

fn stake_change(
    state: ReducerState,
    param: ProcedureParam<'_>,
    _ctx: &mut ExecutionContext,
) -> Result<ProcedureResult, ProcedureError> {
    let ReducerState::StakePrep {
        delegate,
        resource,
        input,
        staked,
        change,
    } = state
    else {
        return Err(ProcedureError::UnexpectedParam);
    };
    let ProcedureParam::Particle(Particle::Tokens {
        resource: particle_resource,
        amount,
        ..
    }) = param
    else {
        return Err(ProcedureError::UnexpectedParam);
    };
    if *particle_resource != resource {
        return Err(ProcedureError::ResourceMismatch);
    }
    Ok(ProcedureResult::Next(ReducerState::StakePrep {
        delegate,
        resource,
        input,
        staked,
        change: change.add_amount(*amount).context(ArithmeticSnafu)?,
    }))
}

fn stake_end(
    state: ReducerState,
    _param: ProcedureParam<'_>,
    ctx: &mut ExecutionContext,
) -> Result<ProcedureResult, ProcedureError> {
    let ReducerState::StakePrep {
        delegate,
        input,
        staked,
        change,
        ..
    } = state
    else {
        return Err(ProcedureError::UnexpectedParam);
    };
    let output = staked
        .add_amount(change.try_to_amount().context(ArithmeticSnafu)?)
        .context(ArithmeticSnafu)?;
    if ctx.resource_bookkeeping() && output != input {
        return Err(ProcedureError::UnbalancedGroup { input, output });
    }
    ctx.emit(Event::Staked {
        delegate,
        amount: staked.try_to_amount().context(ArithmeticSnafu)?,
    });
    Ok(ProcedureResult::Complete)
}

/// Validator flags and stake delegation.
pub struct StakeScrypt;

impl ConstraintScrypt for StakeScrypt {
    fn main(&self, env: &mut ScryptEnv<'_>) -> Result<(), ConfigError> {
        env.register_substate(SubstateDefinition {
            kind: ParticleKind::Validator,
            type_tag: VALIDATOR_TAG,
            serialize: serialize_validator,
            deserialize: deserialize_validator,
            static_check: None,
            key_codec: Some(KeyCodec {
                key_of: validator_key_of,
                particle_of: validator_of_key,
            }),
            virtualizer: Some(is_unregistered),
        })?;
        env.register_substate(SubstateDefinition {
            kind: ParticleKind::Stake,
            type_tag: STAKE_TAG,
            serialize: serialize_stake,
            deserialize: deserialize_stake,
            static_check: Some(check_stake),
            key_codec: None,
            virtualizer: None,
        })?;

        let user = PermissionLevel::User;

        // Registration: down the current flag (virtually unregistered
        // at first), up the replacement for the same key.
        env.register_procedure(
            ProcedureKey::new(ReducerKind::Void, OpKey::Down(ParticleKind::Validator)),
            Procedure {
                required_level: user,
                authorizer: Some(validator_self_auth),
                transition: down_validator,
            },
        )?;
        env.register_procedure(
            ProcedureKey::new(
                ReducerKind::ValidatorUpdate,
                OpKey::Up(ParticleKind::Validator),
            ),
            Procedure {
                required_level: user,
                authorizer: None,
                transition: up_validator,
            },
        )?;

        // Delegation.
        env.register_procedure(
            ProcedureKey::new(ReducerKind::Void, OpKey::Read(ParticleKind::Validator)),
            Procedure {
                required_level: user,
                authorizer: None,
                transition: read_validator,
            },
        )?;
        env.register_procedure(
            ProcedureKey::new(
                ReducerKind::ValidatorInHand,
                OpKey::Down(ParticleKind::Tokens),
            ),
            Procedure {
                required_level: user,
                authorizer: Some(stake_tokens_auth),
                transition: open_stake,
            },
        )?;
        env.register_procedure(
            ProcedureKey::new(ReducerKind::StakePrep, OpKey::Down(ParticleKind::Tokens)),
            Procedure {
                required_level: user,
                authorizer: Some(stake_tokens_auth),
                transition: stake_down_tokens,
            },
        )?;
        env.register_procedure(
            ProcedureKey::new(ReducerKind::StakePrep, OpKey::Up(ParticleKind::Stake)),
            Procedure {
                required_level: user,
                authorizer: None,
                transition: up_stake,
            },
        )?;
        env.register_procedure(
            ProcedureKey::new(ReducerKind::StakePrep, OpKey::Up(ParticleKind::Tokens)),
            Procedure {
                required_level: user,
                authorizer: None,
                transition: stake_change,
            },
        )?;
        env.register_procedure(
            ProcedureKey::new(ReducerKind::StakePrep, OpKey::End),
            Procedure {
                required_level: user,
                authorizer: None,
                transition: stake_end,
            },
        )?;
        Ok(())
    }
}
