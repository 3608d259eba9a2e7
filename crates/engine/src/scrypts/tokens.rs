//! Tokens scrypt: resource definitions, transfers, mint, burn, fees.
//!
//! Token groups are conservation-checked: a chain of holdings may only
//! end once the consumed and created totals are equal, or once the
//! difference is claimed explicitly by a fee substate. Minting and
//! burning run against a resource definition held in hand, so supply
//! changes always name the definition that authorizes them.

use snafu::ResultExt;

use spindle_types::{Amount, WideAmount};

use crate::context::{Event, ExecutionContext, PermissionLevel};
use crate::error::{ArithmeticSnafu, ConfigError, ProcedureError};
use crate::particles::{
    deserialize_fee_paid, deserialize_token_resource, deserialize_tokens, serialize_fee_paid,
    serialize_token_resource, serialize_tokens, Particle, ParticleError, ParticleKind,
};
use crate::reducer::{ReducerKind, ReducerState};
use crate::registry::{
    ConstraintScrypt, KeyCodec, OpKey, Procedure, ProcedureKey, ProcedureParam, ProcedureResult,
    ScryptEnv, SubstateDefinition,
};

/// Type tag of resource definition substates.
pub const TOKEN_RESOURCE_TAG: u8 = 1;
/// Type tag of token holding substates.
pub const TOKENS_TAG: u8 = 2;
/// Type tag of fee record substates.
pub const FEE_PAID_TAG: u8 = 3;

fn wide(amount: Amount) -> Result<WideAmount, ProcedureError> {
    WideAmount::ZERO.add_amount(amount).context(ArithmeticSnafu)
}

fn check_token_resource(particle: &Particle) -> Result<(), ParticleError> {
    let Particle::TokenResource { granularity, .. } = particle else {
        return Err(ParticleError::WrongKind {
            expected: ParticleKind::TokenResource,
        });
    };
    if granularity.is_zero() {
        return Err(ParticleError::Invalid {
            reason: "zero granularity",
        });
    }
    Ok(())
}

fn check_tokens(particle: &Particle) -> Result<(), ParticleError> {
    let Particle::Tokens { amount, .. } = particle else {
        return Err(ParticleError::WrongKind {
            expected: ParticleKind::Tokens,
        });
    };
    if amount.is_zero() {
        return Err(ParticleError::Invalid {
            reason: "zero amount",
        });
    }
    Ok(())
}

fn resource_key_of(particle: &Particle) -> Option<Vec<u8>> {
    let Particle::TokenResource { addr, .. } = particle else {
        return None;
    };
    Some(addr.as_bytes().to_vec())
}

fn resource_of_key(_key: &[u8]) -> Result<Particle, ParticleError> {
    // Definitions are physical only; the key exists for point lookup.
    Err(ParticleError::Invalid {
        reason: "resource definitions are not virtual",
    })
}

fn spend_tokens_auth(
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

fn mint_auth(
    state: &ReducerState,
    _param: ProcedureParam<'_>,
    ctx: &ExecutionContext,
) -> Result<(), ProcedureError> {
    let ReducerState::ResourceInHand {
        owner,
        just_created,
        ..
    } = state
    else {
        return Err(ProcedureError::UnexpectedParam);
    };
    if *just_created {
        return Ok(());
    }
    match owner {
        Some(key) if ctx.is_signed_by(key) => Ok(()),
        Some(_) => Err(ProcedureError::MissingRequiredSignature),
        None => Err(ProcedureError::FixedSupply),
    }
}

fn up_token_resource(
    _state: ReducerState,
    param: ProcedureParam<'_>,
    _ctx: &mut ExecutionContext,
) -> Result<ProcedureResult, ProcedureError> {
    let ProcedureParam::Particle(Particle::TokenResource {
        addr,
        granularity,
        owner,
    }) = param
    else {
        return Err(ProcedureError::UnexpectedParam);
    };
    Ok(ProcedureResult::Next(ReducerState::ResourceInHand {
        addr: *addr,
        owner: *owner,
        granularity: *granularity,
        just_created: true,
    }))
}

fn read_token_resource(
    _state: ReducerState,
    param: ProcedureParam<'_>,
    _ctx: &mut ExecutionContext,
) -> Result<ProcedureResult, ProcedureError> {
    let ProcedureParam::Particle(Particle::TokenResource {
        addr,
        granularity,
        owner,
    }) = param
    else {
        return Err(ProcedureError::UnexpectedParam);
    };
    Ok(ProcedureResult::Next(ReducerState::ResourceInHand {
        addr: *addr,
        owner: *owner,
        granularity: *granularity,
        just_created: false,
    }))
}

fn resource_end(
    _state: ReducerState,
    _param: ProcedureParam<'_>,
    _ctx: &mut ExecutionContext,
) -> Result<ProcedureResult, ProcedureError> {
    Ok(ProcedureResult::Complete)
}

fn mint_tokens(
    state: ReducerState,
    param: ProcedureParam<'_>,
    _ctx: &mut ExecutionContext,
) -> Result<ProcedureResult, ProcedureError> {
    let (addr, granularity, minted) = match state {
        ReducerState::ResourceInHand {
            addr, granularity, ..
        } => (addr, granularity, WideAmount::ZERO),
        ReducerState::ResourceMint {
            addr,
            granularity,
            minted,
        } => (addr, granularity, minted),
        _ => return Err(ProcedureError::UnexpectedParam),
    };
    let ProcedureParam::Particle(Particle::Tokens {
        resource, amount, ..
    }) = param
    else {
        return Err(ProcedureError::UnexpectedParam);
    };
    if *resource != addr {
        return Err(ProcedureError::ResourceMismatch);
    }
    if !amount.is_multiple_of(granularity) {
        return Err(ProcedureError::GranularityViolation {
            amount: *amount,
            granularity,
        });
    }
    Ok(ProcedureResult::Next(ReducerState::ResourceMint {
        addr,
        granularity,
        minted: minted.add_amount(*amount).context(ArithmeticSnafu)?,
    }))
}

fn mint_end(
    state: ReducerState,
    _param: ProcedureParam<'_>,
    ctx: &mut ExecutionContext,
) -> Result<ProcedureResult, ProcedureError> {
    let ReducerState::ResourceMint { addr, minted, .. } = state else {
        return Err(ProcedureError::UnexpectedParam);
    };
    let amount = minted.try_to_amount().context(ArithmeticSnafu)?;
    ctx.emit(Event::TokensMinted {
        resource: addr,
        amount,
    });
    Ok(ProcedureResult::Complete)
}

fn burn_tokens(
    state: ReducerState,
    param: ProcedureParam<'_>,
    _ctx: &mut ExecutionContext,
) -> Result<ProcedureResult, ProcedureError> {
    let (addr, burned) = match state {
        ReducerState::ResourceInHand { addr, owner, .. } => {
            if owner.is_none() {
                return Err(ProcedureError::FixedSupply);
            }
            (addr, WideAmount::ZERO)
        }
        ReducerState::ResourceBurn { addr, burned } => (addr, burned),
        _ => return Err(ProcedureError::UnexpectedParam),
    };
    let ProcedureParam::Particle(Particle::Tokens {
        resource, amount, ..
    }) = param
    else {
        return Err(ProcedureError::UnexpectedParam);
    };
    if *resource != addr {
        return Err(ProcedureError::ResourceMismatch);
    }
    Ok(ProcedureResult::Next(ReducerState::ResourceBurn {
        addr,
        burned: burned.add_amount(*amount).context(ArithmeticSnafu)?,
    }))
}

fn burn_end(
    state: ReducerState,
    _param: ProcedureParam<'_>,
    ctx: &mut ExecutionContext,
) -> Result<ProcedureResult, ProcedureError> {
    let ReducerState::ResourceBurn { addr, burned } = state else {
        return Err(ProcedureError::UnexpectedParam);
    };
    let amount = burned.try_to_amount().context(ArithmeticSnafu)?;
    ctx.emit(Event::TokensBurned {
        resource: addr,
        amount,
    });
    Ok(ProcedureResult::Complete)
}

fn open_holdings(
    _state: ReducerState,
    param: ProcedureParam<'_>,
    _ctx: &mut ExecutionContext,
) -> Result<ProcedureResult, ProcedureError> {
    let ProcedureParam::Particle(Particle::Tokens {
        resource, amount, ..
    }) = param
    else {
        return Err(ProcedureError::UnexpectedParam);
    };
    Ok(ProcedureResult::Next(ReducerState::TokenHoldings {
        resource: *resource,
        input: wide(*amount)?,
        output: WideAmount::ZERO,
    }))
}

fn holdings_down(
    state: ReducerState,
    param: ProcedureParam<'_>,
    _ctx: &mut ExecutionContext,
) -> Result<ProcedureResult, ProcedureError> {
    let ReducerState::TokenHoldings {
        resource,
        input,
        output,
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
    Ok(ProcedureResult::Next(ReducerState::TokenHoldings {
        resource,
        input: input.add_amount(*amount).context(ArithmeticSnafu)?,
        output,
    }))
}

fn holdings_up(
    state: ReducerState,
    param: ProcedureParam<'_>,
    _ctx: &mut ExecutionContext,
) -> Result<ProcedureResult, ProcedureError> {
    let ReducerState::TokenHoldings {
        resource,
        input,
        output,
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
    Ok(ProcedureResult::Next(ReducerState::TokenHoldings {
        resource,
        input,
        output: output.add_amount(*amount).context(ArithmeticSnafu)?,
    }))
}

fn holdings_end(
    state: ReducerState,
    _param: ProcedureParam<'_>,
    ctx: &mut ExecutionContext,
) -> Result<ProcedureResult, ProcedureError> {
    let ReducerState::TokenHoldings { input, output, .. } = state else {
        return Err(ProcedureError::UnexpectedParam);
    };
    if ctx.resource_bookkeeping() && input != output {
        return Err(ProcedureError::UnbalancedGroup { input, output });
    }
    Ok(ProcedureResult::Complete)
}

fn claim_fee(
    state: ReducerState,
    param: ProcedureParam<'_>,
    ctx: &mut ExecutionContext,
) -> Result<ProcedureResult, ProcedureError> {
    let ReducerState::TokenHoldings { input, output, .. } = state else {
        return Err(ProcedureError::UnexpectedParam);
    };
    let ProcedureParam::Particle(Particle::FeePaid { payer, amount }) = param else {
        return Err(ProcedureError::UnexpectedParam);
    };
    let closed = output.add_amount(*amount).context(ArithmeticSnafu)?;
    if closed != input {
        return Err(ProcedureError::FeeMismatch {
            fee: *amount,
            input,
            output,
        });
    }
    ctx.emit(Event::FeePaid {
        payer: *payer,
        amount: *amount,
    });
    Ok(ProcedureResult::Complete)
}

/// Token resources, transfers, supply changes, and fees.
pub struct TokensScrypt;

impl ConstraintScrypt for TokensScrypt {
    fn main(&self, env: &mut ScryptEnv<'_>) -> Result<(), ConfigError> {
        env.register_substate(SubstateDefinition {
            kind: ParticleKind::TokenResource,
            type_tag: TOKEN_RESOURCE_TAG,
            serialize: serialize_token_resource,
            deserialize: deserialize_token_resource,
            static_check: Some(check_token_resource),
            key_codec: Some(KeyCodec {
                key_of: resource_key_of,
                particle_of: resource_of_key,
            }),
            virtualizer: None,
        })?;
        env.register_substate(SubstateDefinition {
            kind: ParticleKind::Tokens,
            type_tag: TOKENS_TAG,
            serialize: serialize_tokens,
            deserialize: deserialize_tokens,
            static_check: Some(check_tokens),
            key_codec: None,
            virtualizer: None,
        })?;
        env.register_substate(SubstateDefinition {
            kind: ParticleKind::FeePaid,
            type_tag: FEE_PAID_TAG,
            serialize: serialize_fee_paid,
            deserialize: deserialize_fee_paid,
            static_check: None,
            key_codec: None,
            virtualizer: None,
        })?;

        let user = PermissionLevel::User;

        // Resource creation and lookup.
        env.register_procedure(
            ProcedureKey::new(ReducerKind::Void, OpKey::Up(ParticleKind::TokenResource)),
            Procedure {
                required_level: user,
                authorizer: None,
                transition: up_token_resource,
            },
        )?;
        env.register_procedure(
            ProcedureKey::new(ReducerKind::Void, OpKey::Read(ParticleKind::TokenResource)),
            Procedure {
                required_level: user,
                authorizer: None,
                transition: read_token_resource,
            },
        )?;
        env.register_procedure(
            ProcedureKey::new(ReducerKind::ResourceInHand, OpKey::End),
            Procedure {
                required_level: user,
                authorizer: None,
                transition: resource_end,
            },
        )?;

        // Minting.
        env.register_procedure(
            ProcedureKey::new(ReducerKind::ResourceInHand, OpKey::Up(ParticleKind::Tokens)),
            Procedure {
                required_level: user,
                authorizer: Some(mint_auth),
                transition: mint_tokens,
            },
        )?;
        env.register_procedure(
            ProcedureKey::new(ReducerKind::ResourceMint, OpKey::Up(ParticleKind::Tokens)),
            Procedure {
                required_level: user,
                authorizer: None,
                transition: mint_tokens,
            },
        )?;
        env.register_procedure(
            ProcedureKey::new(ReducerKind::ResourceMint, OpKey::End),
            Procedure {
                required_level: user,
                authorizer: None,
                transition: mint_end,
            },
        )?;

        // Burning.
        env.register_procedure(
            ProcedureKey::new(
                ReducerKind::ResourceInHand,
                OpKey::Down(ParticleKind::Tokens),
            ),
            Procedure {
                required_level: user,
                authorizer: Some(spend_tokens_auth),
                transition: burn_tokens,
            },
        )?;
        env.register_procedure(
            ProcedureKey::new(ReducerKind::ResourceBurn, OpKey::Down(ParticleKind::Tokens)),
            Procedure {
                required_level: user,
                authorizer: Some(spend_tokens_auth),
                transition: burn_tokens,
            },
        )?;
        env.register_procedure(
            ProcedureKey::new(ReducerKind::ResourceBurn, OpKey::End),
            Procedure {
                required_level: user,
                authorizer: None,
                transition: burn_end,
            },
        )?;

        // Transfers and fees.
        env.register_procedure(
            ProcedureKey::new(ReducerKind::Void, OpKey::Down(ParticleKind::Tokens)),
            Procedure {
                required_level: user,
                authorizer: Some(spend_tokens_auth),
                transition: open_holdings,
            },
        )?;
        env.register_procedure(
            ProcedureKey::new(
                ReducerKind::TokenHoldings,
                OpKey::Down(ParticleKind::Tokens),
            ),
            Procedure {
                required_level: user,
                authorizer: Some(spend_tokens_auth),
                transition: holdings_down,
            },
        )?;
        env.register_procedure(
            ProcedureKey::new(ReducerKind::TokenHoldings, OpKey::Up(ParticleKind::Tokens)),
            Procedure {
                required_level: user,
                authorizer: None,
                transition: holdings_up,
            },
        )?;
        env.register_procedure(
            ProcedureKey::new(ReducerKind::TokenHoldings, OpKey::End),
            Procedure {
                required_level: user,
                authorizer: None,
                transition: holdings_end,
            },
        )?;
        env.register_procedure(
            ProcedureKey::new(ReducerKind::TokenHoldings, OpKey::Up(ParticleKind::FeePaid)),
            Procedure {
                required_level: user,
                authorizer: None,
                transition: claim_fee,
            },
        )?;
        Ok(())
    }
}
