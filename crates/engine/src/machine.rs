//! The constraint machine: instruction-stream verification.
//!
//! Verification walks the stream once, threading a reducer state
//! through procedure dispatch and enforcing spin discipline against a
//! read view of the store plus the stream's own earlier effects. The
//! machine never writes; it returns the ordered substate operations a
//! valid stream implies, and the engine decides what to do with them.

use std::collections::{BTreeMap, HashSet};

use spindle_store::{SubstateOp, SubstateReadView};
use spindle_types::{Spin, SubstateId, TxnId};

use crate::context::{Event, ExecutionContext, PermissionLevel};
use crate::error::ConstraintError;
use crate::meter::Meter;
use crate::parser::{Instruction, SubstateRef};
use crate::particles::Particle;
use crate::reducer::ReducerState;
use crate::registry::{OpKey, ProcedureKey, ProcedureParam, ProcedureResult, Registry};

/// Structural limits on a single instruction stream.
#[derive(Debug, Clone, Copy)]
pub struct MachineLimits {
    /// Maximum number of message instructions per transaction.
    pub max_messages: u32,
    /// Maximum message length in bytes.
    pub max_message_len: usize,
}

impl Default for MachineLimits {
    fn default() -> Self {
        Self {
            max_messages: 1,
            max_message_len: 255,
        }
    }
}

/// A loaded constraint machine: registry, limits, and meter.
pub struct ConstraintMachine {
    registry: Registry,
    limits: MachineLimits,
    meter: Box<dyn Meter>,
}

struct LocalUp {
    id: SubstateId,
    tag: u8,
    particle: Particle,
    consumed: bool,
}

/// Per-stream verification state.
struct Validation<'a, V> {
    view: &'a V,
    local_ups: BTreeMap<u32, LocalUp>,
    virtual_instances: BTreeMap<SubstateId, (u8, Particle)>,
    downed: HashSet<SubstateId>,
    ops: Vec<SubstateOp>,
}

impl ConstraintMachine {
    /// Assembles a machine from its parts.
    #[must_use]
    pub fn new(registry: Registry, limits: MachineLimits, meter: Box<dyn Meter>) -> Self {
        Self {
            registry,
            limits,
            meter,
        }
    }

    /// The machine's registry.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Verifies one instruction stream against a read view.
    ///
    /// On success returns the ordered substate operations the stream
    /// implies; the view itself is never mutated.
    pub fn verify<V: SubstateReadView>(
        &self,
        view: &V,
        ctx: &mut ExecutionContext,
        txn_id: TxnId,
        instructions: &[Instruction],
    ) -> Result<Vec<SubstateOp>, ConstraintError> {
        let mut validation = Validation {
            view,
            local_ups: BTreeMap::new(),
            virtual_instances: BTreeMap::new(),
            downed: HashSet::new(),
            ops: Vec::new(),
        };
        let mut state = ReducerState::Void;
        let mut expect_end = false;
        let metered = ctx.level() != PermissionLevel::System;

        for (position, instruction) in instructions.iter().enumerate() {
            let index = position as u32;
            if metered {
                self.meter
                    .on_instruction(instruction, ctx)
                    .map_err(|source| ConstraintError::Metering { index, source })?;
            }
            if expect_end && !matches!(instruction, Instruction::End) {
                return Err(ConstraintError::MissingExpectedEnd { index });
            }

            match instruction {
                Instruction::Up { payload } => {
                    let (tag, particle) = self
                        .registry
                        .decode_payload(payload)
                        .map_err(|source| ConstraintError::Decode { index, source })?;
                    self.registry
                        .static_check(tag, &particle)
                        .map_err(|source| ConstraintError::StaticCheck { index, source })?;
                    let id = SubstateId::of_substate(txn_id, index);
                    if validation.view.substate(&id).is_some() || validation.view.is_downed(&id) {
                        return Err(ConstraintError::SpinConflict { index, id });
                    }
                    let op = OpKey::Up(particle.kind());
                    (state, expect_end) = self.dispatch(
                        state,
                        op,
                        ProcedureParam::Particle(&particle),
                        ctx,
                        index,
                        metered,
                    )?;
                    validation.ops.push(SubstateOp {
                        spin: Spin::Up,
                        id: id.clone(),
                        type_tag: tag,
                        payload: Some(payload.clone()),
                        instruction_index: index,
                    });
                    validation.local_ups.insert(
                        index,
                        LocalUp {
                            id,
                            tag,
                            particle,
                            consumed: false,
                        },
                    );
                }

                Instruction::VirtualUp { key } => {
                    let (tag, particle) = self
                        .registry
                        .key_to_particle(key)
                        .map_err(|source| ConstraintError::Decode { index, source })?;
                    if self.registry.virtual_spin(tag, &particle) != Spin::Up {
                        return Err(ConstraintError::NotVirtualizable { index });
                    }
                    let id = SubstateId::of_virtual(key.clone());
                    if validation.virtual_instances.contains_key(&id) {
                        return Err(ConstraintError::SpinConflict { index, id });
                    }
                    if validation.view.is_downed(&id) || validation.downed.contains(&id) {
                        return Err(ConstraintError::VirtualSubstateDowned { index, id });
                    }
                    let op = OpKey::Up(particle.kind());
                    (state, expect_end) = self.dispatch(
                        state,
                        op,
                        ProcedureParam::Particle(&particle),
                        ctx,
                        index,
                        metered,
                    )?;
                    validation.virtual_instances.insert(id, (tag, particle));
                }

                Instruction::Down { substate } => {
                    let (id, tag, particle) =
                        self.resolve(&mut validation, substate, index, true)?;
                    let op = OpKey::Down(particle.kind());
                    (state, expect_end) = self.dispatch(
                        state,
                        op,
                        ProcedureParam::Particle(&particle),
                        ctx,
                        index,
                        metered,
                    )?;
                    validation.ops.push(SubstateOp {
                        spin: Spin::Down,
                        id,
                        type_tag: tag,
                        payload: None,
                        instruction_index: index,
                    });
                }

                Instruction::Read { substate } => {
                    let (_, _, particle) =
                        self.resolve(&mut validation, substate, index, false)?;
                    let op = OpKey::Read(particle.kind());
                    (state, expect_end) = self.dispatch(
                        state,
                        op,
                        ProcedureParam::Particle(&particle),
                        ctx,
                        index,
                        metered,
                    )?;
                }

                Instruction::End => {
                    expect_end = false;
                    if !state.is_void() {
                        let (next, _) = self.dispatch(
                            state,
                            OpKey::End,
                            ProcedureParam::End,
                            ctx,
                            index,
                            metered,
                        )?;
                        if !next.is_void() {
                            return Err(ConstraintError::EndNotTerminal { index });
                        }
                        state = ReducerState::Void;
                    }
                }

                Instruction::Msg { bytes } => {
                    if ctx.count_message() > self.limits.max_messages {
                        return Err(ConstraintError::TooManyMessages {
                            index,
                            limit: self.limits.max_messages,
                        });
                    }
                    if bytes.len() > self.limits.max_message_len {
                        return Err(ConstraintError::MessageTooLong {
                            index,
                            len: bytes.len(),
                            limit: self.limits.max_message_len,
                        });
                    }
                    ctx.emit(Event::Message {
                        bytes: bytes.clone(),
                    });
                }
            }
        }

        if expect_end {
            return Err(ConstraintError::MissingExpectedEnd {
                index: instructions.len() as u32,
            });
        }
        if !state.is_void() {
            return Err(ConstraintError::DanglingChain { kind: state.kind() });
        }
        Ok(validation.ops)
    }

    /// Resolves a substate reference to its id, tag, and particle.
    /// When `consume` is set the substate is marked consumed as well.
    fn resolve<V: SubstateReadView>(
        &self,
        validation: &mut Validation<'_, V>,
        substate: &SubstateRef,
        index: u32,
        consume: bool,
    ) -> Result<(SubstateId, u8, Particle), ConstraintError> {
        match substate {
            SubstateRef::Local { index: target } => {
                let entry = validation.local_ups.get_mut(target).ok_or(
                    ConstraintError::LocalRefNotFound {
                        index,
                        target: *target,
                    },
                )?;
                if entry.consumed {
                    return Err(ConstraintError::SubstateNotFound {
                        index,
                        id: entry.id.clone(),
                    });
                }
                if consume {
                    entry.consumed = true;
                }
                Ok((entry.id.clone(), entry.tag, entry.particle.clone()))
            }

            SubstateRef::Id(SubstateId::Virtual { key }) => {
                let id = SubstateId::of_virtual(key.clone());
                if let Some((tag, particle)) = validation.virtual_instances.get(&id).cloned() {
                    if consume {
                        validation.virtual_instances.remove(&id);
                        validation.downed.insert(id.clone());
                    }
                    return Ok((id, tag, particle));
                }
                let (tag, particle) = self
                    .registry
                    .key_to_particle(key)
                    .map_err(|source| ConstraintError::Decode { index, source })?;
                if self.registry.virtual_spin(tag, &particle) != Spin::Up {
                    return Err(ConstraintError::NotVirtualizable { index });
                }
                if validation.view.is_downed(&id) || validation.downed.contains(&id) {
                    return Err(ConstraintError::VirtualSubstateDowned { index, id });
                }
                if consume {
                    validation.downed.insert(id.clone());
                }
                Ok((id, tag, particle))
            }

            SubstateRef::Id(id) => {
                if validation.downed.contains(id) {
                    return Err(ConstraintError::SubstateNotFound {
                        index,
                        id: id.clone(),
                    });
                }
                let payload = validation.view.substate(id).ok_or_else(|| {
                    ConstraintError::SubstateNotFound {
                        index,
                        id: id.clone(),
                    }
                })?;
                let (tag, particle) = self
                    .registry
                    .decode_payload(&payload)
                    .map_err(|source| ConstraintError::Decode { index, source })?;
                if consume {
                    validation.downed.insert(id.clone());
                }
                Ok((id.clone(), tag, particle))
            }
        }
    }

    /// Looks up and fires the procedure for one operation.
    fn dispatch(
        &self,
        state: ReducerState,
        op: OpKey,
        param: ProcedureParam<'_>,
        ctx: &mut ExecutionContext,
        index: u32,
        metered: bool,
    ) -> Result<(ReducerState, bool), ConstraintError> {
        let key = ProcedureKey::new(state.kind(), op);
        let procedure = self
            .registry
            .procedure(&key)
            .ok_or(ConstraintError::MissingProcedure { index, key })?;
        if metered {
            self.meter
                .on_procedure(&key, ctx)
                .map_err(|source| ConstraintError::Metering { index, source })?;
        }
        if ctx.level() < procedure.required_level {
            return Err(ConstraintError::PermissionDenied {
                index,
                required: procedure.required_level,
                actual: ctx.level(),
            });
        }
        let skip_auth = ctx.skips_authorization() || ctx.level() == PermissionLevel::System;
        if !skip_auth {
            if let Some(authorizer) = procedure.authorizer {
                authorizer(&state, param, ctx)
                    .map_err(|source| ConstraintError::Unauthorized { index, source })?;
            }
        }
        match (procedure.transition)(state, param, ctx)
            .map_err(|source| ConstraintError::Procedure { index, source })?
        {
            ProcedureResult::Next(next) => Ok((next, false)),
            ProcedureResult::Complete => Ok((ReducerState::Void, true)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meter::NoMeter;
    use spindle_store::{EngineStore, MemStore};

    fn machine() -> ConstraintMachine {
        ConstraintMachine::new(
            Registry::with_base().expect("registry"),
            MachineLimits::default(),
            Box::new(NoMeter),
        )
    }

    fn verify(
        instructions: Vec<Instruction>,
        ctx: &mut ExecutionContext,
    ) -> Result<Vec<SubstateOp>, ConstraintError> {
        let store: MemStore<u64> = MemStore::new();
        let view = store.create_transaction();
        machine().verify(&view, ctx, TxnId::from_payload(b"test"), &instructions)
    }

    #[test]
    fn test_empty_stream_is_valid() {
        let mut ctx = ExecutionContext::new(PermissionLevel::User, 0);
        let ops = verify(vec![], &mut ctx).expect("verify");
        assert!(ops.is_empty());
    }

    #[test]
    fn test_single_message_within_limits() {
        let mut ctx = ExecutionContext::new(PermissionLevel::User, 0);
        verify(
            vec![Instruction::Msg {
                bytes: vec![1, 2, 3],
            }],
            &mut ctx,
        )
        .expect("verify");
        assert_eq!(
            ctx.take_events(),
            vec![Event::Message {
                bytes: vec![1, 2, 3]
            }]
        );
    }

    #[test]
    fn test_second_message_rejected() {
        let mut ctx = ExecutionContext::new(PermissionLevel::User, 0);
        let result = verify(
            vec![
                Instruction::Msg { bytes: vec![1] },
                Instruction::Msg { bytes: vec![2] },
            ],
            &mut ctx,
        );
        assert!(matches!(
            result,
            Err(ConstraintError::TooManyMessages { index: 1, limit: 1 })
        ));
    }

    #[test]
    fn test_oversized_message_rejected() {
        let mut ctx = ExecutionContext::new(PermissionLevel::User, 0);
        let result = verify(
            vec![Instruction::Msg {
                bytes: vec![0; 256],
            }],
            &mut ctx,
        );
        assert!(matches!(
            result,
            Err(ConstraintError::MessageTooLong { len: 256, .. })
        ));
    }

    #[test]
    fn test_unknown_payload_tag_rejected() {
        let mut ctx = ExecutionContext::new(PermissionLevel::User, 0);
        let result = verify(
            vec![Instruction::Up {
                payload: vec![250, 1, 2, 3],
            }],
            &mut ctx,
        );
        assert!(matches!(result, Err(ConstraintError::Decode { index: 0, .. })));
    }

    #[test]
    fn test_local_ref_to_missing_instruction_rejected() {
        let mut ctx = ExecutionContext::new(PermissionLevel::User, 0);
        let result = verify(
            vec![Instruction::Down {
                substate: SubstateRef::Local { index: 5 },
            }],
            &mut ctx,
        );
        assert!(matches!(
            result,
            Err(ConstraintError::LocalRefNotFound { target: 5, .. })
        ));
    }
}
