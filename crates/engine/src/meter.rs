//! Metering hook for bounding verification work.
//!
//! The machine consults the meter once per instruction and once per
//! procedure dispatch. System-level execution bypasses metering
//! entirely; that decision is the machine's, not the meter's.

use crate::context::ExecutionContext;
use crate::error::MeterError;
use crate::parser::Instruction;
use crate::registry::ProcedureKey;

/// Work accounting consulted during verification.
pub trait Meter: Send + Sync {
    /// Charges for one instruction before it executes.
    fn on_instruction(
        &self,
        instruction: &Instruction,
        ctx: &mut ExecutionContext,
    ) -> Result<(), MeterError>;

    /// Charges for one procedure dispatch.
    fn on_procedure(
        &self,
        key: &ProcedureKey,
        ctx: &mut ExecutionContext,
    ) -> Result<(), MeterError>;
}

/// A meter that admits everything.
pub struct NoMeter;

impl Meter for NoMeter {
    fn on_instruction(
        &self,
        _instruction: &Instruction,
        _ctx: &mut ExecutionContext,
    ) -> Result<(), MeterError> {
        Ok(())
    }

    fn on_procedure(
        &self,
        _key: &ProcedureKey,
        _ctx: &mut ExecutionContext,
    ) -> Result<(), MeterError> {
        Ok(())
    }
}

/// Flat-rate meter: every instruction and procedure dispatch costs a
/// fixed number of units against a per-transaction limit.
pub struct CostMeter {
    instruction_cost: u64,
    procedure_cost: u64,
    limit: u64,
}

impl CostMeter {
    /// Creates a meter with the given unit costs and limit.
    #[must_use]
    pub fn new(instruction_cost: u64, procedure_cost: u64, limit: u64) -> Self {
        Self {
            instruction_cost,
            procedure_cost,
            limit,
        }
    }

    fn charge(&self, units: u64, ctx: &mut ExecutionContext) -> Result<(), MeterError> {
        let used = ctx.add_cost(units);
        if used > self.limit {
            return Err(MeterError::CostExceeded {
                used,
                limit: self.limit,
            });
        }
        Ok(())
    }
}

impl Meter for CostMeter {
    fn on_instruction(
        &self,
        _instruction: &Instruction,
        ctx: &mut ExecutionContext,
    ) -> Result<(), MeterError> {
        self.charge(self.instruction_cost, ctx)
    }

    fn on_procedure(
        &self,
        _key: &ProcedureKey,
        ctx: &mut ExecutionContext,
    ) -> Result<(), MeterError> {
        self.charge(self.procedure_cost, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::PermissionLevel;

    #[test]
    fn test_cost_meter_rejects_past_limit() {
        let meter = CostMeter::new(10, 0, 25);
        let mut ctx = ExecutionContext::new(PermissionLevel::User, 0);
        let instruction = Instruction::End;
        assert!(meter.on_instruction(&instruction, &mut ctx).is_ok());
        assert!(meter.on_instruction(&instruction, &mut ctx).is_ok());
        assert_eq!(
            meter.on_instruction(&instruction, &mut ctx),
            Err(MeterError::CostExceeded { used: 30, limit: 25 })
        );
    }
}
