//! Boolean connectives.

use svi_core::{Instruction, Reference};

use super::{ensure_boolean, Outcome};
use crate::error::VmResult;
use crate::machine::VirtualMachine;

pub(super) fn execute(vm: &mut VirtualMachine, instruction: &Instruction) -> VmResult<Outcome> {
    let value = match instruction {
        Instruction::And { lhs, rhs } => ensure_boolean(vm, lhs)? && ensure_boolean(vm, rhs)?,
        Instruction::Or { lhs, rhs } => ensure_boolean(vm, lhs)? || ensure_boolean(vm, rhs)?,
        Instruction::Xor { lhs, rhs } => ensure_boolean(vm, lhs)? != ensure_boolean(vm, rhs)?,
        Instruction::Nand { lhs, rhs } => !(ensure_boolean(vm, lhs)? && ensure_boolean(vm, rhs)?),
        Instruction::Nor { lhs, rhs } => !(ensure_boolean(vm, lhs)? || ensure_boolean(vm, rhs)?),
        Instruction::Not { value } => !ensure_boolean(vm, value)?,
        other => unreachable!("not a boolean instruction: {other}"),
    };

    Ok(Outcome::Value(Reference::Boolean(value)))
}
