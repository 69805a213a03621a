//! Arithmetic and numeric comparison.

use svi_core::{Instruction, Reference};

use super::{ensure_number, Outcome};
use crate::error::{VmError, VmResult};
use crate::machine::VirtualMachine;

pub(super) fn execute(vm: &mut VirtualMachine, instruction: &Instruction) -> VmResult<Outcome> {
    let value = match instruction {
        Instruction::Plus { lhs, rhs } => {
            Reference::Number(ensure_number(vm, lhs)? + ensure_number(vm, rhs)?)
        }
        Instruction::Minus { lhs, rhs } => {
            Reference::Number(ensure_number(vm, lhs)? - ensure_number(vm, rhs)?)
        }
        Instruction::Times { lhs, rhs } => {
            Reference::Number(ensure_number(vm, lhs)? * ensure_number(vm, rhs)?)
        }
        Instruction::Divide { lhs, rhs } => {
            let dividend = ensure_number(vm, lhs)?;
            let divisor = ensure_number(vm, rhs)?;
            if divisor == 0.0 {
                return Err(VmError::DivideByZero);
            }
            Reference::Number(dividend / divisor)
        }
        Instruction::Power { lhs, rhs } => {
            Reference::Number(ensure_number(vm, lhs)?.powf(ensure_number(vm, rhs)?))
        }
        Instruction::Mod { lhs, rhs } => {
            // Floating-point remainder, sign following the dividend.
            Reference::Number(ensure_number(vm, lhs)? % ensure_number(vm, rhs)?)
        }
        Instruction::Neg { value } => Reference::Number(-ensure_number(vm, value)?),
        Instruction::Gt { lhs, rhs } => {
            Reference::Boolean(ensure_number(vm, lhs)? > ensure_number(vm, rhs)?)
        }
        Instruction::Gte { lhs, rhs } => {
            Reference::Boolean(ensure_number(vm, lhs)? >= ensure_number(vm, rhs)?)
        }
        Instruction::Lt { lhs, rhs } => {
            Reference::Boolean(ensure_number(vm, lhs)? < ensure_number(vm, rhs)?)
        }
        Instruction::Lte { lhs, rhs } => {
            Reference::Boolean(ensure_number(vm, lhs)? <= ensure_number(vm, rhs)?)
        }
        other => unreachable!("not an arithmetic instruction: {other}"),
    };

    Ok(Outcome::Value(value))
}
