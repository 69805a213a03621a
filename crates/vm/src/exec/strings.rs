//! String operations.
//!
//! Slices index by character, not byte, and clamp to the string's length.

use svi_core::{Instruction, Reference};

use super::{ensure_number, ensure_string, Outcome};
use crate::error::VmResult;
use crate::machine::VirtualMachine;

pub(super) fn execute(vm: &mut VirtualMachine, instruction: &Instruction) -> VmResult<Outcome> {
    let value = match instruction {
        Instruction::StrConcat { lhs, rhs } => {
            let mut lhs = ensure_string(vm, lhs)?;
            lhs.push_str(&ensure_string(vm, rhs)?);
            Reference::StringVal(lhs)
        }
        Instruction::StrLength { value } => {
            Reference::Number(ensure_string(vm, value)?.chars().count() as f64)
        }
        Instruction::StrSliceFrom { value, from } => {
            let value = ensure_string(vm, value)?;
            let from = ensure_number(vm, from)?.max(0.0) as usize;
            Reference::StringVal(value.chars().skip(from).collect())
        }
        Instruction::StrSliceFromTo { value, from, to } => {
            let value = ensure_string(vm, value)?;
            let from = ensure_number(vm, from)?.max(0.0) as usize;
            let to = ensure_number(vm, to)?.max(0.0) as usize;
            let taken = to.saturating_sub(from);
            Reference::StringVal(value.chars().skip(from).take(taken).collect())
        }
        other => unreachable!("not a string instruction: {other}"),
    };

    Ok(Outcome::Value(value))
}
