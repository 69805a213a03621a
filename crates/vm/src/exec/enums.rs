//! Enumeration operations, including the distributed `enumerate`.

use svi_core::references::EnumerationHandle;
use svi_core::{Instruction, Reference};

use super::{ensure_enumeration, ensure_number, Outcome};
use crate::error::VmResult;
use crate::machine::VirtualMachine;

pub(super) fn execute(vm: &mut VirtualMachine, instruction: &Instruction) -> VmResult<Outcome> {
    let value = match instruction {
        Instruction::EnumInit { value_type } => {
            let inner = vm.resolve_type_operand(value_type)?;
            Reference::Enumeration(EnumerationHandle::new(inner))
        }
        Instruction::EnumAppend { value, enumeration } => {
            let value = vm.resolve(value)?;
            let handle = ensure_enumeration(vm, &Reference::Location(enumeration.clone()))?;
            handle.append(value);
            vm.store_value(enumeration, Reference::Enumeration(handle))?;
            Reference::Void
        }
        Instruction::EnumPrepend { value, enumeration } => {
            let value = vm.resolve(value)?;
            let handle = ensure_enumeration(vm, &Reference::Location(enumeration.clone()))?;
            handle.prepend(value);
            vm.store_value(enumeration, Reference::Enumeration(handle))?;
            Reference::Void
        }
        Instruction::EnumLength { enumeration } => {
            let handle = ensure_enumeration(vm, &Reference::Location(enumeration.clone()))?;
            Reference::Number(handle.length() as f64)
        }
        Instruction::EnumGet { enumeration, index } => {
            let index = ensure_number(vm, index)?;
            let handle = ensure_enumeration(vm, &Reference::Location(enumeration.clone()))?;
            handle.get(index as usize)?
        }
        Instruction::EnumSet {
            enumeration,
            index,
            value,
        } => {
            let index = ensure_number(vm, index)?;
            let value = vm.resolve(value)?;
            let handle = ensure_enumeration(vm, &Reference::Location(enumeration.clone()))?;
            handle.set(index as usize, value)?;
            vm.store_value(enumeration, Reference::Enumeration(handle))?;
            Reference::Void
        }
        Instruction::EnumConcat { lhs, rhs } => {
            let left = ensure_enumeration(vm, &Reference::Location(lhs.clone()))?;
            let right = ensure_enumeration(vm, &Reference::Location(rhs.clone()))?;
            left.concat(&right);
            vm.store_value(lhs, Reference::Enumeration(left))?;
            Reference::Void
        }
        Instruction::Enumerate {
            value_type,
            enumeration,
            callback,
        } => {
            return enumerate(vm, value_type, enumeration, callback);
        }
        other => unreachable!("not an enumeration instruction: {other}"),
    };

    Ok(Outcome::Value(value))
}

/// Defer one call per element onto the queue in a fresh context, wait for
/// the batch, and assemble the return values in the collection's order.
/// Element bodies may run anywhere and in any order; the result order is
/// fixed by keying each job on its element's index.
fn enumerate(
    vm: &mut VirtualMachine,
    value_type: &Reference,
    enumeration: &svi_core::LocationReference,
    callback: &svi_core::LocationReference,
) -> VmResult<Outcome> {
    let result_type = vm.resolve_type_operand(value_type)?;
    let items = ensure_enumeration(vm, &Reference::Location(enumeration.clone()))?.snapshot();
    let function = vm.resolve_function_operand(&Reference::Location(callback.clone()))?;

    vm.enter_queue_context();
    let result = (|| {
        // Return values key on the element's collection index through the
        // job list: jobs[i] computes element i.
        let mut jobs = Vec::with_capacity(items.len());
        for item in items {
            let call = function.curry(item)?.to_call()?;
            jobs.push(vm.push_call(call)?);
        }

        let returns = vm.drain()?;
        let collected = EnumerationHandle::new(result_type);
        for id in jobs {
            collected.append(returns.get(id).unwrap_or(Reference::Void));
        }
        Ok(Outcome::Value(Reference::Enumeration(collected)))
    })();
    vm.pop_queue_context();
    result
}
