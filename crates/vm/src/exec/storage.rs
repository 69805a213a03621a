//! Storage, assignment, locking, and type introspection.

use svi_core::{Instruction, Reference};

use super::Outcome;
use crate::error::VmResult;
use crate::machine::VirtualMachine;

pub(super) fn execute(vm: &mut VirtualMachine, instruction: &Instruction) -> VmResult<Outcome> {
    match instruction {
        Instruction::Typify {
            location,
            type_value,
        } => {
            let ty = vm.resolve_type_operand(type_value)?;
            vm.typify(location, ty)?;
            Ok(Outcome::Value(Reference::Void))
        }

        Instruction::AssignValue { dest, value } => {
            let value = vm.resolve(value)?;
            vm.store_value(dest, value)?;
            Ok(Outcome::Value(Reference::Void))
        }

        Instruction::AssignEval { dest, eval } => assign_eval(vm, dest, eval),

        Instruction::Lock { location } => {
            vm.lock(location)?;
            Ok(Outcome::Value(Reference::Void))
        }
        Instruction::Unlock { location } => {
            vm.unlock(location);
            Ok(Outcome::Value(Reference::Void))
        }

        Instruction::IsEqual { lhs, rhs } => {
            let lhs = vm.resolve(lhs)?;
            let rhs = vm.resolve(rhs)?;
            Ok(Outcome::Value(Reference::Boolean(lhs == rhs)))
        }

        Instruction::ScopeOf { location } => {
            vm.shadow(location)?;
            Ok(Outcome::Value(Reference::Void))
        }

        Instruction::TypeOf { value } => {
            let value = vm.resolve(value)?;
            Ok(Outcome::Value(Reference::TypeRef(value.type_of())))
        }

        Instruction::IsCompatible { lhs, rhs } => {
            let lhs = vm.resolve(lhs)?;
            let rhs = vm.resolve(rhs)?;
            // Type literals compare by the type they hold; values compare
            // by the type they have.
            let compatible = match (&lhs, &rhs) {
                (Reference::TypeRef(a), Reference::TypeRef(b)) => a.is_assignable_to(b),
                (Reference::OType(a), Reference::OType(b)) => a.is_assignable_to(b),
                (Reference::OType(a), Reference::TypeRef(b)) => {
                    svi_core::Type::Object(a.clone()).is_assignable_to(b)
                }
                (Reference::TypeRef(a), Reference::OType(b)) => {
                    a.is_assignable_to(&svi_core::Type::Object(b.clone()))
                }
                _ => lhs.type_of().is_assignable_to(&rhs.type_of()),
            };
            Ok(Outcome::Value(Reference::Boolean(compatible)))
        }

        other => unreachable!("not a storage instruction: {other}"),
    }
}

/// `assigneval` marks capture-return, executes its instruction, and
/// stores whatever value it produces. A synchronous call stores when the
/// call returns to this site; a deferred call stores when the context
/// drains.
fn assign_eval(
    vm: &mut VirtualMachine,
    dest: &svi_core::LocationReference,
    eval: &Instruction,
) -> VmResult<Outcome> {
    // Re-executed at the return site of a synchronous call on the RHS.
    if vm.returned_call().is_some() {
        let value = vm.take_returned_value();
        store_unless_void(vm, dest, value)?;
        return Ok(Outcome::Value(Reference::Void));
    }

    vm.set_capture_return();
    let outcome = super::execute(vm, eval)?;

    match outcome {
        Outcome::Value(Reference::JobId(id)) if eval.is_deferred_call() => {
            // The assignment settles when the queue delivers the return
            // value into this context's return map.
            vm.defer_assignment(id, dest.clone());
            Ok(Outcome::Value(Reference::JobId(id)))
        }
        Outcome::Value(value) => {
            store_unless_void(vm, dest, value)?;
            Ok(Outcome::Value(Reference::Void))
        }
        // An inline call on the RHS: control transferred, and this
        // instruction re-executes when it returns.
        Outcome::Jumped => Ok(Outcome::Jumped),
        Outcome::Exited => Ok(Outcome::Exited),
    }
}

fn store_unless_void(
    vm: &mut VirtualMachine,
    dest: &svi_core::LocationReference,
    value: Reference,
) -> VmResult<()> {
    // A void result (a conditional call that did not fire) leaves the
    // destination untouched unless the slot expects void.
    if value == Reference::Void {
        let declared = vm.type_of_location(dest)?;
        let accepts_void = declared
            .map(|ty| svi_core::Type::Void.is_assignable_to(&ty))
            .unwrap_or(false);
        if !accepts_void {
            return Ok(());
        }
    }
    vm.store_value(dest, value)
}
