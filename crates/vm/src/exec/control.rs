//! `while` and `with`.
//!
//! Both are built on the call protocol: the body is a callback function,
//! and control returns to the instruction itself after each call, which
//! is what makes `while` loop and lets `with` release on the way out.

use svi_core::references::ResourceHandle;
use svi_core::{Instruction, Reference};

use super::{ensure_boolean, invalid_operand, Outcome};
use crate::error::VmResult;
use crate::machine::VirtualMachine;

pub(super) fn execute(vm: &mut VirtualMachine, instruction: &Instruction) -> VmResult<Outcome> {
    match instruction {
        Instruction::While {
            condition,
            callback,
        } => {
            // Each body return lands back here; the condition decides
            // whether to go around again.
            if !ensure_boolean(vm, condition)? {
                vm.take_returned_value();
                return Ok(Outcome::Value(Reference::Void));
            }
            if vm.returned_call().is_some() {
                vm.take_returned_value();
            }
            let function = vm.resolve_function_operand(&Reference::Location(callback.clone()))?;
            vm.perform_call(function.to_call()?)
        }

        Instruction::With { resource, callback } => {
            let handle = resolve_resource(vm, resource)?;

            // Re-executed when the body returns: release on the way out.
            if vm.returned_call().is_some() {
                vm.take_returned_value();
                release(vm, &handle)?;
                vm.unhold_resource(handle.id());
                return Ok(Outcome::Value(Reference::Void));
            }

            acquire(vm, &handle)?;
            vm.hold_resource(handle.id().to_string())?;

            let mut function =
                vm.resolve_function_operand(&Reference::Location(callback.clone()))?;
            if !function.remaining().is_empty() {
                function = function.curry(Reference::Resource(handle))?;
            }
            vm.perform_call(function.to_call()?)
        }

        other => unreachable!("not a control instruction: {other}"),
    }
}

fn resolve_resource(vm: &mut VirtualMachine, operand: &Reference) -> VmResult<ResourceHandle> {
    match vm.resolve(operand)? {
        Reference::Resource(handle) => Ok(handle),
        other => Err(invalid_operand("RESOURCE", &other)),
    }
}

fn acquire(vm: &mut VirtualMachine, handle: &ResourceHandle) -> VmResult<()> {
    let local = vm.fabric().local(handle.id());
    match local {
        Some(resource) => resource.acquire(vm),
        None => {
            vm.tunnel_operation(handle, "acquire", Vec::new())?;
            Ok(())
        }
    }
}

fn release(vm: &mut VirtualMachine, handle: &ResourceHandle) -> VmResult<()> {
    let local = vm.fabric().local(handle.id());
    match local {
        Some(resource) => resource.release(vm),
        None => {
            vm.tunnel_operation(handle, "release", Vec::new())?;
            Ok(())
        }
    }
}
