//! Function definition, calls, deferred calls, and queue contexts.
//!
//! Call-performing instructions all follow the machine's re-execution
//! protocol: the first execution transfers control into the function, and
//! the second (at the return jump) observes the completed call and yields
//! its value.

use svi_core::{Instruction, Reference};

use super::{ensure_boolean, ensure_number, invalid_operand, Outcome};
use crate::error::VmResult;
use crate::machine::VirtualMachine;

pub(super) fn execute(vm: &mut VirtualMachine, instruction: &Instruction) -> VmResult<Outcome> {
    match instruction {
        // A function header met in sequential flow: hop over the body.
        Instruction::BeginFn { function, .. } => {
            let skip = vm.state()?.function_skip(function.name())?;
            vm.jump(skip)?;
            Ok(Outcome::Jumped)
        }

        // Formal parameters are bound at call time; the declarations
        // themselves are inert.
        Instruction::FnParam { .. } => Ok(Outcome::Value(Reference::Void)),

        Instruction::Return0 => {
            vm.set_call_return(Reference::Void)?;
            vm.return_to_caller(true)?;
            Ok(Outcome::Jumped)
        }
        Instruction::Return1 { value } => {
            let value = vm.resolve(value)?;
            vm.set_call_return(value)?;
            vm.return_to_caller(true)?;
            Ok(Outcome::Jumped)
        }

        Instruction::Curry { function, arg } => {
            let function = vm.resolve_function_operand(function)?;
            let arg = vm.resolve(arg)?;
            Ok(Outcome::Value(Reference::Function(function.curry(arg)?)))
        }

        Instruction::Call0 { function } => call(vm, None, function, None),
        Instruction::Call1 { function, arg } => call(vm, None, function, Some(arg)),
        Instruction::CallIf0 {
            condition,
            function,
        } => call(vm, Some((condition, true)), function, None),
        Instruction::CallIf1 {
            condition,
            function,
            arg,
        } => call(vm, Some((condition, true)), function, Some(arg)),
        Instruction::CallElse0 {
            condition,
            function,
        } => call(vm, Some((condition, false)), function, None),
        Instruction::CallElse1 {
            condition,
            function,
            arg,
        } => call(vm, Some((condition, false)), function, Some(arg)),

        Instruction::PushCall0 { function } => push(vm, None, function, None),
        Instruction::PushCall1 { function, arg } => push(vm, None, function, Some(arg)),
        Instruction::PushCallIf0 {
            condition,
            function,
        } => push(vm, Some((condition, true)), function, None),
        Instruction::PushCallIf1 {
            condition,
            function,
            arg,
        } => push(vm, Some((condition, true)), function, Some(arg)),
        Instruction::PushCallElse0 {
            condition,
            function,
        } => push(vm, Some((condition, false)), function, None),
        Instruction::PushCallElse1 {
            condition,
            function,
            arg,
        } => push(vm, Some((condition, false)), function, Some(arg)),

        Instruction::Drain => {
            let returns = vm.drain()?;
            Ok(Outcome::Value(Reference::ReturnValueMap(returns)))
        }

        Instruction::RetMapHas { map, key } => {
            let returns = resolve_return_map(vm, map)?;
            let key = ensure_number(vm, key)? as u64;
            Ok(Outcome::Value(Reference::Boolean(returns.has(key))))
        }
        Instruction::RetMapGet { map, key } => {
            let returns = resolve_return_map(vm, map)?;
            let key = ensure_number(vm, key)? as u64;
            let value = returns.get(key).ok_or(svi_core::SviError::MapMissingKey {
                key: key.to_string(),
            })?;
            Ok(Outcome::Value(value))
        }

        Instruction::EnterContext => {
            let context = vm.enter_queue_context();
            Ok(Outcome::Value(Reference::ContextId(context)))
        }
        Instruction::ResumeContext { context } => {
            let context = match vm.resolve(context)? {
                Reference::ContextId(id) => id,
                Reference::StringVal(id) => id,
                other => return Err(invalid_operand("CONTEXT_ID", &other)),
            };
            vm.resume_queue_context(context);
            Ok(Outcome::Value(Reference::Void))
        }
        Instruction::PopContext => {
            vm.pop_queue_context();
            Ok(Outcome::Value(Reference::Void))
        }

        Instruction::Exit => Ok(Outcome::Exited),

        other => unreachable!("not a function instruction: {other}"),
    }
}

type Condition<'a> = Option<(&'a Reference, bool)>;

/// Perform a (possibly conditional) synchronous call.
fn call(
    vm: &mut VirtualMachine,
    condition: Condition<'_>,
    function: &Reference,
    arg: Option<&Reference>,
) -> VmResult<Outcome> {
    // Re-executed at the return site: the call completed.
    if vm.returned_call().is_some() {
        return Ok(Outcome::Value(vm.take_returned_value()));
    }

    if let Some((condition, expected)) = condition {
        if ensure_boolean(vm, condition)? != expected {
            return Ok(Outcome::Value(Reference::Void));
        }
    }

    let mut function = vm.resolve_function_operand(function)?;
    if let Some(arg) = arg {
        let arg = vm.resolve(arg)?;
        function = function.curry(arg)?;
    }
    vm.perform_call(function.to_call()?)
}

/// Defer a (possibly conditional) call onto the queue.
fn push(
    vm: &mut VirtualMachine,
    condition: Condition<'_>,
    function: &Reference,
    arg: Option<&Reference>,
) -> VmResult<Outcome> {
    if let Some((condition, expected)) = condition {
        if ensure_boolean(vm, condition)? != expected {
            return Ok(Outcome::Value(Reference::Void));
        }
    }

    let mut function = vm.resolve_function_operand(function)?;
    if let Some(arg) = arg {
        let arg = vm.resolve(arg)?;
        function = function.curry(arg)?;
    }
    let id = vm.push_call(function.to_call()?)?;
    Ok(Outcome::Value(Reference::JobId(id)))
}

fn resolve_return_map(
    vm: &mut VirtualMachine,
    operand: &Reference,
) -> VmResult<svi_core::ReturnValueMapHandle> {
    match vm.resolve(operand)? {
        Reference::ReturnValueMap(handle) => Ok(handle),
        other => Err(invalid_operand("RETURN_VALUE_MAP", &other)),
    }
}
