//! Exception handlers, `raise`, and `resume`.

use svi_core::scope::HandlerSelector;
use svi_core::{Instruction, Reference};

use super::{ensure_number, ensure_string, invalid_operand, Outcome};
use crate::error::VmResult;
use crate::machine::VirtualMachine;

pub(super) fn execute(vm: &mut VirtualMachine, instruction: &Instruction) -> VmResult<Outcome> {
    match instruction {
        Instruction::PushExHandler1 { handler } => {
            let handler = vm.resolve_function_operand(&Reference::Location(handler.clone()))?;
            let id = vm.push_exception_handler(HandlerSelector::Universal, handler)?;
            Ok(Outcome::Value(Reference::StringVal(id)))
        }

        Instruction::PushExHandler2 {
            handler,
            discriminator,
        } => {
            let handler = vm.resolve_function_operand(&Reference::Location(handler.clone()))?;
            // A number discriminator selects by exact code; a function
            // discriminator is consulted as a predicate.
            let selector = match vm.resolve(&Reference::Location(discriminator.clone()))? {
                Reference::Number(code) => HandlerSelector::Code(code),
                Reference::Function(predicate) => HandlerSelector::Discriminator(predicate),
                other => return Err(invalid_operand("NUMBER or FUNCTION", &other)),
            };
            let id = vm.push_exception_handler(selector, handler)?;
            Ok(Outcome::Value(Reference::StringVal(id)))
        }

        Instruction::PopExHandler { handler_id } => {
            let id = ensure_string(vm, handler_id)?;
            vm.pop_exception_handler(&id)?;
            Ok(Outcome::Value(Reference::Void))
        }

        Instruction::Raise { code } => {
            // A handler that returned normally resumes here; carry on
            // with the instruction after the raise.
            if vm.returned_call().is_some() {
                vm.take_returned_value();
                return Ok(Outcome::Value(Reference::Void));
            }
            let code = ensure_number(vm, code)?;
            vm.raise(code)
        }

        Instruction::Resume { function } => {
            if vm.returned_call().is_some() {
                return Ok(Outcome::Value(vm.take_returned_value()));
            }
            let function = vm.resolve_function_operand(&Reference::Location(function.clone()))?;
            vm.perform_call(function.to_call()?)
        }

        other => unreachable!("not an exception instruction: {other}"),
    }
}
