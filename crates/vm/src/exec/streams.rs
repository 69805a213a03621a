//! Stream operations and the `out`/`err` shorthands.

use svi_core::references::StreamHandle;
use svi_core::{Instruction, Reference};

use super::{invalid_operand, Outcome};
use crate::error::VmResult;
use crate::machine::VirtualMachine;

fn resolve_stream(vm: &mut VirtualMachine, operand: &Reference) -> VmResult<StreamHandle> {
    match vm.resolve(operand)? {
        Reference::Stream(handle) => Ok(handle),
        other => Err(invalid_operand("STREAM", &other)),
    }
}

pub(super) fn execute(vm: &mut VirtualMachine, instruction: &Instruction) -> VmResult<Outcome> {
    let value = match instruction {
        Instruction::Out { value } => {
            let value = vm.resolve(value)?;
            vm.local_output().push(value)?;
            Reference::Void
        }
        Instruction::Err { value } => {
            let value = vm.resolve(value)?;
            vm.local_error().push(value)?;
            Reference::Void
        }
        Instruction::StreamInit { stream_type } => {
            let inner = vm.resolve_type_operand(stream_type)?;
            let id = format!("s:{}", vm.global().uuid());
            let stream = vm.open_stream(&id, &inner);
            stream.open();
            Reference::Stream(StreamHandle::new(stream.id(), inner))
        }
        Instruction::StreamPush { stream, value } => {
            let value = vm.resolve(value)?;
            let handle = resolve_stream(vm, &Reference::Location(stream.clone()))?;
            let stream = vm.open_stream(handle.id(), handle.inner_type());
            stream.push(value)?;
            Reference::Void
        }
        Instruction::StreamPop { stream } => {
            let handle = resolve_stream(vm, &Reference::Location(stream.clone()))?;
            let stream = vm.open_stream(handle.id(), handle.inner_type());
            stream.pop()?
        }
        Instruction::StreamClose { stream } => {
            let handle = resolve_stream(vm, &Reference::Location(stream.clone()))?;
            let stream = vm.open_stream(handle.id(), handle.inner_type());
            stream.close();
            Reference::Void
        }
        Instruction::StreamEmpty { stream } => {
            let handle = resolve_stream(vm, &Reference::Location(stream.clone()))?;
            let stream = vm.open_stream(handle.id(), handle.inner_type());
            Reference::Boolean(stream.is_empty())
        }
        other => unreachable!("not a stream instruction: {other}"),
    };

    Ok(Outcome::Value(value))
}
