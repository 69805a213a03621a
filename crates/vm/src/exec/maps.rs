//! Map operations. Keys are strings; `mapkeys` yields them sorted.

use svi_core::references::MapHandle;
use svi_core::{Instruction, Reference};

use super::{ensure_map, ensure_string, Outcome};
use crate::error::VmResult;
use crate::machine::VirtualMachine;

pub(super) fn execute(vm: &mut VirtualMachine, instruction: &Instruction) -> VmResult<Outcome> {
    let value = match instruction {
        Instruction::MapInit { value_type } => {
            let inner = vm.resolve_type_operand(value_type)?;
            Reference::Map(MapHandle::new(inner))
        }
        Instruction::MapSet { key, value, map } => {
            let key = ensure_string(vm, key)?;
            let value = vm.resolve(value)?;
            let handle = ensure_map(vm, &Reference::Location(map.clone()))?;
            handle.set(key, value);
            // Write back so serialized backends observe the mutation.
            vm.store_value(map, Reference::Map(handle))?;
            Reference::Void
        }
        Instruction::MapGet { key, map } => {
            let key = ensure_string(vm, key)?;
            let handle = ensure_map(vm, &Reference::Location(map.clone()))?;
            handle.get(&key)?
        }
        Instruction::MapLength { map } => {
            let handle = ensure_map(vm, &Reference::Location(map.clone()))?;
            Reference::Number(handle.length() as f64)
        }
        Instruction::MapKeys { map } => {
            let handle = ensure_map(vm, &Reference::Location(map.clone()))?;
            Reference::Enumeration(handle.keys())
        }
        other => unreachable!("not a map instruction: {other}"),
    };

    Ok(Outcome::Value(value))
}
