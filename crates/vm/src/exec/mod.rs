//! The execute engine: per-opcode evaluation.
//!
//! One handler per instruction group, dispatched from a single match on
//! the tag. Handlers resolve their operands through the machine, so a
//! location operand and an inline literal behave identically.

mod arith;
mod boolean;
mod control;
mod enums;
mod except;
mod functions;
mod maps;
mod objects;
mod storage;
mod streams;
mod strings;

use svi_core::references::{EnumerationHandle, MapHandle, ObjectHandle, Reference};
use svi_core::Instruction;

use crate::error::{VmError, VmResult};
use crate::machine::VirtualMachine;

/// What executing one instruction did.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The instruction produced a value (possibly `Void`).
    Value(Reference),
    /// Control transferred; the program counter must not advance.
    Jumped,
    /// The machine should stop immediately.
    Exited,
}

/// Execute a single instruction against the machine.
pub fn execute(vm: &mut VirtualMachine, instruction: &Instruction) -> VmResult<Outcome> {
    match instruction {
        // Source annotations execute as no-ops.
        Instruction::Position(_) => Ok(Outcome::Value(Reference::Void)),

        Instruction::Plus { .. }
        | Instruction::Minus { .. }
        | Instruction::Times { .. }
        | Instruction::Divide { .. }
        | Instruction::Power { .. }
        | Instruction::Mod { .. }
        | Instruction::Neg { .. }
        | Instruction::Gt { .. }
        | Instruction::Gte { .. }
        | Instruction::Lt { .. }
        | Instruction::Lte { .. } => arith::execute(vm, instruction),

        Instruction::And { .. }
        | Instruction::Or { .. }
        | Instruction::Xor { .. }
        | Instruction::Nand { .. }
        | Instruction::Nor { .. }
        | Instruction::Not { .. } => boolean::execute(vm, instruction),

        Instruction::StrConcat { .. }
        | Instruction::StrLength { .. }
        | Instruction::StrSliceFrom { .. }
        | Instruction::StrSliceFromTo { .. } => strings::execute(vm, instruction),

        Instruction::MapInit { .. }
        | Instruction::MapSet { .. }
        | Instruction::MapGet { .. }
        | Instruction::MapLength { .. }
        | Instruction::MapKeys { .. } => maps::execute(vm, instruction),

        Instruction::EnumInit { .. }
        | Instruction::EnumAppend { .. }
        | Instruction::EnumPrepend { .. }
        | Instruction::EnumLength { .. }
        | Instruction::EnumGet { .. }
        | Instruction::EnumSet { .. }
        | Instruction::EnumConcat { .. }
        | Instruction::Enumerate { .. } => enums::execute(vm, instruction),

        Instruction::Out { .. }
        | Instruction::Err { .. }
        | Instruction::StreamInit { .. }
        | Instruction::StreamPush { .. }
        | Instruction::StreamPop { .. }
        | Instruction::StreamClose { .. }
        | Instruction::StreamEmpty { .. } => streams::execute(vm, instruction),

        Instruction::BeginFn { .. }
        | Instruction::FnParam { .. }
        | Instruction::Return0
        | Instruction::Return1 { .. }
        | Instruction::Curry { .. }
        | Instruction::Call0 { .. }
        | Instruction::Call1 { .. }
        | Instruction::CallIf0 { .. }
        | Instruction::CallIf1 { .. }
        | Instruction::CallElse0 { .. }
        | Instruction::CallElse1 { .. }
        | Instruction::PushCall0 { .. }
        | Instruction::PushCall1 { .. }
        | Instruction::PushCallIf0 { .. }
        | Instruction::PushCallIf1 { .. }
        | Instruction::PushCallElse0 { .. }
        | Instruction::PushCallElse1 { .. }
        | Instruction::Drain
        | Instruction::RetMapHas { .. }
        | Instruction::RetMapGet { .. }
        | Instruction::EnterContext
        | Instruction::ResumeContext { .. }
        | Instruction::PopContext
        | Instruction::Exit => functions::execute(vm, instruction),

        Instruction::Typify { .. }
        | Instruction::AssignValue { .. }
        | Instruction::AssignEval { .. }
        | Instruction::Lock { .. }
        | Instruction::Unlock { .. }
        | Instruction::IsEqual { .. }
        | Instruction::ScopeOf { .. }
        | Instruction::TypeOf { .. }
        | Instruction::IsCompatible { .. } => storage::execute(vm, instruction),

        Instruction::While { .. } | Instruction::With { .. } => control::execute(vm, instruction),

        Instruction::PushExHandler1 { .. }
        | Instruction::PushExHandler2 { .. }
        | Instruction::PopExHandler { .. }
        | Instruction::Raise { .. }
        | Instruction::Resume { .. } => except::execute(vm, instruction),

        Instruction::OTypeInit
        | Instruction::OTypeProp { .. }
        | Instruction::OTypeDel { .. }
        | Instruction::OTypeGet { .. }
        | Instruction::OTypeFinalize { .. }
        | Instruction::OTypeSubset { .. }
        | Instruction::ObjInit { .. }
        | Instruction::ObjSet { .. }
        | Instruction::ObjGet { .. }
        | Instruction::ObjInstance { .. }
        | Instruction::ObjCurry { .. } => objects::execute(vm, instruction),
    }
}

// --- shared operand helpers ---

pub(crate) fn ensure_number(vm: &mut VirtualMachine, operand: &Reference) -> VmResult<f64> {
    match vm.resolve(operand)? {
        Reference::Number(value) => Ok(value),
        other => Err(invalid_operand("NUMBER", &other)),
    }
}

pub(crate) fn ensure_boolean(vm: &mut VirtualMachine, operand: &Reference) -> VmResult<bool> {
    match vm.resolve(operand)? {
        Reference::Boolean(value) => Ok(value),
        other => Err(invalid_operand("BOOLEAN", &other)),
    }
}

pub(crate) fn ensure_string(vm: &mut VirtualMachine, operand: &Reference) -> VmResult<String> {
    match vm.resolve(operand)? {
        Reference::StringVal(value) => Ok(value),
        other => Err(invalid_operand("STRING", &other)),
    }
}

pub(crate) fn ensure_enumeration(
    vm: &mut VirtualMachine,
    operand: &Reference,
) -> VmResult<EnumerationHandle> {
    match vm.resolve(operand)? {
        Reference::Enumeration(handle) => Ok(handle),
        other => Err(invalid_operand("ENUMERABLE", &other)),
    }
}

pub(crate) fn ensure_map(vm: &mut VirtualMachine, operand: &Reference) -> VmResult<MapHandle> {
    match vm.resolve(operand)? {
        Reference::Map(handle) => Ok(handle),
        other => Err(invalid_operand("MAP", &other)),
    }
}

pub(crate) fn ensure_object(
    vm: &mut VirtualMachine,
    operand: &Reference,
) -> VmResult<ObjectHandle> {
    match vm.resolve(operand)? {
        Reference::Object(handle) => Ok(handle),
        other => Err(invalid_operand("OBJECT", &other)),
    }
}

pub(crate) fn invalid_operand(expected: &str, actual: &Reference) -> VmError {
    svi_core::SviError::invalid_operand(expected.to_string(), actual.to_string()).into()
}
