//! Reduction and production of instructions, and the SBI program format.
//!
//! An SBI file is the four-byte marker `\x7fSVI` followed by a single map
//! whose `BODY` field holds the reduced instruction list. Loaders peek at
//! the first four bytes to discriminate binary from textual input.

use svi_core::instructions::{Instruction, Instructions, Position, Tag};
use svi_core::references::{LocationReference, Reference};
use svi_io::{WireMap, WireValue};

use crate::context::WireContext;
use crate::error::{WireError, WireResult};
use crate::keys;
use crate::references::{produce_reference, reduce_reference};
use crate::types::expect_map;

/// The four-byte marker that opens every SBI payload.
pub const SBI_MARKER: &[u8; 4] = b"\x7fSVI";

/// True if the input begins with the SBI marker.
pub fn is_binary_input(input: &[u8]) -> bool {
    input.len() >= SBI_MARKER.len() && &input[..SBI_MARKER.len()] == SBI_MARKER
}

/// Reduce a single instruction to its wire map.
pub fn reduce_instruction(
    instruction: &Instruction,
    ctx: &mut dyn WireContext,
) -> WireResult<WireMap> {
    let mut map = WireMap::new();
    map.set_u64(keys::TAG, instruction.tag().index());

    // Operand shapes are fixed per tag; operands are stored positionally.
    macro_rules! put {
        ($field:expr, $reference:expr) => {
            map.set_map($field, reduce_reference($reference, ctx)?)
        };
    }
    let loc = Reference::Location;

    match instruction {
        Instruction::Position(position) => {
            map.set_str(keys::FILE, position.file.clone());
            map.set_u64(keys::LINE, position.line);
            map.set_u64(keys::COL, position.col);
        }
        Instruction::BeginFn {
            function,
            returns,
            pure,
        } => {
            put!(keys::FIRST, &loc(function.clone()));
            put!(keys::SECOND, returns);
            map.set_bool(keys::IS_PURE, *pure);
        }
        Instruction::FnParam {
            param_type,
            location,
        } => {
            put!(keys::FIRST, param_type);
            put!(keys::SECOND, &loc(location.clone()));
        }
        Instruction::Return0
        | Instruction::Drain
        | Instruction::EnterContext
        | Instruction::PopContext
        | Instruction::Exit
        | Instruction::OTypeInit => {}
        Instruction::Return1 { value }
        | Instruction::Out { value }
        | Instruction::Err { value }
        | Instruction::Not { value }
        | Instruction::Neg { value }
        | Instruction::StrLength { value }
        | Instruction::TypeOf { value } => {
            put!(keys::FIRST, value);
        }
        Instruction::Call0 { function } | Instruction::PushCall0 { function } => {
            put!(keys::FIRST, function);
        }
        Instruction::Curry { function, arg }
        | Instruction::Call1 { function, arg }
        | Instruction::PushCall1 { function, arg } => {
            put!(keys::FIRST, function);
            put!(keys::SECOND, arg);
        }
        Instruction::CallIf0 {
            condition,
            function,
        }
        | Instruction::CallElse0 {
            condition,
            function,
        }
        | Instruction::PushCallIf0 {
            condition,
            function,
        }
        | Instruction::PushCallElse0 {
            condition,
            function,
        } => {
            put!(keys::FIRST, condition);
            put!(keys::SECOND, function);
        }
        Instruction::CallIf1 {
            condition,
            function,
            arg,
        }
        | Instruction::CallElse1 {
            condition,
            function,
            arg,
        }
        | Instruction::PushCallIf1 {
            condition,
            function,
            arg,
        }
        | Instruction::PushCallElse1 {
            condition,
            function,
            arg,
        } => {
            put!(keys::FIRST, condition);
            put!(keys::SECOND, function);
            put!(keys::THIRD, arg);
        }
        Instruction::RetMapHas { map: rmap, key } | Instruction::RetMapGet { map: rmap, key } => {
            put!(keys::FIRST, rmap);
            put!(keys::SECOND, key);
        }
        Instruction::ResumeContext { context } => {
            put!(keys::FIRST, context);
        }
        Instruction::StreamInit { stream_type } => {
            put!(keys::FIRST, stream_type);
        }
        Instruction::StreamPush { stream, value } => {
            put!(keys::FIRST, &loc(stream.clone()));
            put!(keys::SECOND, value);
        }
        Instruction::StreamPop { stream }
        | Instruction::StreamClose { stream }
        | Instruction::StreamEmpty { stream } => {
            put!(keys::FIRST, &loc(stream.clone()));
        }
        Instruction::Typify {
            location,
            type_value,
        } => {
            put!(keys::FIRST, &loc(location.clone()));
            put!(keys::SECOND, type_value);
        }
        Instruction::AssignValue { dest, value } => {
            put!(keys::FIRST, &loc(dest.clone()));
            put!(keys::SECOND, value);
        }
        Instruction::AssignEval { dest, eval } => {
            put!(keys::FIRST, &loc(dest.clone()));
            map.set_map(keys::SECOND, reduce_instruction(eval, ctx)?);
        }
        Instruction::Lock { location }
        | Instruction::Unlock { location }
        | Instruction::ScopeOf { location } => {
            put!(keys::FIRST, &loc(location.clone()));
        }
        Instruction::IsEqual { lhs, rhs }
        | Instruction::IsCompatible { lhs, rhs }
        | Instruction::And { lhs, rhs }
        | Instruction::Or { lhs, rhs }
        | Instruction::Xor { lhs, rhs }
        | Instruction::Nand { lhs, rhs }
        | Instruction::Nor { lhs, rhs }
        | Instruction::StrConcat { lhs, rhs }
        | Instruction::Plus { lhs, rhs }
        | Instruction::Minus { lhs, rhs }
        | Instruction::Times { lhs, rhs }
        | Instruction::Divide { lhs, rhs }
        | Instruction::Power { lhs, rhs }
        | Instruction::Mod { lhs, rhs }
        | Instruction::Gt { lhs, rhs }
        | Instruction::Gte { lhs, rhs }
        | Instruction::Lt { lhs, rhs }
        | Instruction::Lte { lhs, rhs } => {
            put!(keys::FIRST, lhs);
            put!(keys::SECOND, rhs);
        }
        Instruction::MapInit { value_type } | Instruction::EnumInit { value_type } => {
            put!(keys::FIRST, value_type);
        }
        Instruction::MapSet {
            key,
            value,
            map: target,
        } => {
            put!(keys::FIRST, key);
            put!(keys::SECOND, value);
            put!(keys::THIRD, &loc(target.clone()));
        }
        Instruction::MapGet { key, map: target } => {
            put!(keys::FIRST, key);
            put!(keys::SECOND, &loc(target.clone()));
        }
        Instruction::MapLength { map: target } | Instruction::MapKeys { map: target } => {
            put!(keys::FIRST, &loc(target.clone()));
        }
        Instruction::EnumAppend { value, enumeration }
        | Instruction::EnumPrepend { value, enumeration } => {
            put!(keys::FIRST, value);
            put!(keys::SECOND, &loc(enumeration.clone()));
        }
        Instruction::EnumLength { enumeration } => {
            put!(keys::FIRST, &loc(enumeration.clone()));
        }
        Instruction::EnumGet { enumeration, index } => {
            put!(keys::FIRST, &loc(enumeration.clone()));
            put!(keys::SECOND, index);
        }
        Instruction::EnumSet {
            enumeration,
            index,
            value,
        } => {
            put!(keys::FIRST, &loc(enumeration.clone()));
            put!(keys::SECOND, index);
            put!(keys::THIRD, value);
        }
        Instruction::EnumConcat { lhs, rhs } => {
            put!(keys::FIRST, &loc(lhs.clone()));
            put!(keys::SECOND, &loc(rhs.clone()));
        }
        Instruction::Enumerate {
            value_type,
            enumeration,
            callback,
        } => {
            put!(keys::FIRST, value_type);
            put!(keys::SECOND, &loc(enumeration.clone()));
            put!(keys::THIRD, &loc(callback.clone()));
        }
        Instruction::StrSliceFrom { value, from } => {
            put!(keys::FIRST, value);
            put!(keys::SECOND, from);
        }
        Instruction::StrSliceFromTo { value, from, to } => {
            put!(keys::FIRST, value);
            put!(keys::SECOND, from);
            put!(keys::THIRD, to);
        }
        Instruction::While {
            condition,
            callback,
        } => {
            put!(keys::FIRST, condition);
            put!(keys::SECOND, &loc(callback.clone()));
        }
        Instruction::With { resource, callback } => {
            put!(keys::FIRST, resource);
            put!(keys::SECOND, &loc(callback.clone()));
        }
        Instruction::PushExHandler1 { handler } => {
            put!(keys::FIRST, &loc(handler.clone()));
        }
        Instruction::PushExHandler2 {
            handler,
            discriminator,
        } => {
            put!(keys::FIRST, &loc(handler.clone()));
            put!(keys::SECOND, &loc(discriminator.clone()));
        }
        Instruction::PopExHandler { handler_id } => {
            put!(keys::FIRST, handler_id);
        }
        Instruction::Raise { code } => {
            put!(keys::FIRST, code);
        }
        Instruction::Resume { function } => {
            put!(keys::FIRST, &loc(function.clone()));
        }
        Instruction::OTypeProp {
            otype,
            property,
            prop_type,
        } => {
            put!(keys::FIRST, otype);
            put!(keys::SECOND, &loc(property.clone()));
            put!(keys::THIRD, prop_type);
        }
        Instruction::OTypeDel { otype, property } | Instruction::OTypeGet { otype, property } => {
            put!(keys::FIRST, otype);
            put!(keys::SECOND, &loc(property.clone()));
        }
        Instruction::OTypeFinalize { otype } | Instruction::OTypeSubset { otype } => {
            put!(keys::FIRST, otype);
        }
        Instruction::ObjInit { otype } => {
            put!(keys::FIRST, otype);
        }
        Instruction::ObjSet {
            object,
            property,
            value,
        } => {
            put!(keys::FIRST, object);
            put!(keys::SECOND, &loc(property.clone()));
            put!(keys::THIRD, value);
        }
        Instruction::ObjGet { object, property } | Instruction::ObjCurry { object, property } => {
            put!(keys::FIRST, object);
            put!(keys::SECOND, &loc(property.clone()));
        }
        Instruction::ObjInstance { object } => {
            put!(keys::FIRST, object);
        }
    }

    Ok(map)
}

/// Produce a single instruction from its wire map.
pub fn produce_instruction(
    map: &WireMap,
    ctx: &mut dyn WireContext,
) -> WireResult<Instruction> {
    let index = map.get_u64(keys::TAG)?;
    let tag = Tag::from_index(index).ok_or(WireError::unknown_index("instruction tag", index))?;

    let get = |field: u8, ctx: &mut dyn WireContext| -> WireResult<Reference> {
        produce_reference(map.get_map(field)?, ctx)
    };
    let get_loc = |field: u8, ctx: &mut dyn WireContext| -> WireResult<LocationReference> {
        match produce_reference(map.get_map(field)?, ctx)? {
            Reference::Location(location) => Ok(location),
            other => Err(WireError::malformed(format!(
                "operand {field} of `{tag}` resolved to non-location {other}"
            ))),
        }
    };

    let instruction = match tag {
        Tag::Position => Instruction::Position(Position {
            file: map.get_str(keys::FILE)?.to_string(),
            line: map.get_u64(keys::LINE)?,
            col: map.get_u64(keys::COL)?,
        }),
        Tag::BeginFn => Instruction::BeginFn {
            function: get_loc(keys::FIRST, ctx)?,
            returns: get(keys::SECOND, ctx)?,
            pure: map.get_bool(keys::IS_PURE)?,
        },
        Tag::FnParam => Instruction::FnParam {
            param_type: get(keys::FIRST, ctx)?,
            location: get_loc(keys::SECOND, ctx)?,
        },
        Tag::Return0 => Instruction::Return0,
        Tag::Return1 => Instruction::Return1 {
            value: get(keys::FIRST, ctx)?,
        },
        Tag::Curry => Instruction::Curry {
            function: get(keys::FIRST, ctx)?,
            arg: get(keys::SECOND, ctx)?,
        },
        Tag::Call0 => Instruction::Call0 {
            function: get(keys::FIRST, ctx)?,
        },
        Tag::Call1 => Instruction::Call1 {
            function: get(keys::FIRST, ctx)?,
            arg: get(keys::SECOND, ctx)?,
        },
        Tag::CallIf0 => Instruction::CallIf0 {
            condition: get(keys::FIRST, ctx)?,
            function: get(keys::SECOND, ctx)?,
        },
        Tag::CallIf1 => Instruction::CallIf1 {
            condition: get(keys::FIRST, ctx)?,
            function: get(keys::SECOND, ctx)?,
            arg: get(keys::THIRD, ctx)?,
        },
        Tag::CallElse0 => Instruction::CallElse0 {
            condition: get(keys::FIRST, ctx)?,
            function: get(keys::SECOND, ctx)?,
        },
        Tag::CallElse1 => Instruction::CallElse1 {
            condition: get(keys::FIRST, ctx)?,
            function: get(keys::SECOND, ctx)?,
            arg: get(keys::THIRD, ctx)?,
        },
        Tag::PushCall0 => Instruction::PushCall0 {
            function: get(keys::FIRST, ctx)?,
        },
        Tag::PushCall1 => Instruction::PushCall1 {
            function: get(keys::FIRST, ctx)?,
            arg: get(keys::SECOND, ctx)?,
        },
        Tag::PushCallIf0 => Instruction::PushCallIf0 {
            condition: get(keys::FIRST, ctx)?,
            function: get(keys::SECOND, ctx)?,
        },
        Tag::PushCallIf1 => Instruction::PushCallIf1 {
            condition: get(keys::FIRST, ctx)?,
            function: get(keys::SECOND, ctx)?,
            arg: get(keys::THIRD, ctx)?,
        },
        Tag::PushCallElse0 => Instruction::PushCallElse0 {
            condition: get(keys::FIRST, ctx)?,
            function: get(keys::SECOND, ctx)?,
        },
        Tag::PushCallElse1 => Instruction::PushCallElse1 {
            condition: get(keys::FIRST, ctx)?,
            function: get(keys::SECOND, ctx)?,
            arg: get(keys::THIRD, ctx)?,
        },
        Tag::Drain => Instruction::Drain,
        Tag::RetMapHas => Instruction::RetMapHas {
            map: get(keys::FIRST, ctx)?,
            key: get(keys::SECOND, ctx)?,
        },
        Tag::RetMapGet => Instruction::RetMapGet {
            map: get(keys::FIRST, ctx)?,
            key: get(keys::SECOND, ctx)?,
        },
        Tag::EnterContext => Instruction::EnterContext,
        Tag::ResumeContext => Instruction::ResumeContext {
            context: get(keys::FIRST, ctx)?,
        },
        Tag::PopContext => Instruction::PopContext,
        Tag::Exit => Instruction::Exit,
        Tag::Out => Instruction::Out {
            value: get(keys::FIRST, ctx)?,
        },
        Tag::Err => Instruction::Err {
            value: get(keys::FIRST, ctx)?,
        },
        Tag::StreamInit => Instruction::StreamInit {
            stream_type: get(keys::FIRST, ctx)?,
        },
        Tag::StreamPush => Instruction::StreamPush {
            stream: get_loc(keys::FIRST, ctx)?,
            value: get(keys::SECOND, ctx)?,
        },
        Tag::StreamPop => Instruction::StreamPop {
            stream: get_loc(keys::FIRST, ctx)?,
        },
        Tag::StreamClose => Instruction::StreamClose {
            stream: get_loc(keys::FIRST, ctx)?,
        },
        Tag::StreamEmpty => Instruction::StreamEmpty {
            stream: get_loc(keys::FIRST, ctx)?,
        },
        Tag::Typify => Instruction::Typify {
            location: get_loc(keys::FIRST, ctx)?,
            type_value: get(keys::SECOND, ctx)?,
        },
        Tag::AssignValue => Instruction::AssignValue {
            dest: get_loc(keys::FIRST, ctx)?,
            value: get(keys::SECOND, ctx)?,
        },
        Tag::AssignEval => Instruction::AssignEval {
            dest: get_loc(keys::FIRST, ctx)?,
            eval: Box::new(produce_instruction(map.get_map(keys::SECOND)?, ctx)?),
        },
        Tag::Lock => Instruction::Lock {
            location: get_loc(keys::FIRST, ctx)?,
        },
        Tag::Unlock => Instruction::Unlock {
            location: get_loc(keys::FIRST, ctx)?,
        },
        Tag::IsEqual => Instruction::IsEqual {
            lhs: get(keys::FIRST, ctx)?,
            rhs: get(keys::SECOND, ctx)?,
        },
        Tag::ScopeOf => Instruction::ScopeOf {
            location: get_loc(keys::FIRST, ctx)?,
        },
        Tag::TypeOf => Instruction::TypeOf {
            value: get(keys::FIRST, ctx)?,
        },
        Tag::IsCompatible => Instruction::IsCompatible {
            lhs: get(keys::FIRST, ctx)?,
            rhs: get(keys::SECOND, ctx)?,
        },
        Tag::And => Instruction::And {
            lhs: get(keys::FIRST, ctx)?,
            rhs: get(keys::SECOND, ctx)?,
        },
        Tag::Or => Instruction::Or {
            lhs: get(keys::FIRST, ctx)?,
            rhs: get(keys::SECOND, ctx)?,
        },
        Tag::Xor => Instruction::Xor {
            lhs: get(keys::FIRST, ctx)?,
            rhs: get(keys::SECOND, ctx)?,
        },
        Tag::Nand => Instruction::Nand {
            lhs: get(keys::FIRST, ctx)?,
            rhs: get(keys::SECOND, ctx)?,
        },
        Tag::Nor => Instruction::Nor {
            lhs: get(keys::FIRST, ctx)?,
            rhs: get(keys::SECOND, ctx)?,
        },
        Tag::Not => Instruction::Not {
            value: get(keys::FIRST, ctx)?,
        },
        Tag::MapInit => Instruction::MapInit {
            value_type: get(keys::FIRST, ctx)?,
        },
        Tag::MapSet => Instruction::MapSet {
            key: get(keys::FIRST, ctx)?,
            value: get(keys::SECOND, ctx)?,
            map: get_loc(keys::THIRD, ctx)?,
        },
        Tag::MapGet => Instruction::MapGet {
            key: get(keys::FIRST, ctx)?,
            map: get_loc(keys::SECOND, ctx)?,
        },
        Tag::MapLength => Instruction::MapLength {
            map: get_loc(keys::FIRST, ctx)?,
        },
        Tag::MapKeys => Instruction::MapKeys {
            map: get_loc(keys::FIRST, ctx)?,
        },
        Tag::EnumInit => Instruction::EnumInit {
            value_type: get(keys::FIRST, ctx)?,
        },
        Tag::EnumAppend => Instruction::EnumAppend {
            value: get(keys::FIRST, ctx)?,
            enumeration: get_loc(keys::SECOND, ctx)?,
        },
        Tag::EnumPrepend => Instruction::EnumPrepend {
            value: get(keys::FIRST, ctx)?,
            enumeration: get_loc(keys::SECOND, ctx)?,
        },
        Tag::EnumLength => Instruction::EnumLength {
            enumeration: get_loc(keys::FIRST, ctx)?,
        },
        Tag::EnumGet => Instruction::EnumGet {
            enumeration: get_loc(keys::FIRST, ctx)?,
            index: get(keys::SECOND, ctx)?,
        },
        Tag::EnumSet => Instruction::EnumSet {
            enumeration: get_loc(keys::FIRST, ctx)?,
            index: get(keys::SECOND, ctx)?,
            value: get(keys::THIRD, ctx)?,
        },
        Tag::EnumConcat => Instruction::EnumConcat {
            lhs: get_loc(keys::FIRST, ctx)?,
            rhs: get_loc(keys::SECOND, ctx)?,
        },
        Tag::Enumerate => Instruction::Enumerate {
            value_type: get(keys::FIRST, ctx)?,
            enumeration: get_loc(keys::SECOND, ctx)?,
            callback: get_loc(keys::THIRD, ctx)?,
        },
        Tag::StrConcat => Instruction::StrConcat {
            lhs: get(keys::FIRST, ctx)?,
            rhs: get(keys::SECOND, ctx)?,
        },
        Tag::StrLength => Instruction::StrLength {
            value: get(keys::FIRST, ctx)?,
        },
        Tag::StrSliceFrom => Instruction::StrSliceFrom {
            value: get(keys::FIRST, ctx)?,
            from: get(keys::SECOND, ctx)?,
        },
        Tag::StrSliceFromTo => Instruction::StrSliceFromTo {
            value: get(keys::FIRST, ctx)?,
            from: get(keys::SECOND, ctx)?,
            to: get(keys::THIRD, ctx)?,
        },
        Tag::Plus => Instruction::Plus {
            lhs: get(keys::FIRST, ctx)?,
            rhs: get(keys::SECOND, ctx)?,
        },
        Tag::Minus => Instruction::Minus {
            lhs: get(keys::FIRST, ctx)?,
            rhs: get(keys::SECOND, ctx)?,
        },
        Tag::Times => Instruction::Times {
            lhs: get(keys::FIRST, ctx)?,
            rhs: get(keys::SECOND, ctx)?,
        },
        Tag::Divide => Instruction::Divide {
            lhs: get(keys::FIRST, ctx)?,
            rhs: get(keys::SECOND, ctx)?,
        },
        Tag::Power => Instruction::Power {
            lhs: get(keys::FIRST, ctx)?,
            rhs: get(keys::SECOND, ctx)?,
        },
        Tag::Mod => Instruction::Mod {
            lhs: get(keys::FIRST, ctx)?,
            rhs: get(keys::SECOND, ctx)?,
        },
        Tag::Neg => Instruction::Neg {
            value: get(keys::FIRST, ctx)?,
        },
        Tag::Gt => Instruction::Gt {
            lhs: get(keys::FIRST, ctx)?,
            rhs: get(keys::SECOND, ctx)?,
        },
        Tag::Gte => Instruction::Gte {
            lhs: get(keys::FIRST, ctx)?,
            rhs: get(keys::SECOND, ctx)?,
        },
        Tag::Lt => Instruction::Lt {
            lhs: get(keys::FIRST, ctx)?,
            rhs: get(keys::SECOND, ctx)?,
        },
        Tag::Lte => Instruction::Lte {
            lhs: get(keys::FIRST, ctx)?,
            rhs: get(keys::SECOND, ctx)?,
        },
        Tag::While => Instruction::While {
            condition: get(keys::FIRST, ctx)?,
            callback: get_loc(keys::SECOND, ctx)?,
        },
        Tag::With => Instruction::With {
            resource: get(keys::FIRST, ctx)?,
            callback: get_loc(keys::SECOND, ctx)?,
        },
        Tag::PushExHandler1 => Instruction::PushExHandler1 {
            handler: get_loc(keys::FIRST, ctx)?,
        },
        Tag::PushExHandler2 => Instruction::PushExHandler2 {
            handler: get_loc(keys::FIRST, ctx)?,
            discriminator: get_loc(keys::SECOND, ctx)?,
        },
        Tag::PopExHandler => Instruction::PopExHandler {
            handler_id: get(keys::FIRST, ctx)?,
        },
        Tag::Raise => Instruction::Raise {
            code: get(keys::FIRST, ctx)?,
        },
        Tag::Resume => Instruction::Resume {
            function: get_loc(keys::FIRST, ctx)?,
        },
        Tag::OTypeInit => Instruction::OTypeInit,
        Tag::OTypeProp => Instruction::OTypeProp {
            otype: get(keys::FIRST, ctx)?,
            property: get_loc(keys::SECOND, ctx)?,
            prop_type: get(keys::THIRD, ctx)?,
        },
        Tag::OTypeDel => Instruction::OTypeDel {
            otype: get(keys::FIRST, ctx)?,
            property: get_loc(keys::SECOND, ctx)?,
        },
        Tag::OTypeGet => Instruction::OTypeGet {
            otype: get(keys::FIRST, ctx)?,
            property: get_loc(keys::SECOND, ctx)?,
        },
        Tag::OTypeFinalize => Instruction::OTypeFinalize {
            otype: get(keys::FIRST, ctx)?,
        },
        Tag::OTypeSubset => Instruction::OTypeSubset {
            otype: get(keys::FIRST, ctx)?,
        },
        Tag::ObjInit => Instruction::ObjInit {
            otype: get(keys::FIRST, ctx)?,
        },
        Tag::ObjSet => Instruction::ObjSet {
            object: get(keys::FIRST, ctx)?,
            property: get_loc(keys::SECOND, ctx)?,
            value: get(keys::THIRD, ctx)?,
        },
        Tag::ObjGet => Instruction::ObjGet {
            object: get(keys::FIRST, ctx)?,
            property: get_loc(keys::SECOND, ctx)?,
        },
        Tag::ObjInstance => Instruction::ObjInstance {
            object: get(keys::FIRST, ctx)?,
        },
        Tag::ObjCurry => Instruction::ObjCurry {
            object: get(keys::FIRST, ctx)?,
            property: get_loc(keys::SECOND, ctx)?,
        },
    };

    Ok(instruction)
}

/// Reduce a whole program to its `{BODY: [...]}` map.
pub fn reduce_program(
    instructions: &Instructions,
    ctx: &mut dyn WireContext,
) -> WireResult<WireMap> {
    let mut body = Vec::with_capacity(instructions.len());
    for instruction in instructions {
        body.push(WireValue::Map(reduce_instruction(instruction, ctx)?));
    }
    let mut map = WireMap::new();
    map.set_list(keys::BODY, body);
    Ok(map)
}

/// Produce a program from its `{BODY: [...]}` map.
pub fn produce_program(map: &WireMap, ctx: &mut dyn WireContext) -> WireResult<Instructions> {
    let body = map.get_list(keys::BODY)?;
    let mut instructions = Vec::with_capacity(body.len());
    for value in body {
        instructions.push(produce_instruction(expect_map(value)?, ctx)?);
    }
    Ok(instructions)
}

/// Serialize a program to SBI bytes (marker included).
pub fn write_sbi(instructions: &Instructions, ctx: &mut dyn WireContext) -> WireResult<Vec<u8>> {
    let map = reduce_program(instructions, ctx)?;
    let mut bytes = Vec::from(&SBI_MARKER[..]);
    bytes.extend(map.to_bytes());
    Ok(bytes)
}

/// Deserialize a program from SBI bytes (marker checked).
pub fn read_sbi(bytes: &[u8], ctx: &mut dyn WireContext) -> WireResult<Instructions> {
    if !is_binary_input(bytes) {
        return Err(WireError::NotBinaryInput);
    }
    let map = WireMap::from_bytes(&bytes[SBI_MARKER.len()..])?;
    produce_program(&map, ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::NullContext;
    use svi_core::parser;

    #[test]
    fn marker_discriminates_input() {
        assert!(is_binary_input(b"\x7fSVI rest"));
        assert!(!is_binary_input(b"out \"hello\""));
        assert!(!is_binary_input(b"\x7f"));
    }

    #[test]
    fn every_parsed_instruction_round_trips() {
        let source = "
            .position \"main.sw\" 1 1
            beginfn f:f p:NUMBER
              fnparam p:NUMBER $l:x
              $l:r <- plus $l:x 1
              return $l:r
            $l:cond <- true
            callif $l:cond f:f 2
            pushcall f:f 3
            drain
            entercontext
            popcontext
            $l:e <- enuminit p:NUMBER
            enumappend 10 $l:e
            $l:n <- enumlength $l:e
            $l:m <- mapinit p:STRING
            mapset \"k\" \"v\" $l:m
            $l:keys <- mapkeys $l:m
            $l:s <- strconcat \"a\" \"b\"
            $l:sl <- strslice $l:s 1
            $l:eq <- equal 1 1
            $l:t <- typeof $l:e
            $l:c <- compatible 1 2
            lock $s:shared
            unlock $s:shared
            pushexhandler f:f
            raise 42
            exit
            ";
        let program = parser::parse(source).unwrap();
        assert!(program.len() > 20);

        let mut ctx = NullContext;
        let bytes = write_sbi(&program, &mut ctx).unwrap();
        assert!(is_binary_input(&bytes));

        let produced = read_sbi(&bytes, &mut ctx).unwrap();
        assert_eq!(produced, program);
    }

    #[test]
    fn assigneval_nests_its_instruction() {
        let program = parser::parse("$l:c <- plus 1 2").unwrap();
        let mut ctx = NullContext;
        let map = reduce_instruction(&program[0], &mut ctx).unwrap();
        let produced = produce_instruction(&map, &mut ctx).unwrap();
        assert_eq!(produced, program[0]);
    }

    #[test]
    fn non_binary_input_is_rejected() {
        let mut ctx = NullContext;
        assert!(matches!(
            read_sbi(b"out \"plain text\"", &mut ctx),
            Err(WireError::NotBinaryInput)
        ));
    }
}
