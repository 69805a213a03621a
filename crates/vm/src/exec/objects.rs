//! Object types and object instances.
//!
//! Object types are values: mutating instructions write the updated type
//! back to the location they read it from. Instances are shared-identity
//! containers, but are still written back so serialized backends observe
//! property changes.

use svi_core::references::{LocationReference, ObjectHandle, Reference};
use svi_core::types::ObjectType;
use svi_core::{Instruction, SviError};

use super::{ensure_object, invalid_operand, Outcome};
use crate::error::VmResult;
use crate::machine::VirtualMachine;

pub(super) fn execute(vm: &mut VirtualMachine, instruction: &Instruction) -> VmResult<Outcome> {
    let value = match instruction {
        Instruction::OTypeInit => Reference::OType(ObjectType::new()),

        Instruction::OTypeProp {
            otype,
            property,
            prop_type,
        } => {
            let (mut object_type, source) = resolve_object_type(vm, otype)?;
            let ty = vm.resolve_type_operand(prop_type)?;
            object_type.define_property(property.name(), ty)?;
            write_back_type(vm, source, &object_type)?;
            Reference::OType(object_type)
        }

        Instruction::OTypeDel { otype, property } => {
            let (mut object_type, source) = resolve_object_type(vm, otype)?;
            object_type.delete_property(property.name())?;
            write_back_type(vm, source, &object_type)?;
            Reference::OType(object_type)
        }

        Instruction::OTypeGet { otype, property } => {
            let (object_type, _) = resolve_object_type(vm, otype)?;
            Reference::TypeRef(object_type.property(property.name())?)
        }

        Instruction::OTypeFinalize { otype } => {
            let (mut object_type, source) = resolve_object_type(vm, otype)?;
            object_type.finalize();
            write_back_type(vm, source, &object_type)?;
            Reference::OType(object_type)
        }

        Instruction::OTypeSubset { otype } => {
            let (object_type, _) = resolve_object_type(vm, otype)?;
            Reference::OType(object_type.subset())
        }

        Instruction::ObjInit { otype } => {
            let (object_type, _) = resolve_object_type(vm, otype)?;
            Reference::Object(ObjectHandle::new(object_type))
        }

        Instruction::ObjSet {
            object,
            property,
            value,
        } => {
            let value = vm.resolve(value)?;
            let handle = ensure_object(vm, object)?;
            handle.set_property(property.name(), value)?;
            if let Reference::Location(location) = object {
                vm.store_value(location, Reference::Object(handle))?;
            }
            Reference::Void
        }

        Instruction::ObjGet { object, property } => {
            let handle = ensure_object(vm, object)?;
            handle.get_property(property.name())?
        }

        Instruction::ObjInstance { object } => {
            let handle = ensure_object(vm, object)?;
            ensure_fully_populated(&handle)?;
            Reference::Object(handle)
        }

        Instruction::ObjCurry { object, property } => {
            // Method binding: the property holds a function; bind the
            // object itself as its first argument.
            let handle = ensure_object(vm, object)?;
            let method = match handle.get_property(property.name())? {
                Reference::Function(function) => function,
                other => return Err(invalid_operand("FUNCTION", &other)),
            };
            Reference::Function(method.curry(Reference::Object(handle))?)
        }

        other => unreachable!("not an object instruction: {other}"),
    };

    Ok(Outcome::Value(value))
}

/// Resolve an object-type operand, remembering the location it came from
/// so mutations can be written back.
fn resolve_object_type(
    vm: &mut VirtualMachine,
    operand: &Reference,
) -> VmResult<(ObjectType, Option<LocationReference>)> {
    let source = match operand {
        Reference::Location(location) => Some(location.clone()),
        _ => None,
    };
    match vm.resolve(operand)? {
        Reference::OType(object_type) => Ok((object_type, source)),
        Reference::TypeRef(svi_core::Type::Object(object_type)) => Ok((object_type, source)),
        other => Err(invalid_operand("OTYPE", &other)),
    }
}

fn write_back_type(
    vm: &mut VirtualMachine,
    source: Option<LocationReference>,
    object_type: &ObjectType,
) -> VmResult<()> {
    if let Some(location) = source {
        vm.store_value(&location, Reference::OType(object_type.clone()))?;
    }
    Ok(())
}

fn ensure_fully_populated(handle: &ObjectHandle) -> VmResult<()> {
    let assigned: Vec<String> = handle
        .property_values()
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    for (name, _) in handle.otype().properties() {
        if !assigned.iter().any(|assigned| assigned == name) {
            return Err(SviError::MissingProperty {
                property: name.clone(),
            }
            .into());
        }
    }
    Ok(())
}
