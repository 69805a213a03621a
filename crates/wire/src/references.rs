//! Reduction and production of runtime references.

use svi_core::references::{
    Affinity, EnumerationHandle, FunctionBackend, FunctionReference, LocationReference, MapHandle,
    ObjectHandle, Reference, ReferenceTag, ResourceCategory, ResourceHandle,
    ReturnValueMapHandle, StreamHandle,
};
use svi_io::{WireMap, WireValue};

use crate::context::WireContext;
use crate::error::{WireError, WireResult};
use crate::keys;
use crate::types::{expect_map, expect_str, produce_object_type, produce_type, reduce_type};

/// Every reference tag, in stable wire order.
const REFERENCE_TAGS: [ReferenceTag; 16] = [
    ReferenceTag::Location,
    ReferenceTag::Type,
    ReferenceTag::OType,
    ReferenceTag::Object,
    ReferenceTag::String,
    ReferenceTag::Number,
    ReferenceTag::Boolean,
    ReferenceTag::Function,
    ReferenceTag::Stream,
    ReferenceTag::Resource,
    ReferenceTag::Enumeration,
    ReferenceTag::Map,
    ReferenceTag::Void,
    ReferenceTag::ContextId,
    ReferenceTag::JobId,
    ReferenceTag::ReturnValueMap,
];

pub(crate) fn reference_tag_index(tag: ReferenceTag) -> u64 {
    REFERENCE_TAGS
        .iter()
        .position(|t| *t == tag)
        .expect("every reference tag appears in REFERENCE_TAGS") as u64
}

pub(crate) fn reference_tag_from_index(index: u64) -> WireResult<ReferenceTag> {
    REFERENCE_TAGS
        .get(index as usize)
        .copied()
        .ok_or(WireError::unknown_index("reference tag", index))
}

/// The reference tag carried by a reduced reference map.
pub(crate) fn produce_reference_tag(map: &WireMap) -> WireResult<ReferenceTag> {
    reference_tag_from_index(map.get_u64(keys::TAG)?)
}

fn affinity_index(affinity: Affinity) -> u64 {
    match affinity {
        Affinity::Local => 0,
        Affinity::Shared => 1,
        Affinity::Function => 2,
        Affinity::Primitive => 3,
        Affinity::ObjectProp => 4,
    }
}

fn affinity_from_index(index: u64) -> WireResult<Affinity> {
    match index {
        0 => Ok(Affinity::Local),
        1 => Ok(Affinity::Shared),
        2 => Ok(Affinity::Function),
        3 => Ok(Affinity::Primitive),
        4 => Ok(Affinity::ObjectProp),
        other => Err(WireError::unknown_index("affinity", other)),
    }
}

/// Reduce a reference to its wire map.
///
/// Containers are deep-copied into the payload; resources are published to
/// the fabric through the context so the owning node stays reachable.
pub fn reduce_reference(
    reference: &Reference,
    ctx: &mut dyn WireContext,
) -> WireResult<WireMap> {
    let mut map = WireMap::new();
    map.set_u64(keys::TAG, reference_tag_index(reference.tag()));

    match reference {
        Reference::Location(loc) => {
            map.set_u64(keys::AFFINITY, affinity_index(loc.affinity()));
            map.set_str(keys::NAME, loc.name());
            if loc.has_declared_type() {
                map.set_map(keys::TYPE, reduce_type(&loc.declared_type())?);
            }
        }
        Reference::TypeRef(ty) => {
            map.set_map(keys::TYPE, reduce_type(ty)?);
        }
        Reference::OType(object) => {
            map.set_map(keys::TYPE, reduce_type(&svi_core::Type::Object(object.clone()))?);
        }
        Reference::Object(object) => {
            map.set_map(
                keys::TYPE,
                reduce_type(&svi_core::Type::Object(object.otype().clone()))?,
            );
            let mut names = Vec::new();
            let mut values = Vec::new();
            for (name, value) in object.property_values() {
                names.push(WireValue::Str(name));
                values.push(WireValue::Map(reduce_reference(&value, ctx)?));
            }
            map.set_list(keys::KEYS, names);
            map.set_list(keys::VECTOR_VALUES, values);
        }
        Reference::StringVal(value) => {
            map.set_str(keys::VALUE, value.clone());
        }
        Reference::Number(value) => {
            map.set_f64(keys::VALUE, *value);
        }
        Reference::Boolean(value) => {
            map.set_bool(keys::VALUE, *value);
        }
        Reference::Function(function) => {
            reduce_function_body(&mut map, function, ctx)?;
        }
        Reference::Stream(stream) => {
            map.set_str(keys::ID, stream.id());
            map.set_map(keys::TYPE, reduce_type(stream.inner_type())?);
        }
        Reference::Resource(resource) => {
            ctx.publish_resource(resource);
            map.set_str(keys::ID, resource.id());
            map.set_str(keys::OWNER, resource.owner());
            map.set_str(keys::NAME, resource.name());
            map.set_map(keys::TYPE, reduce_type(resource.inner_type())?);
            map.set_u64(keys::CATEGORY, resource.category().index());
        }
        Reference::Enumeration(enumeration) => {
            map.set_map(keys::TYPE, reduce_type(enumeration.inner_type())?);
            let mut items = Vec::with_capacity(enumeration.length());
            for item in enumeration.snapshot() {
                items.push(WireValue::Map(reduce_reference(&item, ctx)?));
            }
            map.set_list(keys::ITEMS, items);
        }
        Reference::Map(value_map) => {
            map.set_map(keys::TYPE, reduce_type(value_map.inner_type())?);
            let mut names = Vec::new();
            let mut values = Vec::new();
            for (key, value) in value_map.entries() {
                names.push(WireValue::Str(key));
                values.push(WireValue::Map(reduce_reference(&value, ctx)?));
            }
            map.set_list(keys::KEYS, names);
            map.set_list(keys::VECTOR_VALUES, values);
        }
        Reference::Void => {}
        Reference::ContextId(id) => {
            map.set_str(keys::ID, id.clone());
        }
        Reference::JobId(id) => {
            map.set_u64(keys::ID, *id);
        }
        Reference::ReturnValueMap(returns) => {
            let mut ids = Vec::new();
            let mut values = Vec::new();
            for (id, value) in returns.entries() {
                ids.push(WireValue::U64(id));
                values.push(WireValue::Map(reduce_reference(&value, ctx)?));
            }
            map.set_list(keys::KEYS, ids);
            map.set_list(keys::VECTOR_VALUES, values);
        }
    }

    Ok(map)
}

fn reduce_function_body(
    map: &mut WireMap,
    function: &FunctionReference,
    ctx: &mut dyn WireContext,
) -> WireResult<()> {
    map.set_u64(keys::BACKEND, function.backend().index());
    map.set_str(keys::NAME, function.name());
    map.set_map(keys::RETURNS, reduce_type(function.returns())?);

    let mut formals = Vec::with_capacity(function.formals().len());
    for formal in function.formals() {
        formals.push(WireValue::Map(reduce_type(formal)?));
    }
    map.set_list(keys::VECTOR_TYPES, formals);

    let mut applied = Vec::with_capacity(function.applied().len());
    for arg in function.applied() {
        applied.push(WireValue::Map(reduce_reference(arg, ctx)?));
    }
    map.set_list(keys::PARAMS, applied);
    Ok(())
}

/// Produce a reference from its wire map.
pub fn produce_reference(map: &WireMap, ctx: &mut dyn WireContext) -> WireResult<Reference> {
    let tag = reference_tag_from_index(map.get_u64(keys::TAG)?)?;

    let reference = match tag {
        ReferenceTag::Location => {
            let affinity = affinity_from_index(map.get_u64(keys::AFFINITY)?)?;
            let mut loc = LocationReference::new(affinity, map.get_str(keys::NAME)?);
            if map.contains(keys::TYPE) {
                loc.set_declared_type(produce_type(map.get_map(keys::TYPE)?)?);
            }
            Reference::Location(loc)
        }
        ReferenceTag::Type => Reference::TypeRef(produce_type(map.get_map(keys::TYPE)?)?),
        ReferenceTag::OType => {
            Reference::OType(produce_object_type(map.get_map(keys::TYPE)?)?)
        }
        ReferenceTag::Object => {
            let otype = produce_object_type(map.get_map(keys::TYPE)?)?;
            let object = ObjectHandle::new(otype);
            let names = map.get_list(keys::KEYS)?;
            let values = map.get_list(keys::VECTOR_VALUES)?;
            for (name, value) in names.iter().zip(values) {
                object
                    .set_property(expect_str(name)?, produce_reference(expect_map(value)?, ctx)?)?;
            }
            Reference::Object(object)
        }
        ReferenceTag::String => Reference::StringVal(map.get_str(keys::VALUE)?.to_string()),
        ReferenceTag::Number => Reference::Number(map.get_f64(keys::VALUE)?),
        ReferenceTag::Boolean => Reference::Boolean(map.get_bool(keys::VALUE)?),
        ReferenceTag::Function => Reference::Function(produce_function(map, ctx)?),
        ReferenceTag::Stream => Reference::Stream(StreamHandle::new(
            map.get_str(keys::ID)?,
            produce_type(map.get_map(keys::TYPE)?)?,
        )),
        ReferenceTag::Resource => {
            let category_index = map.get_u64(keys::CATEGORY)?;
            let category = ResourceCategory::from_index(category_index)
                .ok_or(WireError::unknown_index("resource category", category_index))?;
            Reference::Resource(ResourceHandle::new(
                map.get_str(keys::ID)?,
                map.get_str(keys::OWNER)?,
                map.get_str(keys::NAME)?,
                produce_type(map.get_map(keys::TYPE)?)?,
                category,
            ))
        }
        ReferenceTag::Enumeration => {
            let enumeration = EnumerationHandle::new(produce_type(map.get_map(keys::TYPE)?)?);
            for item in map.get_list(keys::ITEMS)? {
                enumeration.append(produce_reference(expect_map(item)?, ctx)?);
            }
            Reference::Enumeration(enumeration)
        }
        ReferenceTag::Map => {
            let value_map = MapHandle::new(produce_type(map.get_map(keys::TYPE)?)?);
            let names = map.get_list(keys::KEYS)?;
            let values = map.get_list(keys::VECTOR_VALUES)?;
            for (name, value) in names.iter().zip(values) {
                value_map.set(expect_str(name)?, produce_reference(expect_map(value)?, ctx)?);
            }
            Reference::Map(value_map)
        }
        ReferenceTag::Void => Reference::Void,
        ReferenceTag::ContextId => Reference::ContextId(map.get_str(keys::ID)?.to_string()),
        ReferenceTag::JobId => Reference::JobId(map.get_u64(keys::ID)?),
        ReferenceTag::ReturnValueMap => {
            let returns = ReturnValueMapHandle::new();
            let ids = map.get_list(keys::KEYS)?;
            let values = map.get_list(keys::VECTOR_VALUES)?;
            for (id, value) in ids.iter().zip(values) {
                let id = match id {
                    WireValue::U64(id) => *id,
                    other => {
                        return Err(WireError::malformed(format!(
                            "expected u64 job id, got {}",
                            other.kind_name()
                        )))
                    }
                };
                returns.insert(id, produce_reference(expect_map(value)?, ctx)?);
            }
            Reference::ReturnValueMap(returns)
        }
    };

    Ok(reference)
}

/// Rebuild a function reference, preferring the host's live function table
/// over the serialized formals, and re-applying every captured argument by
/// currying so types are enforced on the way back in.
fn produce_function(map: &WireMap, ctx: &mut dyn WireContext) -> WireResult<FunctionReference> {
    let backend_index = map.get_u64(keys::BACKEND)?;
    let backend = FunctionBackend::from_index(backend_index)
        .ok_or(WireError::unknown_index("function backend", backend_index))?;
    let name = map.get_str(keys::NAME)?;

    let mut function = match ctx.lookup_function(backend, name) {
        Some(pristine) => pristine,
        None => {
            let returns = produce_type(map.get_map(keys::RETURNS)?)?;
            let mut formals = Vec::new();
            for formal in map.get_list(keys::VECTOR_TYPES)? {
                formals.push(produce_type(expect_map(formal)?)?);
            }
            FunctionReference::new(backend, name, formals, returns)
        }
    };

    for arg in map.get_list(keys::PARAMS)? {
        let produced = produce_reference(expect_map(arg)?, ctx)?;
        function = function.curry(produced)?;
    }

    Ok(function)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::NullContext;
    use svi_core::Type;

    fn round_trip(reference: &Reference) -> Reference {
        let mut ctx = NullContext;
        let map = reduce_reference(reference, &mut ctx).unwrap();
        produce_reference(&map, &mut ctx).unwrap()
    }

    #[test]
    fn scalars_round_trip() {
        for reference in [
            Reference::StringVal("hello".into()),
            Reference::Number(2.5),
            Reference::Boolean(true),
            Reference::Void,
            Reference::ContextId("ctx-1".into()),
            Reference::JobId(7),
        ] {
            assert_eq!(round_trip(&reference), reference);
        }
    }

    #[test]
    fn locations_keep_declared_types() {
        let mut loc = LocationReference::new(Affinity::Shared, "counter");
        loc.set_declared_type(Type::Number);
        let produced = round_trip(&Reference::Location(loc.clone()));
        match produced {
            Reference::Location(p) => {
                assert_eq!(p, loc);
                assert_eq!(p.declared_type(), Type::Number);
            }
            other => panic!("expected location, got {other}"),
        }
    }

    #[test]
    fn functions_round_trip_with_applied_args() {
        let function = FunctionReference::new(
            FunctionBackend::Inline,
            "add",
            vec![Type::Number, Type::Number],
            Type::Number,
        )
        .curry(Reference::Number(2.0))
        .unwrap();

        let produced = round_trip(&Reference::Function(function.clone()));
        assert_eq!(produced, Reference::Function(function));
    }

    #[test]
    fn produced_function_rejects_bad_applied_type() {
        let function = FunctionReference::new(
            FunctionBackend::Inline,
            "add",
            vec![Type::Number],
            Type::Number,
        )
        .curry(Reference::Number(2.0))
        .unwrap();

        let mut ctx = NullContext;
        let mut map = reduce_reference(&Reference::Function(function), &mut ctx).unwrap();
        // Corrupt the applied argument into a string.
        let mut bad_arg = WireMap::new();
        bad_arg.set_u64(keys::TAG, reference_tag_index(ReferenceTag::String));
        bad_arg.set_str(keys::VALUE, "oops");
        map.set_list(keys::PARAMS, vec![WireValue::Map(bad_arg)]);

        assert!(produce_reference(&map, &mut ctx).is_err());
    }

    #[test]
    fn containers_round_trip_as_deep_copies() {
        let enumeration = EnumerationHandle::new(Type::Number);
        enumeration.append(Reference::Number(1.0));
        enumeration.append(Reference::Number(2.0));

        let produced = round_trip(&Reference::Enumeration(enumeration.clone()));
        match produced {
            Reference::Enumeration(p) => {
                assert!(!p.same_identity(&enumeration));
                assert_eq!(Reference::Enumeration(p), Reference::Enumeration(enumeration));
            }
            other => panic!("expected enumeration, got {other}"),
        }
    }

    #[test]
    fn maps_and_return_maps_round_trip() {
        let value_map = MapHandle::new(Type::String);
        value_map.set("k", Reference::StringVal("v".into()));
        assert_eq!(
            round_trip(&Reference::Map(value_map.clone())),
            Reference::Map(value_map)
        );

        let returns = ReturnValueMapHandle::new();
        returns.insert(0, Reference::Number(11.0));
        returns.insert(2, Reference::Number(31.0));
        assert_eq!(
            round_trip(&Reference::ReturnValueMap(returns.clone())),
            Reference::ReturnValueMap(returns)
        );
    }

    #[test]
    fn objects_round_trip_with_values() {
        let mut otype = svi_core::ObjectType::new();
        otype.define_property("x", Type::Number).unwrap();
        otype.finalize();
        let object = ObjectHandle::new(otype);
        object.set_property("x", Reference::Number(4.0)).unwrap();

        assert_eq!(
            round_trip(&Reference::Object(object.clone())),
            Reference::Object(object)
        );
    }

    #[test]
    fn streams_and_resources_round_trip() {
        let stream = StreamHandle::new("s:STDOUT", Type::String);
        assert_eq!(
            round_trip(&Reference::Stream(stream.clone())),
            Reference::Stream(stream)
        );

        let resource = ResourceHandle::new(
            "res-1",
            "node-a",
            "TAG",
            Type::Opaque("TAG".into()),
            ResourceCategory::Tunneled,
        );
        assert_eq!(
            round_trip(&Reference::Resource(resource.clone())),
            Reference::Resource(resource)
        );
    }
}
