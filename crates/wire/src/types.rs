//! Reduction and production of types.

use svi_core::types::{Intrinsic, ObjectType, Type};
use svi_io::{WireMap, WireValue};

use crate::error::{WireError, WireResult};
use crate::keys;

/// Every intrinsic, in stable wire order.
const INTRINSICS: [Intrinsic; 18] = [
    Intrinsic::String,
    Intrinsic::Number,
    Intrinsic::Boolean,
    Intrinsic::Error,
    Intrinsic::Void,
    Intrinsic::Unit,
    Intrinsic::Type,
    Intrinsic::Map,
    Intrinsic::Enumerable,
    Intrinsic::Stream,
    Intrinsic::Lambda0,
    Intrinsic::Lambda1,
    Intrinsic::Resource,
    Intrinsic::Ambiguous,
    Intrinsic::Opaque,
    Intrinsic::Object,
    Intrinsic::This,
    Intrinsic::Contradiction,
];

pub(crate) fn intrinsic_index(intrinsic: Intrinsic) -> u64 {
    INTRINSICS
        .iter()
        .position(|i| *i == intrinsic)
        .expect("every intrinsic appears in INTRINSICS") as u64
}

pub(crate) fn intrinsic_from_index(index: u64) -> WireResult<Intrinsic> {
    INTRINSICS
        .get(index as usize)
        .copied()
        .ok_or(WireError::unknown_index("intrinsic", index))
}

/// The intrinsic tag carried by a reduced type map.
pub(crate) fn produce_intrinsic_tag(map: &WireMap) -> WireResult<Intrinsic> {
    intrinsic_from_index(map.get_u64(keys::INTRINSIC)?)
}

/// Reduce a type to its wire map.
pub fn reduce_type(ty: &Type) -> WireResult<WireMap> {
    let mut in_progress = Vec::new();
    reduce_guarded(ty, &mut in_progress)
}

// Recursive object shapes are guarded by a stack of in-progress object
// type ids; a nested reference to an in-progress id reduces to `This`.
fn reduce_guarded(ty: &Type, in_progress: &mut Vec<u64>) -> WireResult<WireMap> {
    let mut map = WireMap::new();

    if let Type::Object(object) = ty {
        if in_progress.contains(&object.id()) {
            map.set_u64(keys::INTRINSIC, intrinsic_index(Intrinsic::This));
            return Ok(map);
        }
    }

    map.set_u64(keys::INTRINSIC, intrinsic_index(ty.intrinsic()));

    match ty {
        Type::Map(inner)
        | Type::Enumerable(inner)
        | Type::Stream(inner)
        | Type::Resource(inner) => {
            map.set_map(keys::TYPE, reduce_guarded(inner, in_progress)?);
        }
        Type::Lambda0(returns) => {
            map.set_map(keys::RETURNS, reduce_guarded(returns, in_progress)?);
        }
        Type::Lambda1(_, _) => {
            let (params, returns) = lambda1_chain(ty);
            let mut reduced = Vec::with_capacity(params.len());
            for param in params {
                reduced.push(WireValue::Map(reduce_guarded(param, in_progress)?));
            }
            map.set_list(keys::PARAMS, reduced);
            map.set_map(keys::RETURNS, reduce_guarded(returns, in_progress)?);
        }
        Type::Opaque(name) => {
            map.set_str(keys::NAME, name.clone());
        }
        Type::Object(object) => {
            in_progress.push(object.id());
            let result = reduce_object_type_body(&mut map, object, in_progress);
            in_progress.pop();
            result?;
        }
        _ => {}
    }

    Ok(map)
}

fn reduce_object_type_body(
    map: &mut WireMap,
    object: &ObjectType,
    in_progress: &mut Vec<u64>,
) -> WireResult<()> {
    map.set_u64(keys::ID, object.id());
    map.set_bool(keys::FINAL, object.is_final());
    if let Some(parent) = object.parent() {
        map.set_u64(keys::PARENT, parent);
    }

    let mut names = Vec::with_capacity(object.properties().len());
    let mut types = Vec::with_capacity(object.properties().len());
    for (name, prop_type) in object.properties() {
        names.push(WireValue::Str(name.clone()));
        types.push(WireValue::Map(reduce_guarded(prop_type, in_progress)?));
    }
    map.set_list(keys::OTYPE_K, names);
    map.set_list(keys::OTYPE_V, types);
    Ok(())
}

// Walk a curried lambda chain: parameters in order, then whatever follows
// the last `Lambda1` link.
fn lambda1_chain(ty: &Type) -> (Vec<&Type>, &Type) {
    let mut params = Vec::new();
    let mut cursor = ty;
    while let Type::Lambda1(param, returns) = cursor {
        params.push(param.as_ref());
        cursor = returns.as_ref();
    }
    (params, cursor)
}

/// Produce a type from its wire map.
pub fn produce_type(map: &WireMap) -> WireResult<Type> {
    let intrinsic = intrinsic_from_index(map.get_u64(keys::INTRINSIC)?)?;

    let ty = match intrinsic {
        Intrinsic::Map => Type::Map(Box::new(produce_type(map.get_map(keys::TYPE)?)?)),
        Intrinsic::Enumerable => {
            Type::Enumerable(Box::new(produce_type(map.get_map(keys::TYPE)?)?))
        }
        Intrinsic::Stream => Type::Stream(Box::new(produce_type(map.get_map(keys::TYPE)?)?)),
        Intrinsic::Resource => Type::Resource(Box::new(produce_type(map.get_map(keys::TYPE)?)?)),
        Intrinsic::Lambda0 => Type::Lambda0(Box::new(produce_type(map.get_map(keys::RETURNS)?)?)),
        Intrinsic::Lambda1 => {
            let returns = produce_type(map.get_map(keys::RETURNS)?)?;
            let mut params = Vec::new();
            for value in map.get_list(keys::PARAMS)? {
                params.push(produce_type(expect_map(value)?)?);
            }
            if params.is_empty() {
                return Err(WireError::malformed("lambda1 with no parameters"));
            }
            Type::lambda(&params, returns)
        }
        Intrinsic::Opaque => Type::Opaque(map.get_str(keys::NAME)?.to_string()),
        Intrinsic::Object => Type::Object(produce_object_type(map)?),
        Intrinsic::Ambiguous => Type::Ambiguous,
        Intrinsic::This => Type::This,
        Intrinsic::Contradiction => Type::Contradiction,
        primitive => Type::primitive_of(primitive)
            .ok_or_else(|| WireError::malformed(format!("{primitive} is not producible")))?,
    };

    Ok(ty)
}

/// Produce an object type from a map reduced by [`reduce_type`].
pub fn produce_object_type(map: &WireMap) -> WireResult<ObjectType> {
    let id = map.get_u64(keys::ID)?;
    let parent = map.contains(keys::PARENT).then(|| map.get_u64(keys::PARENT)).transpose()?;
    let finalized = map.get_bool(keys::FINAL)?;

    let names = map.get_list(keys::OTYPE_K)?;
    let types = map.get_list(keys::OTYPE_V)?;
    if names.len() != types.len() {
        return Err(WireError::malformed(
            "object type property names and types differ in length",
        ));
    }

    let mut properties = indexmap::IndexMap::new();
    for (name, prop_type) in names.iter().zip(types) {
        let name = expect_str(name)?;
        properties.insert(name.to_string(), produce_type(expect_map(prop_type)?)?);
    }

    Ok(ObjectType::from_parts(id, parent, properties, finalized))
}

pub(crate) fn expect_map(value: &WireValue) -> WireResult<&WireMap> {
    match value {
        WireValue::Map(map) => Ok(map),
        other => Err(WireError::malformed(format!(
            "expected map list element, got {}",
            other.kind_name()
        ))),
    }
}

pub(crate) fn expect_str(value: &WireValue) -> WireResult<&str> {
    match value {
        WireValue::Str(s) => Ok(s),
        other => Err(WireError::malformed(format!(
            "expected string list element, got {}",
            other.kind_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(ty: &Type) -> Type {
        produce_type(&reduce_type(ty).unwrap()).unwrap()
    }

    #[test]
    fn primitives_round_trip() {
        for ty in [
            Type::String,
            Type::Number,
            Type::Boolean,
            Type::Error,
            Type::Void,
            Type::Unit,
            Type::Type,
            Type::Ambiguous,
            Type::This,
            Type::Contradiction,
        ] {
            assert_eq!(round_trip(&ty), ty);
        }
    }

    #[test]
    fn nested_containers_round_trip() {
        let ty = Type::Map(Box::new(Type::Enumerable(Box::new(Type::Stream(
            Box::new(Type::Number),
        )))));
        assert_eq!(round_trip(&ty), ty);
    }

    #[test]
    fn lambdas_round_trip() {
        let ty = Type::lambda(&[Type::Number, Type::String], Type::Boolean);
        assert_eq!(round_trip(&ty), ty);

        let nullary = Type::Lambda0(Box::new(Type::Void));
        assert_eq!(round_trip(&nullary), nullary);

        // A nullary lambda returning another callable keeps its shape.
        let tricky = Type::Lambda0(Box::new(Type::lambda(&[Type::Number], Type::Void)));
        assert_eq!(round_trip(&tricky), tricky);
    }

    #[test]
    fn object_types_round_trip() {
        let mut node = ObjectType::new();
        node.define_property("value", Type::Number).unwrap();
        node.define_property("next", Type::This).unwrap();
        node.finalize();

        let ty = Type::Object(node.clone());
        match round_trip(&ty) {
            Type::Object(produced) => {
                assert_eq!(produced.id(), node.id());
                assert!(produced.is_final());
                assert_eq!(produced.properties(), node.properties());
            }
            other => panic!("expected object type, got {other}"),
        }
    }

    #[test]
    fn in_progress_self_reference_reduces_to_this() {
        // Build a type whose property holds a resolved copy of itself, the
        // shape `resolve_this` hands out; reduction must re-collapse it.
        let mut node = ObjectType::new();
        node.define_property("value", Type::Number).unwrap();
        node.define_property("next", Type::This).unwrap();
        node.finalize();
        let resolved = node.property("next").unwrap();

        let mut outer = node.clone();
        // Force the self-reference into its expanded form.
        let mut properties = outer.properties().clone();
        properties.insert("next".to_string(), resolved);
        outer = ObjectType::from_parts(outer.id(), outer.parent(), properties, true);

        let reduced = reduce_type(&Type::Object(outer)).unwrap();
        let produced = produce_object_type(&reduced).unwrap();
        assert_eq!(produced.properties().get("next"), Some(&Type::This));
    }

    #[test]
    fn opaque_round_trips_by_name() {
        let ty = Type::Opaque("FILE".into());
        assert_eq!(round_trip(&ty), ty);
    }
}
