//! Reduction and production of function calls.
//!
//! A call crosses the wire as `{backend, name, params}`: producing it
//! re-materializes the function (from the host's table when available) and
//! re-applies every parameter by currying, so a restored call is
//! type-checked exactly like a locally built one.

use svi_core::references::{FunctionBackend, FunctionCall, FunctionReference};
use svi_io::{WireMap, WireValue};

use crate::context::WireContext;
use crate::error::{WireError, WireResult};
use crate::keys;
use crate::references::{produce_reference, reduce_reference};
use crate::types::{expect_map, produce_type, reduce_type};

/// Reduce a call to its wire map.
pub fn reduce_call(call: &FunctionCall, ctx: &mut dyn WireContext) -> WireResult<WireMap> {
    let mut map = WireMap::new();
    map.set_u64(keys::BACKEND, call.backend().index());
    map.set_str(keys::NAME, call.name());
    map.set_map(keys::RETURNS, reduce_type(call.returns())?);

    let mut formals = Vec::with_capacity(call.vector().len());
    let mut values = Vec::with_capacity(call.vector().len());
    for (formal, value) in call.vector() {
        formals.push(WireValue::Map(reduce_type(formal)?));
        values.push(WireValue::Map(reduce_reference(value, ctx)?));
    }
    map.set_list(keys::VECTOR_TYPES, formals);
    map.set_list(keys::PARAMS, values);

    if let Some(returned) = call.returned() {
        map.set_map(keys::RETURN, reduce_reference(returned, ctx)?);
    }

    Ok(map)
}

/// Produce a call from its wire map.
pub fn produce_call(map: &WireMap, ctx: &mut dyn WireContext) -> WireResult<FunctionCall> {
    let backend = FunctionBackend::from_index(map.get_u64(keys::BACKEND)?)
        .ok_or_else(|| WireError::malformed("unknown function backend in call"))?;
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

    for value in map.get_list(keys::PARAMS)? {
        let produced = produce_reference(expect_map(value)?, ctx)?;
        function = function.curry(produced)?;
    }

    let mut call = function.to_call()?;
    if map.contains(keys::RETURN) {
        call.set_returned(produce_reference(map.get_map(keys::RETURN)?, ctx)?);
    }

    Ok(call)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::NullContext;
    use svi_core::{Reference, Type};

    #[test]
    fn calls_round_trip() {
        let call = FunctionReference::new(
            FunctionBackend::Inline,
            "add",
            vec![Type::Number, Type::Number],
            Type::Number,
        )
        .curry(Reference::Number(1.0))
        .unwrap()
        .curry(Reference::Number(2.0))
        .unwrap()
        .to_call()
        .unwrap();

        let mut ctx = NullContext;
        let map = reduce_call(&call, &mut ctx).unwrap();
        let produced = produce_call(&map, &mut ctx).unwrap();
        assert_eq!(produced, call);
    }

    #[test]
    fn captured_return_value_survives() {
        let mut call =
            FunctionReference::new(FunctionBackend::Provider, "RANDOM", vec![], Type::Number)
                .to_call()
                .unwrap();
        call.set_returned(Reference::Number(0.25));

        let mut ctx = NullContext;
        let map = reduce_call(&call, &mut ctx).unwrap();
        let produced = produce_call(&map, &mut ctx).unwrap();
        assert_eq!(produced.returned(), Some(&Reference::Number(0.25)));
    }
}
