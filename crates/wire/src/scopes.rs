//! Reduction and production of scope frames.
//!
//! The whole parent chain crosses the wire, along with each frame's shadow
//! table, exception handlers, call, and return bookkeeping, so a worker can
//! restore the exact dynamic environment a deferred call was captured in.

use svi_core::references::Reference;
use svi_core::scope::{ExceptionHandler, HandlerSelector, ScopeFrame};
use svi_io::{WireMap, WireValue};

use crate::context::WireContext;
use crate::error::{WireError, WireResult};
use crate::keys;
use crate::references::{produce_reference, reduce_reference};

/// Reduce a scope frame (and its ancestors) to a wire map.
pub fn reduce_scope(scope: &ScopeFrame, ctx: &mut dyn WireContext) -> WireResult<WireMap> {
    let mut map = WireMap::new();
    map.set_str(keys::ID, scope.id());

    let mut names = Vec::new();
    let mut locations = Vec::new();
    for (name, backing) in scope.shadow_entries() {
        names.push(WireValue::Str(name.clone()));
        locations.push(WireValue::Map(reduce_reference(
            &Reference::Location(backing.clone()),
            ctx,
        )?));
    }
    map.set_list(keys::KEYS, names);
    map.set_list(keys::LOCATIONS, locations);

    let mut handlers = Vec::new();
    for handler in scope.handlers_in_push_order() {
        handlers.push(WireValue::Map(reduce_handler(handler, ctx)?));
    }
    map.set_list(keys::EX_HANDLERS, handlers);

    map.set_bool(keys::HAS_CALL, scope.own_call().is_some());
    if let Some(call) = scope.own_call() {
        map.set_map(keys::CALL, crate::calls::reduce_call(call, ctx)?);
    }

    map.set_bool(keys::HAS_RETURN_PC, scope.return_pc().is_some());
    if let Some(pc) = scope.return_pc() {
        map.set_u64(keys::RETURN_PC, pc as u64);
    }

    map.set_bool(keys::IS_EX_FRAME, scope.is_exception_frame());
    map.set_bool(keys::CAPTURE_RETURN, scope.capture_return());

    map.set_bool(keys::HAS_PARENT, scope.parent().is_some());
    if let Some(parent) = scope.parent() {
        map.set_map(keys::PARENT, reduce_scope(parent, ctx)?);
    }

    Ok(map)
}

fn reduce_handler(handler: &ExceptionHandler, ctx: &mut dyn WireContext) -> WireResult<WireMap> {
    let mut map = WireMap::new();
    map.set_str(keys::ID, handler.id.clone());
    map.set_map(
        keys::HANDLER,
        reduce_reference(&Reference::Function(handler.handler.clone()), ctx)?,
    );

    match &handler.selector {
        HandlerSelector::Universal => {
            map.set_u64(keys::SELECTOR, keys::SELECTOR_UNIVERSAL);
        }
        HandlerSelector::Code(code) => {
            map.set_u64(keys::SELECTOR, keys::SELECTOR_CODE);
            map.set_f64(keys::CODE, *code);
        }
        HandlerSelector::Discriminator(function) => {
            map.set_u64(keys::SELECTOR, keys::SELECTOR_DISCRIMINATOR);
            map.set_map(
                keys::DISCRIMINATOR,
                reduce_reference(&Reference::Function(function.clone()), ctx)?,
            );
        }
    }

    Ok(map)
}

/// Produce a scope frame (and its ancestors) from a wire map.
pub fn produce_scope(map: &WireMap, ctx: &mut dyn WireContext) -> WireResult<ScopeFrame> {
    let mut scope = ScopeFrame::root(map.get_str(keys::ID)?);

    let names = map.get_list(keys::KEYS)?;
    let locations = map.get_list(keys::LOCATIONS)?;
    if names.len() != locations.len() {
        return Err(WireError::malformed(
            "scope shadow names and locations differ in length",
        ));
    }
    for (name, location) in names.iter().zip(locations) {
        let name = crate::types::expect_str(name)?;
        match produce_reference(crate::types::expect_map(location)?, ctx)? {
            Reference::Location(backing) => scope.restore_shadow(name, backing),
            other => {
                return Err(WireError::malformed(format!(
                    "scope shadow resolved to non-location {other}"
                )))
            }
        }
    }

    let mut handlers = Vec::new();
    for handler in map.get_list(keys::EX_HANDLERS)? {
        handlers.push(produce_handler(crate::types::expect_map(handler)?, ctx)?);
    }
    scope.set_handlers(handlers);

    if map.get_bool(keys::HAS_CALL)? {
        scope.set_own_call(crate::calls::produce_call(map.get_map(keys::CALL)?, ctx)?);
    }

    if map.get_bool(keys::HAS_RETURN_PC)? {
        scope.set_return_pc(map.get_u64(keys::RETURN_PC)? as usize);
    }

    scope.set_is_exception_frame(map.get_bool(keys::IS_EX_FRAME)?);
    scope.set_capture_return(map.get_bool(keys::CAPTURE_RETURN)?);

    if map.get_bool(keys::HAS_PARENT)? {
        scope.attach_parent(produce_scope(map.get_map(keys::PARENT)?, ctx)?);
    }

    Ok(scope)
}

fn produce_handler(map: &WireMap, ctx: &mut dyn WireContext) -> WireResult<ExceptionHandler> {
    let handler = match produce_reference(map.get_map(keys::HANDLER)?, ctx)? {
        Reference::Function(function) => function,
        other => {
            return Err(WireError::malformed(format!(
                "exception handler resolved to non-function {other}"
            )))
        }
    };

    let selector = match map.get_u64(keys::SELECTOR)? {
        keys::SELECTOR_UNIVERSAL => HandlerSelector::Universal,
        keys::SELECTOR_CODE => HandlerSelector::Code(map.get_f64(keys::CODE)?),
        keys::SELECTOR_DISCRIMINATOR => {
            match produce_reference(map.get_map(keys::DISCRIMINATOR)?, ctx)? {
                Reference::Function(function) => HandlerSelector::Discriminator(function),
                other => {
                    return Err(WireError::malformed(format!(
                        "handler discriminator resolved to non-function {other}"
                    )))
                }
            }
        }
        other => return Err(WireError::unknown_index("handler selector", other)),
    };

    Ok(ExceptionHandler {
        id: map.get_str(keys::ID)?.to_string(),
        selector,
        handler,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::NullContext;
    use svi_core::references::{
        Affinity, FunctionBackend, FunctionCall, FunctionReference, LocationReference,
    };
    use svi_core::Type;

    fn handler_fn(name: &str) -> FunctionReference {
        FunctionReference::new(FunctionBackend::Inline, name, vec![Type::Number], Type::Void)
    }

    #[test]
    fn scope_chain_round_trips() {
        let mut root = ScopeFrame::root("root");
        root.shadow(&LocationReference::new(Affinity::Local, "x"));
        root.push_handler("h1", HandlerSelector::Code(42.0), handler_fn("catch42"));

        let call = FunctionCall::new(FunctionBackend::Inline, "work", vec![], Type::Void);
        let mut scope = root.child_for_call("frame-1", call);
        scope.set_return_pc(12);
        scope.set_capture_return(true);
        scope.push_handler("h2", HandlerSelector::Universal, handler_fn("catchall"));

        let mut ctx = NullContext;
        let map = reduce_scope(&scope, &mut ctx).unwrap();
        let produced = produce_scope(&map, &mut ctx).unwrap();

        assert_eq!(produced.id(), scope.id());
        assert_eq!(produced.return_pc(), Some(12));
        assert!(produced.capture_return());
        assert_eq!(produced.own_call().map(|c| c.name()), Some("work"));
        assert_eq!(produced.handlers().count(), 1);

        let parent = produced.parent().expect("parent survives");
        assert_eq!(parent.id(), "root");
        assert_eq!(parent.handlers().count(), 1);

        // Shadow resolution still works through the produced chain.
        let nominal = LocationReference::new(Affinity::Local, "x");
        assert_ne!(produced.resolve(&nominal).name(), "x");
    }

    #[test]
    fn discriminator_selectors_round_trip() {
        let mut root = ScopeFrame::root("root");
        root.push_handler(
            "h",
            HandlerSelector::Discriminator(FunctionReference::new(
                FunctionBackend::Inline,
                "pick",
                vec![Type::Number],
                Type::Boolean,
            )),
            handler_fn("handle"),
        );

        let mut ctx = NullContext;
        let map = reduce_scope(&root, &mut ctx).unwrap();
        let produced = produce_scope(&map, &mut ctx).unwrap();
        match &produced.handlers_in_push_order()[0].selector {
            HandlerSelector::Discriminator(function) => assert_eq!(function.name(), "pick"),
            other => panic!("expected discriminator, got {other:?}"),
        }
    }
}
