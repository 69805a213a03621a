//! # svi-wire
//!
//! Structural binary serialization for the SVI machine: every VM-visible
//! object (types, references, calls, scopes, state) reduces to a
//! self-describing map and back. [`Wire`] bundles the five tag-keyed
//! factories; the `isa` module adds the SBI program exchange format.

pub mod calls;
pub mod context;
pub mod error;
pub mod factory;
pub mod isa;
pub mod keys;
pub mod references;
pub mod scopes;
pub mod states;
pub mod types;

pub use context::{NullContext, WireContext};
pub use error::{WireError, WireResult};
pub use factory::Factory;
pub use isa::{is_binary_input, read_sbi, write_sbi, SBI_MARKER};

use svi_core::references::{FunctionCall, Reference};
use svi_core::scope::ScopeFrame;
use svi_core::types::Type;
use svi_core::State;
use svi_io::WireMap;

/// The five reducer/producer tables, one per object family.
///
/// Registries are owned per instance rather than process-global; the VM
/// holds a `Wire` and hands it to anything that needs to cross the wire.
pub struct Wire {
    types: Factory<Type>,
    references: Factory<Reference>,
    calls: Factory<FunctionCall>,
    scopes: Factory<ScopeFrame>,
    states: Factory<State>,
}

impl Wire {
    /// Build the standard registries.
    pub fn new() -> Self {
        let mut types = Factory::new("types", type_tag, type_tag_of_map);
        for intrinsic in [
            "STRING",
            "NUMBER",
            "BOOLEAN",
            "ERROR",
            "VOID",
            "UNIT",
            "TYPE",
            "MAP",
            "ENUMERABLE",
            "STREAM",
            "LAMBDA0",
            "LAMBDA1",
            "RESOURCE",
            "AMBIGUOUS",
            "OPAQUE",
            "OBJECT",
            "THIS",
            "CONTRADICTION",
        ] {
            types.register(
                intrinsic,
                |ty, _ctx| types::reduce_type(ty),
                |map, _ctx| types::produce_type(map),
            );
        }

        let mut references = Factory::new("references", reference_tag, reference_tag_of_map);
        for tag in [
            "LOCATION",
            "TYPE",
            "OTYPE",
            "OBJECT",
            "STRING",
            "NUMBER",
            "BOOLEAN",
            "FUNCTION",
            "STREAM",
            "RESOURCE",
            "ENUMERATION",
            "MAP",
            "VOID",
            "CONTEXT_ID",
            "JOB_ID",
            "RETURN_VALUE_MAP",
        ] {
            references.register(tag, references::reduce_reference, references::produce_reference);
        }

        let mut calls = Factory::new("calls", |_: &FunctionCall| "CALL".to_string(), |_| {
            Ok("CALL".to_string())
        });
        calls.register("CALL", calls::reduce_call, calls::produce_call);

        let mut scopes = Factory::new("scopes", |_: &ScopeFrame| "SCOPE".to_string(), |_| {
            Ok("SCOPE".to_string())
        });
        scopes.register("SCOPE", scopes::reduce_scope, scopes::produce_scope);

        let mut states = Factory::new("states", |_: &State| "STATE".to_string(), |_| {
            Ok("STATE".to_string())
        });
        states.register("STATE", states::reduce_state, states::produce_state);

        Self {
            types,
            references,
            calls,
            scopes,
            states,
        }
    }

    pub fn types(&self) -> &Factory<Type> {
        &self.types
    }

    pub fn references(&self) -> &Factory<Reference> {
        &self.references
    }

    pub fn calls(&self) -> &Factory<FunctionCall> {
        &self.calls
    }

    pub fn scopes(&self) -> &Factory<ScopeFrame> {
        &self.scopes
    }

    pub fn states(&self) -> &Factory<State> {
        &self.states
    }

    // --- convenience entry points ---

    pub fn reduce_reference(
        &self,
        reference: &Reference,
        ctx: &mut dyn WireContext,
    ) -> WireResult<WireMap> {
        self.references.reduce(reference, ctx)
    }

    pub fn produce_reference(
        &self,
        map: &WireMap,
        ctx: &mut dyn WireContext,
    ) -> WireResult<Reference> {
        self.references.produce(map, ctx)
    }

    pub fn reduce_call(
        &self,
        call: &FunctionCall,
        ctx: &mut dyn WireContext,
    ) -> WireResult<WireMap> {
        self.calls.reduce(call, ctx)
    }

    pub fn produce_call(&self, map: &WireMap, ctx: &mut dyn WireContext) -> WireResult<FunctionCall> {
        self.calls.produce(map, ctx)
    }

    pub fn reduce_scope(
        &self,
        scope: &ScopeFrame,
        ctx: &mut dyn WireContext,
    ) -> WireResult<WireMap> {
        self.scopes.reduce(scope, ctx)
    }

    pub fn produce_scope(&self, map: &WireMap, ctx: &mut dyn WireContext) -> WireResult<ScopeFrame> {
        self.scopes.produce(map, ctx)
    }

    pub fn reduce_state(&self, state: &State, ctx: &mut dyn WireContext) -> WireResult<WireMap> {
        self.states.reduce(state, ctx)
    }

    pub fn produce_state(&self, map: &WireMap, ctx: &mut dyn WireContext) -> WireResult<State> {
        self.states.produce(map, ctx)
    }
}

impl Default for Wire {
    fn default() -> Self {
        Self::new()
    }
}

fn type_tag(ty: &Type) -> String {
    ty.intrinsic().name().to_string()
}

fn type_tag_of_map(map: &WireMap) -> WireResult<String> {
    let intrinsic = types::produce_intrinsic_tag(map)?;
    Ok(intrinsic.name().to_string())
}

fn reference_tag(reference: &Reference) -> String {
    reference.tag().name().to_string()
}

fn reference_tag_of_map(map: &WireMap) -> WireResult<String> {
    let tag = references::produce_reference_tag(map)?;
    Ok(tag.name().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use svi_core::references::{EnumerationHandle, FunctionBackend, FunctionReference};

    #[test]
    fn factories_cover_every_tag() {
        let wire = Wire::new();
        assert_eq!(wire.types().tags().count(), 18);
        assert_eq!(wire.references().tags().count(), 16);
        assert_eq!(wire.calls().tags().count(), 1);
    }

    #[test]
    fn factory_round_trip_matches_direct_functions() {
        let wire = Wire::new();
        let mut ctx = NullContext;

        let enumeration = EnumerationHandle::new(Type::Number);
        enumeration.append(Reference::Number(1.0));
        let reference = Reference::Enumeration(enumeration);

        let map = wire.reduce_reference(&reference, &mut ctx).unwrap();
        let produced = wire.produce_reference(&map, &mut ctx).unwrap();
        assert_eq!(produced, reference);
    }

    #[test]
    fn call_factory_round_trips() {
        let wire = Wire::new();
        let mut ctx = NullContext;
        let call = FunctionReference::new(FunctionBackend::Inline, "f", vec![], Type::Void)
            .to_call()
            .unwrap();
        let map = wire.reduce_call(&call, &mut ctx).unwrap();
        assert_eq!(wire.produce_call(&map, &mut ctx).unwrap(), call);
    }
}
