//! The context a reducer or producer may consult.
//!
//! Most objects reduce without any help, but resources must be published
//! to the fabric when they cross the wire, and producers may prefer a live
//! function table over the serialized formals when one is available.

use svi_core::{FunctionBackend, FunctionReference, ResourceHandle};

/// Services the wire layer may ask of its host.
pub trait WireContext {
    /// The id of the node performing the reduction.
    fn node_id(&self) -> String {
        "local".to_string()
    }

    /// Called when a resource reference is reduced, so the owner can be
    /// found by other nodes.
    fn publish_resource(&mut self, _resource: &ResourceHandle) {}

    /// Look up a pristine (uncurried) function reference in the host's
    /// function table, if the host has one.
    fn lookup_function(
        &self,
        _backend: FunctionBackend,
        _name: &str,
    ) -> Option<FunctionReference> {
        None
    }
}

/// A context providing no services; reduction falls back to the
/// self-describing payload for everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullContext;

impl WireContext for NullContext {}
