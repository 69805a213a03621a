//! The fabric: published distributed resources.
//!
//! A node publishes the resources it owns under a prefixed key in the
//! shared key-value surface. Loading an id on another node yields a
//! tunneled handle: invoking an operation on it submits an intrinsic
//! tunneled-operation call that only the owning node's workers accept.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use svi_core::references::{
    FunctionBackend, FunctionReference, Reference, ResourceCategory, ResourceHandle,
};
use svi_core::types::Type;
use svi_io::WireMap;
use svi_wire::keys;

use crate::error::{VmError, VmResult};
use crate::machine::VirtualMachine;
use crate::runtime::{GlobalServices, SchedulingFilters};

/// Name of the intrinsic that carries tunneled resource operations.
pub const TUNNEL_FUNCTION: &str = "FABRIC_TUNNEL_RESOURCE_OP";

/// Filter key used to steer tunneled operations to the owning node.
pub const NODE_FILTER: &str = "fabric::node";

/// The callable for a tunneled operation: resource id, operation name,
/// and an enumeration of operands; yields an enumeration of results.
pub fn tunnel_function_reference() -> FunctionReference {
    let any_list = Type::Enumerable(Box::new(Type::Ambiguous));
    FunctionReference::new(
        FunctionBackend::Intrinsic,
        TUNNEL_FUNCTION,
        vec![Type::String, Type::String, any_list.clone()],
        any_list,
    )
}

/// A live resource owned by some node.
pub trait Resource: Send + Sync {
    fn category(&self) -> ResourceCategory;
    fn id(&self) -> String;
    fn owner(&self) -> String;
    fn name(&self) -> String;
    fn inner_type(&self) -> Type;

    /// Filters applied to the node's scheduling state while the resource
    /// is held in a `with` block.
    fn scheduling_filters(&self) -> SchedulingFilters {
        SchedulingFilters::new()
    }

    /// Perform a named operation with the given operand frame.
    fn perform(
        &self,
        vm: &mut VirtualMachine,
        operation: &str,
        operands: Vec<Reference>,
    ) -> VmResult<Vec<Reference>>;

    /// Called when a `with` block takes the resource.
    fn acquire(&self, _vm: &mut VirtualMachine) -> VmResult<()> {
        Ok(())
    }

    /// Called when a `with` block releases the resource, on every exit
    /// path.
    fn release(&self, _vm: &mut VirtualMachine) -> VmResult<()> {
        Ok(())
    }

    /// A local replica, for replicable resources only.
    fn replicate(&self) -> VmResult<Arc<dyn Resource>> {
        Err(VmError::AttemptedCloneOfNonReplicableResource { resource: self.id() })
    }

    /// The value-level handle for this resource.
    fn handle(&self) -> ResourceHandle {
        ResourceHandle::new(
            self.id(),
            self.owner(),
            self.name(),
            self.inner_type(),
            self.category(),
        )
    }
}

/// The publish/lookup layer for resources, keyed by string id.
pub struct Fabric {
    prefix: String,
    global: Arc<dyn GlobalServices>,
    locals: Mutex<HashMap<String, Arc<dyn Resource>>>,
}

impl Fabric {
    pub fn new(prefix: impl Into<String>, global: Arc<dyn GlobalServices>) -> Self {
        Self {
            prefix: prefix.into(),
            global,
            locals: Mutex::new(HashMap::new()),
        }
    }

    fn key(&self, id: &str) -> String {
        format!("{}fabric::{id}", self.prefix)
    }

    /// Exclusive resources stay private to their owner; everything else
    /// is published.
    pub fn should_publish(&self, resource: &dyn Resource) -> bool {
        resource.category() != ResourceCategory::Exclusive
    }

    /// Register a locally owned resource and advertise it to the cluster.
    pub fn publish(&self, resource: Arc<dyn Resource>) {
        let handle = resource.handle();
        self.locals.lock().insert(handle.id().to_string(), resource);

        let mut record = WireMap::new();
        record.set_str(keys::OWNER, handle.owner());
        record.set_str(keys::NAME, handle.name());
        record.set_u64(keys::CATEGORY, handle.category().index());
        if let Ok(type_map) = svi_wire::types::reduce_type(handle.inner_type()) {
            record.set_map(keys::TYPE, type_map);
        }
        self.global
            .put_key_value(&self.key(handle.id()), &hex::encode(record.to_bytes()));
    }

    /// Advertise a handle that arrived over the wire (the live resource
    /// stays on its owner).
    pub fn publish_handle(&self, handle: &ResourceHandle) {
        if self.global.get_key_value(&self.key(handle.id())).is_some() {
            return;
        }
        let mut record = WireMap::new();
        record.set_str(keys::OWNER, handle.owner());
        record.set_str(keys::NAME, handle.name());
        record.set_u64(keys::CATEGORY, handle.category().index());
        if let Ok(type_map) = svi_wire::types::reduce_type(handle.inner_type()) {
            record.set_map(keys::TYPE, type_map);
        }
        self.global
            .put_key_value(&self.key(handle.id()), &hex::encode(record.to_bytes()));
    }

    /// Withdraw a resource from the cluster.
    pub fn unpublish(&self, id: &str) {
        self.locals.lock().remove(id);
        self.global.drop_key_value(&self.key(id));
    }

    /// The live resource, when this node owns it.
    pub fn local(&self, id: &str) -> Option<Arc<dyn Resource>> {
        self.locals.lock().get(id).cloned()
    }

    /// Resolve an id to a handle: local when owned here, otherwise a
    /// tunneled handle bound to the advertised owner.
    pub fn load(&self, id: &str) -> VmResult<ResourceHandle> {
        if let Some(local) = self.local(id) {
            return Ok(local.handle());
        }

        let encoded = self
            .global
            .get_key_value(&self.key(id))
            .ok_or_else(|| VmError::UnknownResource { id: id.to_string() })?;
        let bytes = hex::decode(encoded)
            .map_err(|_| VmError::UnknownResource { id: id.to_string() })?;
        let record = WireMap::from_bytes(&bytes).map_err(svi_wire::WireError::from)?;

        let inner_type = match record.get_map(keys::TYPE) {
            Ok(map) => svi_wire::types::produce_type(map)?,
            Err(_) => Type::Ambiguous,
        };
        let category = ResourceCategory::from_index(
            record.get_u64(keys::CATEGORY).map_err(svi_wire::WireError::from)?,
        )
        .unwrap_or(ResourceCategory::Tunneled);

        Ok(ResourceHandle::new(
            id,
            record.get_str(keys::OWNER).map_err(svi_wire::WireError::from)?,
            record.get_str(keys::NAME).map_err(svi_wire::WireError::from)?,
            inner_type,
            category,
        ))
    }

    /// True if the given handle's owner is this node.
    pub fn is_local(&self, handle: &ResourceHandle) -> bool {
        handle.owner() == self.global.node_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::single_threaded::LocalGlobalServices;

    struct Probe {
        id: String,
        owner: String,
    }

    impl Resource for Probe {
        fn category(&self) -> ResourceCategory {
            ResourceCategory::Tunneled
        }

        fn id(&self) -> String {
            self.id.clone()
        }

        fn owner(&self) -> String {
            self.owner.clone()
        }

        fn name(&self) -> String {
            "PROBE".to_string()
        }

        fn inner_type(&self) -> Type {
            Type::Opaque("PROBE".to_string())
        }

        fn perform(
            &self,
            _vm: &mut VirtualMachine,
            operation: &str,
            _operands: Vec<Reference>,
        ) -> VmResult<Vec<Reference>> {
            match operation {
                "ping" => Ok(vec![Reference::StringVal("pong".into())]),
                other => Err(VmError::invalid_resource_operation(&self.id, other)),
            }
        }
    }

    #[test]
    fn publish_then_load_resolves_locally() {
        let global: Arc<dyn GlobalServices> = Arc::new(LocalGlobalServices::new());
        let fabric = Fabric::new("svi::", Arc::clone(&global));

        let resource = Arc::new(Probe {
            id: "res-1".into(),
            owner: global.node_id(),
        });
        fabric.publish(resource);

        let handle = fabric.load("res-1").unwrap();
        assert!(fabric.is_local(&handle));
        assert_eq!(handle.name(), "PROBE");
        assert!(fabric.local("res-1").is_some());
    }

    #[test]
    fn foreign_ids_resolve_to_tunneled_handles() {
        let global: Arc<dyn GlobalServices> = Arc::new(LocalGlobalServices::new());
        let fabric = Fabric::new("svi::", Arc::clone(&global));

        // Simulate another node's advertisement.
        let foreign = ResourceHandle::new(
            "res-9",
            "some-other-node",
            "PROBE",
            Type::Opaque("PROBE".into()),
            ResourceCategory::Tunneled,
        );
        fabric.publish_handle(&foreign);

        let handle = fabric.load("res-9").unwrap();
        assert!(!fabric.is_local(&handle));
        assert_eq!(handle.owner(), "some-other-node");
        assert!(fabric.local("res-9").is_none());
    }

    #[test]
    fn unknown_ids_fail() {
        let global: Arc<dyn GlobalServices> = Arc::new(LocalGlobalServices::new());
        let fabric = Fabric::new("svi::", global);
        assert!(matches!(
            fabric.load("nope"),
            Err(VmError::UnknownResource { .. })
        ));
    }

    #[test]
    fn unpublish_withdraws() {
        let global: Arc<dyn GlobalServices> = Arc::new(LocalGlobalServices::new());
        let fabric = Fabric::new("svi::", Arc::clone(&global));
        let resource = Arc::new(Probe {
            id: "res-1".into(),
            owner: global.node_id(),
        });
        fabric.publish(resource);
        fabric.unpublish("res-1");
        assert!(fabric.load("res-1").is_err());
    }
}
