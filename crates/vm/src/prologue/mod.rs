//! The bundled standard provider.
//!
//! A small set of native functions every deployment gets by default:
//! numeric helpers, randomness, wall-clock time, range construction, and
//! the `TAG` resource that steers scheduling while held.

use std::sync::Arc;

use svi_core::references::{
    EnumerationHandle, FunctionCall, Reference, ResourceCategory, ResourceHandle,
};
use svi_core::types::Type;

use crate::error::{VmError, VmResult};
use crate::machine::VirtualMachine;
use crate::runtime::fabric::Resource;
use crate::runtime::provider::{Provider, ProviderFunction};
use crate::runtime::{GlobalServices, SchedulingFilters};

/// The standard native-function provider.
pub struct PrologueProvider {
    global: Arc<dyn GlobalServices>,
}

impl PrologueProvider {
    pub fn new(global: Arc<dyn GlobalServices>) -> Self {
        Self { global }
    }

    fn argument(call: &FunctionCall, index: usize) -> VmResult<&Reference> {
        call.vector()
            .get(index)
            .map(|(_, value)| value)
            .ok_or_else(|| VmError::queue(format!("{} missing argument {index}", call.name())))
    }

    fn number_argument(call: &FunctionCall, index: usize) -> VmResult<f64> {
        match Self::argument(call, index)? {
            Reference::Number(value) => Ok(*value),
            other => Err(svi_core::SviError::invalid_operand(
                "NUMBER".to_string(),
                other.to_string(),
            )
            .into()),
        }
    }

    fn string_argument(call: &FunctionCall, index: usize) -> VmResult<String> {
        match Self::argument(call, index)? {
            Reference::StringVal(value) => Ok(value.clone()),
            other => Err(svi_core::SviError::invalid_operand(
                "STRING".to_string(),
                other.to_string(),
            )
            .into()),
        }
    }
}

impl Provider for PrologueProvider {
    fn name(&self) -> &str {
        "prologue"
    }

    fn load_function(&self, name: &str) -> Option<ProviderFunction> {
        let function = match name {
            "FLOOR" => ProviderFunction::new("FLOOR", vec![Type::Number], Type::Number),
            "CEILING" => ProviderFunction::new("CEILING", vec![Type::Number], Type::Number),
            "RANDOM" => ProviderFunction::new("RANDOM", vec![], Type::Number),
            "TIME" => ProviderFunction::new("TIME", vec![], Type::Number),
            "RANGE" => ProviderFunction::new(
                "RANGE",
                vec![Type::Number, Type::Number, Type::Number],
                Type::Enumerable(Box::new(Type::Number)),
            ),
            "TAG" => ProviderFunction::new(
                "TAG",
                vec![Type::String, Type::String],
                Type::Resource(Box::new(Type::Opaque("TAG".to_string()))),
            ),
            _ => return None,
        };
        Some(function)
    }

    fn call(&self, vm: &mut VirtualMachine, call: &FunctionCall) -> VmResult<Reference> {
        match call.name() {
            "FLOOR" => Ok(Reference::Number(Self::number_argument(call, 0)?.floor())),
            "CEILING" => Ok(Reference::Number(Self::number_argument(call, 0)?.ceil())),
            "RANDOM" => Ok(Reference::Number(self.global.random())),
            "TIME" => Ok(Reference::Number(self.global.current_time())),
            "RANGE" => {
                let start = Self::number_argument(call, 0)?;
                let end = Self::number_argument(call, 1)?;
                let step = Self::number_argument(call, 2)?;

                // Half-open walk: floor(|end - start| / |step|) elements
                // from start, stepping by the signed step. A step pointing
                // away from the end yields an empty range.
                let span = ((end - start).abs() / step.abs()).floor();
                let mut len = if span.is_finite() { span as usize } else { 0 };
                if (start > end && step > 0.0) || (start < end && step < 0.0) {
                    len = 0;
                }

                let range = EnumerationHandle::new(Type::Number);
                let mut cursor = start;
                for _ in 0..len {
                    range.append(Reference::Number(cursor));
                    cursor += step;
                }
                Ok(Reference::Enumeration(range))
            }
            "TAG" => {
                let key = Self::string_argument(call, 0)?;
                let value = Self::string_argument(call, 1)?;
                let resource = Arc::new(TagResource {
                    id: format!("tag-{}", self.global.uuid()),
                    owner: self.global.node_id(),
                    key,
                    value,
                });
                vm.fabric().publish(Arc::clone(&resource) as Arc<dyn Resource>);
                Ok(Reference::Resource(resource.handle()))
            }
            other => Err(VmError::unknown_function(other)),
        }
    }
}

/// A scheduling-filter resource: while held in a `with` block, every call
/// pushed from this node carries the tag, and the node offers it to
/// arriving jobs.
pub struct TagResource {
    id: String,
    owner: String,
    key: String,
    value: String,
}

impl TagResource {
    pub fn new(
        id: impl Into<String>,
        owner: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            owner: owner.into(),
            key: key.into(),
            value: value.into(),
        }
    }
}

impl Resource for TagResource {
    fn category(&self) -> ResourceCategory {
        ResourceCategory::Replicated
    }

    fn id(&self) -> String {
        self.id.clone()
    }

    fn owner(&self) -> String {
        self.owner.clone()
    }

    fn name(&self) -> String {
        "TAG".to_string()
    }

    fn inner_type(&self) -> Type {
        Type::Opaque("TAG".to_string())
    }

    fn scheduling_filters(&self) -> SchedulingFilters {
        [(self.key.clone(), self.value.clone())].into_iter().collect()
    }

    fn perform(
        &self,
        _vm: &mut VirtualMachine,
        operation: &str,
        _operands: Vec<Reference>,
    ) -> VmResult<Vec<Reference>> {
        Err(VmError::invalid_resource_operation(&self.id, operation))
    }

    fn acquire(&self, vm: &mut VirtualMachine) -> VmResult<()> {
        vm.global().apply_scheduling_filter(&self.key, &self.value);
        vm.global().apply_context_filter(&self.key, &self.value);
        Ok(())
    }

    fn release(&self, vm: &mut VirtualMachine) -> VmResult<()> {
        vm.global().remove_scheduling_filter(&self.key);
        vm.global().remove_context_filter(&self.key);
        Ok(())
    }

    fn replicate(&self) -> VmResult<Arc<dyn Resource>> {
        Ok(Arc::new(TagResource {
            id: self.id.clone(),
            owner: self.owner.clone(),
            key: self.key.clone(),
            value: self.value.clone(),
        }))
    }

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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::single_threaded::LocalGlobalServices;

    #[test]
    fn signatures_resolve_by_name() {
        let provider = PrologueProvider::new(Arc::new(LocalGlobalServices::new()));
        assert!(provider.load_function("FLOOR").is_some());
        assert!(provider.load_function("RANGE").is_some());
        assert!(provider.load_function("NOPE").is_none());
    }

    #[test]
    fn tag_resources_replicate() {
        let tag = TagResource::new("tag-1", "node", "zone", "a");
        assert!(tag.replicate().is_ok());
        assert_eq!(
            tag.scheduling_filters().get("zone").map(String::as_str),
            Some("a")
        );
    }
}
