//! Native-function provider plug-ins.
//!
//! A provider supplies functions the loaded program can call as `f:NAME`
//! when the name misses the inline function table. Provider calls run
//! synchronously on the calling node.

use svi_core::references::{FunctionBackend, FunctionCall, FunctionReference, Reference};
use svi_core::types::Type;

use crate::error::VmResult;
use crate::machine::VirtualMachine;

/// The signature of a provider-backed function.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderFunction {
    pub name: String,
    pub formals: Vec<Type>,
    pub returns: Type,
}

impl ProviderFunction {
    pub fn new(name: impl Into<String>, formals: Vec<Type>, returns: Type) -> Self {
        Self {
            name: name.into(),
            formals,
            returns,
        }
    }

    /// The callable reference for this signature.
    pub fn reference(&self) -> FunctionReference {
        FunctionReference::new(
            FunctionBackend::Provider,
            self.name.clone(),
            self.formals.clone(),
            self.returns.clone(),
        )
    }
}

/// A plug-in supplying native functions to the machine.
pub trait Provider: Send + Sync {
    /// A stable name for diagnostics.
    fn name(&self) -> &str;

    /// Resolve one of this provider's functions by name, or `None` if the
    /// name is not ours.
    fn load_function(&self, name: &str) -> Option<ProviderFunction>;

    /// Execute a call to one of this provider's functions.
    fn call(&self, vm: &mut VirtualMachine, call: &FunctionCall) -> VmResult<Reference>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_carries_the_signature() {
        let function = ProviderFunction::new("FLOOR", vec![Type::Number], Type::Number);
        let reference = function.reference();
        assert_eq!(reference.backend(), FunctionBackend::Provider);
        assert_eq!(reference.formals(), &[Type::Number]);
        assert_eq!(reference.returns(), &Type::Number);
    }
}
