//! Runtime error types.
//!
//! These are internal machine failures, fatal to the owning frame. The
//! user-level exception mechanism (`raise`/`pushexhandler`) is a control
//! flow feature, not an error: only an *unhandled* raise surfaces here.

use thiserror::Error;

/// Errors raised by the virtual machine and its drivers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VmError {
    /// A value-model failure (typing, arity, container misuse).
    #[error(transparent)]
    Core(#[from] svi_core::SviError),

    /// A serialization failure while moving an object across the wire.
    #[error(transparent)]
    Wire(#[from] svi_wire::WireError),

    /// A load from a location no backend has a value for.
    #[error("invalid store location: {location}")]
    InvalidStoreLocation { location: String },

    /// No storage backend manages the location's affinity.
    #[error("no storage backend manages location {location}")]
    UnroutableLocation { location: String },

    /// Division with a zero divisor.
    #[error("division by zero")]
    DivideByZero,

    /// A pop from an empty stream.
    #[error("stream {stream} is empty")]
    StreamEmpty { stream: String },

    /// An operation a resource does not support.
    #[error("invalid operation `{operation}` on resource {resource}")]
    InvalidResourceOperation {
        resource: String,
        operation: String,
    },

    /// A local replica was requested of a non-replicable resource.
    #[error("cannot clone non-replicable resource {resource}")]
    AttemptedCloneOfNonReplicableResource { resource: String },

    /// A file-backed input that could not be opened.
    #[error("invalid or missing file path: {path}")]
    InvalidOrMissingFilePath { path: String },

    /// A function name that resolves through no backend.
    #[error("unknown function f:{name}")]
    UnknownFunction { name: String },

    /// A resource id that resolves through no registry or fabric entry.
    #[error("unknown resource {id}")]
    UnknownResource { id: String },

    /// A stream id used before `streaminit` opened it.
    #[error("unknown stream {id}")]
    UnknownStream { id: String },

    /// A user-level `raise` that escaped every handler.
    #[error("unhandled exception with code {code}")]
    UnhandledException { code: f64 },

    /// A thread-context lookup from an OS thread no worker registered.
    #[error("foreign thread: {thread} is not a registered worker")]
    ForeignThread { thread: String },

    /// A wait loop interrupted by the process-wide shutdown flag.
    #[error("interrupted by shutdown while {waiting_on}")]
    Shutdown { waiting_on: String },

    /// An operation against a machine with no loaded program.
    #[error("virtual machine is not initialized")]
    NotInitialized,

    /// A queue-level failure.
    #[error("queue: {message}")]
    Queue { message: String },
}

impl VmError {
    pub fn invalid_store_location(location: impl Into<String>) -> Self {
        Self::InvalidStoreLocation {
            location: location.into(),
        }
    }

    pub fn stream_empty(stream: impl Into<String>) -> Self {
        Self::StreamEmpty {
            stream: stream.into(),
        }
    }

    pub fn invalid_resource_operation(
        resource: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        Self::InvalidResourceOperation {
            resource: resource.into(),
            operation: operation.into(),
        }
    }

    pub fn unknown_function(name: impl Into<String>) -> Self {
        Self::UnknownFunction { name: name.into() }
    }

    pub fn shutdown(waiting_on: impl Into<String>) -> Self {
        Self::Shutdown {
            waiting_on: waiting_on.into(),
        }
    }

    pub fn queue(message: impl Into<String>) -> Self {
        Self::Queue {
            message: message.into(),
        }
    }

    /// True if the failure came from the user program rather than the
    /// machine or its drivers.
    pub fn is_user_fault(&self) -> bool {
        matches!(
            self,
            VmError::Core(_)
                | VmError::DivideByZero
                | VmError::StreamEmpty { .. }
                | VmError::UnhandledException { .. }
                | VmError::InvalidStoreLocation { .. }
                | VmError::UnknownFunction { .. }
        )
    }
}

/// Result type for VM operations.
pub type VmResult<T> = std::result::Result<T, VmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_fault_classification() {
        assert!(VmError::DivideByZero.is_user_fault());
        assert!(VmError::UnhandledException { code: 42.0 }.is_user_fault());
        assert!(!VmError::NotInitialized.is_user_fault());
        assert!(!VmError::shutdown("drain").is_user_fault());
    }

    #[test]
    fn core_errors_convert() {
        let err: VmError = svi_core::SviError::malformed("bad").into();
        assert!(matches!(err, VmError::Core(_)));
    }
}
