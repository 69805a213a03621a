//! # svi-core
//!
//! The value model and front-end of the SVI virtual machine: the structural
//! type lattice, runtime reference variants, the instruction set, dynamic
//! scope frames, program state, and the textual SVI parser.
//!
//! Everything in this crate is runtime-agnostic data: storage, queueing,
//! and execution live in `svi-vm`, and binary serialization in `svi-wire`.

pub mod config;
pub mod error;
pub mod instructions;
pub mod parser;
pub mod references;
pub mod scope;
pub mod state;
pub mod types;

pub use config::Config;
pub use error::{SviError, SviResult};
pub use instructions::{Instruction, Instructions, Position, Tag};
pub use references::{
    Affinity, EnumerationHandle, FunctionBackend, FunctionCall, FunctionReference,
    LocationReference, MapHandle, ObjectHandle, Reference, ReferenceTag, ResourceCategory,
    ResourceHandle, ReturnValueMapHandle, StreamHandle,
};
pub use scope::{ExceptionHandler, HandlerSelector, ScopeFrame};
pub use state::State;
pub use types::{Intrinsic, ObjectType, Type};
