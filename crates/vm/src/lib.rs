//! # svi-vm
//!
//! The SVI virtual machine: a tag-dispatched interpreter over the typed,
//! stack-less SVI register IR, with dynamic scope chains, affinity-routed
//! storage backends, ordered streams, and a distributed work queue.
//!
//! A machine is single-threaded within its node; parallelism comes from
//! deferred calls captured with their scope and state, pushed onto the
//! queue, and executed by workers that restore a forked machine from the
//! capture. The `drain` barrier is the only cross-job ordering guarantee.

pub mod debug;
pub mod error;
pub mod exec;
pub mod machine;
pub mod pipeline;
pub mod prologue;
pub mod runtime;

pub use debug::{DebugChannel, DebugCommand, Debugger, LoopbackChannel};
pub use error::{VmError, VmResult};
pub use exec::Outcome;
pub use machine::VirtualMachine;
pub use pipeline::Pipeline;
pub use runtime::local_streams::{BufferSink, OutputSink, StdSink};
pub use runtime::worker::{current_worker_id, spawn_workers, Worker};
pub use runtime::{
    GlobalServices, JobId, JobState, Queue, QueueContextId, QueueJob, SchedulingFilters,
    ShutdownFlag, StorageBackend, StorageLock, Stream, StreamDriver,
};
