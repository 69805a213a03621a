//! Runtime driver interfaces.
//!
//! The machine talks to its environment exclusively through these traits:
//! storage backends, the job queue, streams, resources, native-function
//! providers, and the global services a node offers. Concrete drivers live
//! in the sibling modules ([`single_threaded`], [`multi_threaded`],
//! [`kv`]).

pub mod fabric;
pub mod kv;
pub mod local_streams;
pub mod multi_threaded;
pub mod provider;
pub mod single_threaded;
pub mod worker;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use svi_core::references::{FunctionCall, LocationReference, Reference, ReturnValueMapHandle};
use svi_core::scope::ScopeFrame;
use svi_core::types::Type;
use svi_core::State;

use crate::error::VmResult;
use crate::machine::VirtualMachine;

/// Scheduling filters: string key/value pairs a job must match against a
/// worker's context filters.
pub type SchedulingFilters = BTreeMap<String, String>;

/// Monotonic job identifier.
pub type JobId = u64;

/// Queue context identifier.
pub type QueueContextId = String;

/// The lifecycle of a deferred job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Complete,
    Error,
    Unknown,
}

impl JobState {
    pub fn name(self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Complete => "COMPLETE",
            JobState::Error => "ERROR",
            JobState::Unknown => "UNKNOWN",
        }
    }

    pub fn from_index(index: u64) -> JobState {
        match index {
            0 => JobState::Pending,
            1 => JobState::Running,
            2 => JobState::Complete,
            3 => JobState::Error,
            _ => JobState::Unknown,
        }
    }

    pub fn index(self) -> u64 {
        match self {
            JobState::Pending => 0,
            JobState::Running => 1,
            JobState::Complete => 2,
            JobState::Error => 3,
            JobState::Unknown => 4,
        }
    }

    /// True once the job can no longer produce effects.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Complete | JobState::Error)
    }
}

/// A deferred call captured with the environment needed to run it
/// elsewhere: the call itself, the scope chain, the program state, a
/// snapshot of the pushing node's local store, and the scheduling
/// filters.
#[derive(Debug, Clone)]
pub struct QueueJob {
    pub id: JobId,
    pub context: QueueContextId,
    pub call: FunctionCall,
    pub scope: ScopeFrame,
    pub state: State,
    pub locals: Vec<(String, Reference)>,
    pub filters: SchedulingFilters,
}

impl QueueJob {
    /// True iff every filter on the job is satisfied by the worker's
    /// context filters.
    pub fn matches_filters(&self, current: &SchedulingFilters) -> bool {
        self.filters
            .iter()
            .all(|(key, value)| current.get(key) == Some(value))
    }
}

/// Node-level services: identity, time, randomness, a small shared
/// key-value surface, and the scheduling-filter state.
pub trait GlobalServices: Send + Sync {
    fn uuid(&self) -> String;
    fn next_id(&self) -> u64;
    fn current_time(&self) -> f64;
    fn random(&self) -> f64;
    fn node_id(&self) -> String;

    fn get_key_value(&self, key: &str) -> Option<String>;
    fn put_key_value(&self, key: &str, value: &str);
    fn drop_key_value(&self, key: &str);

    /// Filters stamped onto every job this node pushes.
    fn scheduling_filters(&self) -> SchedulingFilters;
    fn apply_scheduling_filter(&self, key: &str, value: &str);
    fn remove_scheduling_filter(&self, key: &str);
    fn clear_scheduling_filters(&self);

    /// Filters describing what this node offers to arriving jobs.
    fn context_filters(&self) -> SchedulingFilters;
    fn apply_context_filter(&self, key: &str, value: &str);
    fn remove_context_filter(&self, key: &str);
    fn clear_context_filters(&self);
}

/// A handle on an acquired location lock. Dropping the handle without
/// calling [`StorageLock::release`] also releases it.
pub trait StorageLock: Send {
    fn location(&self) -> LocationReference;
    fn release(self: Box<Self>);
}

/// A variable storage backend.
///
/// The machine routes each location to the first registered backend (in
/// reverse registration order) whose [`StorageBackend::manages`] answers
/// true.
pub trait StorageBackend: Send {
    /// Load the value of a location.
    fn load(&self, location: &LocationReference) -> VmResult<Reference>;

    /// Store a value, enforcing the location's declared type if one was
    /// recorded by [`StorageBackend::typify`].
    fn store(&mut self, location: &LocationReference, value: Reference) -> VmResult<()>;

    /// True if this backend holds a value for the location.
    fn has(&self, location: &LocationReference) -> bool;

    /// True if this backend should be used for the location.
    fn manages(&self, location: &LocationReference) -> bool;

    /// Forget the value of a location, if present.
    fn drop_location(&mut self, location: &LocationReference);

    /// The declared type of a location, if one was recorded.
    fn type_of(&self, location: &LocationReference) -> Option<Type>;

    /// Constrain a location to a type.
    fn typify(&mut self, location: &LocationReference, ty: Type);

    /// Try to acquire the location's lock without blocking.
    fn acquire(&mut self, location: &LocationReference) -> Option<Box<dyn StorageLock>>;

    /// Forget every stored value.
    fn clear(&mut self);

    /// Every stored value, keyed by affinity-prefixed name. Used to
    /// capture a node's private store into a queue job.
    fn snapshot(&self) -> Vec<(String, Reference)>;

    /// Seed the backend with captured entries (declared types are
    /// re-inferred on the receiving side).
    fn restore_entries(&mut self, entries: &[(String, Reference)]);

    /// An independent backend of the same class. Node-private state is
    /// copied; genuinely shared state stays shared.
    fn fork(&self) -> Box<dyn StorageBackend>;
}

/// The deferred-call queue.
pub trait Queue: Send + Sync {
    /// Focus the queue on a context. Contexts isolate batches of jobs so
    /// they can be awaited independently.
    fn set_context(&self, context: &QueueContextId);

    fn context(&self) -> QueueContextId;

    /// Allocate the next job id.
    fn next_job_id(&self) -> JobId;

    /// Push a job. A synchronous driver may execute it immediately on the
    /// pushing machine.
    fn push(&self, vm: &mut VirtualMachine, job: QueueJob) -> VmResult<()>;

    /// Claim the next job whose filters match the given context filters.
    fn pop(&self, filters: &SchedulingFilters) -> Option<QueueJob>;

    /// Number of jobs not yet claimed in a context.
    fn pending(&self, context: &QueueContextId) -> usize;

    /// Number of claimed jobs still running in a context.
    fn running(&self, context: &QueueContextId) -> usize;

    /// The return values delivered for a context, keyed by job id.
    fn returns(&self, context: &QueueContextId) -> ReturnValueMapHandle;

    /// Record a delivered return value.
    fn deliver(&self, context: &QueueContextId, id: JobId, value: Reference);

    fn job_state(&self, id: JobId) -> JobState;

    fn set_job_state(&self, id: JobId, state: JobState);

    /// Settle a claimed job: deliver its value (or record the error) and
    /// move it to a terminal state.
    fn finish(&self, context: &QueueContextId, id: JobId, outcome: VmResult<Reference>) {
        match outcome {
            Ok(value) => {
                self.deliver(context, id, value);
                self.set_job_state(id, JobState::Complete);
            }
            Err(err) => {
                tracing::error!(job = id, %err, "deferred job failed");
                self.set_job_state(id, JobState::Error);
            }
        }
    }
}

/// An ordered pipe of references.
pub trait Stream: Send + Sync {
    fn id(&self) -> String;
    fn inner_type(&self) -> Type;
    fn open(&self);
    fn close(&self);
    fn is_open(&self) -> bool;
    fn push(&self, value: Reference) -> VmResult<()>;
    /// Fails with `StreamEmpty` when nothing is buffered.
    fn pop(&self) -> VmResult<Reference>;
    fn is_empty(&self) -> bool;
}

/// Opens streams by id, creating them on first use.
pub trait StreamDriver: Send + Sync {
    fn open(&self, id: &str, inner_type: &Type) -> Arc<dyn Stream>;
}

/// Cooperative shutdown for every wait loop in the system.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use svi_core::references::FunctionBackend;

    fn job_with_filters(filters: &[(&str, &str)]) -> QueueJob {
        QueueJob {
            id: 1,
            context: "ctx".into(),
            call: FunctionCall::new(FunctionBackend::Inline, "f", vec![], Type::Void),
            scope: ScopeFrame::root("root"),
            state: State::new(vec![]).expect("empty program"),
            locals: Vec::new(),
            filters: filters
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn filter_matching_requires_every_key() {
        let job = job_with_filters(&[("zone", "a"), ("gpu", "yes")]);

        let mut worker: SchedulingFilters = BTreeMap::new();
        worker.insert("zone".into(), "a".into());
        assert!(!job.matches_filters(&worker));

        worker.insert("gpu".into(), "yes".into());
        worker.insert("extra".into(), "ignored".into());
        assert!(job.matches_filters(&worker));
    }

    #[test]
    fn unfiltered_jobs_match_anywhere() {
        let job = job_with_filters(&[]);
        assert!(job.matches_filters(&BTreeMap::new()));
    }

    #[test]
    fn job_state_round_trips() {
        for state in [
            JobState::Pending,
            JobState::Running,
            JobState::Complete,
            JobState::Error,
            JobState::Unknown,
        ] {
            assert_eq!(JobState::from_index(state.index()), state);
        }
        assert!(JobState::Complete.is_terminal());
        assert!(!JobState::Running.is_terminal());
    }

    #[test]
    fn shutdown_flag_is_shared() {
        let flag = ShutdownFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_triggered());
        flag.trigger();
        assert!(clone.is_triggered());
    }
}
