//! Cross-thread drivers.
//!
//! Storage and queue state are shared between the driving machine and its
//! worker threads; forks of a machine hand out clones of the same shared
//! structures. Parallelism comes from [`crate::runtime::worker::Worker`]
//! threads ticking the shared queue.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use svi_core::references::{LocationReference, Reference, ReturnValueMapHandle};
use svi_core::types::Type;

use crate::error::{VmError, VmResult};
use crate::machine::VirtualMachine;
use crate::runtime::single_threaded::LocalGlobalServices;
use crate::runtime::{
    GlobalServices, JobId, JobState, Queue, QueueContextId, QueueJob, SchedulingFilters,
    StorageBackend, StorageLock, Stream, StreamDriver,
};

/// Global services for a process hosting worker threads.
#[derive(Default)]
pub struct SharedGlobalServices {
    inner: LocalGlobalServices,
}

impl SharedGlobalServices {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GlobalServices for SharedGlobalServices {
    fn uuid(&self) -> String {
        self.inner.uuid()
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id()
    }

    fn current_time(&self) -> f64 {
        self.inner.current_time()
    }

    fn random(&self) -> f64 {
        self.inner.random()
    }

    fn node_id(&self) -> String {
        "multithreaded::localhost".to_string()
    }

    fn get_key_value(&self, key: &str) -> Option<String> {
        self.inner.get_key_value(key)
    }

    fn put_key_value(&self, key: &str, value: &str) {
        self.inner.put_key_value(key, value)
    }

    fn drop_key_value(&self, key: &str) {
        self.inner.drop_key_value(key)
    }

    fn scheduling_filters(&self) -> SchedulingFilters {
        self.inner.scheduling_filters()
    }

    fn apply_scheduling_filter(&self, key: &str, value: &str) {
        self.inner.apply_scheduling_filter(key, value)
    }

    fn remove_scheduling_filter(&self, key: &str) {
        self.inner.remove_scheduling_filter(key)
    }

    fn clear_scheduling_filters(&self) {
        self.inner.clear_scheduling_filters()
    }

    fn context_filters(&self) -> SchedulingFilters {
        self.inner.context_filters()
    }

    fn apply_context_filter(&self, key: &str, value: &str) {
        self.inner.apply_context_filter(key, value)
    }

    fn remove_context_filter(&self, key: &str) {
        self.inner.remove_context_filter(key)
    }

    fn clear_context_filters(&self) {
        self.inner.clear_context_filters()
    }
}

/// Storage whose map is shared across machine forks, with per-location
/// lock ownership.
pub struct SharedStorage {
    affinity: svi_core::Affinity,
    values: Arc<DashMap<String, Reference>>,
    types: Arc<DashMap<String, Type>>,
    locks: Arc<DashMap<String, String>>,
}

impl SharedStorage {
    pub fn new(affinity: svi_core::Affinity) -> Self {
        Self {
            affinity,
            values: Arc::new(DashMap::new()),
            types: Arc::new(DashMap::new()),
            locks: Arc::new(DashMap::new()),
        }
    }
}

impl StorageBackend for SharedStorage {
    fn load(&self, location: &LocationReference) -> VmResult<Reference> {
        self.values
            .get(&location.fq_name())
            .map(|entry| entry.value().clone())
            .ok_or_else(|| VmError::invalid_store_location(location.fq_name()))
    }

    fn store(&mut self, location: &LocationReference, value: Reference) -> VmResult<()> {
        let key = location.fq_name();
        if let Some(declared) = self.types.get(&key) {
            let actual = value.type_of();
            if !actual.is_assignable_to(declared.value()) {
                return Err(svi_core::SviError::type_mismatch(
                    declared.value().to_string(),
                    actual.to_string(),
                    format!("store {key}"),
                )
                .into());
            }
        }
        self.values.insert(key, value);
        Ok(())
    }

    fn has(&self, location: &LocationReference) -> bool {
        self.values.contains_key(&location.fq_name())
    }

    fn manages(&self, location: &LocationReference) -> bool {
        location.affinity() == self.affinity
    }

    fn drop_location(&mut self, location: &LocationReference) {
        self.values.remove(&location.fq_name());
        self.types.remove(&location.fq_name());
    }

    fn type_of(&self, location: &LocationReference) -> Option<Type> {
        self.types
            .get(&location.fq_name())
            .map(|entry| entry.value().clone())
    }

    fn typify(&mut self, location: &LocationReference, ty: Type) {
        self.types.insert(location.fq_name(), ty);
    }

    fn acquire(&mut self, location: &LocationReference) -> Option<Box<dyn StorageLock>> {
        let key = location.fq_name();
        let holder = uuid::Uuid::new_v4().to_string();

        // Claim by first-insert: the entry API inserts only when vacant.
        let claimed = match self.locks.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(holder.clone());
                true
            }
        };

        claimed.then(|| {
            Box::new(SharedLock {
                location: location.clone(),
                key,
                holder,
                locks: Arc::clone(&self.locks),
            }) as Box<dyn StorageLock>
        })
    }

    fn clear(&mut self) {
        self.values.clear();
        self.types.clear();
        self.locks.clear();
    }

    fn snapshot(&self) -> Vec<(String, Reference)> {
        self.values
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    fn restore_entries(&mut self, entries: &[(String, Reference)]) {
        for (key, value) in entries {
            self.types.insert(key.clone(), value.type_of());
            self.values.insert(key.clone(), value.clone());
        }
    }

    fn fork(&self) -> Box<dyn StorageBackend> {
        // Shared state is the point: forks see the same maps.
        Box::new(SharedStorage {
            affinity: self.affinity,
            values: Arc::clone(&self.values),
            types: Arc::clone(&self.types),
            locks: Arc::clone(&self.locks),
        })
    }
}

struct SharedLock {
    location: LocationReference,
    key: String,
    holder: String,
    locks: Arc<DashMap<String, String>>,
}

impl Drop for SharedLock {
    fn drop(&mut self) {
        self.locks
            .remove_if(&self.key, |_, holder| holder == &self.holder);
    }
}

impl StorageLock for SharedLock {
    fn location(&self) -> LocationReference {
        self.location.clone()
    }

    fn release(self: Box<Self>) {}
}

/// The shared backing state of a cross-thread queue.
#[derive(Default)]
struct SharedQueueState {
    backlog: Mutex<VecDeque<QueueJob>>,
    running: Mutex<HashMap<QueueContextId, usize>>,
    returns: Mutex<HashMap<QueueContextId, ReturnValueMapHandle>>,
    states: Mutex<HashMap<JobId, JobState>>,
}

/// A queue shared between a driving machine and its workers.
pub struct SharedQueue {
    next_id: AtomicU64,
    context: Mutex<QueueContextId>,
    state: Arc<SharedQueueState>,
}

impl SharedQueue {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            context: Mutex::new(String::new()),
            state: Arc::new(SharedQueueState::default()),
        }
    }

    /// A handle sharing this queue's backing state, for worker-side
    /// machines.
    pub fn share(&self) -> SharedQueue {
        SharedQueue {
            next_id: AtomicU64::new(0),
            context: Mutex::new(self.context()),
            state: Arc::clone(&self.state),
        }
    }

}

impl Default for SharedQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Queue for SharedQueue {
    fn set_context(&self, context: &QueueContextId) {
        *self.context.lock() = context.clone();
    }

    fn context(&self) -> QueueContextId {
        self.context.lock().clone()
    }

    fn next_job_id(&self) -> JobId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn push(&self, _vm: &mut VirtualMachine, job: QueueJob) -> VmResult<()> {
        self.state.states.lock().insert(job.id, JobState::Pending);
        self.state.backlog.lock().push_back(job);
        Ok(())
    }

    fn pop(&self, filters: &SchedulingFilters) -> Option<QueueJob> {
        let mut backlog = self.state.backlog.lock();
        let index = backlog.iter().position(|job| job.matches_filters(filters))?;
        let job = backlog.remove(index)?;
        drop(backlog);

        *self
            .state
            .running
            .lock()
            .entry(job.context.clone())
            .or_insert(0) += 1;
        self.set_job_state(job.id, JobState::Running);
        Some(job)
    }

    fn pending(&self, context: &QueueContextId) -> usize {
        self.state
            .backlog
            .lock()
            .iter()
            .filter(|job| &job.context == context)
            .count()
    }

    fn running(&self, context: &QueueContextId) -> usize {
        self.state
            .running
            .lock()
            .get(context)
            .copied()
            .unwrap_or(0)
    }

    fn returns(&self, context: &QueueContextId) -> ReturnValueMapHandle {
        self.state
            .returns
            .lock()
            .entry(context.clone())
            .or_default()
            .clone()
    }

    fn deliver(&self, context: &QueueContextId, id: JobId, value: Reference) {
        self.state
            .returns
            .lock()
            .entry(context.clone())
            .or_default()
            .insert(id, value);
    }

    fn job_state(&self, id: JobId) -> JobState {
        self.state
            .states
            .lock()
            .get(&id)
            .copied()
            .unwrap_or(JobState::Unknown)
    }

    fn set_job_state(&self, id: JobId, state: JobState) {
        self.state.states.lock().insert(id, state);
    }

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
        let mut running = self.state.running.lock();
        if let Some(count) = running.get_mut(context) {
            *count = count.saturating_sub(1);
        }
    }
}

/// A mutex-guarded in-memory stream.
pub struct SharedStream {
    id: String,
    inner_type: Type,
    items: Mutex<VecDeque<Reference>>,
    open: Mutex<bool>,
}

impl SharedStream {
    pub fn new(id: impl Into<String>, inner_type: Type) -> Self {
        Self {
            id: id.into(),
            inner_type,
            items: Mutex::new(VecDeque::new()),
            open: Mutex::new(true),
        }
    }
}

impl Stream for SharedStream {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn inner_type(&self) -> Type {
        self.inner_type.clone()
    }

    fn open(&self) {
        *self.open.lock() = true;
    }

    fn close(&self) {
        *self.open.lock() = false;
    }

    fn is_open(&self) -> bool {
        *self.open.lock()
    }

    fn push(&self, value: Reference) -> VmResult<()> {
        self.items.lock().push_back(value);
        Ok(())
    }

    fn pop(&self) -> VmResult<Reference> {
        self.items
            .lock()
            .pop_front()
            .ok_or_else(|| VmError::stream_empty(&self.id))
    }

    fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

/// Opens shared streams, one instance per id across all threads.
#[derive(Default)]
pub struct SharedStreamDriver {
    streams: DashMap<String, Arc<dyn Stream>>,
}

impl SharedStreamDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StreamDriver for SharedStreamDriver {
    fn open(&self, id: &str, inner_type: &Type) -> Arc<dyn Stream> {
        self.streams
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(SharedStream::new(id, inner_type.clone())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use svi_core::references::{FunctionBackend, FunctionCall};
    use svi_core::scope::ScopeFrame;
    use svi_core::{Affinity, State};

    fn shared(name: &str) -> LocationReference {
        LocationReference::new(Affinity::Shared, name)
    }

    fn job(id: JobId, context: &str, filters: &[(&str, &str)]) -> QueueJob {
        QueueJob {
            id,
            context: context.to_string(),
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
    fn forks_share_the_same_values() {
        let mut storage = SharedStorage::new(Affinity::Shared);
        let mut forked = storage.fork();
        storage.store(&shared("x"), Reference::Number(9.0)).unwrap();
        assert_eq!(forked.load(&shared("x")).unwrap(), Reference::Number(9.0));

        forked.store(&shared("x"), Reference::Number(10.0)).unwrap();
        assert_eq!(storage.load(&shared("x")).unwrap(), Reference::Number(10.0));
    }

    #[test]
    fn locks_are_exclusive_across_forks() {
        let mut storage = SharedStorage::new(Affinity::Shared);
        let mut forked = storage.fork();

        let lock = storage.acquire(&shared("x")).expect("acquire");
        assert!(forked.acquire(&shared("x")).is_none());
        lock.release();
        assert!(forked.acquire(&shared("x")).is_some());
    }

    #[test]
    fn pop_skips_unmatched_filters() {
        let queue = SharedQueue::new();
        let worker = queue.share();

        queue.state.backlog.lock().push_back(job(0, "ctx", &[("zone", "b")]));
        queue.state.backlog.lock().push_back(job(1, "ctx", &[]));

        let filters: SchedulingFilters =
            [("zone".to_string(), "a".to_string())].into_iter().collect();
        let claimed = worker.pop(&filters).expect("unfiltered job");
        assert_eq!(claimed.id, 1);
        // The filtered job stays queued.
        assert_eq!(worker.pending(&"ctx".to_string()), 1);
    }

    #[test]
    fn finish_decrements_running_and_delivers() {
        let queue = SharedQueue::new();
        queue.state.backlog.lock().push_back(job(7, "ctx", &[]));
        queue.set_job_state(7, JobState::Pending);

        let claimed = queue.pop(&SchedulingFilters::new()).unwrap();
        assert_eq!(queue.running(&"ctx".to_string()), 1);
        assert_eq!(queue.job_state(7), JobState::Running);

        queue.finish(&claimed.context, claimed.id, Ok(Reference::Number(1.0)));
        assert_eq!(queue.running(&"ctx".to_string()), 0);
        assert_eq!(queue.job_state(7), JobState::Complete);
        assert_eq!(
            queue.returns(&"ctx".to_string()).get(7),
            Some(Reference::Number(1.0))
        );
    }
}
