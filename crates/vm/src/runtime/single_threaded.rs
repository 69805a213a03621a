//! Single-threaded, synchronous drivers.
//!
//! Used for development and testing: no external services, no
//! parallelism. The queue is not a queue at all: jobs execute on the
//! pushing machine the moment they are pushed.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use svi_core::references::{LocationReference, Reference, ReturnValueMapHandle};
use svi_core::types::Type;

use crate::error::{VmError, VmResult};
use crate::machine::VirtualMachine;
use crate::runtime::{
    GlobalServices, JobId, JobState, Queue, QueueContextId, QueueJob, SchedulingFilters,
    StorageBackend, StorageLock, Stream, StreamDriver,
};

/// Local-only global services backed by process state.
#[derive(Default)]
pub struct LocalGlobalServices {
    next_id: AtomicU64,
    kv: Mutex<HashMap<String, String>>,
    scheduling: Mutex<SchedulingFilters>,
    context: Mutex<SchedulingFilters>,
}

impl LocalGlobalServices {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GlobalServices for LocalGlobalServices {
    fn uuid(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn current_time(&self) -> f64 {
        chrono::Utc::now().timestamp_millis() as f64 / 1000.0
    }

    fn random(&self) -> f64 {
        rand::random::<f64>()
    }

    fn node_id(&self) -> String {
        "singlethreaded::localhost".to_string()
    }

    fn get_key_value(&self, key: &str) -> Option<String> {
        self.kv.lock().get(key).cloned()
    }

    fn put_key_value(&self, key: &str, value: &str) {
        self.kv.lock().insert(key.to_string(), value.to_string());
    }

    fn drop_key_value(&self, key: &str) {
        self.kv.lock().remove(key);
    }

    fn scheduling_filters(&self) -> SchedulingFilters {
        self.scheduling.lock().clone()
    }

    fn apply_scheduling_filter(&self, key: &str, value: &str) {
        tracing::debug!(key, value, "apply scheduling filter");
        self.scheduling
            .lock()
            .insert(key.to_string(), value.to_string());
    }

    fn remove_scheduling_filter(&self, key: &str) {
        self.scheduling.lock().remove(key);
    }

    fn clear_scheduling_filters(&self) {
        self.scheduling.lock().clear();
    }

    fn context_filters(&self) -> SchedulingFilters {
        self.context.lock().clone()
    }

    fn apply_context_filter(&self, key: &str, value: &str) {
        self.context
            .lock()
            .insert(key.to_string(), value.to_string());
    }

    fn remove_context_filter(&self, key: &str) {
        self.context.lock().remove(key);
    }

    fn clear_context_filters(&self) {
        self.context.lock().clear();
    }
}

/// A plain-map storage backend for one affinity.
pub struct Storage {
    affinity: svi_core::Affinity,
    values: HashMap<String, Reference>,
    types: HashMap<String, Type>,
    held: Arc<Mutex<HashSet<String>>>,
}

impl Storage {
    pub fn new(affinity: svi_core::Affinity) -> Self {
        Self {
            affinity,
            values: HashMap::new(),
            types: HashMap::new(),
            held: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

impl StorageBackend for Storage {
    fn load(&self, location: &LocationReference) -> VmResult<Reference> {
        self.values
            .get(&location.fq_name())
            .cloned()
            .ok_or_else(|| VmError::invalid_store_location(location.fq_name()))
    }

    fn store(&mut self, location: &LocationReference, value: Reference) -> VmResult<()> {
        let key = location.fq_name();
        if let Some(declared) = self.types.get(&key) {
            let actual = value.type_of();
            if !actual.is_assignable_to(declared) {
                return Err(svi_core::SviError::type_mismatch(
                    declared.to_string(),
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
        self.types.get(&location.fq_name()).cloned()
    }

    fn typify(&mut self, location: &LocationReference, ty: Type) {
        self.types.insert(location.fq_name(), ty);
    }

    fn acquire(&mut self, location: &LocationReference) -> Option<Box<dyn StorageLock>> {
        // Locks are trivial without concurrency, but the bookkeeping keeps
        // the interface honest: a held location cannot be re-acquired.
        let key = location.fq_name();
        if !self.held.lock().insert(key.clone()) {
            return None;
        }
        Some(Box::new(Lock {
            location: location.clone(),
            key,
            held: Arc::clone(&self.held),
        }))
    }

    fn clear(&mut self) {
        self.values.clear();
        self.types.clear();
        self.held.lock().clear();
    }

    fn snapshot(&self) -> Vec<(String, Reference)> {
        self.values
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    fn restore_entries(&mut self, entries: &[(String, Reference)]) {
        for (key, value) in entries {
            self.types.insert(key.clone(), value.type_of());
            self.values.insert(key.clone(), value.clone());
        }
    }

    fn fork(&self) -> Box<dyn StorageBackend> {
        Box::new(Storage {
            affinity: self.affinity,
            values: self.values.clone(),
            types: self.types.clone(),
            held: Arc::new(Mutex::new(HashSet::new())),
        })
    }
}

struct Lock {
    location: LocationReference,
    key: String,
    held: Arc<Mutex<HashSet<String>>>,
}

impl Drop for Lock {
    fn drop(&mut self) {
        self.held.lock().remove(&self.key);
    }
}

impl StorageLock for Lock {
    fn location(&self) -> LocationReference {
        self.location.clone()
    }

    fn release(self: Box<Self>) {}
}

/// A queue that executes every job inline on the pushing machine.
pub struct ImmediateQueue {
    next_id: AtomicU64,
    context: Mutex<QueueContextId>,
    returns: Mutex<HashMap<QueueContextId, ReturnValueMapHandle>>,
    states: Mutex<HashMap<JobId, JobState>>,
    backlog: Mutex<VecDeque<QueueJob>>,
}

impl ImmediateQueue {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            context: Mutex::new(String::new()),
            returns: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
            backlog: Mutex::new(VecDeque::new()),
        }
    }
}

impl Default for ImmediateQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Queue for ImmediateQueue {
    fn set_context(&self, context: &QueueContextId) {
        *self.context.lock() = context.clone();
    }

    fn context(&self) -> QueueContextId {
        self.context.lock().clone()
    }

    fn next_job_id(&self) -> JobId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn push(&self, vm: &mut VirtualMachine, job: QueueJob) -> VmResult<()> {
        let id = job.id;
        let context = job.context.clone();
        self.states.lock().insert(id, JobState::Running);

        // No parallelism: the pushing machine runs the call to completion
        // right here, in its own environment.
        match vm.execute_call(job.call) {
            Ok(value) => {
                self.deliver(&context, id, value);
                self.states.lock().insert(id, JobState::Complete);
                Ok(())
            }
            Err(err) => {
                self.states.lock().insert(id, JobState::Error);
                Err(err)
            }
        }
    }

    fn pop(&self, filters: &SchedulingFilters) -> Option<QueueJob> {
        let mut backlog = self.backlog.lock();
        let index = backlog.iter().position(|job| job.matches_filters(filters))?;
        backlog.remove(index)
    }

    fn pending(&self, _context: &QueueContextId) -> usize {
        self.backlog.lock().len()
    }

    fn running(&self, _context: &QueueContextId) -> usize {
        0
    }

    fn returns(&self, context: &QueueContextId) -> ReturnValueMapHandle {
        self.returns
            .lock()
            .entry(context.clone())
            .or_default()
            .clone()
    }

    fn deliver(&self, context: &QueueContextId, id: JobId, value: Reference) {
        self.returns
            .lock()
            .entry(context.clone())
            .or_default()
            .insert(id, value);
    }

    fn job_state(&self, id: JobId) -> JobState {
        self.states
            .lock()
            .get(&id)
            .copied()
            .unwrap_or(JobState::Unknown)
    }

    fn set_job_state(&self, id: JobId, state: JobState) {
        self.states.lock().insert(id, state);
    }
}

/// An in-memory stream with no locking.
pub struct LocalStream {
    id: String,
    inner_type: Type,
    items: Mutex<VecDeque<Reference>>,
    open: Mutex<bool>,
}

impl LocalStream {
    pub fn new(id: impl Into<String>, inner_type: Type) -> Self {
        Self {
            id: id.into(),
            inner_type,
            items: Mutex::new(VecDeque::new()),
            open: Mutex::new(true),
        }
    }
}

impl Stream for LocalStream {
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

/// Opens in-memory streams, one instance per id.
#[derive(Default)]
pub struct LocalStreamDriver {
    streams: Mutex<HashMap<String, Arc<dyn Stream>>>,
}

impl LocalStreamDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StreamDriver for LocalStreamDriver {
    fn open(&self, id: &str, inner_type: &Type) -> Arc<dyn Stream> {
        self.streams
            .lock()
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(LocalStream::new(id, inner_type.clone())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use svi_core::Affinity;

    fn local(name: &str) -> LocationReference {
        LocationReference::new(Affinity::Local, name)
    }

    #[test]
    fn storage_enforces_declared_types() {
        let mut storage = Storage::new(Affinity::Local);
        let loc = local("x");
        storage.typify(&loc, Type::Number);

        assert!(storage.store(&loc, Reference::Number(1.0)).is_ok());
        assert!(storage
            .store(&loc, Reference::StringVal("no".into()))
            .is_err());
        assert_eq!(storage.load(&loc).unwrap(), Reference::Number(1.0));
    }

    #[test]
    fn load_of_absent_location_fails() {
        let storage = Storage::new(Affinity::Local);
        assert!(matches!(
            storage.load(&local("missing")),
            Err(VmError::InvalidStoreLocation { .. })
        ));
    }

    #[test]
    fn acquire_is_exclusive_until_released() {
        let mut storage = Storage::new(Affinity::Shared);
        let loc = LocationReference::new(Affinity::Shared, "x");
        let lock = storage.acquire(&loc).expect("first acquire");
        assert!(storage.acquire(&loc).is_none());
        lock.release();
        assert!(storage.acquire(&loc).is_some());
    }

    #[test]
    fn fork_is_independent() {
        let mut storage = Storage::new(Affinity::Local);
        let loc = local("x");
        storage.store(&loc, Reference::Number(1.0)).unwrap();

        let mut forked = storage.fork();
        forked.store(&loc, Reference::Number(2.0)).unwrap();
        assert_eq!(storage.load(&loc).unwrap(), Reference::Number(1.0));
        assert_eq!(forked.load(&loc).unwrap(), Reference::Number(2.0));
    }

    #[test]
    fn stream_pop_orders_fifo_and_fails_empty() {
        let stream = LocalStream::new("s", Type::Number);
        stream.push(Reference::Number(1.0)).unwrap();
        stream.push(Reference::Number(2.0)).unwrap();
        assert_eq!(stream.pop().unwrap(), Reference::Number(1.0));
        assert_eq!(stream.pop().unwrap(), Reference::Number(2.0));
        assert!(matches!(stream.pop(), Err(VmError::StreamEmpty { .. })));
    }

    #[test]
    fn driver_reuses_streams_by_id() {
        let driver = LocalStreamDriver::new();
        let a = driver.open("s:data", &Type::Number);
        let b = driver.open("s:data", &Type::Number);
        a.push(Reference::Number(5.0)).unwrap();
        assert_eq!(b.pop().unwrap(), Reference::Number(5.0));
    }
}
