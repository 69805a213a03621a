//! Drivers backed by a shared key-value store.
//!
//! Everything here is written against [`KvClient`], a minimal
//! Redis-shaped surface: get/set, set-if-not-exists, prefix scans, list
//! push/pop, and counters. [`MemoryKv`] implements it in-process for
//! tests and single-host runs; a networked client plugs in behind the
//! same trait without touching the drivers.
//!
//! Values are Wire-reduced under a configurable keyspace prefix, locks
//! are set-if-not-exists keys, streams are lists, and queue jobs carry
//! their captured call, scope, and state as one serialized record.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use svi_core::references::{LocationReference, Reference, ReturnValueMapHandle};
use svi_core::types::Type;
use svi_io::WireMap;
use svi_wire::{keys, NullContext, Wire};

use crate::error::{VmError, VmResult};
use crate::machine::VirtualMachine;
use crate::runtime::single_threaded::LocalGlobalServices;
use crate::runtime::{
    GlobalServices, JobId, JobState, Queue, QueueContextId, QueueJob, SchedulingFilters,
    StorageBackend, StorageLock, Stream, StreamDriver,
};

/// The key-value surface the distributed drivers require.
pub trait KvClient: Send + Sync {
    fn get(&self, key: &str) -> Option<Vec<u8>>;
    fn set(&self, key: &str, value: Vec<u8>);
    /// Set only if the key is vacant; true when the write happened.
    fn set_nx(&self, key: &str, value: Vec<u8>) -> bool;
    fn del(&self, key: &str);
    fn keys_with_prefix(&self, prefix: &str) -> Vec<String>;
    fn lpush(&self, key: &str, value: Vec<u8>);
    fn rpop(&self, key: &str) -> Option<Vec<u8>>;
    fn llen(&self, key: &str) -> usize;
    fn incr(&self, key: &str) -> u64;
}

/// An in-process [`KvClient`].
#[derive(Default)]
pub struct MemoryKv {
    values: Mutex<HashMap<String, Vec<u8>>>,
    lists: Mutex<HashMap<String, VecDeque<Vec<u8>>>>,
    counters: Mutex<HashMap<String, u64>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvClient for MemoryKv {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.values.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: Vec<u8>) {
        self.values.lock().insert(key.to_string(), value);
    }

    fn set_nx(&self, key: &str, value: Vec<u8>) -> bool {
        let mut values = self.values.lock();
        if values.contains_key(key) {
            return false;
        }
        values.insert(key.to_string(), value);
        true
    }

    fn del(&self, key: &str) {
        self.values.lock().remove(key);
    }

    fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.values
            .lock()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect()
    }

    fn lpush(&self, key: &str, value: Vec<u8>) {
        self.lists
            .lock()
            .entry(key.to_string())
            .or_default()
            .push_front(value);
    }

    fn rpop(&self, key: &str) -> Option<Vec<u8>> {
        self.lists.lock().get_mut(key)?.pop_back()
    }

    fn llen(&self, key: &str) -> usize {
        self.lists.lock().get(key).map_or(0, VecDeque::len)
    }

    fn incr(&self, key: &str) -> u64 {
        let mut counters = self.counters.lock();
        let value = counters.entry(key.to_string()).or_insert(0);
        *value += 1;
        *value
    }
}

/// Global services for a node joined to a shared store.
pub struct KvGlobalServices {
    kv: Arc<dyn KvClient>,
    prefix: String,
    node_id: String,
    local: LocalGlobalServices,
}

impl KvGlobalServices {
    pub fn new(kv: Arc<dyn KvClient>, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let node_id = format!("node-{}", kv.incr(&format!("{prefix}next_node_id")));
        Self {
            kv,
            prefix,
            node_id,
            local: LocalGlobalServices::new(),
        }
    }
}

impl GlobalServices for KvGlobalServices {
    fn uuid(&self) -> String {
        self.local.uuid()
    }

    fn next_id(&self) -> u64 {
        self.kv.incr(&format!("{}next_id", self.prefix))
    }

    fn current_time(&self) -> f64 {
        self.local.current_time()
    }

    fn random(&self) -> f64 {
        self.local.random()
    }

    fn node_id(&self) -> String {
        self.node_id.clone()
    }

    fn get_key_value(&self, key: &str) -> Option<String> {
        let bytes = self.kv.get(&format!("{}kv::{key}", self.prefix))?;
        String::from_utf8(bytes).ok()
    }

    fn put_key_value(&self, key: &str, value: &str) {
        self.kv
            .set(&format!("{}kv::{key}", self.prefix), value.into());
    }

    fn drop_key_value(&self, key: &str) {
        self.kv.del(&format!("{}kv::{key}", self.prefix));
    }

    fn scheduling_filters(&self) -> SchedulingFilters {
        self.local.scheduling_filters()
    }

    fn apply_scheduling_filter(&self, key: &str, value: &str) {
        self.local.apply_scheduling_filter(key, value)
    }

    fn remove_scheduling_filter(&self, key: &str) {
        self.local.remove_scheduling_filter(key)
    }

    fn clear_scheduling_filters(&self) {
        self.local.clear_scheduling_filters()
    }

    fn context_filters(&self) -> SchedulingFilters {
        self.local.context_filters()
    }

    fn apply_context_filter(&self, key: &str, value: &str) {
        self.local.apply_context_filter(key, value)
    }

    fn remove_context_filter(&self, key: &str) {
        self.local.remove_context_filter(key)
    }

    fn clear_context_filters(&self) {
        self.local.clear_context_filters()
    }
}

/// Storage with values serialized into the shared store.
pub struct KvStorage {
    affinity: svi_core::Affinity,
    kv: Arc<dyn KvClient>,
    prefix: String,
    wire: Wire,
}

impl KvStorage {
    pub fn new(affinity: svi_core::Affinity, kv: Arc<dyn KvClient>, prefix: impl Into<String>) -> Self {
        Self {
            affinity,
            kv,
            prefix: prefix.into(),
            wire: Wire::new(),
        }
    }

    fn value_key(&self, location: &LocationReference) -> String {
        format!("{}store::{}", self.prefix, location.fq_name())
    }

    fn type_key(&self, location: &LocationReference) -> String {
        format!("{}type::{}", self.prefix, location.fq_name())
    }

    fn lock_key(&self, location: &LocationReference) -> String {
        format!("{}lock::{}", self.prefix, location.fq_name())
    }
}

impl StorageBackend for KvStorage {
    fn load(&self, location: &LocationReference) -> VmResult<Reference> {
        let bytes = self
            .kv
            .get(&self.value_key(location))
            .ok_or_else(|| VmError::invalid_store_location(location.fq_name()))?;
        let map = WireMap::from_bytes(&bytes).map_err(svi_wire::WireError::from)?;
        Ok(self.wire.produce_reference(&map, &mut NullContext)?)
    }

    fn store(&mut self, location: &LocationReference, value: Reference) -> VmResult<()> {
        if let Some(declared) = self.type_of(location) {
            let actual = value.type_of();
            if !actual.is_assignable_to(&declared) {
                return Err(svi_core::SviError::type_mismatch(
                    declared.to_string(),
                    actual.to_string(),
                    format!("store {}", location.fq_name()),
                )
                .into());
            }
        }
        let map = self.wire.reduce_reference(&value, &mut NullContext)?;
        self.kv.set(&self.value_key(location), map.to_bytes());
        Ok(())
    }

    fn has(&self, location: &LocationReference) -> bool {
        self.kv.get(&self.value_key(location)).is_some()
    }

    fn manages(&self, location: &LocationReference) -> bool {
        location.affinity() == self.affinity
    }

    fn drop_location(&mut self, location: &LocationReference) {
        self.kv.del(&self.value_key(location));
        self.kv.del(&self.type_key(location));
    }

    fn type_of(&self, location: &LocationReference) -> Option<Type> {
        let bytes = self.kv.get(&self.type_key(location))?;
        let map = WireMap::from_bytes(&bytes).ok()?;
        svi_wire::types::produce_type(&map).ok()
    }

    fn typify(&mut self, location: &LocationReference, ty: Type) {
        if let Ok(map) = svi_wire::types::reduce_type(&ty) {
            self.kv.set(&self.type_key(location), map.to_bytes());
        }
    }

    fn acquire(&mut self, location: &LocationReference) -> Option<Box<dyn StorageLock>> {
        let key = self.lock_key(location);
        let holder = uuid::Uuid::new_v4().to_string();
        if !self.kv.set_nx(&key, holder.clone().into_bytes()) {
            return None;
        }
        Some(Box::new(KvLock {
            location: location.clone(),
            key,
            holder,
            kv: Arc::clone(&self.kv),
        }))
    }

    fn clear(&mut self) {
        for key in self.kv.keys_with_prefix(&self.prefix) {
            self.kv.del(&key);
        }
    }

    fn snapshot(&self) -> Vec<(String, Reference)> {
        let prefix = format!("{}store::", self.prefix);
        let mut entries = Vec::new();
        for key in self.kv.keys_with_prefix(&prefix) {
            let Some(fq) = key.strip_prefix(&prefix) else {
                continue;
            };
            let Some(bytes) = self.kv.get(&key) else {
                continue;
            };
            if let Ok(map) = WireMap::from_bytes(&bytes) {
                if let Ok(value) = self.wire.produce_reference(&map, &mut NullContext) {
                    entries.push((fq.to_string(), value));
                }
            }
        }
        entries
    }

    fn restore_entries(&mut self, entries: &[(String, Reference)]) {
        for (fq, value) in entries {
            if let Ok(map) = self.wire.reduce_reference(value, &mut NullContext) {
                self.kv
                    .set(&format!("{}store::{fq}", self.prefix), map.to_bytes());
            }
        }
    }

    fn fork(&self) -> Box<dyn StorageBackend> {
        Box::new(KvStorage {
            affinity: self.affinity,
            kv: Arc::clone(&self.kv),
            prefix: self.prefix.clone(),
            wire: Wire::new(),
        })
    }
}

struct KvLock {
    location: LocationReference,
    key: String,
    holder: String,
    kv: Arc<dyn KvClient>,
}

impl Drop for KvLock {
    fn drop(&mut self) {
        // Only the holder may free the lock key.
        if self.kv.get(&self.key).as_deref() == Some(self.holder.as_bytes()) {
            self.kv.del(&self.key);
        }
    }
}

impl StorageLock for KvLock {
    fn location(&self) -> LocationReference {
        self.location.clone()
    }

    fn release(self: Box<Self>) {}
}

/// A stream backed by a list in the shared store.
pub struct KvStream {
    id: String,
    inner_type: Type,
    kv: Arc<dyn KvClient>,
    prefix: String,
    wire: Wire,
}

impl KvStream {
    fn list_key(&self) -> String {
        format!("{}stream::{}", self.prefix, self.id)
    }

    fn open_key(&self) -> String {
        format!("{}stream_open::{}", self.prefix, self.id)
    }
}

impl Stream for KvStream {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn inner_type(&self) -> Type {
        self.inner_type.clone()
    }

    fn open(&self) {
        self.kv.set(&self.open_key(), b"1".to_vec());
    }

    fn close(&self) {
        self.kv.del(&self.open_key());
    }

    fn is_open(&self) -> bool {
        self.kv.get(&self.open_key()).is_some()
    }

    fn push(&self, value: Reference) -> VmResult<()> {
        let map = self.wire.reduce_reference(&value, &mut NullContext)?;
        self.kv.lpush(&self.list_key(), map.to_bytes());
        Ok(())
    }

    fn pop(&self) -> VmResult<Reference> {
        let bytes = self
            .kv
            .rpop(&self.list_key())
            .ok_or_else(|| VmError::stream_empty(&self.id))?;
        let map = WireMap::from_bytes(&bytes).map_err(svi_wire::WireError::from)?;
        Ok(self.wire.produce_reference(&map, &mut NullContext)?)
    }

    fn is_empty(&self) -> bool {
        self.kv.llen(&self.list_key()) == 0
    }
}

/// Opens list-backed streams in the shared store.
pub struct KvStreamDriver {
    kv: Arc<dyn KvClient>,
    prefix: String,
}

impl KvStreamDriver {
    pub fn new(kv: Arc<dyn KvClient>, prefix: impl Into<String>) -> Self {
        Self {
            kv,
            prefix: prefix.into(),
        }
    }
}

impl StreamDriver for KvStreamDriver {
    fn open(&self, id: &str, inner_type: &Type) -> Arc<dyn Stream> {
        let stream = KvStream {
            id: id.to_string(),
            inner_type: inner_type.clone(),
            kv: Arc::clone(&self.kv),
            prefix: self.prefix.clone(),
            wire: Wire::new(),
        };
        stream.open();
        Arc::new(stream)
    }
}

/// A queue whose jobs travel through the shared store as Wire records.
pub struct KvQueue {
    kv: Arc<dyn KvClient>,
    prefix: String,
    context: Mutex<QueueContextId>,
    wire: Wire,
}

impl KvQueue {
    pub fn new(kv: Arc<dyn KvClient>, prefix: impl Into<String>) -> Self {
        Self {
            kv,
            prefix: prefix.into(),
            context: Mutex::new(String::new()),
            wire: Wire::new(),
        }
    }

    fn queue_key(&self, context: &str) -> String {
        format!("{}queue::{context}", self.prefix)
    }

    fn contexts_key(&self) -> String {
        format!("{}queue_contexts", self.prefix)
    }

    fn status_key(&self, id: JobId) -> String {
        format!("{}status::{id}", self.prefix)
    }

    fn running_key(&self, context: &str, id: JobId) -> String {
        format!("{}running::{context}::{id}", self.prefix)
    }

    fn return_key(&self, context: &str, id: JobId) -> String {
        format!("{}ret::{context}::{id}", self.prefix)
    }

    fn known_contexts(&self) -> Vec<String> {
        self.kv
            .get(&self.contexts_key())
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .map(|joined| {
                joined
                    .split('\n')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn remember_context(&self, context: &str) {
        let mut known = self.known_contexts();
        if !known.iter().any(|c| c == context) {
            known.push(context.to_string());
            self.kv.set(&self.contexts_key(), known.join("\n").into_bytes());
        }
    }

    fn encode_job(&self, job: &QueueJob) -> VmResult<Vec<u8>> {
        let mut ctx = NullContext;
        let mut map = WireMap::new();
        map.set_u64(keys::ID, job.id);
        map.set_str(keys::NAME, job.context.clone());
        map.set_map(keys::CALL, self.wire.reduce_call(&job.call, &mut ctx)?);
        map.set_map(keys::PARENT, self.wire.reduce_scope(&job.scope, &mut ctx)?);
        map.set_map(
            keys::INSTRUCTIONS,
            self.wire.reduce_state(&job.state, &mut ctx)?,
        );

        let mut filter_keys = Vec::new();
        let mut filter_values = Vec::new();
        for (key, value) in &job.filters {
            filter_keys.push(svi_io::WireValue::Str(key.clone()));
            filter_values.push(svi_io::WireValue::Str(value.clone()));
        }
        map.set_list(keys::KEYS, filter_keys);
        map.set_list(keys::VECTOR_VALUES, filter_values);

        let mut local_names = Vec::new();
        let mut local_values = Vec::new();
        for (fq, value) in &job.locals {
            local_names.push(svi_io::WireValue::Str(fq.clone()));
            local_values.push(svi_io::WireValue::Map(
                self.wire.reduce_reference(value, &mut ctx)?,
            ));
        }
        map.set_list(keys::LOCATIONS, local_names);
        map.set_list(keys::ITEMS, local_values);

        Ok(map.to_bytes())
    }

    fn decode_job(&self, bytes: &[u8]) -> VmResult<QueueJob> {
        let mut ctx = NullContext;
        let map = WireMap::from_bytes(bytes).map_err(svi_wire::WireError::from)?;

        let mut filters = SchedulingFilters::new();
        let filter_keys = map.get_list(keys::KEYS).map_err(svi_wire::WireError::from)?;
        let filter_values = map
            .get_list(keys::VECTOR_VALUES)
            .map_err(svi_wire::WireError::from)?;
        for (key, value) in filter_keys.iter().zip(filter_values) {
            if let (svi_io::WireValue::Str(key), svi_io::WireValue::Str(value)) = (key, value) {
                filters.insert(key.clone(), value.clone());
            }
        }

        let mut locals = Vec::new();
        let local_names = map
            .get_list(keys::LOCATIONS)
            .map_err(svi_wire::WireError::from)?;
        let local_values = map.get_list(keys::ITEMS).map_err(svi_wire::WireError::from)?;
        for (fq, value) in local_names.iter().zip(local_values) {
            if let (svi_io::WireValue::Str(fq), svi_io::WireValue::Map(value)) = (fq, value) {
                locals.push((fq.clone(), self.wire.produce_reference(value, &mut ctx)?));
            }
        }

        Ok(QueueJob {
            id: map.get_u64(keys::ID).map_err(svi_wire::WireError::from)?,
            context: map
                .get_str(keys::NAME)
                .map_err(svi_wire::WireError::from)?
                .to_string(),
            call: self
                .wire
                .produce_call(map.get_map(keys::CALL).map_err(svi_wire::WireError::from)?, &mut ctx)?,
            scope: self.wire.produce_scope(
                map.get_map(keys::PARENT).map_err(svi_wire::WireError::from)?,
                &mut ctx,
            )?,
            state: self.wire.produce_state(
                map.get_map(keys::INSTRUCTIONS)
                    .map_err(svi_wire::WireError::from)?,
                &mut ctx,
            )?,
            locals,
            filters,
        })
    }
}

impl Queue for KvQueue {
    fn set_context(&self, context: &QueueContextId) {
        *self.context.lock() = context.clone();
    }

    fn context(&self) -> QueueContextId {
        self.context.lock().clone()
    }

    fn next_job_id(&self) -> JobId {
        self.kv.incr(&format!("{}next_job_id", self.prefix))
    }

    fn push(&self, _vm: &mut VirtualMachine, job: QueueJob) -> VmResult<()> {
        let bytes = self.encode_job(&job)?;
        self.remember_context(&job.context);
        self.set_job_state(job.id, JobState::Pending);
        self.kv.lpush(&self.queue_key(&job.context), bytes);
        Ok(())
    }

    fn pop(&self, filters: &SchedulingFilters) -> Option<QueueJob> {
        // Try the focused context first, then any other known context.
        let mut contexts = vec![self.context()];
        for context in self.known_contexts() {
            if !contexts.contains(&context) {
                contexts.push(context);
            }
        }

        for context in contexts {
            let key = self.queue_key(&context);
            let mut skipped = Vec::new();
            while let Some(bytes) = self.kv.rpop(&key) {
                match self.decode_job(&bytes) {
                    Ok(job) if job.matches_filters(filters) => {
                        // Re-queue anything this worker rejected.
                        for rejected in skipped.into_iter().rev() {
                            self.kv.lpush(&key, rejected);
                        }
                        self.kv
                            .set(&self.running_key(&job.context, job.id), b"1".to_vec());
                        self.set_job_state(job.id, JobState::Running);
                        return Some(job);
                    }
                    Ok(_) => skipped.push(bytes),
                    Err(err) => {
                        tracing::error!(%err, "dropping undecodable job");
                    }
                }
            }
            for rejected in skipped.into_iter().rev() {
                self.kv.lpush(&key, rejected);
            }
        }

        None
    }

    fn pending(&self, context: &QueueContextId) -> usize {
        self.kv.llen(&self.queue_key(context))
    }

    fn running(&self, context: &QueueContextId) -> usize {
        self.kv
            .keys_with_prefix(&format!("{}running::{context}::", self.prefix))
            .len()
    }

    fn returns(&self, context: &QueueContextId) -> ReturnValueMapHandle {
        let handle = ReturnValueMapHandle::new();
        let prefix = format!("{}ret::{context}::", self.prefix);
        for key in self.kv.keys_with_prefix(&prefix) {
            let Some(id) = key
                .strip_prefix(&prefix)
                .and_then(|suffix| suffix.parse::<u64>().ok())
            else {
                continue;
            };
            let Some(bytes) = self.kv.get(&key) else {
                continue;
            };
            if let Ok(map) = WireMap::from_bytes(&bytes) {
                if let Ok(value) = self.wire.produce_reference(&map, &mut NullContext) {
                    handle.insert(id, value);
                }
            }
        }
        handle
    }

    fn deliver(&self, context: &QueueContextId, id: JobId, value: Reference) {
        if let Ok(map) = self.wire.reduce_reference(&value, &mut NullContext) {
            self.kv.set(&self.return_key(context, id), map.to_bytes());
        }
        self.kv.del(&self.running_key(context, id));
    }

    fn job_state(&self, id: JobId) -> JobState {
        self.kv
            .get(&self.status_key(id))
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .and_then(|s| s.parse::<u64>().ok())
            .map(JobState::from_index)
            .unwrap_or(JobState::Unknown)
    }

    fn set_job_state(&self, id: JobId, state: JobState) {
        self.kv
            .set(&self.status_key(id), state.index().to_string().into_bytes());
    }

    fn finish(&self, context: &QueueContextId, id: JobId, outcome: VmResult<Reference>) {
        match outcome {
            Ok(value) => {
                self.deliver(context, id, value);
                self.set_job_state(id, JobState::Complete);
            }
            Err(err) => {
                tracing::error!(job = id, %err, "deferred job failed");
                self.kv.del(&self.running_key(context, id));
                self.set_job_state(id, JobState::Error);
            }
        }
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

    #[test]
    fn memory_kv_honors_set_nx() {
        let kv = MemoryKv::new();
        assert!(kv.set_nx("k", b"a".to_vec()));
        assert!(!kv.set_nx("k", b"b".to_vec()));
        assert_eq!(kv.get("k"), Some(b"a".to_vec()));
    }

    #[test]
    fn storage_round_trips_through_serialization() {
        let kv: Arc<dyn KvClient> = Arc::new(MemoryKv::new());
        let mut storage = KvStorage::new(Affinity::Shared, kv, "svi::");

        let loc = shared("counter");
        storage.typify(&loc, Type::Number);
        storage.store(&loc, Reference::Number(7.0)).unwrap();

        assert_eq!(storage.load(&loc).unwrap(), Reference::Number(7.0));
        assert_eq!(storage.type_of(&loc), Some(Type::Number));
        assert!(storage
            .store(&loc, Reference::StringVal("no".into()))
            .is_err());
    }

    #[test]
    fn clear_removes_only_prefixed_keys() {
        let kv: Arc<dyn KvClient> = Arc::new(MemoryKv::new());
        kv.set("unrelated", b"x".to_vec());
        let mut storage = KvStorage::new(Affinity::Shared, Arc::clone(&kv), "svi::");
        storage.store(&shared("a"), Reference::Number(1.0)).unwrap();

        storage.clear();
        assert!(!storage.has(&shared("a")));
        assert_eq!(kv.get("unrelated"), Some(b"x".to_vec()));
    }

    #[test]
    fn locks_use_set_nx() {
        let kv: Arc<dyn KvClient> = Arc::new(MemoryKv::new());
        let mut a = KvStorage::new(Affinity::Shared, Arc::clone(&kv), "svi::");
        let mut b = KvStorage::new(Affinity::Shared, kv, "svi::");

        let lock = a.acquire(&shared("x")).expect("acquire");
        assert!(b.acquire(&shared("x")).is_none());
        lock.release();
        assert!(b.acquire(&shared("x")).is_some());
    }

    #[test]
    fn streams_are_fifo_lists() {
        let kv: Arc<dyn KvClient> = Arc::new(MemoryKv::new());
        let driver = KvStreamDriver::new(kv, "svi::");
        let stream = driver.open("s:data", &Type::Number);

        stream.push(Reference::Number(1.0)).unwrap();
        stream.push(Reference::Number(2.0)).unwrap();
        assert_eq!(stream.pop().unwrap(), Reference::Number(1.0));
        assert_eq!(stream.pop().unwrap(), Reference::Number(2.0));
        assert!(matches!(stream.pop(), Err(VmError::StreamEmpty { .. })));
    }

    #[test]
    fn queue_jobs_survive_serialization_and_filtering() {
        let kv: Arc<dyn KvClient> = Arc::new(MemoryKv::new());
        let queue = KvQueue::new(kv, "svi::");
        queue.set_context(&"ctx-1".to_string());

        let job = QueueJob {
            id: queue.next_job_id(),
            context: "ctx-1".to_string(),
            call: FunctionCall::new(FunctionBackend::Inline, "work", vec![], Type::Void),
            scope: ScopeFrame::root("root"),
            state: State::new(vec![]).unwrap(),
            locals: Vec::new(),
            filters: [("zone".to_string(), "a".to_string())].into_iter().collect(),
        };
        let id = job.id;

        let bytes = queue.encode_job(&job).unwrap();
        queue.remember_context(&job.context);
        queue.set_job_state(id, JobState::Pending);
        queue.kv.lpush(&queue.queue_key("ctx-1"), bytes);

        // A worker in the wrong zone leaves the job queued.
        let wrong: SchedulingFilters =
            [("zone".to_string(), "b".to_string())].into_iter().collect();
        assert!(queue.pop(&wrong).is_none());
        assert_eq!(queue.pending(&"ctx-1".to_string()), 1);

        let right: SchedulingFilters =
            [("zone".to_string(), "a".to_string())].into_iter().collect();
        let claimed = queue.pop(&right).expect("matching worker claims");
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.call.name(), "work");
        assert_eq!(queue.running(&"ctx-1".to_string()), 1);

        queue.finish(&"ctx-1".to_string(), id, Ok(Reference::Number(3.0)));
        assert_eq!(queue.running(&"ctx-1".to_string()), 0);
        assert_eq!(queue.job_state(id), JobState::Complete);
        assert_eq!(
            queue.returns(&"ctx-1".to_string()).get(id),
            Some(Reference::Number(3.0))
        );
    }
}
