//! Queue workers.
//!
//! A worker owns a prototype machine wired to the shared queue. Each tick
//! claims one filter-matching job, restores a fork of the prototype from
//! the job's captured scope and state, runs exactly that call, and writes
//! the return value back into the job's context.

use std::collections::HashMap;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::error::{VmError, VmResult};
use crate::machine::VirtualMachine;
use crate::runtime::ShutdownFlag;

static WORKER_THREADS: Lazy<Mutex<HashMap<ThreadId, String>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// The worker id registered for the calling OS thread.
pub fn current_worker_id() -> VmResult<String> {
    let thread = thread::current().id();
    WORKER_THREADS
        .lock()
        .get(&thread)
        .cloned()
        .ok_or_else(|| VmError::ForeignThread {
            thread: format!("{thread:?}"),
        })
}

/// A job-claiming loop around a prototype machine.
pub struct Worker {
    id: String,
    proto: VirtualMachine,
    shutdown: ShutdownFlag,
}

impl Worker {
    pub fn new(proto: VirtualMachine) -> Self {
        let id = format!("worker-{}", proto.global().uuid());
        let shutdown = proto.shutdown_flag();
        Self {
            id,
            proto,
            shutdown,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// One scheduling cycle: claim and run a matching job, if any.
    /// Returns whether a job was executed.
    pub fn tick(&mut self) -> VmResult<bool> {
        let filters = self.proto.global().context_filters();
        let Some(job) = self.proto.queue().pop(&filters) else {
            return Ok(false);
        };

        let worker = current_worker_id().unwrap_or_else(|_| self.id.clone());
        tracing::debug!(worker = %worker, job = job.id, "claimed job");

        let mut vm = self.proto.fork();
        let outcome = vm.run_job(&job);
        self.proto.queue().finish(&job.context, job.id, outcome);
        Ok(true)
    }

    /// Tick until the shutdown flag trips, sleeping between cycles.
    pub fn wait(mut self) {
        WORKER_THREADS
            .lock()
            .insert(thread::current().id(), self.id.clone());

        let sleep = Duration::from_millis(self.proto.config().worker_sleep_ms);
        while !self.shutdown.is_triggered() {
            match self.tick() {
                Ok(true) => {}
                Ok(false) => thread::sleep(sleep),
                Err(err) => {
                    tracing::error!(worker = %self.id, %err, "worker tick failed");
                    thread::sleep(sleep);
                }
            }
        }

        WORKER_THREADS.lock().remove(&thread::current().id());
    }

    /// Move this worker onto its own OS thread.
    pub fn spawn(self) -> JoinHandle<()> {
        thread::Builder::new()
            .name(self.id.clone())
            .spawn(move || self.wait())
            .expect("worker thread spawn")
    }
}

/// Spawn `count` workers forked from a prototype machine.
pub fn spawn_workers(proto: &VirtualMachine, count: usize) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|_| Worker::new(proto.fork()).spawn())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_threads_are_foreign() {
        assert!(matches!(
            current_worker_id(),
            Err(VmError::ForeignThread { .. })
        ));
    }
}
