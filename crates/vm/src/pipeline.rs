//! Assembly of configured machines from program input.
//!
//! A pipeline wraps one program (textual SVI or binary SBI, discriminated
//! by the four-byte marker) and builds machines with a chosen driver set:
//! purely local, cross-thread with workers, or backed by a shared
//! key-value store.

use std::path::Path;
use std::sync::Arc;

use svi_core::{parser, Config, Instructions};
use svi_wire::NullContext;

use crate::error::{VmError, VmResult};
use crate::machine::VirtualMachine;
use crate::prologue::PrologueProvider;
use crate::runtime::kv::{KvClient, KvGlobalServices, KvQueue, KvStorage, KvStreamDriver};
use crate::runtime::local_streams::OutputSink;
use crate::runtime::multi_threaded::{
    SharedGlobalServices, SharedQueue, SharedStorage, SharedStreamDriver,
};
use crate::runtime::single_threaded::{
    ImmediateQueue, LocalGlobalServices, LocalStreamDriver, Storage,
};
use crate::runtime::worker::spawn_workers;
use crate::runtime::{fabric, GlobalServices, ShutdownFlag};
use svi_core::Affinity;

/// One loaded program and the machines it can be run on.
pub struct Pipeline {
    input: Vec<u8>,
    binary: bool,
}

impl Pipeline {
    /// Wrap raw program bytes, sniffing the SBI marker.
    pub fn from_bytes(input: Vec<u8>) -> Self {
        let binary = svi_wire::is_binary_input(&input);
        Self { input, binary }
    }

    /// Read a program file.
    pub fn from_path(path: impl AsRef<Path>) -> VmResult<Self> {
        let path = path.as_ref();
        let input = std::fs::read(path).map_err(|_| VmError::InvalidOrMissingFilePath {
            path: path.display().to_string(),
        })?;
        Ok(Self::from_bytes(input))
    }

    pub fn is_binary(&self) -> bool {
        self.binary
    }

    /// The program's token stream (textual input only).
    pub fn tokens(&self) -> VmResult<Vec<String>> {
        if self.binary {
            return Err(VmError::queue("cannot tokenize binary input"));
        }
        let text = String::from_utf8_lossy(&self.input);
        Ok(parser::tokenize(&text)?)
    }

    /// The parsed (or deserialized) instruction list.
    pub fn instructions(&self) -> VmResult<Instructions> {
        if self.binary {
            return Ok(svi_wire::read_sbi(&self.input, &mut NullContext)?);
        }
        let text = String::from_utf8_lossy(&self.input);
        Ok(parser::parse(&text)?)
    }

    /// The program in SBI form (round-trips binary input unchanged).
    pub fn binary_representation(&self) -> VmResult<Vec<u8>> {
        if self.binary {
            return Ok(self.input.clone());
        }
        Ok(svi_wire::write_sbi(&self.instructions()?, &mut NullContext)?)
    }

    /// A machine with purely local, synchronous drivers.
    pub fn target_local(
        &self,
        config: Config,
        sink: Arc<dyn OutputSink>,
    ) -> VmResult<VirtualMachine> {
        let global: Arc<dyn GlobalServices> = Arc::new(LocalGlobalServices::new());
        let mut vm = VirtualMachine::new(
            config,
            Arc::clone(&global),
            Arc::new(ImmediateQueue::new()),
            Arc::new(LocalStreamDriver::new()),
            sink,
        );
        vm.add_store(Box::new(Storage::new(Affinity::Shared)));
        vm.add_store(Box::new(Storage::new(Affinity::Local)));
        finish_assembly(&mut vm, global)?;
        vm.initialize(self.instructions()?)?;
        Ok(vm)
    }

    /// A machine with cross-thread drivers plus its worker pool. The
    /// returned shutdown flag stops the workers.
    pub fn target_threaded(
        &self,
        config: Config,
        sink: Arc<dyn OutputSink>,
    ) -> VmResult<(VirtualMachine, Vec<std::thread::JoinHandle<()>>, ShutdownFlag)> {
        let workers = config.workers;
        let global: Arc<dyn GlobalServices> = Arc::new(SharedGlobalServices::new());
        let mut vm = VirtualMachine::new(
            config,
            Arc::clone(&global),
            Arc::new(SharedQueue::new()),
            Arc::new(SharedStreamDriver::new()),
            sink,
        );
        vm.add_store(Box::new(SharedStorage::new(Affinity::Shared)));
        vm.add_store(Box::new(Storage::new(Affinity::Local)));
        finish_assembly(&mut vm, global)?;
        vm.initialize(self.instructions()?)?;

        let handles = spawn_workers(&vm, workers.max(1));
        let shutdown = vm.shutdown_flag();
        Ok((vm, handles, shutdown))
    }

    /// A machine joined to a shared key-value store, plus local workers
    /// draining its queue.
    pub fn target_kv(
        &self,
        config: Config,
        kv: Arc<dyn KvClient>,
        sink: Arc<dyn OutputSink>,
    ) -> VmResult<(VirtualMachine, Vec<std::thread::JoinHandle<()>>, ShutdownFlag)> {
        let workers = config.workers;
        let prefix = config.kv_prefix.clone();
        let global: Arc<dyn GlobalServices> =
            Arc::new(KvGlobalServices::new(Arc::clone(&kv), prefix.clone()));
        let mut vm = VirtualMachine::new(
            config,
            Arc::clone(&global),
            Arc::new(KvQueue::new(Arc::clone(&kv), prefix.clone())),
            Arc::new(KvStreamDriver::new(Arc::clone(&kv), prefix.clone())),
            sink,
        );
        vm.add_store(Box::new(KvStorage::new(Affinity::Shared, kv, prefix)));
        vm.add_store(Box::new(Storage::new(Affinity::Local)));
        finish_assembly(&mut vm, global)?;
        vm.initialize(self.instructions()?)?;

        let handles = spawn_workers(&vm, workers.max(1));
        let shutdown = vm.shutdown_flag();
        Ok((vm, handles, shutdown))
    }
}

fn finish_assembly(vm: &mut VirtualMachine, global: Arc<dyn GlobalServices>) -> VmResult<()> {
    // Every node offers itself as a tunneling target.
    global.apply_context_filter(fabric::NODE_FILTER, &global.node_id());
    if vm.config().with_prologue {
        vm.add_provider(Arc::new(PrologueProvider::new(global)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::local_streams::BufferSink;

    #[test]
    fn sniffs_binary_input() {
        assert!(!Pipeline::from_bytes(b"out 1".to_vec()).is_binary());
        let sbi = Pipeline::from_bytes(b"out 1".to_vec())
            .binary_representation()
            .unwrap();
        assert!(Pipeline::from_bytes(sbi).is_binary());
    }

    #[test]
    fn text_and_binary_forms_parse_identically() {
        let text = Pipeline::from_bytes(b"$l:a <- 2\nout $l:a".to_vec());
        let instructions = text.instructions().unwrap();

        let binary = Pipeline::from_bytes(text.binary_representation().unwrap());
        assert_eq!(binary.instructions().unwrap(), instructions);
    }

    #[test]
    fn missing_files_are_reported() {
        assert!(matches!(
            Pipeline::from_path("/definitely/not/here.svi"),
            Err(VmError::InvalidOrMissingFilePath { .. })
        ));
    }

    #[test]
    fn local_target_runs() {
        let sink = Arc::new(BufferSink::new());
        let pipeline = Pipeline::from_bytes(b"out \"up\"".to_vec());
        let mut vm = pipeline.target_local(Config::default(), sink.clone()).unwrap();
        vm.execute().unwrap();
        assert_eq!(sink.out_lines(), vec!["up"]);
    }
}
