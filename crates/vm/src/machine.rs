//! The virtual machine.
//!
//! One machine executes one instruction stream, single-threaded within its
//! node. Distribution happens through the queue: a deferred call is
//! captured with its scope and state, and a worker restores a forked
//! machine from that capture to run exactly that call.
//!
//! ## The call protocol
//!
//! Calls into inline functions do not recurse into the interpreter.
//! Performing a call records the *current* pc as the return position and
//! jumps to the function entry; `return` jumps back to the recorded pc.
//! The instruction at the call site therefore executes a second time, now
//! observing the just-returned call, and completes with its value. `while`
//! leans on the same re-execution to loop, and `assigneval` to capture
//! return values.

use std::sync::Arc;
use std::time::Duration;

use svi_core::references::{
    FunctionBackend, FunctionCall, FunctionReference, LocationReference, Reference,
    ReturnValueMapHandle, StreamHandle,
};
use svi_core::scope::ScopeFrame;
use svi_core::types::Type;
use svi_core::{Affinity, Config, Instruction, State};
use svi_wire::{Wire, WireContext};

use crate::error::{VmError, VmResult};
use crate::exec::{self, Outcome};
use crate::runtime::fabric::{self, Fabric, Resource};
use crate::runtime::local_streams::{LocalOutputStream, OutputSink, StdSink};
use crate::runtime::provider::Provider;
use crate::runtime::{
    GlobalServices, JobId, Queue, QueueContextId, QueueJob, SchedulingFilters, ShutdownFlag,
    StorageBackend, StorageLock, Stream, StreamDriver,
};

struct HeldLock {
    scope_id: String,
    fq_name: String,
    lock: Option<Box<dyn StorageLock>>,
}

struct HeldResource {
    scope_id: String,
    id: String,
}

struct PendingAssignment {
    context: QueueContextId,
    job: JobId,
    dest: LocationReference,
}

/// The SVI runtime: storage routing, scope and call machinery, queue
/// dispatch, and the instruction loop.
pub struct VirtualMachine {
    config: Config,
    global: Arc<dyn GlobalServices>,
    wire: Arc<Wire>,
    fabric: Arc<Fabric>,
    queue: Arc<dyn Queue>,
    stream_driver: Arc<dyn StreamDriver>,
    providers: Vec<Arc<dyn Provider>>,
    sink: Arc<dyn OutputSink>,
    shutdown: ShutdownFlag,

    state: Option<State>,
    scope: Option<ScopeFrame>,
    stores: Vec<Box<dyn StorageBackend>>,

    local_out: Arc<dyn Stream>,
    local_err: Arc<dyn Stream>,
    shared_out: Option<Arc<dyn Stream>>,
    shared_err: Option<Arc<dyn Stream>>,

    queue_contexts: Vec<QueueContextId>,
    locks: Vec<HeldLock>,
    held_resources: Vec<HeldResource>,
    pending_assignments: Vec<PendingAssignment>,

    returned_call: Option<FunctionCall>,
    return_set_this_step: bool,
    capture_return: bool,
    next_call_is_exception_frame: bool,
    should_advance: bool,
    exited: bool,
}

impl VirtualMachine {
    /// Assemble a machine from its drivers. Most callers go through
    /// [`crate::pipeline::Pipeline`] instead.
    pub fn new(
        config: Config,
        global: Arc<dyn GlobalServices>,
        queue: Arc<dyn Queue>,
        stream_driver: Arc<dyn StreamDriver>,
        sink: Arc<dyn OutputSink>,
    ) -> Self {
        let fabric = Arc::new(Fabric::new(config.kv_prefix.clone(), Arc::clone(&global)));
        let local_out: Arc<dyn Stream> = Arc::new(LocalOutputStream::output(Arc::clone(&sink)));
        let local_err: Arc<dyn Stream> = Arc::new(LocalOutputStream::error(Arc::clone(&sink)));

        Self {
            config,
            global,
            wire: Arc::new(Wire::new()),
            fabric,
            queue,
            stream_driver,
            providers: Vec::new(),
            sink,
            shutdown: ShutdownFlag::new(),
            state: None,
            scope: None,
            stores: Vec::new(),
            local_out,
            local_err,
            shared_out: None,
            shared_err: None,
            queue_contexts: Vec::new(),
            locks: Vec::new(),
            held_resources: Vec::new(),
            pending_assignments: Vec::new(),
            returned_call: None,
            return_set_this_step: false,
            capture_return: false,
            next_call_is_exception_frame: false,
            should_advance: true,
            exited: false,
        }
    }

    /// A machine with local in-process drivers and stdout/stderr output.
    pub fn local(config: Config) -> Self {
        use crate::runtime::single_threaded::{
            ImmediateQueue, LocalGlobalServices, LocalStreamDriver, Storage,
        };

        let mut vm = Self::new(
            config,
            Arc::new(LocalGlobalServices::new()),
            Arc::new(ImmediateQueue::new()),
            Arc::new(LocalStreamDriver::new()),
            Arc::new(StdSink),
        );
        vm.add_store(Box::new(Storage::new(Affinity::Shared)));
        vm.add_store(Box::new(Storage::new(Affinity::Local)));
        vm
    }

    // --- configuration ---

    /// Register a storage backend. Later registrations take priority.
    pub fn add_store(&mut self, store: Box<dyn StorageBackend>) {
        self.stores.push(store);
    }

    /// Register a native-function provider. Later registrations take
    /// priority.
    pub fn add_provider(&mut self, provider: Arc<dyn Provider>) {
        self.providers.push(provider);
    }

    /// Replace the output sink (before or after construction of the local
    /// streams; both write through it).
    pub fn set_sink(&mut self, sink: Arc<dyn OutputSink>) {
        self.local_out = Arc::new(LocalOutputStream::output(Arc::clone(&sink)));
        self.local_err = Arc::new(LocalOutputStream::error(Arc::clone(&sink)));
        self.sink = sink;
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn global(&self) -> &Arc<dyn GlobalServices> {
        &self.global
    }

    pub fn queue(&self) -> Arc<dyn Queue> {
        Arc::clone(&self.queue)
    }

    pub fn fabric(&self) -> &Arc<Fabric> {
        &self.fabric
    }

    pub fn wire(&self) -> &Arc<Wire> {
        &self.wire
    }

    pub fn sink(&self) -> &Arc<dyn OutputSink> {
        &self.sink
    }

    pub fn shutdown_flag(&self) -> ShutdownFlag {
        self.shutdown.clone()
    }

    // --- lifecycle ---

    /// Load a program: build state, create the root scope, and open a
    /// fresh queue context.
    pub fn initialize(&mut self, instructions: Vec<Instruction>) -> VmResult<()> {
        self.state = Some(State::new(instructions)?);
        self.scope = Some(ScopeFrame::root(self.global.uuid()));
        let context = self.global.uuid();
        self.queue.set_context(&context);
        self.queue_contexts = vec![context];
        self.exited = false;
        Ok(())
    }

    /// Restore captured scope and state; used when rebuilding a machine
    /// to execute a queued call.
    pub fn restore(&mut self, scope: ScopeFrame, state: State) {
        self.scope = Some(scope);
        self.state = Some(state);
        self.exited = false;
    }

    /// An independent machine sharing this one's cluster-facing drivers.
    /// State, scope, and node-private storage are deep-copied.
    pub fn fork(&self) -> VirtualMachine {
        let mut vm = VirtualMachine::new(
            self.config.clone(),
            Arc::clone(&self.global),
            Arc::clone(&self.queue),
            Arc::clone(&self.stream_driver),
            Arc::clone(&self.sink),
        );
        vm.wire = Arc::clone(&self.wire);
        vm.fabric = Arc::clone(&self.fabric);
        vm.shutdown = self.shutdown.clone();
        vm.providers = self.providers.clone();
        vm.stores = self.stores.iter().map(|store| store.fork()).collect();
        vm.state = self.state.clone();
        vm.scope = self.scope.clone();
        vm.queue_contexts = self.queue_contexts.clone();
        vm
    }

    fn state_mut(&mut self) -> VmResult<&mut State> {
        self.state.as_mut().ok_or(VmError::NotInitialized)
    }

    pub fn state(&self) -> VmResult<&State> {
        self.state.as_ref().ok_or(VmError::NotInitialized)
    }

    pub fn scope(&self) -> VmResult<&ScopeFrame> {
        self.scope.as_ref().ok_or(VmError::NotInitialized)
    }

    fn scope_mut(&mut self) -> VmResult<&mut ScopeFrame> {
        self.scope.as_mut().ok_or(VmError::NotInitialized)
    }

    // --- the instruction loop ---

    /// Execute the current instruction and advance, unless the
    /// instruction itself moved the program counter.
    pub fn step(&mut self) -> VmResult<()> {
        let Some(instruction) = self.state()?.current().cloned() else {
            return Ok(());
        };

        tracing::trace!(pc = self.state()?.pc(), %instruction, "step");
        self.should_advance = true;
        self.return_set_this_step = false;

        let outcome = exec::execute(self, &instruction)?;
        if let Outcome::Exited = outcome {
            self.exited = true;
            return Ok(());
        }

        // A return value is only visible to the instruction re-executed at
        // the return site; drop it once that instruction has run.
        if !self.return_set_this_step {
            self.returned_call = None;
        }

        if self.should_advance && !self.state()?.is_end_of_program() {
            self.state_mut()?.advance()?;
        }
        Ok(())
    }

    /// Run the loaded program to completion (or `exit`).
    pub fn execute(&mut self) -> VmResult<()> {
        while !self.exited && !self.state()?.is_end_of_program() {
            if self.shutdown.is_triggered() {
                return Err(VmError::shutdown("execute"));
            }
            self.step()?;
        }
        Ok(())
    }

    pub fn has_exited(&self) -> bool {
        self.exited
    }

    /// Stop execution immediately.
    pub fn exit(&mut self) {
        self.exited = true;
    }

    /// Jump to a position without recording a return; the current
    /// instruction will not advance on top of it.
    pub fn jump(&mut self, pc: usize) -> VmResult<()> {
        self.state_mut()?.jump(pc)?;
        self.should_advance = false;
        Ok(())
    }

    // --- value resolution ---

    /// Resolve a reference to its most primitive value: locations are
    /// dereferenced, everything else passes through.
    pub fn resolve(&mut self, reference: &Reference) -> VmResult<Reference> {
        match reference {
            Reference::Location(location) => self.load_from_store(location),
            other => Ok(other.clone()),
        }
    }

    /// Load the value of a location, routing by affinity.
    pub fn load_from_store(&mut self, location: &LocationReference) -> VmResult<Reference> {
        match location.affinity() {
            Affinity::Function => {
                let function = self.lookup_function(location.name())?;
                Ok(Reference::Function(function))
            }
            Affinity::Primitive => self.load_primitive(location.name()),
            Affinity::ObjectProp => {
                // Property names are not storage; they only appear as
                // operands to object instructions.
                Ok(Reference::Location(location.clone()))
            }
            _ => {
                if let Some(stream) = self.builtin_stream(location) {
                    return Ok(stream);
                }
                let resolved = self.scope()?.resolve(location);
                let store = self.route(&resolved)?;
                store.load(&resolved)
            }
        }
    }

    fn load_primitive(&self, name: &str) -> VmResult<Reference> {
        let ty = match name {
            "STRING" => Type::String,
            "NUMBER" => Type::Number,
            "BOOLEAN" => Type::Boolean,
            "ERROR" => Type::Error,
            "VOID" => Type::Void,
            "UNIT" => Type::Unit,
            "TYPE" => Type::Type,
            "THIS" => Type::This,
            "AMBIGUOUS" => Type::Ambiguous,
            "MAP" => Type::Map(Box::new(Type::Ambiguous)),
            "ENUM" => Type::Enumerable(Box::new(Type::Ambiguous)),
            "LAMBDA0" => Type::Lambda0(Box::new(Type::Ambiguous)),
            "LAMBDA" => Type::Lambda1(Box::new(Type::Ambiguous), Box::new(Type::Ambiguous)),
            other => {
                return Err(VmError::invalid_store_location(format!("p:{other}")));
            }
        };
        Ok(Reference::TypeRef(ty))
    }

    fn builtin_stream(&mut self, location: &LocationReference) -> Option<Reference> {
        if location.affinity() != Affinity::Shared {
            return None;
        }
        match location.name() {
            "STDOUT" => {
                let stream = self.shared_output();
                Some(Reference::Stream(StreamHandle::new(
                    stream.id(),
                    stream.inner_type(),
                )))
            }
            "STDERR" => {
                let stream = self.shared_error();
                Some(Reference::Stream(StreamHandle::new(
                    stream.id(),
                    stream.inner_type(),
                )))
            }
            _ => None,
        }
    }

    /// Store a value, inferring the declared type from the value when the
    /// location was never typified.
    pub fn store_value(&mut self, location: &LocationReference, value: Reference) -> VmResult<()> {
        let resolved = self.scope()?.resolve(location);
        if self.type_of_location(&resolved)?.is_none() {
            let inferred = value.type_of();
            self.route(&resolved)?.typify(&resolved, inferred);
        }
        self.route(&resolved)?.store(&resolved, value)
    }

    /// Declare the type of a location.
    pub fn typify(&mut self, location: &LocationReference, ty: Type) -> VmResult<()> {
        let resolved = self.scope()?.resolve(location);
        self.route(&resolved)?.typify(&resolved, ty);
        Ok(())
    }

    /// The declared type of a location, if any backend recorded one.
    pub fn type_of_location(&mut self, location: &LocationReference) -> VmResult<Option<Type>> {
        let resolved = self.scope()?.resolve(location);
        Ok(self.route(&resolved)?.type_of(&resolved))
    }

    /// Route a location to the owning backend: reverse registration
    /// order, first match wins.
    fn route(&mut self, location: &LocationReference) -> VmResult<&mut Box<dyn StorageBackend>> {
        self.stores
            .iter_mut()
            .rev()
            .find(|store| store.manages(location))
            .ok_or_else(|| VmError::UnroutableLocation {
                location: location.fq_name(),
            })
    }

    // --- functions ---

    /// Resolve a function name through the inline table, then the
    /// providers (most recently added first).
    pub fn lookup_function(&mut self, name: &str) -> VmResult<FunctionReference> {
        if self.state()?.has_function(name) {
            return self.inline_function(name);
        }

        for provider in self.providers.iter().rev() {
            if let Some(function) = provider.load_function(name) {
                return Ok(function.reference());
            }
        }

        if name == fabric::TUNNEL_FUNCTION {
            return Ok(fabric::tunnel_function_reference());
        }

        Err(VmError::unknown_function(name))
    }

    fn inline_function(&mut self, name: &str) -> VmResult<FunctionReference> {
        let params = self.state()?.function_params(name)?;
        let header = self.state()?.function_header(name)?.clone();

        let mut formals = Vec::with_capacity(params.len());
        for (param_type, _) in &params {
            formals.push(self.resolve_type_operand(param_type)?);
        }

        let returns = match &header {
            Instruction::BeginFn { returns, .. } => self.resolve_type_operand(returns)?,
            _ => Type::Void,
        };

        Ok(FunctionReference::new(
            FunctionBackend::Inline,
            name,
            formals,
            returns,
        ))
    }

    /// Resolve an operand that names a type (a type literal, an object
    /// type, or a location holding one).
    pub fn resolve_type_operand(&mut self, operand: &Reference) -> VmResult<Type> {
        match self.resolve(operand)? {
            Reference::TypeRef(ty) => Ok(ty),
            Reference::OType(object) => Ok(Type::Object(object)),
            other => Err(svi_core::SviError::invalid_operand(
                "type".to_string(),
                other.to_string(),
            )
            .into()),
        }
    }

    /// Resolve an operand to a callable.
    pub fn resolve_function_operand(&mut self, operand: &Reference) -> VmResult<FunctionReference> {
        match self.resolve(operand)? {
            Reference::Function(function) => Ok(function),
            other => Err(svi_core::SviError::invalid_operand(
                "function".to_string(),
                other.to_string(),
            )
            .into()),
        }
    }

    /// The call currently being performed, walking the scope chain.
    pub fn current_call(&self) -> Option<&FunctionCall> {
        self.scope.as_ref()?.call()
    }

    /// The call just returned from, if the current instruction is being
    /// re-executed at a return site.
    pub fn returned_call(&self) -> Option<&FunctionCall> {
        self.returned_call.as_ref()
    }

    /// Consume the returned call, yielding its value.
    pub fn take_returned_value(&mut self) -> Reference {
        self.returned_call
            .take()
            .and_then(|call| call.returned().cloned())
            .unwrap_or(Reference::Void)
    }

    /// Mark that the next performed call's return value will be consumed
    /// at the call site.
    pub fn set_capture_return(&mut self) {
        self.capture_return = true;
    }

    /// Perform a call through the backend that owns the function.
    ///
    /// Provider and intrinsic calls complete synchronously and yield a
    /// value; inline calls transfer control and complete when `return`
    /// re-executes the call site.
    pub fn perform_call(&mut self, call: FunctionCall) -> VmResult<Outcome> {
        match call.backend() {
            FunctionBackend::Provider => {
                let value = self.call_provider(&call)?;
                Ok(Outcome::Value(value))
            }
            FunctionBackend::Intrinsic => {
                let value = self.call_intrinsic(&call)?;
                Ok(Outcome::Value(value))
            }
            FunctionBackend::Inline => {
                self.enter_inline_call(call)?;
                Ok(Outcome::Jumped)
            }
        }
    }

    fn call_provider(&mut self, call: &FunctionCall) -> VmResult<Reference> {
        let provider = self
            .providers
            .iter()
            .rev()
            .find(|provider| provider.load_function(call.name()).is_some())
            .cloned()
            .ok_or_else(|| VmError::unknown_function(call.name()))?;
        provider.call(self, call)
    }

    fn call_intrinsic(&mut self, call: &FunctionCall) -> VmResult<Reference> {
        if call.name() != fabric::TUNNEL_FUNCTION {
            return Err(VmError::unknown_function(call.name()));
        }

        let mut operands = call.vector().iter().map(|(_, value)| value.clone());
        let (Some(Reference::StringVal(id)), Some(Reference::StringVal(operation)), Some(frame)) =
            (operands.next(), operands.next(), operands.next())
        else {
            return Err(VmError::queue("malformed tunneled operation call"));
        };
        let items = match frame {
            Reference::Enumeration(items) => items.snapshot(),
            other => vec![other],
        };

        let resource = self
            .fabric
            .local(&id)
            .ok_or_else(|| VmError::UnknownResource { id: id.clone() })?;
        let results = resource.perform(self, &operation, items)?;

        let out = svi_core::EnumerationHandle::new(Type::Ambiguous);
        for result in results {
            out.append(result);
        }
        Ok(Reference::Enumeration(out))
    }

    fn enter_inline_call(&mut self, call: FunctionCall) -> VmResult<()> {
        let name = call.name().to_string();
        let entry = self.state()?.function_entry(&name)?;
        let params = self.state()?.function_params(&name)?;

        let capture = std::mem::take(&mut self.capture_return);
        let exception_frame = std::mem::take(&mut self.next_call_is_exception_frame);
        let scope_id = self.global.uuid();
        let scope = self.scope.take().ok_or(VmError::NotInitialized)?;
        let mut frame = scope.child_for_call(scope_id, call.clone());
        frame.set_capture_return(capture);
        frame.set_is_exception_frame(exception_frame);

        // Bind formals: shadow each parameter location in the call frame
        // and store the applied argument under the shadow.
        for ((_, location), (formal, value)) in params.iter().zip(call.vector()) {
            frame.shadow(location);
            let backing = frame.resolve(location);
            self.route(&backing)?.typify(&backing, formal.clone());
            self.route(&backing)?.store(&backing, value.clone())?;
        }

        self.scope = Some(frame);
        let scope = self.scope.as_mut().expect("scope just set");
        self.state
            .as_mut()
            .ok_or(VmError::NotInitialized)?
            .jump_call(scope, entry)?;
        self.should_advance = false;
        Ok(())
    }

    /// Record the produced value on the innermost call.
    pub fn set_call_return(&mut self, value: Reference) -> VmResult<()> {
        if let Some(call) = self.scope_mut()?.call_mut() {
            call.set_returned(value);
        }
        Ok(())
    }

    /// Perform a function-call return: pop frames to (and including) the
    /// innermost frame holding a return position, jump there if asked,
    /// and surface the completed call for the re-executed call site.
    pub fn return_to_caller(&mut self, should_jump: bool) -> VmResult<()> {
        loop {
            let frame = self.scope.take().ok_or(VmError::NotInitialized)?;
            let frame_id = frame.id().to_string();
            let return_pc = frame.return_pc();
            let own_call = frame.own_call().cloned();

            match frame.exit() {
                Some(parent) => self.scope = Some(parent),
                None => {
                    return Err(svi_core::SviError::malformed(
                        "cannot make return jump: the call stack is empty",
                    )
                    .into());
                }
            }
            self.release_frame_holdings(&frame_id)?;

            if let Some(pc) = return_pc {
                if should_jump {
                    self.state_mut()?.jump(pc)?;
                    self.should_advance = false;
                }
                if let Some(call) = own_call {
                    self.returned_call = Some(call);
                    self.return_set_this_step = true;
                }
                return Ok(());
            }
        }
    }

    // --- scopes ---

    /// Shadow a location in the current scope: later lookups of the name
    /// resolve to a frame-private slot.
    pub fn shadow(&mut self, location: &LocationReference) -> VmResult<()> {
        self.scope_mut()?.shadow(location);
        Ok(())
    }

    /// Enter a plain child scope.
    pub fn enter_scope(&mut self) -> VmResult<()> {
        let id = self.global.uuid();
        let scope = self.scope.take().ok_or(VmError::NotInitialized)?;
        self.scope = Some(scope.child(id));
        Ok(())
    }

    /// Pop the current scope, releasing anything it holds.
    pub fn exit_scope(&mut self) -> VmResult<()> {
        let frame = self.scope.take().ok_or(VmError::NotInitialized)?;
        let frame_id = frame.id().to_string();
        let parent = frame.exit().ok_or_else(|| {
            VmError::Core(svi_core::SviError::malformed("cannot exit the root scope"))
        })?;
        self.scope = Some(parent);
        self.release_frame_holdings(&frame_id)
    }

    fn release_frame_holdings(&mut self, frame_id: &str) -> VmResult<()> {
        let mut kept = Vec::new();
        for mut held in self.locks.drain(..) {
            if held.scope_id == frame_id {
                if let Some(lock) = held.lock.take() {
                    lock.release();
                }
            } else {
                kept.push(held);
            }
        }
        self.locks = kept;

        let released: Vec<_> = self
            .held_resources
            .iter()
            .filter(|held| held.scope_id == frame_id)
            .map(|held| held.id.clone())
            .collect();
        self.held_resources.retain(|held| held.scope_id != frame_id);
        for id in released {
            let resource = self.fabric.local(&id);
            if let Some(resource) = resource {
                resource.release(self)?;
            }
        }
        Ok(())
    }

    // --- locks ---

    /// True if this machine already holds the location's lock.
    pub fn has_lock(&self, location: &LocationReference) -> bool {
        let fq = location.fq_name();
        self.locks.iter().any(|held| held.fq_name == fq)
    }

    /// Acquire the location's lock, retry-sleeping until it is free.
    pub fn lock(&mut self, location: &LocationReference) -> VmResult<()> {
        if self.has_lock(location) {
            return Ok(());
        }

        let resolved = self.scope()?.resolve(location);
        let scope_id = self.scope()?.id().to_string();
        loop {
            if let Some(lock) = self.route(&resolved)?.acquire(&resolved) {
                self.locks.push(HeldLock {
                    scope_id: scope_id.clone(),
                    fq_name: location.fq_name(),
                    lock: Some(lock),
                });
                return Ok(());
            }
            if self.shutdown.is_triggered() {
                return Err(VmError::shutdown(format!("lock {}", location.fq_name())));
            }
            tracing::debug!(location = %location.fq_name(), "waiting for lock");
            std::thread::sleep(Duration::from_millis(self.config.lock_sleep_ms));
        }
    }

    /// Release the location's lock; a no-op when not held.
    pub fn unlock(&mut self, location: &LocationReference) {
        let fq = location.fq_name();
        if let Some(index) = self.locks.iter().position(|held| held.fq_name == fq) {
            let mut held = self.locks.remove(index);
            if let Some(lock) = held.lock.take() {
                lock.release();
            }
        }
    }

    /// Record a resource as held by the current scope, so an unwind
    /// releases it.
    pub fn hold_resource(&mut self, id: impl Into<String>) -> VmResult<()> {
        let scope_id = self.scope()?.id().to_string();
        self.held_resources.push(HeldResource {
            scope_id,
            id: id.into(),
        });
        Ok(())
    }

    /// Drop the holding record for a resource (it was released in-line).
    pub fn unhold_resource(&mut self, id: &str) {
        if let Some(index) = self
            .held_resources
            .iter()
            .rposition(|held| held.id == id)
        {
            self.held_resources.remove(index);
        }
    }

    // --- streams ---

    pub fn local_output(&self) -> Arc<dyn Stream> {
        Arc::clone(&self.local_out)
    }

    pub fn local_error(&self) -> Arc<dyn Stream> {
        Arc::clone(&self.local_err)
    }

    /// The lazily-opened shared stdout stream.
    pub fn shared_output(&mut self) -> Arc<dyn Stream> {
        if self.shared_out.is_none() {
            self.shared_out = Some(self.stream_driver.open("s:STDOUT", &Type::String));
        }
        Arc::clone(self.shared_out.as_ref().expect("just opened"))
    }

    /// The lazily-opened shared stderr stream.
    pub fn shared_error(&mut self) -> Arc<dyn Stream> {
        if self.shared_err.is_none() {
            self.shared_err = Some(self.stream_driver.open("s:STDERR", &Type::String));
        }
        Arc::clone(self.shared_err.as_ref().expect("just opened"))
    }

    /// Open (or re-bind) a stream by id.
    pub fn open_stream(&mut self, id: &str, inner_type: &Type) -> Arc<dyn Stream> {
        match id {
            "local::out" => self.local_output(),
            "local::err" => self.local_error(),
            "s:STDOUT" => self.shared_output(),
            "s:STDERR" => self.shared_error(),
            _ => self.stream_driver.open(id, inner_type),
        }
    }

    // --- queue contexts and deferred calls ---

    pub fn current_queue_context(&self) -> QueueContextId {
        self.queue_contexts.last().cloned().unwrap_or_default()
    }

    /// Enter a fresh queue context and focus the queue on it.
    pub fn enter_queue_context(&mut self) -> QueueContextId {
        let context = self.global.uuid();
        self.queue_contexts.push(context.clone());
        self.queue.set_context(&context);
        context
    }

    /// Re-enter a previously created context.
    pub fn resume_queue_context(&mut self, context: QueueContextId) {
        self.queue.set_context(&context);
        self.queue_contexts.push(context);
    }

    /// Leave the current context, returning to the previous one.
    pub fn pop_queue_context(&mut self) {
        self.queue_contexts.pop();
        let context = self.current_queue_context();
        self.queue.set_context(&context);
    }

    /// Snapshot of the node-private store, captured into queue jobs.
    fn capture_locals(&self) -> Vec<(String, Reference)> {
        let probe = LocationReference::new(Affinity::Local, "probe");
        self.stores
            .iter()
            .rev()
            .find(|store| store.manages(&probe))
            .map(|store| store.snapshot())
            .unwrap_or_default()
    }

    fn restore_locals(&mut self, entries: &[(String, Reference)]) {
        let probe = LocationReference::new(Affinity::Local, "probe");
        if let Some(store) = self
            .stores
            .iter_mut()
            .rev()
            .find(|store| store.manages(&probe))
        {
            store.restore_entries(entries);
        }
    }

    /// Defer a call onto the queue; returns the job id.
    pub fn push_call(&mut self, call: FunctionCall) -> VmResult<JobId> {
        let id = self.queue.next_job_id();
        let job = QueueJob {
            id,
            context: self.current_queue_context(),
            call,
            scope: self.scope()?.clone(),
            state: self.state()?.clone(),
            locals: self.capture_locals(),
            filters: self.global.scheduling_filters(),
        };
        tracing::debug!(job = id, context = %job.context, "push deferred call");
        let queue = Arc::clone(&self.queue);
        queue.push(self, job)?;
        Ok(id)
    }

    /// Record that a deferred job's return value must land in a location
    /// when the context drains.
    pub fn defer_assignment(&mut self, job: JobId, dest: LocationReference) {
        self.pending_assignments.push(PendingAssignment {
            context: self.current_queue_context(),
            job,
            dest,
        });
    }

    /// Block until the current context has no pending or running jobs,
    /// then merge delivered return values into their assignment targets.
    pub fn drain(&mut self) -> VmResult<ReturnValueMapHandle> {
        let context = self.current_queue_context();
        loop {
            let pending = self.queue.pending(&context);
            let running = self.queue.running(&context);
            if pending == 0 && running == 0 {
                break;
            }
            if self.shutdown.is_triggered() {
                return Err(VmError::shutdown("drain"));
            }
            tracing::trace!(context = %context, pending, running, "waiting for drain");
            std::thread::sleep(Duration::from_millis(self.config.drain_sleep_ms));
        }

        let returns = self.queue.returns(&context);
        let due: Vec<_> = self
            .pending_assignments
            .iter()
            .enumerate()
            .filter(|(_, pending)| pending.context == context)
            .map(|(index, pending)| (index, pending.job, pending.dest.clone()))
            .collect();
        for (_, job, dest) in &due {
            if let Some(value) = returns.get(*job) {
                self.store_value(dest, value)?;
            }
        }
        for (index, _, _) in due.iter().rev() {
            self.pending_assignments.remove(*index);
        }

        Ok(returns)
    }

    /// Execute exactly one captured call to completion and return its
    /// value. Used by workers and by nested evaluations (handler
    /// discriminators).
    pub fn execute_call(&mut self, call: FunctionCall) -> VmResult<Reference> {
        match self.perform_call(call)? {
            Outcome::Value(value) => Ok(value),
            Outcome::Exited => Ok(Reference::Void),
            Outcome::Jumped => {
                let base_depth = self.scope()?.depth() - 1;
                while self.scope()?.depth() > base_depth {
                    if self.exited || self.state()?.is_end_of_program() {
                        break;
                    }
                    self.step()?;
                }
                let value = self.take_returned_value();
                // The nested return moved the pc back to the caller's
                // instruction; that instruction is still mid-execution and
                // must advance normally when it finishes.
                self.should_advance = true;
                Ok(value)
            }
        }
    }

    /// Restore a captured job and run its call; the worker entry point.
    pub fn run_job(&mut self, job: &QueueJob) -> VmResult<Reference> {
        tracing::debug!(job = job.id, call = %job.call, "run deferred job");
        self.restore(job.scope.clone(), job.state.clone());
        self.restore_locals(&job.locals);
        self.queue.set_context(&job.context);
        self.queue_contexts = vec![job.context.clone()];
        self.execute_call(job.call.clone())
    }

    /// Tunnel an operation on a non-local resource to its owner and wait
    /// for the result frame.
    pub fn tunnel_operation(
        &mut self,
        handle: &svi_core::ResourceHandle,
        operation: &str,
        operands: Vec<Reference>,
    ) -> VmResult<Vec<Reference>> {
        let frame = svi_core::EnumerationHandle::new(Type::Ambiguous);
        for operand in operands {
            frame.append(operand);
        }

        let call = fabric::tunnel_function_reference()
            .curry(Reference::StringVal(handle.id().to_string()))?
            .curry(Reference::StringVal(operation.to_string()))?
            .curry(Reference::Enumeration(frame))?
            .to_call()?;

        self.enter_queue_context();
        let result = (|| {
            let id = self.queue.next_job_id();
            let mut filters = self.global.scheduling_filters();
            filters.insert(fabric::NODE_FILTER.to_string(), handle.owner().to_string());
            let job = QueueJob {
                id,
                context: self.current_queue_context(),
                call,
                scope: self.scope()?.clone(),
                state: self.state()?.clone(),
                locals: self.capture_locals(),
                filters,
            };
            let queue = Arc::clone(&self.queue);
            queue.push(self, job)?;
            let returns = self.drain()?;
            Ok(match returns.get(id) {
                Some(Reference::Enumeration(items)) => items.snapshot(),
                Some(other) => vec![other],
                None => Vec::new(),
            })
        })();
        self.pop_queue_context();
        result
    }

    // --- exceptions ---

    /// Handle a raised code: find the innermost matching handler (code
    /// selectors first, then discriminators, then universal handlers),
    /// unwind to its frame, and call it. The handler returns to the
    /// `raise` site; `resume` may redirect from there.
    pub fn raise(&mut self, code: f64) -> VmResult<Outcome> {
        if let Some((frame_id, handler)) = self.find_handler(code)? {
            self.unwind_to(&frame_id)?;

            let call = match handler.remaining().first() {
                Some(_) => handler.curry(Reference::Number(code))?.to_call()?,
                None => handler.to_call()?,
            };

            self.next_call_is_exception_frame = true;
            let outcome = self.perform_call(call)?;
            self.next_call_is_exception_frame = false;
            return Ok(outcome);
        }

        Err(VmError::UnhandledException { code })
    }

    /// Push a handler onto the current scope's stack; returns its id.
    pub fn push_exception_handler(
        &mut self,
        selector: svi_core::HandlerSelector,
        handler: FunctionReference,
    ) -> VmResult<String> {
        let id = self.global.uuid();
        self.scope_mut()?.push_handler(id.clone(), selector, handler);
        Ok(id)
    }

    /// Remove a handler by id anywhere on the scope chain.
    pub fn pop_exception_handler(&mut self, id: &str) -> VmResult<()> {
        self.scope_mut()?.pop_handler(id);
        Ok(())
    }

    fn find_handler(&mut self, code: f64) -> VmResult<Option<(String, FunctionReference)>> {
        use svi_core::HandlerSelector;

        // Selector kinds are tried in priority order across the whole
        // chain: exact codes beat discriminators beat universal handlers.
        let mut discriminators = Vec::new();
        let mut universals = Vec::new();

        let mut frame = Some(self.scope()?);
        while let Some(current) = frame {
            for handler in current.handlers() {
                match &handler.selector {
                    HandlerSelector::Code(expected) if *expected == code => {
                        return Ok(Some((current.id().to_string(), handler.handler.clone())));
                    }
                    HandlerSelector::Code(_) => {}
                    HandlerSelector::Discriminator(predicate) => {
                        discriminators.push((
                            current.id().to_string(),
                            predicate.clone(),
                            handler.handler.clone(),
                        ));
                    }
                    HandlerSelector::Universal => {
                        universals.push((current.id().to_string(), handler.handler.clone()));
                    }
                }
            }
            frame = current.parent();
        }

        for (frame_id, predicate, handler) in discriminators {
            let call = predicate.curry(Reference::Number(code))?.to_call()?;
            if let Reference::Boolean(true) = self.execute_call(call)? {
                return Ok(Some((frame_id, handler)));
            }
        }

        Ok(universals.into_iter().next().map(|(id, h)| (id, h)))
    }

    fn unwind_to(&mut self, frame_id: &str) -> VmResult<()> {
        while self.scope()?.id() != frame_id {
            self.exit_scope()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::local_streams::BufferSink;
    use svi_core::parser;

    fn machine_with_sink(source: &str) -> (VirtualMachine, Arc<BufferSink>) {
        let sink = Arc::new(BufferSink::new());
        let mut vm = VirtualMachine::local(Config::default());
        vm.set_sink(sink.clone());
        vm.initialize(parser::parse(source).expect("parse")).expect("initialize");
        (vm, sink)
    }

    #[test]
    fn primitive_locations_resolve_to_type_literals() {
        let (mut vm, _sink) = machine_with_sink("exit");
        let number = vm
            .load_from_store(&LocationReference::new(Affinity::Primitive, "NUMBER"))
            .unwrap();
        assert_eq!(number, Reference::TypeRef(Type::Number));

        let lambda = vm
            .load_from_store(&LocationReference::new(Affinity::Primitive, "LAMBDA0"))
            .unwrap();
        assert_eq!(
            lambda,
            Reference::TypeRef(Type::Lambda0(Box::new(Type::Ambiguous)))
        );
    }

    #[test]
    fn store_and_load_round_trip_with_inference() {
        let (mut vm, _sink) = machine_with_sink("exit");
        let loc = LocationReference::new(Affinity::Local, "x");
        vm.store_value(&loc, Reference::Number(4.0)).unwrap();
        assert_eq!(vm.load_from_store(&loc).unwrap(), Reference::Number(4.0));
        assert_eq!(vm.type_of_location(&loc).unwrap(), Some(Type::Number));

        // The inferred type now constrains later stores.
        assert!(vm
            .store_value(&loc, Reference::StringVal("no".into()))
            .is_err());
    }

    #[test]
    fn fork_shares_queue_but_copies_local_store() {
        let (mut vm, _sink) = machine_with_sink("exit");
        let loc = LocationReference::new(Affinity::Local, "x");
        vm.store_value(&loc, Reference::Number(1.0)).unwrap();

        let mut fork = vm.fork();
        fork.store_value(&loc, Reference::Number(2.0)).unwrap();
        assert_eq!(vm.load_from_store(&loc).unwrap(), Reference::Number(1.0));
        assert!(Arc::ptr_eq(&vm.queue(), &fork.queue()));
    }

    #[test]
    fn lock_is_idempotent_per_machine() {
        let (mut vm, _sink) = machine_with_sink("exit");
        let loc = LocationReference::new(Affinity::Shared, "x");
        vm.lock(&loc).unwrap();
        assert!(vm.has_lock(&loc));
        // Re-locking a held location returns immediately.
        vm.lock(&loc).unwrap();
        vm.unlock(&loc);
        assert!(!vm.has_lock(&loc));
        // Unlocking again is a no-op.
        vm.unlock(&loc);
    }

    #[test]
    fn queue_contexts_nest() {
        let (mut vm, _sink) = machine_with_sink("exit");
        let root = vm.current_queue_context();
        let inner = vm.enter_queue_context();
        assert_eq!(vm.current_queue_context(), inner);
        vm.pop_queue_context();
        assert_eq!(vm.current_queue_context(), root);

        vm.resume_queue_context(inner.clone());
        assert_eq!(vm.current_queue_context(), inner);
        vm.pop_queue_context();
        assert_eq!(vm.current_queue_context(), root);
    }

    #[test]
    fn execute_call_runs_exactly_one_call() {
        let (mut vm, sink) = machine_with_sink(
            "
            beginfn f:hello $p:VOID
              out \"hello\"
              return
            out \"never reached by the call\"
            ",
        );
        let function = VirtualMachine::lookup_function(&mut vm, "hello").unwrap();
        let value = vm.execute_call(function.to_call().unwrap()).unwrap();
        assert_eq!(value, Reference::Void);
        assert_eq!(sink.out_lines(), vec!["hello"]);
        // The call frame was popped on return.
        assert!(vm.current_call().is_none());
    }

    #[test]
    fn scopes_shadow_without_touching_parent_bindings() {
        let (mut vm, _sink) = machine_with_sink("exit");
        let loc = LocationReference::new(Affinity::Local, "x");
        vm.store_value(&loc, Reference::Number(1.0)).unwrap();

        vm.enter_scope().unwrap();
        vm.shadow(&loc).unwrap();
        vm.store_value(&loc, Reference::Number(2.0)).unwrap();
        assert_eq!(vm.load_from_store(&loc).unwrap(), Reference::Number(2.0));

        vm.exit_scope().unwrap();
        assert_eq!(vm.load_from_store(&loc).unwrap(), Reference::Number(1.0));
    }

    #[test]
    fn exiting_a_scope_releases_its_locks() {
        let (mut vm, _sink) = machine_with_sink("exit");
        let loc = LocationReference::new(Affinity::Shared, "x");

        vm.enter_scope().unwrap();
        vm.lock(&loc).unwrap();
        assert!(vm.has_lock(&loc));
        vm.exit_scope().unwrap();
        assert!(!vm.has_lock(&loc));
    }

    #[test]
    fn unknown_functions_are_reported() {
        let (mut vm, _sink) = machine_with_sink("exit");
        assert!(matches!(
            VirtualMachine::lookup_function(&mut vm, "missing"),
            Err(VmError::UnknownFunction { .. })
        ));
    }
}

impl WireContext for VirtualMachine {
    fn node_id(&self) -> String {
        self.global.node_id()
    }

    fn publish_resource(&mut self, resource: &svi_core::ResourceHandle) {
        self.fabric.publish_handle(resource);
    }

    fn lookup_function(
        &self,
        backend: FunctionBackend,
        name: &str,
    ) -> Option<FunctionReference> {
        match backend {
            FunctionBackend::Intrinsic if name == fabric::TUNNEL_FUNCTION => {
                Some(fabric::tunnel_function_reference())
            }
            FunctionBackend::Provider => self
                .providers
                .iter()
                .rev()
                .find_map(|provider| provider.load_function(name))
                .map(|function| function.reference()),
            _ => None,
        }
    }
}
