//! The interpreter: engine state shared by every thread, and the per-thread
//! frame stack with its dispatch loop.
//!
//! A [`Thread`] runs frames until the frame it was asked to run returns to
//! its [`ResultSink::Host`]. Guest exceptions travel as
//! [`Trap::Throw`] until [`Thread::unwind`] finds a handler; engine faults
//! travel as [`Trap::Fatal`] and are never visible to guest code.

use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::config::RuntimeConfig;
use crate::error::VmError;

use super::bootstrap::names;
use super::class::{Class, ClassId, Constant, InitStep, MemberRef, Method, ResolvedField};
use super::debug::Backtrace;
use super::descriptor::FieldKind;
use super::exception::{
    find_handler, Control, ExceptionSignal, Exec, GuestError, Outcome, Trap,
};
use super::frame::{Frame, ResultSink, SlotFault};
use super::heap::{Heap, MemoryManager, ObjectRef};
use super::invoke::{BootstrapLinker, ConstantCallSiteLinker, DispatchKind, Entered};
use super::monitor::MonitorTable;
use super::native::{NativeFn, NativeRegistry};
use super::numeric;
use super::ops::Instruction;
use super::registry::{ClassLoader, ClassRegistry};
use super::resolver::{LinkError, Resolver};
use super::threads::{next_thread_id, ThreadControl, ThreadSpawner};
use super::value::Value;

fn load_core(registry: &ClassRegistry, name: &str) -> Result<Arc<Class>, VmError> {
    registry.load(name).map_err(|e| VmError::BootstrapClass {
        class: name.to_string(),
        message: e.to_string(),
    })
}

// ========================================
// Shared engine state
// ========================================

/// Everything threads share: classes, heap, monitors, natives and output.
pub struct Vm {
    pub(crate) registry: ClassRegistry,
    pub(crate) heap: Box<dyn MemoryManager>,
    pub(crate) monitors: MonitorTable,
    pub(crate) natives: NativeRegistry,
    pub(crate) linker: Box<dyn BootstrapLinker>,
    pub(crate) config: RuntimeConfig,
    interned: Mutex<HashMap<String, ObjectRef>>,
    mirrors: RwLock<HashMap<ObjectRef, ClassId>>,
    output: Mutex<Box<dyn Write + Send>>,
    pub(crate) threads: ThreadSpawner,
    /// Allocated up front so heap exhaustion can always be reported.
    out_of_memory: ObjectRef,
}

impl Vm {
    pub fn builder() -> VmBuilder {
        VmBuilder::new()
    }

    pub fn registry(&self) -> &ClassRegistry {
        &self.registry
    }

    pub fn heap(&self) -> &dyn MemoryManager {
        self.heap.as_ref()
    }

    pub fn monitors(&self) -> &MonitorTable {
        &self.monitors
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn threads(&self) -> &ThreadSpawner {
        &self.threads
    }

    /// A new guest thread bound to the calling OS thread.
    pub fn new_thread(self: &Arc<Self>) -> Thread {
        let control = self.threads.register(next_thread_id());
        Thread::attach(Arc::clone(self), control)
    }

    /// Wait for every spawned thread. Uncaught guest exceptions were
    /// already reported by the thread itself; the first engine fault is
    /// returned.
    pub fn join_threads(&self) -> Result<(), VmError> {
        let mut first = None;
        // Joined threads may have started more threads.
        loop {
            let results = self.threads.join_all();
            if results.is_empty() {
                break;
            }
            for (id, result) in results {
                if let Err(e) = result {
                    tracing::error!(thread = id, error = %e, "thread failed");
                    first.get_or_insert(e);
                }
            }
        }
        first.map_or(Ok(()), Err)
    }

    pub fn write_output(&self, text: &str) -> Result<(), VmError> {
        let mut out = self.output.lock();
        out.write_all(text.as_bytes())?;
        out.flush()?;
        Ok(())
    }

    pub(crate) fn core_class(&self, name: &str) -> Result<Arc<Class>, VmError> {
        load_core(&self.registry, name)
    }

    /// The class a `java.lang.Class` object stands for.
    pub fn class_of_mirror(&self, mirror: ObjectRef) -> Option<ClassId> {
        self.mirrors.read().get(&mirror).copied()
    }

    /// Offset and kind of a named instance field declared by `class` or a
    /// superclass.
    pub(crate) fn instance_field(
        &self,
        class: &Class,
        name: &str,
    ) -> Result<(usize, FieldKind), VmError> {
        if let Some(field) = class.instance_field(name) {
            return Ok((field.offset, field.kind));
        }
        let mut next = class.super_class;
        while let Some(id) = next {
            let current = self.registry.get(id)?;
            if let Some(field) = current.instance_field(name) {
                return Ok((field.offset, field.kind));
            }
            next = current.super_class;
        }
        Err(VmError::BootstrapClass {
            class: class.name.clone(),
            message: format!("no instance field {}", name),
        })
    }

    /// UTF-16 code units of a `java.lang.String`.
    pub fn string_units(&self, string: ObjectRef) -> Result<Vec<u16>, VmError> {
        let class = self.core_class(names::STRING)?;
        let (offset, _) = self.instance_field(&class, "value")?;
        let Value::Ref(Some(chars)) = self.heap.read_field(string, offset)? else {
            return Ok(Vec::new());
        };
        Ok(self
            .heap
            .array_elements(chars)?
            .into_iter()
            .map(|v| v.as_int().unwrap_or(0) as u16)
            .collect())
    }

    /// Contents of a `java.lang.String`.
    pub fn string_value(&self, string: ObjectRef) -> Result<String, VmError> {
        Ok(String::from_utf16_lossy(&self.string_units(string)?))
    }

    /// `detailMessage` of a throwable, if set.
    pub fn throwable_message(&self, throwable: ObjectRef) -> Result<Option<String>, VmError> {
        let class = self.core_class(names::THROWABLE)?;
        let (offset, _) = self.instance_field(&class, "detailMessage")?;
        match self.heap.read_field(throwable, offset)? {
            Value::Ref(Some(message)) => self.string_value(message).map(Some),
            _ => Ok(None),
        }
    }

    /// `java.lang.Foo: message`, the way `Throwable.toString` prints.
    pub fn describe_throwable(&self, throwable: ObjectRef) -> Result<String, VmError> {
        let class = self.registry.get(self.heap.class_of(throwable)?)?;
        let mut text = class.java_name();
        if let Some(message) = self.throwable_message(throwable)? {
            text.push_str(": ");
            text.push_str(&message);
        }
        Ok(text)
    }
}

// ========================================
// Builder
// ========================================

/// An output sink that can be read back, for capturing guest output.
#[derive(Debug, Clone, Default)]
pub struct SharedOutput(Arc<Mutex<Vec<u8>>>);

impl SharedOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl Write for SharedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct VmBuilder {
    config: RuntimeConfig,
    loaders: Vec<Box<dyn ClassLoader>>,
    heap: Option<Box<dyn MemoryManager>>,
    natives: NativeRegistry,
    linker: Box<dyn BootstrapLinker>,
    output: Box<dyn Write + Send>,
}

impl VmBuilder {
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
            loaders: Vec::new(),
            heap: None,
            natives: NativeRegistry::with_bootstrap(),
            linker: Box::new(ConstantCallSiteLinker),
            output: Box::new(io::stdout()),
        }
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a loader consulted after the bootstrap classes and any loader
    /// added earlier.
    pub fn loader(mut self, loader: impl ClassLoader + 'static) -> Self {
        self.loaders.push(Box::new(loader));
        self
    }

    /// Replace the default heap. `heap_limit` is ignored.
    pub fn memory_manager(mut self, heap: impl MemoryManager + 'static) -> Self {
        self.heap = Some(Box::new(heap));
        self
    }

    /// Bind a native method implementation, replacing any bootstrap one.
    pub fn native<F>(mut self, class: &str, name: &str, descriptor: &str, f: F) -> Self
    where
        F: Fn(&mut Thread, &[Value]) -> Exec<Option<Value>> + Send + Sync + 'static,
    {
        let f: NativeFn = Arc::new(f);
        self.natives.register(class, name, descriptor, f);
        self
    }

    pub fn linker(mut self, linker: impl BootstrapLinker + 'static) -> Self {
        self.linker = Box::new(linker);
        self
    }

    pub fn output(mut self, output: impl Write + Send + 'static) -> Self {
        self.output = Box::new(output);
        self
    }

    pub fn build(self) -> Result<Arc<Vm>, VmError> {
        let mut registry = ClassRegistry::new(self.config.verify);
        for loader in self.loaders {
            registry = registry.with_loader(loader);
        }
        let heap: Box<dyn MemoryManager> = match self.heap {
            Some(heap) => heap,
            None => Box::new(Heap::with_limit(self.config.heap_limit)),
        };

        let oom = load_core(&registry, names::OUT_OF_MEMORY)?;
        let out_of_memory = heap
            .allocate_instance(oom.id, &oom.layout)
            .map_err(|e| VmError::OutOfMemory(e.to_string()))?;

        tracing::debug!(
            classes = registry.len(),
            natives = self.natives.len(),
            verify = self.config.verify,
            "engine ready"
        );
        Ok(Arc::new(Vm {
            registry,
            heap,
            monitors: MonitorTable::new(),
            natives: self.natives,
            linker: self.linker,
            config: self.config,
            interned: Mutex::new(HashMap::new()),
            mirrors: RwLock::new(HashMap::new()),
            output: Mutex::new(self.output),
            threads: ThreadSpawner::new(),
            out_of_memory,
        }))
    }
}

impl Default for VmBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ========================================
// Macros for instruction bodies
// ========================================

macro_rules! binary {
    ($thread:ident, $pop:ident, $variant:ident, |$a:ident, $b:ident| $result:expr) => {{
        let frame = $thread.frame()?;
        let $b = frame.$pop()?;
        let $a = frame.$pop()?;
        frame.push(Value::$variant($result))?;
    }};
}

macro_rules! unary {
    ($thread:ident, $pop:ident, $variant:ident, |$a:ident| $result:expr) => {{
        let frame = $thread.frame()?;
        let $a = frame.$pop()?;
        frame.push(Value::$variant($result))?;
    }};
}

macro_rules! shift {
    ($thread:ident, $pop:ident, $variant:ident, $op:path) => {{
        let frame = $thread.frame()?;
        let s = frame.pop_int()?;
        let a = frame.$pop()?;
        frame.push(Value::$variant($op(a, s)))?;
    }};
}

macro_rules! divide {
    ($thread:ident, $pop:ident, $variant:ident, $op:path) => {{
        let frame = $thread.frame()?;
        let b = frame.$pop()?;
        let a = frame.$pop()?;
        match $op(a, b) {
            Some(r) => frame.push(Value::$variant(r))?,
            None => {
                return Err($thread.raise(GuestError::new(names::ARITHMETIC, "/ by zero")));
            }
        }
    }};
}

macro_rules! stack_op {
    ($thread:ident, $op:ident) => {{
        let frame = $thread.frame()?;
        frame.stack.$op().map_err(|f| f.in_method(&frame.method))?;
    }};
}

fn jump_if(condition: bool, target: usize) -> Control {
    if condition {
        Control::Jump(target)
    } else {
        Control::Continue
    }
}

// ========================================
// Threads
// ========================================

/// One guest thread: a frame stack executing against a shared [`Vm`].
pub struct Thread {
    pub(crate) vm: Arc<Vm>,
    pub(crate) control: Arc<ThreadControl>,
    pub(crate) frames: Vec<Frame>,
}

impl Thread {
    pub(crate) fn attach(vm: Arc<Vm>, control: Arc<ThreadControl>) -> Self {
        Self {
            vm,
            control,
            frames: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.control.id
    }

    pub fn vm(&self) -> &Arc<Vm> {
        &self.vm
    }

    pub fn control(&self) -> &Arc<ThreadControl> {
        &self.control
    }

    /// Number of active frames.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Active frames, innermost first.
    pub fn backtrace(&self) -> Backtrace {
        Backtrace {
            frames: self.frames.iter().rev().map(Frame::trace_element).collect(),
        }
    }

    pub(crate) fn frame(&mut self) -> Result<&mut Frame, VmError> {
        self.frames.last_mut().ok_or(VmError::NoFrame)
    }

    // ----------------------------------------
    // Host entry points
    // ----------------------------------------

    /// Run `method` to completion on this thread. Guest exceptions that
    /// escape come back as [`Outcome::Threw`]; engine faults as `Err`.
    pub fn invoke(&mut self, method: Arc<Method>, args: &[Value]) -> Result<Outcome, VmError> {
        if args.len() != method.arg_count() {
            return Err(VmError::ArgumentCount {
                method: method.qualified_name(),
                expected: method.arg_count(),
                found: args.len(),
            });
        }
        let base = self.frames.len();
        let result = self.host_call(method, args);
        self.finish(base, result)
    }

    /// Resolve a static method by name and run it.
    pub fn invoke_static(
        &mut self,
        class: &str,
        name: &str,
        descriptor: &str,
        args: &[Value],
    ) -> Result<Outcome, VmError> {
        let base = self.frames.len();
        let result = self.find_static(class, name, descriptor);
        let method = match result {
            Ok(method) => method,
            Err(trap) => return self.finish(base, Err(trap)),
        };
        self.invoke(method, args)
    }

    fn find_static(&mut self, class: &str, name: &str, descriptor: &str) -> Exec<Arc<Method>> {
        let vm = Arc::clone(&self.vm);
        let owner = vm.registry.load(class).map_err(|e| self.raise(e))?;
        let member = MemberRef::new(owner.name.clone(), name.to_string(), descriptor.to_string());
        let method = Resolver::new(&vm.registry)
            .lookup_method(&owner, &member, owner.is_interface())
            .map_err(|e| self.link_error(e))?;
        if !method.is_static() {
            return Err(self.raise(GuestError::new(
                names::INCOMPATIBLE_CLASS_CHANGE,
                format!("Expected static method {}", method.qualified_name()),
            )));
        }
        Ok(method)
    }

    fn host_call(&mut self, method: Arc<Method>, args: &[Value]) -> Exec<Option<Value>> {
        if method.is_static() {
            let class = self.vm.registry.get(method.class)?;
            self.ensure_initialized(&class)?;
        }
        self.call(method, args)
    }

    fn finish(&mut self, base: usize, result: Exec<Option<Value>>) -> Result<Outcome, VmError> {
        match result {
            Ok(value) => Ok(Outcome::Returned(value)),
            Err(Trap::Throw(signal)) => {
                self.abandon(base);
                Ok(Outcome::Threw {
                    exception: signal.exception,
                    backtrace: signal.backtrace,
                })
            }
            Err(Trap::Fatal(e)) => {
                tracing::error!(error = %e, thread = self.id(), "execution aborted");
                self.abandon(base);
                Err(e)
            }
        }
    }

    /// Drop frames above `base`, releasing their monitors.
    fn abandon(&mut self, base: usize) {
        while self.frames.len() > base {
            if let Some(frame) = self.frames.pop()
                && let Some(obj) = frame.monitor
            {
                let _ = self.vm.monitors.get(obj).exit(self.id());
            }
        }
    }

    /// Nested call from native code or class initialization. Runs until
    /// `method` returns; exceptions propagate to the caller as traps.
    pub fn call(&mut self, method: Arc<Method>, args: &[Value]) -> Exec<Option<Value>> {
        let base = self.frames.len();
        match self.enter(method, args.to_vec(), ResultSink::Host)? {
            Entered::Native(value) => Ok(value),
            Entered::Frame => self.run(base),
        }
    }

    // ----------------------------------------
    // Dispatch loop
    // ----------------------------------------

    fn run(&mut self, base: usize) -> Exec<Option<Value>> {
        loop {
            debug_assert!(self.frames.len() > base);
            let depth = self.frames.len();
            let frame = self.frame()?;
            let method = Arc::clone(&frame.method);
            let pc = frame.pc;
            let Some(insn) = method.code.get(pc) else {
                return Err(VmError::FellOffEnd {
                    method: method.qualified_name(),
                }
                .into());
            };

            let control = match self.execute(&method, pc, insn) {
                Ok(control) => control,
                Err(Trap::Throw(signal)) => Control::Abort(signal),
                Err(fatal) => return Err(fatal),
            };

            match control {
                Control::Continue => {
                    // A call pushed a frame; the caller advances when it returns.
                    if self.frames.len() == depth {
                        self.frame()?.pc += 1;
                    }
                }
                Control::Jump(target) => {
                    if target >= method.code.len() {
                        return Err(VmError::InvalidJump {
                            method: method.qualified_name(),
                            target,
                        }
                        .into());
                    }
                    self.frame()?.pc = target;
                }
                Control::Return(value) => match self.leave_frame(value) {
                    Ok(Some(value)) => return Ok(value),
                    Ok(None) => {}
                    Err(Trap::Throw(signal)) => self.unwind(signal)?,
                    Err(fatal) => return Err(fatal),
                },
                Control::Abort(signal) => self.unwind(signal)?,
            }
        }
    }

    /// Pop the returning frame. `Some` carries the value to the host when
    /// the frame was entered from outside the loop.
    fn leave_frame(&mut self, value: Option<Value>) -> Exec<Option<Option<Value>>> {
        let id = self.id();
        let vm = Arc::clone(&self.vm);
        let frame = self.frame()?;
        if let Some(obj) = frame.monitor.take()
            && vm.monitors.get(obj).exit(id).is_err()
        {
            return Err(self.raise(GuestError::bare(names::ILLEGAL_MONITOR_STATE)));
        }
        let frame = self.frames.pop().ok_or(VmError::NoFrame)?;
        if vm.config.trace_calls {
            tracing::info!(
                target: "kettle::calls",
                method = %frame.method.qualified_name(),
                depth = self.frames.len(),
                "return"
            );
        }
        match frame.sink {
            ResultSink::Host => Ok(Some(value)),
            ResultSink::Caller => {
                let caller = self.frame()?;
                if let Some(value) = value {
                    caller.push(value)?;
                }
                caller.pc += 1;
                Ok(None)
            }
        }
    }

    /// Search for a handler from the current frame outwards. Stops at the
    /// first frame entered from the host, rethrowing to it.
    fn unwind(&mut self, mut signal: ExceptionSignal) -> Exec<()> {
        let vm = Arc::clone(&self.vm);
        let thrown = vm.heap.class_of(signal.exception)?;
        loop {
            let frame = self.frame()?;
            let handler = find_handler(&frame.method, frame.pc, |name| {
                vm.registry.is_assignable_to_name(thrown, name)
            })?;
            if let Some(target) = handler {
                tracing::trace!(
                    method = %frame.method.qualified_name(),
                    pc = frame.pc,
                    handler = target,
                    "exception caught"
                );
                frame.stack.clear();
                frame.push(Value::Ref(Some(signal.exception)))?;
                frame.pc = target;
                return Ok(());
            }

            let frame = self.frames.pop().ok_or(VmError::NoFrame)?;
            signal.backtrace.push(frame.trace_element());
            if let Some(obj) = frame.monitor {
                let _ = vm.monitors.get(obj).exit(self.id());
            }
            if frame.sink == ResultSink::Host {
                return Err(Trap::Throw(signal));
            }
        }
    }

    // ----------------------------------------
    // Guest objects
    // ----------------------------------------

    /// Instantiate and throw-ready a guest exception.
    pub fn raise(&mut self, error: GuestError) -> Trap {
        tracing::trace!(exception = %error, thread = self.id(), "raising");
        match self.new_throwable(error.class, error.message.as_deref()) {
            Ok(obj) => Trap::Throw(ExceptionSignal::new(obj)),
            Err(trap) => trap,
        }
    }

    pub(crate) fn link_error(&mut self, error: LinkError) -> Trap {
        match error {
            LinkError::Guest(e) => self.raise(e),
            LinkError::Fatal(e) => Trap::Fatal(e),
        }
    }

    fn out_of_memory(&self) -> Trap {
        tracing::warn!(objects = self.vm.heap.object_count(), "heap exhausted");
        Trap::Throw(ExceptionSignal::new(self.vm.out_of_memory))
    }

    /// Allocate a throwable without running its constructor.
    pub fn new_throwable(&mut self, class: &str, message: Option<&str>) -> Exec<ObjectRef> {
        let vm = Arc::clone(&self.vm);
        let class = vm.core_class(class)?;
        let obj = self.new_object(&class)?;
        if let Some(message) = message {
            let text = self.new_string(message)?;
            let (offset, kind) = vm.instance_field(&class, "detailMessage")?;
            vm.heap.write_field(obj, offset, kind, Value::Ref(Some(text)))?;
        }
        Ok(obj)
    }

    /// Allocate an instance with default field values.
    pub fn new_object(&mut self, class: &Class) -> Exec<ObjectRef> {
        self.vm
            .heap
            .allocate_instance(class.id, &class.layout)
            .map_err(|_| self.out_of_memory())
    }

    /// Allocate a one-dimensional array of an array class.
    pub fn new_array(&mut self, class: &Class, length: usize) -> Exec<ObjectRef> {
        let kind = class
            .component
            .as_ref()
            .map(|c| c.ty.kind())
            .ok_or(VmError::BadConstant {
                class: class.name.clone(),
                index: 0,
                expected: "array class",
            })?;
        self.vm
            .heap
            .allocate_array(class.id, kind, length)
            .map_err(|_| self.out_of_memory())
    }

    /// A fresh `java.lang.String`.
    pub fn new_string(&mut self, text: &str) -> Exec<ObjectRef> {
        let units: Vec<u16> = text.encode_utf16().collect();
        self.new_string_utf16(&units)
    }

    pub fn new_string_utf16(&mut self, units: &[u16]) -> Exec<ObjectRef> {
        let vm = Arc::clone(&self.vm);
        let string_class = vm.core_class(names::STRING)?;
        let chars_class = vm.core_class("[C")?;
        let chars = self.new_array(&chars_class, units.len())?;
        for (i, unit) in units.iter().enumerate() {
            vm.heap.write_element(chars, i, Value::Int(*unit as i32))?;
        }
        let obj = self.new_object(&string_class)?;
        let (offset, kind) = vm.instance_field(&string_class, "value")?;
        vm.heap.write_field(obj, offset, kind, Value::Ref(Some(chars)))?;
        Ok(obj)
    }

    /// The canonical string with this content.
    pub fn intern(&mut self, text: &str) -> Exec<ObjectRef> {
        let vm = Arc::clone(&self.vm);
        if let Some(obj) = vm.interned.lock().get(text) {
            return Ok(*obj);
        }
        let obj = self.new_string(text)?;
        Ok(*vm.interned.lock().entry(text.to_string()).or_insert(obj))
    }

    /// The `java.lang.Class` object for `class`, created on first use.
    pub fn mirror(&mut self, class: &Class) -> Exec<ObjectRef> {
        if let Some(mirror) = class.mirror.get() {
            return Ok(*mirror);
        }
        let vm = Arc::clone(&self.vm);
        let class_class = vm.core_class(names::CLASS)?;
        let obj = self.new_object(&class_class)?;
        let mirror = *class.mirror.get_or_init(|| obj);
        vm.mirrors.write().insert(mirror, class.id);
        Ok(mirror)
    }

    // ----------------------------------------
    // Class initialization
    // ----------------------------------------

    /// Run `<clinit>` of `class` and its superclasses once. A thread that
    /// is already initializing the class proceeds; others wait.
    pub fn ensure_initialized(&mut self, class: &Arc<Class>) -> Exec<()> {
        if class.is_array() {
            return Ok(());
        }
        match class.init.begin(self.id()) {
            InitStep::Done => Ok(()),
            InitStep::Failed => Err(self.raise(GuestError::new(
                names::NO_CLASS_DEF_FOUND,
                format!("Could not initialize class {}", class.java_name()),
            ))),
            InitStep::Run => {
                let result = self.run_initializer(class);
                class.init.finish(result.is_ok());
                result
            }
        }
    }

    fn run_initializer(&mut self, class: &Arc<Class>) -> Exec<()> {
        if let Some(super_class) = class.super_class {
            let super_class = self.vm.registry.get(super_class)?;
            self.ensure_initialized(&super_class)?;
        }
        let Some(clinit) = class.clinit().cloned() else {
            return Ok(());
        };
        tracing::debug!(class = %class.name, thread = self.id(), "running static initializer");
        match self.call(clinit, &[]) {
            Ok(_) => Ok(()),
            Err(Trap::Throw(signal)) => self.wrap_initializer_error(signal),
            Err(fatal) => Err(fatal),
        }
    }

    /// Errors pass through; anything else is wrapped in
    /// `ExceptionInInitializerError` with the original as its cause.
    fn wrap_initializer_error(&mut self, signal: ExceptionSignal) -> Exec<()> {
        let vm = Arc::clone(&self.vm);
        let thrown = vm.heap.class_of(signal.exception)?;
        if vm.registry.is_assignable_to_name(thrown, names::ERROR)? {
            return Err(Trap::Throw(signal));
        }
        let description = vm.describe_throwable(signal.exception)?;
        let wrapper = self.new_throwable(names::EXCEPTION_IN_INITIALIZER, Some(&description))?;
        let throwable = vm.core_class(names::THROWABLE)?;
        let (offset, kind) = vm.instance_field(&throwable, "cause")?;
        vm.heap
            .write_field(wrapper, offset, kind, Value::Ref(Some(signal.exception)))?;
        Err(Trap::Throw(ExceptionSignal {
            exception: wrapper,
            backtrace: signal.backtrace,
        }))
    }

    // ----------------------------------------
    // Resolution helpers
    // ----------------------------------------

    pub(crate) fn resolve_class(&mut self, class: &Class, index: u16) -> Exec<Arc<Class>> {
        let vm = Arc::clone(&self.vm);
        Resolver::new(&vm.registry)
            .resolve_class(class, index)
            .map_err(|e| self.link_error(e))
    }

    pub(crate) fn resolve_method(&mut self, class: &Class, index: u16) -> Exec<Arc<Method>> {
        let vm = Arc::clone(&self.vm);
        Resolver::new(&vm.registry)
            .resolve_method(class, index)
            .map_err(|e| self.link_error(e))
    }

    fn resolve_field(&mut self, method: &Method, index: u16, want_static: bool) -> Exec<ResolvedField> {
        let vm = Arc::clone(&self.vm);
        let class = vm.registry.get(method.class)?;
        let field = Resolver::new(&vm.registry)
            .resolve_field(&class, index)
            .map_err(|e| self.link_error(e))?;
        if field.is_static != want_static {
            let owner = vm.registry.get(field.class)?;
            let expected = if want_static { "static" } else { "non-static" };
            return Err(self.raise(GuestError::new(
                names::INCOMPATIBLE_CLASS_CHANGE,
                format!("Expected {} field {}.{}", expected, owner.java_name(), field.name),
            )));
        }
        Ok(field)
    }

    /// Declaring class of a static field, initialized.
    fn static_owner(&mut self, field: &ResolvedField) -> Exec<Arc<Class>> {
        let owner = self.vm.registry.get(field.class)?;
        self.ensure_initialized(&owner)?;
        Ok(owner)
    }

    fn null_pointer(&mut self, message: impl Into<String>) -> Trap {
        self.raise(GuestError::new(names::NULL_POINTER, message))
    }

    /// Pop `index` and `arrayref`, null- and bounds-checked.
    fn pop_element(&mut self) -> Exec<(ObjectRef, usize)> {
        let frame = self.frame()?;
        let index = frame.pop_int()?;
        let Some(array) = frame.pop_ref()? else {
            return Err(self.raise(GuestError::bare(names::NULL_POINTER)));
        };
        let length = self.vm.heap.array_length(array)?;
        if index < 0 || index as usize >= length {
            return Err(self.raise(GuestError::new(
                names::ARRAY_INDEX_OUT_OF_BOUNDS,
                format!("Index {} out of bounds for length {}", index, length),
            )));
        }
        Ok((array, index as usize))
    }

    fn array_count(&mut self, count: i32) -> Exec<usize> {
        if count < 0 {
            return Err(self.raise(GuestError::new(names::NEGATIVE_ARRAY_SIZE, count.to_string())));
        }
        Ok(count as usize)
    }

    /// `count[0]` arrays of `class`, each holding arrays for the remaining
    /// dimensions.
    fn new_multi_array(&mut self, class: &Arc<Class>, counts: &[usize]) -> Exec<ObjectRef> {
        let array = self.new_array(class, counts[0])?;
        if counts.len() > 1 {
            let component = class
                .component
                .as_ref()
                .and_then(|c| c.class)
                .ok_or(VmError::BadConstant {
                    class: class.name.clone(),
                    index: 0,
                    expected: "nested array class",
                })?;
            let component = self.vm.registry.get(component)?;
            for i in 0..counts[0] {
                let sub = self.new_multi_array(&component, &counts[1..])?;
                self.vm.heap.write_element(array, i, Value::Ref(Some(sub)))?;
            }
        }
        Ok(array)
    }

    fn instance_of(&self, obj: ObjectRef, target: &Class) -> Result<bool, VmError> {
        let class = self.vm.heap.class_of(obj)?;
        self.vm.registry.is_assignable(class, target.id)
    }

    // ----------------------------------------
    // Instructions
    // ----------------------------------------

    fn execute(&mut self, method: &Arc<Method>, pc: usize, insn: &Instruction) -> Exec<Control> {
        use Instruction::*;

        match insn {
            Nop => {}
            AconstNull => self.frame()?.push(Value::NULL)?,
            Iconst(n) => self.frame()?.push(Value::Int(*n))?,
            Lconst(n) => self.frame()?.push(Value::Long(*n))?,
            Fconst(n) => self.frame()?.push(Value::Float(*n))?,
            Dconst(n) => self.frame()?.push(Value::Double(*n))?,
            Ldc(index) | Ldc2W(index) => {
                let value = self.load_constant(method, *index)?;
                self.frame()?.push(value)?;
            }

            Iload(i) | Lload(i) | Fload(i) | Dload(i) | Aload(i) => {
                let frame = self.frame()?;
                let value = frame.load(*i as usize)?;
                frame.push(value)?;
            }
            Istore(i) | Lstore(i) | Fstore(i) | Dstore(i) | Astore(i) => {
                let frame = self.frame()?;
                let value = frame.pop()?;
                frame.store(*i as usize, value)?;
            }
            Iinc(i, delta) => {
                let frame = self.frame()?;
                let value = frame.load(*i as usize)?;
                let Some(n) = value.as_int() else {
                    return Err(frame
                        .fault(SlotFault::Type {
                            expected: "int",
                            found: value.type_name(),
                        })
                        .into());
                };
                frame.store(*i as usize, Value::Int(n.wrapping_add(*delta as i32)))?;
            }

            // Arrays
            Iaload | Laload | Faload | Daload | Aaload | Baload | Caload | Saload => {
                let (array, index) = self.pop_element()?;
                let value = self.vm.heap.read_element(array, index)?;
                self.frame()?.push(value)?;
            }
            Iastore | Lastore | Fastore | Dastore | Bastore | Castore | Sastore => {
                let value = self.frame()?.pop()?;
                let (array, index) = self.pop_element()?;
                self.vm.heap.write_element(array, index, value)?;
            }
            Aastore => {
                let value = self.frame()?.pop()?;
                let (array, index) = self.pop_element()?;
                if let Value::Ref(Some(element)) = value {
                    self.check_array_store(array, element)?;
                }
                self.vm.heap.write_element(array, index, value)?;
            }
            Newarray(kind) => {
                let count = self.frame()?.pop_int()?;
                let length = self.array_count(count)?;
                let descriptor = kind.descriptor_char().filter(|_| *kind != FieldKind::Reference);
                let Some(descriptor) = descriptor else {
                    return Err(VmError::TypeMismatch {
                        method: method.qualified_name(),
                        expected: "primitive array type",
                        found: "reference",
                    }
                    .into());
                };
                let class = self.array_class(&format!("[{}", descriptor))?;
                let array = self.new_array(&class, length)?;
                self.frame()?.push(Value::Ref(Some(array)))?;
            }
            Anewarray(index) => {
                let count = self.frame()?.pop_int()?;
                let length = self.array_count(count)?;
                let caller = self.vm.registry.get(method.class)?;
                let component = self.resolve_class(&caller, *index)?;
                let name = if component.is_array() {
                    format!("[{}", component.name)
                } else {
                    format!("[L{};", component.name)
                };
                let class = self.array_class(&name)?;
                let array = self.new_array(&class, length)?;
                self.frame()?.push(Value::Ref(Some(array)))?;
            }
            Multianewarray(index, dims) => {
                let caller = self.vm.registry.get(method.class)?;
                let class = self.resolve_class(&caller, *index)?;
                let raw = self.frame()?.pop_args(*dims as usize)?;
                let mut counts = Vec::with_capacity(raw.len());
                for value in raw {
                    let count = value.as_int().ok_or(VmError::TypeMismatch {
                        method: method.qualified_name(),
                        expected: "int",
                        found: value.type_name(),
                    })?;
                    counts.push(self.array_count(count)?);
                }
                if counts.is_empty() {
                    return Err(VmError::BadConstant {
                        class: caller.name.clone(),
                        index: *index,
                        expected: "multi-dimensional array class",
                    }
                    .into());
                }
                let array = self.new_multi_array(&class, &counts)?;
                self.frame()?.push(Value::Ref(Some(array)))?;
            }
            Arraylength => {
                let Some(array) = self.frame()?.pop_ref()? else {
                    return Err(self.null_pointer("Cannot read the array length"));
                };
                let length = self.vm.heap.array_length(array)?;
                self.frame()?.push(Value::Int(length as i32))?;
            }

            // Stack manipulation
            Pop => stack_op!(self, pop1),
            Pop2 => stack_op!(self, pop2),
            Dup => stack_op!(self, dup),
            DupX1 => stack_op!(self, dup_x1),
            DupX2 => stack_op!(self, dup_x2),
            Dup2 => stack_op!(self, dup2),
            Dup2X1 => stack_op!(self, dup2_x1),
            Dup2X2 => stack_op!(self, dup2_x2),
            Swap => stack_op!(self, swap),

            // Arithmetic
            Iadd => binary!(self, pop_int, Int, |a, b| a.wrapping_add(b)),
            Ladd => binary!(self, pop_long, Long, |a, b| a.wrapping_add(b)),
            Fadd => binary!(self, pop_float, Float, |a, b| a + b),
            Dadd => binary!(self, pop_double, Double, |a, b| a + b),
            Isub => binary!(self, pop_int, Int, |a, b| a.wrapping_sub(b)),
            Lsub => binary!(self, pop_long, Long, |a, b| a.wrapping_sub(b)),
            Fsub => binary!(self, pop_float, Float, |a, b| a - b),
            Dsub => binary!(self, pop_double, Double, |a, b| a - b),
            Imul => binary!(self, pop_int, Int, |a, b| a.wrapping_mul(b)),
            Lmul => binary!(self, pop_long, Long, |a, b| a.wrapping_mul(b)),
            Fmul => binary!(self, pop_float, Float, |a, b| a * b),
            Dmul => binary!(self, pop_double, Double, |a, b| a * b),
            Idiv => divide!(self, pop_int, Int, numeric::idiv),
            Ldiv => divide!(self, pop_long, Long, numeric::ldiv),
            Fdiv => binary!(self, pop_float, Float, |a, b| a / b),
            Ddiv => binary!(self, pop_double, Double, |a, b| a / b),
            Irem => divide!(self, pop_int, Int, numeric::irem),
            Lrem => divide!(self, pop_long, Long, numeric::lrem),
            Frem => binary!(self, pop_float, Float, |a, b| numeric::frem(a, b)),
            Drem => binary!(self, pop_double, Double, |a, b| numeric::drem(a, b)),
            Ineg => unary!(self, pop_int, Int, |a| a.wrapping_neg()),
            Lneg => unary!(self, pop_long, Long, |a| a.wrapping_neg()),
            Fneg => unary!(self, pop_float, Float, |a| -a),
            Dneg => unary!(self, pop_double, Double, |a| -a),
            Ishl => shift!(self, pop_int, Int, numeric::ishl),
            Lshl => shift!(self, pop_long, Long, numeric::lshl),
            Ishr => shift!(self, pop_int, Int, numeric::ishr),
            Lshr => shift!(self, pop_long, Long, numeric::lshr),
            Iushr => shift!(self, pop_int, Int, numeric::iushr),
            Lushr => shift!(self, pop_long, Long, numeric::lushr),
            Iand => binary!(self, pop_int, Int, |a, b| a & b),
            Land => binary!(self, pop_long, Long, |a, b| a & b),
            Ior => binary!(self, pop_int, Int, |a, b| a | b),
            Lor => binary!(self, pop_long, Long, |a, b| a | b),
            Ixor => binary!(self, pop_int, Int, |a, b| a ^ b),
            Lxor => binary!(self, pop_long, Long, |a, b| a ^ b),

            // Conversions
            I2l => unary!(self, pop_int, Long, |a| a as i64),
            I2f => unary!(self, pop_int, Float, |a| a as f32),
            I2d => unary!(self, pop_int, Double, |a| a as f64),
            L2i => unary!(self, pop_long, Int, |a| a as i32),
            L2f => unary!(self, pop_long, Float, |a| a as f32),
            L2d => unary!(self, pop_long, Double, |a| a as f64),
            F2i => unary!(self, pop_float, Int, |a| numeric::f2i(a)),
            F2l => unary!(self, pop_float, Long, |a| numeric::f2l(a)),
            F2d => unary!(self, pop_float, Double, |a| a as f64),
            D2i => unary!(self, pop_double, Int, |a| numeric::d2i(a)),
            D2l => unary!(self, pop_double, Long, |a| numeric::d2l(a)),
            D2f => unary!(self, pop_double, Float, |a| a as f32),
            I2b => unary!(self, pop_int, Int, |a| numeric::i2b(a)),
            I2c => unary!(self, pop_int, Int, |a| numeric::i2c(a)),
            I2s => unary!(self, pop_int, Int, |a| numeric::i2s(a)),

            // Comparisons
            Lcmp => binary!(self, pop_long, Int, |a, b| numeric::lcmp(a, b)),
            Fcmpl => binary!(self, pop_float, Int, |a, b| numeric::fcmp(a, b, -1)),
            Fcmpg => binary!(self, pop_float, Int, |a, b| numeric::fcmp(a, b, 1)),
            Dcmpl => binary!(self, pop_double, Int, |a, b| numeric::dcmp(a, b, -1)),
            Dcmpg => binary!(self, pop_double, Int, |a, b| numeric::dcmp(a, b, 1)),

            // Control flow
            If(cond, target) => {
                let value = self.frame()?.pop_int()?;
                return Ok(jump_if(cond.test(value, 0), *target));
            }
            IfIcmp(cond, target) => {
                let frame = self.frame()?;
                let b = frame.pop_int()?;
                let a = frame.pop_int()?;
                return Ok(jump_if(cond.test(a, b), *target));
            }
            IfAcmpeq(target) | IfAcmpne(target) => {
                let frame = self.frame()?;
                let b = frame.pop_ref()?;
                let a = frame.pop_ref()?;
                let equal = a == b;
                let taken = if matches!(insn, IfAcmpeq(_)) { equal } else { !equal };
                return Ok(jump_if(taken, *target));
            }
            Ifnull(target) => {
                let value = self.frame()?.pop_ref()?;
                return Ok(jump_if(value.is_none(), *target));
            }
            Ifnonnull(target) => {
                let value = self.frame()?.pop_ref()?;
                return Ok(jump_if(value.is_some(), *target));
            }
            Goto(target) => return Ok(Control::Jump(*target)),
            Jsr(target) => {
                self.frame()?.push(Value::ReturnAddress(pc + 1))?;
                return Ok(Control::Jump(*target));
            }
            Ret(i) => {
                let frame = self.frame()?;
                let value = frame.load(*i as usize)?;
                let Some(target) = value.as_return_address() else {
                    return Err(frame
                        .fault(SlotFault::Type {
                            expected: "returnAddress",
                            found: value.type_name(),
                        })
                        .into());
                };
                return Ok(Control::Jump(target));
            }
            Tableswitch {
                default,
                low,
                targets,
            } => {
                let key = self.frame()?.pop_int()?;
                let offset = key as i64 - *low as i64;
                let target = usize::try_from(offset)
                    .ok()
                    .and_then(|i| targets.get(i))
                    .unwrap_or(default);
                return Ok(Control::Jump(*target));
            }
            Lookupswitch { default, pairs } => {
                let key = self.frame()?.pop_int()?;
                let target = pairs
                    .binary_search_by_key(&key, |(k, _)| *k)
                    .map_or(*default, |i| pairs[i].1);
                return Ok(Control::Jump(target));
            }
            Ireturn | Lreturn | Freturn | Dreturn | Areturn => {
                let value = self.frame()?.pop()?;
                return Ok(Control::Return(Some(value)));
            }
            Return => return Ok(Control::Return(None)),

            // Fields
            Getstatic(index) => {
                let field = self.resolve_field(method, *index, true)?;
                let owner = self.static_owner(&field)?;
                let value = owner.statics.lock().get(field.offset).copied();
                let value = value.ok_or(VmError::FieldOffset {
                    object: owner.id.0,
                    offset: field.offset,
                })?;
                self.frame()?.push(value)?;
            }
            Putstatic(index) => {
                let field = self.resolve_field(method, *index, true)?;
                let owner = self.static_owner(&field)?;
                let value = self.frame()?.pop()?;
                let mut statics = owner.statics.lock();
                let slot = statics.get_mut(field.offset).ok_or(VmError::FieldOffset {
                    object: owner.id.0,
                    offset: field.offset,
                })?;
                *slot = field.kind.narrow(value);
            }
            Getfield(index) => {
                let field = self.resolve_field(method, *index, false)?;
                let Some(obj) = self.frame()?.pop_ref()? else {
                    return Err(self.null_pointer(format!("Cannot read field \"{}\"", field.name)));
                };
                let value = self.vm.heap.read_field(obj, field.offset)?;
                self.frame()?.push(value)?;
            }
            Putfield(index) => {
                let field = self.resolve_field(method, *index, false)?;
                let frame = self.frame()?;
                let value = frame.pop()?;
                let Some(obj) = frame.pop_ref()? else {
                    return Err(
                        self.null_pointer(format!("Cannot assign field \"{}\"", field.name))
                    );
                };
                self.vm.heap.write_field(obj, field.offset, field.kind, value)?;
            }

            // Invocation
            Invokevirtual(index) => return self.invoke_site(method, pc, DispatchKind::Virtual, *index),
            Invokespecial(index) => return self.invoke_site(method, pc, DispatchKind::Special, *index),
            Invokestatic(index) => return self.invoke_site(method, pc, DispatchKind::Static, *index),
            Invokeinterface(index) => {
                return self.invoke_site(method, pc, DispatchKind::Interface, *index);
            }
            Invokedynamic(index) => return self.invoke_site(method, pc, DispatchKind::Dynamic, *index),

            // Objects
            New(index) => {
                let caller = self.vm.registry.get(method.class)?;
                let class = self.resolve_class(&caller, *index)?;
                if class.is_interface() || class.is_abstract() {
                    return Err(self.raise(GuestError::new(names::INSTANTIATION, class.java_name())));
                }
                self.ensure_initialized(&class)?;
                let obj = self.new_object(&class)?;
                self.frame()?.push(Value::Ref(Some(obj)))?;
            }
            Athrow => {
                let Some(exception) = self.frame()?.pop_ref()? else {
                    return Err(self.null_pointer("Cannot throw a null exception"));
                };
                return Ok(Control::Abort(ExceptionSignal::new(exception)));
            }
            Checkcast(index) => {
                let caller = self.vm.registry.get(method.class)?;
                let target = self.resolve_class(&caller, *index)?;
                let frame = self.frame()?;
                let top = frame.stack.peek().map_err(|f| f.in_method(&frame.method))?;
                let Some(Some(obj)) = top.as_reference() else {
                    return Ok(Control::Continue);
                };
                if !self.instance_of(obj, &target)? {
                    let actual = self.vm.registry.get(self.vm.heap.class_of(obj)?)?;
                    return Err(self.raise(GuestError::new(
                        names::CLASS_CAST,
                        format!(
                            "class {} cannot be cast to class {}",
                            actual.java_name(),
                            target.java_name()
                        ),
                    )));
                }
            }
            Instanceof(index) => {
                let caller = self.vm.registry.get(method.class)?;
                let target = self.resolve_class(&caller, *index)?;
                let result = match self.frame()?.pop_ref()? {
                    Some(obj) => self.instance_of(obj, &target)?,
                    None => false,
                };
                self.frame()?.push(Value::Int(result as i32))?;
            }
            Monitorenter => {
                let Some(obj) = self.frame()?.pop_ref()? else {
                    return Err(self.null_pointer("Cannot enter synchronized block"));
                };
                self.vm.monitors.get(obj).enter(self.id());
            }
            Monitorexit => {
                let Some(obj) = self.frame()?.pop_ref()? else {
                    return Err(self.null_pointer("Cannot exit synchronized block"));
                };
                if self.vm.monitors.get(obj).exit(self.id()).is_err() {
                    return Err(self.raise(GuestError::bare(names::ILLEGAL_MONITOR_STATE)));
                }
            }
        }
        Ok(Control::Continue)
    }

    fn load_constant(&mut self, method: &Method, index: u16) -> Exec<Value> {
        let vm = Arc::clone(&self.vm);
        let class = vm.registry.get(method.class)?;
        let value = match class.constants.get(index) {
            Some(Constant::Integer(n)) => Value::Int(*n),
            Some(Constant::Float(n)) => Value::Float(*n),
            Some(Constant::Long(n)) => Value::Long(*n),
            Some(Constant::Double(n)) => Value::Double(*n),
            Some(Constant::String { value, interned }) => {
                let obj = match interned.get() {
                    Some(obj) => *obj,
                    None => {
                        let obj = if vm.config.intern_strings {
                            self.intern(value)?
                        } else {
                            self.new_string(value)?
                        };
                        *interned.get_or_init(|| obj)
                    }
                };
                Value::Ref(Some(obj))
            }
            Some(Constant::Class { .. }) => {
                let target = self.resolve_class(&class, index)?;
                Value::Ref(Some(self.mirror(&target)?))
            }
            _ => {
                return Err(VmError::BadConstant {
                    class: class.name.clone(),
                    index,
                    expected: "loadable constant",
                }
                .into());
            }
        };
        Ok(value)
    }

    fn array_class(&mut self, name: &str) -> Exec<Arc<Class>> {
        let vm = Arc::clone(&self.vm);
        vm.registry.load(name).map_err(|e| self.raise(e))
    }

    /// `aastore` element check against the array's component class.
    fn check_array_store(&mut self, array: ObjectRef, element: ObjectRef) -> Exec<()> {
        let vm = Arc::clone(&self.vm);
        let array_class = vm.registry.get(vm.heap.class_of(array)?)?;
        let Some(component) = array_class.component.as_ref().and_then(|c| c.class) else {
            return Ok(());
        };
        let element_class = vm.heap.class_of(element)?;
        if !vm.registry.is_assignable(element_class, component)? {
            let element_class = vm.registry.get(element_class)?;
            return Err(self.raise(GuestError::new(names::ARRAY_STORE, element_class.java_name())));
        }
        Ok(())
    }
}
