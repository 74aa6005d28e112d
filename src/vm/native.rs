//! Native method bindings.
//!
//! Natives are keyed by `class.name(descriptor)` and receive the calling
//! thread plus the popped arguments (receiver first for instance methods).
//! The bootstrap set covers the core classes in [`super::bootstrap`].

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::error::VmError;

use super::bootstrap::names;
use super::class::MemberRef;
use super::descriptor::FieldKind;
use super::exception::{Exec, GuestError, Outcome};
use super::heap::ObjectRef;
use super::interpreter::{Thread, Vm};
use super::monitor::WaitOutcome;
use super::resolver::Resolver;
use super::threads::next_thread_id;
use super::value::Value;

pub type NativeFn = Arc<dyn Fn(&mut Thread, &[Value]) -> Exec<Option<Value>> + Send + Sync>;

type NativePtr = fn(&mut Thread, &[Value]) -> Exec<Option<Value>>;

fn key(class: &str, name: &str, descriptor: &str) -> String {
    format!("{}.{}{}", class, name, descriptor)
}

/// Native implementations by qualified method name.
#[derive(Clone, Default)]
pub struct NativeRegistry {
    methods: HashMap<String, NativeFn>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The natives the bootstrap classes declare.
    pub fn with_bootstrap() -> Self {
        let mut registry = Self::new();
        register_object(&mut registry);
        register_string(&mut registry);
        register_class(&mut registry);
        register_thread(&mut registry);
        register_system(&mut registry);
        register_console(&mut registry);
        registry
    }

    pub fn register(&mut self, class: &str, name: &str, descriptor: &str, f: NativeFn) {
        self.methods.insert(key(class, name, descriptor), f);
    }

    fn bind(&mut self, class: &str, name: &str, descriptor: &str, f: NativePtr) {
        self.register(class, name, descriptor, Arc::new(f));
    }

    pub fn get(&self, class: &str, name: &str, descriptor: &str) -> Option<NativeFn> {
        self.methods.get(&key(class, name, descriptor)).cloned()
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

// ========================================
// Argument helpers
// ========================================

fn bad_arg(expected: &'static str, found: Option<&Value>) -> VmError {
    VmError::TypeMismatch {
        method: "native call".to_string(),
        expected,
        found: found.map_or("nothing", |v| v.type_name()),
    }
}

fn arg_ref(args: &[Value], i: usize) -> Result<Option<ObjectRef>, VmError> {
    match args.get(i) {
        Some(Value::Ref(r)) => Ok(*r),
        other => Err(bad_arg("reference", other)),
    }
}

fn arg_int(args: &[Value], i: usize) -> Result<i32, VmError> {
    args.get(i)
        .and_then(Value::as_int)
        .ok_or_else(|| bad_arg("int", args.get(i)))
}

fn arg_long(args: &[Value], i: usize) -> Result<i64, VmError> {
    args.get(i)
        .and_then(Value::as_long)
        .ok_or_else(|| bad_arg("long", args.get(i)))
}

fn arg_float(args: &[Value], i: usize) -> Result<f32, VmError> {
    args.get(i)
        .and_then(Value::as_float)
        .ok_or_else(|| bad_arg("float", args.get(i)))
}

fn arg_double(args: &[Value], i: usize) -> Result<f64, VmError> {
    args.get(i)
        .and_then(Value::as_double)
        .ok_or_else(|| bad_arg("double", args.get(i)))
}

/// The receiver. Dispatch already rejected null receivers.
fn this(args: &[Value]) -> Result<ObjectRef, VmError> {
    arg_ref(args, 0)?.ok_or_else(|| bad_arg("non-null receiver", args.first()))
}

fn int(n: i32) -> Exec<Option<Value>> {
    Ok(Some(Value::Int(n)))
}

fn boolean(b: bool) -> Exec<Option<Value>> {
    int(b as i32)
}

fn reference(obj: ObjectRef) -> Exec<Option<Value>> {
    Ok(Some(Value::Ref(Some(obj))))
}

fn string(thread: &mut Thread, text: &str) -> Exec<Option<Value>> {
    let obj = thread.new_string(text)?;
    reference(obj)
}

// ========================================
// Text formatting
// ========================================

/// Decimal text the way `Double.toString` writes it: at least one
/// fractional digit, scientific notation outside `[1e-3, 1e7)`.
fn decimal_text(plain: String, scientific: String, magnitude: f64) -> String {
    if magnitude != 0.0 && !(1e-3..1e7).contains(&magnitude) {
        return match scientific.split_once('E') {
            Some((mantissa, exponent)) if !mantissa.contains('.') => {
                format!("{}.0E{}", mantissa, exponent)
            }
            _ => scientific,
        };
    }
    if plain.contains('.') {
        plain
    } else {
        plain + ".0"
    }
}

pub fn format_double(d: f64) -> String {
    if d.is_nan() {
        "NaN".to_string()
    } else if d.is_infinite() {
        if d > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        decimal_text(format!("{}", d), format!("{:E}", d), d.abs())
    }
}

pub fn format_float(f: f32) -> String {
    if f.is_nan() {
        "NaN".to_string()
    } else if f.is_infinite() {
        if f > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        decimal_text(format!("{}", f), format!("{:E}", f), f.abs() as f64)
    }
}

fn format_char(unit: i32) -> String {
    String::from_utf16_lossy(&[unit as u16])
}

/// `String.valueOf(Object)`: `"null"` or the receiver's `toString()`.
fn object_text(thread: &mut Thread, obj: Option<ObjectRef>) -> Exec<String> {
    let Some(obj) = obj else {
        return Ok("null".to_string());
    };
    let vm = Arc::clone(thread.vm());
    let object_class = vm.core_class(names::OBJECT)?;
    let member = MemberRef::new(
        names::OBJECT.to_string(),
        "toString".to_string(),
        "()Ljava/lang/String;".to_string(),
    );
    let resolver = Resolver::new(vm.registry());
    let selected = resolver
        .lookup_method(&object_class, &member, false)
        .and_then(|m| resolver.select_virtual(vm.heap().class_of(obj)?, &m));
    let method = selected.map_err(|e| thread.link_error(e))?;
    match thread.call(method, &[Value::Ref(Some(obj))])? {
        Some(Value::Ref(Some(text))) => Ok(vm.string_value(text)?),
        _ => Ok("null".to_string()),
    }
}

// ========================================
// java.lang.Object
// ========================================

fn register_object(r: &mut NativeRegistry) {
    let object = names::OBJECT;
    r.bind(object, "hashCode", "()I", |_, args| int(this(args)?.index() as i32));
    r.bind(object, "toString", "()Ljava/lang/String;", |thread, args| {
        let obj = this(args)?;
        let vm = Arc::clone(thread.vm());
        let class = vm.registry().get(vm.heap().class_of(obj)?)?;
        string(thread, &format!("{}@{:x}", class.java_name(), obj.index()))
    });
    r.bind(object, "getClass", "()Ljava/lang/Class;", |thread, args| {
        let obj = this(args)?;
        let vm = Arc::clone(thread.vm());
        let class = vm.registry().get(vm.heap().class_of(obj)?)?;
        let mirror = thread.mirror(&class)?;
        reference(mirror)
    });
    r.bind(object, "wait", "()V", |thread, args| wait(thread, this(args)?, 0));
    r.bind(object, "wait", "(J)V", |thread, args| {
        wait(thread, this(args)?, arg_long(args, 1)?)
    });
    r.bind(object, "notify", "()V", |thread, args| {
        let obj = this(args)?;
        match thread.vm().monitors().get(obj).notify(thread.id()) {
            Ok(()) => Ok(None),
            Err(_) => Err(illegal_monitor_state(thread, "notify")),
        }
    });
    r.bind(object, "notifyAll", "()V", |thread, args| {
        let obj = this(args)?;
        match thread.vm().monitors().get(obj).notify_all(thread.id()) {
            Ok(()) => Ok(None),
            Err(_) => Err(illegal_monitor_state(thread, "notifyAll")),
        }
    });
}

fn illegal_monitor_state(thread: &mut Thread, operation: &str) -> super::exception::Trap {
    thread.raise(GuestError::new(
        names::ILLEGAL_MONITOR_STATE,
        format!("current thread is not owner ({})", operation),
    ))
}

/// `Object.wait(millis)`. Zero waits until notified.
fn wait(thread: &mut Thread, obj: ObjectRef, millis: i64) -> Exec<Option<Value>> {
    if millis < 0 {
        return Err(thread.raise(GuestError::new(
            names::ILLEGAL_ARGUMENT,
            "timeout value is negative",
        )));
    }
    let timeout = (millis > 0).then(|| Duration::from_millis(millis as u64));
    let monitor = thread.vm().monitors().get(obj);
    let control = Arc::clone(thread.control());
    match monitor.wait(&control, timeout) {
        Ok(WaitOutcome::Interrupted) => Err(thread.raise(GuestError::bare(names::INTERRUPTED))),
        Ok(_) => Ok(None),
        Err(_) => Err(illegal_monitor_state(thread, "wait")),
    }
}

// ========================================
// java.lang.String
// ========================================

fn register_string(r: &mut NativeRegistry) {
    let s = names::STRING;
    r.bind(s, "length", "()I", |thread, args| {
        int(thread.vm().string_units(this(args)?)?.len() as i32)
    });
    r.bind(s, "charAt", "(I)C", |thread, args| {
        let units = thread.vm().string_units(this(args)?)?;
        let index = arg_int(args, 1)?;
        match usize::try_from(index).ok().and_then(|i| units.get(i)) {
            Some(unit) => int(*unit as i32),
            None => Err(thread.raise(GuestError::new(
                names::STRING_INDEX_OUT_OF_BOUNDS,
                format!("Index {} out of bounds for length {}", index, units.len()),
            ))),
        }
    });
    r.bind(s, "equals", "(Ljava/lang/Object;)Z", |thread, args| {
        let a = this(args)?;
        let Some(b) = arg_ref(args, 1)? else {
            return boolean(false);
        };
        let vm = Arc::clone(thread.vm());
        let string_class = vm.core_class(names::STRING)?;
        if vm.heap().class_of(b)? != string_class.id {
            return boolean(false);
        }
        boolean(a == b || vm.string_units(a)? == vm.string_units(b)?)
    });
    r.bind(s, "hashCode", "()I", |thread, args| {
        let units = thread.vm().string_units(this(args)?)?;
        int(units
            .iter()
            .fold(0i32, |h, u| h.wrapping_mul(31).wrapping_add(*u as i32)))
    });
    r.bind(s, "concat", "(Ljava/lang/String;)Ljava/lang/String;", |thread, args| {
        let a = this(args)?;
        let Some(b) = arg_ref(args, 1)? else {
            return Err(thread.raise(GuestError::bare(names::NULL_POINTER)));
        };
        let vm = Arc::clone(thread.vm());
        let mut units = vm.string_units(a)?;
        units.extend(vm.string_units(b)?);
        let obj = thread.new_string_utf16(&units)?;
        reference(obj)
    });
    r.bind(s, "intern", "()Ljava/lang/String;", |thread, args| {
        let text = thread.vm().string_value(this(args)?)?;
        let obj = thread.intern(&text)?;
        reference(obj)
    });
    r.bind(s, "valueOf", "(I)Ljava/lang/String;", |thread, args| {
        string(thread, &arg_int(args, 0)?.to_string())
    });
    r.bind(s, "valueOf", "(J)Ljava/lang/String;", |thread, args| {
        string(thread, &arg_long(args, 0)?.to_string())
    });
    r.bind(s, "valueOf", "(D)Ljava/lang/String;", |thread, args| {
        string(thread, &format_double(arg_double(args, 0)?))
    });
    r.bind(s, "valueOf", "(C)Ljava/lang/String;", |thread, args| {
        string(thread, &format_char(arg_int(args, 0)?))
    });
    r.bind(s, "valueOf", "(Z)Ljava/lang/String;", |thread, args| {
        string(thread, if arg_int(args, 0)? != 0 { "true" } else { "false" })
    });
    r.bind(s, "valueOf", "(Ljava/lang/Object;)Ljava/lang/String;", |thread, args| {
        let text = object_text(thread, arg_ref(args, 0)?)?;
        string(thread, &text)
    });
}

// ========================================
// java.lang.Class and java.lang.Throwable
// ========================================

fn mirrored_class(thread: &Thread, args: &[Value]) -> Result<Arc<super::class::Class>, VmError> {
    let mirror = this(args)?;
    let id = thread
        .vm()
        .class_of_mirror(mirror)
        .ok_or(VmError::NotAnInstance(mirror.index()))?;
    thread.vm().registry().get(id)
}

fn register_class(r: &mut NativeRegistry) {
    let c = names::CLASS;
    r.bind(c, "getName", "()Ljava/lang/String;", |thread, args| {
        let class = mirrored_class(thread, args)?;
        string(thread, &class.java_name())
    });
    r.bind(c, "isInterface", "()Z", |thread, args| {
        boolean(mirrored_class(thread, args)?.is_interface())
    });
    r.bind(c, "isArray", "()Z", |thread, args| {
        boolean(mirrored_class(thread, args)?.is_array())
    });
    r.bind(names::THROWABLE, "toString", "()Ljava/lang/String;", |thread, args| {
        let text = thread.vm().describe_throwable(this(args)?)?;
        string(thread, &text)
    });
}

// ========================================
// java.lang.Thread
// ========================================

fn thread_field(vm: &Vm, name: &str) -> Result<(usize, FieldKind), VmError> {
    let class = vm.core_class(names::THREAD)?;
    vm.instance_field(&class, name)
}

/// Engine thread id of a `java.lang.Thread`; zero until started.
fn thread_id(vm: &Vm, obj: ObjectRef) -> Result<u64, VmError> {
    let (offset, _) = thread_field(vm, "tid")?;
    Ok(vm.heap().read_field(obj, offset)?.as_long().unwrap_or(0) as u64)
}

fn set_thread_id(vm: &Vm, obj: ObjectRef, id: u64) -> Result<(), VmError> {
    let (offset, kind) = thread_field(vm, "tid")?;
    vm.heap().write_field(obj, offset, kind, Value::Long(id as i64))
}

/// Print an exception that escaped a thread's `run`.
pub fn report_uncaught(
    vm: &Vm,
    thread_name: &str,
    exception: ObjectRef,
    backtrace: &super::debug::Backtrace,
) -> Result<(), VmError> {
    let description = vm.describe_throwable(exception)?;
    tracing::warn!(thread = thread_name, exception = %description, "uncaught exception");
    eprint!(
        "Exception in thread \"{}\" {}\n{}",
        thread_name, description, backtrace
    );
    Ok(())
}

fn start(thread: &mut Thread, args: &[Value]) -> Exec<Option<Value>> {
    let obj = this(args)?;
    let vm = Arc::clone(thread.vm());
    if thread_id(&vm, obj)? != 0 {
        return Err(thread.raise(GuestError::bare(names::ILLEGAL_THREAD_STATE)));
    }

    let run = {
        let thread_class = vm.core_class(names::THREAD)?;
        let member = MemberRef::new(names::THREAD.to_string(), "run".to_string(), "()V".to_string());
        let resolver = Resolver::new(vm.registry());
        resolver
            .lookup_method(&thread_class, &member, false)
            .and_then(|m| resolver.select_virtual(vm.heap().class_of(obj)?, &m))
            .map_err(|e| thread.link_error(e))?
    };

    let id = next_thread_id();
    set_thread_id(&vm, obj, id)?;
    let control = vm.threads().register(id);
    let _ = control.object.set(obj);
    tracing::debug!(thread = id, parent = thread.id(), "starting thread");

    let shared = Arc::clone(&vm);
    vm.threads().spawn(id, move || {
        let mut worker = Thread::attach(Arc::clone(&shared), control);
        let outcome = worker.invoke(run, &[Value::Ref(Some(obj))])?;
        if let Outcome::Threw {
            exception,
            backtrace,
        } = &outcome
        {
            report_uncaught(&shared, &format!("Thread-{}", id), *exception, backtrace)?;
        }
        Ok(outcome)
    })?;
    Ok(None)
}

fn register_thread(r: &mut NativeRegistry) {
    let t = names::THREAD;
    r.bind(t, "start", "()V", start);
    r.bind(t, "join", "()V", |thread, args| {
        let vm = Arc::clone(thread.vm());
        let id = thread_id(&vm, this(args)?)?;
        if id != 0 {
            match vm.threads().join(id) {
                Ok(_) | Err(VmError::AlreadyJoined(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    });
    r.bind(t, "isAlive", "()Z", |thread, args| {
        let vm = thread.vm();
        let id = thread_id(vm, this(args)?)?;
        boolean(id != 0 && vm.threads().is_alive(id))
    });
    r.bind(t, "interrupt", "()V", |thread, args| {
        let vm = thread.vm();
        let id = thread_id(vm, this(args)?)?;
        if let Some(control) = vm.threads().control(id) {
            control.interrupt();
        }
        Ok(None)
    });
    r.bind(t, "isInterrupted", "()Z", |thread, args| {
        let vm = thread.vm();
        let id = thread_id(vm, this(args)?)?;
        boolean(
            vm.threads()
                .control(id)
                .is_some_and(|c| c.is_interrupted()),
        )
    });
    r.bind(t, "currentThread", "()Ljava/lang/Thread;", |thread, _| {
        if let Some(obj) = thread.control().object.get() {
            return reference(*obj);
        }
        // Threads attached by the host get their object on first request.
        let vm = Arc::clone(thread.vm());
        let class = vm.core_class(names::THREAD)?;
        let obj = thread.new_object(&class)?;
        set_thread_id(&vm, obj, thread.id())?;
        reference(*thread.control().object.get_or_init(|| obj))
    });
    r.bind(t, "interrupted", "()Z", |thread, _| {
        boolean(thread.control().take_interrupt())
    });
    r.bind(t, "sleep", "(J)V", |thread, args| {
        let millis = arg_long(args, 0)?;
        if millis < 0 {
            return Err(thread.raise(GuestError::new(
                names::ILLEGAL_ARGUMENT,
                "timeout value is negative",
            )));
        }
        let control = Arc::clone(thread.control());
        if control.sleep(Duration::from_millis(millis as u64)) {
            return Err(thread.raise(GuestError::new(names::INTERRUPTED, "sleep interrupted")));
        }
        Ok(None)
    });
}

// ========================================
// java.lang.System
// ========================================

fn start_instant() -> Instant {
    static START: OnceLock<Instant> = OnceLock::new();
    *START.get_or_init(Instant::now)
}

fn register_system(r: &mut NativeRegistry) {
    let s = names::SYSTEM;
    r.bind(s, "identityHashCode", "(Ljava/lang/Object;)I", |_, args| {
        int(arg_ref(args, 0)?.map_or(0, |obj| obj.index() as i32))
    });
    r.bind(s, "currentTimeMillis", "()J", |_, _| {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Ok(Some(Value::Long(now.as_millis() as i64)))
    });
    r.bind(s, "nanoTime", "()J", |_, _| {
        Ok(Some(Value::Long(start_instant().elapsed().as_nanos() as i64)))
    });
    r.bind(s, "arraycopy", "(Ljava/lang/Object;ILjava/lang/Object;II)V", arraycopy);
}

fn arraycopy(thread: &mut Thread, args: &[Value]) -> Exec<Option<Value>> {
    let (Some(src), Some(dest)) = (arg_ref(args, 0)?, arg_ref(args, 2)?) else {
        return Err(thread.raise(GuestError::bare(names::NULL_POINTER)));
    };
    let src_pos = arg_int(args, 1)?;
    let dest_pos = arg_int(args, 3)?;
    let length = arg_int(args, 4)?;

    let vm = Arc::clone(thread.vm());
    let src_class = vm.registry().get(vm.heap().class_of(src)?)?;
    let dest_class = vm.registry().get(vm.heap().class_of(dest)?)?;
    for (class, role) in [(&src_class, "source"), (&dest_class, "destination")] {
        if !class.is_array() {
            return Err(thread.raise(GuestError::new(
                names::ARRAY_STORE,
                format!("arraycopy: {} type {} is not an array", role, class.java_name()),
            )));
        }
    }
    let src_kind = vm.heap().array_kind(src)?;
    let dest_kind = vm.heap().array_kind(dest)?;
    if src_kind != dest_kind {
        return Err(thread.raise(GuestError::new(
            names::ARRAY_STORE,
            format!(
                "arraycopy: type mismatch: can not copy {} into {}",
                src_class.java_name(),
                dest_class.java_name()
            ),
        )));
    }

    let src_len = vm.heap().array_length(src)? as i64;
    let dest_len = vm.heap().array_length(dest)? as i64;
    let bounds = [
        (src_pos < 0, format!("arraycopy: source index {} out of bounds", src_pos)),
        (dest_pos < 0, format!("arraycopy: destination index {} out of bounds", dest_pos)),
        (length < 0, format!("arraycopy: length {} is negative", length)),
        (
            src_pos as i64 + length as i64 > src_len,
            format!(
                "arraycopy: last source index {} out of bounds for length {}",
                src_pos as i64 + length as i64,
                src_len
            ),
        ),
        (
            dest_pos as i64 + length as i64 > dest_len,
            format!(
                "arraycopy: last destination index {} out of bounds for length {}",
                dest_pos as i64 + length as i64,
                dest_len
            ),
        ),
    ];
    if let Some((_, message)) = bounds.into_iter().find(|(bad, _)| *bad) {
        return Err(thread.raise(GuestError::new(names::ARRAY_INDEX_OUT_OF_BOUNDS, message)));
    }

    let (src_pos, dest_pos, length) = (src_pos as usize, dest_pos as usize, length as usize);
    // Read everything first so overlapping copies see the original values.
    let values: Vec<Value> = (0..length)
        .map(|i| vm.heap().read_element(src, src_pos + i))
        .collect::<Result<_, _>>()?;
    let component = dest_class.component.as_ref().and_then(|c| c.class);
    for (i, value) in values.into_iter().enumerate() {
        if let (Some(target), Value::Ref(Some(element))) = (component, value) {
            let element_class = vm.heap().class_of(element)?;
            if !vm.registry().is_assignable(element_class, target)? {
                let element_class = vm.registry().get(element_class)?;
                return Err(thread.raise(GuestError::new(
                    names::ARRAY_STORE,
                    format!(
                        "arraycopy: element type mismatch: {} stored into {}",
                        element_class.java_name(),
                        dest_class.java_name()
                    ),
                )));
            }
        }
        vm.heap().write_element(dest, dest_pos + i, value)?;
    }
    Ok(None)
}

// ========================================
// kettle.Console
// ========================================

fn print_line(thread: &mut Thread, text: &str, newline: bool) -> Exec<Option<Value>> {
    let line = if newline {
        format!("{}\n", text)
    } else {
        text.to_string()
    };
    thread.vm().write_output(&line)?;
    Ok(None)
}

fn string_arg_text(thread: &mut Thread, args: &[Value]) -> Exec<String> {
    match arg_ref(args, 0)? {
        Some(obj) => Ok(thread.vm().string_value(obj)?),
        None => Ok("null".to_string()),
    }
}

fn register_console(r: &mut NativeRegistry) {
    let c = names::CONSOLE;
    r.bind(c, "println", "()V", |thread, _| print_line(thread, "", true));
    r.bind(c, "println", "(I)V", |thread, args| {
        print_line(thread, &arg_int(args, 0)?.to_string(), true)
    });
    r.bind(c, "println", "(J)V", |thread, args| {
        print_line(thread, &arg_long(args, 0)?.to_string(), true)
    });
    r.bind(c, "println", "(F)V", |thread, args| {
        print_line(thread, &format_float(arg_float(args, 0)?), true)
    });
    r.bind(c, "println", "(D)V", |thread, args| {
        print_line(thread, &format_double(arg_double(args, 0)?), true)
    });
    r.bind(c, "println", "(Z)V", |thread, args| {
        let text = if arg_int(args, 0)? != 0 { "true" } else { "false" };
        print_line(thread, text, true)
    });
    r.bind(c, "println", "(C)V", |thread, args| {
        print_line(thread, &format_char(arg_int(args, 0)?), true)
    });
    r.bind(c, "println", "(Ljava/lang/String;)V", |thread, args| {
        let text = string_arg_text(thread, args)?;
        print_line(thread, &text, true)
    });
    r.bind(c, "println", "(Ljava/lang/Object;)V", |thread, args| {
        let text = object_text(thread, arg_ref(args, 0)?)?;
        print_line(thread, &text, true)
    });
    r.bind(c, "print", "(I)V", |thread, args| {
        print_line(thread, &arg_int(args, 0)?.to_string(), false)
    });
    r.bind(c, "print", "(Ljava/lang/String;)V", |thread, args| {
        let text = string_arg_text(thread, args)?;
        print_line(thread, &text, false)
    });
}
