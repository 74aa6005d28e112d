//! In-process integration tests that contribute to coverage.
//!
//! These tests drive the library API directly instead of spawning a
//! separate process, so they are included in coverage measurement.

use std::path::Path;
use std::sync::Arc;

use kettle::image::host_args;
use kettle::vm::descriptor::MethodDescriptor;
use kettle::vm::SharedOutput;
use kettle::{ImageLoader, Outcome, ProgramImage, RuntimeConfig, Value, Vm};

struct Run {
    vm: Arc<Vm>,
    output: SharedOutput,
}

impl Run {
    fn new(image: &str, config: RuntimeConfig) -> Self {
        let loader = ImageLoader::new(ProgramImage::from_toml(image).unwrap()).unwrap();
        Self::with_loader(loader, config)
    }

    fn with_loader(loader: ImageLoader, config: RuntimeConfig) -> Self {
        let output = SharedOutput::new();
        let vm = Vm::builder()
            .config(config)
            .loader(loader)
            .output(output.clone())
            .build()
            .unwrap();
        Self { vm, output }
    }

    fn call(&self, class: &str, name: &str, descriptor: &str, args: &[Value]) -> Outcome {
        let outcome = self
            .vm
            .new_thread()
            .invoke_static(class, name, descriptor, args)
            .unwrap();
        self.vm.join_threads().unwrap();
        outcome
    }

    fn int(&self, class: &str, name: &str) -> i32 {
        match self.call(class, name, "()I", &[]) {
            Outcome::Returned(Some(Value::Int(n))) => n,
            other => panic!("{}.{} did not return an int: {:?}", class, name, self.describe(&other)),
        }
    }

    fn describe(&self, outcome: &Outcome) -> String {
        match outcome {
            Outcome::Threw { exception, .. } => self.vm.describe_throwable(*exception).unwrap(),
            Outcome::Returned(value) => format!("returned {:?}", value),
        }
    }
}

fn run_snapshot_file(name: &str) {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("snapshots")
        .join(name);
    let loader = ImageLoader::load(&path).unwrap();
    let entry = loader.resolve_entry(loader.entry().unwrap()).unwrap();
    let run = Run::with_loader(loader, RuntimeConfig::default());

    let mut thread = run.vm.new_thread();
    let descriptor = MethodDescriptor::parse(&entry.descriptor).unwrap();
    let args = host_args(&mut thread, &descriptor, &[]).unwrap();
    let outcome = thread
        .invoke_static(&entry.class, &entry.method, &entry.descriptor, &args)
        .unwrap();
    run.vm.join_threads().unwrap();
    assert!(!outcome.is_throw(), "{} threw {}", name, run.describe(&outcome));

    let expected = std::fs::read_to_string(path.with_extension("stdout")).unwrap();
    assert_eq!(run.output.contents(), expected, "stdout mismatch for {}", name);
}

// Snapshot images, run in-process
#[test]
fn test_basic_arithmetic() {
    run_snapshot_file("basic/arithmetic.toml");
}

#[test]
fn test_basic_arrays() {
    run_snapshot_file("basic/arrays.toml");
}

#[test]
fn test_basic_dispatch() {
    run_snapshot_file("basic/dispatch.toml");
}

#[test]
fn test_basic_exceptions() {
    run_snapshot_file("basic/exceptions.toml");
}

#[test]
fn test_basic_statics() {
    run_snapshot_file("basic/statics.toml");
}

#[test]
fn test_basic_strings() {
    run_snapshot_file("basic/strings.toml");
}

#[test]
fn test_basic_switch() {
    run_snapshot_file("basic/switch.toml");
}

#[test]
fn test_basic_threads() {
    run_snapshot_file("basic/threads.toml");
}

/// `demo/Base.value()I` returns 0, `demo/SubN` overrides it to return N.
/// `demo/Main.call(Ldemo/Base;)I` is a single virtual call site.
fn hierarchy(subclasses: usize) -> String {
    let mut image = String::from(
        r#"
[[classes]]
name = "demo/Base"
super = "java/lang/Object"
constants = [{ methodref = ["java/lang/Object", "<init>", "()V"] }]
methods = [
    { name = "<init>", descriptor = "()V", flags = ["public"], max_stack = 1, max_locals = 1, code = [{ aload = 0 }, { invokespecial = 1 }, "return"] },
    { name = "value", descriptor = "()I", flags = ["public"], max_stack = 1, max_locals = 1, code = [{ iconst = 0 }, "ireturn"] },
]

[[classes]]
name = "demo/Main"
super = "java/lang/Object"
constants = [{ methodref = ["demo/Base", "value", "()I"] }]
methods = [
    { name = "call", descriptor = "(Ldemo/Base;)I", flags = ["public", "static"], max_stack = 1, max_locals = 1, code = [{ aload = 0 }, { invokevirtual = 1 }, "ireturn"] },
]
"#,
    );
    for n in 1..=subclasses {
        image.push_str(&format!(
            r#"
[[classes]]
name = "demo/Sub{n}"
super = "demo/Base"
constants = [{{ methodref = ["demo/Base", "<init>", "()V"] }}]
methods = [
    {{ name = "<init>", descriptor = "()V", flags = ["public"], max_stack = 1, max_locals = 1, code = [{{ aload = 0 }}, {{ invokespecial = 1 }}, "return"] }},
    {{ name = "value", descriptor = "()I", flags = ["public"], max_stack = 1, max_locals = 1, code = [{{ iconst = {n} }}, "ireturn"] }},
]
"#
        ));
    }
    image
}

#[test]
fn test_virtual_dispatch_follows_receiver_class() {
    let run = Run::new(&hierarchy(6), RuntimeConfig::default());
    let mut thread = run.vm.new_thread();

    // Cycle through more receiver classes than the inline cache holds, then
    // revisit earlier ones.
    let order = [0, 1, 2, 1, 3, 4, 5, 6, 0, 2, 6];
    for n in order {
        let name = if n == 0 {
            "demo/Base".to_string()
        } else {
            format!("demo/Sub{}", n)
        };
        let class = run.vm.registry().load(&name).unwrap();
        let receiver = thread.new_object(&class).unwrap();
        let outcome = thread
            .invoke_static("demo/Main", "call", "(Ldemo/Base;)I", &[Value::Ref(Some(receiver))])
            .unwrap();
        assert_eq!(outcome.value(), Some(Value::Int(n)), "receiver {}", name);
    }
}

#[test]
fn test_virtual_call_on_null_receiver() {
    let run = Run::new(&hierarchy(1), RuntimeConfig::default());
    let outcome = run.call("demo/Main", "call", "(Ldemo/Base;)I", &[Value::Ref(None)]);
    assert!(run.describe(&outcome).starts_with("java.lang.NullPointerException"));
}

const DEFAULTS: &str = r#"
[[classes]]
name = "demo/A"
super = "java/lang/Object"
flags = ["public", "interface", "abstract"]
methods = [
    { name = "hello", descriptor = "()I", flags = ["public"], max_stack = 1, max_locals = 1, code = [{ iconst = 1 }, "ireturn"] },
]

[[classes]]
name = "demo/B"
super = "java/lang/Object"
flags = ["public", "interface", "abstract"]
methods = [
    { name = "hello", descriptor = "()I", flags = ["public"], max_stack = 1, max_locals = 1, code = [{ iconst = 2 }, "ireturn"] },
]

[[classes]]
name = "demo/C"
super = "java/lang/Object"
interfaces = ["demo/A", "demo/B"]
constants = [{ methodref = ["java/lang/Object", "<init>", "()V"] }]
methods = [
    { name = "<init>", descriptor = "()V", flags = ["public"], max_stack = 1, max_locals = 1, code = [{ aload = 0 }, { invokespecial = 1 }, "return"] },
]

[[classes]]
name = "demo/D"
super = "java/lang/Object"
interfaces = ["demo/A"]
constants = [{ methodref = ["java/lang/Object", "<init>", "()V"] }]
methods = [
    { name = "<init>", descriptor = "()V", flags = ["public"], max_stack = 1, max_locals = 1, code = [{ aload = 0 }, { invokespecial = 1 }, "return"] },
]

[[classes]]
name = "demo/E"
super = "java/lang/Object"
interfaces = ["demo/A", "demo/B"]
constants = [{ methodref = ["java/lang/Object", "<init>", "()V"] }]
methods = [
    { name = "<init>", descriptor = "()V", flags = ["public"], max_stack = 1, max_locals = 1, code = [{ aload = 0 }, { invokespecial = 1 }, "return"] },
    { name = "hello", descriptor = "()I", flags = ["public"], max_stack = 1, max_locals = 1, code = [{ iconst = 3 }, "ireturn"] },
]

[[classes]]
name = "demo/Main"
super = "java/lang/Object"
constants = [
    { class = "demo/C" },
    { methodref = ["demo/C", "<init>", "()V"] },
    { interface_methodref = ["demo/A", "hello", "()I"] },
    { methodref = ["demo/C", "hello", "()I"] },
    { class = "demo/D" },
    { methodref = ["demo/D", "<init>", "()V"] },
    { class = "demo/E" },
    { methodref = ["demo/E", "<init>", "()V"] },
]
methods = [
    { name = "viaInterface", descriptor = "()I", flags = ["static"], max_stack = 2, code = [{ new = 1 }, "dup", { invokespecial = 2 }, { invokeinterface = 3 }, "ireturn"] },
    { name = "viaVirtual", descriptor = "()I", flags = ["static"], max_stack = 2, code = [{ new = 1 }, "dup", { invokespecial = 2 }, { invokevirtual = 4 }, "ireturn"] },
    { name = "single", descriptor = "()I", flags = ["static"], max_stack = 2, code = [{ new = 5 }, "dup", { invokespecial = 6 }, { invokeinterface = 3 }, "ireturn"] },
    { name = "overridden", descriptor = "()I", flags = ["static"], max_stack = 2, code = [{ new = 7 }, "dup", { invokespecial = 8 }, { invokeinterface = 3 }, "ireturn"] },
]
"#;

#[test]
fn test_conflicting_defaults_raise_on_both_paths() {
    let run = Run::new(DEFAULTS, RuntimeConfig::default());
    for name in ["viaInterface", "viaVirtual"] {
        let outcome = run.call("demo/Main", name, "()I", &[]);
        let text = run.describe(&outcome);
        assert!(
            text.starts_with("java.lang.IncompatibleClassChangeError"),
            "{}: {}",
            name,
            text
        );
    }
}

#[test]
fn test_default_methods_without_conflict() {
    let run = Run::new(DEFAULTS, RuntimeConfig::default());
    assert_eq!(run.int("demo/Main", "single"), 1);
    assert_eq!(run.int("demo/Main", "overridden"), 3);
}

/// Main holds the lock while starting the worker, then waits until the
/// worker sets `flag` and notifies.
const WAIT_NOTIFY: &str = r#"
entry = "demo/Sync.main"

[[classes]]
name = "demo/Sync"
super = "java/lang/Object"
interfaces = ["java/lang/Runnable"]
fields = [
    { name = "lock", descriptor = "Ljava/lang/Object;", flags = ["static"] },
    { name = "flag", descriptor = "I", flags = ["static"] },
]
constants = [
    { methodref = ["java/lang/Object", "<init>", "()V"] },
    { class = "java/lang/Object" },
    { fieldref = ["demo/Sync", "lock", "Ljava/lang/Object;"] },
    { fieldref = ["demo/Sync", "flag", "I"] },
    { methodref = ["java/lang/Object", "notify", "()V"] },
    { methodref = ["java/lang/Object", "wait", "()V"] },
    { class = "java/lang/Thread" },
    { class = "demo/Sync" },
    { methodref = ["demo/Sync", "<init>", "()V"] },
    { methodref = ["java/lang/Thread", "<init>", "(Ljava/lang/Runnable;)V"] },
    { methodref = ["java/lang/Thread", "start", "()V"] },
    { methodref = ["java/lang/Thread", "join", "()V"] },
    { methodref = ["kettle/Console", "println", "(I)V"] },
]

[[classes.methods]]
name = "<init>"
descriptor = "()V"
flags = ["public"]
max_stack = 1
max_locals = 1
code = [{ aload = 0 }, { invokespecial = 1 }, "return"]

[[classes.methods]]
name = "run"
descriptor = "()V"
flags = ["public"]
max_stack = 2
max_locals = 2
code = [
    { getstatic = 3 }, "dup", { astore = 1 }, "monitorenter",
    { iconst = 1 }, { putstatic = 4 },
    { getstatic = 3 }, { invokevirtual = 5 },
    { aload = 1 }, "monitorexit",
    "return",
]

[[classes.methods]]
name = "main"
descriptor = "()V"
flags = ["public", "static"]
max_stack = 4
max_locals = 2
code = [
    { new = 2 }, "dup", { invokespecial = 1 }, { putstatic = 3 },
    { new = 7 }, "dup", { new = 8 }, "dup", { invokespecial = 9 }, { invokespecial = 10 },
    { astore = 0 },
    { getstatic = 3 }, "dup", { astore = 1 }, "monitorenter",
    { aload = 0 }, { invokevirtual = 11 },
    # 17: while (flag == 0) lock.wait()
    { getstatic = 4 }, { if = ["ne", 22] },
    { getstatic = 3 }, { invokevirtual = 6 }, { goto = 17 },
    # 22
    { aload = 1 }, "monitorexit",
    { getstatic = 4 }, { invokestatic = 13 },
    { aload = 0 }, { invokevirtual = 12 },
    "return",
]
"#;

#[test]
fn test_wait_and_notify_across_threads() {
    let run = Run::new(WAIT_NOTIFY, RuntimeConfig::default());
    let outcome = run.call("demo/Sync", "main", "()V", &[]);
    assert_eq!(outcome, Outcome::Returned(None), "{}", run.describe(&outcome));
    assert_eq!(run.output.contents(), "1\n");
}

const SYNCHRONIZED: &str = r#"
[[classes]]
name = "demo/Counter"
super = "java/lang/Object"
fields = [{ name = "total", descriptor = "I", flags = ["static"] }]
constants = [
    { fieldref = ["demo/Counter", "total", "I"] },
    { methodref = ["demo/Counter", "bump", "()V"] },
    { methodref = ["demo/Counter", "<init>", "()V"] },
    { methodref = ["java/lang/Object", "<init>", "()V"] },
    { class = "java/lang/Thread" },
    { class = "demo/Counter" },
    { methodref = ["java/lang/Thread", "<init>", "(Ljava/lang/Runnable;)V"] },
    { methodref = ["java/lang/Thread", "start", "()V"] },
    { methodref = ["java/lang/Thread", "join", "()V"] },
]
interfaces = ["java/lang/Runnable"]

[[classes.methods]]
name = "<init>"
descriptor = "()V"
flags = ["public"]
max_stack = 1
max_locals = 1
code = [{ aload = 0 }, { invokespecial = 4 }, "return"]

[[classes.methods]]
name = "bump"
descriptor = "()V"
flags = ["static", "synchronized"]
max_stack = 2
max_locals = 0
code = [{ getstatic = 1 }, { iconst = 1 }, "iadd", { putstatic = 1 }, "return"]

# run(): 500 synchronized increments
[[classes.methods]]
name = "run"
descriptor = "()V"
flags = ["public"]
max_stack = 2
max_locals = 2
code = [
    { iconst = 0 }, { istore = 1 },
    { iload = 1 }, { iconst = 500 }, { if_icmp = ["ge", 8] },
    { invokestatic = 2 }, { iinc = [1, 1] }, { goto = 2 },
    "return",
]

# Four threads, each running run(); returns the total.
[[classes.methods]]
name = "race"
descriptor = "()I"
flags = ["public", "static"]
max_stack = 4
max_locals = 4
code = [
    { new = 5 }, "dup", { new = 6 }, "dup", { invokespecial = 3 }, { invokespecial = 7 }, { astore = 0 },
    { new = 5 }, "dup", { new = 6 }, "dup", { invokespecial = 3 }, { invokespecial = 7 }, { astore = 1 },
    { new = 5 }, "dup", { new = 6 }, "dup", { invokespecial = 3 }, { invokespecial = 7 }, { astore = 2 },
    { new = 5 }, "dup", { new = 6 }, "dup", { invokespecial = 3 }, { invokespecial = 7 }, { astore = 3 },
    { aload = 0 }, { invokevirtual = 8 }, { aload = 1 }, { invokevirtual = 8 },
    { aload = 2 }, { invokevirtual = 8 }, { aload = 3 }, { invokevirtual = 8 },
    { aload = 0 }, { invokevirtual = 9 }, { aload = 1 }, { invokevirtual = 9 },
    { aload = 2 }, { invokevirtual = 9 }, { aload = 3 }, { invokevirtual = 9 },
    { getstatic = 1 }, "ireturn",
]
"#;

#[test]
fn test_synchronized_static_method_under_contention() {
    let run = Run::new(SYNCHRONIZED, RuntimeConfig::default());
    assert_eq!(run.int("demo/Counter", "race"), 2000);
}

#[test]
fn test_heap_limit_raises_out_of_memory() {
    let image = r#"
[[classes]]
name = "demo/Hog"
super = "java/lang/Object"
methods = [
    { name = "run", descriptor = "()V", flags = ["static"], max_stack = 1, code = [{ iconst = 4 }, { newarray = "long" }, "pop", { goto = 0 }] },
]
"#;
    let config = RuntimeConfig {
        heap_limit: Some(200),
        ..RuntimeConfig::default()
    };
    let run = Run::new(image, config);
    let outcome = run.call("demo/Hog", "run", "()V", &[]);
    assert!(run.describe(&outcome).starts_with("java.lang.OutOfMemoryError"));
}

#[test]
fn test_raw_bytecode_image() {
    // iconst_0; istore_0; iinc 0 5; iload_0; bipush 37; iadd; ireturn
    let image = r#"
[[classes]]
name = "demo/Raw"
super = "java/lang/Object"
methods = [
    { name = "run", descriptor = "()I", flags = ["static"], max_stack = 2, max_locals = 1, bytecode = [3, 59, 132, 0, 5, 26, 16, 37, 96, 172] },
]
"#;
    let run = Run::new(image, RuntimeConfig::default());
    assert_eq!(run.int("demo/Raw", "run"), 42);
}

#[test]
fn test_string_constants_are_interned_across_classes() {
    let image = r#"
[[classes]]
name = "demo/A"
super = "java/lang/Object"
constants = [{ string = "shared" }]
methods = [
    { name = "get", descriptor = "()Ljava/lang/String;", flags = ["static"], max_stack = 1, code = [{ ldc = 1 }, "areturn"] },
]

[[classes]]
name = "demo/B"
super = "java/lang/Object"
constants = [{ string = "shared" }, { methodref = ["demo/A", "get", "()Ljava/lang/String;"] }]
methods = [
    { name = "same", descriptor = "()I", flags = ["static"], max_stack = 2, code = [{ ldc = 1 }, { invokestatic = 2 }, { if_acmpne = 5 }, { iconst = 1 }, "ireturn", { iconst = 0 }, "ireturn"] },
]
"#;
    let run = Run::new(image, RuntimeConfig::default());
    assert_eq!(run.int("demo/B", "same"), 1);
}

#[test]
fn test_exception_handler_order_and_rethrow() {
    // The first matching handler wins; the second handler rethrows to the
    // caller, which catches it with a catch-all.
    let image = r#"
[[classes]]
name = "demo/H"
super = "java/lang/Object"
constants = [{ methodref = ["demo/H", "inner", "()I"] }]

[[classes.methods]]
name = "inner"
descriptor = "()I"
flags = ["static"]
max_stack = 2
max_locals = 0
code = [{ iconst = 1 }, { iconst = 0 }, "idiv", "ireturn", "athrow", { iconst = 7 }, "ireturn"]
handlers = [
    { start = 0, end = 4, handler = 4, catch_type = "java/lang/RuntimeException" },
    { start = 0, end = 4, handler = 5, catch_type = "java/lang/ArithmeticException" },
]

[[classes.methods]]
name = "outer"
descriptor = "()I"
flags = ["static"]
max_stack = 1
max_locals = 0
code = [{ invokestatic = 1 }, "ireturn", "pop", { iconst = -1 }, "ireturn"]
handlers = [{ start = 0, end = 2, handler = 2 }]
"#;
    let run = Run::new(image, RuntimeConfig::default());
    assert_eq!(run.int("demo/H", "outer"), -1);
    let outcome = run.call("demo/H", "inner", "()I", &[]);
    assert_eq!(run.describe(&outcome), "java.lang.ArithmeticException: / by zero");
}
