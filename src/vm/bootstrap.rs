//! The bootstrap class set.
//!
//! A minimal `java/lang` core the engine itself depends on: the root
//! object, strings, class mirrors, the throwable hierarchy raised by
//! instruction semantics and linkage, threads and a console for output.
//! Bodies are written in the instruction set where that is natural; the
//! rest are `native` and implemented in [`super::native`].

use std::collections::HashMap;

use super::class::{AccessFlags, ClassDef, ConstantDef, FieldDef, Flag, MethodDef};
use super::ops::Instruction;
use super::registry::ClassLoader;

/// Internal names of the classes the engine refers to directly.
pub mod names {
    pub const OBJECT: &str = "java/lang/Object";
    pub const STRING: &str = "java/lang/String";
    pub const CLASS: &str = "java/lang/Class";
    pub const CLONEABLE: &str = "java/lang/Cloneable";
    pub const SERIALIZABLE: &str = "java/io/Serializable";
    pub const RUNNABLE: &str = "java/lang/Runnable";
    pub const THREAD: &str = "java/lang/Thread";
    pub const SYSTEM: &str = "java/lang/System";
    pub const CONSOLE: &str = "kettle/Console";

    pub const THROWABLE: &str = "java/lang/Throwable";
    pub const EXCEPTION: &str = "java/lang/Exception";
    pub const RUNTIME_EXCEPTION: &str = "java/lang/RuntimeException";
    pub const ARITHMETIC: &str = "java/lang/ArithmeticException";
    pub const NULL_POINTER: &str = "java/lang/NullPointerException";
    pub const INDEX_OUT_OF_BOUNDS: &str = "java/lang/IndexOutOfBoundsException";
    pub const ARRAY_INDEX_OUT_OF_BOUNDS: &str = "java/lang/ArrayIndexOutOfBoundsException";
    pub const STRING_INDEX_OUT_OF_BOUNDS: &str = "java/lang/StringIndexOutOfBoundsException";
    pub const NEGATIVE_ARRAY_SIZE: &str = "java/lang/NegativeArraySizeException";
    pub const CLASS_CAST: &str = "java/lang/ClassCastException";
    pub const ARRAY_STORE: &str = "java/lang/ArrayStoreException";
    pub const ILLEGAL_MONITOR_STATE: &str = "java/lang/IllegalMonitorStateException";
    pub const ILLEGAL_ARGUMENT: &str = "java/lang/IllegalArgumentException";
    pub const ILLEGAL_THREAD_STATE: &str = "java/lang/IllegalThreadStateException";
    pub const INTERRUPTED: &str = "java/lang/InterruptedException";

    pub const ERROR: &str = "java/lang/Error";
    pub const LINKAGE: &str = "java/lang/LinkageError";
    pub const INCOMPATIBLE_CLASS_CHANGE: &str = "java/lang/IncompatibleClassChangeError";
    pub const NO_SUCH_METHOD: &str = "java/lang/NoSuchMethodError";
    pub const NO_SUCH_FIELD: &str = "java/lang/NoSuchFieldError";
    pub const ABSTRACT_METHOD: &str = "java/lang/AbstractMethodError";
    pub const INSTANTIATION: &str = "java/lang/InstantiationError";
    pub const NO_CLASS_DEF_FOUND: &str = "java/lang/NoClassDefFoundError";
    pub const CLASS_CIRCULARITY: &str = "java/lang/ClassCircularityError";
    pub const VERIFY: &str = "java/lang/VerifyError";
    pub const CLASS_FORMAT: &str = "java/lang/ClassFormatError";
    pub const EXCEPTION_IN_INITIALIZER: &str = "java/lang/ExceptionInInitializerError";
    pub const BOOTSTRAP_METHOD: &str = "java/lang/BootstrapMethodError";
    pub const UNSATISFIED_LINK: &str = "java/lang/UnsatisfiedLinkError";
    pub const VIRTUAL_MACHINE: &str = "java/lang/VirtualMachineError";
    pub const STACK_OVERFLOW: &str = "java/lang/StackOverflowError";
    pub const OUT_OF_MEMORY: &str = "java/lang/OutOfMemoryError";
}

use names::*;

/// `(class, superclass)` for every throwable the engine can raise.
const THROWABLES: &[(&str, &str)] = &[
    (EXCEPTION, THROWABLE),
    (RUNTIME_EXCEPTION, EXCEPTION),
    (ARITHMETIC, RUNTIME_EXCEPTION),
    (NULL_POINTER, RUNTIME_EXCEPTION),
    (INDEX_OUT_OF_BOUNDS, RUNTIME_EXCEPTION),
    (ARRAY_INDEX_OUT_OF_BOUNDS, INDEX_OUT_OF_BOUNDS),
    (STRING_INDEX_OUT_OF_BOUNDS, INDEX_OUT_OF_BOUNDS),
    (NEGATIVE_ARRAY_SIZE, RUNTIME_EXCEPTION),
    (CLASS_CAST, RUNTIME_EXCEPTION),
    (ARRAY_STORE, RUNTIME_EXCEPTION),
    (ILLEGAL_MONITOR_STATE, RUNTIME_EXCEPTION),
    (ILLEGAL_ARGUMENT, RUNTIME_EXCEPTION),
    (ILLEGAL_THREAD_STATE, ILLEGAL_ARGUMENT),
    (INTERRUPTED, EXCEPTION),
    (ERROR, THROWABLE),
    (LINKAGE, ERROR),
    (INCOMPATIBLE_CLASS_CHANGE, LINKAGE),
    (NO_SUCH_METHOD, INCOMPATIBLE_CLASS_CHANGE),
    (NO_SUCH_FIELD, INCOMPATIBLE_CLASS_CHANGE),
    (ABSTRACT_METHOD, INCOMPATIBLE_CLASS_CHANGE),
    (INSTANTIATION, INCOMPATIBLE_CLASS_CHANGE),
    (NO_CLASS_DEF_FOUND, LINKAGE),
    (CLASS_CIRCULARITY, LINKAGE),
    (VERIFY, LINKAGE),
    (CLASS_FORMAT, LINKAGE),
    (EXCEPTION_IN_INITIALIZER, LINKAGE),
    (BOOTSTRAP_METHOD, LINKAGE),
    (UNSATISFIED_LINK, LINKAGE),
    (VIRTUAL_MACHINE, ERROR),
    (STACK_OVERFLOW, VIRTUAL_MACHINE),
    (OUT_OF_MEMORY, VIRTUAL_MACHINE),
];

fn flags(list: &[Flag]) -> AccessFlags {
    AccessFlags::from(list.to_vec())
}

fn class(name: &str, super_class: Option<&str>, class_flags: &[Flag]) -> ClassDef {
    ClassDef {
        name: name.to_string(),
        super_class: super_class.map(str::to_string),
        flags: flags(class_flags),
        ..Default::default()
    }
}

fn interface(name: &str) -> ClassDef {
    class(name, Some(OBJECT), &[Flag::Public, Flag::Interface, Flag::Abstract])
}

fn method(
    name: &str,
    descriptor: &str,
    method_flags: &[Flag],
    max_stack: u16,
    max_locals: u16,
    code: Vec<Instruction>,
) -> MethodDef {
    MethodDef {
        name: name.to_string(),
        descriptor: descriptor.to_string(),
        flags: flags(method_flags),
        max_stack,
        max_locals,
        code,
        ..Default::default()
    }
}

fn native(name: &str, descriptor: &str, method_flags: &[Flag]) -> MethodDef {
    let mut all = method_flags.to_vec();
    all.push(Flag::Native);
    method(name, descriptor, &all, 0, 0, Vec::new())
}

fn field(name: &str, descriptor: &str, field_flags: &[Flag]) -> FieldDef {
    FieldDef {
        name: name.to_string(),
        descriptor: descriptor.to_string(),
        flags: flags(field_flags),
    }
}

fn member(class: &str, name: &str, descriptor: &str) -> (String, String, String) {
    (class.to_string(), name.to_string(), descriptor.to_string())
}

fn methodref(class: &str, name: &str, descriptor: &str) -> ConstantDef {
    let (c, n, d) = member(class, name, descriptor);
    ConstantDef::Methodref(c, n, d)
}

fn fieldref(class: &str, name: &str, descriptor: &str) -> ConstantDef {
    let (c, n, d) = member(class, name, descriptor);
    ConstantDef::Fieldref(c, n, d)
}

fn object() -> ClassDef {
    use Instruction::*;
    let mut def = class(OBJECT, None, &[Flag::Public]);
    def.methods = vec![
        method("<init>", "()V", &[Flag::Public], 0, 1, vec![Return]),
        method(
            "equals",
            "(Ljava/lang/Object;)Z",
            &[Flag::Public],
            2,
            2,
            vec![Aload(0), Aload(1), IfAcmpne(5), Iconst(1), Ireturn, Iconst(0), Ireturn],
        ),
        native("hashCode", "()I", &[Flag::Public]),
        native("toString", "()Ljava/lang/String;", &[Flag::Public]),
        native("getClass", "()Ljava/lang/Class;", &[Flag::Public, Flag::Final]),
        native("wait", "()V", &[Flag::Public, Flag::Final]),
        native("wait", "(J)V", &[Flag::Public, Flag::Final]),
        native("notify", "()V", &[Flag::Public, Flag::Final]),
        native("notifyAll", "()V", &[Flag::Public, Flag::Final]),
    ];
    def
}

fn string() -> ClassDef {
    let mut def = class(STRING, Some(OBJECT), &[Flag::Public, Flag::Final]);
    def.interfaces = vec![SERIALIZABLE.to_string()];
    def.fields = vec![field("value", "[C", &[Flag::Private, Flag::Final])];
    def.methods = vec![
        native("length", "()I", &[Flag::Public]),
        native("charAt", "(I)C", &[Flag::Public]),
        native("equals", "(Ljava/lang/Object;)Z", &[Flag::Public]),
        native("hashCode", "()I", &[Flag::Public]),
        native("concat", "(Ljava/lang/String;)Ljava/lang/String;", &[Flag::Public]),
        native("intern", "()Ljava/lang/String;", &[Flag::Public]),
        method(
            "toString",
            "()Ljava/lang/String;",
            &[Flag::Public],
            1,
            1,
            vec![Instruction::Aload(0), Instruction::Areturn],
        ),
        native("valueOf", "(I)Ljava/lang/String;", &[Flag::Public, Flag::Static]),
        native("valueOf", "(J)Ljava/lang/String;", &[Flag::Public, Flag::Static]),
        native("valueOf", "(D)Ljava/lang/String;", &[Flag::Public, Flag::Static]),
        native("valueOf", "(C)Ljava/lang/String;", &[Flag::Public, Flag::Static]),
        native("valueOf", "(Z)Ljava/lang/String;", &[Flag::Public, Flag::Static]),
        native(
            "valueOf",
            "(Ljava/lang/Object;)Ljava/lang/String;",
            &[Flag::Public, Flag::Static],
        ),
    ];
    def
}

fn class_mirror() -> ClassDef {
    let mut def = class(CLASS, Some(OBJECT), &[Flag::Public, Flag::Final]);
    def.methods = vec![
        native("getName", "()Ljava/lang/String;", &[Flag::Public]),
        native("isInterface", "()Z", &[Flag::Public]),
        native("isArray", "()Z", &[Flag::Public]),
    ];
    def
}

fn throwable() -> ClassDef {
    use Instruction::*;
    let mut def = class(THROWABLE, Some(OBJECT), &[Flag::Public]);
    def.interfaces = vec![SERIALIZABLE.to_string()];
    def.fields = vec![
        field("detailMessage", "Ljava/lang/String;", &[Flag::Private]),
        field("cause", "Ljava/lang/Throwable;", &[Flag::Private]),
    ];
    def.constants = vec![
        methodref(OBJECT, "<init>", "()V"),
        fieldref(THROWABLE, "detailMessage", "Ljava/lang/String;"),
        fieldref(THROWABLE, "cause", "Ljava/lang/Throwable;"),
    ];
    def.methods = vec![
        method("<init>", "()V", &[Flag::Public], 1, 1, vec![Aload(0), Invokespecial(1), Return]),
        method(
            "<init>",
            "(Ljava/lang/String;)V",
            &[Flag::Public],
            2,
            2,
            vec![Aload(0), Invokespecial(1), Aload(0), Aload(1), Putfield(2), Return],
        ),
        method(
            "getMessage",
            "()Ljava/lang/String;",
            &[Flag::Public],
            1,
            1,
            vec![Aload(0), Getfield(2), Areturn],
        ),
        method(
            "getCause",
            "()Ljava/lang/Throwable;",
            &[Flag::Public],
            1,
            1,
            vec![Aload(0), Getfield(3), Areturn],
        ),
        method(
            "initCause",
            "(Ljava/lang/Throwable;)Ljava/lang/Throwable;",
            &[Flag::Public],
            2,
            2,
            vec![Aload(0), Aload(1), Putfield(3), Aload(0), Areturn],
        ),
        native("toString", "()Ljava/lang/String;", &[Flag::Public]),
    ];
    def
}

/// A throwable subclass with the two conventional constructors.
fn throwable_subclass(name: &str, super_class: &str) -> ClassDef {
    use Instruction::*;
    let mut def = class(name, Some(super_class), &[Flag::Public]);
    def.constants = vec![
        methodref(super_class, "<init>", "()V"),
        methodref(super_class, "<init>", "(Ljava/lang/String;)V"),
    ];
    def.methods = vec![
        method("<init>", "()V", &[Flag::Public], 1, 1, vec![Aload(0), Invokespecial(1), Return]),
        method(
            "<init>",
            "(Ljava/lang/String;)V",
            &[Flag::Public],
            2,
            2,
            vec![Aload(0), Aload(1), Invokespecial(2), Return],
        ),
    ];
    def
}

fn runnable() -> ClassDef {
    let mut def = interface(RUNNABLE);
    def.methods = vec![method("run", "()V", &[Flag::Public, Flag::Abstract], 0, 0, Vec::new())];
    def
}

fn thread() -> ClassDef {
    use Instruction::*;
    let mut def = class(THREAD, Some(OBJECT), &[Flag::Public]);
    def.interfaces = vec![RUNNABLE.to_string()];
    def.fields = vec![
        field("tid", "J", &[Flag::Private]),
        field("target", "Ljava/lang/Runnable;", &[Flag::Private]),
    ];
    def.constants = vec![
        methodref(OBJECT, "<init>", "()V"),
        fieldref(THREAD, "target", "Ljava/lang/Runnable;"),
        ConstantDef::InterfaceMethodref(
            RUNNABLE.to_string(),
            "run".to_string(),
            "()V".to_string(),
        ),
        fieldref(THREAD, "tid", "J"),
    ];
    def.methods = vec![
        method("<init>", "()V", &[Flag::Public], 1, 1, vec![Aload(0), Invokespecial(1), Return]),
        method(
            "<init>",
            "(Ljava/lang/Runnable;)V",
            &[Flag::Public],
            2,
            2,
            vec![Aload(0), Invokespecial(1), Aload(0), Aload(1), Putfield(2), Return],
        ),
        method(
            "run",
            "()V",
            &[Flag::Public],
            2,
            1,
            vec![
                Aload(0),
                Getfield(2),
                Dup,
                Ifnull(6),
                Invokeinterface(3),
                Return,
                Pop,
                Return,
            ],
        ),
        method("getId", "()J", &[Flag::Public], 2, 1, vec![Aload(0), Getfield(4), Lreturn]),
        native("start", "()V", &[Flag::Public]),
        native("join", "()V", &[Flag::Public]),
        native("interrupt", "()V", &[Flag::Public]),
        native("isInterrupted", "()Z", &[Flag::Public]),
        native("isAlive", "()Z", &[Flag::Public]),
        native("currentThread", "()Ljava/lang/Thread;", &[Flag::Public, Flag::Static]),
        native("interrupted", "()Z", &[Flag::Public, Flag::Static]),
        native("sleep", "(J)V", &[Flag::Public, Flag::Static]),
    ];
    def
}

fn system() -> ClassDef {
    let mut def = class(SYSTEM, Some(OBJECT), &[Flag::Public, Flag::Final]);
    let stat = &[Flag::Public, Flag::Static];
    def.methods = vec![
        native("identityHashCode", "(Ljava/lang/Object;)I", stat),
        native("currentTimeMillis", "()J", stat),
        native("nanoTime", "()J", stat),
        native("arraycopy", "(Ljava/lang/Object;ILjava/lang/Object;II)V", stat),
    ];
    def
}

fn console() -> ClassDef {
    let mut def = class(CONSOLE, Some(OBJECT), &[Flag::Public, Flag::Final]);
    let stat = &[Flag::Public, Flag::Static];
    def.methods = ["()V", "(I)V", "(J)V", "(F)V", "(D)V", "(Z)V", "(C)V"]
        .into_iter()
        .chain(["(Ljava/lang/String;)V", "(Ljava/lang/Object;)V"])
        .map(|d| native("println", d, stat))
        .chain(
            ["(I)V", "(Ljava/lang/String;)V"]
                .into_iter()
                .map(|d| native("print", d, stat)),
        )
        .collect();
    def
}

/// Every bootstrap class definition.
pub fn class_defs() -> Vec<ClassDef> {
    let mut defs = vec![
        object(),
        string(),
        class_mirror(),
        interface(CLONEABLE),
        interface(SERIALIZABLE),
        runnable(),
        thread(),
        system(),
        console(),
        throwable(),
    ];
    defs.extend(
        THROWABLES
            .iter()
            .map(|(name, super_class)| throwable_subclass(name, super_class)),
    );
    defs
}

/// Serves the bootstrap classes. Consulted before any user loader, so
/// user images cannot replace core classes.
pub struct BootstrapLoader {
    classes: HashMap<String, ClassDef>,
}

impl BootstrapLoader {
    pub fn new() -> Self {
        Self {
            classes: class_defs()
                .into_iter()
                .map(|def| (def.name.clone(), def))
                .collect(),
        }
    }
}

impl Default for BootstrapLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassLoader for BootstrapLoader {
    fn find_class(&self, name: &str) -> Option<ClassDef> {
        self.classes.get(name).cloned()
    }
}
