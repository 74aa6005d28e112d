//! Class metadata: definitions as loaded, and the runtime form the
//! interpreter executes against.
//!
//! A [`ClassDef`] is what a class loader hands over (serde-friendly, names
//! everywhere). The registry links it into a [`Class`]: superclass and
//! interfaces become [`ClassId`]s, the instance layout is flattened, method
//! tables become slot-indexed `Arc<Method>`s and the constant pool grows a
//! resolution slot per symbolic entry.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use super::debug::LineTable;
use super::descriptor::{DescriptorError, FieldKind, FieldType, MethodDescriptor};
use super::heap::ObjectRef;
use super::ic::InlineCache;
use super::ops::Instruction;
use super::value::Value;

/// Index of a class in the registry arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u32);

impl ClassId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

// ========================================
// Access flags
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flag {
    Public,
    Private,
    Protected,
    Static,
    Final,
    Synchronized,
    Native,
    Interface,
    Abstract,
}

impl Flag {
    const ALL: [Flag; 9] = [
        Flag::Public,
        Flag::Private,
        Flag::Protected,
        Flag::Static,
        Flag::Final,
        Flag::Synchronized,
        Flag::Native,
        Flag::Interface,
        Flag::Abstract,
    ];

    pub fn bit(self) -> u16 {
        match self {
            Flag::Public => AccessFlags::PUBLIC,
            Flag::Private => AccessFlags::PRIVATE,
            Flag::Protected => AccessFlags::PROTECTED,
            Flag::Static => AccessFlags::STATIC,
            Flag::Final => AccessFlags::FINAL,
            Flag::Synchronized => AccessFlags::SYNCHRONIZED,
            Flag::Native => AccessFlags::NATIVE,
            Flag::Interface => AccessFlags::INTERFACE,
            Flag::Abstract => AccessFlags::ABSTRACT,
        }
    }
}

/// Class-file access flags. Serialized as a list of flag names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Flag>", into = "Vec<Flag>")]
pub struct AccessFlags(pub u16);

impl AccessFlags {
    pub const PUBLIC: u16 = 0x0001;
    pub const PRIVATE: u16 = 0x0002;
    pub const PROTECTED: u16 = 0x0004;
    pub const STATIC: u16 = 0x0008;
    pub const FINAL: u16 = 0x0010;
    pub const SYNCHRONIZED: u16 = 0x0020;
    pub const NATIVE: u16 = 0x0100;
    pub const INTERFACE: u16 = 0x0200;
    pub const ABSTRACT: u16 = 0x0400;

    pub fn contains(self, bits: u16) -> bool {
        self.0 & bits == bits
    }

    pub fn with(self, flag: Flag) -> Self {
        Self(self.0 | flag.bit())
    }
}

impl From<Vec<Flag>> for AccessFlags {
    fn from(flags: Vec<Flag>) -> Self {
        Self(flags.iter().fold(0, |acc, f| acc | f.bit()))
    }
}

impl From<AccessFlags> for Vec<Flag> {
    fn from(flags: AccessFlags) -> Self {
        Flag::ALL
            .into_iter()
            .filter(|f| flags.contains(f.bit()))
            .collect()
    }
}

// ========================================
// Definitions (loader input)
// ========================================

/// A class as delivered by a class loader.
///
/// Constant-pool entry `#n` is `constants[n - 1]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassDef {
    pub name: String,
    /// Defaults to `java/lang/Object` for every class but Object itself.
    #[serde(rename = "super", default, skip_serializing_if = "Option::is_none")]
    pub super_class: Option<String>,
    #[serde(default)]
    pub interfaces: Vec<String>,
    #[serde(default)]
    pub flags: AccessFlags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldDef>,
    #[serde(default)]
    pub constants: Vec<ConstantDef>,
    #[serde(default)]
    pub methods: Vec<MethodDef>,
    #[serde(default)]
    pub bootstrap_methods: Vec<BootstrapDef>,
}

impl ClassDef {
    pub fn is_interface(&self) -> bool {
        self.flags.contains(AccessFlags::INTERFACE)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub descriptor: String,
    #[serde(default)]
    pub flags: AccessFlags,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MethodDef {
    pub name: String,
    pub descriptor: String,
    #[serde(default)]
    pub flags: AccessFlags,
    #[serde(default)]
    pub max_stack: u16,
    #[serde(default)]
    pub max_locals: u16,
    #[serde(default)]
    pub code: Vec<Instruction>,
    /// Raw `Code` bytes. Decoded at load time; handler and line positions
    /// are then byte offsets instead of instruction indices.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytecode: Option<Vec<u8>>,
    #[serde(default)]
    pub handlers: Vec<HandlerDef>,
    /// `(pc, line)` pairs.
    #[serde(default)]
    pub lines: Vec<(usize, u32)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerDef {
    pub start: usize,
    pub end: usize,
    pub handler: usize,
    /// `None` catches everything.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catch_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapDef {
    /// Constant-pool index of the bootstrap method handle.
    pub method: u16,
    /// Constant-pool indices of the static arguments.
    #[serde(default)]
    pub arguments: Vec<u16>,
}

/// Reference kind of a method handle constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleKind {
    GetField,
    GetStatic,
    PutField,
    PutStatic,
    InvokeVirtual,
    InvokeStatic,
    InvokeSpecial,
    NewInvokeSpecial,
    InvokeInterface,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstantDef {
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    String(String),
    Class(String),
    /// `[class, name, descriptor]`
    Fieldref(String, String, String),
    Methodref(String, String, String),
    InterfaceMethodref(String, String, String),
    MethodHandle(HandleKind, String, String, String),
    /// `[bootstrap index, name, descriptor]`
    InvokeDynamic(u16, String, String),
}

// ========================================
// Runtime constant pool
// ========================================

/// Symbolic reference to a field or method.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemberRef {
    pub class: String,
    pub name: String,
    pub descriptor: String,
}

impl MemberRef {
    pub fn new(class: String, name: String, descriptor: String) -> Self {
        Self {
            class,
            name,
            descriptor,
        }
    }
}

impl fmt::Display for MemberRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.class, self.name, self.descriptor)
    }
}

/// A resolved field reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedField {
    /// Declaring class.
    pub class: ClassId,
    pub name: String,
    pub kind: FieldKind,
    /// Index into the instance layout or the declaring class's statics.
    pub offset: usize,
    pub is_static: bool,
}

/// A runtime constant-pool entry. Symbolic entries carry a resolution slot
/// that is filled at most once.
#[derive(Debug)]
pub enum Constant {
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    String {
        value: String,
        interned: OnceLock<ObjectRef>,
    },
    Class {
        name: String,
        resolved: OnceLock<ClassId>,
    },
    Field {
        member: MemberRef,
        resolved: OnceLock<ResolvedField>,
    },
    Method {
        member: MemberRef,
        interface: bool,
        resolved: OnceLock<Arc<Method>>,
    },
    MethodHandle {
        kind: HandleKind,
        member: MemberRef,
    },
    InvokeDynamic {
        bootstrap: u16,
        name: String,
        descriptor: String,
        call_site: OnceLock<Arc<Method>>,
    },
}

impl Constant {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Constant::Integer(_) => "integer",
            Constant::Float(_) => "float",
            Constant::Long(_) => "long",
            Constant::Double(_) => "double",
            Constant::String { .. } => "string",
            Constant::Class { .. } => "class",
            Constant::Field { .. } => "field reference",
            Constant::Method { interface: false, .. } => "method reference",
            Constant::Method { interface: true, .. } => "interface method reference",
            Constant::MethodHandle { .. } => "method handle",
            Constant::InvokeDynamic { .. } => "invokedynamic",
        }
    }
}

impl From<ConstantDef> for Constant {
    fn from(def: ConstantDef) -> Self {
        match def {
            ConstantDef::Integer(n) => Constant::Integer(n),
            ConstantDef::Float(f) => Constant::Float(f),
            ConstantDef::Long(n) => Constant::Long(n),
            ConstantDef::Double(f) => Constant::Double(f),
            ConstantDef::String(value) => Constant::String {
                value,
                interned: OnceLock::new(),
            },
            ConstantDef::Class(name) => Constant::Class {
                name,
                resolved: OnceLock::new(),
            },
            ConstantDef::Fieldref(c, n, d) => Constant::Field {
                member: MemberRef::new(c, n, d),
                resolved: OnceLock::new(),
            },
            ConstantDef::Methodref(c, n, d) => Constant::Method {
                member: MemberRef::new(c, n, d),
                interface: false,
                resolved: OnceLock::new(),
            },
            ConstantDef::InterfaceMethodref(c, n, d) => Constant::Method {
                member: MemberRef::new(c, n, d),
                interface: true,
                resolved: OnceLock::new(),
            },
            ConstantDef::MethodHandle(kind, c, n, d) => Constant::MethodHandle {
                kind,
                member: MemberRef::new(c, n, d),
            },
            ConstantDef::InvokeDynamic(bootstrap, name, descriptor) => Constant::InvokeDynamic {
                bootstrap,
                name,
                descriptor,
                call_site: OnceLock::new(),
            },
        }
    }
}

#[derive(Debug, Default)]
pub struct ConstantPool {
    entries: Vec<Constant>,
}

impl ConstantPool {
    pub fn new(defs: Vec<ConstantDef>) -> Self {
        Self {
            entries: defs.into_iter().map(Constant::from).collect(),
        }
    }

    /// Entry `#index` (1-based).
    pub fn get(&self, index: u16) -> Option<&Constant> {
        (index as usize)
            .checked_sub(1)
            .and_then(|i| self.entries.get(i))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ========================================
// Class initialization barrier
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitState {
    Uninitialized,
    InProgress(u64),
    Initialized,
    Failed,
}

/// What the caller of [`InitBarrier::begin`] must do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStep {
    /// This thread owns initialization and must call `finish`.
    Run,
    /// Initialized, or being initialized by this same thread.
    Done,
    /// A previous initialization attempt failed.
    Failed,
}

/// One-shot initialization barrier. The initializing thread may re-enter;
/// other threads block until it finishes.
#[derive(Debug)]
pub struct InitBarrier {
    state: Mutex<InitState>,
    cond: Condvar,
}

impl InitBarrier {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(InitState::Uninitialized),
            cond: Condvar::new(),
        }
    }

    pub fn begin(&self, thread: u64) -> InitStep {
        let mut state = self.state.lock();
        loop {
            match *state {
                InitState::Initialized => return InitStep::Done,
                InitState::Failed => return InitStep::Failed,
                InitState::InProgress(owner) if owner == thread => return InitStep::Done,
                InitState::InProgress(_) => self.cond.wait(&mut state),
                InitState::Uninitialized => {
                    *state = InitState::InProgress(thread);
                    return InitStep::Run;
                }
            }
        }
    }

    pub fn finish(&self, success: bool) {
        let mut state = self.state.lock();
        *state = if success {
            InitState::Initialized
        } else {
            InitState::Failed
        };
        self.cond.notify_all();
    }

    pub fn is_initialized(&self) -> bool {
        *self.state.lock() == InitState::Initialized
    }
}

impl Default for InitBarrier {
    fn default() -> Self {
        Self::new()
    }
}

// ========================================
// Runtime classes and methods
// ========================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionHandler {
    pub start: usize,
    pub end: usize,
    pub handler: usize,
    pub catch_type: Option<String>,
}

impl ExceptionHandler {
    pub fn covers(&self, pc: usize) -> bool {
        self.start <= pc && pc < self.end
    }
}

impl From<HandlerDef> for ExceptionHandler {
    fn from(def: HandlerDef) -> Self {
        Self {
            start: def.start,
            end: def.end,
            handler: def.handler,
            catch_type: def.catch_type,
        }
    }
}

pub struct Method {
    pub class: ClassId,
    pub class_name: String,
    /// Position in the declaring class's method table.
    pub slot: usize,
    pub name: String,
    pub descriptor: String,
    pub signature: MethodDescriptor,
    pub flags: AccessFlags,
    pub max_stack: usize,
    pub max_locals: usize,
    pub code: Vec<Instruction>,
    pub handlers: Vec<ExceptionHandler>,
    pub lines: LineTable,
    /// Receiver-class caches, one per virtual or interface call site.
    site_caches: HashMap<usize, Mutex<InlineCache>>,
}

impl Method {
    pub fn new(
        class: ClassId,
        class_name: &str,
        slot: usize,
        def: MethodDef,
    ) -> Result<Self, DescriptorError> {
        let signature = MethodDescriptor::parse(&def.descriptor)?;
        let site_caches = def
            .code
            .iter()
            .enumerate()
            .filter(|(_, insn)| {
                matches!(
                    insn,
                    Instruction::Invokevirtual(_) | Instruction::Invokeinterface(_)
                )
            })
            .map(|(pc, _)| (pc, Mutex::new(InlineCache::new())))
            .collect();
        Ok(Self {
            class,
            class_name: class_name.to_string(),
            slot,
            name: def.name,
            descriptor: def.descriptor,
            signature,
            flags: def.flags,
            max_stack: def.max_stack as usize,
            max_locals: def.max_locals as usize,
            code: def.code,
            handlers: def.handlers.into_iter().map(ExceptionHandler::from).collect(),
            lines: def.lines.into_iter().collect(),
            site_caches,
        })
    }

    /// `pkg/Class.name(desc)ret`
    pub fn qualified_name(&self) -> String {
        format!("{}.{}{}", self.class_name, self.name, self.descriptor)
    }

    pub fn is_static(&self) -> bool {
        self.flags.contains(AccessFlags::STATIC)
    }

    pub fn is_private(&self) -> bool {
        self.flags.contains(AccessFlags::PRIVATE)
    }

    pub fn is_abstract(&self) -> bool {
        self.flags.contains(AccessFlags::ABSTRACT)
    }

    pub fn is_native(&self) -> bool {
        self.flags.contains(AccessFlags::NATIVE)
    }

    pub fn is_synchronized(&self) -> bool {
        self.flags.contains(AccessFlags::SYNCHRONIZED)
    }

    pub fn is_initializer(&self) -> bool {
        self.name == "<init>"
    }

    /// Number of argument values, receiver included.
    pub fn arg_count(&self) -> usize {
        self.signature.params.len() + usize::from(!self.is_static())
    }

    pub fn matches(&self, name: &str, descriptor: &str) -> bool {
        self.name == name && self.descriptor == descriptor
    }

    pub fn site_cache(&self, pc: usize) -> Option<&Mutex<InlineCache>> {
        self.site_caches.get(&pc)
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Method({})", self.qualified_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    pub name: String,
    pub descriptor: String,
    pub kind: FieldKind,
    pub flags: AccessFlags,
    /// Index into the instance layout or into the class statics.
    pub offset: usize,
}

impl FieldInfo {
    pub fn is_static(&self) -> bool {
        self.flags.contains(AccessFlags::STATIC)
    }
}

/// Element type of an array class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayComponent {
    pub ty: FieldType,
    /// Class of a reference component.
    pub class: Option<ClassId>,
}

#[derive(Debug)]
pub struct Class {
    pub id: ClassId,
    pub name: String,
    pub flags: AccessFlags,
    pub super_class: Option<ClassId>,
    pub interfaces: Vec<ClassId>,
    pub source_file: Option<String>,
    /// Declared methods, indexed by slot.
    pub methods: Vec<Arc<Method>>,
    /// Declared fields, static and instance.
    pub fields: Vec<FieldInfo>,
    /// Instance layout, superclass fields first.
    pub layout: Vec<FieldKind>,
    pub statics: Mutex<Vec<Value>>,
    pub constants: ConstantPool,
    pub bootstrap_methods: Vec<BootstrapDef>,
    pub component: Option<ArrayComponent>,
    pub init: InitBarrier,
    /// `java/lang/Class` instance, created on first use.
    pub mirror: OnceLock<ObjectRef>,
}

impl Class {
    pub fn is_interface(&self) -> bool {
        self.flags.contains(AccessFlags::INTERFACE)
    }

    pub fn is_abstract(&self) -> bool {
        self.flags.contains(AccessFlags::ABSTRACT)
    }

    pub fn is_array(&self) -> bool {
        self.component.is_some()
    }

    pub fn declared_method(&self, name: &str, descriptor: &str) -> Option<&Arc<Method>> {
        self.methods.iter().find(|m| m.matches(name, descriptor))
    }

    pub fn declared_field(&self, name: &str, descriptor: &str) -> Option<&FieldInfo> {
        self.fields
            .iter()
            .find(|f| f.name == name && f.descriptor == descriptor)
    }

    /// Instance field by name, for engine-internal access to bootstrap
    /// classes.
    pub fn instance_field(&self, name: &str) -> Option<&FieldInfo> {
        self.fields.iter().find(|f| f.name == name && !f.is_static())
    }

    pub fn clinit(&self) -> Option<&Arc<Method>> {
        self.declared_method("<clinit>", "()V")
    }

    /// Name with dots, as `Class.getName` reports it.
    pub fn java_name(&self) -> String {
        self.name.replace('/', ".")
    }
}
