//! The execution engine: class model, linking, verification and the
//! interpreter.

pub mod bootstrap;
pub mod bytecode;
pub mod class;
pub mod debug;
pub mod descriptor;
pub mod exception;
pub mod frame;
pub mod heap;
pub mod ic;
pub mod interpreter;
pub mod invoke;
pub mod monitor;
pub mod native;
pub mod numeric;
pub mod ops;
pub mod registry;
pub mod resolver;
pub mod threads;
pub mod value;
pub mod verifier;

pub use class::{AccessFlags, Class, ClassDef, ClassId, ConstantDef, Flag, Method, MethodDef};
pub use debug::{Backtrace, StackTraceElement};
pub use exception::{ExceptionSignal, Exec, GuestError, Outcome, Trap};
pub use heap::{Heap, MemoryManager, ObjectRef};
pub use interpreter::{SharedOutput, Thread, Vm, VmBuilder};
pub use invoke::{BootstrapLinker, CallSite, ConstantCallSiteLinker};
pub use native::{NativeFn, NativeRegistry};
pub use ops::{Cond, Instruction};
pub use registry::{ClassLoader, ClassRegistry};
pub use value::Value;
pub use verifier::{VerifyError, Verifier};
