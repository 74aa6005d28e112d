//! Error types shared across the crate.
//!
//! Guest-visible exceptions never appear here: they travel as
//! [`ExceptionSignal`](crate::vm::ExceptionSignal) values through handler
//! search. `VmError` is the engine-fatal path: malformed method bodies,
//! broken resolver invariants and host-side failures.

use crate::vm::descriptor::DescriptorError;

#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("operand stack underflow in {method}")]
    StackUnderflow { method: String },
    #[error("operand stack overflow in {method}: max_stack is {max}")]
    StackOverflow { method: String, max: usize },
    #[error("category-1 operation on a wide value in {method}")]
    SplitWideValue { method: String },
    #[error("type mismatch in {method}: expected {expected}, found {found}")]
    TypeMismatch {
        method: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("local {index} out of range in {method} (max_locals {max})")]
    LocalOutOfRange {
        method: String,
        index: usize,
        max: usize,
    },
    #[error("local {index} read before it was written in {method}")]
    InvalidLocal { method: String, index: usize },
    #[error("constant pool entry {index} of {class} is not a {expected}")]
    BadConstant {
        class: String,
        index: u16,
        expected: &'static str,
    },
    #[error("jump target {target} out of range in {method}")]
    InvalidJump { method: String, target: usize },
    #[error("execution fell off the end of {method}")]
    FellOffEnd { method: String },
    #[error("dangling object reference {0}")]
    DanglingReference(u32),
    #[error("object {0} is not an array")]
    NotAnArray(u32),
    #[error("object {0} is not a class instance")]
    NotAnInstance(u32),
    #[error("field offset {offset} out of range for object {object}")]
    FieldOffset { object: u32, offset: usize },
    #[error("element {index} out of range for array {object}")]
    ElementIndex { object: u32, index: usize },
    #[error("unknown class id {0}")]
    UnknownClass(u32),
    #[error("bootstrap class {class} failed to load: {message}")]
    BootstrapClass { class: String, message: String },
    #[error("heap exhausted while allocating {0}")]
    OutOfMemory(String),
    #[error("{method} takes {expected} arguments, {found} given")]
    ArgumentCount {
        method: String,
        expected: usize,
        found: usize,
    },
    #[error("{value} is not a valid {ty} argument")]
    HostArgument { ty: String, value: String },
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    #[error("thread {0} panicked")]
    ThreadPanicked(u64),
    #[error("thread {0} was already joined")]
    AlreadyJoined(u64),
    #[error("no frame to execute")]
    NoFrame,
    #[error("output error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while loading a program image.
#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse image: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("failed to parse image: {0}")]
    Json(#[from] serde_json::Error),
    #[error("class {class}: {message}")]
    Class { class: String, message: String },
    #[error("class {class}, method {method}: bad bytecode: {source}")]
    Bytecode {
        class: String,
        method: String,
        source: crate::vm::bytecode::BytecodeError,
    },
    #[error("duplicate class {0}")]
    Duplicate(String),
    #[error("invalid entry point '{0}', expected Class.method or Class.method:descriptor")]
    Entry(String),
}

/// Errors raised while reading runtime configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}
