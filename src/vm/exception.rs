//! Exception signals and control transfer.
//!
//! Two failure channels run through the interpreter:
//! - a guest exception ([`ExceptionSignal`]) travels through handler search
//!   and may be caught by guest code;
//! - an engine-fatal [`VmError`] bypasses every handler and ends the
//!   invocation chain.
//!
//! [`Trap`] carries either one out of a handler, [`Control`] is what a
//! successfully dispatched instruction asks the loop to do next.

use std::fmt;

use crate::error::VmError;

use super::class::Method;
use super::debug::Backtrace;
use super::heap::ObjectRef;
use super::value::Value;

/// A thrown guest object plus the frames it has unwound through.
#[derive(Debug, Clone, PartialEq)]
pub struct ExceptionSignal {
    pub exception: ObjectRef,
    pub backtrace: Backtrace,
}

impl ExceptionSignal {
    pub fn new(exception: ObjectRef) -> Self {
        Self {
            exception,
            backtrace: Backtrace::new(),
        }
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }
}

#[derive(Debug)]
pub enum Trap {
    Throw(ExceptionSignal),
    Fatal(VmError),
}

impl From<VmError> for Trap {
    fn from(e: VmError) -> Self {
        Trap::Fatal(e)
    }
}

impl From<ExceptionSignal> for Trap {
    fn from(signal: ExceptionSignal) -> Self {
        Trap::Throw(signal)
    }
}

pub type Exec<T> = Result<T, Trap>;

/// Result of dispatching one instruction.
#[derive(Debug)]
pub enum Control {
    /// Fall through to the next instruction.
    Continue,
    /// Continue at the given instruction index.
    Jump(usize),
    /// Leave the current frame normally.
    Return(Option<Value>),
    /// Leave through handler search.
    Abort(ExceptionSignal),
}

/// A guest exception not instantiated yet. Resolution and linking produce
/// these; the executing thread turns them into objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestError {
    pub class: &'static str,
    pub message: Option<String>,
}

impl GuestError {
    pub fn new(class: &'static str, message: impl Into<String>) -> Self {
        Self {
            class,
            message: Some(message.into()),
        }
    }

    pub fn bare(class: &'static str) -> Self {
        Self {
            class,
            message: None,
        }
    }
}

impl fmt::Display for GuestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.class.replace('/', "."))?;
        if let Some(message) = &self.message {
            write!(f, ": {}", message)?;
        }
        Ok(())
    }
}

/// How a top-level invocation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Returned(Option<Value>),
    Threw {
        exception: ObjectRef,
        backtrace: Backtrace,
    },
}

impl Outcome {
    pub fn value(&self) -> Option<Value> {
        match self {
            Outcome::Returned(v) => *v,
            Outcome::Threw { .. } => None,
        }
    }

    pub fn is_throw(&self) -> bool {
        matches!(self, Outcome::Threw { .. })
    }
}

/// First handler in table order that covers `pc` and whose catch type
/// accepts the exception. `catches` decides assignability by class name;
/// its first error ends the search.
pub fn find_handler<E>(
    method: &Method,
    pc: usize,
    mut catches: impl FnMut(&str) -> Result<bool, E>,
) -> Result<Option<usize>, E> {
    for h in method.handlers.iter().filter(|h| h.covers(pc)) {
        let matched = match &h.catch_type {
            None => true,
            Some(name) => catches(name)?,
        };
        if matched {
            return Ok(Some(h.handler));
        }
    }
    Ok(None)
}
