//! Activation frames: locals, operand stack and instruction cursor.
//!
//! These are plain data structures. Method bodies are assumed to be
//! resolved and well typed, so any violation detected here is reported
//! as an engine-fatal [`VmError`] rather than a guest exception.

use std::sync::Arc;

use crate::error::VmError;

use super::class::Method;
use super::debug::StackTraceElement;
use super::heap::ObjectRef;
use super::value::Value;

/// A slot-level fault, turned into a [`VmError`] once the owning method
/// is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotFault {
    Underflow,
    Overflow(usize),
    SplitWide,
    OutOfRange { index: usize, max: usize },
    Invalid(usize),
    Type {
        expected: &'static str,
        found: &'static str,
    },
}

impl SlotFault {
    pub fn in_method(self, method: &Method) -> VmError {
        let method = method.qualified_name();
        match self {
            SlotFault::Underflow => VmError::StackUnderflow { method },
            SlotFault::Overflow(max) => VmError::StackOverflow { method, max },
            SlotFault::SplitWide => VmError::SplitWideValue { method },
            SlotFault::OutOfRange { index, max } => VmError::LocalOutOfRange { method, index, max },
            SlotFault::Invalid(index) => VmError::InvalidLocal { method, index },
            SlotFault::Type { expected, found } => VmError::TypeMismatch {
                method,
                expected,
                found,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Slot {
    Empty,
    Value(Value),
    /// Upper half of the wide value stored in the slot below.
    Upper,
}

/// Fixed-size local variable array.
#[derive(Debug, Clone)]
pub struct Locals {
    slots: Vec<Slot>,
}

impl Locals {
    pub fn new(max_locals: usize) -> Self {
        Self {
            slots: vec![Slot::Empty; max_locals],
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, index: usize) -> Result<Value, SlotFault> {
        match self.slots.get(index) {
            Some(Slot::Value(v)) => Ok(*v),
            Some(_) => Err(SlotFault::Invalid(index)),
            None => Err(SlotFault::OutOfRange {
                index,
                max: self.slots.len(),
            }),
        }
    }

    pub fn set(&mut self, index: usize, value: Value) -> Result<(), SlotFault> {
        let width = value.category().slots();
        if index + width > self.slots.len() {
            return Err(SlotFault::OutOfRange {
                index,
                max: self.slots.len(),
            });
        }
        for i in index..index + width {
            self.invalidate(i);
        }
        self.slots[index] = Slot::Value(value);
        if width == 2 {
            self.slots[index + 1] = Slot::Upper;
        }
        Ok(())
    }

    /// Break any wide pair that `index` is part of.
    fn invalidate(&mut self, index: usize) {
        match self.slots[index] {
            Slot::Upper if index > 0 => self.slots[index - 1] = Slot::Empty,
            Slot::Value(v) if v.is_wide() && index + 1 < self.slots.len() => {
                self.slots[index + 1] = Slot::Empty
            }
            _ => {}
        }
        self.slots[index] = Slot::Empty;
    }

    /// Build locals from an argument list, placing wide values in two slots.
    pub fn from_args(max_locals: usize, args: &[Value]) -> Result<Self, SlotFault> {
        let mut locals = Self::new(max_locals);
        let mut index = 0;
        for arg in args {
            locals.set(index, *arg)?;
            index += arg.category().slots();
        }
        Ok(locals)
    }

    /// Values in slot order, skipping upper halves and unset slots.
    pub fn values(&self) -> impl Iterator<Item = (usize, Value)> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, s)| match s {
            Slot::Value(v) => Some((i, *v)),
            _ => None,
        })
    }
}

/// Bounded operand stack. Depth is counted in slots, so a wide value
/// consumes two units of `max_stack`.
#[derive(Debug, Clone)]
pub struct OperandStack {
    values: Vec<Value>,
    depth: usize,
    max: usize,
}

impl OperandStack {
    pub fn new(max_stack: usize) -> Self {
        Self {
            values: Vec::with_capacity(max_stack),
            depth: 0,
            max: max_stack,
        }
    }

    /// Current depth in slots.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn clear(&mut self) {
        self.values.clear();
        self.depth = 0;
    }

    pub fn push(&mut self, value: Value) -> Result<(), SlotFault> {
        let width = value.category().slots();
        if self.depth + width > self.max {
            return Err(SlotFault::Overflow(self.max));
        }
        self.depth += width;
        self.values.push(value);
        Ok(())
    }

    /// Pop a value of either category.
    pub fn pop(&mut self) -> Result<Value, SlotFault> {
        let value = self.values.pop().ok_or(SlotFault::Underflow)?;
        self.depth -= value.category().slots();
        Ok(value)
    }

    pub fn peek(&self) -> Result<Value, SlotFault> {
        self.values.last().copied().ok_or(SlotFault::Underflow)
    }

    /// Pop values covering exactly `slots` slots, returned bottom first.
    /// A wide value straddling the boundary is a category violation.
    fn pop_group(&mut self, slots: usize) -> Result<Vec<Value>, SlotFault> {
        let mut group = Vec::with_capacity(slots);
        let mut taken = 0;
        while taken < slots {
            let top = self.values.last().ok_or(SlotFault::Underflow)?;
            let width = top.category().slots();
            if taken + width > slots {
                return Err(SlotFault::SplitWide);
            }
            taken += width;
            group.push(self.pop()?);
        }
        group.reverse();
        Ok(group)
    }

    fn push_group(&mut self, group: &[Value]) -> Result<(), SlotFault> {
        for v in group {
            self.push(*v)?;
        }
        Ok(())
    }

    /// `pop`: discard one category-1 value.
    pub fn pop1(&mut self) -> Result<(), SlotFault> {
        self.pop_group(1).map(|_| ())
    }

    /// `pop2`: discard two category-1 values or one category-2 value.
    pub fn pop2(&mut self) -> Result<(), SlotFault> {
        self.pop_group(2).map(|_| ())
    }

    /// `dup`
    pub fn dup(&mut self) -> Result<(), SlotFault> {
        let a = self.pop_group(1)?;
        self.push_group(&a)?;
        self.push_group(&a)
    }

    /// `dup_x1`
    pub fn dup_x1(&mut self) -> Result<(), SlotFault> {
        let a = self.pop_group(1)?;
        let b = self.pop_group(1)?;
        self.push_group(&a)?;
        self.push_group(&b)?;
        self.push_group(&a)
    }

    /// `dup_x2`: inserts the top category-1 value below the next two slots.
    pub fn dup_x2(&mut self) -> Result<(), SlotFault> {
        let a = self.pop_group(1)?;
        let b = self.pop_group(2)?;
        self.push_group(&a)?;
        self.push_group(&b)?;
        self.push_group(&a)
    }

    /// `dup2`: duplicates the top two slots, one wide value being one unit.
    pub fn dup2(&mut self) -> Result<(), SlotFault> {
        let a = self.pop_group(2)?;
        self.push_group(&a)?;
        self.push_group(&a)
    }

    /// `dup2_x1`
    pub fn dup2_x1(&mut self) -> Result<(), SlotFault> {
        let a = self.pop_group(2)?;
        let b = self.pop_group(1)?;
        self.push_group(&a)?;
        self.push_group(&b)?;
        self.push_group(&a)
    }

    /// `dup2_x2`
    pub fn dup2_x2(&mut self) -> Result<(), SlotFault> {
        let a = self.pop_group(2)?;
        let b = self.pop_group(2)?;
        self.push_group(&a)?;
        self.push_group(&b)?;
        self.push_group(&a)
    }

    /// `swap`: both operands must be category 1.
    pub fn swap(&mut self) -> Result<(), SlotFault> {
        let a = self.pop_group(1)?;
        let b = self.pop_group(1)?;
        self.push_group(&a)?;
        self.push_group(&b)
    }
}

/// Where a returning frame delivers its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultSink {
    /// Push onto the calling frame's operand stack.
    Caller,
    /// Hand back to the host (or native code) that started the frame.
    Host,
}

/// Activation record of one method invocation.
#[derive(Debug)]
pub struct Frame {
    pub method: Arc<Method>,
    /// Index of the instruction being executed.
    pub pc: usize,
    pub locals: Locals,
    pub stack: OperandStack,
    pub sink: ResultSink,
    /// Monitor acquired on entry to a synchronized method.
    pub monitor: Option<ObjectRef>,
}

macro_rules! typed_pop {
    ($name:ident, $variant:ident, $ty:ty, $expected:literal) => {
        pub fn $name(&mut self) -> Result<$ty, VmError> {
            match self.pop()? {
                Value::$variant(v) => Ok(v),
                other => Err(self.fault(SlotFault::Type {
                    expected: $expected,
                    found: other.type_name(),
                })),
            }
        }
    };
}

impl Frame {
    pub fn new(method: Arc<Method>, locals: Locals, sink: ResultSink) -> Self {
        let stack = OperandStack::new(method.max_stack);
        Self {
            method,
            pc: 0,
            locals,
            stack,
            sink,
            monitor: None,
        }
    }

    pub fn fault(&self, fault: SlotFault) -> VmError {
        fault.in_method(&self.method)
    }

    pub fn push(&mut self, value: Value) -> Result<(), VmError> {
        self.stack.push(value).map_err(|f| f.in_method(&self.method))
    }

    pub fn pop(&mut self) -> Result<Value, VmError> {
        self.stack.pop().map_err(|f| f.in_method(&self.method))
    }

    typed_pop!(pop_int, Int, i32, "int");
    typed_pop!(pop_long, Long, i64, "long");
    typed_pop!(pop_float, Float, f32, "float");
    typed_pop!(pop_double, Double, f64, "double");
    typed_pop!(pop_ref, Ref, Option<ObjectRef>, "reference");

    pub fn load(&self, index: usize) -> Result<Value, VmError> {
        self.locals.get(index).map_err(|f| f.in_method(&self.method))
    }

    pub fn store(&mut self, index: usize, value: Value) -> Result<(), VmError> {
        self.locals
            .set(index, value)
            .map_err(|f| f.in_method(&self.method))
    }

    /// Snapshot of this frame for a backtrace.
    pub fn trace_element(&self) -> StackTraceElement {
        let method = &self.method;
        StackTraceElement {
            class: method.class_name.clone(),
            method: method.name.clone(),
            descriptor: method.descriptor.clone(),
            pc: self.pc,
            line: method.lines.find_line(self.pc),
            native: method.is_native(),
        }
    }

    /// Pop `count` values, returned in declaration order.
    pub fn pop_args(&mut self, count: usize) -> Result<Vec<Value>, VmError> {
        let mut args = Vec::with_capacity(count);
        for _ in 0..count {
            args.push(self.pop()?);
        }
        args.reverse();
        Ok(args)
    }
}
