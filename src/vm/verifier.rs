//! Structural verifier for method bodies.
//!
//! Checked before a class is linked:
//! - Control flow: branch and handler targets are instruction indices,
//!   execution cannot fall off the end of the code
//! - Stack height consistency: each basic block has a unique entry height
//!   (in slots), never negative, never above `max_stack`
//! - Locals: every access stays below `max_locals`
//! - Constants: instructions reference constant-pool entries of the right kind
//!
//! Type validation beyond slot widths is left to the interpreter, which
//! treats mismatches as engine faults.

use std::collections::{HashMap, HashSet, VecDeque};

use super::class::{AccessFlags, ClassDef, ConstantDef, MethodDef};
use super::descriptor::{FieldType, MethodDescriptor};
use super::ops::Instruction;

/// Verification error types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    #[error("invalid jump target at pc={pc}: target={target} is out of bounds")]
    InvalidJumpTarget { pc: usize, target: usize },
    #[error("stack height mismatch at pc={pc}: expected {expected}, got {actual}")]
    StackHeightMismatch {
        pc: usize,
        expected: usize,
        actual: usize,
    },
    #[error("stack underflow at pc={pc}: requires {required} slots, but only {actual} on stack")]
    StackUnderflow {
        pc: usize,
        required: usize,
        actual: usize,
    },
    #[error("stack overflow at pc={pc}: height {height} exceeds max_stack {max}")]
    StackOverflow { pc: usize, height: usize, max: usize },
    #[error("local {index} out of range at pc={pc} (max_locals {max})")]
    LocalOutOfRange { pc: usize, index: usize, max: usize },
    #[error("constant #{index} at pc={pc} is not a {expected}")]
    BadConstant {
        pc: usize,
        index: u16,
        expected: &'static str,
    },
    #[error("exception handler [{start}, {end}) -> {handler} is out of range")]
    InvalidHandler {
        start: usize,
        end: usize,
        handler: usize,
    },
    #[error("bad descriptor '{0}'")]
    BadDescriptor(String),
    #[error("empty code")]
    EmptyCode,
    #[error("execution can fall off the end of the code")]
    FallsOffEnd,
    #[error("{method}: {source}")]
    Method {
        method: String,
        source: Box<VerifyError>,
    },
}

/// A basic block in the control flow graph
#[derive(Debug, Clone)]
pub struct BasicBlock {
    /// Start PC (inclusive)
    pub start: usize,
    /// End PC (exclusive)
    pub end: usize,
    /// Successor block indices
    pub successors: Vec<usize>,
}

/// Control flow graph
#[derive(Debug)]
#[allow(clippy::upper_case_acronyms)]
pub struct CFG {
    /// Basic blocks
    pub blocks: Vec<BasicBlock>,
    /// Map from PC to block index
    pub pc_to_block: HashMap<usize, usize>,
}

/// Bytecode verifier
#[derive(Debug, Default)]
pub struct Verifier;

impl Verifier {
    pub fn new() -> Self {
        Self
    }

    /// Verify every method body of a class.
    pub fn verify_class(&self, class: &ClassDef) -> Result<(), VerifyError> {
        for method in &class.methods {
            self.verify_method(&class.constants, method)
                .map_err(|e| VerifyError::Method {
                    method: format!("{}.{}{}", class.name, method.name, method.descriptor),
                    source: Box::new(e),
                })?;
        }
        Ok(())
    }

    /// Verify one method against its class's constant pool.
    pub fn verify_method(
        &self,
        constants: &[ConstantDef],
        method: &MethodDef,
    ) -> Result<(), VerifyError> {
        let signature = MethodDescriptor::parse(&method.descriptor)
            .map_err(|_| VerifyError::BadDescriptor(method.descriptor.clone()))?;
        if method.flags.contains(AccessFlags::NATIVE) || method.flags.contains(AccessFlags::ABSTRACT) {
            return Ok(());
        }
        if method.code.is_empty() {
            return Err(VerifyError::EmptyCode);
        }

        let receiver = usize::from(!method.flags.contains(AccessFlags::STATIC));
        let arg_slots = signature.arg_slots() + receiver;
        if arg_slots > method.max_locals as usize {
            return Err(VerifyError::LocalOutOfRange {
                pc: 0,
                index: arg_slots - 1,
                max: method.max_locals as usize,
            });
        }

        self.verify_locals(method)?;
        let cfg = self.build_cfg(method)?;
        self.verify_stack_heights(constants, method, &cfg)
    }

    fn verify_locals(&self, method: &MethodDef) -> Result<(), VerifyError> {
        let max = method.max_locals as usize;
        for (pc, insn) in method.code.iter().enumerate() {
            if let Some((index, width)) = insn.local_access()
                && index + width > max
            {
                return Err(VerifyError::LocalOutOfRange { pc, index, max });
            }
        }
        Ok(())
    }

    /// Build control flow graph from method code
    pub fn build_cfg(&self, method: &MethodDef) -> Result<CFG, VerifyError> {
        let code = &method.code;
        let len = code.len();

        // Find all leader PCs (start of basic blocks)
        let mut leaders: HashSet<usize> = HashSet::new();
        leaders.insert(0);

        for (pc, insn) in code.iter().enumerate() {
            let targets = insn.branch_targets();
            for target in &targets {
                if *target >= len {
                    return Err(VerifyError::InvalidJumpTarget {
                        pc,
                        target: *target,
                    });
                }
                leaders.insert(*target);
            }
            if (!targets.is_empty() || insn.is_terminator()) && pc + 1 < len {
                leaders.insert(pc + 1);
            }
        }
        for h in &method.handlers {
            if h.start >= h.end || h.end > len || h.handler >= len {
                return Err(VerifyError::InvalidHandler {
                    start: h.start,
                    end: h.end,
                    handler: h.handler,
                });
            }
            leaders.insert(h.handler);
        }

        let mut sorted_leaders: Vec<usize> = leaders.into_iter().collect();
        sorted_leaders.sort();

        let mut blocks: Vec<BasicBlock> = Vec::new();
        let mut pc_to_block: HashMap<usize, usize> = HashMap::new();

        for (i, &start) in sorted_leaders.iter().enumerate() {
            let end = sorted_leaders.get(i + 1).copied().unwrap_or(len);
            let block_idx = blocks.len();
            for pc in start..end {
                pc_to_block.insert(pc, block_idx);
            }
            blocks.push(BasicBlock {
                start,
                end,
                successors: Vec::new(),
            });
        }

        for block in &mut blocks {
            let last = &code[block.end - 1];
            let mut successors: Vec<usize> = last
                .branch_targets()
                .iter()
                .filter_map(|t| pc_to_block.get(t).copied())
                .collect();
            if !last.is_terminator() {
                if block.end >= len {
                    return Err(VerifyError::FallsOffEnd);
                }
                successors.push(pc_to_block[&block.end]);
            }
            successors.dedup();
            block.successors = successors;
        }

        Ok(CFG {
            blocks,
            pc_to_block,
        })
    }

    /// Verify stack heights using abstract interpretation
    pub fn verify_stack_heights(
        &self,
        constants: &[ConstantDef],
        method: &MethodDef,
        cfg: &CFG,
    ) -> Result<(), VerifyError> {
        let code = &method.code;
        let max = method.max_stack as usize;

        // Stack height at entry of each block (None = not yet visited)
        let mut block_heights: Vec<Option<usize>> = vec![None; cfg.blocks.len()];
        let mut worklist: VecDeque<usize> = VecDeque::new();

        block_heights[0] = Some(0);
        worklist.push_back(0);
        // Handlers start with the caught exception on an empty stack.
        for h in &method.handlers {
            if max == 0 {
                return Err(VerifyError::StackOverflow {
                    pc: h.handler,
                    height: 1,
                    max,
                });
            }
            let idx = cfg.pc_to_block[&h.handler];
            if block_heights[idx].is_none() {
                block_heights[idx] = Some(1);
                worklist.push_back(idx);
            }
        }

        while let Some(block_idx) = worklist.pop_front() {
            let block = &cfg.blocks[block_idx];
            let Some(mut height) = block_heights[block_idx] else {
                continue;
            };

            for (pc, insn) in code.iter().enumerate().take(block.end).skip(block.start) {
                let (pops, pushes) = self.stack_effect(pc, insn, constants)?;
                if height < pops {
                    return Err(VerifyError::StackUnderflow {
                        pc,
                        required: pops,
                        actual: height,
                    });
                }
                height = height - pops + pushes;
                if height > max {
                    return Err(VerifyError::StackOverflow { pc, height, max });
                }
            }

            let last_pc = block.end - 1;
            let jsr = matches!(code[last_pc], Instruction::Jsr(_));
            for &succ_idx in &block.successors {
                let succ = &cfg.blocks[succ_idx];
                // After a subroutine returns, its return address is gone.
                let entry = if jsr && succ.start == block.end {
                    height - 1
                } else {
                    height
                };
                match block_heights[succ_idx] {
                    None => {
                        block_heights[succ_idx] = Some(entry);
                        worklist.push_back(succ_idx);
                    }
                    Some(existing) if existing != entry => {
                        return Err(VerifyError::StackHeightMismatch {
                            pc: succ.start,
                            expected: existing,
                            actual: entry,
                        });
                    }
                    Some(_) => {}
                }
            }
        }

        Ok(())
    }

    /// Stack effect of an instruction in slots: (pops, pushes)
    fn stack_effect(
        &self,
        pc: usize,
        insn: &Instruction,
        constants: &[ConstantDef],
    ) -> Result<(usize, usize), VerifyError> {
        use Instruction::*;

        let constant = |index: u16| -> Option<&ConstantDef> {
            (index as usize)
                .checked_sub(1)
                .and_then(|i| constants.get(i))
        };
        let bad = |index: u16, expected: &'static str| VerifyError::BadConstant {
            pc,
            index,
            expected,
        };
        let field_slots = |index: u16| -> Result<usize, VerifyError> {
            match constant(index) {
                Some(ConstantDef::Fieldref(_, _, d)) => FieldType::parse(d)
                    .map(|t| t.category().slots())
                    .map_err(|_| VerifyError::BadDescriptor(d.clone())),
                _ => Err(bad(index, "field reference")),
            }
        };
        let method_slots = |descriptor: &str| -> Result<(usize, usize), VerifyError> {
            let sig = MethodDescriptor::parse(descriptor)
                .map_err(|_| VerifyError::BadDescriptor(descriptor.to_string()))?;
            Ok((
                sig.arg_slots(),
                sig.ret.map(|t| t.category().slots()).unwrap_or(0),
            ))
        };
        let invoke = |index: u16, interface_only: bool, receiver: usize| {
            let descriptor = match constant(index) {
                Some(ConstantDef::InterfaceMethodref(_, _, d)) => d,
                Some(ConstantDef::Methodref(_, _, d)) if !interface_only => d,
                _ => return Err(bad(index, "method reference")),
            };
            let (args, ret) = method_slots(descriptor)?;
            Ok((args + receiver, ret))
        };
        let class = |index: u16| match constant(index) {
            Some(ConstantDef::Class(_)) => Ok(()),
            _ => Err(bad(index, "class")),
        };

        let effect = match insn {
            Nop | Iinc(..) | Goto(_) | Ret(_) | Return => (0, 0),
            AconstNull | Iconst(_) | Fconst(_) => (0, 1),
            Lconst(_) | Dconst(_) => (0, 2),
            Ldc(i) => match constant(*i) {
                Some(
                    ConstantDef::Integer(_)
                    | ConstantDef::Float(_)
                    | ConstantDef::String(_)
                    | ConstantDef::Class(_),
                ) => (0, 1),
                _ => return Err(bad(*i, "loadable constant")),
            },
            Ldc2W(i) => match constant(*i) {
                Some(ConstantDef::Long(_) | ConstantDef::Double(_)) => (0, 2),
                _ => return Err(bad(*i, "long or double")),
            },

            Iload(_) | Fload(_) | Aload(_) => (0, 1),
            Lload(_) | Dload(_) => (0, 2),
            Istore(_) | Fstore(_) | Astore(_) => (1, 0),
            Lstore(_) | Dstore(_) => (2, 0),

            Iaload | Faload | Aaload | Baload | Caload | Saload => (2, 1),
            Laload | Daload => (2, 2),
            Iastore | Fastore | Aastore | Bastore | Castore | Sastore => (3, 0),
            Lastore | Dastore => (4, 0),
            Newarray(_) | Arraylength => (1, 1),
            Anewarray(i) => {
                class(*i)?;
                (1, 1)
            }
            Multianewarray(i, dims) => {
                class(*i)?;
                (*dims as usize, 1)
            }

            Pop => (1, 0),
            Pop2 => (2, 0),
            Dup => (1, 2),
            DupX1 => (2, 3),
            DupX2 => (3, 4),
            Dup2 => (2, 4),
            Dup2X1 => (3, 5),
            Dup2X2 => (4, 6),
            Swap => (2, 2),

            Iadd | Isub | Imul | Idiv | Irem | Iand | Ior | Ixor | Ishl | Ishr | Iushr => (2, 1),
            Fadd | Fsub | Fmul | Fdiv | Frem => (2, 1),
            Ladd | Lsub | Lmul | Ldiv | Lrem | Land | Lor | Lxor => (4, 2),
            Dadd | Dsub | Dmul | Ddiv | Drem => (4, 2),
            Lshl | Lshr | Lushr => (3, 2),
            Ineg | Fneg => (1, 1),
            Lneg | Dneg => (2, 2),

            I2f | F2i | I2b | I2c | I2s => (1, 1),
            I2l | I2d | F2l | F2d => (1, 2),
            L2i | L2f | D2i | D2f => (2, 1),
            L2d | D2l => (2, 2),

            Lcmp | Dcmpl | Dcmpg => (4, 1),
            Fcmpl | Fcmpg => (2, 1),

            If(..) | Ifnull(_) | Ifnonnull(_) => (1, 0),
            IfIcmp(..) | IfAcmpeq(_) | IfAcmpne(_) => (2, 0),
            Jsr(_) => (0, 1),
            Tableswitch { .. } | Lookupswitch { .. } => (1, 0),
            Ireturn | Freturn | Areturn => (1, 0),
            Lreturn | Dreturn => (2, 0),

            Getstatic(i) => (0, field_slots(*i)?),
            Putstatic(i) => (field_slots(*i)?, 0),
            Getfield(i) => (1, field_slots(*i)?),
            Putfield(i) => (1 + field_slots(*i)?, 0),
            Invokevirtual(i) | Invokespecial(i) => invoke(*i, false, 1)?,
            Invokestatic(i) => invoke(*i, false, 0)?,
            Invokeinterface(i) => invoke(*i, true, 1)?,
            Invokedynamic(i) => match constant(*i) {
                Some(ConstantDef::InvokeDynamic(_, _, d)) => method_slots(d)?,
                _ => return Err(bad(*i, "invokedynamic")),
            },

            New(i) => {
                class(*i)?;
                (0, 1)
            }
            Checkcast(i) | Instanceof(i) => {
                class(*i)?;
                (1, 1)
            }
            Athrow | Monitorenter | Monitorexit => (1, 0),
        };
        Ok(effect)
    }
}
