//! Decoder for raw `Code` attribute bytes.
//!
//! Input is the instruction stream of one method exactly as it appears in a
//! class file: big-endian operands, `wide` prefixes, 4-byte aligned switch
//! tables and branch offsets relative to the branching opcode. Output is a
//! list of [`Instruction`]s whose branch targets are instruction indices.

use std::collections::HashMap;
use std::io::{Cursor, Read};

use super::descriptor::FieldKind;
use super::ops::{Cond, Instruction};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BytecodeError {
    #[error("unexpected end of code")]
    UnexpectedEof,
    #[error("invalid opcode 0x{opcode:02x} at offset {offset}")]
    InvalidOpcode { opcode: u8, offset: usize },
    #[error("'wide' cannot modify opcode 0x{opcode:02x} at offset {offset}")]
    InvalidWide { opcode: u8, offset: usize },
    #[error("invalid newarray type {atype} at offset {offset}")]
    InvalidArrayType { atype: u8, offset: usize },
    #[error("branch at offset {offset} targets {target}, which is not an instruction boundary")]
    BadTarget { offset: usize, target: i64 },
    #[error("tableswitch at offset {offset} has low {low} > high {high}")]
    BadSwitch { offset: usize, low: i32, high: i32 },
    #[error("lookupswitch at offset {offset} keys are not sorted")]
    UnsortedKeys { offset: usize },
}

/// A decoded method body.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedCode {
    pub instructions: Vec<Instruction>,
    /// Byte offset of each instruction.
    pub offsets: Vec<usize>,
    code_len: usize,
}

impl DecodedCode {
    /// Instruction index of a byte offset. The offset one past the last
    /// instruction maps to `instructions.len()` so exclusive handler ends
    /// translate too.
    pub fn index_of(&self, offset: usize) -> Option<usize> {
        if offset == self.code_len {
            return Some(self.instructions.len());
        }
        self.offsets.binary_search(&offset).ok()
    }
}

/// Decode a raw instruction stream.
pub fn decode(code: &[u8]) -> Result<DecodedCode, BytecodeError> {
    let mut cursor = Cursor::new(code);
    let mut instructions = Vec::new();
    let mut offsets = Vec::new();

    while (cursor.position() as usize) < code.len() {
        let offset = cursor.position() as usize;
        instructions.push(read_instruction(&mut cursor, offset)?);
        offsets.push(offset);
    }

    let index: HashMap<usize, usize> = offsets.iter().enumerate().map(|(i, o)| (*o, i)).collect();
    for (insn, offset) in instructions.iter_mut().zip(&offsets) {
        remap_targets(insn, *offset, &index)?;
    }

    Ok(DecodedCode {
        instructions,
        offsets,
        code_len: code.len(),
    })
}

/// Branch operands are read as absolute byte offsets; rewrite them to
/// instruction indices.
fn remap_targets(
    insn: &mut Instruction,
    offset: usize,
    index: &HashMap<usize, usize>,
) -> Result<(), BytecodeError> {
    let map = |target: &mut usize| -> Result<(), BytecodeError> {
        *target = *index.get(&*target).ok_or(BytecodeError::BadTarget {
            offset,
            target: *target as i64,
        })?;
        Ok(())
    };
    match insn {
        Instruction::If(_, t)
        | Instruction::IfIcmp(_, t)
        | Instruction::IfAcmpeq(t)
        | Instruction::IfAcmpne(t)
        | Instruction::Ifnull(t)
        | Instruction::Ifnonnull(t)
        | Instruction::Goto(t)
        | Instruction::Jsr(t) => map(t),
        Instruction::Tableswitch {
            default, targets, ..
        } => {
            map(default)?;
            targets.iter_mut().try_for_each(map)
        }
        Instruction::Lookupswitch { default, pairs } => {
            map(default)?;
            pairs.iter_mut().try_for_each(|(_, t)| map(t))
        }
        _ => Ok(()),
    }
}

fn branch(offset: usize, relative: i64) -> Result<usize, BytecodeError> {
    let target = offset as i64 + relative;
    if target < 0 {
        return Err(BytecodeError::BadTarget { offset, target });
    }
    Ok(target as usize)
}

const CONDS: [Cond; 6] = [Cond::Eq, Cond::Ne, Cond::Lt, Cond::Ge, Cond::Gt, Cond::Le];

fn read_instruction(r: &mut Cursor<&[u8]>, offset: usize) -> Result<Instruction, BytecodeError> {
    use Instruction::*;

    let opcode = read_u8(r)?;
    let insn = match opcode {
        0x00 => Nop,
        0x01 => AconstNull,
        0x02..=0x08 => Iconst(opcode as i32 - 0x03),
        0x09 | 0x0a => Lconst((opcode - 0x09) as i64),
        0x0b..=0x0d => Fconst((opcode - 0x0b) as f32),
        0x0e | 0x0f => Dconst((opcode - 0x0e) as f64),
        0x10 => Iconst(read_u8(r)? as i8 as i32),
        0x11 => Iconst(read_i16(r)? as i32),
        0x12 => Ldc(read_u8(r)? as u16),
        0x13 => Ldc(read_u16(r)?),
        0x14 => Ldc2W(read_u16(r)?),

        0x15..=0x19 => local_op(opcode, read_u8(r)? as u16),
        0x1a..=0x2d => {
            let n = (opcode - 0x1a) % 4;
            local_op(0x15 + (opcode - 0x1a) / 4, n as u16)
        }
        0x2e => Iaload,
        0x2f => Laload,
        0x30 => Faload,
        0x31 => Daload,
        0x32 => Aaload,
        0x33 => Baload,
        0x34 => Caload,
        0x35 => Saload,
        0x36..=0x3a => local_op(opcode, read_u8(r)? as u16),
        0x3b..=0x4e => {
            let n = (opcode - 0x3b) % 4;
            local_op(0x36 + (opcode - 0x3b) / 4, n as u16)
        }
        0x4f => Iastore,
        0x50 => Lastore,
        0x51 => Fastore,
        0x52 => Dastore,
        0x53 => Aastore,
        0x54 => Bastore,
        0x55 => Castore,
        0x56 => Sastore,

        0x57 => Pop,
        0x58 => Pop2,
        0x59 => Dup,
        0x5a => DupX1,
        0x5b => DupX2,
        0x5c => Dup2,
        0x5d => Dup2X1,
        0x5e => Dup2X2,
        0x5f => Swap,

        0x60 => Iadd,
        0x61 => Ladd,
        0x62 => Fadd,
        0x63 => Dadd,
        0x64 => Isub,
        0x65 => Lsub,
        0x66 => Fsub,
        0x67 => Dsub,
        0x68 => Imul,
        0x69 => Lmul,
        0x6a => Fmul,
        0x6b => Dmul,
        0x6c => Idiv,
        0x6d => Ldiv,
        0x6e => Fdiv,
        0x6f => Ddiv,
        0x70 => Irem,
        0x71 => Lrem,
        0x72 => Frem,
        0x73 => Drem,
        0x74 => Ineg,
        0x75 => Lneg,
        0x76 => Fneg,
        0x77 => Dneg,
        0x78 => Ishl,
        0x79 => Lshl,
        0x7a => Ishr,
        0x7b => Lshr,
        0x7c => Iushr,
        0x7d => Lushr,
        0x7e => Iand,
        0x7f => Land,
        0x80 => Ior,
        0x81 => Lor,
        0x82 => Ixor,
        0x83 => Lxor,
        0x84 => Iinc(read_u8(r)? as u16, read_u8(r)? as i8 as i16),

        0x85 => I2l,
        0x86 => I2f,
        0x87 => I2d,
        0x88 => L2i,
        0x89 => L2f,
        0x8a => L2d,
        0x8b => F2i,
        0x8c => F2l,
        0x8d => F2d,
        0x8e => D2i,
        0x8f => D2l,
        0x90 => D2f,
        0x91 => I2b,
        0x92 => I2c,
        0x93 => I2s,

        0x94 => Lcmp,
        0x95 => Fcmpl,
        0x96 => Fcmpg,
        0x97 => Dcmpl,
        0x98 => Dcmpg,

        0x99..=0x9e => If(
            CONDS[(opcode - 0x99) as usize],
            branch(offset, read_i16(r)? as i64)?,
        ),
        0x9f..=0xa4 => IfIcmp(
            CONDS[(opcode - 0x9f) as usize],
            branch(offset, read_i16(r)? as i64)?,
        ),
        0xa5 => IfAcmpeq(branch(offset, read_i16(r)? as i64)?),
        0xa6 => IfAcmpne(branch(offset, read_i16(r)? as i64)?),
        0xa7 => Goto(branch(offset, read_i16(r)? as i64)?),
        0xa8 => Jsr(branch(offset, read_i16(r)? as i64)?),
        0xa9 => Ret(read_u8(r)? as u16),
        0xaa => {
            skip_padding(r)?;
            let default = branch(offset, read_i32(r)? as i64)?;
            let low = read_i32(r)?;
            let high = read_i32(r)?;
            if low > high {
                return Err(BytecodeError::BadSwitch { offset, low, high });
            }
            let count = (high as i64 - low as i64 + 1) as usize;
            ensure_remaining(r, count, 4)?;
            let mut targets = Vec::with_capacity(count);
            for _ in 0..count {
                targets.push(branch(offset, read_i32(r)? as i64)?);
            }
            Tableswitch {
                default,
                low,
                targets,
            }
        }
        0xab => {
            skip_padding(r)?;
            let default = branch(offset, read_i32(r)? as i64)?;
            let count = read_i32(r)?.max(0) as usize;
            ensure_remaining(r, count, 8)?;
            let mut pairs: Vec<(i32, usize)> = Vec::with_capacity(count);
            for _ in 0..count {
                let key = read_i32(r)?;
                let target = branch(offset, read_i32(r)? as i64)?;
                if pairs.last().is_some_and(|(prev, _)| *prev >= key) {
                    return Err(BytecodeError::UnsortedKeys { offset });
                }
                pairs.push((key, target));
            }
            Lookupswitch { default, pairs }
        }
        0xac => Ireturn,
        0xad => Lreturn,
        0xae => Freturn,
        0xaf => Dreturn,
        0xb0 => Areturn,
        0xb1 => Return,

        0xb2 => Getstatic(read_u16(r)?),
        0xb3 => Putstatic(read_u16(r)?),
        0xb4 => Getfield(read_u16(r)?),
        0xb5 => Putfield(read_u16(r)?),
        0xb6 => Invokevirtual(read_u16(r)?),
        0xb7 => Invokespecial(read_u16(r)?),
        0xb8 => Invokestatic(read_u16(r)?),
        0xb9 => {
            let index = read_u16(r)?;
            // count and a reserved zero byte
            read_u8(r)?;
            read_u8(r)?;
            Invokeinterface(index)
        }
        0xba => {
            let index = read_u16(r)?;
            read_u16(r)?;
            Invokedynamic(index)
        }
        0xbb => New(read_u16(r)?),
        0xbc => {
            let atype = read_u8(r)?;
            Newarray(
                FieldKind::from_array_type(atype)
                    .ok_or(BytecodeError::InvalidArrayType { atype, offset })?,
            )
        }
        0xbd => Anewarray(read_u16(r)?),
        0xbe => Arraylength,
        0xbf => Athrow,
        0xc0 => Checkcast(read_u16(r)?),
        0xc1 => Instanceof(read_u16(r)?),
        0xc2 => Monitorenter,
        0xc3 => Monitorexit,
        0xc4 => read_wide(r, offset)?,
        0xc5 => Multianewarray(read_u16(r)?, read_u8(r)?),
        0xc6 => Ifnull(branch(offset, read_i16(r)? as i64)?),
        0xc7 => Ifnonnull(branch(offset, read_i16(r)? as i64)?),
        0xc8 => Goto(branch(offset, read_i32(r)? as i64)?),
        0xc9 => Jsr(branch(offset, read_i32(r)? as i64)?),
        _ => return Err(BytecodeError::InvalidOpcode { opcode, offset }),
    };
    Ok(insn)
}

/// Load/store with an explicit index, keyed by the long-form opcode.
fn local_op(opcode: u8, index: u16) -> Instruction {
    match opcode {
        0x15 => Instruction::Iload(index),
        0x16 => Instruction::Lload(index),
        0x17 => Instruction::Fload(index),
        0x18 => Instruction::Dload(index),
        0x19 => Instruction::Aload(index),
        0x36 => Instruction::Istore(index),
        0x37 => Instruction::Lstore(index),
        0x38 => Instruction::Fstore(index),
        0x39 => Instruction::Dstore(index),
        _ => Instruction::Astore(index),
    }
}

fn read_wide(r: &mut Cursor<&[u8]>, offset: usize) -> Result<Instruction, BytecodeError> {
    let opcode = read_u8(r)?;
    match opcode {
        0x15..=0x19 | 0x36..=0x3a => Ok(local_op(opcode, read_u16(r)?)),
        0x84 => Ok(Instruction::Iinc(read_u16(r)?, read_i16(r)?)),
        0xa9 => Ok(Instruction::Ret(read_u16(r)?)),
        _ => Err(BytecodeError::InvalidWide { opcode, offset }),
    }
}

/// Switch operands start at the next multiple of four from the code start.
fn skip_padding(r: &mut Cursor<&[u8]>) -> Result<(), BytecodeError> {
    while r.position() % 4 != 0 {
        read_u8(r)?;
    }
    Ok(())
}

/// Fail early when a switch table claims more entries than the code holds.
fn ensure_remaining(r: &Cursor<&[u8]>, count: usize, width: usize) -> Result<(), BytecodeError> {
    let left = (r.get_ref().len() as u64).saturating_sub(r.position());
    match count.checked_mul(width) {
        Some(needed) if needed as u64 <= left => Ok(()),
        _ => Err(BytecodeError::UnexpectedEof),
    }
}

// Helper functions for reading big-endian primitives

fn read_u8<R: Read>(r: &mut R) -> Result<u8, BytecodeError> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)
        .map_err(|_| BytecodeError::UnexpectedEof)?;
    Ok(buf[0])
}

fn read_u16<R: Read>(r: &mut R) -> Result<u16, BytecodeError> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)
        .map_err(|_| BytecodeError::UnexpectedEof)?;
    Ok(u16::from_be_bytes(buf))
}

fn read_i16<R: Read>(r: &mut R) -> Result<i16, BytecodeError> {
    read_u16(r).map(|v| v as i16)
}

fn read_i32<R: Read>(r: &mut R) -> Result<i32, BytecodeError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)
        .map_err(|_| BytecodeError::UnexpectedEof)?;
    Ok(i32::from_be_bytes(buf))
}
