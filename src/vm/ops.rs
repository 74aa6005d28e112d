/// Decoded instruction set.
///
/// One variant per class-file opcode family. Short forms are folded into
/// their general variant (`iload_2` is `Iload(2)`, `iconst_m1`/`bipush`/
/// `sipush` are `Iconst`, `goto_w` is `Goto`, `wide` widens operands).
/// Branch operands are instruction indices into the method's code, not byte
/// offsets; `bytecode::decode` performs that translation.
///
/// The serde form uses the lowercase mnemonic: `"iadd"`, `{ iload = 1 }`,
/// `{ if_icmp = ["lt", 12] }`.
use serde::{Deserialize, Serialize};

use super::descriptor::FieldKind;

/// Comparison of a conditional branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
}

impl Cond {
    pub fn test(self, a: i32, b: i32) -> bool {
        match self {
            Cond::Eq => a == b,
            Cond::Ne => a != b,
            Cond::Lt => a < b,
            Cond::Ge => a >= b,
            Cond::Gt => a > b,
            Cond::Le => a <= b,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Instruction {
    // ========================================
    // Constants
    // ========================================
    Nop,
    AconstNull,
    Iconst(i32),
    Lconst(i64),
    Fconst(f32),
    Dconst(f64),
    /// `ldc` / `ldc_w`: int, float, string or class constant.
    Ldc(u16),
    /// `ldc2_w`: long or double constant.
    Ldc2W(u16),

    // ========================================
    // Loads and stores
    // ========================================
    Iload(u16),
    Lload(u16),
    Fload(u16),
    Dload(u16),
    Aload(u16),
    Istore(u16),
    Lstore(u16),
    Fstore(u16),
    Dstore(u16),
    Astore(u16),
    Iinc(u16, i16),

    // ========================================
    // Arrays
    // ========================================
    Iaload,
    Laload,
    Faload,
    Daload,
    Aaload,
    Baload,
    Caload,
    Saload,
    Iastore,
    Lastore,
    Fastore,
    Dastore,
    Aastore,
    Bastore,
    Castore,
    Sastore,
    Newarray(FieldKind),
    Anewarray(u16),
    Multianewarray(u16, u8),
    Arraylength,

    // ========================================
    // Stack manipulation
    // ========================================
    Pop,
    Pop2,
    Dup,
    DupX1,
    DupX2,
    Dup2,
    Dup2X1,
    Dup2X2,
    Swap,

    // ========================================
    // Arithmetic
    // ========================================
    Iadd,
    Ladd,
    Fadd,
    Dadd,
    Isub,
    Lsub,
    Fsub,
    Dsub,
    Imul,
    Lmul,
    Fmul,
    Dmul,
    Idiv,
    Ldiv,
    Fdiv,
    Ddiv,
    Irem,
    Lrem,
    Frem,
    Drem,
    Ineg,
    Lneg,
    Fneg,
    Dneg,
    Ishl,
    Lshl,
    Ishr,
    Lshr,
    Iushr,
    Lushr,
    Iand,
    Land,
    Ior,
    Lor,
    Ixor,
    Lxor,

    // ========================================
    // Conversions
    // ========================================
    I2l,
    I2f,
    I2d,
    L2i,
    L2f,
    L2d,
    F2i,
    F2l,
    F2d,
    D2i,
    D2l,
    D2f,
    I2b,
    I2c,
    I2s,

    // ========================================
    // Comparisons
    // ========================================
    Lcmp,
    Fcmpl,
    Fcmpg,
    Dcmpl,
    Dcmpg,

    // ========================================
    // Control flow
    // ========================================
    /// `ifeq` .. `ifle`: compare int with zero.
    If(Cond, usize),
    /// `if_icmpeq` .. `if_icmple`
    IfIcmp(Cond, usize),
    IfAcmpeq(usize),
    IfAcmpne(usize),
    Ifnull(usize),
    Ifnonnull(usize),
    Goto(usize),
    Jsr(usize),
    Ret(u16),
    Tableswitch {
        default: usize,
        low: i32,
        targets: Vec<usize>,
    },
    /// Pairs are sorted by key.
    Lookupswitch {
        default: usize,
        pairs: Vec<(i32, usize)>,
    },
    Ireturn,
    Lreturn,
    Freturn,
    Dreturn,
    Areturn,
    Return,

    // ========================================
    // Fields and methods
    // ========================================
    Getstatic(u16),
    Putstatic(u16),
    Getfield(u16),
    Putfield(u16),
    Invokevirtual(u16),
    Invokespecial(u16),
    Invokestatic(u16),
    Invokeinterface(u16),
    Invokedynamic(u16),

    // ========================================
    // Objects
    // ========================================
    New(u16),
    Athrow,
    Checkcast(u16),
    Instanceof(u16),
    Monitorenter,
    Monitorexit,
}

impl Instruction {
    /// Branch targets of this instruction (excluding fall-through).
    pub fn branch_targets(&self) -> Vec<usize> {
        match self {
            Instruction::If(_, t)
            | Instruction::IfIcmp(_, t)
            | Instruction::IfAcmpeq(t)
            | Instruction::IfAcmpne(t)
            | Instruction::Ifnull(t)
            | Instruction::Ifnonnull(t)
            | Instruction::Goto(t)
            | Instruction::Jsr(t) => vec![*t],
            Instruction::Tableswitch {
                default, targets, ..
            } => {
                let mut all = vec![*default];
                all.extend(targets.iter().copied());
                all
            }
            Instruction::Lookupswitch { default, pairs } => {
                let mut all = vec![*default];
                all.extend(pairs.iter().map(|(_, t)| *t));
                all
            }
            _ => Vec::new(),
        }
    }

    /// Whether control never falls through to the next instruction.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Instruction::Goto(_)
                | Instruction::Ret(_)
                | Instruction::Tableswitch { .. }
                | Instruction::Lookupswitch { .. }
                | Instruction::Ireturn
                | Instruction::Lreturn
                | Instruction::Freturn
                | Instruction::Dreturn
                | Instruction::Areturn
                | Instruction::Return
                | Instruction::Athrow
        )
    }

    /// Local variable slot this instruction reads or writes, with the
    /// width of the access.
    pub fn local_access(&self) -> Option<(usize, usize)> {
        match self {
            Instruction::Iload(i)
            | Instruction::Fload(i)
            | Instruction::Aload(i)
            | Instruction::Istore(i)
            | Instruction::Fstore(i)
            | Instruction::Astore(i)
            | Instruction::Iinc(i, _)
            | Instruction::Ret(i) => Some((*i as usize, 1)),
            Instruction::Lload(i)
            | Instruction::Dload(i)
            | Instruction::Lstore(i)
            | Instruction::Dstore(i) => Some((*i as usize, 2)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cond() {
        assert!(Cond::Lt.test(1, 2));
        assert!(!Cond::Lt.test(2, 2));
        assert!(Cond::Le.test(2, 2));
        assert!(Cond::Ne.test(0, 1));
        assert!(Cond::Ge.test(-1, -1));
    }

    #[test]
    fn test_branch_targets() {
        let sw = Instruction::Lookupswitch {
            default: 9,
            pairs: vec![(1, 3), (5, 6)],
        };
        assert_eq!(sw.branch_targets(), vec![9, 3, 6]);
        assert_eq!(Instruction::Goto(4).branch_targets(), vec![4]);
        assert!(Instruction::Iadd.branch_targets().is_empty());
    }

    #[test]
    fn test_serde_mnemonics() {
        assert!(serde_json::from_str::<Vec<Instruction>>(r#"["bogus"]"#).is_err());
        // ldc2_w takes an operand
        assert!(serde_json::from_str::<Vec<Instruction>>(r#"["ldc2_w"]"#).is_err());

        let code: Vec<Instruction> = serde_json::from_str(
            r#"[{"iload": 0}, {"if_icmp": ["lt", 4]}, "dup2_x1", {"ldc2_w": 3}, "i2l", "aconst_null"]"#,
        )
        .unwrap();
        assert_eq!(
            code,
            vec![
                Instruction::Iload(0),
                Instruction::IfIcmp(Cond::Lt, 4),
                Instruction::Dup2X1,
                Instruction::Ldc2W(3),
                Instruction::I2l,
                Instruction::AconstNull,
            ]
        );
    }

    #[test]
    fn test_local_access() {
        assert_eq!(Instruction::Dstore(3).local_access(), Some((3, 2)));
        assert_eq!(Instruction::Iinc(1, -1).local_access(), Some((1, 1)));
        assert_eq!(Instruction::Iadd.local_access(), None);
    }
}
