//! IR Instructions
//!
//! Instructions are a tagged enum of kinds with per-kind payloads;
//! what LLVM expresses as a class hierarchy becomes pattern matching.
//! Operands are `Value` indices and block references are `BlockId`s,
//! so rewrites traverse and update them uniformly through
//! [`InstKind::operands`], [`InstKind::for_each_operand_mut`],
//! [`InstKind::successors`] and [`InstKind::for_each_successor_mut`].

use std::fmt;

use smallvec::SmallVec;

use crate::basic_block::BlockId;
use crate::module::FuncId;
use crate::types::Type;
use crate::value::Value;

/// Handle of an instruction inside its function.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstId(pub u32);

impl InstId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for InstId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Integer binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    UDiv,
    SDiv,
    URem,
    SRem,
    Shl,
    LShr,
    AShr,
    And,
    Or,
    Xor,
}

impl BinOp {
    pub fn mnemonic(self) -> &'static str {
        match self {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::UDiv => "udiv",
            BinOp::SDiv => "sdiv",
            BinOp::URem => "urem",
            BinOp::SRem => "srem",
            BinOp::Shl => "shl",
            BinOp::LShr => "lshr",
            BinOp::AShr => "ashr",
            BinOp::And => "and",
            BinOp::Or => "or",
            BinOp::Xor => "xor",
        }
    }
}

/// Integer comparison predicates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(clippy::upper_case_acronyms)]
pub enum IntPredicate {
    EQ,  // equal
    NE,  // not equal
    UGT, // unsigned greater than
    UGE, // unsigned greater or equal
    ULT, // unsigned less than
    ULE, // unsigned less or equal
    SGT, // signed greater than
    SGE, // signed greater or equal
    SLT, // signed less than
    SLE, // signed less or equal
}

/// Integer/pointer conversion operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CastOp {
    Trunc,
    ZExt,
    SExt,
    PtrToInt,
    IntToPtr,
    BitCast,
}

/// Call target: a function in the module or an inline-assembly blob.
#[derive(Clone, Debug)]
pub enum Callee {
    Func(FuncId),
    Asm(InlineAsm),
}

/// An inline assembly blob, used only as a call target.
#[derive(Clone, Debug)]
pub struct InlineAsm {
    pub asm: String,
    pub constraints: String,
    pub has_side_effects: bool,
}

/// The operation an instruction performs, with its payload.
#[derive(Clone, Debug)]
pub enum InstKind {
    Alloca {
        allocated: Type,
    },
    Load {
        ptr: Value,
    },
    Store {
        value: Value,
        ptr: Value,
    },
    Gep {
        elem_ty: Type,
        base: Value,
        indices: SmallVec<[Value; 2]>,
    },
    Binary {
        op: BinOp,
        lhs: Value,
        rhs: Value,
    },
    ICmp {
        pred: IntPredicate,
        lhs: Value,
        rhs: Value,
    },
    Cast {
        op: CastOp,
        value: Value,
    },
    Select {
        cond: Value,
        if_true: Value,
        if_false: Value,
    },
    Phi {
        incoming: SmallVec<[(Value, BlockId); 2]>,
    },
    Call {
        callee: Callee,
        args: SmallVec<[Value; 4]>,
        conv: u32,
    },
    // Terminators
    Br {
        dest: BlockId,
    },
    CondBr {
        cond: Value,
        if_true: BlockId,
        if_false: BlockId,
    },
    Switch {
        cond: Value,
        default: BlockId,
        /// Case values are stored zero-extended at the width of the
        /// condition type.
        cases: Vec<(u64, BlockId)>,
    },
    Ret {
        value: Option<Value>,
    },
    Invoke {
        callee: Callee,
        args: SmallVec<[Value; 4]>,
        conv: u32,
        normal: BlockId,
        unwind: BlockId,
    },
    Unreachable,
}

impl InstKind {
    /// Check if this is a terminator instruction
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            InstKind::Br { .. }
                | InstKind::CondBr { .. }
                | InstKind::Switch { .. }
                | InstKind::Ret { .. }
                | InstKind::Invoke { .. }
                | InstKind::Unreachable
        )
    }

    pub fn is_phi(&self) -> bool {
        matches!(self, InstKind::Phi { .. })
    }

    /// All value operands, in a fixed order that matches
    /// [`InstKind::set_operand`]. Switch case values and call targets
    /// are not operands.
    pub fn operands(&self) -> SmallVec<[Value; 4]> {
        let mut out = SmallVec::new();
        match self {
            InstKind::Alloca { .. } | InstKind::Unreachable => {}
            InstKind::Load { ptr } => out.push(*ptr),
            InstKind::Store { value, ptr } => {
                out.push(*value);
                out.push(*ptr);
            }
            InstKind::Gep { base, indices, .. } => {
                out.push(*base);
                out.extend(indices.iter().copied());
            }
            InstKind::Binary { lhs, rhs, .. } | InstKind::ICmp { lhs, rhs, .. } => {
                out.push(*lhs);
                out.push(*rhs);
            }
            InstKind::Cast { value, .. } => out.push(*value),
            InstKind::Select { cond, if_true, if_false } => {
                out.push(*cond);
                out.push(*if_true);
                out.push(*if_false);
            }
            InstKind::Phi { incoming } => out.extend(incoming.iter().map(|(v, _)| *v)),
            InstKind::Call { args, .. } | InstKind::Invoke { args, .. } => {
                out.extend(args.iter().copied())
            }
            InstKind::Br { .. } => {}
            InstKind::CondBr { cond, .. } | InstKind::Switch { cond, .. } => out.push(*cond),
            InstKind::Ret { value } => out.extend(value.iter().copied()),
        }
        out
    }

    /// Replace the operand at `index` (same numbering as `operands`).
    pub fn set_operand(&mut self, index: usize, new: Value) {
        let mut cursor = 0usize;
        self.for_each_operand_mut(|op| {
            if cursor == index {
                *op = new;
            }
            cursor += 1;
        });
        assert!(index < cursor, "operand index out of range");
    }

    pub fn for_each_operand_mut(&mut self, mut f: impl FnMut(&mut Value)) {
        match self {
            InstKind::Alloca { .. } | InstKind::Unreachable | InstKind::Br { .. } => {}
            InstKind::Load { ptr } => f(ptr),
            InstKind::Store { value, ptr } => {
                f(value);
                f(ptr);
            }
            InstKind::Gep { base, indices, .. } => {
                f(base);
                for idx in indices.iter_mut() {
                    f(idx);
                }
            }
            InstKind::Binary { lhs, rhs, .. } | InstKind::ICmp { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            InstKind::Cast { value, .. } => f(value),
            InstKind::Select { cond, if_true, if_false } => {
                f(cond);
                f(if_true);
                f(if_false);
            }
            InstKind::Phi { incoming } => {
                for (v, _) in incoming.iter_mut() {
                    f(v);
                }
            }
            InstKind::Call { args, .. } | InstKind::Invoke { args, .. } => {
                for a in args.iter_mut() {
                    f(a);
                }
            }
            InstKind::CondBr { cond, .. } | InstKind::Switch { cond, .. } => f(cond),
            InstKind::Ret { value } => {
                if let Some(v) = value {
                    f(v);
                }
            }
        }
    }

    /// Successor blocks of a terminator; empty for non-terminators,
    /// returns and unreachable.
    pub fn successors(&self) -> SmallVec<[BlockId; 2]> {
        let mut out = SmallVec::new();
        match self {
            InstKind::Br { dest } => out.push(*dest),
            InstKind::CondBr { if_true, if_false, .. } => {
                out.push(*if_true);
                out.push(*if_false);
            }
            InstKind::Switch { default, cases, .. } => {
                out.push(*default);
                out.extend(cases.iter().map(|(_, b)| *b));
            }
            InstKind::Invoke { normal, unwind, .. } => {
                out.push(*normal);
                out.push(*unwind);
            }
            _ => {}
        }
        out
    }

    pub fn for_each_successor_mut(&mut self, mut f: impl FnMut(&mut BlockId)) {
        match self {
            InstKind::Br { dest } => f(dest),
            InstKind::CondBr { if_true, if_false, .. } => {
                f(if_true);
                f(if_false);
            }
            InstKind::Switch { default, cases, .. } => {
                f(default);
                for (_, b) in cases.iter_mut() {
                    f(b);
                }
            }
            InstKind::Invoke { normal, unwind, .. } => {
                f(normal);
                f(unwind);
            }
            _ => {}
        }
    }

    pub fn opcode_name(&self) -> &'static str {
        match self {
            InstKind::Alloca { .. } => "alloca",
            InstKind::Load { .. } => "load",
            InstKind::Store { .. } => "store",
            InstKind::Gep { .. } => "getelementptr",
            InstKind::Binary { op, .. } => op.mnemonic(),
            InstKind::ICmp { .. } => "icmp",
            InstKind::Cast { op, .. } => match op {
                CastOp::Trunc => "trunc",
                CastOp::ZExt => "zext",
                CastOp::SExt => "sext",
                CastOp::PtrToInt => "ptrtoint",
                CastOp::IntToPtr => "inttoptr",
                CastOp::BitCast => "bitcast",
            },
            InstKind::Select { .. } => "select",
            InstKind::Phi { .. } => "phi",
            InstKind::Call { .. } => "call",
            InstKind::Br { .. } | InstKind::CondBr { .. } => "br",
            InstKind::Switch { .. } => "switch",
            InstKind::Ret { .. } => "ret",
            InstKind::Invoke { .. } => "invoke",
            InstKind::Unreachable => "unreachable",
        }
    }
}

/// An instruction: its operation, result type, owning block and an
/// optional name hint for printing.
#[derive(Clone, Debug)]
pub struct InstData {
    pub kind: InstKind,
    pub ty: Type,
    pub block: BlockId,
    pub name: Option<String>,
}

impl InstData {
    pub fn is_terminator(&self) -> bool {
        self.kind.is_terminator()
    }
}
