//! IR Builder
//!
//! The Builder provides a convenient API for constructing
//! instructions. It maintains an insertion point inside one function
//! and keeps inserting in front of the same spot, so a sequence of
//! `build_*` calls appears in program order.

use smallvec::SmallVec;

use crate::basic_block::BlockId;
use crate::function::Function;
use crate::instruction::{BinOp, Callee, CastOp, InstId, InstKind, IntPredicate};
use crate::types::Type;
use crate::value::{Constant, Value};

/// An IR builder positioned inside a function.
pub struct Builder<'f> {
    func: &'f mut Function,
    block: BlockId,
    at: usize,
}

impl<'f> Builder<'f> {
    /// Create a builder positioned at the end of `block`.
    pub fn at_end(func: &'f mut Function, block: BlockId) -> Self {
        let at = func.block_insts(block).len();
        Self { func, block, at }
    }

    /// Create a builder positioned immediately before `inst`.
    pub fn before(func: &'f mut Function, inst: InstId) -> Self {
        let (block, at) = func.position_of(inst);
        Self { func, block, at }
    }

    /// Create a builder positioned before the terminator of `block`.
    pub fn before_terminator(func: &'f mut Function, block: BlockId) -> Self {
        let at = match func.terminator(block) {
            Some(t) => func.position_of(t).1,
            None => func.block_insts(block).len(),
        };
        Self { func, block, at }
    }

    pub fn func(&mut self) -> &mut Function {
        self.func
    }

    pub fn block(&self) -> BlockId {
        self.block
    }

    fn push(&mut self, kind: InstKind, ty: Type) -> Value {
        let id = self.func.insert_inst(self.block, self.at, kind, ty, None);
        self.at += 1;
        Value::Inst(id)
    }

    fn push_named(&mut self, kind: InstKind, ty: Type, name: &str) -> Value {
        let id = self
            .func
            .insert_inst(self.block, self.at, kind, ty, Some(name.to_string()));
        self.at += 1;
        Value::Inst(id)
    }

    // Binary operations

    pub fn build_binop(&mut self, op: BinOp, lhs: Value, rhs: Value) -> Value {
        let ty = self.func.value_type(lhs);
        self.push(InstKind::Binary { op, lhs, rhs }, ty)
    }

    pub fn build_add(&mut self, lhs: Value, rhs: Value) -> Value {
        self.build_binop(BinOp::Add, lhs, rhs)
    }

    pub fn build_sub(&mut self, lhs: Value, rhs: Value) -> Value {
        self.build_binop(BinOp::Sub, lhs, rhs)
    }

    pub fn build_mul(&mut self, lhs: Value, rhs: Value) -> Value {
        self.build_binop(BinOp::Mul, lhs, rhs)
    }

    pub fn build_and(&mut self, lhs: Value, rhs: Value) -> Value {
        self.build_binop(BinOp::And, lhs, rhs)
    }

    pub fn build_or(&mut self, lhs: Value, rhs: Value) -> Value {
        self.build_binop(BinOp::Or, lhs, rhs)
    }

    pub fn build_xor(&mut self, lhs: Value, rhs: Value) -> Value {
        self.build_binop(BinOp::Xor, lhs, rhs)
    }

    pub fn build_shl(&mut self, lhs: Value, rhs: Value) -> Value {
        self.build_binop(BinOp::Shl, lhs, rhs)
    }

    pub fn build_lshr(&mut self, lhs: Value, rhs: Value) -> Value {
        self.build_binop(BinOp::LShr, lhs, rhs)
    }

    /// Bitwise complement, lowered to `xor x, -1`.
    pub fn build_not(&mut self, v: Value) -> Value {
        let ty = self.func.value_type(v);
        let bits = ty.int_width().expect("not on non-integer");
        self.build_binop(BinOp::Xor, v, Value::const_int(bits, u64::MAX))
    }

    // Comparisons

    pub fn build_icmp(&mut self, pred: IntPredicate, lhs: Value, rhs: Value) -> Value {
        self.push(InstKind::ICmp { pred, lhs, rhs }, Type::I1)
    }

    // Conversions

    pub fn build_cast(&mut self, op: CastOp, value: Value, dest_ty: Type) -> Value {
        self.push(InstKind::Cast { op, value }, dest_ty)
    }

    pub fn build_trunc(&mut self, value: Value, dest_ty: Type) -> Value {
        self.build_cast(CastOp::Trunc, value, dest_ty)
    }

    pub fn build_zext(&mut self, value: Value, dest_ty: Type) -> Value {
        self.build_cast(CastOp::ZExt, value, dest_ty)
    }

    pub fn build_sext(&mut self, value: Value, dest_ty: Type) -> Value {
        self.build_cast(CastOp::SExt, value, dest_ty)
    }

    pub fn build_ptr_to_int(&mut self, value: Value, dest_ty: Type) -> Value {
        self.build_cast(CastOp::PtrToInt, value, dest_ty)
    }

    pub fn build_int_to_ptr(&mut self, value: Value) -> Value {
        self.build_cast(CastOp::IntToPtr, value, Type::Ptr)
    }

    /// Integer-to-integer cast that picks trunc/sext/zext by width and
    /// is a no-op when widths already match.
    pub fn build_int_cast(&mut self, value: Value, dest_ty: Type, signed: bool) -> Value {
        let src = self
            .func
            .value_type(value)
            .int_width()
            .expect("int cast on non-integer");
        let dst = dest_ty.int_width().expect("int cast to non-integer");
        if src == dst {
            value
        } else if src > dst {
            self.build_trunc(value, dest_ty)
        } else if signed {
            self.build_sext(value, dest_ty)
        } else {
            self.build_zext(value, dest_ty)
        }
    }

    // Memory

    pub fn build_alloca(&mut self, allocated: Type, name: &str) -> Value {
        self.push_named(InstKind::Alloca { allocated }, Type::Ptr, name)
    }

    pub fn build_load(&mut self, ty: Type, ptr: Value) -> Value {
        self.push(InstKind::Load { ptr }, ty)
    }

    pub fn build_store(&mut self, value: Value, ptr: Value) -> Value {
        self.push(InstKind::Store { value, ptr }, Type::Void)
    }

    pub fn build_gep(&mut self, elem_ty: Type, base: Value, indices: &[Value]) -> Value {
        self.push(
            InstKind::Gep { elem_ty, base, indices: SmallVec::from_slice(indices) },
            Type::Ptr,
        )
    }

    // Other operations

    pub fn build_select(&mut self, cond: Value, if_true: Value, if_false: Value) -> Value {
        let ty = self.func.value_type(if_true);
        self.push(InstKind::Select { cond, if_true, if_false }, ty)
    }

    pub fn build_phi(&mut self, ty: Type, incoming: &[(Value, BlockId)]) -> Value {
        self.push(InstKind::Phi { incoming: SmallVec::from_slice(incoming) }, ty)
    }

    pub fn build_call(&mut self, callee: Callee, args: &[Value], ret_ty: Type) -> Value {
        self.push(
            InstKind::Call { callee, args: SmallVec::from_slice(args), conv: 0 },
            ret_ty,
        )
    }

    // Terminators

    pub fn build_br(&mut self, dest: BlockId) -> Value {
        self.push(InstKind::Br { dest }, Type::Void)
    }

    pub fn build_cond_br(&mut self, cond: Value, if_true: BlockId, if_false: BlockId) -> Value {
        self.push(InstKind::CondBr { cond, if_true, if_false }, Type::Void)
    }

    pub fn build_switch(
        &mut self,
        cond: Value,
        default: BlockId,
        cases: Vec<(u64, BlockId)>,
    ) -> InstId {
        let v = self.push(InstKind::Switch { cond, default, cases }, Type::Void);
        v.inst_id().unwrap()
    }

    pub fn build_ret(&mut self, value: Option<Value>) -> Value {
        self.push(InstKind::Ret { value }, Type::Void)
    }

    pub fn build_unreachable(&mut self) -> Value {
        self.push(InstKind::Unreachable, Type::Void)
    }

    // Constants

    pub fn const_i32(&self, v: u32) -> Value {
        Value::const_int(32, v as u64)
    }

    pub fn const_i64(&self, v: u64) -> Value {
        Value::const_int(64, v)
    }

    pub fn const_zero(&self, ty: &Type) -> Value {
        Value::Const(Constant::zero(ty))
    }
}
