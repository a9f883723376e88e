//! Arithmetic Virtualization
//!
//! Replaces integer binary operators with calls to synthesized
//! out-of-line helpers. Each nontrivial helper computes its operator
//! through a mixed-boolean-arithmetic identity; shifts stay native and
//! serve as leaves. Helpers are created lazily, reference each other
//! (Sub calls Add, Xor calls Add and Shl) and are pinned with NoInline
//! and OptimizeNone so later optimization cannot undo the rewrite.

use rustc_hash::FxHashMap;

use yanso_ir::{
    BinOp, Builder, Callee, FnAttr, FuncId, Function, InstId, InstKind, Linkage, Module, Param,
    Type, Value,
};

use crate::pass::{ModulePass, Pass, PassResult};

pub struct Virtualize {
    helpers: FxHashMap<BinOp, FuncId>,
}

impl Virtualize {
    pub fn new() -> Self {
        Self { helpers: FxHashMap::default() }
    }
}

impl Default for Virtualize {
    fn default() -> Self {
        Self::new()
    }
}

impl Pass for Virtualize {
    fn name(&self) -> &'static str {
        "vm"
    }

    fn description(&self) -> &'static str {
        "Use functions to do simple arithmetic"
    }
}

fn helper_name(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "__YANSOLLVM_VM_Add",
        BinOp::Sub => "__YANSOLLVM_VM_Sub",
        BinOp::Shl => "__YANSOLLVM_VM_Shl",
        BinOp::AShr => "__YANSOLLVM_VM_AShr",
        BinOp::LShr => "__YANSOLLVM_VM_LShr",
        BinOp::And => "__YANSOLLVM_VM_And",
        BinOp::Or => "__YANSOLLVM_VM_Or",
        BinOp::Xor => "__YANSOLLVM_VM_Xor",
        _ => unreachable!("operator is not virtualized"),
    }
}

fn is_virtualized(op: BinOp) -> bool {
    matches!(
        op,
        BinOp::Add
            | BinOp::Sub
            | BinOp::Shl
            | BinOp::AShr
            | BinOp::LShr
            | BinOp::And
            | BinOp::Or
            | BinOp::Xor
    )
}

impl ModulePass for Virtualize {
    fn run_on_module(&mut self, module: &mut Module) -> PassResult<bool> {
        // Snapshot before any helper exists, so helper bodies are
        // never rewritten by the run that created them.
        let mut work: Vec<(FuncId, InstId)> = Vec::new();
        for (fid, f) in module.functions() {
            for inst in f.inst_ids() {
                if let InstKind::Binary { op, lhs, .. } = &f.inst(inst).kind {
                    if !is_virtualized(*op) {
                        continue;
                    }
                    match f.value_type(*lhs).int_width() {
                        Some(w) if w <= 64 => work.push((fid, inst)),
                        _ => continue,
                    }
                }
            }
        }

        for (fid, inst) in &work {
            let (op, lhs, rhs) = match &module.func(*fid).inst(*inst).kind {
                InstKind::Binary { op, lhs, rhs } => (*op, *lhs, *rhs),
                _ => unreachable!(),
            };
            let helper = self.get_or_create(module, op);
            let ty = module.func(*fid).value_type(lhs);
            let signed = op == BinOp::AShr;

            let f = module.func_mut(*fid);
            let replacement = {
                let mut b = Builder::before(f, *inst);
                let a = b.build_int_cast(lhs, Type::I64, signed);
                let c = b.build_int_cast(rhs, Type::I64, signed);
                let call = b.build_call(Callee::Func(helper), &[a, c], Type::I64);
                b.build_int_cast(call, ty, false)
            };
            f.replace_all_uses_with(Value::Inst(*inst), replacement);
            f.erase_inst(*inst);
        }
        Ok(!work.is_empty())
    }
}

impl Virtualize {
    fn get_or_create(&mut self, module: &mut Module, op: BinOp) -> FuncId {
        if let Some(id) = self.helpers.get(&op) {
            return *id;
        }
        let id = match op {
            BinOp::Shl | BinOp::AShr | BinOp::LShr => create_native(module, op),
            BinOp::Add => create_add(module),
            BinOp::And => create_and(module),
            BinOp::Or => create_or(module),
            BinOp::Sub => {
                let add = self.get_or_create(module, BinOp::Add);
                create_sub(module, add)
            }
            BinOp::Xor => {
                let add = self.get_or_create(module, BinOp::Add);
                let shl = self.get_or_create(module, BinOp::Shl);
                create_xor(module, add, shl)
            }
            _ => unreachable!(),
        };
        self.helpers.insert(op, id);
        id
    }
}

fn helper_shell(op: BinOp) -> (Function, yanso_ir::BlockId) {
    let mut f = Function::new(
        helper_name(op),
        Type::I64,
        vec![Param::new(Type::I64), Param::new(Type::I64)],
    );
    f.linkage = Linkage::Internal;
    f.attrs.add(FnAttr::NoInline);
    f.attrs.add(FnAttr::OptimizeNone);
    let entry = f.add_block("entry");
    (f, entry)
}

/// Shifts keep their native operation; they are the leaves the other
/// helpers build on.
fn create_native(module: &mut Module, op: BinOp) -> FuncId {
    let (mut f, entry) = helper_shell(op);
    let mut b = Builder::at_end(&mut f, entry);
    let r = b.build_binop(op, Value::Arg(0), Value::Arg(1));
    b.build_ret(Some(r));
    module.add_function(f)
}

/// x + y == (x|~y) + (~x&y) - ~(x&y) + (x|y)
fn create_add(module: &mut Module) -> FuncId {
    let (mut f, entry) = helper_shell(BinOp::Add);
    let mut b = Builder::at_end(&mut f, entry);
    let (x, y) = (Value::Arg(0), Value::Arg(1));
    let not_y = b.build_not(y);
    let t1 = b.build_or(x, not_y);
    let not_x = b.build_not(x);
    let t2 = b.build_and(not_x, y);
    let t3 = b.build_and(x, y);
    let t3 = b.build_not(t3);
    let t4 = b.build_or(x, y);
    let r = b.build_add(t1, t2);
    let r = b.build_sub(r, t3);
    let r = b.build_add(r, t4);
    b.build_ret(Some(r));
    module.add_function(f)
}

/// x - y == Add(x, ~y) + 1
fn create_sub(module: &mut Module, add: FuncId) -> FuncId {
    let (mut f, entry) = helper_shell(BinOp::Sub);
    let mut b = Builder::at_end(&mut f, entry);
    let not_y = b.build_not(Value::Arg(1));
    let sum = b.build_call(Callee::Func(add), &[Value::Arg(0), not_y], Type::I64);
    let r = b.build_add(sum, b.const_i64(1));
    b.build_ret(Some(r));
    module.add_function(f)
}

/// x & y == (~x|y) + (x&~y) - ~(x&y)
fn create_and(module: &mut Module) -> FuncId {
    let (mut f, entry) = helper_shell(BinOp::And);
    let mut b = Builder::at_end(&mut f, entry);
    let (x, y) = (Value::Arg(0), Value::Arg(1));
    let not_x = b.build_not(x);
    let t1 = b.build_or(not_x, y);
    let not_y = b.build_not(y);
    let t2 = b.build_and(x, not_y);
    let t3 = b.build_and(x, y);
    let t3 = b.build_not(t3);
    let r = b.build_add(t1, t2);
    let r = b.build_sub(r, t3);
    b.build_ret(Some(r));
    module.add_function(f)
}

/// x | y == (x^y) + y - (~x&y)
fn create_or(module: &mut Module) -> FuncId {
    let (mut f, entry) = helper_shell(BinOp::Or);
    let mut b = Builder::at_end(&mut f, entry);
    let (x, y) = (Value::Arg(0), Value::Arg(1));
    let t1 = b.build_xor(x, y);
    let r = b.build_add(t1, y);
    let not_x = b.build_not(x);
    let t2 = b.build_and(not_x, y);
    let r = b.build_sub(r, t2);
    b.build_ret(Some(r));
    module.add_function(f)
}

/// x ^ y == Add(x, y) - Shl(x&y, 1)
fn create_xor(module: &mut Module, add: FuncId, shl: FuncId) -> FuncId {
    let (mut f, entry) = helper_shell(BinOp::Xor);
    let mut b = Builder::at_end(&mut f, entry);
    let (x, y) = (Value::Arg(0), Value::Arg(1));
    let sum = b.build_call(Callee::Func(add), &[x, y], Type::I64);
    let both = b.build_and(x, y);
    let doubled = b.build_call(Callee::Func(shl), &[both, b.const_i64(1)], Type::I64);
    let r = b.build_sub(sum, doubled);
    b.build_ret(Some(r));
    module.add_function(f)
}
