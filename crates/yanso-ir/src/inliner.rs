//! Call Inlining
//!
//! Replaces a direct call with a clone of the callee body. Static
//! allocas move to the caller's entry block, returns become branches
//! to the continuation block, and the returned value is joined with a
//! phi when the callee has several returns.

use rustc_hash::FxHashMap;

use crate::basic_block::BlockId;
use crate::function::Function;
use crate::instruction::{Callee, InstId, InstKind};
use crate::module::{FuncId, Module};
use crate::types::Type;
use crate::value::{Constant, Value};

/// Inline `call` (a direct call inside `caller_id`) and erase it.
/// Returns false without touching anything when the target is not a
/// direct call to a definition, is recursive, or contains invokes.
pub fn inline_call(module: &mut Module, caller_id: FuncId, call: InstId) -> bool {
    let callee_id = match &module.func(caller_id).inst(call).kind {
        InstKind::Call { callee: Callee::Func(f), .. } => *f,
        _ => return false,
    };
    if callee_id == caller_id {
        return false;
    }
    let callee: Function = {
        let c = module.func(callee_id);
        if c.is_declaration() || c.has_invoke() {
            return false;
        }
        c.clone()
    };
    let args: Vec<Value> = match &module.func(caller_id).inst(call).kind {
        InstKind::Call { args, .. } => args.to_vec(),
        _ => unreachable!(),
    };
    let ret_ty = module.func(caller_id).inst(call).ty.clone();

    let caller = module.func_mut(caller_id);
    let caller_entry = caller.entry();
    let (call_block, call_idx) = caller.position_of(call);
    let cont = caller.split_block(call_block, call_idx + 1, "inl.cont");

    // Clone blocks, moving entry allocas to the caller's entry.
    let callee_blocks: Vec<BlockId> = callee.block_order().to_vec();
    let callee_entry = callee.entry();
    let mut block_map: FxHashMap<BlockId, BlockId> = FxHashMap::default();
    let mut after = call_block;
    for &ob in &callee_blocks {
        let nb = caller.insert_block_after(after, callee.block(ob).name.clone());
        block_map.insert(ob, nb);
        after = nb;
    }

    let mut inst_map: FxHashMap<InstId, InstId> = FxHashMap::default();
    let mut new_insts: Vec<InstId> = Vec::new();
    for &ob in &callee_blocks {
        for &oid in callee.block_insts(ob) {
            let data = callee.inst(oid);
            let hoist_alloca =
                matches!(data.kind, InstKind::Alloca { .. }) && ob == callee_entry;
            let nid = if hoist_alloca {
                let at = match caller.terminator(caller_entry) {
                    Some(t) => caller.position_of(t).1,
                    None => caller.block_insts(caller_entry).len(),
                };
                caller.insert_inst(
                    caller_entry,
                    at,
                    data.kind.clone(),
                    data.ty.clone(),
                    data.name.clone(),
                )
            } else {
                caller.append_inst(
                    block_map[&ob],
                    data.kind.clone(),
                    data.ty.clone(),
                    data.name.clone(),
                )
            };
            inst_map.insert(oid, nid);
            new_insts.push(nid);
        }
    }

    // Remap operands, successors and returns on the clones.
    let mut rets: Vec<(BlockId, Option<Value>)> = Vec::new();
    for nid in new_insts {
        let block = caller.inst(nid).block;
        let kind = &mut caller.inst_mut(nid).kind;
        kind.for_each_operand_mut(|op| match *op {
            Value::Arg(i) => *op = args[i as usize],
            Value::Inst(old) => *op = Value::Inst(inst_map[&old]),
            _ => {}
        });
        kind.for_each_successor_mut(|s| *s = block_map[s]);
        if let InstKind::Ret { value } = kind {
            rets.push((block, *value));
            *kind = InstKind::Br { dest: cont };
        }
    }

    // Enter the inlined body instead of calling.
    caller.erase_terminator(call_block);
    caller.append_inst(
        call_block,
        InstKind::Br { dest: block_map[&callee_entry] },
        Type::Void,
        None,
    );

    if !ret_ty.is_void() && caller.has_users(Value::Inst(call)) {
        let replacement = match rets.len() {
            0 => Value::Const(Constant::zero(&ret_ty)),
            1 => rets[0].1.expect("non-void ret without value"),
            _ => {
                let incoming: Vec<(Value, BlockId)> = rets
                    .iter()
                    .map(|(b, v)| (v.expect("non-void ret without value"), *b))
                    .collect();
                Value::Inst(caller.insert_inst(
                    cont,
                    0,
                    InstKind::Phi { incoming: incoming.into() },
                    ret_ty.clone(),
                    None,
                ))
            }
        };
        caller.replace_all_uses_with(Value::Inst(call), replacement);
    }
    caller.erase_inst(call);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Builder;
    use crate::function::Param;
    use crate::instruction::IntPredicate;
    use crate::verify::verify_module;

    #[test]
    fn test_inline_single_return() {
        let mut m = Module::new("m");
        let mut callee = Function::new("twice", Type::I32, vec![Param::new(Type::I32)]);
        let e = callee.add_block("entry");
        let mut b = Builder::at_end(&mut callee, e);
        let doubled = b.build_add(Value::Arg(0), Value::Arg(0));
        b.build_ret(Some(doubled));
        let callee_id = m.add_function(callee);

        let mut caller = Function::new("caller", Type::I32, vec![Param::new(Type::I32)]);
        let e = caller.add_block("entry");
        let mut b = Builder::at_end(&mut caller, e);
        let c = b.build_call(Callee::Func(callee_id), &[Value::Arg(0)], Type::I32);
        let plus1 = b.build_add(c, b.const_i32(1));
        b.build_ret(Some(plus1));
        let caller_id = m.add_function(caller);

        assert!(inline_call(&mut m, caller_id, c.inst_id().unwrap()));
        let f = m.func(caller_id);
        // No calls remain.
        assert!(f
            .inst_ids()
            .all(|id| !matches!(f.inst(id).kind, InstKind::Call { .. })));
        verify_module(&m).unwrap();
    }

    #[test]
    fn test_inline_two_returns_builds_phi() {
        let mut m = Module::new("m");
        let mut callee = Function::new("absish", Type::I32, vec![Param::new(Type::I32)]);
        let e = callee.add_block("entry");
        let pos = callee.add_block("pos");
        let neg = callee.add_block("neg");
        let mut b = Builder::at_end(&mut callee, e);
        let c = b.build_icmp(IntPredicate::SGT, Value::Arg(0), b.const_i32(0));
        b.build_cond_br(c, pos, neg);
        Builder::at_end(&mut callee, pos).build_ret(Some(Value::Arg(0)));
        let mut b = Builder::at_end(&mut callee, neg);
        let negated = b.build_sub(b.const_i32(0), Value::Arg(0));
        b.build_ret(Some(negated));
        let callee_id = m.add_function(callee);

        let mut caller = Function::new("caller", Type::I32, vec![Param::new(Type::I32)]);
        let e = caller.add_block("entry");
        let mut b = Builder::at_end(&mut caller, e);
        let c = b.build_call(Callee::Func(callee_id), &[Value::Arg(0)], Type::I32);
        b.build_ret(Some(c));
        let caller_id = m.add_function(caller);

        assert!(inline_call(&mut m, caller_id, c.inst_id().unwrap()));
        let f = m.func(caller_id);
        assert!(f.inst_ids().any(|id| f.inst(id).kind.is_phi()));
        verify_module(&m).unwrap();
    }

    #[test]
    fn test_recursive_call_is_left_alone() {
        let mut m = Module::new("m");
        let mut f = Function::new("rec", Type::Void, vec![]);
        let e = f.add_block("entry");
        let fid = FuncId(0);
        let mut b = Builder::at_end(&mut f, e);
        let c = b.build_call(Callee::Func(fid), &[], Type::Void);
        b.build_ret(None);
        let got = m.add_function(f);
        assert_eq!(got, fid);
        assert!(!inline_call(&mut m, fid, c.inst_id().unwrap()));
    }
}
