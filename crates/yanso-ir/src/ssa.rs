//! SSA Repair
//!
//! Passes that rewrite control flow leave values used outside their
//! defining block and phi nodes whose incoming edges no longer exist.
//! The repair strategy is the classic reg2mem one: demote offending
//! registers and phis to entry-block stack slots, re-materializing
//! them with loads at each use.

use crate::builder::Builder;
use crate::function::Function;
use crate::instruction::{InstId, InstKind};
use crate::types::Type;
use crate::value::Value;

/// A demotion slot at the very top of the entry block, so it precedes
/// any store into it, including stores in the entry block itself.
fn make_slot(func: &mut Function, ty: Type, name: &str) -> Value {
    let entry = func.entry();
    Value::Inst(func.insert_inst(
        entry,
        0,
        InstKind::Alloca { allocated: ty },
        Type::Ptr,
        Some(name.to_string()),
    ))
}

/// Demote the result of `inst` to a stack slot: an alloca is added to
/// the entry block, the value is stored right after its definition and
/// every use is replaced with a load.
///
/// Loads feeding a phi are placed at the end of the incoming block;
/// other loads go immediately before the user.
pub fn demote_reg_to_stack(func: &mut Function, inst: InstId) {
    assert!(!func.inst(inst).is_terminator(), "cannot demote a terminator");
    let users = func.users_of(Value::Inst(inst));
    if users.is_empty() {
        return;
    }
    let ty = func.inst(inst).ty.clone();

    let slot = make_slot(func, ty.clone(), "reg2mem");

    // Store right after the definition.
    {
        let (block, at) = func.position_of(inst);
        func.insert_inst(
            block,
            at + 1,
            InstKind::Store { value: Value::Inst(inst), ptr: slot },
            Type::Void,
            None,
        );
    }

    for user in users {
        if let InstKind::Phi { incoming } = func.inst(user).kind.clone() {
            for (i, (v, pred)) in incoming.iter().enumerate() {
                if *v != Value::Inst(inst) {
                    continue;
                }
                let load = {
                    let mut b = Builder::before_terminator(func, *pred);
                    b.build_load(ty.clone(), slot)
                };
                if let InstKind::Phi { incoming } = &mut func.inst_mut(user).kind {
                    incoming[i].0 = load;
                }
            }
        } else {
            let load = {
                let mut b = Builder::before(func, user);
                b.build_load(ty.clone(), slot)
            };
            func.inst_mut(user).kind.for_each_operand_mut(|op| {
                if *op == Value::Inst(inst) {
                    *op = load;
                }
            });
        }
    }
}

/// Demote a phi node to a stack slot: each incoming value is stored at
/// the end of its predecessor, and the phi itself becomes a load at
/// the first insertion point of its block.
pub fn demote_phi_to_stack(func: &mut Function, phi: InstId) {
    let incoming = match &func.inst(phi).kind {
        InstKind::Phi { incoming } => incoming.clone(),
        _ => panic!("not a phi node"),
    };
    let ty = func.inst(phi).ty.clone();

    let slot = make_slot(func, ty.clone(), "phi2mem");

    for (value, pred) in incoming {
        let mut b = Builder::before_terminator(func, pred);
        b.build_store(value, slot);
    }

    let block = func.inst(phi).block;
    let at = func.first_insertion_pt(block);
    let load = Value::Inst(func.insert_inst(
        block,
        at,
        InstKind::Load { ptr: slot },
        ty,
        None,
    ));
    func.replace_all_uses_with(Value::Inst(phi), load);
    func.erase_inst(phi);
}

/// Iteratively demote phi nodes and escaping registers until the
/// function is free of both. Entry-block allocas are exempt; each
/// round strictly shrinks the offending set, so this terminates.
pub fn fix_stack(func: &mut Function) {
    let entry = func.entry();
    loop {
        let mut phis: Vec<InstId> = Vec::new();
        let mut regs: Vec<InstId> = Vec::new();

        for &b in func.block_order() {
            for &id in func.block_insts(b) {
                let data = func.inst(id);
                if data.kind.is_phi() {
                    phis.push(id);
                    continue;
                }
                let entry_alloca =
                    matches!(data.kind, InstKind::Alloca { .. }) && b == entry;
                if !entry_alloca && !data.is_terminator() && func.value_escapes(id) {
                    regs.push(id);
                }
            }
        }

        if regs.is_empty() && phis.is_empty() {
            return;
        }
        for id in regs {
            demote_reg_to_stack(func, id);
        }
        for id in phis {
            demote_phi_to_stack(func, id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Builder;
    use crate::function::{Function, Param};
    use crate::instruction::IntPredicate;
    use crate::module::Module;
    use crate::types::Type;
    use crate::verify::verify_function;

    /// max(x, 0) via a diamond joined by a phi.
    fn diamond_with_phi() -> Function {
        let mut f = Function::new("max0", Type::I32, vec![Param::new(Type::I32)]);
        let entry = f.add_block("entry");
        let pos = f.add_block("pos");
        let neg = f.add_block("neg");
        let join = f.add_block("join");
        let mut b = Builder::at_end(&mut f, entry);
        let c = b.build_icmp(IntPredicate::SGT, Value::Arg(0), b.const_i32(0));
        b.build_cond_br(c, pos, neg);
        let mut b = Builder::at_end(&mut f, pos);
        let doubled = b.build_add(Value::Arg(0), Value::Arg(0));
        b.build_br(join);
        Builder::at_end(&mut f, neg).build_br(join);
        let mut b = Builder::at_end(&mut f, join);
        let merged = b.build_phi(Type::I32, &[(doubled, pos), (b.const_i32(0), neg)]);
        b.build_ret(Some(merged));
        f
    }

    #[test]
    fn test_fix_stack_removes_phis_and_escapes() {
        let mut m = Module::new("m");
        let mut f = diamond_with_phi();
        fix_stack(&mut f);

        for id in f.inst_ids().collect::<Vec<_>>() {
            assert!(!f.inst(id).kind.is_phi(), "phi survived fix_stack");
        }
        for id in f.inst_ids().collect::<Vec<_>>() {
            if !f.inst(id).is_terminator()
                && !matches!(f.inst(id).kind, InstKind::Alloca { .. })
            {
                assert!(!f.value_escapes(id), "value still escapes its block");
            }
        }
        let id = m.add_function(f);
        verify_function(&m, id).unwrap();
    }

    #[test]
    fn test_fix_stack_idempotent() {
        let mut f = diamond_with_phi();
        fix_stack(&mut f);
        let count = f.inst_count();
        fix_stack(&mut f);
        assert_eq!(f.inst_count(), count);
    }

    #[test]
    fn test_demote_reg_no_users_is_noop() {
        let mut f = Function::new("f", Type::I32, vec![Param::new(Type::I32)]);
        let entry = f.add_block("entry");
        let mut b = Builder::at_end(&mut f, entry);
        let dead = b.build_add(Value::Arg(0), b.const_i32(1));
        b.build_ret(Some(Value::Arg(0)));
        let count = f.inst_count();
        demote_reg_to_stack(&mut f, dead.inst_id().unwrap());
        assert_eq!(f.inst_count(), count);
    }
}
