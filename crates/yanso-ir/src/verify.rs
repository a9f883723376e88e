//! IR Verifier
//!
//! Structural checks the passes rely on:
//! - every block is non-empty and ends in exactly one terminator
//! - phi nodes are grouped at the top of their block
//! - allocas live in the entry block
//! - switch conditions are integers and case values fit their width
//! - every use is dominated by its definition (on reachable blocks)

use thiserror::Error;

use crate::analysis::DominatorTree;
use crate::function::Function;
use crate::instruction::InstKind;
use crate::module::{FuncId, Module};
use crate::value::{mask_to_width, Value};

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("function @{func}: block {block} is empty")]
    EmptyBlock { func: String, block: String },
    #[error("function @{func}: block {block} does not end in a terminator")]
    MissingTerminator { func: String, block: String },
    #[error("function @{func}: block {block} has a terminator in the middle")]
    MisplacedTerminator { func: String, block: String },
    #[error("function @{func}: block {block} has a phi after a non-phi")]
    MisplacedPhi { func: String, block: String },
    #[error("function @{func}: alloca outside the entry block")]
    AllocaOutsideEntry { func: String },
    #[error("function @{func}: switch condition is not an integer")]
    BadSwitchCondition { func: String },
    #[error("function @{func}: switch case value does not fit the condition width")]
    BadSwitchCase { func: String },
    #[error("function @{func}: use of a value before its definition")]
    UseBeforeDef { func: String },
    #[error("function @{func}: use is not dominated by its definition")]
    UseNotDominated { func: String },
    #[error("function @{func}: phi incoming blocks do not match predecessors")]
    BadPhiIncoming { func: String },
}

/// Verify a single function definition.
pub fn verify_function(module: &Module, id: FuncId) -> Result<(), VerifyError> {
    let func = module.func(id);
    if func.is_declaration() {
        return Ok(());
    }
    let name = || func.name().to_string();
    let entry = func.entry();

    for &b in func.block_order() {
        let block_name = || {
            let n = &func.block(b).name;
            if n.is_empty() { format!("bb{}", b.index()) } else { n.clone() }
        };
        let insts = func.block_insts(b);
        if insts.is_empty() {
            return Err(VerifyError::EmptyBlock { func: name(), block: block_name() });
        }
        let last = *insts.last().unwrap();
        if !func.inst(last).is_terminator() {
            return Err(VerifyError::MissingTerminator { func: name(), block: block_name() });
        }
        let mut seen_non_phi = false;
        for (i, &inst) in insts.iter().enumerate() {
            let data = func.inst(inst);
            if data.is_terminator() && i + 1 != insts.len() {
                return Err(VerifyError::MisplacedTerminator { func: name(), block: block_name() });
            }
            if data.kind.is_phi() {
                if seen_non_phi {
                    return Err(VerifyError::MisplacedPhi { func: name(), block: block_name() });
                }
            } else {
                seen_non_phi = true;
            }
            match &data.kind {
                InstKind::Alloca { .. } if b != entry => {
                    return Err(VerifyError::AllocaOutsideEntry { func: name() });
                }
                InstKind::Switch { cond, cases, .. } => {
                    let width = match func.value_type(*cond).int_width() {
                        Some(w) => w,
                        None => return Err(VerifyError::BadSwitchCondition { func: name() }),
                    };
                    if cases.iter().any(|(v, _)| mask_to_width(*v, width) != *v) {
                        return Err(VerifyError::BadSwitchCase { func: name() });
                    }
                }
                _ => {}
            }
        }
    }

    check_dominance(func, &name)?;
    Ok(())
}

fn check_dominance(
    func: &Function,
    name: &impl Fn() -> String,
) -> Result<(), VerifyError> {
    let dt = DominatorTree::new(func);

    for &b in func.block_order() {
        if !dt.is_reachable(b) {
            continue;
        }
        let insts = func.block_insts(b);
        for (use_idx, &inst) in insts.iter().enumerate() {
            let data = func.inst(inst);
            if let InstKind::Phi { incoming } = &data.kind {
                for (v, pred) in incoming {
                    if let Value::Inst(def) = v {
                        if func.try_inst(*def).is_none() {
                            return Err(VerifyError::UseBeforeDef { func: name() });
                        }
                        let def_block = func.inst(*def).block;
                        if dt.is_reachable(*pred) && !dt.dominates(def_block, *pred) {
                            return Err(VerifyError::UseNotDominated { func: name() });
                        }
                    }
                }
                continue;
            }
            for op in data.kind.operands() {
                if let Value::Inst(def) = op {
                    if func.try_inst(def).is_none() {
                        return Err(VerifyError::UseBeforeDef { func: name() });
                    }
                    let def_block = func.inst(def).block;
                    if def_block == b {
                        let def_idx = insts
                            .iter()
                            .position(|x| *x == def)
                            .ok_or_else(|| VerifyError::UseBeforeDef { func: name() })?;
                        if def_idx >= use_idx {
                            return Err(VerifyError::UseBeforeDef { func: name() });
                        }
                    } else if !dt.dominates(def_block, b) {
                        return Err(VerifyError::UseNotDominated { func: name() });
                    }
                }
            }
        }
    }
    Ok(())
}

/// Verify every function definition in a module.
pub fn verify_module(module: &Module) -> Result<(), VerifyError> {
    for (id, _) in module.functions() {
        verify_function(module, id)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Builder;
    use crate::function::{Function, Param};
    use crate::instruction::IntPredicate;
    use crate::types::Type;

    #[test]
    fn test_valid_function_passes() {
        let mut m = Module::new("m");
        let mut f = Function::new("f", Type::I32, vec![Param::new(Type::I32)]);
        let entry = f.add_block("entry");
        let mut b = Builder::at_end(&mut f, entry);
        let x = b.build_add(Value::Arg(0), b.const_i32(1));
        b.build_ret(Some(x));
        let id = m.add_function(f);
        assert!(verify_function(&m, id).is_ok());
    }

    #[test]
    fn test_missing_terminator() {
        let mut m = Module::new("m");
        let mut f = Function::new("f", Type::I32, vec![Param::new(Type::I32)]);
        let entry = f.add_block("entry");
        Builder::at_end(&mut f, entry).build_add(Value::Arg(0), Value::const_int(32, 1));
        let id = m.add_function(f);
        assert!(matches!(
            verify_function(&m, id),
            Err(VerifyError::MissingTerminator { .. })
        ));
    }

    #[test]
    fn test_use_not_dominated() {
        let mut m = Module::new("m");
        let mut f = Function::new("f", Type::I32, vec![Param::new(Type::I32)]);
        let entry = f.add_block("entry");
        let left = f.add_block("left");
        let right = f.add_block("right");
        let join = f.add_block("join");
        let mut b = Builder::at_end(&mut f, entry);
        let c = b.build_icmp(IntPredicate::SGT, Value::Arg(0), b.const_i32(0));
        b.build_cond_br(c, left, right);
        let mut b = Builder::at_end(&mut f, left);
        let only_left = b.build_add(Value::Arg(0), b.const_i32(1));
        b.build_br(join);
        Builder::at_end(&mut f, right).build_br(join);
        // Uses a value defined only on the left path.
        Builder::at_end(&mut f, join).build_ret(Some(only_left));
        let id = m.add_function(f);
        assert!(matches!(
            verify_function(&m, id),
            Err(VerifyError::UseNotDominated { .. })
        ));
    }
}
