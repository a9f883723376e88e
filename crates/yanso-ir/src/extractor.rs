//! Code Extraction
//!
//! Lifts a single-block region out of a function into a fresh
//! function, synthesizing parameters for live-in values and pointer
//! out-parameters for live-out values. The extracted function's entry
//! block is named `newFuncRoot`, and the original block is replaced by
//! a `codeRepl` block that calls the new function and branches on the
//! returned exit selector.

use indexmap::IndexSet;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::basic_block::BlockId;
use crate::builder::Builder;
use crate::function::{Function, Param};
use crate::instruction::{Callee, InstId, InstKind, IntPredicate};
use crate::module::{FuncId, Linkage, Module};
use crate::types::Type;
use crate::value::Value;

/// Extractor for a one-block region.
pub struct CodeExtractor {
    block: BlockId,
}

impl CodeExtractor {
    pub fn new(block: BlockId) -> Self {
        Self { block }
    }

    /// Whether the region can be lifted: a non-entry block without
    /// phis, allocas or invokes, ending in a plain or conditional
    /// branch whose successors carry no phis.
    pub fn is_eligible(&self, func: &Function) -> bool {
        let b = self.block;
        if func.is_declaration() || !func.block_order().contains(&b) || b == func.entry() {
            return false;
        }
        let insts = func.block_insts(b);
        if insts.is_empty() {
            return false;
        }
        for &id in insts {
            match &func.inst(id).kind {
                InstKind::Phi { .. } | InstKind::Alloca { .. } | InstKind::Invoke { .. } => {
                    return false;
                }
                _ => {}
            }
        }
        let term = match func.terminator(b) {
            Some(t) => t,
            None => return false,
        };
        if !matches!(func.inst(term).kind, InstKind::Br { .. } | InstKind::CondBr { .. }) {
            return false;
        }
        for s in func.successors(b) {
            if s == b {
                return false;
            }
            if func
                .block_insts(s)
                .iter()
                .any(|id| func.inst(*id).kind.is_phi())
            {
                return false;
            }
        }
        true
    }

    /// Lift the region into a new internal function and rewrite the
    /// caller. Returns `None` when the region is not eligible.
    pub fn extract_code_region(&self, module: &mut Module, caller_id: FuncId) -> Option<FuncId> {
        if !self.is_eligible(module.func(caller_id)) {
            return None;
        }
        let b = self.block;

        // Read everything needed out of the caller first.
        struct Cloned {
            kind: InstKind,
            ty: Type,
            name: Option<String>,
        }
        let inputs;
        let input_tys;
        let outputs;
        let output_tys;
        let body;
        let term_kind;
        let new_name;
        let block_name;
        {
            let caller = module.func(caller_id);
            let inst_ids: Vec<InstId> = caller.block_insts(b).to_vec();
            let in_block: FxHashSet<InstId> = inst_ids.iter().copied().collect();

            let mut ins: IndexSet<Value> = IndexSet::new();
            for &id in &inst_ids {
                for op in caller.inst(id).kind.operands() {
                    match op {
                        Value::Arg(_) => {
                            ins.insert(op);
                        }
                        Value::Inst(d) if !in_block.contains(&d) => {
                            ins.insert(op);
                        }
                        _ => {}
                    }
                }
            }
            let outs: Vec<InstId> = inst_ids
                .iter()
                .copied()
                .filter(|id| {
                    caller
                        .users_of(Value::Inst(*id))
                        .iter()
                        .any(|u| !in_block.contains(u))
                })
                .collect();

            let term = *inst_ids.last().unwrap();
            input_tys = ins.iter().map(|v| caller.value_type(*v)).collect::<Vec<_>>();
            output_tys = outs.iter().map(|id| caller.inst(*id).ty.clone()).collect::<Vec<_>>();
            term_kind = caller.inst(term).kind.clone();
            block_name = if caller.block(b).name.is_empty() {
                format!("bb{}", b.index())
            } else {
                caller.block(b).name.clone()
            };
            new_name = format!("{}_{}", caller.name(), block_name);
            body = inst_ids[..inst_ids.len() - 1]
                .iter()
                .map(|id| {
                    let d = caller.inst(*id);
                    (*id, Cloned { kind: d.kind.clone(), ty: d.ty.clone(), name: d.name.clone() })
                })
                .collect::<Vec<_>>();
            inputs = ins;
            outputs = outs;
        }

        let (ret_ty, exits) = match &term_kind {
            InstKind::Br { dest } => (Type::Void, vec![*dest]),
            InstKind::CondBr { if_true, if_false, .. } => (Type::I16, vec![*if_true, *if_false]),
            _ => unreachable!("eligibility checked the terminator"),
        };

        // Synthesize the extracted function.
        let mut params: Vec<Param> = input_tys.iter().cloned().map(Param::new).collect();
        for _ in &outputs {
            params.push(Param::new(Type::Ptr));
        }
        let mut nf = Function::new(new_name, ret_ty.clone(), params);
        nf.linkage = Linkage::Internal;
        let root = nf.add_block("newFuncRoot");
        let moved = nf.add_block(block_name);
        Builder::at_end(&mut nf, root).build_br(moved);

        let mut map: FxHashMap<Value, Value> = inputs
            .iter()
            .enumerate()
            .map(|(i, v)| (*v, Value::Arg(i as u32)))
            .collect();
        for (old_id, cloned) in body {
            let mut kind = cloned.kind;
            kind.for_each_operand_mut(|op| {
                if let Some(nv) = map.get(op) {
                    *op = *nv;
                }
            });
            let nid = nf.append_inst(moved, kind, cloned.ty, cloned.name);
            map.insert(Value::Inst(old_id), Value::Inst(nid));
        }
        {
            let mut bld = Builder::at_end(&mut nf, moved);
            for (k, &oid) in outputs.iter().enumerate() {
                let v = map[&Value::Inst(oid)];
                bld.build_store(v, Value::Arg((inputs.len() + k) as u32));
            }
            match &term_kind {
                InstKind::Br { .. } => {
                    bld.build_ret(None);
                }
                InstKind::CondBr { cond, .. } => {
                    let c = *map.get(cond).unwrap_or(cond);
                    let sel =
                        bld.build_select(c, Value::const_int(16, 0), Value::const_int(16, 1));
                    bld.build_ret(Some(sel));
                }
                _ => unreachable!(),
            }
        }
        let nf_id = module.add_function(nf);

        // Rewrite the caller around a codeRepl block.
        let caller = module.func_mut(caller_id);
        let entry = caller.entry();
        let slots: Vec<Value> = output_tys
            .iter()
            .map(|ty| {
                Builder::before_terminator(&mut *caller, entry).build_alloca(ty.clone(), "extract.slot")
            })
            .collect();

        let repl = caller.insert_block_before(b, "codeRepl");
        let mut call_args: Vec<Value> = inputs.iter().copied().collect();
        call_args.extend(slots.iter().copied());
        let loads;
        {
            let mut bld = Builder::at_end(caller, repl);
            let ret = bld.build_call(Callee::Func(nf_id), &call_args, ret_ty);
            loads = output_tys
                .iter()
                .zip(&slots)
                .map(|(ty, slot)| bld.build_load(ty.clone(), *slot))
                .collect::<Vec<_>>();
            match exits.as_slice() {
                [only] => {
                    bld.build_br(*only);
                }
                [t, f] => {
                    let c = bld.build_icmp(IntPredicate::EQ, ret, Value::const_int(16, 0));
                    bld.build_cond_br(c, *t, *f);
                }
                _ => unreachable!(),
            }
        }
        for (&oid, &load) in outputs.iter().zip(&loads) {
            caller.replace_all_uses_with(Value::Inst(oid), load);
        }
        for blk in caller.block_order().to_vec() {
            if blk == b {
                continue;
            }
            if let Some(t) = caller.terminator(blk) {
                caller.inst_mut(t).kind.for_each_successor_mut(|s| {
                    if *s == b {
                        *s = repl;
                    }
                });
            }
        }
        caller.erase_block(b);
        Some(nf_id)
    }
}
