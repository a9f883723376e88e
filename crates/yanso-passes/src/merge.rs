//! Function Merging
//!
//! Fuses the module's internal functions into one dispatcher keyed by
//! a random 32-bit id per source. The merged signature pools
//! parameters: a shared bank of i32 slots, a shared bank of i64 slots
//! (pointers travel through them via ptrtoint/inttoptr), and a
//! concatenated tail for everything else. Every call site is
//! rewritten to the pooled layout, the dispatcher re-calls each source
//! with its slice restored, the calls are inlined, and dead sources
//! are erased.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashSet;

use yanso_ir::inliner::inline_call;
use yanso_ir::{
    Builder, Callee, FuncId, Function, InstId, InstKind, Linkage, Module, Param, Type, Value,
};

use crate::pass::{pass_rng, ModulePass, Pass, PassResult};

pub struct Merge {
    rng: StdRng,
}

impl Merge {
    pub fn new() -> Self {
        Self { rng: pass_rng() }
    }

    pub fn with_rng(rng: StdRng) -> Self {
        Self { rng }
    }

    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }
}

impl Default for Merge {
    fn default() -> Self {
        Self::new()
    }
}

impl Pass for Merge {
    fn name(&self) -> &'static str {
        "merge"
    }

    fn description(&self) -> &'static str {
        "Merge static functions"
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum SlotClass {
    I32,
    I64,
    Other,
}

fn classify(ty: &Type) -> SlotClass {
    match ty {
        Type::Int(32) => SlotClass::I32,
        Type::Int(64) | Type::Ptr => SlotClass::I64,
        _ => SlotClass::Other,
    }
}

fn count_class(f: &Function, class: SlotClass) -> usize {
    f.params().iter().filter(|p| classify(&p.ty) == class).count()
}

impl ModulePass for Merge {
    fn run_on_module(&mut self, module: &mut Module) -> PassResult<bool> {
        let merge_list: Vec<FuncId> = module
            .functions()
            .filter(|(_, f)| {
                f.linkage == Linkage::Internal
                    && !f.is_var_arg
                    && !f.is_declaration()
                    && (f.ret_ty().is_int_or_ptr() || f.ret_ty().is_void())
            })
            .map(|(id, _)| id)
            .collect();
        if merge_list.len() < 2 {
            return Ok(false);
        }

        // Pooled layout: widest return, shared i32/i64 banks, a
        // concatenated tail of everything else.
        let mut ret_bits = 64u32;
        let mut ni32 = 0usize;
        let mut ni64 = 0usize;
        let mut other_tys: Vec<Type> = Vec::new();
        let mut other_offsets: Vec<usize> = Vec::new();
        let mut merged_name = String::new();
        for &src in &merge_list {
            let f = module.func(src);
            if let Some(w) = f.ret_ty().int_width() {
                ret_bits = ret_bits.max(w);
            }
            ni32 = ni32.max(count_class(f, SlotClass::I32));
            ni64 = ni64.max(count_class(f, SlotClass::I64));
            other_offsets.push(other_tys.len());
            for p in f.params() {
                if classify(&p.ty) == SlotClass::Other {
                    other_tys.push(p.ty.clone());
                }
            }
            merged_name.push_str(f.name());
            merged_name.push('.');
        }
        merged_name.push_str("merge");
        let ret_ty = Type::Int(ret_bits);

        let mut params = vec![Param::new(Type::I32)];
        params.extend((0..ni32).map(|_| Param::new(Type::I32)));
        params.extend((0..ni64).map(|_| Param::new(Type::I64)));
        params.extend(other_tys.iter().cloned().map(Param::new));
        let mut merged_fn = Function::new(merged_name, ret_ty.clone(), params);
        merged_fn.linkage = Linkage::Internal;
        let merged = module.add_function(merged_fn);

        let mut func_ids: Vec<u32> = Vec::new();
        let mut seen = FxHashSet::default();
        for _ in &merge_list {
            let mut id: u32 = self.rng.gen();
            while !seen.insert(id) {
                id = self.rng.gen();
            }
            func_ids.push(id);
        }

        // Rewrite every call site to the pooled layout.
        for (i, &src) in merge_list.iter().enumerate() {
            self.rewrite_call_sites(
                module,
                src,
                merged,
                func_ids[i],
                ret_bits,
                ni32,
                ni64,
                &other_tys,
                other_offsets[i],
            );
        }

        // Dispatcher body: entry -> switch on the tag.
        let entry = module.func_mut(merged).add_block("entry");
        let switch_block = module.func_mut(merged).add_block("switch");
        Builder::at_end(module.func_mut(merged), entry).build_br(switch_block);
        let dispatch = Builder::at_end(module.func_mut(merged), switch_block).build_switch(
            Value::Arg(0),
            switch_block,
            Vec::new(),
        );

        for (i, &src) in merge_list.iter().enumerate() {
            let src_params: Vec<Type> =
                module.func(src).params().iter().map(|p| p.ty.clone()).collect();
            let src_ret = module.func(src).ret_ty().clone();

            let f = module.func_mut(merged);
            let case_block = f.insert_block_before(switch_block, "");
            let call = {
                let mut b = Builder::at_end(f, case_block);
                let mut c32 = 0usize;
                let mut c64 = 0usize;
                let mut cot = 0usize;
                let mut args: Vec<Value> = Vec::with_capacity(src_params.len());
                for ty in &src_params {
                    let v = match classify(ty) {
                        SlotClass::I32 => {
                            c32 += 1;
                            Value::Arg(c32 as u32)
                        }
                        SlotClass::I64 => {
                            let slot = Value::Arg((1 + ni32 + c64) as u32);
                            c64 += 1;
                            if ty.is_pointer() {
                                b.build_int_to_ptr(slot)
                            } else {
                                slot
                            }
                        }
                        SlotClass::Other => {
                            let slot =
                                Value::Arg((1 + ni32 + ni64 + other_offsets[i] + cot) as u32);
                            cot += 1;
                            slot
                        }
                    };
                    args.push(v);
                }
                let call = b.build_call(Callee::Func(src), &args, src_ret.clone());
                if src_ret.is_void() {
                    b.build_ret(Some(Value::const_int(ret_bits, 0)));
                } else if src_ret.is_pointer() {
                    let as_int = b.build_ptr_to_int(call, ret_ty.clone());
                    b.build_ret(Some(as_int));
                } else {
                    let widened = b.build_int_cast(call, ret_ty.clone(), false);
                    b.build_ret(Some(widened));
                }
                call
            };
            module
                .func_mut(merged)
                .switch_add_case(dispatch, func_ids[i] as u64, case_block);
            inline_call(module, merged, call.inst_id().unwrap());

            if module.function_has_users(src) {
                tracing::warn!(function = module.func(src).name(), "not dead yet");
            } else {
                module.erase_function(src);
            }
        }
        Ok(true)
    }
}

impl Merge {
    #[allow(clippy::too_many_arguments)]
    fn rewrite_call_sites(
        &mut self,
        module: &mut Module,
        src: FuncId,
        merged: FuncId,
        tag: u32,
        ret_bits: u32,
        ni32: usize,
        ni64: usize,
        other_tys: &[Type],
        other_offset: usize,
    ) {
        // Direct calls rewrite; anything else is reported and kept.
        let mut sites: Vec<(FuncId, InstId)> = Vec::new();
        for (fid, f) in module.functions() {
            if fid == merged {
                continue;
            }
            for inst in f.inst_ids() {
                match &f.inst(inst).kind {
                    InstKind::Call { callee: Callee::Func(c), .. } if *c == src => {
                        sites.push((fid, inst));
                    }
                    kind if kind.operands().contains(&Value::Func(src)) => {
                        tracing::warn!(
                            function = f.name(),
                            user = kind.opcode_name(),
                            "not a call instruction use"
                        );
                    }
                    _ => {}
                }
            }
        }

        let src_ret = module.func(src).ret_ty().clone();
        let src_param_tys: Vec<Type> =
            module.func(src).params().iter().map(|p| p.ty.clone()).collect();
        for (fid, call) in sites {
            let actuals: Vec<Value> = match &module.func(fid).inst(call).kind {
                InstKind::Call { args, .. } => args.to_vec(),
                _ => unreachable!(),
            };
            let f = module.func_mut(fid);
            let replacement = {
                let mut b = Builder::before(f, call);
                let mut slot32: Vec<Value> = (0..ni32).map(|_| b.const_i32(0)).collect();
                let mut slot64: Vec<Value> = (0..ni64).map(|_| b.const_i64(0)).collect();
                let mut slot_other: Vec<Value> =
                    other_tys.iter().map(|ty| b.const_zero(ty)).collect();
                let mut c32 = 0usize;
                let mut c64 = 0usize;
                let mut cot = 0usize;
                for (ty, actual) in src_param_tys.iter().zip(&actuals) {
                    match classify(ty) {
                        SlotClass::I32 => {
                            slot32[c32] = *actual;
                            c32 += 1;
                        }
                        SlotClass::I64 => {
                            slot64[c64] = if ty.is_pointer() {
                                b.build_ptr_to_int(*actual, Type::I64)
                            } else {
                                *actual
                            };
                            c64 += 1;
                        }
                        SlotClass::Other => {
                            slot_other[other_offset + cot] = *actual;
                            cot += 1;
                        }
                    }
                }
                let mut args = vec![Value::const_int(32, tag as u64)];
                args.extend(slot32);
                args.extend(slot64);
                args.extend(slot_other);
                let new_call = b.build_call(
                    Callee::Func(merged),
                    &args,
                    Type::Int(ret_bits),
                );
                if src_ret.is_void() {
                    None
                } else if src_ret.is_pointer() {
                    Some(b.build_cast(yanso_ir::CastOp::IntToPtr, new_call, Type::Ptr))
                } else if src_ret.int_width().unwrap() < ret_bits {
                    Some(b.build_trunc(new_call, src_ret.clone()))
                } else {
                    Some(new_call)
                }
            };
            if let Some(replacement) = replacement {
                f.replace_all_uses_with(Value::Inst(call), replacement);
            }
            f.erase_inst(call);
        }
    }
}
