//! Control-Flow Flattening
//!
//! Dissolves a function's CFG into a dispatcher loop: a `switchVar`
//! state slot selects the next original block, but the dispatcher
//! switches on an FNV hash of the state rather than the state itself.
//! Each block's case value is the hash chain iterated a random number
//! of times, so the dispatcher self-loops until the chain reaches it.
//! Block-to-block transitions recompute the state with XOR masks that
//! cancel by construction.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::{FxHashMap, FxHashSet};

use yanso_ir::ssa::fix_stack;
use yanso_ir::{BlockId, Builder, FuncId, Function, InstKind, Module, Type};

use crate::numeric::{fnv_hash, FNV_BASIS, FNV_PRIME};
use crate::pass::{pass_rng, FunctionPass, Pass, PassResult};

pub struct Flattening {
    rng: StdRng,
}

impl Flattening {
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

impl Default for Flattening {
    fn default() -> Self {
        Self::new()
    }
}

impl Pass for Flattening {
    fn name(&self) -> &'static str {
        "flattening"
    }

    fn description(&self) -> &'static str {
        "Call graph flattening"
    }
}

impl FunctionPass for Flattening {
    fn run_on_function(&mut self, module: &mut Module, func: FuncId) -> PassResult<bool> {
        Ok(flatten(module.func_mut(func), &mut self.rng))
    }
}

struct BlockState {
    idx: u32,
    hash: u32,
}

fn flatten(func: &mut Function, rng: &mut StdRng) -> bool {
    if func.is_declaration() || func.num_blocks() < 2 {
        return false;
    }
    if func.has_invoke() {
        return false;
    }
    // Multi-way terminators are expected to have been lowered to
    // conditional branches before this pass runs.
    for &b in func.block_order() {
        match func.terminator(b) {
            None => return false,
            Some(t) => {
                if matches!(func.inst(t).kind, InstKind::Switch { .. }) {
                    return false;
                }
            }
        }
    }

    let entry = func.entry();
    if func.successors(entry).is_empty() {
        return false;
    }
    let mut orig: Vec<BlockId> = func.block_order()[1..].to_vec();

    // An entry that branches conditionally keeps only the straight-line
    // prefix; the branch moves into a new "first" block.
    if func.successors(entry).len() > 1 {
        let at = func.block_insts(entry).len() - 1;
        let first = func.split_block(entry, at, "first");
        orig.insert(0, first);
    }
    let entry_succ = func.successors(entry)[0];
    if entry_succ == entry {
        return false;
    }

    let states = assign_states(rng, &orig);

    // Rebuild the entry: state slots, then a jump into the dispatcher.
    func.erase_terminator(entry);
    let loop_entry = func.insert_block_after(entry, "loopEntry");
    let (switch_var, hash_var) = {
        let mut b = Builder::at_end(func, entry);
        let sv = b.build_alloca(Type::I32, "switchVar");
        let hv = b.build_alloca(Type::I32, "hashVar");
        b.build_store(b.const_i32(states[&entry_succ].idx), sv);
        b.build_store(b.const_i32(FNV_BASIS), hv);
        b.build_br(loop_entry);
        (sv, hv)
    };

    // Dispatcher: one FNV round over the state, stored back so the
    // default self-loop iterates the chain.
    let dispatch = {
        let mut b = Builder::at_end(func, loop_entry);
        let sv = b.build_load(Type::I32, switch_var);
        let hv = b.build_load(Type::I32, hash_var);
        let mut h = hv;
        let mut d = sv;
        for lane in 0..4 {
            let byte = b.build_and(d, b.const_i32(0xFF));
            let mixed = b.build_xor(h, byte);
            h = b.build_mul(mixed, b.const_i32(FNV_PRIME));
            if lane < 3 {
                d = b.build_lshr(d, b.const_i32(8));
            }
        }
        b.build_store(h, hash_var);
        b.build_switch(h, loop_entry, Vec::new())
    };

    let mut shuffled = orig.clone();
    for i in (1..shuffled.len()).rev() {
        shuffled.swap(i, rng.gen_range(0..=i));
    }
    for &bb in &shuffled {
        func.switch_add_case(dispatch, states[&bb].hash as u64, bb);
        func.move_block_after(bb, loop_entry);
    }

    // Replace each block's terminator with a state update.
    for &bb in &orig {
        let succs = func.successors(bb);
        match succs.len() {
            0 => continue,
            1 => {
                let s = succs[0];
                func.erase_terminator(bb);
                let mut b = Builder::at_end(func, bb);
                let r: u32 = rng.gen();
                let load = b.build_load(Type::I32, switch_var);
                let masked = b.build_xor(load, b.const_i32(r));
                let mut state =
                    b.build_xor(masked, b.const_i32(r ^ states[&bb].idx ^ states[&s].idx));
                if rng.gen_bool(0.5) {
                    if let Some(noise) = pick_other(rng, &orig, &[s]) {
                        let zero =
                            b.build_and(b.const_i32(states[&noise].idx), b.const_i32(0));
                        state = b.build_xor(state, zero);
                    }
                }
                b.build_store(state, switch_var);
                b.build_store(b.const_i32(FNV_BASIS), hash_var);
                b.build_br(loop_entry);
            }
            2 => {
                let term = func.terminator(bb).unwrap();
                let cond = match &func.inst(term).kind {
                    InstKind::CondBr { cond, .. } => *cond,
                    _ => return false,
                };
                let (on_true, on_false) = (succs[0], succs[1]);
                func.erase_terminator(bb);
                let mut b = Builder::at_end(func, bb);
                let r: u32 = rng.gen();
                let diff = states[&on_true].idx ^ states[&on_false].idx;
                let wide = b.build_sext(cond, Type::I32);
                let mask = b.build_and(wide, b.const_i32(diff));
                let load = b.build_load(Type::I32, switch_var);
                let noise = b.build_xor(load, b.const_i32(r));
                let mixed = b.build_xor(noise, mask);
                let mut state = b.build_xor(
                    mixed,
                    b.const_i32(r ^ states[&bb].idx ^ states[&on_false].idx),
                );
                if rng.gen_bool(0.5) {
                    if let Some(extra) = pick_other(rng, &orig, &[on_true, on_false]) {
                        let zero =
                            b.build_and(b.const_i32(states[&extra].idx), b.const_i32(0));
                        state = b.build_xor(state, zero);
                    }
                }
                b.build_store(state, switch_var);
                b.build_store(b.const_i32(FNV_BASIS), hash_var);
                b.build_br(loop_entry);
            }
            _ => return false,
        }
    }

    fix_stack(func);
    true
}

fn pick_other(rng: &mut StdRng, blocks: &[BlockId], avoid: &[BlockId]) -> Option<BlockId> {
    let candidates: Vec<BlockId> = blocks
        .iter()
        .copied()
        .filter(|b| !avoid.contains(b))
        .collect();
    if candidates.is_empty() {
        None
    } else {
        Some(candidates[rng.gen_range(0..candidates.len())])
    }
}

/// Pick a distinct state and hash for every block. The hash is the
/// FNV chain of the state iterated k times from the basis; no chain
/// prefix may collide with any case value, or the dispatcher would
/// route early. Exhausting the retry budget is a bug, not an input
/// error.
fn assign_states(rng: &mut StdRng, blocks: &[BlockId]) -> FxHashMap<BlockId, BlockState> {
    let mut used_idx: FxHashSet<u32> = FxHashSet::default();
    let mut case_values: FxHashSet<u32> = FxHashSet::default();
    let mut intermediates: FxHashSet<u32> = FxHashSet::default();
    let mut out = FxHashMap::default();

    for &b in blocks {
        let mut placed = false;
        for _ in 0..1000 {
            let idx: u32 = rng.gen();
            if used_idx.contains(&idx) {
                continue;
            }
            let k: usize = rng.gen_range(1..=1000);
            let mut h = FNV_BASIS;
            let mut chain = Vec::with_capacity(k);
            for _ in 0..k {
                h = fnv_hash(idx, h);
                chain.push(h);
            }
            let hash = *chain.last().unwrap();
            let prefix = &chain[..k - 1];
            let clash = case_values.contains(&hash)
                || intermediates.contains(&hash)
                || prefix
                    .iter()
                    .any(|v| case_values.contains(v) || *v == hash);
            if clash {
                continue;
            }
            used_idx.insert(idx);
            case_values.insert(hash);
            intermediates.extend(prefix.iter().copied());
            out.insert(b, BlockState { idx, hash });
            placed = true;
            break;
        }
        assert!(placed, "could not find a collision-free dispatch hash");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use yanso_ir::interp::Interpreter;
    use yanso_ir::value::mask_to_width;
    use yanso_ir::verify::verify_function;
    use yanso_ir::{IntPredicate, Param, Value};

    /// int f(int x) { if (x > 0) return x + 1; else return x - 1; }
    fn branchy_module() -> Module {
        let mut m = Module::new("m");
        let mut f = Function::new("f", Type::I32, vec![Param::new(Type::I32)]);
        let entry = f.add_block("entry");
        let pos = f.add_block("pos");
        let neg = f.add_block("neg");
        let mut b = Builder::at_end(&mut f, entry);
        let c = b.build_icmp(IntPredicate::SGT, Value::Arg(0), b.const_i32(0));
        b.build_cond_br(c, pos, neg);
        let mut b = Builder::at_end(&mut f, pos);
        let v = b.build_add(Value::Arg(0), b.const_i32(1));
        b.build_ret(Some(v));
        let mut b = Builder::at_end(&mut f, neg);
        let v = b.build_sub(Value::Arg(0), b.const_i32(1));
        b.build_ret(Some(v));
        m.add_function(f);
        m
    }

    fn run_f(m: &Module, x: i64) -> i64 {
        let mut interp = Interpreter::new(m);
        let out = interp
            .call_by_name("f", &[mask_to_width(x as u64, 32)])
            .unwrap()
            .unwrap();
        yanso_ir::value::sign_extend(out, 32)
    }

    #[test]
    fn test_flatten_preserves_behavior() {
        for seed in [1u64, 7, 42] {
            let mut m = branchy_module();
            let fid = m.get_function("f").unwrap();
            let mut pass = Flattening::seeded(seed);
            assert!(pass.run_on_function(&mut m, fid).unwrap());
            verify_function(&m, fid).unwrap();
            assert_eq!(run_f(&m, 5), 6);
            assert_eq!(run_f(&m, -3), -4);
            assert_eq!(run_f(&m, 0), -1);
        }
    }

    #[test]
    fn test_dispatcher_shape() {
        let mut m = branchy_module();
        let fid = m.get_function("f").unwrap();
        let before_blocks = m.func(fid).num_blocks();
        Flattening::seeded(3).run_on_function(&mut m, fid).unwrap();
        let f = m.func(fid);

        // Exactly one switch block, and it is the entry's successor.
        let switches: Vec<BlockId> = f
            .block_order()
            .iter()
            .copied()
            .filter(|b| {
                matches!(
                    f.terminator(*b).map(|t| &f.inst(t).kind),
                    Some(InstKind::Switch { .. })
                )
            })
            .collect();
        assert_eq!(switches.len(), 1);
        let dispatcher = switches[0];
        assert_eq!(f.successors(f.entry()).as_slice(), &[dispatcher]);

        // The dispatcher self-loops by default and covers the original
        // blocks plus the split-off entry branch.
        let term = f.terminator(dispatcher).unwrap();
        if let InstKind::Switch { default, cases, .. } = &f.inst(term).kind {
            assert_eq!(*default, dispatcher);
            assert_eq!(cases.len(), before_blocks); // pos, neg, first
        } else {
            unreachable!();
        }

        // Every case block routes back to the dispatcher or returns.
        if let InstKind::Switch { cases, .. } = &f.inst(term).kind {
            for (_, dest) in cases {
                match &f.inst(f.terminator(*dest).unwrap()).kind {
                    InstKind::Br { dest } => assert_eq!(*dest, dispatcher),
                    InstKind::Ret { .. } => {}
                    other => panic!("unexpected terminator {:?}", other.opcode_name()),
                }
            }
        }
    }

    #[test]
    fn test_single_block_function_is_skipped() {
        let mut m = Module::new("m");
        let mut f = Function::new("f", Type::I32, vec![Param::new(Type::I32)]);
        let entry = f.add_block("entry");
        Builder::at_end(&mut f, entry).build_ret(Some(Value::Arg(0)));
        let fid = m.add_function(f);
        assert!(!Flattening::seeded(0).run_on_function(&mut m, fid).unwrap());
    }

    #[test]
    fn test_unlowered_switch_is_skipped() {
        let mut m = Module::new("m");
        let mut f = Function::new("f", Type::I32, vec![Param::new(Type::I32)]);
        let entry = f.add_block("entry");
        let dispatch = f.add_block("dispatch");
        let one = f.add_block("one");
        let other = f.add_block("other");
        Builder::at_end(&mut f, entry).build_br(dispatch);
        Builder::at_end(&mut f, dispatch).build_switch(
            Value::Arg(0),
            other,
            vec![(1, one)],
        );
        let mut b = Builder::at_end(&mut f, one);
        let v = b.build_add(Value::Arg(0), b.const_i32(10));
        b.build_ret(Some(v));
        Builder::at_end(&mut f, other).build_ret(Some(Value::Arg(0)));
        let fid = m.add_function(f);

        let before = m.func(fid).inst_count();
        assert!(!Flattening::seeded(0).run_on_function(&mut m, fid).unwrap());
        assert_eq!(m.func(fid).inst_count(), before);
    }

    #[test]
    fn test_state_hashes_are_unique() {
        let mut rng = StdRng::seed_from_u64(9);
        let blocks: Vec<BlockId> = (0..64).map(BlockId).collect();
        let states = assign_states(&mut rng, &blocks);
        let hashes: FxHashSet<u32> = states.values().map(|s| s.hash).collect();
        assert_eq!(hashes.len(), blocks.len());
        let idxs: FxHashSet<u32> = states.values().map(|s| s.idx).collect();
        assert_eq!(idxs.len(), blocks.len());
    }
}
