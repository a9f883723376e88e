//! Block Shuffle & Bogus-Edge Injection
//!
//! Splits every sizeable non-entry block in half, shuffles the halves
//! in memory, and replaces each upper half's fall-through branch with
//! a switch: the default case is a freshly minted garbage block
//! (inline-asm junk plus `unreachable`), the real successor hides
//! behind an MBA-built case value, and random lower halves show up as
//! bogus cases that are never taken.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashSet;

use yanso_ir::ssa::fix_stack;
use yanso_ir::{
    BinOp, BlockId, Builder, Callee, FuncId, Function, InlineAsm, Module, Type, Value,
};

use crate::pass::{pass_rng, FunctionPass, Pass, PassResult};

pub struct Connect {
    rng: StdRng,
}

impl Connect {
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

impl Default for Connect {
    fn default() -> Self {
        Self::new()
    }
}

impl Pass for Connect {
    fn name(&self) -> &'static str {
        "connect"
    }

    fn description(&self) -> &'static str {
        "Split & connect basic blocks & add garbage blocks"
    }
}

impl FunctionPass for Connect {
    fn run_on_function(&mut self, module: &mut Module, func: FuncId) -> PassResult<bool> {
        Ok(connect(module.func_mut(func), &mut self.rng))
    }
}

fn connect(func: &mut Function, rng: &mut StdRng) -> bool {
    if func.is_declaration() || func.has_invoke() {
        return false;
    }

    // Split every non-entry block with at least 4 instructions past
    // the first insertion point.
    let candidates: Vec<BlockId> = func.block_order()[1..].to_vec();
    let mut upper: Vec<BlockId> = Vec::new();
    let mut lower: Vec<BlockId> = Vec::new();
    let mut all: Vec<BlockId> = Vec::new();
    for b in candidates {
        let first = func.first_insertion_pt(b);
        let size = func.block_insts(b).len() - first;
        if size < 4 {
            continue;
        }
        let nb = func.split_block(b, first + size / 2, "");
        upper.push(b);
        lower.push(nb);
        all.push(b);
        all.push(nb);
    }

    if upper.is_empty() {
        return false;
    }
    if upper.len() == 1 {
        return true;
    }

    // Shuffle memory layout only.
    let mut shuffled = all.clone();
    for i in (1..shuffled.len()).rev() {
        shuffled.swap(i, rng.gen_range(0..=i));
    }
    for (num, &b) in all.iter().enumerate() {
        if b != shuffled[num] {
            func.move_block_before(b, shuffled[num]);
        }
    }

    let bogus_denom = std::cmp::max(1, lower.len() / 4) as u32;
    for (num, &b) in upper.iter().enumerate() {
        let dest = func.successors(b)[0];
        func.erase_terminator(b);

        // Garbage default: junk bytes the disassembler chokes on.
        let garbage = func.insert_block_before(shuffled[num], "");
        {
            let mut bld = Builder::at_end(func, garbage);
            bld.build_call(
                Callee::Asm(InlineAsm {
                    asm: ".byte 0xEB".to_string(),
                    constraints: String::new(),
                    has_side_effects: true,
                }),
                &[],
                Type::Void,
            );
            bld.build_unreachable();
        }

        // Pick distinct case values: one real, some bogus.
        let mut taken: FxHashSet<u32> = FxHashSet::default();
        let real_case: u32 = rng.gen();
        taken.insert(real_case);
        let mut cases: Vec<(u64, BlockId)> = vec![(real_case as u64, dest)];
        for &j in &lower {
            if j == dest || rng.gen_range(0..bogus_denom) != 0 {
                continue;
            }
            let mut v: u32 = rng.gen();
            while !taken.insert(v) {
                v = rng.gen();
            }
            cases.push((v as u64, j));
        }

        // The condition is an MBA chain that computes the real case
        // value from constants.
        let mut bld = Builder::at_end(func, b);
        let r: u32 = rng.gen();
        let mut cond = bld.build_xor(bld.const_i32(real_case ^ r), bld.const_i32(r));
        for _ in 0..rng.gen_range(1..=3) {
            cond = match rng.gen_range(0..8) {
                0 => bld.build_binop(BinOp::Add, cond, bld.const_i32(0)),
                1 => bld.build_binop(BinOp::Or, cond, bld.const_i32(0)),
                2 => bld.build_binop(BinOp::Xor, cond, bld.const_i32(0)),
                3 => bld.build_binop(BinOp::Shl, cond, bld.const_i32(0)),
                4 => bld.build_binop(BinOp::LShr, cond, bld.const_i32(0)),
                5 => bld.build_binop(BinOp::Mul, cond, bld.const_i32(1)),
                6 => bld.build_binop(BinOp::UDiv, cond, bld.const_i32(1)),
                _ => bld.build_binop(BinOp::SDiv, cond, bld.const_i32(1)),
            };
        }
        bld.build_switch(cond, garbage, cases);
    }

    fix_stack(func);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use yanso_ir::interp::Interpreter;
    use yanso_ir::verify::verify_function;
    use yanso_ir::{InstKind, IntPredicate, Param};

    /// int g(int *p, int n) { s = 0; for (i = 0; i < n; i++) s += p[i]; return s; }
    fn sum_module() -> Module {
        let mut m = Module::new("m");
        let mut f = Function::new(
            "g",
            Type::I32,
            vec![Param::new(Type::Ptr), Param::new(Type::I32)],
        );
        let entry = f.add_block("entry");
        let header = f.add_block("header");
        let body = f.add_block("body");
        let exit = f.add_block("exit");
        let mut b = Builder::at_end(&mut f, entry);
        let s = b.build_alloca(Type::I32, "s");
        let i = b.build_alloca(Type::I32, "i");
        b.build_store(b.const_i32(0), s);
        b.build_store(b.const_i32(0), i);
        b.build_br(header);
        let mut b = Builder::at_end(&mut f, header);
        let iv = b.build_load(Type::I32, i);
        let c = b.build_icmp(IntPredicate::SLT, iv, Value::Arg(1));
        b.build_cond_br(c, body, exit);
        let mut b = Builder::at_end(&mut f, body);
        let iv = b.build_load(Type::I32, i);
        let slot = b.build_gep(Type::I32, Value::Arg(0), &[iv]);
        let elem = b.build_load(Type::I32, slot);
        let sv = b.build_load(Type::I32, s);
        let sum = b.build_add(sv, elem);
        b.build_store(sum, s);
        let inext = b.build_add(iv, b.const_i32(1));
        b.build_store(inext, i);
        b.build_br(header);
        let mut b = Builder::at_end(&mut f, exit);
        let sv = b.build_load(Type::I32, s);
        let t = b.build_add(sv, b.const_i32(0));
        let t = b.build_xor(t, b.const_i32(0));
        let t = b.build_or(t, b.const_i32(0));
        b.build_ret(Some(t));
        m.add_function(f);
        m
    }

    fn sum_of(m: &Module) -> u64 {
        let mut interp = Interpreter::new(m);
        let mut bytes = Vec::new();
        for v in [1i32, 2, 3, 4] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let p = interp.alloc_bytes(&bytes);
        interp.call_by_name("g", &[p, 4]).unwrap().unwrap()
    }

    #[test]
    fn test_connect_preserves_behavior() {
        for seed in [2u64, 11, 99] {
            let mut m = sum_module();
            let fid = m.get_function("g").unwrap();
            assert!(Connect::seeded(seed).run_on_function(&mut m, fid).unwrap());
            verify_function(&m, fid).unwrap();
            assert_eq!(sum_of(&m), 10);
        }
    }

    #[test]
    fn test_split_blocks_end_in_switch_with_garbage_default() {
        let mut m = sum_module();
        let fid = m.get_function("g").unwrap();
        Connect::seeded(5).run_on_function(&mut m, fid).unwrap();
        let f = m.func(fid);

        let mut switches = 0;
        for &b in f.block_order() {
            if let Some(t) = f.terminator(b) {
                if let InstKind::Switch { default, .. } = &f.inst(t).kind {
                    switches += 1;
                    // Default block is junk: inline asm then unreachable.
                    let junk = f.block_insts(*default);
                    assert!(matches!(
                        f.inst(*junk.last().unwrap()).kind,
                        InstKind::Unreachable
                    ));
                    assert!(junk.iter().any(|i| matches!(
                        &f.inst(*i).kind,
                        InstKind::Call { callee: Callee::Asm(_), .. }
                    )));
                }
            }
        }
        // body and header were big enough to split; each upper half
        // got a switch.
        assert_eq!(switches, 2);

        // No direct branch from an upper half survives: the only plain
        // branches left come from lower halves.
        verify_function(&m, fid).unwrap();
    }

    #[test]
    fn test_too_small_to_split_reports_no_change() {
        let mut m = Module::new("m");
        let mut f = Function::new("tiny", Type::I32, vec![Param::new(Type::I32)]);
        let entry = f.add_block("entry");
        let exit = f.add_block("exit");
        Builder::at_end(&mut f, entry).build_br(exit);
        Builder::at_end(&mut f, exit).build_ret(Some(Value::Arg(0)));
        let fid = m.add_function(f);
        assert!(!Connect::seeded(1).run_on_function(&mut m, fid).unwrap());
    }
}
