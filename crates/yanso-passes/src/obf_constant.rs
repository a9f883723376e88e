//! Constant Obfuscation
//!
//! Two layers over every function:
//!
//! 1. Non-zero integer constants `v` are split into
//!    `trunc((r + 0) * (r' * v ^ 0))` with `r` random odd and `r'` its
//!    inverse mod 2^64. The two identity operations keep naive
//!    constant folders from collapsing the product.
//! 2. Literal zeroes are rebuilt from live integer values using MBA
//!    identities, drawing candidates from the function arguments, the
//!    single-predecessor chain and earlier instructions in the block.
//!    Only pre-pass instructions seed the candidate set; values the
//!    pass itself creates are registered as they appear, so later
//!    zeroes can reuse them, but freshly materialized constants never
//!    recurse.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashSet;

use yanso_ir::{
    BlockId, Builder, Callee, FuncId, Function, InstId, InstKind, IntPredicate, Module, Type,
    Value,
};

use crate::numeric::{modinv, rand_prime};
use crate::pass::{pass_rng, FunctionPass, Pass, PassResult};

pub struct ObfuscateConstant {
    rng: StdRng,
    integers: Vec<Value>,
    original: FxHashSet<InstId>,
}

impl ObfuscateConstant {
    pub fn new() -> Self {
        Self::with_rng(pass_rng())
    }

    pub fn with_rng(rng: StdRng) -> Self {
        Self { rng, integers: Vec::new(), original: FxHashSet::default() }
    }

    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }
}

impl Default for ObfuscateConstant {
    fn default() -> Self {
        Self::new()
    }
}

impl Pass for ObfuscateConstant {
    fn name(&self) -> &'static str {
        "obfCon"
    }

    fn description(&self) -> &'static str {
        "Split and obfuscate constants"
    }
}

fn is_valid_candidate(kind: &InstKind) -> bool {
    !matches!(kind, InstKind::Gep { .. } | InstKind::Ret { .. })
}

/// Operand count to visit: switches expose only their condition.
fn visited_operands(kind: &InstKind) -> usize {
    match kind {
        InstKind::Switch { .. } => 1,
        other => other.operands().len(),
    }
}

fn const_int_of(v: Value) -> Option<(u32, u64)> {
    match v {
        Value::Const(yanso_ir::Constant::Int { bits, value }) => Some((bits, value)),
        _ => None,
    }
}

impl FunctionPass for ObfuscateConstant {
    fn run_on_function(&mut self, module: &mut Module, func: FuncId) -> PassResult<bool> {
        let mut modified = false;
        if module.func(func).is_declaration() {
            return Ok(modified);
        }

        // Seed the original-instruction set before anything is added.
        self.original.clear();
        {
            let f = module.func(func);
            for &b in f.block_order() {
                for &id in &f.block_insts(b)[f.first_insertion_pt(b)..] {
                    if f.inst(id).ty.is_integer() {
                        self.original.insert(id);
                    }
                }
            }
        }

        for block in module.func(func).block_order().to_vec() {
            modified |= self.split_constants_in_block(module, func, block);
            modified |= self.replace_zeroes_in_block(module, func, block);
        }
        Ok(modified)
    }
}

impl ObfuscateConstant {
    fn split_constants_in_block(
        &mut self,
        module: &mut Module,
        func: FuncId,
        block: BlockId,
    ) -> bool {
        let mut modified = false;
        let snapshot: Vec<InstId> = {
            let f = module.func(func);
            f.block_insts(block)[f.first_insertion_pt(block)..].to_vec()
        };
        for inst in snapshot {
            let (count, immarg_stop) = {
                let f = module.func(func);
                let kind = &f.inst(inst).kind;
                if !is_valid_candidate(kind) {
                    continue;
                }
                let stop = match kind {
                    InstKind::Call { callee: Callee::Func(callee), .. } => module
                        .func(*callee)
                        .params()
                        .iter()
                        .position(|p| p.immarg),
                    _ => None,
                };
                (visited_operands(kind), stop)
            };
            for i in 0..count {
                if immarg_stop.is_some_and(|stop| i >= stop) {
                    break;
                }
                let operand = module.func(func).inst(inst).kind.operands()[i];
                let Some((bits, v)) = const_int_of(operand) else { continue };
                if v == 0 || v == u64::MAX {
                    continue;
                }
                let replacement = self.split_const(module.func_mut(func), inst, bits, v);
                module.func_mut(func).inst_mut(inst).kind.set_operand(i, replacement);
                modified = true;
            }
        }
        modified
    }

    /// `v == (r + 0) * (modinv(r)*v ^ 0)` mod 2^64, truncated back.
    fn split_const(&mut self, f: &mut Function, inst: InstId, bits: u32, v: u64) -> Value {
        let r = self.rng.gen_range(0..=(u64::MAX >> 1) - 1) * 2 + 1;
        let mut b = Builder::before(f, inst);
        let rv1 = b.build_add(b.const_i64(r), b.const_i64(0));
        let rv2 = b.build_xor(b.const_i64(modinv(r).wrapping_mul(v)), b.const_i64(0));
        let product = b.build_mul(rv1, rv2);
        b.build_int_cast(product, Type::Int(bits), true)
    }

    fn replace_zeroes_in_block(
        &mut self,
        module: &mut Module,
        func: FuncId,
        block: BlockId,
    ) -> bool {
        let mut modified = false;
        self.integers.clear();

        // Live values from the single-predecessor chain, original
        // instructions only.
        {
            let f = module.func(func);
            let mut seen: FxHashSet<BlockId> = FxHashSet::default();
            seen.insert(block);
            let mut pred = f.single_predecessor(block);
            while let Some(p) = pred {
                if !seen.insert(p) {
                    break;
                }
                for &id in &f.block_insts(p)[f.first_insertion_pt(p)..] {
                    if self.original.contains(&id) {
                        self.register(Value::Inst(id), &f.inst(id).ty);
                    }
                }
                pred = f.single_predecessor(p);
            }
            for (i, param) in f.params().iter().enumerate() {
                self.register(Value::Arg(i as u32), &param.ty);
            }
        }

        let snapshot: Vec<InstId> = {
            let f = module.func(func);
            f.block_insts(block)[f.first_insertion_pt(block)..].to_vec()
        };
        for inst in snapshot {
            let candidate = {
                let kind = &module.func(func).inst(inst).kind;
                is_valid_candidate(kind) && !matches!(kind, InstKind::Call { .. })
            };
            if candidate {
                let count = visited_operands(&module.func(func).inst(inst).kind);
                for i in 0..count {
                    let operand = module.func(func).inst(inst).kind.operands()[i];
                    let Some((bits, v)) = const_int_of(operand) else { continue };
                    if v != 0 {
                        continue;
                    }
                    if let Some(replacement) =
                        self.replace_zero(module.func_mut(func), inst, bits)
                    {
                        module.func_mut(func).inst_mut(inst).kind.set_operand(i, replacement);
                        modified = true;
                    }
                }
            }
            if self.original.contains(&inst) {
                let ty = module.func(func).inst(inst).ty.clone();
                self.register(Value::Inst(inst), &ty);
            }
        }
        modified
    }

    fn register(&mut self, v: Value, ty: &Type) {
        if ty.is_integer() && !v.is_constant() {
            self.integers.push(v);
        }
    }

    /// `p * ((x | any) & 0xFF)^2` over a random live value.
    fn create_expression(&mut self, b: &mut Builder<'_>, x: Value, p: u32) -> Value {
        let any = self.rng.gen_range(1..=255u32);
        let masked = b.build_or(x, b.const_i32(any));
        let masked = b.build_and(b.const_i32(0xFF), masked);
        let squared = b.build_mul(masked, masked);
        let tot = b.build_mul(b.const_i32(p), squared);
        self.integers.push(tot);
        tot
    }

    fn replace_zero(&mut self, f: &mut Function, inst: InstId, bits: u32) -> Option<Value> {
        if self.integers.is_empty() {
            return None;
        }
        let ix = self.rng.gen_range(0..self.integers.len());
        let picked = self.integers[ix];

        let replaced = if self.integers.len() == 1 {
            // ((~x | 0x7AFAFA69) & 0xA061440) + ((x & 0x1050504) | 0x1010104)
            // is always 185013572.
            let mut b = Builder::before(f, inst);
            let x = b.build_int_cast(picked, Type::I32, false);
            let t = b.build_not(x);
            let t = b.build_or(t, b.const_i32(0x7AFAFA69));
            let t = b.build_and(t, b.const_i32(0xA06_1440));
            let r = b.build_and(x, b.const_i32(0x105_0504));
            let r = b.build_or(r, b.const_i32(0x101_0104));
            let r = b.build_add(r, t);
            let r = b.build_xor(r, b.const_i32(185013572));
            b.build_int_cast(r, Type::Int(bits), false)
        } else {
            let mut iy = self.rng.gen_range(0..self.integers.len());
            while iy == ix {
                iy = self.rng.gen_range(0..self.integers.len());
            }
            let other = self.integers[iy];
            match self.rng.gen_range(0..3u32) {
                0 => {
                    // p1*(x|a)^2 == p2*(y|b)^2 can never hold: distinct
                    // prime factors.
                    let p1 = rand_prime(&mut self.rng, 1 << 8, 1 << 16);
                    let mut p2 = rand_prime(&mut self.rng, 1 << 8, 1 << 16);
                    while p1 == p2 {
                        p2 = rand_prime(&mut self.rng, 1 << 8, 1 << 16);
                    }
                    let mut b = Builder::before(f, inst);
                    let x = b.build_int_cast(picked, Type::I32, false);
                    let y = b.build_int_cast(other, Type::I32, false);
                    let lhs = self.create_expression(&mut b, x, p1);
                    let rhs = self.create_expression(&mut b, y, p2);
                    let cmp = b.build_icmp(IntPredicate::EQ, lhs, rhs);
                    b.build_sext(cmp, Type::Int(bits))
                }
                1 => {
                    // x + y - (x^y) - 2*(x&y) == 0
                    let mut b = Builder::before(f, inst);
                    let x = b.build_int_cast(picked, Type::I32, false);
                    let y = b.build_int_cast(other, Type::I32, false);
                    let r = b.build_add(x, y);
                    let t = b.build_xor(x, y);
                    let r = b.build_sub(r, t);
                    let t = b.build_and(x, y);
                    let t = b.build_shl(t, b.const_i32(1));
                    let r = b.build_xor(r, t);
                    b.build_int_cast(r, Type::Int(bits), false)
                }
                _ => {
                    // (x^y - (x|~y) - 3*~(x|y)) ^ (2*~x - y) == 0
                    let mut b = Builder::before(f, inst);
                    let x = b.build_int_cast(picked, Type::I32, false);
                    let y = b.build_int_cast(other, Type::I32, false);
                    let a = b.build_not(y);
                    let a = b.build_or(x, a);
                    let n = b.build_or(x, y);
                    let n = b.build_not(n);
                    let n = b.build_mul(n, b.const_i32((-3i32) as u32));
                    let c = b.build_not(x);
                    let c = b.build_mul(c, b.const_i32(2));
                    let c = b.build_sub(c, y);
                    let r = b.build_xor(x, y);
                    let r = b.build_sub(r, a);
                    let r = b.build_sub(r, n);
                    let r = b.build_xor(r, c);
                    b.build_int_cast(r, Type::Int(bits), false)
                }
            }
        };
        self.integers.push(replaced);
        Some(replaced)
    }
}
