//! Zero Replacement
//!
//! Block-local variant of constant obfuscation, restricted to literal
//! integer zeroes. Each zero becomes the sign-extended result of
//! `431*((x|a)&7)^2 == 277*((y|b)&7)^2`, a comparison that can never
//! hold because the two sides carry different prime factors. The live
//! values x and y come only from earlier instructions in the same
//! block, so no dominance questions arise.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use yanso_ir::{Builder, FuncId, Function, InstId, InstKind, IntPredicate, Module, Type, Value};

use crate::pass::{pass_rng, FunctionPass, Pass, PassResult};

const PRIME_LHS: u32 = 431;
const PRIME_RHS: u32 = 277;
const OVERFLOW_MASK: u32 = 0x0000_0007;

pub struct ObfuscateZero {
    rng: StdRng,
    integers: Vec<Value>,
}

impl ObfuscateZero {
    pub fn new() -> Self {
        Self::with_rng(pass_rng())
    }

    pub fn with_rng(rng: StdRng) -> Self {
        Self { rng, integers: Vec::new() }
    }

    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }
}

impl Default for ObfuscateZero {
    fn default() -> Self {
        Self::new()
    }
}

impl Pass for ObfuscateZero {
    fn name(&self) -> &'static str {
        "obfZero"
    }

    fn description(&self) -> &'static str {
        "Obfuscates zeroes"
    }
}

/// Pointers, returns and call arguments are left alone.
fn is_valid_candidate(kind: &InstKind) -> bool {
    !matches!(
        kind,
        InstKind::Gep { .. } | InstKind::Ret { .. } | InstKind::Call { .. }
    )
}

fn visited_operands(kind: &InstKind) -> usize {
    match kind {
        InstKind::Switch { .. } => 1,
        other => other.operands().len(),
    }
}

fn const_zero_width(v: Value) -> Option<u32> {
    match v {
        Value::Const(yanso_ir::Constant::Int { bits, value: 0 }) => Some(bits),
        _ => None,
    }
}

impl FunctionPass for ObfuscateZero {
    fn run_on_function(&mut self, module: &mut Module, func: FuncId) -> PassResult<bool> {
        let mut modified = false;
        if module.func(func).is_declaration() {
            return Ok(modified);
        }
        for block in module.func(func).block_order().to_vec() {
            self.integers.clear();
            // Skip leading phis so their edge values stay untouched.
            let snapshot: Vec<InstId> = {
                let f = module.func(func);
                f.block_insts(block)[f.first_insertion_pt(block)..].to_vec()
            };
            for inst in snapshot {
                if is_valid_candidate(&module.func(func).inst(inst).kind) {
                    let count = visited_operands(&module.func(func).inst(inst).kind);
                    for i in 0..count {
                        let operand = module.func(func).inst(inst).kind.operands()[i];
                        let Some(bits) = const_zero_width(operand) else { continue };
                        if let Some(replacement) =
                            self.replace_zero(module.func_mut(func), inst, bits)
                        {
                            module
                                .func_mut(func)
                                .inst_mut(inst)
                                .kind
                                .set_operand(i, replacement);
                            modified = true;
                        }
                    }
                }
                let ty = module.func(func).inst(inst).ty.clone();
                self.register(Value::Inst(inst), &ty);
            }
        }
        Ok(modified)
    }
}

impl ObfuscateZero {
    fn register(&mut self, v: Value, ty: &Type) {
        if ty.is_integer() && !v.is_constant() {
            self.integers.push(v);
        }
    }

    /// `p * ((x | any) & 7)^2` for a randomly chosen live value x.
    fn create_expression(&mut self, b: &mut Builder<'_>, p: u32) -> Value {
        let index = self.rng.gen_range(0..self.integers.len());
        let any = 1 + self.rng.gen_range(1..=10u32);
        let x = self.integers[index];
        let x = b.build_int_cast(x, Type::I32, false);
        let t = b.build_or(x, b.const_i32(any));
        let t = b.build_and(b.const_i32(OVERFLOW_MASK), t);
        let t = b.build_mul(t, t);
        let tot = b.build_mul(b.const_i32(p), t);
        self.integers.push(tot);
        tot
    }

    fn replace_zero(&mut self, f: &mut Function, inst: InstId, bits: u32) -> Option<Value> {
        if self.integers.is_empty() {
            return None;
        }
        let mut b = Builder::before(f, inst);
        let lhs = self.create_expression(&mut b, PRIME_LHS);
        let rhs = self.create_expression(&mut b, PRIME_RHS);
        let cmp = b.build_icmp(IntPredicate::EQ, lhs, rhs);
        let cast = b.build_sext(cmp, Type::Int(bits));
        self.integers.push(cast);
        Some(cast)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yanso_ir::interp::Interpreter;
    use yanso_ir::verify::verify_function;
    use yanso_ir::Param;

    /// add0(x) = (x + 0) | 0, with zeroes worth hiding.
    fn zero_module() -> Module {
        let mut m = Module::new("m");
        let mut f = Function::new("add0", Type::I32, vec![Param::new(Type::I32)]);
        let entry = f.add_block("entry");
        let mut b = Builder::at_end(&mut f, entry);
        let t = b.build_add(Value::Arg(0), b.const_i32(0));
        let t = b.build_or(t, b.const_i32(0));
        b.build_ret(Some(t));
        m.add_function(f);
        m
    }

    #[test]
    fn test_zeroes_replaced_and_value_preserved() {
        for seed in [4u64, 19, 1000] {
            let mut m = zero_module();
            let fid = m.get_function("add0").unwrap();
            let modified = ObfuscateZero::seeded(seed).run_on_function(&mut m, fid).unwrap();
            verify_function(&m, fid).unwrap();

            assert!(modified);
            let f = m.func(fid);
            // The or's zero must be gone once the add is in scope; the
            // first or in the arena is the original one.
            let or = f
                .inst_ids()
                .find(|id| {
                    matches!(&f.inst(*id).kind, InstKind::Binary { op, .. } if *op == yanso_ir::BinOp::Or)
                })
                .unwrap();
            for op in f.inst(or).kind.operands() {
                assert_ne!(op, Value::const_int(32, 0), "zero operand survived");
                assert_eq!(f.value_type(op), Type::I32);
            }

            let mut interp = Interpreter::new(&m);
            assert_eq!(interp.call_by_name("add0", &[41]).unwrap(), Some(41));
        }
    }

    #[test]
    fn test_no_live_integers_means_no_change() {
        let mut m = Module::new("m");
        let mut f = Function::new("just0", Type::I32, vec![]);
        let entry = f.add_block("entry");
        let mut b = Builder::at_end(&mut f, entry);
        let t = b.build_add(b.const_i32(0), b.const_i32(0));
        b.build_ret(Some(t));
        let fid = m.add_function(f);
        assert!(!ObfuscateZero::seeded(8).run_on_function(&mut m, fid).unwrap());
    }
}
