//! End-to-end scenarios: seeded pass pipelines over small programs,
//! checked for semantic equivalence with the reference interpreter
//! and re-verified after every stage.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use yanso_ir::interp::Interpreter;
use yanso_ir::value::{mask_to_width, sign_extend};
use yanso_ir::verify::verify_module;
use yanso_ir::{
    Builder, Callee, Function, IntPredicate, Linkage, Module, Param, Type, Value,
};
use yanso_passes::pass::{FunctionPass, ModulePass};
use yanso_passes::{
    BB2Func, Connect, Flattening, Merge, ObfCall, ObfuscateConstant, ObfuscateZero, Virtualize,
};

/// int f(int x) { if (x > 0) return x + 1; else return x - 1; }
fn add_branchy(m: &mut Module) {
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
}

/// int g(int *p, int n) { s = 0; for (i = 0; i < n; i++) s += p[i]; return s; }
fn add_loop_sum(m: &mut Module) {
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
    b.build_ret(Some(sv));
    m.add_function(f);
}

/// uint32_t h(uint32_t x) { return x ^ 0xDEADBEEF; }
fn add_xor_const(m: &mut Module) {
    let mut f = Function::new("h", Type::I32, vec![Param::new(Type::I32)]);
    let entry = f.add_block("entry");
    let mut b = Builder::at_end(&mut f, entry);
    let v = b.build_xor(Value::Arg(0), b.const_i32(0xDEAD_BEEF));
    b.build_ret(Some(v));
    m.add_function(f);
}

/// static a/b plus a caller combining them.
fn add_statics_and_caller(m: &mut Module) {
    let mut fa = Function::new("a", Type::I32, vec![Param::new(Type::I32)]);
    fa.linkage = Linkage::Internal;
    let e = fa.add_block("entry");
    let mut b = Builder::at_end(&mut fa, e);
    let t = b.build_mul(Value::Arg(0), b.const_i32(7));
    let t = b.build_sub(t, b.const_i32(4));
    b.build_ret(Some(t));
    let fa = m.add_function(fa);

    let mut fb = Function::new(
        "b",
        Type::I32,
        vec![Param::new(Type::I32), Param::new(Type::I32)],
    );
    fb.linkage = Linkage::Internal;
    let e = fb.add_block("entry");
    let hi = fb.add_block("hi");
    let lo = fb.add_block("lo");
    let mut b = Builder::at_end(&mut fb, e);
    let c = b.build_icmp(IntPredicate::SGE, Value::Arg(0), Value::Arg(1));
    b.build_cond_br(c, hi, lo);
    let mut b = Builder::at_end(&mut fb, hi);
    let v = b.build_xor(Value::Arg(0), Value::Arg(1));
    b.build_ret(Some(v));
    let mut b = Builder::at_end(&mut fb, lo);
    let v = b.build_and(Value::Arg(0), Value::Arg(1));
    b.build_ret(Some(v));
    let fb = m.add_function(fb);

    let mut caller = Function::new(
        "combine",
        Type::I32,
        vec![Param::new(Type::I32), Param::new(Type::I32)],
    );
    let e = caller.add_block("entry");
    let mut b = Builder::at_end(&mut caller, e);
    let ra = b.build_call(Callee::Func(fa), &[Value::Arg(0)], Type::I32);
    let rb = b.build_call(Callee::Func(fb), &[Value::Arg(0), Value::Arg(1)], Type::I32);
    let out = b.build_add(ra, rb);
    b.build_ret(Some(out));
    m.add_function(caller);
}

fn whole_module() -> Module {
    let mut m = Module::new("scenario");
    m.target_triple = "x86_64-pc-linux-gnu".to_string();
    add_branchy(&mut m);
    add_loop_sum(&mut m);
    add_xor_const(&mut m);
    add_statics_and_caller(&mut m);
    m
}

struct Snapshot {
    f: Vec<i64>,
    g: u64,
    h: Vec<u64>,
    combine: Vec<i64>,
}

fn observe(m: &Module) -> Snapshot {
    let mut interp = Interpreter::new(m);
    let f = [5i64, -3, 0]
        .iter()
        .map(|&x| {
            let out = interp
                .call_by_name("f", &[mask_to_width(x as u64, 32)])
                .unwrap()
                .unwrap();
            sign_extend(out, 32)
        })
        .collect();

    let mut bytes = Vec::new();
    for v in [1i32, 2, 3, 4] {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    let p = interp.alloc_bytes(&bytes);
    let g = interp.call_by_name("g", &[p, 4]).unwrap().unwrap();

    let h = [0u64, 0xFFFF_FFFF]
        .iter()
        .map(|&x| interp.call_by_name("h", &[x]).unwrap().unwrap())
        .collect();

    let mut rng = StdRng::seed_from_u64(5150);
    let mut combine = Vec::new();
    for _ in 0..10 {
        let x: i32 = rng.gen_range(-500..500);
        let y: i32 = rng.gen_range(-500..500);
        let out = interp
            .call_by_name(
                "combine",
                &[mask_to_width(x as u64, 32), mask_to_width(y as u64, 32)],
            )
            .unwrap()
            .unwrap();
        combine.push(sign_extend(out, 32));
    }
    Snapshot { f, g, h, combine }
}

fn assert_same(stage: &str, reference: &Snapshot, m: &Module) {
    let now = observe(m);
    assert_eq!(now.f, reference.f, "f diverged after {}", stage);
    assert_eq!(now.g, reference.g, "g diverged after {}", stage);
    assert_eq!(now.h, reference.h, "h diverged after {}", stage);
    assert_eq!(now.combine, reference.combine, "combine diverged after {}", stage);
}

fn run_function_pass(pass: &mut dyn FunctionPass, m: &mut Module) {
    for fid in m.func_ids() {
        if m.func(fid).is_declaration() {
            continue;
        }
        pass.run_on_function(m, fid).unwrap();
    }
}

#[test]
fn pipeline_preserves_program_behavior() {
    for seed in [3u64, 1337] {
        let mut m = whole_module();
        let reference = observe(&m);

        run_function_pass(&mut ObfuscateConstant::seeded(seed), &mut m);
        verify_module(&m).unwrap();
        assert_same("obfCon", &reference, &m);

        run_function_pass(&mut ObfuscateZero::seeded(seed ^ 1), &mut m);
        verify_module(&m).unwrap();
        assert_same("obfZero", &reference, &m);

        run_function_pass(&mut Flattening::seeded(seed ^ 2), &mut m);
        verify_module(&m).unwrap();
        assert_same("flattening", &reference, &m);

        run_function_pass(&mut Connect::seeded(seed ^ 3), &mut m);
        verify_module(&m).unwrap();
        assert_same("connect", &reference, &m);

        run_function_pass(&mut BB2Func::new(), &mut m);
        verify_module(&m).unwrap();
        assert_same("bb2func", &reference, &m);

        Merge::seeded(seed ^ 4).run_on_module(&mut m).unwrap();
        verify_module(&m).unwrap();
        assert_same("merge", &reference, &m);

        ObfCall::seeded(seed ^ 5).run_on_module(&mut m).unwrap();
        verify_module(&m).unwrap();
        assert_same("obfCall", &reference, &m);

        Virtualize::new().run_on_module(&mut m).unwrap();
        verify_module(&m).unwrap();
        assert_same("vm", &reference, &m);
    }
}

#[test]
fn obfuscated_constant_is_gone_but_value_stays() {
    let mut m = whole_module();
    run_function_pass(&mut ObfuscateConstant::seeded(99), &mut m);
    let fid = m.get_function("h").unwrap();
    let f = m.func(fid);
    for id in f.inst_ids() {
        for op in f.inst(id).kind.operands() {
            if let Value::Const(yanso_ir::Constant::Int { bits: 32, value }) = op {
                assert_ne!(value, 0xDEAD_BEEF, "literal key still visible");
            }
        }
    }
    let mut interp = Interpreter::new(&m);
    assert_eq!(interp.call_by_name("h", &[0]).unwrap(), Some(0xDEAD_BEEF));
    assert_eq!(
        interp.call_by_name("h", &[0xFFFF_FFFF]).unwrap(),
        Some(0x2152_4110)
    );
}

#[test]
fn virtualize_covers_every_integer_binop_site() {
    let mut m = whole_module();
    Virtualize::new().run_on_module(&mut m).unwrap();
    let covered = [
        yanso_ir::BinOp::Add,
        yanso_ir::BinOp::Sub,
        yanso_ir::BinOp::Shl,
        yanso_ir::BinOp::AShr,
        yanso_ir::BinOp::LShr,
        yanso_ir::BinOp::And,
        yanso_ir::BinOp::Or,
        yanso_ir::BinOp::Xor,
    ];
    for (_, f) in m.functions() {
        if f.name().starts_with("__YANSOLLVM_VM_") {
            continue;
        }
        for id in f.inst_ids() {
            if let yanso_ir::InstKind::Binary { op, .. } = &f.inst(id).kind {
                assert!(!covered.contains(op), "{:?} survived outside helpers", op);
            }
        }
    }
    assert_same("vm-only", &observe(&whole_module()), &m);
}

#[test]
fn seeded_runs_are_reproducible() {
    let build = |seed: u64| {
        let mut m = whole_module();
        run_function_pass(&mut Flattening::seeded(seed), &mut m);
        yanso_ir::printer::print_module(&m)
    };
    assert_eq!(build(21), build(21));
    assert_ne!(build(21), build(22));
}
