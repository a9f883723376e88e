//! IR Printer
//!
//! Deterministic textual form of a module, LLVM-flavoured. This is
//! what the module splitter writes to disk and what tests grep.

use std::fmt::Write as _;

use crate::function::Function;
use crate::instruction::{Callee, InstId, InstKind};
use crate::module::{DllStorageClass, FuncId, GvRef, Linkage, Module};
use crate::value::Value;

/// Print a whole module.
pub fn print_module(module: &Module) -> String {
    let mut out = String::new();
    writeln!(out, "; ModuleID = '{}'", module.name).unwrap();
    if !module.target_triple.is_empty() {
        writeln!(out, "target triple = \"{}\"", module.target_triple).unwrap();
    }
    if !module.module_asm.is_empty() {
        writeln!(out, "module asm \"{}\"", module.module_asm).unwrap();
    }
    writeln!(out).unwrap();

    for (_, g) in module.globals() {
        write!(out, "@{} = ", g.name).unwrap();
        write_linkage(&mut out, g.linkage, g.dll_storage);
        if g.dso_local {
            write!(out, "dso_local ").unwrap();
        }
        write!(out, "{} ", if g.is_constant { "constant" } else { "global" }).unwrap();
        write!(out, "{}", g.ty).unwrap();
        match &g.init {
            Some(v) => writeln!(out, " {}", render_value(module, None, *v)).unwrap(),
            None => writeln!(out).unwrap(),
        }
    }
    for (_, a) in module.aliases() {
        let target = match a.aliasee {
            GvRef::Func(f) => format!("@{}", module.func(f).name()),
            GvRef::Global(g) => format!("@{}", module.global(g).name),
            GvRef::Alias(x) => format!("@{}", module.alias(x).name),
            GvRef::IFunc(x) => format!("@{}", module.ifunc(x).name),
        };
        writeln!(out, "@{} = alias {}", a.name, target).unwrap();
    }
    for (_, i) in module.ifuncs() {
        writeln!(out, "@{} = ifunc @{}", i.name, module.func(i.resolver).name()).unwrap();
    }
    if module.globals().count() + module.aliases().count() + module.ifuncs().count() > 0 {
        writeln!(out).unwrap();
    }

    let mut first = true;
    for (id, _) in module.functions() {
        if !first {
            writeln!(out).unwrap();
        }
        first = false;
        print_function_into(&mut out, module, id);
    }
    out
}

/// Print one function.
pub fn print_function(module: &Module, id: FuncId) -> String {
    let mut out = String::new();
    print_function_into(&mut out, module, id);
    out
}

fn write_linkage(out: &mut String, linkage: Linkage, dll: DllStorageClass) {
    if linkage == Linkage::Internal {
        write!(out, "internal ").unwrap();
    }
    match dll {
        DllStorageClass::None => {}
        DllStorageClass::Import => write!(out, "dllimport ").unwrap(),
        DllStorageClass::Export => write!(out, "dllexport ").unwrap(),
    }
}

fn print_function_into(out: &mut String, module: &Module, id: FuncId) {
    let func = module.func(id);
    let keyword = if func.is_declaration() { "declare" } else { "define" };
    write!(out, "{} ", keyword).unwrap();
    write_linkage(out, func.linkage, DllStorageClass::None);
    if func.calling_conv != 0 {
        write!(out, "cc{} ", func.calling_conv).unwrap();
    }
    write!(out, "{} @{}(", func.ret_ty(), func.name()).unwrap();
    for (i, p) in func.params().iter().enumerate() {
        if i > 0 {
            write!(out, ", ").unwrap();
        }
        write!(out, "{} %arg{}", p.ty, i).unwrap();
    }
    if func.is_var_arg {
        if !func.params().is_empty() {
            write!(out, ", ").unwrap();
        }
        write!(out, "...").unwrap();
    }
    write!(out, ")").unwrap();
    for attr in func.attrs.iter() {
        write!(out, " {:?}", attr).unwrap();
    }
    if func.is_declaration() {
        writeln!(out).unwrap();
        return;
    }
    writeln!(out, " {{").unwrap();
    for &b in func.block_order() {
        let name = &func.block(b).name;
        if name.is_empty() {
            writeln!(out, "bb{}:", b.index()).unwrap();
        } else {
            writeln!(out, "{}:", name).unwrap();
        }
        for &inst in func.block_insts(b) {
            print_inst(out, module, func, inst);
        }
    }
    writeln!(out, "}}").unwrap();
}

fn render_value(module: &Module, func: Option<&Function>, v: Value) -> String {
    match v {
        Value::Global(g) => format!("@{}", module.global(g).name),
        Value::Func(f) => format!("@{}", module.func(f).name()),
        Value::Inst(id) => match func.and_then(|f| f.try_inst(id)).and_then(|d| d.name.clone()) {
            Some(name) => format!("%{}", name),
            None => format!("%t{}", id.index()),
        },
        other => format!("{}", other),
    }
}

fn print_inst(out: &mut String, module: &Module, func: &Function, inst: InstId) {
    let data = func.inst(inst);
    write!(out, "  ").unwrap();
    if !data.ty.is_void() {
        write!(out, "{} = ", render_value(module, Some(func), Value::Inst(inst))).unwrap();
    }
    let rv = |v: Value| render_value(module, Some(func), v);
    let block_name = |b: crate::basic_block::BlockId| {
        let n = &func.block(b).name;
        if n.is_empty() { format!("%bb{}", b.index()) } else { format!("%{}", n) }
    };
    match &data.kind {
        InstKind::Alloca { allocated } => {
            writeln!(out, "alloca {}", allocated).unwrap();
        }
        InstKind::Load { ptr } => {
            writeln!(out, "load {}, ptr {}", data.ty, rv(*ptr)).unwrap();
        }
        InstKind::Store { value, ptr } => {
            writeln!(out, "store {} {}, ptr {}", func.value_type(*value), rv(*value), rv(*ptr))
                .unwrap();
        }
        InstKind::Gep { elem_ty, base, indices } => {
            write!(out, "getelementptr {}, ptr {}", elem_ty, rv(*base)).unwrap();
            for idx in indices {
                write!(out, ", {} {}", func.value_type(*idx), rv(*idx)).unwrap();
            }
            writeln!(out).unwrap();
        }
        InstKind::Binary { op, lhs, rhs } => {
            writeln!(out, "{} {} {}, {}", op.mnemonic(), data.ty, rv(*lhs), rv(*rhs)).unwrap();
        }
        InstKind::ICmp { pred, lhs, rhs } => {
            writeln!(
                out,
                "icmp {} {} {}, {}",
                format!("{:?}", pred).to_lowercase(),
                func.value_type(*lhs),
                rv(*lhs),
                rv(*rhs)
            )
            .unwrap();
        }
        InstKind::Cast { op: _, value } => {
            writeln!(
                out,
                "{} {} {} to {}",
                data.kind.opcode_name(),
                func.value_type(*value),
                rv(*value),
                data.ty
            )
            .unwrap();
        }
        InstKind::Select { cond, if_true, if_false } => {
            writeln!(out, "select i1 {}, {} {}, {}", rv(*cond), data.ty, rv(*if_true), rv(*if_false))
                .unwrap();
        }
        InstKind::Phi { incoming } => {
            write!(out, "phi {} ", data.ty).unwrap();
            for (i, (v, b)) in incoming.iter().enumerate() {
                if i > 0 {
                    write!(out, ", ").unwrap();
                }
                write!(out, "[ {}, {} ]", rv(*v), block_name(*b)).unwrap();
            }
            writeln!(out).unwrap();
        }
        InstKind::Call { callee, args, conv } => {
            write!(out, "call ").unwrap();
            if *conv != 0 {
                write!(out, "cc{} ", conv).unwrap();
            }
            match callee {
                Callee::Func(f) => {
                    write!(out, "{} @{}(", data.ty, module.func(*f).name()).unwrap()
                }
                Callee::Asm(asm) => {
                    write!(out, "{} asm \"{}\"(", data.ty, asm.asm).unwrap()
                }
            }
            for (i, a) in args.iter().enumerate() {
                if i > 0 {
                    write!(out, ", ").unwrap();
                }
                write!(out, "{} {}", func.value_type(*a), rv(*a)).unwrap();
            }
            writeln!(out, ")").unwrap();
        }
        InstKind::Br { dest } => {
            writeln!(out, "br label {}", block_name(*dest)).unwrap();
        }
        InstKind::CondBr { cond, if_true, if_false } => {
            writeln!(
                out,
                "br i1 {}, label {}, label {}",
                rv(*cond),
                block_name(*if_true),
                block_name(*if_false)
            )
            .unwrap();
        }
        InstKind::Switch { cond, default, cases } => {
            let width = func.value_type(*cond);
            write!(out, "switch {} {}, label {} [", width, rv(*cond), block_name(*default))
                .unwrap();
            for (v, b) in cases {
                write!(out, " {} {}, label {}", width, v, block_name(*b)).unwrap();
            }
            writeln!(out, " ]").unwrap();
        }
        InstKind::Ret { value } => match value {
            Some(v) => writeln!(out, "ret {} {}", func.value_type(*v), rv(*v)).unwrap(),
            None => writeln!(out, "ret void").unwrap(),
        },
        InstKind::Invoke { callee, normal, unwind, .. } => {
            let target = match callee {
                Callee::Func(f) => format!("@{}", module.func(*f).name()),
                Callee::Asm(asm) => format!("asm \"{}\"", asm.asm),
            };
            writeln!(
                out,
                "invoke {} {} to label {} unwind label {}",
                data.ty,
                target,
                block_name(*normal),
                block_name(*unwind)
            )
            .unwrap();
        }
        InstKind::Unreachable => {
            writeln!(out, "unreachable").unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Builder;
    use crate::function::{Function, Param};
    use crate::module::GlobalVariable;
    use crate::types::Type;

    #[test]
    fn test_print_module() {
        let mut m = Module::new("demo");
        m.target_triple = "x86_64-pc-linux-gnu".to_string();
        m.add_global(GlobalVariable::new("counter", Type::I32, Some(Value::const_int(32, 0))));
        let mut f = Function::new("bump", Type::I32, vec![Param::new(Type::I32)]);
        let e = f.add_block("entry");
        let mut b = Builder::at_end(&mut f, e);
        let v = b.build_add(Value::Arg(0), b.const_i32(1));
        b.build_ret(Some(v));
        m.add_function(f);

        let text = print_module(&m);
        assert!(text.contains("; ModuleID = 'demo'"));
        assert!(text.contains("target triple = \"x86_64-pc-linux-gnu\""));
        assert!(text.contains("@counter = dso_local global i32 0"));
        assert!(text.contains("define i32 @bump(i32 %arg0) {"));
        assert!(text.contains("add i32 %arg0, 1"));
        assert!(text.contains("ret i32"));
    }

    #[test]
    fn test_print_declaration() {
        let mut m = Module::new("demo");
        m.add_function(Function::new("external_fn", Type::Void, vec![]));
        let text = print_module(&m);
        assert!(text.contains("declare void @external_fn()"));
    }
}
