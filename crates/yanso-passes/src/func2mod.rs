//! Module Splitting
//!
//! Partitions a module's global values into N balanced sub-modules
//! plus a "rest" module for everything that must stay together.
//! Before splitting, every internal symbol is externalized under an
//! MD5-salted name so the pieces still link. Each part is serialized
//! to `<module><marker><i>`, where the marker tells the build system
//! which piece holds `main`.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::path::PathBuf;

use md5::{Digest, Md5};
use rustc_hash::FxHashMap;

use yanso_ir::printer::print_module;
use yanso_ir::{DllStorageClass, GvRef, Linkage, Module, Value, Visibility};

use crate::pass::{ModulePass, Pass, PassError, PassResult};

/// Stable prefix for externalized internal symbols.
pub const EXTERN_PREFIX: &str = "?YANSOLLVM@@YAHP6AHH@ZH0@Z.";
const UNNAMED: &str = "__llvmsplit_unnamed";

pub struct Func2Mod {
    num_outputs: u32,
    out_dir: PathBuf,
}

impl Func2Mod {
    pub fn new() -> Self {
        Self { num_outputs: 3, out_dir: PathBuf::from(".") }
    }

    pub fn with_outputs(mut self, n: u32) -> Self {
        self.num_outputs = n;
        self
    }

    pub fn with_out_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.out_dir = dir.into();
        self
    }
}

impl Default for Func2Mod {
    fn default() -> Self {
        Self::new()
    }
}

impl Pass for Func2Mod {
    fn name(&self) -> &'static str {
        "func2mod"
    }

    fn description(&self) -> &'static str {
        "Extract functions to independent modules"
    }
}

impl ModulePass for Func2Mod {
    fn run_on_module(&mut self, module: &mut Module) -> PassResult<bool> {
        let parts = split_module(module, self.num_outputs);
        for (i, part) in parts.iter().enumerate() {
            let defines_main = part
                .functions()
                .any(|(_, f)| f.name() == "main" && !f.is_declaration());
            let marker = if defines_main { "_main_" } else { "_split_" };
            let path = self.out_dir.join(format!("{}{}{}", module.name, marker, i));
            tracing::debug!(path = %path.display(), "writing sub-module");
            std::fs::write(&path, print_module(part))
                .map_err(|source| PassError::Io { path: path.clone(), source })?;
        }
        Ok(true)
    }
}

fn salted_name(old: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(old.as_bytes());
    format!("{}{}", EXTERN_PREFIX, hex::encode(hasher.finalize()))
}

/// Raise every internal symbol to external linkage under a hashed
/// name. Unnamed symbols get a consistent placeholder; everything but
/// `main` stops being dso_local.
fn externalize(module: &mut Module) {
    for fid in module.func_ids() {
        let f = module.func_mut(fid);
        if f.linkage.is_local() {
            let new_name = salted_name(f.name());
            f.set_name(new_name);
            f.linkage = Linkage::External;
            f.visibility = Visibility::Default;
        }
        if f.name().is_empty() {
            f.set_name(UNNAMED);
        }
        if f.name() != "main" {
            f.dso_local = false;
        }
    }
    for gid in module.global_ids() {
        let g = module.global_mut(gid);
        if g.linkage.is_local() {
            g.name = salted_name(&g.name);
            g.linkage = Linkage::External;
            g.visibility = Visibility::Default;
        }
        if g.name.is_empty() {
            g.name = UNNAMED.to_string();
        }
        if g.name != "main" {
            g.dso_local = false;
        }
    }
    let alias_ids: Vec<_> = module.aliases().map(|(id, _)| id).collect();
    for id in alias_ids {
        let a = module.alias_mut(id);
        if a.linkage.is_local() {
            a.name = salted_name(&a.name);
            a.linkage = Linkage::External;
            a.visibility = Visibility::Default;
        }
        a.dso_local = false;
    }
    let ifunc_ids: Vec<_> = module.ifuncs().map(|(id, _)| id).collect();
    for id in ifunc_ids {
        let i = module.ifunc_mut(id);
        if i.linkage.is_local() {
            i.name = salted_name(&i.name);
            i.linkage = Linkage::External;
            i.visibility = Visibility::Default;
        }
        i.dso_local = false;
    }
}

fn is_definition(module: &Module, gv: GvRef) -> bool {
    match gv {
        GvRef::Func(f) => !module.func(f).is_declaration(),
        GvRef::Global(g) => !module.global(g).is_declaration(),
        GvRef::Alias(_) | GvRef::IFunc(_) => true,
    }
}

fn gv_order_key(gv: GvRef) -> (u8, u32) {
    match gv {
        GvRef::Func(f) => (0, f.0),
        GvRef::Global(g) => (1, g.0),
        GvRef::Alias(a) => (2, a.0),
        GvRef::IFunc(i) => (3, i.0),
    }
}

/// Decide which cluster each freestanding global value goes to.
/// Values that must stay with others (anything that *uses* a global
/// value, comdat second members, alias bases) are never assigned and
/// fall into the extra part.
fn find_partitions(module: &Module, n: u32) -> FxHashMap<GvRef, u32> {
    let mut linked: FxHashMap<GvRef, bool> = FxHashMap::default();
    for gv in module.global_values() {
        if is_definition(module, gv) {
            linked.entry(gv).or_insert(false);
        }
    }

    // Comdat groups must not be partitioned: the first member stays
    // free, every later member pins the group into the rest part.
    let mut comdat_members: FxHashMap<String, GvRef> = FxHashMap::default();
    let mut record_comdat = |comdat: &Option<String>, gv: GvRef, linked: &mut FxHashMap<GvRef, bool>| {
        if let Some(c) = comdat {
            if comdat_members.insert(c.clone(), gv).is_some() {
                linked.insert(gv, true);
            }
        }
    };
    for (id, f) in module.functions() {
        if !f.is_declaration() {
            record_comdat(&f.comdat, GvRef::Func(id), &mut linked);
        }
    }
    for (id, g) in module.globals() {
        if !g.is_declaration() {
            record_comdat(&g.comdat, GvRef::Global(id), &mut linked);
        }
    }

    // Aliases and ifuncs stay with their base objects.
    for (_, a) in module.aliases() {
        linked.insert(a.aliasee, true);
    }
    for (_, i) in module.ifuncs() {
        linked.insert(GvRef::Func(i.resolver), true);
    }

    // Anything that refers to a global value (including through block
    // addresses) is pulled into the rest part.
    for (fid, f) in module.functions() {
        if f.is_declaration() {
            continue;
        }
        let mut uses_gv = false;
        'insts: for id in f.inst_ids() {
            let kind = &f.inst(id).kind;
            for op in kind.operands() {
                match op {
                    Value::Global(_) | Value::Func(_) => {
                        uses_gv = true;
                        break 'insts;
                    }
                    Value::Const(yanso_ir::Constant::BlockAddress { .. }) => {
                        uses_gv = true;
                        break 'insts;
                    }
                    _ => {}
                }
            }
            match kind {
                yanso_ir::InstKind::Call { callee: yanso_ir::Callee::Func(_), .. }
                | yanso_ir::InstKind::Invoke { callee: yanso_ir::Callee::Func(_), .. } => {
                    uses_gv = true;
                    break 'insts;
                }
                _ => {}
            }
        }
        if uses_gv {
            linked.insert(GvRef::Func(fid), true);
        }
    }
    for (gid, g) in module.globals() {
        if matches!(
            g.init,
            Some(Value::Global(_))
                | Some(Value::Func(_))
                | Some(Value::Const(yanso_ir::Constant::BlockAddress { .. }))
        ) {
            linked.insert(GvRef::Global(gid), true);
        }
    }

    // Largest first onto the emptiest cluster.
    let mut sets: Vec<(u64, GvRef)> = linked
        .iter()
        .filter(|(_, is_linked)| !**is_linked)
        .map(|(gv, _)| {
            let size = match gv {
                GvRef::Func(f) => module.func(*f).inst_count() as u64,
                _ => 1,
            };
            (size, *gv)
        })
        .collect();
    sets.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| gv_order_key(a.1).cmp(&gv_order_key(b.1))));

    let mut heap: BinaryHeap<Reverse<(u64, u32)>> =
        (0..n).map(|i| Reverse((0u64, i))).collect();
    let mut assignment = FxHashMap::default();
    for (size, gv) in sets {
        let Reverse((cluster_size, cluster)) = heap.pop().expect("at least one cluster");
        assignment.insert(gv, cluster);
        heap.push(Reverse((cluster_size + size, cluster)));
    }
    assignment
}

/// Externalize and partition `module` into `n + 1` pieces. The caller
/// decides what to do with them; the pass writes them to disk.
pub fn split_module(module: &mut Module, n: u32) -> Vec<Module> {
    externalize(module);
    let assignment = find_partitions(module, n);

    let mut parts = Vec::with_capacity(n as usize + 1);
    for i in 0..=n {
        let mut part = module
            .clone_with_predicate(|gv| assignment.get(&gv).map_or(i == n, |c| *c == i));
        if i != 0 {
            part.module_asm.clear();
        }
        for (gv, cluster) in &assignment {
            let storage = if i == n {
                DllStorageClass::Import
            } else if *cluster == i {
                DllStorageClass::Export
            } else {
                continue;
            };
            match gv {
                GvRef::Func(f) => part.func_mut(*f).dll_storage = storage,
                GvRef::Global(g) => part.global_mut(*g).dll_storage = storage,
                GvRef::Alias(_) | GvRef::IFunc(_) => {}
            }
        }
        parts.push(part);
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use yanso_ir::{Builder, Callee, Function, GlobalVariable, Param, Type};

    fn sample_module() -> Module {
        let mut m = Module::new("sample");
        m.module_asm = ".some_directive".to_string();

        let mut worker = Function::new("worker", Type::I32, vec![Param::new(Type::I32)]);
        worker.linkage = Linkage::Internal;
        let e = worker.add_block("entry");
        let mut b = Builder::at_end(&mut worker, e);
        let v = b.build_add(Value::Arg(0), b.const_i32(1));
        b.build_ret(Some(v));
        let worker = m.add_function(worker);

        for name in ["alpha", "beta", "gamma"] {
            let mut f = Function::new(name, Type::I32, vec![Param::new(Type::I32)]);
            let e = f.add_block("entry");
            let mut b = Builder::at_end(&mut f, e);
            let v = b.build_mul(Value::Arg(0), b.const_i32(3));
            b.build_ret(Some(v));
            m.add_function(f);
        }

        let mut main = Function::new("main", Type::I32, vec![]);
        let e = main.add_block("entry");
        let mut b = Builder::at_end(&mut main, e);
        let r = b.build_call(Callee::Func(worker), &[b.const_i32(9)], Type::I32);
        b.build_ret(Some(r));
        m.add_function(main);

        m.add_global(GlobalVariable::new("counter", Type::I32, Some(Value::const_int(32, 0))));
        m
    }

    #[test]
    fn test_externalize_renames_internal_symbols() {
        let mut m = sample_module();
        split_module(&mut m, 3);
        let renamed: Vec<&str> = m
            .functions()
            .map(|(_, f)| f.name())
            .filter(|n| n.starts_with(EXTERN_PREFIX))
            .collect();
        assert_eq!(renamed.len(), 1);
        // md5 hex digest after the prefix
        assert_eq!(renamed[0].len(), EXTERN_PREFIX.len() + 32);
        assert!(m.functions().all(|(_, f)| f.linkage == Linkage::External));
        // main stays dso_local, nothing else does
        for (_, f) in m.functions() {
            assert_eq!(f.dso_local, f.name() == "main");
        }
    }

    #[test]
    fn test_partition_totality() {
        let mut m = sample_module();
        let parts = split_module(&mut m, 3);
        assert_eq!(parts.len(), 4);

        // Every defined global value lives in exactly one part.
        for gv in m.global_values() {
            if !is_definition(&m, gv) {
                continue;
            }
            let holders = parts.iter().filter(|p| is_definition(p, gv)).count();
            assert_eq!(holders, 1, "{:?} defined in {} parts", gv, holders);
        }
        // Module asm survives only in the first part.
        assert!(!parts[0].module_asm.is_empty());
        assert!(parts[1..].iter().all(|p| p.module_asm.is_empty()));
    }

    #[test]
    fn test_linked_values_land_in_rest_part() {
        let mut m = sample_module();
        let parts = split_module(&mut m, 3);
        // main calls worker, so both are "linked" and live in the rest
        // part (the last one), exported nowhere, imported as needed.
        let rest = parts.last().unwrap();
        let main = rest.get_function("main").unwrap();
        assert!(!rest.func(main).is_declaration());
    }

    #[test]
    fn test_output_files_and_main_marker() {
        let dir = std::env::temp_dir().join(format!("yanso_f2m_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let mut m = sample_module();
        let mut pass = Func2Mod::new().with_outputs(3).with_out_dir(&dir);
        assert!(pass.run_on_module(&mut m).unwrap());

        let mut names: Vec<String> = std::fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .filter(|n| n.starts_with("sample"))
            .collect();
        names.sort();
        assert_eq!(names.len(), 4);
        assert_eq!(names.iter().filter(|n| n.contains("_main_")).count(), 1);
        assert_eq!(names.iter().filter(|n| n.contains("_split_")).count(), 3);

        let main_file = names.iter().find(|n| n.contains("_main_")).unwrap();
        let text = std::fs::read_to_string(dir.join(main_file)).unwrap();
        assert!(text.contains("define") && text.contains("@main"));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
