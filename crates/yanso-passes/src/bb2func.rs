//! Basic-Block Extraction
//!
//! Hoists heavyweight basic blocks into fresh functions to break up
//! interprocedural analyses. Wrapper functions produced by a previous
//! run (recognizable by their `newFuncRoot` entry block) are skipped,
//! so the pass does not re-extract its own output.

use yanso_ir::extractor::CodeExtractor;
use yanso_ir::{BlockId, FnAttr, FuncId, Module};

use crate::pass::{FunctionPass, Pass, PassResult};

const SIZE_LIMIT: usize = 32;
const MIN_INSTS: usize = 2;
const SPLIT_THRESHOLD: usize = 8;

pub struct BB2Func;

impl BB2Func {
    pub fn new() -> Self {
        Self
    }
}

impl Default for BB2Func {
    fn default() -> Self {
        Self::new()
    }
}

impl Pass for BB2Func {
    fn name(&self) -> &'static str {
        "bb2func"
    }

    fn description(&self) -> &'static str {
        "Extract basic blocks to Function"
    }
}

impl FunctionPass for BB2Func {
    fn run_on_function(&mut self, module: &mut Module, func: FuncId) -> PassResult<bool> {
        let mut modified = false;
        {
            let f = module.func(func);
            if f.is_declaration() || f.has_invoke() {
                return Ok(modified);
            }
            if f.block(f.entry()).name == "newFuncRoot" {
                return Ok(modified);
            }
        }

        let mut candidates: Vec<BlockId> = {
            let f = module.func(func);
            f.block_order()
                .iter()
                .copied()
                .filter(|b| f.block_insts(*b).len() > MIN_INSTS)
                .filter(|b| CodeExtractor::new(*b).is_eligible(f))
                .collect()
        };

        if candidates.len() > SIZE_LIMIT {
            let f = module.func(func);
            candidates.sort_by_key(|b| std::cmp::Reverse(f.block_insts(*b).len()));
            candidates.truncate(SIZE_LIMIT);
        }

        // Large candidates are halved first; the tail joins the list.
        for b in candidates.clone() {
            let f = module.func_mut(func);
            let first = f.first_insertion_pt(b);
            let size = f.block_insts(b).len() - first;
            if size >= SPLIT_THRESHOLD {
                let tail = f.split_block(b, first + size / 2, "");
                if CodeExtractor::new(tail).is_eligible(module.func(func)) {
                    candidates.push(tail);
                }
            }
        }

        for b in candidates {
            let extractor = CodeExtractor::new(b);
            if !extractor.is_eligible(module.func(func)) {
                continue;
            }
            let new_fn = extractor
                .extract_code_region(module, func)
                .expect("eligible region failed to extract");
            let nf = module.func_mut(new_fn);
            nf.attrs.add(FnAttr::NoInline);
            nf.attrs.add(FnAttr::OptimizeNone);
            modified = true;
        }
        Ok(modified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yanso_ir::interp::Interpreter;
    use yanso_ir::verify::verify_module;
    use yanso_ir::{Builder, Function, Param, Type, Value};

    /// f(x) = ((x*3 + 7) ^ 5) * 2 + x, bulky enough to extract.
    fn build_module() -> Module {
        let mut m = Module::new("m");
        let mut f = Function::new("f", Type::I32, vec![Param::new(Type::I32)]);
        let entry = f.add_block("entry");
        let work = f.add_block("work");
        let exit = f.add_block("exit");
        Builder::at_end(&mut f, entry).build_br(work);
        let mut b = Builder::at_end(&mut f, work);
        let t = b.build_mul(Value::Arg(0), b.const_i32(3));
        let t = b.build_add(t, b.const_i32(7));
        let t = b.build_xor(t, b.const_i32(5));
        let t = b.build_mul(t, b.const_i32(2));
        let t = b.build_add(t, Value::Arg(0));
        b.build_br(exit);
        Builder::at_end(&mut f, exit).build_ret(Some(t));
        m.add_function(f);
        m
    }

    fn eval(m: &Module, x: u64) -> u64 {
        let mut interp = Interpreter::new(m);
        interp.call_by_name("f", &[x]).unwrap().unwrap()
    }

    #[test]
    fn test_extraction_preserves_behavior() {
        let mut m = build_module();
        let fid = m.get_function("f").unwrap();
        let expected = eval(&m, 9);
        let before = m.functions().count();

        assert!(BB2Func::new().run_on_function(&mut m, fid).unwrap());
        assert!(m.functions().count() > before);
        verify_module(&m).unwrap();
        assert_eq!(eval(&m, 9), expected);
    }

    #[test]
    fn test_extracted_functions_are_noinline_wrappers() {
        let mut m = build_module();
        let fid = m.get_function("f").unwrap();
        BB2Func::new().run_on_function(&mut m, fid).unwrap();

        let new_ids: Vec<FuncId> = m
            .functions()
            .map(|(id, _)| id)
            .filter(|id| *id != fid)
            .collect();
        assert!(!new_ids.is_empty());
        for id in new_ids {
            let nf = m.func(id);
            assert_eq!(nf.block(nf.entry()).name, "newFuncRoot");
            assert!(nf.attrs.has(FnAttr::NoInline));
            assert!(nf.attrs.has(FnAttr::OptimizeNone));
            // Wrappers are not re-extracted.
            assert!(!BB2Func::new().run_on_function(&mut m.clone(), id).unwrap());
        }
    }
}
