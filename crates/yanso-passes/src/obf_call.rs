//! Calling-Convention Obfuscation
//!
//! On x86 targets, every internal non-vararg function is moved to a
//! randomly chosen convention from the obfuscated range, and every
//! call site follows. The range is pluggable; the backend has to
//! honor whatever ids it is given.

use std::ops::RangeInclusive;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use yanso_ir::module::calling_conv;
use yanso_ir::{Callee, InstKind, Linkage, Module};

use crate::pass::{pass_rng, ModulePass, Pass, PassResult};

pub struct ObfCall {
    rng: StdRng,
    conventions: RangeInclusive<u32>,
}

impl ObfCall {
    pub fn new() -> Self {
        Self::with_rng(pass_rng())
    }

    pub fn with_rng(rng: StdRng) -> Self {
        Self {
            rng,
            conventions: calling_conv::OBF_CALL_START..=calling_conv::OBF_CALL_END,
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    /// Use a different convention range than the built-in default.
    pub fn with_conventions(mut self, conventions: RangeInclusive<u32>) -> Self {
        self.conventions = conventions;
        self
    }
}

impl Default for ObfCall {
    fn default() -> Self {
        Self::new()
    }
}

impl Pass for ObfCall {
    fn name(&self) -> &'static str {
        "obfCall"
    }

    fn description(&self) -> &'static str {
        "Obfuscate calling convention for static functions"
    }
}

fn is_x86(triple: &str) -> bool {
    matches!(
        triple.split('-').next().unwrap_or(""),
        "i386" | "i486" | "i586" | "i686" | "x86" | "x86_64" | "amd64"
    )
}

impl ModulePass for ObfCall {
    fn run_on_module(&mut self, module: &mut Module) -> PassResult<bool> {
        if !is_x86(&module.target_triple) {
            return Ok(false);
        }
        let mut modified = false;
        for fid in module.func_ids() {
            let cc = self.rng.gen_range(self.conventions.clone());
            let f = module.func(fid);
            if f.linkage != Linkage::Internal || f.is_var_arg {
                continue;
            }
            module.func_mut(fid).calling_conv = cc;
            // Every call site follows the new convention.
            for caller in module.func_ids() {
                let sites: Vec<_> = module
                    .func(caller)
                    .inst_ids()
                    .filter(|id| {
                        matches!(
                            &module.func(caller).inst(*id).kind,
                            InstKind::Call { callee: Callee::Func(c), .. }
                            | InstKind::Invoke { callee: Callee::Func(c), .. }
                                if *c == fid
                        )
                    })
                    .collect();
                for site in sites {
                    module.func_mut(caller).set_call_conv(site, cc);
                }
            }
            modified = true;
        }
        Ok(modified)
    }
}
