//! Pass Infrastructure
//!
//! Traits for function and module passes, a sequential pass manager,
//! and the registry of pass names and descriptions the host driver
//! selects from.

use std::io;
use std::path::PathBuf;

use rand::rngs::StdRng;
use rand::SeedableRng;
use thiserror::Error;

use yanso_ir::{FuncId, Module};

/// Result of a pass execution
pub type PassResult<T> = Result<T, PassError>;

/// Pass execution errors. Failed preconditions are not errors (the
/// pass just reports "no changes"); only invalid input IR and output
/// I/O cross this boundary.
#[derive(Debug, Error)]
pub enum PassError {
    #[error("invalid IR: {0}")]
    InvalidIr(String),
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Base trait for all passes
pub trait Pass {
    /// Registered name of this pass
    fn name(&self) -> &'static str;

    /// Human-readable description
    fn description(&self) -> &'static str;
}

/// A function pass is invoked once per function definition.
pub trait FunctionPass: Pass {
    fn run_on_function(&mut self, module: &mut Module, func: FuncId) -> PassResult<bool>;
}

/// A module pass is invoked once per module.
pub trait ModulePass: Pass {
    fn run_on_module(&mut self, module: &mut Module) -> PassResult<bool>;
}

/// Either kind of pass, boxed for the manager.
pub enum AnyPass {
    Function(Box<dyn FunctionPass>),
    Module(Box<dyn ModulePass>),
}

impl AnyPass {
    pub fn name(&self) -> &'static str {
        match self {
            AnyPass::Function(p) => p.name(),
            AnyPass::Module(p) => p.name(),
        }
    }
}

/// Runs passes sequentially, in insertion order. Function passes are
/// applied to every function definition in the module.
pub struct PassManager {
    passes: Vec<AnyPass>,
}

impl PassManager {
    pub fn new() -> Self {
        Self { passes: Vec::new() }
    }

    pub fn add(&mut self, pass: AnyPass) {
        self.passes.push(pass);
    }

    pub fn add_function_pass(&mut self, pass: Box<dyn FunctionPass>) {
        self.passes.push(AnyPass::Function(pass));
    }

    pub fn add_module_pass(&mut self, pass: Box<dyn ModulePass>) {
        self.passes.push(AnyPass::Module(pass));
    }

    /// Add a pass by its registered name. Returns false for unknown
    /// names.
    pub fn add_by_name(&mut self, name: &str) -> bool {
        match create_pass(name) {
            Some(p) => {
                self.passes.push(p);
                true
            }
            None => false,
        }
    }

    /// Run every pass; returns whether anything changed the module.
    pub fn run(&mut self, module: &mut Module) -> PassResult<bool> {
        let mut modified = false;
        for pass in &mut self.passes {
            match pass {
                AnyPass::Module(p) => {
                    let changed = p.run_on_module(module)?;
                    tracing::debug!(pass = p.name(), changed, "module pass finished");
                    modified |= changed;
                }
                AnyPass::Function(p) => {
                    for func in module.func_ids() {
                        if module.func(func).is_declaration() {
                            continue;
                        }
                        let changed = p.run_on_function(module, func)?;
                        tracing::debug!(
                            pass = p.name(),
                            function = module.func(func).name(),
                            changed,
                            "function pass finished"
                        );
                        modified |= changed;
                    }
                }
            }
        }
        Ok(modified)
    }
}

impl Default for PassManager {
    fn default() -> Self {
        Self::new()
    }
}

/// What kind of pass a registry entry names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassKind {
    Function,
    Module,
}

/// A registry entry: stable name plus description.
pub struct PassInfo {
    pub name: &'static str,
    pub description: &'static str,
    pub kind: PassKind,
}

/// All registered passes, in the usual pipeline order.
pub static REGISTRY: &[PassInfo] = &[
    PassInfo {
        name: "obfCon",
        description: "Split and obfuscate constants",
        kind: PassKind::Function,
    },
    PassInfo {
        name: "obfZero",
        description: "Obfuscates zeroes",
        kind: PassKind::Function,
    },
    PassInfo {
        name: "flattening",
        description: "Call graph flattening",
        kind: PassKind::Function,
    },
    PassInfo {
        name: "connect",
        description: "Split & connect basic blocks & add garbage blocks",
        kind: PassKind::Function,
    },
    PassInfo {
        name: "bb2func",
        description: "Extract basic blocks to Function",
        kind: PassKind::Function,
    },
    PassInfo {
        name: "merge",
        description: "Merge static functions",
        kind: PassKind::Module,
    },
    PassInfo {
        name: "obfCall",
        description: "Obfuscate calling convention for static functions",
        kind: PassKind::Module,
    },
    PassInfo {
        name: "vm",
        description: "Use functions to do simple arithmetic",
        kind: PassKind::Module,
    },
    PassInfo {
        name: "func2mod",
        description: "Extract functions to independent modules",
        kind: PassKind::Module,
    },
];

/// Instantiate a registered pass with an entropy- or
/// environment-seeded PRNG.
pub fn create_pass(name: &str) -> Option<AnyPass> {
    use crate::{
        bb2func::BB2Func, connect::Connect, flattening::Flattening, func2mod::Func2Mod,
        merge::Merge, obf_call::ObfCall, obf_constant::ObfuscateConstant, obf_zero::ObfuscateZero,
        vm::Virtualize,
    };
    Some(match name {
        "flattening" => AnyPass::Function(Box::new(Flattening::new())),
        "connect" => AnyPass::Function(Box::new(Connect::new())),
        "bb2func" => AnyPass::Function(Box::new(BB2Func::new())),
        "obfCon" => AnyPass::Function(Box::new(ObfuscateConstant::new())),
        "obfZero" => AnyPass::Function(Box::new(ObfuscateZero::new())),
        "vm" => AnyPass::Module(Box::new(Virtualize::new())),
        "merge" => AnyPass::Module(Box::new(Merge::new())),
        "obfCall" => AnyPass::Module(Box::new(ObfCall::new())),
        "func2mod" => AnyPass::Module(Box::new(Func2Mod::new())),
        _ => return None,
    })
}

/// Environment variable that pins every pass PRNG for reproduction.
pub const SEED_ENV: &str = "YANSO_SEED";

/// A fresh PRNG for a pass: seeded from `YANSO_SEED` when set, from OS
/// entropy otherwise.
pub fn pass_rng() -> StdRng {
    match std::env::var(SEED_ENV).ok().and_then(|s| s.parse::<u64>().ok()) {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_names_resolve() {
        for info in REGISTRY {
            let pass = create_pass(info.name).expect("registered pass must construct");
            assert_eq!(pass.name(), info.name);
        }
        assert!(create_pass("nope").is_none());
    }

    #[test]
    fn test_manager_runs_in_order() {
        let mut pm = PassManager::new();
        assert!(pm.add_by_name("obfZero"));
        assert!(!pm.add_by_name("bogus"));
        let mut m = Module::new("m");
        assert_eq!(pm.run(&mut m).unwrap(), false);
    }
}
