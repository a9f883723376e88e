//! # yanso-passes
//!
//! Code-obfuscating IR-to-IR transformations over [`yanso_ir`]:
//! - `flattening` — dispatcher-loop control-flow flattening with an
//!   FNV-hashed switch
//! - `connect` — block splitting, memory shuffling and bogus switch
//!   edges behind garbage default blocks
//! - `bb2func` — basic-block extraction into fresh functions
//! - `obfCon` / `obfZero` — constant splitting and MBA zero rewriting
//! - `vm` — arithmetic virtualization through MBA helper functions
//! - `merge` — fusing internal functions into a tag-dispatched body
//! - `obfCall` — randomized calling conventions on x86
//! - `func2mod` — splitting a module into linked sub-modules
//!
//! Passes run under the [`pass::PassManager`] and report a `modified`
//! flag; every pass owns its PRNG and accepts an injected seed for
//! reproducible output.

pub mod bb2func;
pub mod connect;
pub mod flattening;
pub mod func2mod;
pub mod merge;
pub mod numeric;
pub mod obf_call;
pub mod obf_constant;
pub mod obf_zero;
pub mod pass;
pub mod vm;

pub use bb2func::BB2Func;
pub use connect::Connect;
pub use flattening::Flattening;
pub use func2mod::Func2Mod;
pub use merge::Merge;
pub use obf_call::ObfCall;
pub use obf_constant::ObfuscateConstant;
pub use obf_zero::ObfuscateZero;
pub use pass::{
    create_pass, pass_rng, AnyPass, FunctionPass, ModulePass, Pass, PassError, PassInfo,
    PassKind, PassManager, PassResult, REGISTRY,
};
pub use vm::Virtualize;
