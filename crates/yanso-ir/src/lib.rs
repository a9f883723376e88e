//! # yanso-ir
//!
//! A typed, SSA-form intermediate representation built for code
//! obfuscation passes, providing the fundamental building blocks:
//! - Type system (integers, floats, pointers, arrays, functions)
//! - Values, instructions and basic blocks in index arenas
//! - Functions and modules
//! - IR builder for programmatic construction
//! - CFG utilities, dominators and a structural verifier
//! - SSA repair (register/phi demotion), block splitting, single-block
//!   extraction, call inlining and predicate-based module cloning
//! - A textual printer and a reference interpreter for tests

pub mod analysis;
pub mod attributes;
pub mod basic_block;
pub mod builder;
pub mod cfg;
pub mod extractor;
pub mod function;
pub mod inliner;
pub mod instruction;
pub mod interp;
pub mod module;
pub mod printer;
pub mod ssa;
pub mod types;
pub mod value;
pub mod verify;

pub use attributes::{AttributeSet, FnAttr};
pub use basic_block::{BlockData, BlockId};
pub use builder::Builder;
pub use function::{Function, Param};
pub use instruction::{BinOp, Callee, CastOp, InlineAsm, InstData, InstId, InstKind, IntPredicate};
pub use module::{
    AliasId, DllStorageClass, FuncId, GlobalAlias, GlobalIFunc, GlobalId, GlobalVariable, GvRef,
    IFuncId, Linkage, Module, Visibility,
};
pub use types::{FloatKind, Type};
pub use value::{Constant, Value};
