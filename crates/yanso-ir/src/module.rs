//! Modules
//!
//! A module is the top-level container: functions, global variables,
//! aliases, ifuncs, the target triple and an optional blob of module
//! inline assembly. Global values are arena slots addressed by typed
//! ids; erasing leaves a tombstone so ids stay stable.

use std::fmt;

use crate::function::Function;
use crate::instruction::{Callee, InstKind};
use crate::types::Type;
use crate::value::Value;

/// Handle of a function in its module.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct FuncId(pub u32);

/// Handle of a global variable in its module.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct GlobalId(pub u32);

/// Handle of a global alias in its module.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct AliasId(pub u32);

/// Handle of a global ifunc in its module.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct IFuncId(pub u32);

impl FuncId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl GlobalId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A reference to any global value in a module.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum GvRef {
    Func(FuncId),
    Global(GlobalId),
    Alias(AliasId),
    IFunc(IFuncId),
}

/// Linkage of a global value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Linkage {
    External,
    Internal,
}

impl Linkage {
    pub fn is_local(self) -> bool {
        matches!(self, Linkage::Internal)
    }
}

/// Symbol visibility.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Visibility {
    #[default]
    Default,
    Hidden,
}

/// DLL storage class, used by the module splitter to mark which part
/// exports each symbol.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum DllStorageClass {
    #[default]
    None,
    Import,
    Export,
}

/// Calling convention ids. The obfuscated range is the contiguous set
/// of non-standard conventions the backend is expected to honor.
pub mod calling_conv {
    pub const C: u32 = 0;
    pub const FAST: u32 = 8;
    pub const OBF_CALL_START: u32 = 160;
    pub const OBF_CALL_END: u32 = 175;
}

/// A global variable.
#[derive(Clone, Debug)]
pub struct GlobalVariable {
    pub name: String,
    pub linkage: Linkage,
    pub visibility: Visibility,
    pub dll_storage: DllStorageClass,
    pub dso_local: bool,
    pub comdat: Option<String>,
    /// Type of the stored value; the global itself evaluates to a
    /// pointer.
    pub ty: Type,
    pub is_constant: bool,
    /// `None` makes this a declaration.
    pub init: Option<Value>,
}

impl GlobalVariable {
    pub fn new(name: impl Into<String>, ty: Type, init: Option<Value>) -> Self {
        Self {
            name: name.into(),
            linkage: Linkage::External,
            visibility: Visibility::Default,
            dll_storage: DllStorageClass::None,
            dso_local: true,
            comdat: None,
            ty,
            is_constant: false,
            init,
        }
    }

    pub fn is_declaration(&self) -> bool {
        self.init.is_none()
    }
}

/// An alias for another global value.
#[derive(Clone, Debug)]
pub struct GlobalAlias {
    pub name: String,
    pub linkage: Linkage,
    pub visibility: Visibility,
    pub dll_storage: DllStorageClass,
    pub dso_local: bool,
    pub aliasee: GvRef,
}

/// An indirect function, resolved at load time.
#[derive(Clone, Debug)]
pub struct GlobalIFunc {
    pub name: String,
    pub linkage: Linkage,
    pub visibility: Visibility,
    pub dll_storage: DllStorageClass,
    pub dso_local: bool,
    pub resolver: FuncId,
}

/// A module: the unit every module pass operates on.
#[derive(Clone)]
pub struct Module {
    pub name: String,
    pub target_triple: String,
    pub module_asm: String,
    functions: Vec<Option<Function>>,
    globals: Vec<Option<GlobalVariable>>,
    aliases: Vec<Option<GlobalAlias>>,
    ifuncs: Vec<Option<GlobalIFunc>>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target_triple: String::new(),
            module_asm: String::new(),
            functions: Vec::new(),
            globals: Vec::new(),
            aliases: Vec::new(),
            ifuncs: Vec::new(),
        }
    }

    // Functions

    pub fn add_function(&mut self, f: Function) -> FuncId {
        let id = FuncId(self.functions.len() as u32);
        self.functions.push(Some(f));
        id
    }

    pub fn func(&self, id: FuncId) -> &Function {
        self.functions[id.index()].as_ref().expect("function was erased")
    }

    pub fn func_mut(&mut self, id: FuncId) -> &mut Function {
        self.functions[id.index()].as_mut().expect("function was erased")
    }

    pub fn erase_function(&mut self, id: FuncId) {
        self.functions[id.index()] = None;
    }

    pub fn functions(&self) -> impl Iterator<Item = (FuncId, &Function)> {
        self.functions
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|f| (FuncId(i as u32), f)))
    }

    pub fn func_ids(&self) -> Vec<FuncId> {
        self.functions().map(|(id, _)| id).collect()
    }

    pub fn get_function(&self, name: &str) -> Option<FuncId> {
        self.functions().find(|(_, f)| f.name() == name).map(|(id, _)| id)
    }

    // Globals

    pub fn add_global(&mut self, g: GlobalVariable) -> GlobalId {
        let id = GlobalId(self.globals.len() as u32);
        self.globals.push(Some(g));
        id
    }

    pub fn global(&self, id: GlobalId) -> &GlobalVariable {
        self.globals[id.index()].as_ref().expect("global was erased")
    }

    pub fn global_mut(&mut self, id: GlobalId) -> &mut GlobalVariable {
        self.globals[id.index()].as_mut().expect("global was erased")
    }

    pub fn globals(&self) -> impl Iterator<Item = (GlobalId, &GlobalVariable)> {
        self.globals
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|g| (GlobalId(i as u32), g)))
    }

    pub fn global_ids(&self) -> Vec<GlobalId> {
        self.globals().map(|(id, _)| id).collect()
    }

    // Aliases and ifuncs

    pub fn add_alias(&mut self, a: GlobalAlias) -> AliasId {
        let id = AliasId(self.aliases.len() as u32);
        self.aliases.push(Some(a));
        id
    }

    pub fn alias(&self, id: AliasId) -> &GlobalAlias {
        self.aliases[id.0 as usize].as_ref().expect("alias was erased")
    }

    pub fn alias_mut(&mut self, id: AliasId) -> &mut GlobalAlias {
        self.aliases[id.0 as usize].as_mut().expect("alias was erased")
    }

    pub fn aliases(&self) -> impl Iterator<Item = (AliasId, &GlobalAlias)> {
        self.aliases
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|a| (AliasId(i as u32), a)))
    }

    pub fn add_ifunc(&mut self, i: GlobalIFunc) -> IFuncId {
        let id = IFuncId(self.ifuncs.len() as u32);
        self.ifuncs.push(Some(i));
        id
    }

    pub fn ifunc(&self, id: IFuncId) -> &GlobalIFunc {
        self.ifuncs[id.0 as usize].as_ref().expect("ifunc was erased")
    }

    pub fn ifunc_mut(&mut self, id: IFuncId) -> &mut GlobalIFunc {
        self.ifuncs[id.0 as usize].as_mut().expect("ifunc was erased")
    }

    pub fn ifuncs(&self) -> impl Iterator<Item = (IFuncId, &GlobalIFunc)> {
        self.ifuncs
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|f| (IFuncId(i as u32), f)))
    }

    /// All global values, functions first, in id order.
    pub fn global_values(&self) -> Vec<GvRef> {
        let mut out = Vec::new();
        out.extend(self.functions().map(|(id, _)| GvRef::Func(id)));
        out.extend(self.globals().map(|(id, _)| GvRef::Global(id)));
        out.extend(self.aliases().map(|(id, _)| GvRef::Alias(id)));
        out.extend(self.ifuncs().map(|(id, _)| GvRef::IFunc(id)));
        out
    }

    // Uses

    /// Whether any instruction, global initializer or alias still
    /// references the function, either as a value or as a call target.
    pub fn function_has_users(&self, target: FuncId) -> bool {
        for (_, f) in self.functions() {
            for id in f.inst_ids() {
                let kind = &f.inst(id).kind;
                if kind.operands().contains(&Value::Func(target)) {
                    return true;
                }
                match kind {
                    InstKind::Call { callee: Callee::Func(c), .. }
                    | InstKind::Invoke { callee: Callee::Func(c), .. }
                        if *c == target =>
                    {
                        return true;
                    }
                    _ => {}
                }
            }
        }
        if self.globals().any(|(_, g)| g.init == Some(Value::Func(target))) {
            return true;
        }
        if self.aliases().any(|(_, a)| a.aliasee == GvRef::Func(target)) {
            return true;
        }
        self.ifuncs().any(|(_, i)| i.resolver == target)
    }

    /// Clone the module, keeping only the definitions `keep` accepts.
    /// Rejected functions become declarations, rejected globals lose
    /// their initializer, rejected aliases and ifuncs are dropped.
    pub fn clone_with_predicate(&self, keep: impl Fn(GvRef) -> bool) -> Module {
        let mut part = self.clone();
        for id in part.func_ids() {
            if !keep(GvRef::Func(id)) {
                part.func_mut(id).discard_body();
            }
        }
        for id in part.global_ids() {
            if !keep(GvRef::Global(id)) {
                part.global_mut(id).init = None;
            }
        }
        for i in 0..part.aliases.len() {
            if part.aliases[i].is_some() && !keep(GvRef::Alias(AliasId(i as u32))) {
                part.aliases[i] = None;
            }
        }
        for i in 0..part.ifuncs.len() {
            if part.ifuncs[i].is_some() && !keep(GvRef::IFunc(IFuncId(i as u32))) {
                part.ifuncs[i] = None;
            }
        }
        part
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Module('{}', {} functions, {} globals)",
            self.name,
            self.functions().count(),
            self.globals().count()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::Param;

    #[test]
    fn test_module_creation() {
        let mut m = Module::new("test_module");
        assert_eq!(m.functions().count(), 0);
        let f = Function::new("f", Type::Void, vec![]);
        let id = m.add_function(f);
        assert_eq!(m.functions().count(), 1);
        assert_eq!(m.get_function("f"), Some(id));
    }

    #[test]
    fn test_erase_function_keeps_ids() {
        let mut m = Module::new("m");
        let a = m.add_function(Function::new("a", Type::Void, vec![]));
        let b = m.add_function(Function::new("b", Type::Void, vec![]));
        m.erase_function(a);
        assert_eq!(m.functions().count(), 1);
        assert_eq!(m.func(b).name(), "b");
    }

    #[test]
    fn test_clone_with_predicate() {
        let mut m = Module::new("m");
        let mut f = Function::new("f", Type::Void, vec![Param::new(Type::I32)]);
        let entry = f.add_block("entry");
        f.append_inst(entry, InstKind::Ret { value: None }, Type::Void, None);
        let fid = m.add_function(f);
        let gid = m.add_global(GlobalVariable::new("g", Type::I32, Some(Value::const_int(32, 1))));

        let keep_f = m.clone_with_predicate(|gv| gv == GvRef::Func(fid));
        assert!(!keep_f.func(fid).is_declaration());
        assert!(keep_f.global(gid).is_declaration());

        let keep_g = m.clone_with_predicate(|gv| gv == GvRef::Global(gid));
        assert!(keep_g.func(fid).is_declaration());
        assert!(!keep_g.global(gid).is_declaration());
    }

    #[test]
    fn test_function_has_users() {
        let mut m = Module::new("m");
        let callee = m.add_function(Function::new("callee", Type::Void, vec![]));
        let mut f = Function::new("caller", Type::Void, vec![]);
        let entry = f.add_block("entry");
        f.append_inst(
            entry,
            InstKind::Call { callee: Callee::Func(callee), args: Default::default(), conv: 0 },
            Type::Void,
            None,
        );
        f.append_inst(entry, InstKind::Ret { value: None }, Type::Void, None);
        m.add_function(f);
        assert!(m.function_has_users(callee));
        assert!(!m.function_has_users(FuncId(1)));
    }
}
