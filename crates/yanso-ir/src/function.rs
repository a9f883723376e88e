//! Functions
//!
//! A function owns its basic blocks and instructions in index arenas:
//! `InstId` and `BlockId` are indices into `Vec` storage, operand
//! edges are `Value` indices, and use lists are computed by scanning.
//! Erased instructions leave a tombstone so existing ids stay stable.
//!
//! Layout order (`block_order`) is the memory order of blocks; the
//! entry block is always first. Moving a block only reorders layout
//! and never changes control flow.

use smallvec::SmallVec;

use crate::attributes::AttributeSet;
use crate::basic_block::{BlockData, BlockId};
use crate::instruction::{InstData, InstId, InstKind};
use crate::module::{DllStorageClass, Linkage, Visibility};
use crate::types::{FunctionType, Type};
use crate::value::Value;

/// A formal parameter.
#[derive(Clone, Debug)]
pub struct Param {
    pub ty: Type,
    pub name: Option<String>,
    /// The operand passed for this parameter must be an immediate
    /// constant; such operands are never rewritten.
    pub immarg: bool,
}

impl Param {
    pub fn new(ty: Type) -> Self {
        Self { ty, name: None, immarg: false }
    }

    pub fn named(ty: Type, name: impl Into<String>) -> Self {
        Self { ty, name: Some(name.into()), immarg: false }
    }
}

/// A function definition or declaration.
#[derive(Clone)]
pub struct Function {
    name: String,
    pub linkage: Linkage,
    pub visibility: Visibility,
    pub dll_storage: DllStorageClass,
    pub dso_local: bool,
    pub comdat: Option<String>,
    pub calling_conv: u32,
    pub attrs: AttributeSet,
    pub is_var_arg: bool,
    ret_ty: Type,
    params: Vec<Param>,
    insts: Vec<Option<InstData>>,
    blocks: Vec<BlockData>,
    block_order: Vec<BlockId>,
}

impl Function {
    /// Create a declaration; adding a first block turns it into a
    /// definition.
    pub fn new(name: impl Into<String>, ret_ty: Type, params: Vec<Param>) -> Self {
        Self {
            name: name.into(),
            linkage: Linkage::External,
            visibility: Visibility::Default,
            dll_storage: DllStorageClass::None,
            dso_local: true,
            comdat: None,
            calling_conv: 0,
            attrs: AttributeSet::new(),
            is_var_arg: false,
            ret_ty,
            params,
            insts: Vec::new(),
            blocks: Vec::new(),
            block_order: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn ret_ty(&self) -> &Type {
        &self.ret_ty
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn func_ty(&self) -> FunctionType {
        FunctionType {
            ret: self.ret_ty.clone(),
            params: self.params.iter().map(|p| p.ty.clone()).collect(),
            is_var_arg: self.is_var_arg,
        }
    }

    pub fn is_declaration(&self) -> bool {
        self.block_order.is_empty()
    }

    /// Drop the body, leaving a declaration.
    pub fn discard_body(&mut self) {
        self.insts.clear();
        self.blocks.clear();
        self.block_order.clear();
    }

    // Blocks

    pub fn entry(&self) -> BlockId {
        *self.block_order.first().expect("function has no body")
    }

    pub fn num_blocks(&self) -> usize {
        self.block_order.len()
    }

    pub fn block_order(&self) -> &[BlockId] {
        &self.block_order
    }

    pub fn block(&self, b: BlockId) -> &BlockData {
        &self.blocks[b.index()]
    }

    pub fn block_mut(&mut self, b: BlockId) -> &mut BlockData {
        &mut self.blocks[b.index()]
    }

    fn alloc_block(&mut self, name: impl Into<String>) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BlockData::new(name));
        id
    }

    /// Append a block at the end of the layout.
    pub fn add_block(&mut self, name: impl Into<String>) -> BlockId {
        let id = self.alloc_block(name);
        self.block_order.push(id);
        id
    }

    pub fn insert_block_before(&mut self, before: BlockId, name: impl Into<String>) -> BlockId {
        let id = self.alloc_block(name);
        let pos = self.layout_position(before);
        self.block_order.insert(pos, id);
        id
    }

    pub fn insert_block_after(&mut self, after: BlockId, name: impl Into<String>) -> BlockId {
        let id = self.alloc_block(name);
        let pos = self.layout_position(after);
        self.block_order.insert(pos + 1, id);
        id
    }

    fn layout_position(&self, b: BlockId) -> usize {
        self.block_order
            .iter()
            .position(|x| *x == b)
            .expect("block not in layout")
    }

    /// Reposition `b` immediately before `target` in layout. CFG is
    /// unchanged.
    pub fn move_block_before(&mut self, b: BlockId, target: BlockId) {
        if b == target {
            return;
        }
        let from = self.layout_position(b);
        self.block_order.remove(from);
        let to = self.layout_position(target);
        self.block_order.insert(to, b);
    }

    /// Reposition `b` immediately after `target` in layout.
    pub fn move_block_after(&mut self, b: BlockId, target: BlockId) {
        if b == target {
            return;
        }
        let from = self.layout_position(b);
        self.block_order.remove(from);
        let to = self.layout_position(target);
        self.block_order.insert(to + 1, b);
    }

    /// Drop a block and all its instructions. The caller must have
    /// rewired every branch and use pointing into the block.
    pub fn erase_block(&mut self, b: BlockId) {
        let insts = std::mem::take(&mut self.blocks[b.index()].insts);
        for id in insts {
            self.insts[id.index()] = None;
        }
        let pos = self.layout_position(b);
        self.block_order.remove(pos);
    }

    // Instructions

    pub fn inst(&self, id: InstId) -> &InstData {
        self.insts[id.index()].as_ref().expect("instruction was erased")
    }

    pub fn inst_mut(&mut self, id: InstId) -> &mut InstData {
        self.insts[id.index()].as_mut().expect("instruction was erased")
    }

    pub fn try_inst(&self, id: InstId) -> Option<&InstData> {
        self.insts.get(id.index()).and_then(|s| s.as_ref())
    }

    /// Ids of all live instructions, in arena order.
    pub fn inst_ids(&self) -> impl Iterator<Item = InstId> + '_ {
        self.insts
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(i, _)| InstId(i as u32))
    }

    /// Total number of instructions across all blocks.
    pub fn inst_count(&self) -> usize {
        self.block_order.iter().map(|b| self.block(*b).len()).sum()
    }

    pub fn block_insts(&self, b: BlockId) -> &[InstId] {
        &self.blocks[b.index()].insts
    }

    pub fn append_inst(
        &mut self,
        b: BlockId,
        kind: InstKind,
        ty: Type,
        name: Option<String>,
    ) -> InstId {
        let at = self.blocks[b.index()].insts.len();
        self.insert_inst(b, at, kind, ty, name)
    }

    pub fn insert_inst(
        &mut self,
        b: BlockId,
        at: usize,
        kind: InstKind,
        ty: Type,
        name: Option<String>,
    ) -> InstId {
        let id = InstId(self.insts.len() as u32);
        self.insts.push(Some(InstData { kind, ty, block: b, name }));
        self.blocks[b.index()].insts.insert(at, id);
        id
    }

    /// Erase an instruction. It must have no remaining users.
    pub fn erase_inst(&mut self, id: InstId) {
        debug_assert!(
            !self.has_users(Value::Inst(id)),
            "erasing an instruction that still has users"
        );
        let b = self.inst(id).block;
        let insts = &mut self.blocks[b.index()].insts;
        let pos = insts.iter().position(|x| *x == id).expect("inst not in its block");
        insts.remove(pos);
        self.insts[id.index()] = None;
    }

    /// The terminator of `b`, if the block is terminated.
    pub fn terminator(&self, b: BlockId) -> Option<InstId> {
        let last = *self.blocks[b.index()].insts.last()?;
        self.inst(last).is_terminator().then_some(last)
    }

    /// Remove the terminator of `b`, leaving the block open.
    pub fn erase_terminator(&mut self, b: BlockId) {
        let term = self.terminator(b).expect("block has no terminator");
        let insts = &mut self.blocks[b.index()].insts;
        insts.pop();
        self.insts[term.index()] = None;
    }

    /// Index of the first non-phi position in `b`.
    pub fn first_insertion_pt(&self, b: BlockId) -> usize {
        self.blocks[b.index()]
            .insts
            .iter()
            .position(|id| !self.inst(*id).kind.is_phi())
            .unwrap_or(self.blocks[b.index()].insts.len())
    }

    /// Position of a live instruction as (block, index in block).
    pub fn position_of(&self, id: InstId) -> (BlockId, usize) {
        let b = self.inst(id).block;
        let pos = self
            .blocks[b.index()]
            .insts
            .iter()
            .position(|x| *x == id)
            .expect("inst not in its block");
        (b, pos)
    }

    // CFG edges

    pub fn successors(&self, b: BlockId) -> SmallVec<[BlockId; 2]> {
        match self.terminator(b) {
            Some(t) => self.inst(t).kind.successors(),
            None => SmallVec::new(),
        }
    }

    /// The unique predecessor of `b`, if it has exactly one.
    pub fn single_predecessor(&self, b: BlockId) -> Option<BlockId> {
        let mut found = None;
        for &p in &self.block_order {
            let n = self.successors(p).iter().filter(|s| **s == b).count();
            if n > 0 {
                if found.is_some() || n > 1 {
                    return None;
                }
                found = Some(p);
            }
        }
        found
    }

    pub fn has_invoke(&self) -> bool {
        self.inst_ids()
            .any(|id| matches!(self.inst(id).kind, InstKind::Invoke { .. }))
    }

    // Values and uses

    pub fn value_type(&self, v: Value) -> Type {
        match v {
            Value::Const(c) => c.ty(),
            Value::Arg(i) => self.params[i as usize].ty.clone(),
            Value::Inst(id) => self.inst(id).ty.clone(),
            Value::Global(_) | Value::Func(_) => Type::Ptr,
        }
    }

    /// Instructions using `v` as a value operand. Call targets are not
    /// value operands.
    pub fn users_of(&self, v: Value) -> Vec<InstId> {
        self.inst_ids()
            .filter(|id| self.inst(*id).kind.operands().contains(&v))
            .collect()
    }

    pub fn has_users(&self, v: Value) -> bool {
        self.inst_ids()
            .any(|id| self.inst(id).kind.operands().contains(&v))
    }

    pub fn replace_all_uses_with(&mut self, from: Value, to: Value) {
        for i in 0..self.insts.len() {
            if let Some(data) = self.insts[i].as_mut() {
                data.kind.for_each_operand_mut(|op| {
                    if *op == from {
                        *op = to;
                    }
                });
            }
        }
    }

    /// True when the result of `id` is used outside its own block or
    /// by a phi node.
    pub fn value_escapes(&self, id: InstId) -> bool {
        let home = self.inst(id).block;
        self.users_of(Value::Inst(id))
            .iter()
            .any(|u| self.inst(*u).block != home || self.inst(*u).kind.is_phi())
    }

    // Structural edits

    /// Split `b` at instruction index `at`: the suffix moves to a new
    /// block placed right after `b` in layout, and `b` ends with an
    /// unconditional branch to it. Phi nodes in the successors of the
    /// moved terminator are re-pointed at the new block.
    pub fn split_block(&mut self, b: BlockId, at: usize, name: impl Into<String>) -> BlockId {
        let nb = self.insert_block_after(b, name);
        let moved = self.blocks[b.index()].insts.split_off(at);
        for &id in &moved {
            self.insts[id.index()].as_mut().unwrap().block = nb;
        }
        self.blocks[nb.index()].insts = moved;
        self.append_inst(b, InstKind::Br { dest: nb }, Type::Void, None);

        for succ in self.successors(nb) {
            let phis: Vec<InstId> = self
                .block_insts(succ)
                .iter()
                .copied()
                .filter(|id| self.inst(*id).kind.is_phi())
                .collect();
            for phi in phis {
                if let InstKind::Phi { incoming } = &mut self.inst_mut(phi).kind {
                    for (_, pred) in incoming.iter_mut() {
                        if *pred == b {
                            *pred = nb;
                        }
                    }
                }
            }
        }
        nb
    }

    /// Add an incoming edge to a phi node.
    pub fn phi_add_incoming(&mut self, phi: InstId, value: Value, pred: BlockId) {
        match &mut self.inst_mut(phi).kind {
            InstKind::Phi { incoming } => incoming.push((value, pred)),
            _ => panic!("not a phi node"),
        }
    }

    /// Add a case to a switch terminator.
    pub fn switch_add_case(&mut self, switch: InstId, value: u64, dest: BlockId) {
        match &mut self.inst_mut(switch).kind {
            InstKind::Switch { cases, .. } => cases.push((value, dest)),
            _ => panic!("not a switch"),
        }
    }

    /// Set the calling convention recorded on a call or invoke site.
    pub fn set_call_conv(&mut self, site: InstId, cc: u32) {
        match &mut self.inst_mut(site).kind {
            InstKind::Call { conv, .. } | InstKind::Invoke { conv, .. } => *conv = cc,
            _ => panic!("not a call site"),
        }
    }
}

impl std::fmt::Debug for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Function(@{}, {} blocks, {} insts)",
            self.name,
            self.num_blocks(),
            self.inst_count()
        )
    }
}
