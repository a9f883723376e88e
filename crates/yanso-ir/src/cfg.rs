//! Control Flow Graph Utilities

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use std::collections::VecDeque;

use crate::basic_block::BlockId;
use crate::function::Function;

/// Successor/predecessor edges of a function, computed once from the
/// terminators.
pub struct Cfg {
    succs: FxHashMap<BlockId, SmallVec<[BlockId; 2]>>,
    preds: FxHashMap<BlockId, SmallVec<[BlockId; 2]>>,
    entry: BlockId,
}

impl Cfg {
    pub fn new(func: &Function) -> Self {
        let mut succs: FxHashMap<BlockId, SmallVec<[BlockId; 2]>> = FxHashMap::default();
        let mut preds: FxHashMap<BlockId, SmallVec<[BlockId; 2]>> = FxHashMap::default();
        for &b in func.block_order() {
            succs.entry(b).or_default();
            preds.entry(b).or_default();
        }
        for &b in func.block_order() {
            for s in func.successors(b) {
                succs.get_mut(&b).unwrap().push(s);
                preds.entry(s).or_default().push(b);
            }
        }
        Self { succs, preds, entry: func.entry() }
    }

    pub fn entry(&self) -> BlockId {
        self.entry
    }

    pub fn successors(&self, b: BlockId) -> &[BlockId] {
        self.succs.get(&b).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn predecessors(&self, b: BlockId) -> &[BlockId] {
        self.preds.get(&b).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// All blocks reachable from the entry block.
    pub fn reachable_blocks(&self) -> FxHashSet<BlockId> {
        let mut reachable = FxHashSet::default();
        let mut queue = VecDeque::new();
        queue.push_back(self.entry);
        reachable.insert(self.entry);
        while let Some(current) = queue.pop_front() {
            for &succ in self.successors(current) {
                if reachable.insert(succ) {
                    queue.push_back(succ);
                }
            }
        }
        reachable
    }

    /// Reverse postorder over the reachable subgraph.
    pub fn reverse_postorder(&self) -> Vec<BlockId> {
        let mut visited = FxHashSet::default();
        let mut postorder = Vec::new();
        self.dfs_postorder(self.entry, &mut visited, &mut postorder);
        postorder.reverse();
        postorder
    }

    fn dfs_postorder(
        &self,
        block: BlockId,
        visited: &mut FxHashSet<BlockId>,
        postorder: &mut Vec<BlockId>,
    ) {
        if !visited.insert(block) {
            return;
        }
        for &succ in self.successors(block) {
            self.dfs_postorder(succ, visited, postorder);
        }
        postorder.push(block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Builder;
    use crate::function::{Function, Param};
    use crate::instruction::IntPredicate;
    use crate::types::Type;
    use crate::value::Value;

    fn diamond() -> (Function, BlockId, BlockId, BlockId, BlockId) {
        let mut f = Function::new("d", Type::I32, vec![Param::new(Type::I32)]);
        let entry = f.add_block("entry");
        let then_b = f.add_block("then");
        let else_b = f.add_block("else");
        let join = f.add_block("join");
        let mut b = Builder::at_end(&mut f, entry);
        let c = b.build_icmp(IntPredicate::SGT, Value::Arg(0), b.const_i32(0));
        b.build_cond_br(c, then_b, else_b);
        Builder::at_end(&mut f, then_b).build_br(join);
        Builder::at_end(&mut f, else_b).build_br(join);
        Builder::at_end(&mut f, join).build_ret(Some(Value::Arg(0)));
        (f, entry, then_b, else_b, join)
    }

    #[test]
    fn test_edges() {
        let (f, entry, then_b, else_b, join) = diamond();
        let cfg = Cfg::new(&f);
        assert_eq!(cfg.successors(entry), &[then_b, else_b]);
        assert_eq!(cfg.predecessors(join), &[then_b, else_b]);
        assert!(cfg.predecessors(entry).is_empty());
    }

    #[test]
    fn test_reachable_and_rpo() {
        let (mut f, entry, _, _, join) = diamond();
        let orphan = f.add_block("orphan");
        Builder::at_end(&mut f, orphan).build_unreachable();
        let cfg = Cfg::new(&f);
        let reachable = cfg.reachable_blocks();
        assert_eq!(reachable.len(), 4);
        assert!(!reachable.contains(&orphan));
        let rpo = cfg.reverse_postorder();
        assert_eq!(rpo[0], entry);
        assert_eq!(*rpo.last().unwrap(), join);
    }
}
