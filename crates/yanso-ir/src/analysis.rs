//! Analyses
//!
//! Dominator computation over the block CFG, used by the verifier to
//! check that every use is dominated by its definition.

use rustc_hash::FxHashMap;

use crate::basic_block::BlockId;
use crate::cfg::Cfg;
use crate::function::Function;

/// Dominator tree, computed with the iterative data-flow algorithm
/// over reverse postorder. Unreachable blocks are not in the tree.
pub struct DominatorTree {
    idoms: FxHashMap<BlockId, BlockId>,
    rpo_index: FxHashMap<BlockId, usize>,
    entry: BlockId,
}

impl DominatorTree {
    pub fn new(func: &Function) -> Self {
        let cfg = Cfg::new(func);
        let rpo = cfg.reverse_postorder();
        let mut rpo_index = FxHashMap::default();
        for (i, b) in rpo.iter().enumerate() {
            rpo_index.insert(*b, i);
        }

        let entry = func.entry();
        let mut idoms: FxHashMap<BlockId, BlockId> = FxHashMap::default();
        idoms.insert(entry, entry);

        let mut changed = true;
        while changed {
            changed = false;
            for &block in rpo.iter().skip(1) {
                let mut new_idom: Option<BlockId> = None;
                for &pred in cfg.predecessors(block) {
                    if !idoms.contains_key(&pred) {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => pred,
                        Some(other) => Self::intersect(&idoms, &rpo_index, pred, other),
                    });
                }
                if let Some(idom) = new_idom {
                    if idoms.get(&block) != Some(&idom) {
                        idoms.insert(block, idom);
                        changed = true;
                    }
                }
            }
        }

        Self { idoms, rpo_index, entry }
    }

    fn intersect(
        idoms: &FxHashMap<BlockId, BlockId>,
        rpo_index: &FxHashMap<BlockId, usize>,
        mut b1: BlockId,
        mut b2: BlockId,
    ) -> BlockId {
        while b1 != b2 {
            while rpo_index[&b1] > rpo_index[&b2] {
                b1 = idoms[&b1];
            }
            while rpo_index[&b2] > rpo_index[&b1] {
                b2 = idoms[&b2];
            }
        }
        b1
    }

    /// Is `b` reachable from the entry block?
    pub fn is_reachable(&self, b: BlockId) -> bool {
        self.rpo_index.contains_key(&b)
    }

    /// Check if `a` dominates `b`. Unreachable blocks dominate nothing
    /// and are dominated by nothing (except themselves).
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        if a == b {
            return true;
        }
        if !self.is_reachable(a) || !self.is_reachable(b) {
            return false;
        }
        let mut current = b;
        while current != self.entry {
            current = self.idoms[&current];
            if current == a {
                return true;
            }
        }
        false
    }

    pub fn strictly_dominates(&self, a: BlockId, b: BlockId) -> bool {
        a != b && self.dominates(a, b)
    }

    pub fn idom(&self, b: BlockId) -> Option<BlockId> {
        if b == self.entry {
            return None;
        }
        self.idoms.get(&b).copied()
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

    #[test]
    fn test_diamond_dominators() {
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

        let dt = DominatorTree::new(&f);
        assert!(dt.dominates(entry, join));
        assert!(dt.dominates(entry, then_b));
        assert!(!dt.dominates(then_b, join));
        assert!(!dt.dominates(else_b, join));
        assert_eq!(dt.idom(join), Some(entry));
        assert_eq!(dt.idom(entry), None);
    }
}
