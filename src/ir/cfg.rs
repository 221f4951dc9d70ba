//! Control-flow derivations over a [`Function`]: predecessors, reverse
//! postorder, dominators, and natural loops.
//!
//! The OpenMP analyses need exactly three CFG facts: "does block A dominate
//! block B" (static loop-bound resolution), "which blocks form this natural
//! loop" (induction-variable recognition), and predecessor lists (guarded
//! block computation). Everything is computed once per function and cached
//! by the callers that need it.

use std::collections::BTreeSet;

use crate::ir::{BlockId, Function, InstrId};

/// Per-function control-flow facts.
#[derive(Debug, Clone)]
pub struct Cfg {
    succs: Vec<Vec<BlockId>>,
    preds: Vec<Vec<BlockId>>,
    rpo: Vec<BlockId>,
    /// Immediate dominator per block; `None` for the entry and unreachable blocks.
    idom: Vec<Option<BlockId>>,
    /// Position of each block in `rpo`, or `usize::MAX` if unreachable.
    rpo_index: Vec<usize>,
}

impl Cfg {
    pub fn new(func: &Function) -> Self {
        let n = func.blocks.len();
        let succs: Vec<Vec<BlockId>> = (0..n)
            .map(|b| func.successors(BlockId(b as u32)))
            .collect();

        let mut preds = vec![Vec::new(); n];
        for (b, ss) in succs.iter().enumerate() {
            for s in ss {
                preds[s.0 as usize].push(BlockId(b as u32));
            }
        }

        let rpo = reverse_postorder(&succs, n);
        let mut rpo_index = vec![usize::MAX; n];
        for (i, b) in rpo.iter().enumerate() {
            rpo_index[b.0 as usize] = i;
        }

        let idom = compute_idoms(&preds, &rpo, &rpo_index, n);

        Cfg {
            succs,
            preds,
            rpo,
            idom,
            rpo_index,
        }
    }

    pub fn successors(&self, block: BlockId) -> &[BlockId] {
        &self.succs[block.0 as usize]
    }

    pub fn predecessors(&self, block: BlockId) -> &[BlockId] {
        &self.preds[block.0 as usize]
    }

    pub fn reverse_postorder(&self) -> &[BlockId] {
        &self.rpo
    }

    pub fn is_reachable(&self, block: BlockId) -> bool {
        self.rpo_index[block.0 as usize] != usize::MAX
    }

    /// Block-level dominance (reflexive).
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        if !self.is_reachable(a) || !self.is_reachable(b) {
            return false;
        }
        let mut cur = b;
        loop {
            if cur == a {
                return true;
            }
            match self.idom[cur.0 as usize] {
                Some(next) => cur = next,
                None => return false,
            }
        }
    }

    /// Instruction-level dominance within one function.
    pub fn instr_dominates(&self, func: &Function, a: InstrId, b: InstrId) -> bool {
        let (ba, bb) = (func.block_of(a), func.block_of(b));
        if ba == bb {
            return func.index_in_block(a) <= func.index_in_block(b);
        }
        self.dominates(ba, bb)
    }
}

fn reverse_postorder(succs: &[Vec<BlockId>], n: usize) -> Vec<BlockId> {
    if n == 0 {
        return Vec::new();
    }
    let mut visited = vec![false; n];
    let mut postorder = Vec::with_capacity(n);
    // Iterative DFS from the entry block with an explicit child cursor.
    let mut stack: Vec<(BlockId, usize)> = vec![(BlockId(0), 0)];
    visited[0] = true;
    while let Some(&(block, cursor)) = stack.last() {
        let ss = &succs[block.0 as usize];
        if cursor < ss.len() {
            if let Some(top) = stack.last_mut() {
                top.1 += 1;
            }
            let next = ss[cursor];
            if !visited[next.0 as usize] {
                visited[next.0 as usize] = true;
                stack.push((next, 0));
            }
        } else {
            postorder.push(block);
            stack.pop();
        }
    }
    postorder.reverse();
    postorder
}

/// Cooper/Harvey/Kennedy iterative dominator construction over RPO.
fn compute_idoms(
    preds: &[Vec<BlockId>],
    rpo: &[BlockId],
    rpo_index: &[usize],
    n: usize,
) -> Vec<Option<BlockId>> {
    let mut idom: Vec<Option<BlockId>> = vec![None; n];
    if n == 0 {
        return idom;
    }
    idom[0] = Some(BlockId(0));

    let intersect = |idom: &[Option<BlockId>], mut a: BlockId, mut b: BlockId| -> BlockId {
        while a != b {
            while rpo_index[a.0 as usize] > rpo_index[b.0 as usize] {
                a = idom[a.0 as usize].expect("processed block must have idom");
            }
            while rpo_index[b.0 as usize] > rpo_index[a.0 as usize] {
                b = idom[b.0 as usize].expect("processed block must have idom");
            }
        }
        a
    };

    let mut changed = true;
    while changed {
        changed = false;
        for &block in rpo.iter().skip(1) {
            let mut new_idom: Option<BlockId> = None;
            for &pred in &preds[block.0 as usize] {
                if idom[pred.0 as usize].is_none() {
                    continue;
                }
                new_idom = Some(match new_idom {
                    None => pred,
                    Some(cur) => intersect(&idom, cur, pred),
                });
            }
            if new_idom.is_some() && idom[block.0 as usize] != new_idom {
                idom[block.0 as usize] = new_idom;
                changed = true;
            }
        }
    }

    // Entry's idom is itself during computation; normalize to None for callers.
    idom[0] = None;
    idom
}

/// A natural loop discovered from a back edge `latch -> header`.
#[derive(Debug, Clone)]
pub struct Loop {
    pub header: BlockId,
    pub latch: BlockId,
    pub blocks: BTreeSet<BlockId>,
    /// Unique out-of-loop predecessor of the header, when there is one.
    pub preheader: Option<BlockId>,
}

impl Loop {
    pub fn contains(&self, block: BlockId) -> bool {
        self.blocks.contains(&block)
    }
}

/// All natural loops of a function. Back edges sharing a header are merged
/// into one loop body. Ordered by header id for determinism.
pub fn natural_loops(func: &Function, cfg: &Cfg) -> Vec<Loop> {
    let mut loops: Vec<Loop> = Vec::new();

    for b in 0..func.blocks.len() {
        let latch = BlockId(b as u32);
        if !cfg.is_reachable(latch) {
            continue;
        }
        for &header in cfg.successors(latch) {
            if !cfg.dominates(header, latch) {
                continue;
            }

            // Collect the loop body: header plus everything that reaches the
            // latch without passing through the header.
            let mut blocks = BTreeSet::new();
            blocks.insert(header);
            let mut worklist = vec![latch];
            while let Some(block) = worklist.pop() {
                if !blocks.insert(block) {
                    continue;
                }
                for &pred in cfg.predecessors(block) {
                    if !blocks.contains(&pred) {
                        worklist.push(pred);
                    }
                }
            }

            if let Some(existing) = loops.iter_mut().find(|l| l.header == header) {
                existing.blocks.extend(blocks);
            } else {
                loops.push(Loop {
                    header,
                    latch,
                    blocks,
                    preheader: None,
                });
            }
        }
    }

    for l in &mut loops {
        let outside: Vec<BlockId> = cfg
            .predecessors(l.header)
            .iter()
            .copied()
            .filter(|p| !l.blocks.contains(p))
            .collect();
        if let [single] = outside[..] {
            l.preheader = Some(single);
        }
    }

    loops.sort_by_key(|l| l.header);
    loops
}

/// The innermost loop containing `block`, by smallest body.
pub fn innermost_loop_of<'a>(loops: &'a [Loop], block: BlockId) -> Option<&'a Loop> {
    loops
        .iter()
        .filter(|l| l.contains(block))
        .min_by_key(|l| l.blocks.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Block, Instr, InstrKind, Value};

    fn branch(then_blk: u32, else_blk: Option<u32>, cond: Option<Value>) -> Instr {
        Instr {
            kind: InstrKind::Branch {
                cond,
                then_blk: BlockId(then_blk),
                else_blk: else_blk.map(BlockId),
            },
            loc: None,
        }
    }

    fn ret() -> Instr {
        Instr {
            kind: InstrKind::Return { value: None },
            loc: None,
        }
    }

    /// entry -> header; header -> body | exit; body -> header (back edge).
    fn loop_function() -> Function {
        Function::define(
            "looped",
            0,
            vec![
                Block {
                    instrs: vec![InstrId(0)],
                },
                Block {
                    instrs: vec![InstrId(1)],
                },
                Block {
                    instrs: vec![InstrId(2)],
                },
                Block {
                    instrs: vec![InstrId(3)],
                },
            ],
            vec![
                branch(1, None, None),
                branch(2, Some(3), Some(Value::Const(1))),
                branch(1, None, None),
                ret(),
            ],
        )
    }

    #[test]
    fn test_dominators_linear_chain() {
        let func = loop_function();
        let cfg = Cfg::new(&func);
        assert!(cfg.dominates(BlockId(0), BlockId(3)));
        assert!(cfg.dominates(BlockId(1), BlockId(2)));
        assert!(!cfg.dominates(BlockId(2), BlockId(1)));
        assert!(cfg.dominates(BlockId(1), BlockId(1)));
    }

    #[test]
    fn test_natural_loop_discovery() {
        let func = loop_function();
        let cfg = Cfg::new(&func);
        let loops = natural_loops(&func, &cfg);
        assert_eq!(loops.len(), 1);
        let l = &loops[0];
        assert_eq!(l.header, BlockId(1));
        assert_eq!(l.latch, BlockId(2));
        assert!(l.contains(BlockId(1)) && l.contains(BlockId(2)));
        assert!(!l.contains(BlockId(0)) && !l.contains(BlockId(3)));
        assert_eq!(l.preheader, Some(BlockId(0)));
    }

    #[test]
    fn test_innermost_loop_prefers_smaller_body() {
        // outer loop body {1,2,3}, inner self-loop on block 2
        let func = Function::define(
            "nested",
            0,
            vec![
                Block {
                    instrs: vec![InstrId(0)],
                },
                Block {
                    instrs: vec![InstrId(1)],
                },
                Block {
                    instrs: vec![InstrId(2)],
                },
                Block {
                    instrs: vec![InstrId(3)],
                },
                Block {
                    instrs: vec![InstrId(4)],
                },
            ],
            vec![
                branch(1, None, None),
                branch(2, None, None),
                // inner latch: back to inner header (2) or fall through to 3
                branch(2, Some(3), Some(Value::Const(1))),
                // outer latch: back to outer header (1) or exit
                branch(1, Some(4), Some(Value::Const(1))),
                ret(),
            ],
        );
        let cfg = Cfg::new(&func);
        let loops = natural_loops(&func, &cfg);
        assert_eq!(loops.len(), 2);
        let inner = innermost_loop_of(&loops, BlockId(2)).unwrap();
        assert_eq!(inner.header, BlockId(2));
    }

    #[test]
    fn test_instr_dominance_same_block_uses_order() {
        let func = loop_function();
        let cfg = Cfg::new(&func);
        assert!(cfg.instr_dominates(&func, InstrId(0), InstrId(3)));
        assert!(!cfg.instr_dominates(&func, InstrId(3), InstrId(0)));
    }
}
