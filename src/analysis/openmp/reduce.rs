//! Reduce-region exclusivity.
//!
//! The runtime serializes the body of a reduction, so two accesses inside
//! the same reduction's case-dispatch code cannot race. The blocks forming
//! that code are recovered from the switch that immediately follows the
//! reduce call: its case successors, walked down to (but excluding) its
//! default destination, which marks the end of the reduction.

use fnv::FnvHashMap;

use crate::ir::summary::MarkerKind;
use crate::ir::{BlockId, InstrKind, InstrSite, Module};
use crate::trace::{EventRef, ProgramTrace};

#[derive(Default)]
pub struct ReduceAnalysis {
    /// reduce call site -> blocks making up that reduction's body
    blocks: FnvHashMap<InstrSite, Vec<BlockId>>,
}

impl ReduceAnalysis {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks guarded by a reduce call; computed once per reduce site.
    fn reduce_blocks(&mut self, module: &Module, reduce: InstrSite) -> &[BlockId] {
        if !self.blocks.contains_key(&reduce) {
            let computed = compute_guarded_blocks(module, reduce);
            self.blocks.insert(reduce, computed);
        }
        &self.blocks[&reduce]
    }

    fn reduce_contains(&mut self, module: &Module, reduce: InstrSite, site: InstrSite) -> bool {
        if reduce.func != site.func {
            return false;
        }
        let block = module.function(site.func).block_of(site.instr);
        self.reduce_blocks(module, reduce).contains(&block)
    }

    /// Scan forward on `a`'s thread. For each reduce marker seen before
    /// either event: both inside -> exclusive, exactly one inside -> a real
    /// candidate, neither -> keep scanning. Reaching one of the events
    /// without a verdict means no reduction covers the pair.
    pub fn in_same_reduce(
        &mut self,
        program: &ProgramTrace,
        a: EventRef,
        b: EventRef,
    ) -> bool {
        let module = program.module;
        let site_a = program.event(a).site;
        let site_b = program.event(b).site;

        for event in &program.thread(a.thread).events {
            if event.id == a.event || event.id == b.event {
                return false;
            }
            if event.marker() != Some(MarkerKind::Reduce) {
                continue;
            }
            let contains_a = self.reduce_contains(module, event.site, site_a);
            let contains_b = self.reduce_contains(module, event.site, site_b);
            if contains_a && contains_b {
                return true;
            }
            if contains_a || contains_b {
                return false;
            }
        }

        false
    }
}

/// Reachability walk from the dispatch switch's successors, stopping at
/// its default destination.
fn compute_guarded_blocks(module: &Module, reduce: InstrSite) -> Vec<BlockId> {
    let func = module.function(reduce.func);

    // the instruction after the reduce call should always be the dispatch switch
    let Some(next) = func.next_in_block(reduce.instr) else {
        return Vec::new();
    };
    let InstrKind::Switch { default, cases, .. } = &func.instr(next).kind else {
        tracing::warn!(
            func = %func.name,
            "reduce call not followed by dispatch switch"
        );
        return Vec::new();
    };

    let exit = *default;
    let mut blocks = Vec::new();
    let mut visited = vec![exit];
    let mut worklist: Vec<BlockId> = cases.iter().map(|(_, target)| *target).collect();

    while let Some(block) = worklist.pop() {
        if visited.contains(&block) {
            continue;
        }
        visited.push(block);
        blocks.push(block);
        for succ in func.successors(block) {
            if !visited.contains(&succ) {
                worklist.push(succ);
            }
        }
    }

    blocks
}
