//! Compatible-sections exclusivity.
//!
//! The case blocks of an OpenMP `sections` construct are distributed across
//! the team, and each case runs exactly once. Two accesses that map to the
//! same case block therefore cannot run concurrently. An access maps to a
//! case by walking its thread's events and tracking the most recently
//! entered section case; events inside functions called from a section
//! inherit the current case. If either access cannot be mapped to a case
//! the pair is treated as incompatible (kept as a race candidate).

use fnv::FnvHashMap;

use crate::ir::summary::MarkerKind;
use crate::ir::{BlockId, InstrKind, InstrSite, Module};
use crate::trace::{EventRef, ProgramTrace};

/// Identity of one section case: the dispatch switch plus case ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SectionCase {
    switch: InstrSite,
    case: usize,
}

#[derive(Default)]
pub struct SectionsAnalysis {
    /// dispatch switch -> per-case block sets
    cases: FnvHashMap<InstrSite, Vec<Vec<BlockId>>>,
}

impl SectionsAnalysis {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inside_compatible_sections(
        &mut self,
        program: &ProgramTrace,
        a: EventRef,
        b: EventRef,
    ) -> bool {
        let (Some(case_a), Some(case_b)) = (self.section_of(program, a), self.section_of(program, b))
        else {
            // membership could not be determined for one side; assume not
            // compatible and let the pair stay a candidate
            return false;
        };
        case_a == case_b
    }

    /// The section case active at `target`, found by walking the thread's
    /// events up to and including the target event.
    fn section_of(&mut self, program: &ProgramTrace, target: EventRef) -> Option<SectionCase> {
        let module = program.module;
        let mut active_switch: Option<InstrSite> = None;
        let mut current: Option<SectionCase> = None;

        for event in &program.thread(target.thread).events {
            if event.id > target.event {
                break;
            }
            match event.marker() {
                Some(MarkerKind::SectionsStart) => {
                    active_switch = dispatch_switch(module, event.site);
                    current = None;
                }
                Some(MarkerKind::SectionsEnd) => {
                    active_switch = None;
                    current = None;
                }
                _ => {}
            }

            if let Some(switch) = active_switch {
                if event.site.func == switch.func {
                    let block = module.function(event.site.func).block_of(event.site.instr);
                    for (case, blocks) in self.case_blocks(module, switch).iter().enumerate() {
                        if blocks.contains(&block) {
                            current = Some(SectionCase { switch, case });
                            break;
                        }
                    }
                }
            }

            if event.id == target.event {
                return current;
            }
        }

        None
    }

    /// Per-case block sets of a sections dispatch switch: each case's
    /// successor walked down to (excluding) the default destination.
    fn case_blocks(&mut self, module: &Module, switch: InstrSite) -> &[Vec<BlockId>] {
        if !self.cases.contains_key(&switch) {
            let func = module.function(switch.func);
            let mut all = Vec::new();
            if let InstrKind::Switch { default, cases, .. } = &func.instr(switch.instr).kind {
                for (_, target) in cases {
                    all.push(blocks_until(module, switch.func, *target, *default));
                }
            }
            self.cases.insert(switch, all);
        }
        &self.cases[&switch]
    }
}

/// The dispatch switch driving a sections region: the next instruction
/// after the sections-start call.
fn dispatch_switch(module: &Module, start: InstrSite) -> Option<InstrSite> {
    let func = module.function(start.func);
    let next = func.next_in_block(start.instr)?;
    matches!(func.instr(next).kind, InstrKind::Switch { .. }).then_some(InstrSite {
        func: start.func,
        instr: next,
    })
}

/// Blocks reachable from `seed` without passing through `stop`.
pub(crate) fn blocks_until(
    module: &Module,
    func: crate::ir::FuncId,
    seed: BlockId,
    stop: BlockId,
) -> Vec<BlockId> {
    let f = module.function(func);
    let mut blocks = Vec::new();
    let mut visited = vec![stop];
    let mut worklist = vec![seed];

    while let Some(block) = worklist.pop() {
        if visited.contains(&block) {
            continue;
        }
        visited.push(block);
        blocks.push(block);
        for succ in f.successors(block) {
            if !visited.contains(&succ) {
                worklist.push(succ);
            }
        }
    }

    blocks
}
