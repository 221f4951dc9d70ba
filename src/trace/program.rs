//! The whole-program trace: every thread reachable from the entry point.

use std::fmt;

use fnv::FnvHashMap;
use tracing::debug;

use crate::ir::summary::SummaryBuilder;
use crate::ir::{InstrSite, Module};
use crate::trace::event::{Event, EventRef, ThreadId};
use crate::trace::thread::{build_thread, ThreadTrace};
use crate::trace::TraceError;

/// An OpenMP task forked but not yet joined. Joins are forced at the next
/// barrier, taskwait, or enclosing region end, in creation order.
#[derive(Debug, Clone, Copy)]
pub struct UnjoinedTask {
    pub child: ThreadId,
    pub site: InstrSite,
}

/// OpenMP-specific state threaded through trace construction. Scoped to the
/// build; discarded once the trace exists.
#[derive(Debug, Default)]
pub struct OpenMpState {
    /// Nesting depth of `fork_teams` regions.
    teams_depth: usize,
    /// Whether construction is currently inside a single region.
    pub in_single: bool,
    /// Completed master regions: start site -> end site.
    master_regions: FnvHashMap<InstrSite, InstrSite>,
    current_master_start: Option<InstrSite>,
    pub unjoined_tasks: Vec<UnjoinedTask>,
}

impl OpenMpState {
    pub fn in_teams(&self) -> bool {
        self.teams_depth > 0
    }

    pub fn enter_teams(&mut self) {
        self.teams_depth += 1;
    }

    pub fn leave_teams(&mut self) {
        self.teams_depth -= 1;
    }

    /// Record the start of a master region on the master thread.
    pub fn mark_master_start(&mut self, start: InstrSite, func: &str) -> Result<(), TraceError> {
        if self.current_master_start.is_some() {
            return Err(TraceError::MalformedMasterRegion {
                func: func.to_string(),
            });
        }
        self.current_master_start = Some(start);
        Ok(())
    }

    /// Record the end of the currently open master region.
    pub fn mark_master_end(&mut self, end: InstrSite, func: &str) -> Result<(), TraceError> {
        let Some(start) = self.current_master_start.take() else {
            return Err(TraceError::MalformedMasterRegion {
                func: func.to_string(),
            });
        };
        self.master_regions.insert(start, end);
        Ok(())
    }

    /// End site of a master region previously traversed by the master
    /// thread. The master thread always runs first in a duplicated fork
    /// pair, so the map is populated before any worker looks here.
    pub fn master_region_end(&self, start: InstrSite) -> Option<InstrSite> {
        self.master_regions.get(&start).copied()
    }
}

/// Mutable state for one whole-program trace construction, passed by
/// reference through the recursive build.
pub struct TraceBuildState {
    pub summaries: SummaryBuilder,
    pub openmp: OpenMpState,
    /// When set, ops are skipped until this instruction is reached.
    pub skip_until: Option<InstrSite>,
    next_tid: u32,
}

impl TraceBuildState {
    pub fn new() -> Self {
        TraceBuildState {
            summaries: SummaryBuilder::new(),
            openmp: OpenMpState::default(),
            skip_until: None,
            next_tid: 0,
        }
    }

    pub fn alloc_tid(&mut self) -> ThreadId {
        let tid = ThreadId(self.next_tid);
        self.next_tid += 1;
        tid
    }
}

impl Default for TraceBuildState {
    fn default() -> Self {
        Self::new()
    }
}

/// One interleaving-agnostic linearization of every thread's actions,
/// rooted at the program entry point. Threads form a fork tree; the flat
/// index here is in creation (preorder) order, so thread ids are unique and
/// stable once assigned.
#[derive(Debug)]
pub struct ProgramTrace<'m> {
    pub module: &'m Module,
    threads: Vec<ThreadTrace>,
}

impl<'m> ProgramTrace<'m> {
    /// Symbolically execute the module from `entry_name`, producing the
    /// whole fork tree of thread traces.
    pub fn build(module: &'m Module, entry_name: &str) -> Result<Self, TraceError> {
        let entry = module
            .func_by_name(entry_name)
            .ok_or_else(|| TraceError::MissingEntry(entry_name.to_string()))?;

        let mut state = TraceBuildState::new();
        let mut slots: Vec<Option<ThreadTrace>> = Vec::new();

        let main_tid = state.alloc_tid();
        build_thread(module, entry, main_tid, None, &mut state, &mut slots)?;

        let threads: Vec<ThreadTrace> = slots
            .into_iter()
            .map(|slot| slot.expect("every allocated thread slot is filled by construction"))
            .collect();

        debug!(threads = threads.len(), "program trace built");
        Ok(ProgramTrace { module, threads })
    }

    pub fn threads(&self) -> &[ThreadTrace] {
        &self.threads
    }

    pub fn thread(&self, id: ThreadId) -> &ThreadTrace {
        &self.threads[id.0 as usize]
    }

    pub fn main_thread(&self) -> &ThreadTrace {
        &self.threads[0]
    }

    pub fn event(&self, eref: EventRef) -> &Event {
        &self.thread(eref.thread).events[eref.event]
    }
}

impl fmt::Display for ProgramTrace<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "===== Program Trace =====")?;
        for thread in &self.threads {
            write!(f, "---Thread{}", thread.id.0)?;
            if let Some(spawn) = thread.spawn {
                write!(f, "  (Spawned by {}:{})", spawn.thread, spawn.event)?;
            }
            writeln!(f)?;
            for event in &thread.events {
                write!(f, "{:>4} {}", event.id, event.kind)?;
                if let Some(loc) = self.module.loc_of(event.site) {
                    write!(f, "  [{loc}]")?;
                }
                writeln!(f)?;
            }
        }
        writeln!(f, "========================")
    }
}
