//! OpenMP semantic analysis: team membership, region exclusivity, and
//! parallel-loop index reasoning.
//!
//! Each sub-analysis answers one question about a pair of events from the
//! same OpenMP team; the driver consults them in cost order after the
//! generic filters have run.

pub mod array_index;
pub mod induction;
pub mod lastprivate;
pub mod reduce;
pub mod regions;
pub mod sections;
pub mod tid_guard;

use fnv::FnvHashMap;

use crate::ir::summary::{ForkKind, MarkerKind};
use crate::ir::Module;
use crate::trace::{EventRef, ProgramTrace, ThreadId};

use array_index::ArrayIndexAnalysis;
use lastprivate::LastprivateAnalysis;
use reduce::ReduceAnalysis;
use regions::{region_index_containing, scan_regions, Region};
use sections::SectionsAnalysis;
use tid_guard::TidGuardAnalysis;

pub struct OpenMpAnalysis<'m> {
    module: &'m Module,
    reduce: ReduceAnalysis,
    sections: SectionsAnalysis,
    tid_guards: TidGuardAnalysis,
    lastprivate: LastprivateAnalysis,
    array: ArrayIndexAnalysis<'m>,
    /// Cached omp-for regions per thread.
    for_loops: FnvHashMap<ThreadId, Vec<Region>>,
    /// Cached single regions per thread.
    singles: FnvHashMap<ThreadId, Vec<Region>>,
}

impl<'m> OpenMpAnalysis<'m> {
    pub fn new(program: &ProgramTrace<'m>) -> Self {
        let module = program.module;
        OpenMpAnalysis {
            module,
            reduce: ReduceAnalysis::new(),
            sections: SectionsAnalysis::new(),
            tid_guards: TidGuardAnalysis::new(module),
            lastprivate: LastprivateAnalysis::new(module),
            array: ArrayIndexAnalysis::new(module),
            for_loops: FnvHashMap::default(),
            singles: FnvHashMap::default(),
        }
    }

    /// True if both events belong to the same OpenMP team: their innermost
    /// enclosing parallel forks (walking through task forks) come from the
    /// same thread and are id-adjacent, per the duplicated-fork convention.
    pub fn from_same_parallel_region(
        &self,
        program: &ProgramTrace,
        a: EventRef,
        b: EventRef,
    ) -> bool {
        let (Some(fa), Some(fb)) = (
            enclosing_parallel_fork(program, a.thread),
            enclosing_parallel_fork(program, b.thread),
        ) else {
            return false;
        };
        fa.thread == fb.thread && fa.event.abs_diff(fb.event) <= 1
    }

    /// Cached list of omp-for loop regions on a thread.
    pub fn omp_for_loops(&mut self, program: &ProgramTrace, thread: ThreadId) -> &[Region] {
        self.for_loops
            .entry(thread)
            .or_insert_with(|| {
                scan_regions(
                    &program.thread(thread).events,
                    MarkerKind::ForInit,
                    MarkerKind::ForFini,
                )
            })
            .as_slice()
    }

    fn in_parallel_for(&mut self, program: &ProgramTrace, event: EventRef) -> bool {
        let regions = self.omp_for_loops(program, event.thread);
        regions::in_any_region(regions, event.event)
    }

    fn single_regions(&mut self, program: &ProgramTrace, thread: ThreadId) -> &[Region] {
        self.singles
            .entry(thread)
            .or_insert_with(|| {
                scan_regions(
                    &program.thread(thread).events,
                    MarkerKind::SingleStart,
                    MarkerKind::SingleEnd,
                )
            })
            .as_slice()
    }

    /// True if both events sit inside the same single region: only one
    /// thread ever executes a single body, so the pair cannot race.
    /// Regions are matched by start/end instruction identity, and by
    /// ordinal when the two threads' traces have the same region count
    /// (trace shapes can differ when master regions were skipped).
    pub fn in_same_single_block(
        &mut self,
        program: &ProgramTrace,
        a: EventRef,
        b: EventRef,
    ) -> bool {
        let Some((ia, ra, na)) = self.locate_single(program, a) else {
            return false;
        };
        let Some((ib, rb, nb)) = self.locate_single(program, b) else {
            return false;
        };

        let bounds = |thread: ThreadId, r: Region| {
            let events = &program.thread(thread).events;
            (events[r.start].site, events[r.end].site)
        };
        let (start_a, end_a) = bounds(a.thread, ra);
        let (start_b, end_b) = bounds(b.thread, rb);
        if start_a != start_b || end_a != end_b {
            return false;
        }

        na != nb || ia == ib
    }

    fn locate_single(
        &mut self,
        program: &ProgramTrace,
        event: EventRef,
    ) -> Option<(usize, Region, usize)> {
        let regions = self.single_regions(program, event.thread);
        let index = region_index_containing(regions, event.event)?;
        Some((index, regions[index], regions.len()))
    }

    /// True if both events fall inside the same reduction's dispatch body.
    pub fn in_same_reduce(&mut self, program: &ProgramTrace, a: EventRef, b: EventRef) -> bool {
        self.reduce.in_same_reduce(program, a, b)
    }

    /// True if both events map to the same sections case block.
    pub fn inside_compatible_sections(
        &mut self,
        program: &ProgramTrace,
        a: EventRef,
        b: EventRef,
    ) -> bool {
        self.sections.inside_compatible_sections(program, a, b)
    }

    /// True if both events are guarded by equality checks of
    /// `omp_get_thread_num()` against the same constant.
    pub fn guarded_by_same_tid(&self, program: &ProgramTrace, a: EventRef, b: EventRef) -> bool {
        self.tid_guards.guarded_by_same_tid(
            self.module,
            program.event(a).site,
            program.event(b).site,
        )
    }

    /// True if the event sits in a lastprivate copy-out block.
    pub fn is_in_lastprivate(&self, program: &ProgramTrace, event: EventRef) -> bool {
        self.lastprivate
            .is_guarded(self.module, program.event(event).site)
    }

    /// True if both events are array accesses in the same worksharing loop
    /// whose index sets provably never overlap.
    pub fn is_non_overlapping_loop_access(
        &mut self,
        program: &ProgramTrace,
        a: EventRef,
        b: EventRef,
    ) -> bool {
        if self.array.array_gep(program, a).is_none() || self.array.array_gep(program, b).is_none()
        {
            return false;
        }
        if !self.in_parallel_for(program, a) || !self.in_parallel_for(program, b) {
            return false;
        }
        !self.array.can_index_overlap(program, a, b)
    }
}

/// The innermost enclosing *parallel* fork of a thread, following through
/// task forks to the thread that spawned them.
fn enclosing_parallel_fork(program: &ProgramTrace, mut thread: ThreadId) -> Option<EventRef> {
    loop {
        let t = program.thread(thread);
        let spawn = t.spawn?;
        match t.spawn_kind? {
            ForkKind::OmpParallel { .. } => return Some(spawn),
            ForkKind::OmpTask => thread = spawn.thread,
            ForkKind::OmpTeams { .. } | ForkKind::Pthread => return None,
        }
    }
}
