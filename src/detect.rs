//! The race detection driver.
//!
//! Enumerates candidate conflicting access pairs per shared object and
//! threads them through the filters in a fixed short-circuit order: cheap
//! set and graph lookups first, the symbolic loop reasoning last.

use tracing::debug;

use crate::analysis::alias::{ModulePointsTo, PointsTo};
use crate::analysis::happens_before::HappensBeforeGraph;
use crate::analysis::lockset::LockSet;
use crate::analysis::openmp::OpenMpAnalysis;
use crate::analysis::shared_memory::SharedMemory;
use crate::analysis::thread_local::ThreadLocalAnalysis;
use crate::ir::Module;
use crate::report::{Report, Reporter};
use crate::trace::{EventRef, ProgramTrace, TraceError};

#[derive(Debug, Clone)]
pub struct DetectConfig {
    /// Entry function the trace is rooted at.
    pub entry: String,
    /// Dump the program trace to stdout before analysis.
    pub print_trace: bool,
}

impl Default for DetectConfig {
    fn default() -> Self {
        DetectConfig {
            entry: "main".to_string(),
            print_trace: false,
        }
    }
}

/// Run the full pipeline: trace construction, the analyses, and the pair
/// enumeration. Returns every surviving candidate pair as the report.
pub fn detect_races(module: &Module, config: &DetectConfig) -> Result<Report, TraceError> {
    let program = ProgramTrace::build(module, &config.entry)?;

    if config.print_trace {
        println!("{program}");
    }

    let points_to = ModulePointsTo::new(module, &program);
    let shared_memory = SharedMemory::new(&program, &points_to);
    let happens_before = HappensBeforeGraph::new(&program);
    let mut lockset = LockSet::new(&program);
    let thread_local = ThreadLocalAnalysis::new();
    let mut openmp = OpenMpAnalysis::new(&program);

    let mut reporter = Reporter::new();

    for &obj in shared_memory.shared_objects() {
        let threaded_writes = shared_memory.threaded_writes(obj);
        let threaded_reads = shared_memory.threaded_reads(obj);

        for (bucket, (&write_tid, writes)) in threaded_writes.iter().enumerate() {
            // write/read pairs across threads
            for (&read_tid, reads) in threaded_reads {
                if write_tid == read_tid {
                    continue;
                }
                for &write in writes {
                    for &read in reads {
                        check_race(
                            &program,
                            &points_to,
                            &happens_before,
                            &mut lockset,
                            &thread_local,
                            &mut openmp,
                            &mut reporter,
                            write,
                            read,
                        );
                    }
                }
            }

            // write/write pairs against later buckets only
            for (_, other_writes) in threaded_writes.iter().skip(bucket + 1) {
                for &write in writes {
                    for &other in other_writes {
                        check_race(
                            &program,
                            &points_to,
                            &happens_before,
                            &mut lockset,
                            &thread_local,
                            &mut openmp,
                            &mut reporter,
                            write,
                            other,
                        );
                    }
                }
            }
        }
    }

    Ok(reporter.into_report())
}

/// Apply the filter chain to one write/access pair; record survivors.
#[allow(clippy::too_many_arguments)]
fn check_race(
    program: &ProgramTrace,
    points_to: &ModulePointsTo,
    happens_before: &HappensBeforeGraph,
    lockset: &mut LockSet,
    thread_local: &ThreadLocalAnalysis,
    openmp: &mut OpenMpAnalysis,
    reporter: &mut Reporter,
    write: EventRef,
    other: EventRef,
) {
    let module = program.module;
    // buckets only ever hold memory access events
    let (Some(wptr), Some(optr)) = (
        program.event(write).access_ptr(),
        program.event(other).access_ptr(),
    ) else {
        return;
    };
    let waccess = (program.event(write).site.func, wptr);
    let oaccess = (program.event(other).site.func, optr);

    // the only shared objects are thread local
    if thread_local.is_thread_local_access(module, points_to, waccess, oaccess) {
        return;
    }

    // ordered, or protected by a common lock
    if !happens_before.are_parallel(write, other) || lockset.shares_lock(program, write, other) {
        return;
    }

    // provably disjoint memory
    if points_to.must_not_alias(waccess, oaccess) {
        return;
    }

    if openmp.from_same_parallel_region(program, write, other) {
        // Non-overlapping array accesses inside an OpenMP loop are not
        // races: even with A shared, each iteration can own its index.
        if openmp.is_non_overlapping_loop_access(program, write, other) {
            return;
        }

        // blocks that cannot race with blocks of the same kind in the
        // same team
        if openmp.in_same_single_block(program, write, other)
            || openmp.in_same_reduce(program, write, other)
            || openmp.inside_compatible_sections(program, write, other)
        {
            return;
        }

        // guaranteed to execute on the same thread
        if openmp.guarded_by_same_tid(program, write, other) {
            return;
        }

        // Lastprivate copy-out runs on one thread. Modeled as lastprivate
        // code never racing with other lastprivate code; see DESIGN.md for
        // the spec-level caveat.
        if openmp.is_in_lastprivate(program, write) && openmp.is_in_lastprivate(program, other) {
            return;
        }
    }

    debug!(?write, ?other, "race detected");
    reporter.collect(program, write, other);
}
