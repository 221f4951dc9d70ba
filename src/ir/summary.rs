//! Normalized per-function operation summaries.
//!
//! A [`FunctionSummary`] is the ordered list of trace-relevant operations in
//! one function body: memory accesses, calls, forks/joins, lock operations,
//! barriers, and OpenMP region markers. Summaries are the only input the
//! trace builder consumes, and they are memoized: each function is
//! summarized once and shared across every call site that references it.

use std::sync::Arc;

use fnv::FnvHashMap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::ir::{model, FuncId, InstrId, InstrKind, Module, Value};

/// Recognized-but-unmodeled synchronization is a hard error: continuing
/// would silently miscompute happens-before.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SummaryError {
    #[error("unmodeled OpenMP primitive `{name}` in function `{func}`")]
    UnmodeledOpenMp { name: String, func: String },
}

/// How a fork creates its thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkKind {
    Pthread,
    /// One side of a duplicated `__kmpc_fork_call` pair.
    OmpParallel { master: bool },
    /// One side of a duplicated `__kmpc_fork_teams` pair.
    OmpTeams { master: bool },
    OmpTask,
}

impl ForkKind {
    pub fn is_omp_parallel(&self) -> bool {
        matches!(self, ForkKind::OmpParallel { .. } | ForkKind::OmpTeams { .. })
    }

    pub fn is_task(&self) -> bool {
        matches!(self, ForkKind::OmpTask)
    }

    /// Master side of a parallel fork pair. Teams forks carry no master
    /// distinction, matching how the runtime call is modeled.
    pub fn is_master(&self) -> bool {
        matches!(self, ForkKind::OmpParallel { master: true })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    PthreadMutex,
    PthreadSpin,
    OmpCritical,
    OmpLock,
}

impl LockKind {
    /// Synchronization that only orders threads within one OpenMP team.
    pub fn is_team_local(&self) -> bool {
        matches!(self, LockKind::OmpCritical | LockKind::OmpLock)
    }
}

/// OpenMP region markers surfaced as trace events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    ForInit,
    ForFini,
    SingleStart,
    SingleEnd,
    MasterStart,
    MasterEnd,
    Reduce,
    SectionsStart,
    SectionsEnd,
    OrderedStart,
    OrderedEnd,
    TaskWait,
    GetThreadNum,
}

/// Where a join finds the thread it waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinTarget {
    /// pthread-style: match the handle value against earlier forks.
    Handle(Value),
    /// OpenMP implicit join: the fork op at this index in the same summary.
    ForkOp(usize),
}

/// Resolution of a direct call at summary-build time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallTarget {
    Resolved(FuncId),
    Unresolved(String),
    Indirect,
}

/// One normalized operation. Every op carries its originating instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum IrOp {
    Read {
        instr: InstrId,
        ptr: Value,
    },
    Write {
        instr: InstrId,
        ptr: Value,
    },
    Fork {
        instr: InstrId,
        entry: FuncId,
        handle: Option<Value>,
        kind: ForkKind,
    },
    Join {
        instr: InstrId,
        target: JoinTarget,
        omp: bool,
    },
    Lock {
        instr: InstrId,
        mutex: Value,
        kind: LockKind,
    },
    Unlock {
        instr: InstrId,
        mutex: Value,
        kind: LockKind,
    },
    Barrier {
        instr: InstrId,
        omp: bool,
    },
    Call {
        instr: InstrId,
        target: CallTarget,
    },
    Marker {
        instr: InstrId,
        kind: MarkerKind,
    },
}

#[derive(Debug, Clone, Default)]
pub struct FunctionSummary {
    pub ops: Vec<IrOp>,
}

/// Memoizing summary builder. Summaries are a pure function of the frozen
/// module, so the cache never needs invalidation.
#[derive(Default)]
pub struct SummaryBuilder {
    cache: FnvHashMap<FuncId, Arc<FunctionSummary>>,
}

impl SummaryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn summary(
        &mut self,
        module: &Module,
        func: FuncId,
    ) -> Result<Arc<FunctionSummary>, SummaryError> {
        if let Some(cached) = self.cache.get(&func) {
            return Ok(Arc::clone(cached));
        }
        let summary = Arc::new(build_summary(module, func)?);
        self.cache.insert(func, Arc::clone(&summary));
        Ok(summary)
    }
}

/// Entry function of a fork call: the first function-pointer argument.
fn fork_entry(args: &[Value]) -> Option<FuncId> {
    args.iter().find_map(|arg| match arg {
        Value::Func(f) => Some(*f),
        _ => None,
    })
}

/// True if the pointer operand directly names a thread-local global.
/// Lightweight front-end check; the full test runs in the thread-local
/// analysis over points-to sets.
fn has_thread_local_operand(module: &Module, ptr: Value) -> bool {
    match ptr {
        Value::Global(g) => module.global(g).thread_local,
        _ => false,
    }
}

fn build_summary(module: &Module, func_id: FuncId) -> Result<FunctionSummary, SummaryError> {
    let func = module.function(func_id);
    let mut ops = Vec::new();

    let mut skip_next_fork: Option<InstrId> = None;

    for instr_id in func.instrs_in_order() {
        if skip_next_fork == Some(instr_id) {
            skip_next_fork = None;
            continue;
        }

        let instr = func.instr(instr_id);
        match &instr.kind {
            InstrKind::Load { ptr, atomic, volatile } => {
                if *atomic || *volatile || has_thread_local_operand(module, *ptr) {
                    continue;
                }
                ops.push(IrOp::Read {
                    instr: instr_id,
                    ptr: *ptr,
                });
            }
            InstrKind::Store { ptr, atomic, volatile, .. } => {
                if *atomic || *volatile || has_thread_local_operand(module, *ptr) {
                    continue;
                }
                ops.push(IrOp::Write {
                    instr: instr_id,
                    ptr: *ptr,
                });
            }
            InstrKind::Call { callee: None, .. } => {
                // Leave indirect calls to the trace builder, which logs the
                // coverage loss.
                ops.push(IrOp::Call {
                    instr: instr_id,
                    target: CallTarget::Indirect,
                });
            }
            InstrKind::Call {
                callee: Some(name),
                args,
            } => {
                lower_call(
                    module, func_id, instr_id, name, args, &mut ops, &mut skip_next_fork,
                )?;
            }
            // Pure dataflow and control flow produce no events.
            _ => {}
        }
    }

    Ok(FunctionSummary { ops })
}

#[allow(clippy::too_many_arguments)]
fn lower_call(
    module: &Module,
    func_id: FuncId,
    instr_id: InstrId,
    name: &str,
    args: &[Value],
    ops: &mut Vec<IrOp>,
    skip_next_fork: &mut Option<InstrId>,
) -> Result<(), SummaryError> {
    use model::{openmp, pthread};

    let func = module.function(func_id);

    let marker = |kind| IrOp::Marker {
        instr: instr_id,
        kind,
    };

    if model::is_no_effect(name) || pthread::is_no_effect(name) || openmp::is_no_effect(name) {
        return Ok(());
    }

    if pthread::is_create(name) {
        let Some(entry) = fork_entry(args) else {
            warn!(callee = name, "pthread_create without resolvable entry, skipping");
            return Ok(());
        };
        ops.push(IrOp::Fork {
            instr: instr_id,
            entry,
            handle: args.first().copied(),
            kind: ForkKind::Pthread,
        });
    } else if pthread::is_join(name) {
        let Some(&handle) = args.first() else {
            warn!(callee = name, "pthread_join without handle, skipping");
            return Ok(());
        };
        ops.push(IrOp::Join {
            instr: instr_id,
            target: JoinTarget::Handle(handle),
            omp: false,
        });
    } else if pthread::is_mutex_lock(name) || pthread::is_spin_lock(name) {
        let kind = if pthread::is_mutex_lock(name) {
            LockKind::PthreadMutex
        } else {
            LockKind::PthreadSpin
        };
        if let Some(&mutex) = args.first() {
            ops.push(IrOp::Lock {
                instr: instr_id,
                mutex,
                kind,
            });
        }
    } else if pthread::is_mutex_unlock(name) || pthread::is_spin_unlock(name) {
        let kind = if pthread::is_mutex_unlock(name) {
            LockKind::PthreadMutex
        } else {
            LockKind::PthreadSpin
        };
        if let Some(&mutex) = args.first() {
            ops.push(IrOp::Unlock {
                instr: instr_id,
                mutex,
                kind,
            });
        }
    } else if pthread::is_barrier_wait(name) {
        ops.push(IrOp::Barrier {
            instr: instr_id,
            omp: false,
        });
    } else if openmp::is_fork(name) || openmp::is_fork_teams(name) {
        // Preprocessing duplicates every omp fork call; the twin must be the
        // next call in the block. Without it no cross-thread pair exists in
        // the region, so the whole region is skipped as a coverage loss.
        let teams = openmp::is_fork_teams(name);
        let twin = func.next_in_block(instr_id).filter(|&next| {
            matches!(
                &func.instr(next).kind,
                InstrKind::Call { callee: Some(twin_name), .. }
                    if (teams && openmp::is_fork_teams(twin_name))
                        || (!teams && openmp::is_fork(twin_name))
            )
        });
        let Some(twin_id) = twin else {
            warn!(
                func = %func.name,
                callee = name,
                "non-duplicated omp fork, skipping entire OpenMP region"
            );
            return Ok(());
        };
        let Some(entry) = fork_entry(args) else {
            warn!(callee = name, "omp fork without resolvable entry, skipping region");
            *skip_next_fork = Some(twin_id);
            return Ok(());
        };

        let make = |master: bool| {
            if teams {
                ForkKind::OmpTeams { master }
            } else {
                ForkKind::OmpParallel { master }
            }
        };

        // Fork both sides, then immediately join both: the omp fork has an
        // implicit join at region end.
        let master_idx = ops.len();
        ops.push(IrOp::Fork {
            instr: instr_id,
            entry,
            handle: None,
            kind: make(true),
        });
        let worker_idx = ops.len();
        ops.push(IrOp::Fork {
            instr: twin_id,
            entry,
            handle: None,
            kind: make(false),
        });
        ops.push(IrOp::Join {
            instr: instr_id,
            target: JoinTarget::ForkOp(master_idx),
            omp: true,
        });
        ops.push(IrOp::Join {
            instr: twin_id,
            target: JoinTarget::ForkOp(worker_idx),
            omp: true,
        });
        *skip_next_fork = Some(twin_id);
    } else if openmp::is_task(name) {
        let Some(entry) = fork_entry(args) else {
            warn!(callee = name, "omp task without resolvable entry, skipping");
            return Ok(());
        };
        ops.push(IrOp::Fork {
            instr: instr_id,
            entry,
            handle: None,
            kind: ForkKind::OmpTask,
        });
    } else if openmp::is_barrier(name) {
        ops.push(IrOp::Barrier {
            instr: instr_id,
            omp: true,
        });
    } else if openmp::is_critical_start(name) {
        if let Some(&mutex) = args.last() {
            ops.push(IrOp::Lock {
                instr: instr_id,
                mutex,
                kind: LockKind::OmpCritical,
            });
        }
    } else if openmp::is_critical_end(name) {
        if let Some(&mutex) = args.last() {
            ops.push(IrOp::Unlock {
                instr: instr_id,
                mutex,
                kind: LockKind::OmpCritical,
            });
        }
    } else if openmp::is_set_lock(name) || openmp::is_set_nest_lock(name) {
        if let Some(&mutex) = args.first() {
            ops.push(IrOp::Lock {
                instr: instr_id,
                mutex,
                kind: LockKind::OmpLock,
            });
        }
    } else if openmp::is_unset_lock(name) || openmp::is_unset_nest_lock(name) {
        if let Some(&mutex) = args.first() {
            ops.push(IrOp::Unlock {
                instr: instr_id,
                mutex,
                kind: LockKind::OmpLock,
            });
        }
    } else if openmp::is_for_static_init(name) {
        ops.push(marker(MarkerKind::ForInit));
    } else if openmp::is_for_static_fini(name) {
        ops.push(marker(MarkerKind::ForFini));
    } else if openmp::is_single_start(name) {
        ops.push(marker(MarkerKind::SingleStart));
    } else if openmp::is_single_end(name) {
        ops.push(marker(MarkerKind::SingleEnd));
    } else if openmp::is_master_start(name) {
        ops.push(marker(MarkerKind::MasterStart));
    } else if openmp::is_master_end(name) {
        ops.push(marker(MarkerKind::MasterEnd));
    } else if openmp::is_reduce_start(name) || openmp::is_reduce_nowait_start(name) {
        // reduce and reduce_nowait share one marker; the analysis does not
        // distinguish them.
        ops.push(marker(MarkerKind::Reduce));
    } else if openmp::is_reduce_end(name) || openmp::is_reduce_nowait_end(name) {
        // End of reduce is recovered from the dispatch switch, not a marker.
    } else if openmp::is_sections_start(name) {
        ops.push(marker(MarkerKind::SectionsStart));
    } else if openmp::is_sections_end(name) {
        ops.push(marker(MarkerKind::SectionsEnd));
    } else if openmp::is_ordered_start(name) {
        ops.push(marker(MarkerKind::OrderedStart));
    } else if openmp::is_ordered_end(name) {
        ops.push(marker(MarkerKind::OrderedEnd));
    } else if openmp::is_task_wait(name) {
        ops.push(marker(MarkerKind::TaskWait));
    } else if openmp::is_get_thread_num(name) {
        ops.push(marker(MarkerKind::GetThreadNum));
    } else if openmp::is_dispatch_init(name)
        || openmp::is_dispatch_next(name)
        || openmp::is_dispatch_fini(name)
    {
        // Dynamic scheduling is traced as plain control flow; loop-bound
        // reasoning only covers static schedules.
        debug!(callee = name, "dynamically scheduled loop, no bound reasoning");
    } else if openmp::is_openmp(name) {
        // An OpenMP call we recognize as OpenMP but have no model for.
        // Silently ignoring it risks an unsound trace.
        return Err(SummaryError::UnmodeledOpenMp {
            name: name.to_string(),
            func: func.name.clone(),
        });
    } else {
        let target = match module.func_by_name(name) {
            Some(f) => CallTarget::Resolved(f),
            None => CallTarget::Unresolved(name.to_string()),
        };
        ops.push(IrOp::Call {
            instr: instr_id,
            target,
        });
    }

    Ok(())
}
