//! Per-thread trace construction.
//!
//! Each thread is built by recursively walking function summaries from its
//! entry point, spawning child threads at fork ops. The walk is guarded by a
//! call stack so call-graph cycles terminate: a function already on the
//! current stack contributes no events for the repeated frame.

use fnv::FnvHashMap;
use tracing::{debug, warn};

use crate::ir::summary::{CallTarget, ForkKind, IrOp, JoinTarget, MarkerKind};
use crate::ir::{FuncId, InstrId, InstrKind, InstrSite, Module, Value, ValueKey};
use crate::trace::event::{Event, EventKind, EventRef, ThreadId};
use crate::trace::program::{TraceBuildState, UnjoinedTask};
use crate::trace::TraceError;

/// One thread's ordered event sequence plus its position in the fork tree.
///
/// Invariants: event ids are contiguous from 0 in program order; every
/// thread except main has exactly one spawn site; each child appears exactly
/// once in its parent's `children` list.
#[derive(Debug)]
pub struct ThreadTrace {
    pub id: ThreadId,
    pub entry: FuncId,
    /// Fork event (on another thread) that created this thread.
    pub spawn: Option<EventRef>,
    pub spawn_kind: Option<ForkKind>,
    pub events: Vec<Event>,
    /// Directly spawned child threads, in creation order.
    pub children: Vec<ThreadId>,
}

impl ThreadTrace {
    pub fn event(&self, id: usize) -> &Event {
        &self.events[id]
    }

    /// True if this thread was spawned by one side of an OpenMP parallel
    /// fork pair (tasks and teams threads excluded).
    pub fn is_omp_thread(&self) -> bool {
        matches!(self.spawn_kind, Some(ForkKind::OmpParallel { .. }))
    }

    pub fn is_omp_master(&self) -> bool {
        matches!(self.spawn_kind, Some(ForkKind::OmpParallel { master: true }))
    }
}

/// Per-thread construction context: the recursion guard plus pthread handle
/// matching, both scoped to one thread.
struct ThreadCtx {
    id: ThreadId,
    spawn_kind: Option<ForkKind>,
    callstack: Vec<FuncId>,
    /// pthread handle root -> most recently forked child with that handle.
    handles: FnvHashMap<ValueKey, ThreadId>,
    children: Vec<ThreadId>,
}

impl ThreadCtx {
    fn is_omp_thread(&self) -> bool {
        matches!(self.spawn_kind, Some(ForkKind::OmpParallel { .. }))
    }

    fn is_omp_master(&self) -> bool {
        matches!(self.spawn_kind, Some(ForkKind::OmpParallel { master: true }))
    }
}

/// Build the trace for one thread (and, recursively, all threads it
/// spawns), filling `slots[tid]`.
pub(crate) fn build_thread(
    module: &Module,
    entry: FuncId,
    tid: ThreadId,
    spawn: Option<(EventRef, ForkKind)>,
    state: &mut TraceBuildState,
    slots: &mut Vec<Option<ThreadTrace>>,
) -> Result<(), TraceError> {
    if slots.len() <= tid.0 as usize {
        slots.resize_with(tid.0 as usize + 1, || None);
    }

    let mut ctx = ThreadCtx {
        id: tid,
        spawn_kind: spawn.map(|(_, kind)| kind),
        callstack: Vec::new(),
        handles: FnvHashMap::default(),
        children: Vec::new(),
    };
    let mut events = Vec::new();

    debug!(thread = %tid, entry = %module.function(entry).name, "building thread trace");
    traverse_call(module, entry, &mut ctx, &mut events, state, slots)?;

    slots[tid.0 as usize] = Some(ThreadTrace {
        id: tid,
        entry,
        spawn: spawn.map(|(at, _)| at),
        spawn_kind: spawn.map(|(_, kind)| kind),
        events,
        children: ctx.children,
    });
    Ok(())
}

/// Lock identity: the lock operand with pointer casts stripped, qualified
/// by the owning function.
fn lock_key(module: &Module, func: FuncId, mutex: Value) -> ValueKey {
    module.value_key(func, module.strip_casts(func, mutex))
}

/// pthread handle identity: strip casts, and look through a load so that
/// `pthread_join(t, ..)` matches the `&t` passed to `pthread_create`.
fn handle_key(module: &Module, func: FuncId, handle: Value) -> ValueKey {
    let mut value = module.strip_casts(func, handle);
    if let Value::Instr(id) = value {
        if let InstrKind::Load { ptr, .. } = &module.function(func).instr(id).kind {
            value = module.strip_casts(func, *ptr);
        }
    }
    module.value_key(func, value)
}

/// Force-join every task forked since the last synchronization point.
/// Called at barriers, taskwaits, and parallel region ends.
fn insert_task_joins(events: &mut Vec<Event>, state: &mut TraceBuildState) {
    for task in std::mem::take(&mut state.openmp.unjoined_tasks) {
        events.push(Event {
            id: events.len(),
            kind: EventKind::Join {
                joined: Some(task.child),
                omp: true,
            },
            site: task.site,
        });
    }
}

/// OpenMP synchronization with no effect across teams, suppressed inside
/// `fork_teams` regions.
fn is_team_specific(op: &IrOp) -> bool {
    match op {
        IrOp::Barrier { omp, .. } => *omp,
        IrOp::Lock { kind, .. } | IrOp::Unlock { kind, .. } => kind.is_team_local(),
        _ => false,
    }
}

fn op_instr(op: &IrOp) -> InstrId {
    match op {
        IrOp::Read { instr, .. }
        | IrOp::Write { instr, .. }
        | IrOp::Fork { instr, .. }
        | IrOp::Join { instr, .. }
        | IrOp::Lock { instr, .. }
        | IrOp::Unlock { instr, .. }
        | IrOp::Barrier { instr, .. }
        | IrOp::Call { instr, .. }
        | IrOp::Marker { instr, .. } => *instr,
    }
}

fn traverse_call(
    module: &Module,
    func_id: FuncId,
    ctx: &mut ThreadCtx,
    events: &mut Vec<Event>,
    state: &mut TraceBuildState,
    slots: &mut Vec<Option<ThreadTrace>>,
) -> Result<(), TraceError> {
    if ctx.callstack.contains(&func_id) {
        // prevent recursion
        return Ok(());
    }
    ctx.callstack.push(func_id);

    let summary = state.summaries.summary(module, func_id)?;
    let func_name = &module.function(func_id).name;

    // Children forked by op index in this frame, for implicit omp joins.
    let mut frame_forks: FnvHashMap<usize, ThreadId> = FnvHashMap::default();

    for (op_idx, op) in summary.ops.iter().enumerate() {
        let site = InstrSite {
            func: func_id,
            instr: op_instr(op),
        };

        if let Some(target) = state.skip_until {
            if site != target {
                continue;
            }
            // Reached the target; resume normal traversal with this op.
            state.skip_until = None;
        }

        if state.openmp.in_teams() && is_team_specific(op) {
            continue;
        }

        match op {
            IrOp::Read { ptr, .. } => {
                events.push(Event {
                    id: events.len(),
                    kind: EventKind::Read { ptr: *ptr },
                    site,
                });
            }
            IrOp::Write { ptr, .. } => {
                events.push(Event {
                    id: events.len(),
                    kind: EventKind::Write { ptr: *ptr },
                    site,
                });
            }
            IrOp::Fork {
                entry,
                handle,
                kind,
                ..
            } => {
                // Tasks forked inside a single region are created on the
                // master thread only, to avoid duplicate task threads.
                if kind.is_task() && state.openmp.in_single && !ctx.is_omp_master() {
                    continue;
                }

                let child = state.alloc_tid();
                let fork_at = EventRef {
                    thread: ctx.id,
                    event: events.len(),
                };
                events.push(Event {
                    id: events.len(),
                    kind: EventKind::Fork {
                        child,
                        kind: *kind,
                    },
                    site,
                });

                if kind.is_task() {
                    state.openmp.unjoined_tasks.push(UnjoinedTask { child, site });
                }
                if matches!(kind, ForkKind::OmpTeams { .. }) {
                    state.openmp.enter_teams();
                }

                build_thread(module, *entry, child, Some((fork_at, *kind)), state, slots)?;

                if matches!(kind, ForkKind::OmpTeams { .. }) {
                    state.openmp.leave_teams();
                }

                frame_forks.insert(op_idx, child);
                if let Some(handle) = handle {
                    ctx.handles
                        .insert(handle_key(module, func_id, *handle), child);
                }
                ctx.children.push(child);
            }
            IrOp::Join { target, omp, .. } => {
                // Any still-unjoined task must be joined before the end of
                // the parallel region.
                if *omp {
                    insert_task_joins(events, state);
                }

                let joined = match target {
                    JoinTarget::ForkOp(idx) => frame_forks.get(idx).copied(),
                    JoinTarget::Handle(handle) => ctx
                        .handles
                        .get(&handle_key(module, func_id, *handle))
                        .copied(),
                };
                if joined.is_none() {
                    warn!(func = %func_name, "join without matching fork");
                }
                events.push(Event {
                    id: events.len(),
                    kind: EventKind::Join { joined, omp: *omp },
                    site,
                });
            }
            IrOp::Lock { mutex, kind, .. } => {
                events.push(Event {
                    id: events.len(),
                    kind: EventKind::Lock {
                        key: lock_key(module, func_id, *mutex),
                        kind: *kind,
                    },
                    site,
                });
            }
            IrOp::Unlock { mutex, kind, .. } => {
                events.push(Event {
                    id: events.len(),
                    kind: EventKind::Unlock {
                        key: lock_key(module, func_id, *mutex),
                        kind: *kind,
                    },
                    site,
                });
            }
            IrOp::Barrier { omp, .. } => {
                // Tasks join at barriers.
                if *omp {
                    insert_task_joins(events, state);
                }
                events.push(Event {
                    id: events.len(),
                    kind: EventKind::Barrier { omp: *omp },
                    site,
                });
            }
            IrOp::Call { target, .. } => match target {
                CallTarget::Indirect => {
                    warn!(func = %func_name, "skipping indirect call");
                }
                CallTarget::Unresolved(name) => {
                    warn!(func = %func_name, callee = %name, "unable to resolve callee");
                }
                CallTarget::Resolved(callee) => {
                    if module.function(*callee).is_external {
                        events.push(Event {
                            id: events.len(),
                            kind: EventKind::ExternCall,
                            site,
                        });
                    } else {
                        events.push(Event {
                            id: events.len(),
                            kind: EventKind::EnterCall { callee: *callee },
                            site,
                        });
                        traverse_call(module, *callee, ctx, events, state, slots)?;
                        events.push(Event {
                            id: events.len(),
                            kind: EventKind::LeaveCall { callee: *callee },
                            site,
                        });
                    }
                }
            },
            IrOp::Marker { kind, .. } => {
                if ctx.is_omp_thread() {
                    match kind {
                        // Master regions run only on the master thread; on
                        // workers, skip to the cached region end.
                        MarkerKind::MasterStart => {
                            if !ctx.is_omp_master() {
                                let end = state.openmp.master_region_end(site).ok_or_else(|| {
                                    TraceError::MalformedMasterRegion {
                                        func: func_name.clone(),
                                    }
                                })?;
                                state.skip_until = Some(end);
                                continue;
                            }
                            state.openmp.mark_master_start(site, func_name)?;
                        }
                        MarkerKind::MasterEnd => {
                            if ctx.is_omp_master() {
                                state.openmp.mark_master_end(site, func_name)?;
                            }
                        }
                        // Single regions are traced on every thread; true
                        // exclusivity is decided by the analysis phase. The
                        // flag only gates task creation.
                        MarkerKind::SingleStart => state.openmp.in_single = true,
                        MarkerKind::SingleEnd => state.openmp.in_single = false,
                        MarkerKind::TaskWait => insert_task_joins(events, state),
                        _ => {}
                    }
                }
                events.push(Event {
                    id: events.len(),
                    kind: EventKind::Marker(*kind),
                    site,
                });
            }
        }
    }

    ctx.callstack.pop();
    Ok(())
}
