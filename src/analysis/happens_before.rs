//! Happens-before ordering over the program trace.
//!
//! Built once from fork/join structure and OpenMP barrier synchronization;
//! program order within a thread is implicit. The core query is
//! [`are_parallel`](HappensBeforeGraph::are_parallel): unordered pairs are
//! race-eligible, ordered pairs are not.
//!
//! An ordering edge `(t, s) -> (u, d)` means every event at or before `s`
//! on thread `t` happens before every event at or after `d` on thread `u`.
//! Reachability then answers cross-thread ordering: walk forward keeping the
//! minimum reachable event id per thread.

use crate::ir::summary::ForkKind;
use crate::trace::{EventId, EventKind, EventRef, ProgramTrace, ThreadId};

pub struct HappensBeforeGraph {
    /// Outgoing ordering edges per thread, sorted by source event id.
    edges: Vec<Vec<(EventId, EventRef)>>,
}

impl HappensBeforeGraph {
    pub fn new(program: &ProgramTrace) -> Self {
        let mut edges: Vec<Vec<(EventId, EventRef)>> =
            vec![Vec::new(); program.threads().len()];

        let mut add = |thread: ThreadId, source: EventId, target: EventRef| {
            edges[thread.0 as usize].push((source, target));
        };

        for thread in program.threads() {
            for event in &thread.events {
                match event.kind {
                    // Fork: parent's fork event precedes everything on the child.
                    EventKind::Fork { child, .. } => {
                        add(
                            thread.id,
                            event.id,
                            EventRef {
                                thread: child,
                                event: 0,
                            },
                        );
                    }
                    // Join: the child's last event precedes the join event.
                    EventKind::Join {
                        joined: Some(child),
                        ..
                    } => {
                        let last = program.thread(child).events.len().saturating_sub(1);
                        add(
                            child,
                            last,
                            EventRef {
                                thread: thread.id,
                                event: event.id,
                            },
                        );
                    }
                    _ => {}
                }
            }
        }

        // Barriers synchronize co-team threads. Instances are matched by
        // ordinal within each thread's trace so that unrelated barrier
        // instances never leak transitive edges into one another.
        for (a, b) in omp_team_pairs(program) {
            let ba = omp_barrier_ids(program, a);
            let bb = omp_barrier_ids(program, b);
            for (&ea, &eb) in ba.iter().zip(bb.iter()) {
                add(a, ea, EventRef { thread: b, event: eb });
                add(b, eb, EventRef { thread: a, event: ea });
            }
        }

        for per_thread in &mut edges {
            per_thread.sort_unstable_by_key(|(source, _)| *source);
        }

        HappensBeforeGraph { edges }
    }

    /// True if `a` must complete before `b` becomes observable.
    pub fn happens_before(&self, a: EventRef, b: EventRef) -> bool {
        if a.thread == b.thread {
            return a.event < b.event;
        }

        // Minimum reachable event id per thread, starting from `a`.
        let mut best: Vec<Option<EventId>> = vec![None; self.edges.len()];
        best[a.thread.0 as usize] = Some(a.event);
        let mut worklist = vec![a.thread];

        while let Some(thread) = worklist.pop() {
            let position = best[thread.0 as usize].expect("worklist entries have positions");
            for &(source, target) in &self.edges[thread.0 as usize] {
                if source < position {
                    continue;
                }
                let slot = &mut best[target.thread.0 as usize];
                if slot.is_none() || slot.is_some_and(|cur| target.event < cur) {
                    *slot = Some(target.event);
                    worklist.push(target.thread);
                }
            }
        }

        best[b.thread.0 as usize].is_some_and(|reach| reach <= b.event)
    }

    /// True when neither event is ordered before the other. Same-thread
    /// pairs are never parallel (program order).
    pub fn are_parallel(&self, a: EventRef, b: EventRef) -> bool {
        if a.thread == b.thread {
            return false;
        }
        !self.happens_before(a, b) && !self.happens_before(b, a)
    }
}

/// Master/worker thread pairs of each OpenMP parallel fork pair, identified
/// by adjacent fork events on the spawning thread.
fn omp_team_pairs(program: &ProgramTrace) -> Vec<(ThreadId, ThreadId)> {
    let mut pairs = Vec::new();
    for thread in program.threads() {
        let Some(spawn) = thread.spawn else { continue };
        if !matches!(thread.spawn_kind, Some(ForkKind::OmpParallel { master: true })) {
            continue;
        }
        let partner = program.threads().iter().find(|other| {
            other.spawn.is_some_and(|s| {
                s.thread == spawn.thread && s.event == spawn.event + 1
            })
        });
        if let Some(partner) = partner {
            pairs.push((thread.id, partner.id));
        }
    }
    pairs
}

fn omp_barrier_ids(program: &ProgramTrace, thread: ThreadId) -> Vec<EventId> {
    program
        .thread(thread)
        .events
        .iter()
        .filter(|e| matches!(e.kind, EventKind::Barrier { omp: true }))
        .map(|e| e.id)
        .collect()
}
