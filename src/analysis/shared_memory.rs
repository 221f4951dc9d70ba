//! Bucketing of memory accesses by abstract object and owning thread.
//!
//! The driver enumerates candidate race pairs per shared object: objects
//! written by at least one thread and touched by at least two distinct
//! threads. BTree maps keep enumeration order deterministic, which keeps
//! reports stable run to run.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::analysis::alias::{ObjectId, PointsTo};
use crate::trace::{EventKind, EventRef, ProgramTrace, ThreadId};

type ThreadedAccesses = BTreeMap<ThreadId, Vec<EventRef>>;

pub struct SharedMemory {
    writes: BTreeMap<ObjectId, ThreadedAccesses>,
    reads: BTreeMap<ObjectId, ThreadedAccesses>,
    shared: Vec<ObjectId>,
    empty: ThreadedAccesses,
}

impl SharedMemory {
    pub fn new(program: &ProgramTrace, pts: &impl PointsTo) -> Self {
        let mut writes: BTreeMap<ObjectId, ThreadedAccesses> = BTreeMap::new();
        let mut reads: BTreeMap<ObjectId, ThreadedAccesses> = BTreeMap::new();

        for thread in program.threads() {
            for event in &thread.events {
                let (ptr, bucket) = match event.kind {
                    EventKind::Write { ptr } => (ptr, &mut writes),
                    EventKind::Read { ptr } => (ptr, &mut reads),
                    _ => continue,
                };
                let eref = EventRef {
                    thread: thread.id,
                    event: event.id,
                };
                for &obj in pts.objects(event.site.func, ptr) {
                    bucket
                        .entry(obj)
                        .or_default()
                        .entry(thread.id)
                        .or_default()
                        .push(eref);
                }
            }
        }

        // Shared: written somewhere, and touched by two or more threads.
        let mut shared = Vec::new();
        for (&obj, threaded_writes) in &writes {
            let mut threads: BTreeSet<ThreadId> = threaded_writes.keys().copied().collect();
            if let Some(threaded_reads) = reads.get(&obj) {
                threads.extend(threaded_reads.keys().copied());
            }
            if threads.len() >= 2 {
                shared.push(obj);
            }
        }

        debug!(objects = shared.len(), "shared objects found");
        SharedMemory {
            writes,
            reads,
            shared,
            empty: ThreadedAccesses::new(),
        }
    }

    pub fn shared_objects(&self) -> &[ObjectId] {
        &self.shared
    }

    /// Write events on `obj`, bucketed by owning thread.
    pub fn threaded_writes(&self, obj: ObjectId) -> &ThreadedAccesses {
        self.writes.get(&obj).unwrap_or(&self.empty)
    }

    /// Read events on `obj`, bucketed by owning thread.
    pub fn threaded_reads(&self, obj: ObjectId) -> &ThreadedAccesses {
        self.reads.get(&obj).unwrap_or(&self.empty)
    }
}
