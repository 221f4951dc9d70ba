//! Events: the nodes of a thread's linear trace.

use std::fmt;

use crate::ir::summary::{ForkKind, LockKind, MarkerKind};
use crate::ir::{FuncId, InstrSite, Value, ValueKey};

/// Thread-local, contiguous, strictly increasing event sequence number.
pub type EventId = usize;

/// Stable identity of a thread within one [`ProgramTrace`](crate::trace::ProgramTrace).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u32);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Handle to one event: owning thread plus sequence id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventRef {
    pub thread: ThreadId,
    pub event: EventId,
}

/// Closed set of event kinds; one arm per modeled occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Read { ptr: Value },
    Write { ptr: Value },
    Fork { child: ThreadId, kind: ForkKind },
    /// `joined` is `None` when the handle could not be matched to a fork.
    Join { joined: Option<ThreadId>, omp: bool },
    Lock { key: ValueKey, kind: LockKind },
    Unlock { key: ValueKey, kind: LockKind },
    Barrier { omp: bool },
    EnterCall { callee: FuncId },
    LeaveCall { callee: FuncId },
    ExternCall,
    Marker(MarkerKind),
}

/// An immutable node in a thread's trace. Created once during construction,
/// owned exclusively by the thread's event list thereafter.
#[derive(Debug, Clone)]
pub struct Event {
    pub id: EventId,
    pub kind: EventKind,
    /// The originating IR instruction.
    pub site: InstrSite,
}

impl Event {
    pub fn is_mem_access(&self) -> bool {
        matches!(self.kind, EventKind::Read { .. } | EventKind::Write { .. })
    }

    pub fn is_write(&self) -> bool {
        matches!(self.kind, EventKind::Write { .. })
    }

    /// The pointer operand of a memory access event.
    pub fn access_ptr(&self) -> Option<Value> {
        match self.kind {
            EventKind::Read { ptr } | EventKind::Write { ptr } => Some(ptr),
            _ => None,
        }
    }

    pub fn marker(&self) -> Option<MarkerKind> {
        match self.kind {
            EventKind::Marker(kind) => Some(kind),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Read { .. } => write!(f, "READ"),
            EventKind::Write { .. } => write!(f, "WRIT"),
            EventKind::Fork { child, .. } => write!(f, "FORK {child}"),
            EventKind::Join {
                joined: Some(t), ..
            } => write!(f, "JOIN {t}"),
            EventKind::Join { joined: None, .. } => write!(f, "JOIN ?"),
            EventKind::Lock { .. } => write!(f, "LOCK"),
            EventKind::Unlock { .. } => write!(f, "UNLK"),
            EventKind::Barrier { .. } => write!(f, "BARR"),
            EventKind::EnterCall { .. } => write!(f, "ENTR"),
            EventKind::LeaveCall { .. } => write!(f, "LEAV"),
            EventKind::ExternCall => write!(f, "CALL"),
            EventKind::Marker(kind) => write!(f, "OMP {kind:?}"),
        }
    }
}
