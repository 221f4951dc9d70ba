//! The event trace model: threads, events, and whole-program construction.

pub mod event;
pub mod program;
pub mod thread;

#[cfg(test)]
mod tests;

use thiserror::Error;

use crate::ir::summary::SummaryError;

pub use event::{Event, EventId, EventKind, EventRef, ThreadId};
pub use program::{OpenMpState, ProgramTrace, TraceBuildState, UnjoinedTask};
pub use thread::ThreadTrace;

/// Failures that abort trace construction. Coverage losses (skipped
/// regions, unresolved calls) are logged instead and never surface here.
#[derive(Error, Debug)]
pub enum TraceError {
    #[error(transparent)]
    Summary(#[from] SummaryError),

    #[error("entry function `{0}` not found in module")]
    MissingEntry(String),

    #[error("malformed master region markers in function `{func}`")]
    MalformedMasterRegion { func: String },
}
