//! The race-pair filter analyses.

pub mod alias;
pub mod happens_before;
pub mod lockset;
pub mod openmp;
pub mod shared_memory;
pub mod thread_local;
