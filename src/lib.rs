//! Carrera - static data race detector for pthread and OpenMP programs
//!
//! This library builds a whole-program symbolic trace from a normalized
//! compiler-IR module, then runs a battery of filters over every pair of
//! conflicting memory accesses: happens-before ordering, lock sets, alias
//! and thread-locality checks, and OpenMP region semantics including
//! parallel-loop array-index reasoning.

pub mod analysis;
pub mod cli;
pub mod coverage;
pub mod detect;
pub mod ir;
pub mod report;
pub mod scev;
pub mod trace;
