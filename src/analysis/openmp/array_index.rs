//! Parallel-loop array-index overlap analysis.
//!
//! Decides whether two array accesses inside the same OpenMP worksharing
//! loop can ever touch the same element across iterations. The pipeline:
//! translate both addresses to affine expressions, commute bit extensions
//! inward, and subtract.
//!
//! - Non-constant gap: assume overlap.
//! - Zero gap: no overlap only if both accesses are perfectly aligned with
//!   the parallel induction variable.
//! - Constant nonzero gap: compare against the constant loop step; a step
//!   larger than the gap cannot revisit an offset, and when it can, the
//!   resolved static loop bounds may still be too small to reach it.
//! - Parallel loop not innermost: substitute the inner loops' spans and
//!   require every current/next-iteration gap to be a strictly positive
//!   constant.
//!
//! Every unhandled shape reports "may overlap".

use fnv::FnvHashMap;
use tracing::debug;

use crate::analysis::openmp::induction::{gep_chain, induction_source};
use crate::ir::{BlockId, FuncId, InstrId, InstrKind, Module, Value};
use crate::scev::{Expr, ScalarEvolution};
use crate::trace::{EventRef, ProgramTrace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccessType {
    /// Every dimension rides the right induction variable.
    NoRace,
    /// Some dimension provably misaligned with the parallel loop.
    Race,
    /// Not determined; leave the verdict to the bound reasoning.
    Nd,
}

pub struct ArrayIndexAnalysis<'m> {
    module: &'m Module,
    engines: FnvHashMap<FuncId, ScalarEvolution<'m>>,
}

impl<'m> ArrayIndexAnalysis<'m> {
    pub fn new(module: &'m Module) -> Self {
        ArrayIndexAnalysis {
            module,
            engines: FnvHashMap::default(),
        }
    }

    /// The gep computing a memory access's address, if any.
    pub fn array_gep(&self, program: &ProgramTrace, event: EventRef) -> Option<InstrId> {
        let e = program.event(event);
        let ptr = e.access_ptr()?;
        let func = e.site.func;
        match self.module.strip_casts(func, ptr) {
            Value::Instr(id)
                if matches!(
                    self.module.function(func).instr(id).kind,
                    InstrKind::Gep { .. }
                ) =>
            {
                Some(id)
            }
            _ => None,
        }
    }

    /// True when the two accesses' index sets can reach the same element.
    /// `a` is the write side; `b` may be a read or a write.
    pub fn can_index_overlap(&mut self, program: &ProgramTrace, a: EventRef, b: EventRef) -> bool {
        let (Some(gep1), Some(gep2)) = (self.array_gep(program, a), self.array_gep(program, b))
        else {
            return false;
        };

        let func = program.event(a).site.func;
        if func != program.event(b).site.func {
            return false;
        }

        let module = self.module;
        let se = self
            .engines
            .entry(func)
            .or_insert_with(|| ScalarEvolution::new(module, func));

        let e1 = se.expr(Value::Instr(gep1));
        let e1 = se.push_casts(&e1);
        let e2 = se.expr(Value::Instr(gep2));
        let e2 = se.push_casts(&e2);

        let diff = se.minus(&e1, &e2);
        let Some(gap) = diff.const_value() else {
            // unprovable symbolic gap
            debug!("index gap not constant, assuming overlap");
            return true;
        };

        if gap == 0 {
            let t1 = access_type(module, func, se, gep1);
            let t2 = access_type(module, func, se, gep2);
            if t1 == AccessType::NoRace && t2 == AccessType::NoRace {
                return false;
            }
            if t1 == AccessType::Race || t2 == AccessType::Race {
                return true;
            }
            // undetermined: fall through to the bound reasoning
        }

        let (Some(omp1), Some(omp2)) = (se.omp_loop_rec(&e1), se.omp_loop_rec(&e2)) else {
            return true;
        };
        let (
            Expr::AddRec {
                step: step1,
                header: h1,
                ..
            },
            Expr::AddRec { header: h2, step: step2, .. },
        ) = (&omp1, &omp2)
        else {
            return true;
        };

        // must be affine recurrences over the same worksharing loop
        if h1 != h2 {
            return true;
        }
        let non_affine = |step: &Expr| step.find(&|e| matches!(e, Expr::AddRec { .. })).is_some();
        if non_affine(step1) || non_affine(step2) {
            return true;
        }
        let header = *h1;

        let distance = gap.unsigned_abs();

        if e1 == omp1 && e2 == omp2 {
            // the parallel loop is the innermost recurrence
            let Some(step) = step1.const_value() else {
                return true;
            };
            let step = step.unsigned_abs();
            if step == 0 {
                return true;
            }
            if distance == step {
                return true;
            }
            // a step wider than the gap can never land on the same offset
            if distance < step {
                return false;
            }
            if let (Some(lower), Some(upper)) = se.omp_loop_bounds(header) {
                let max_bound = lower.unsigned_abs().max(upper.unsigned_abs());
                if max_bound < distance / step {
                    return false;
                }
            }
            true
        } else {
            // the parallel loop carries inner sequential loops: project the
            // inner spans into one parallel iteration and require the next
            // iteration to start strictly past both of them
            let bounded1 = se.apply_inner_bounds(&e1, header);
            let bounded2 = se.apply_inner_bounds(&e2, header);
            let (Some(next1), Some(next2)) =
                (se.next_iteration(&omp1), se.next_iteration(&omp2))
            else {
                return true;
            };

            let gaps = [
                se.minus(&next1, &bounded1),
                se.minus(&next1, &bounded2),
                se.minus(&next2, &bounded1),
                se.minus(&next2, &bounded2),
            ];
            if gaps
                .iter()
                .all(|g| g.const_value().is_some_and(|c| c > 0))
            {
                return false;
            }
            true
        }
    }
}

/// Innermost OpenMP worksharing loop containing the gep's block.
fn parallel_loop_header(se: &ScalarEvolution, module: &Module, func: FuncId, gep: InstrId) -> Option<BlockId> {
    let block = module.function(func).block_of(gep);
    se.loops()
        .iter()
        .filter(|l| l.contains(block) && se.is_omp_for_loop(l.header))
        .min_by_key(|l| l.blocks.len())
        .map(|l| l.header)
}

/// Classify a zero-gap access: is every dimension pinned to the parallel
/// induction variable?
fn access_type(
    module: &Module,
    func: FuncId,
    se: &mut ScalarEvolution,
    gep: InstrId,
) -> AccessType {
    let Some(parallel) = parallel_loop_header(se, module, func, gep) else {
        return AccessType::Nd;
    };

    let mut indexes = gep_chain(module, func, gep);
    if indexes.len() > 1 {
        // dimensions indexed from outside this function's loops contribute a
        // fixed offset per region instance and are not part of the check
        indexes.retain(|&idx| {
            let has_rec = {
                let e = se.expr(idx);
                e.find(&|x| matches!(x, Expr::AddRec { .. })).is_some()
            };
            has_rec || induction_source(module, func, se, idx).is_some()
        });
    }
    if indexes.is_empty() {
        return AccessType::Nd;
    }

    let sources: Vec<Option<BlockId>> = indexes
        .iter()
        .map(|&idx| induction_source(module, func, se, idx))
        .collect();

    if sources.len() == 1 {
        return match sources[0] {
            Some(header) if header == parallel => AccessType::NoRace,
            _ => AccessType::Nd,
        };
    }

    // multi-dimensional: the outermost dimension must ride the parallel
    // variable, every inner one some induction variable of its own loop
    match sources[0] {
        Some(header) if header == parallel => {}
        _ => return AccessType::Race,
    }
    if sources[1..].iter().any(Option::is_none) {
        return AccessType::Race;
    }
    AccessType::NoRace
}
