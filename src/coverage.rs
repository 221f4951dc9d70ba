//! Coverage statistics: which functions the trace actually visited.
//!
//! Unvisited functions are a coverage report, not a failure; they point at
//! entry points the call-graph walk never reached (dead code, unresolved
//! indirect calls, skipped OpenMP regions).

use std::collections::BTreeSet;
use std::fmt;

use crate::ir::summary::ForkKind;
use crate::trace::{EventKind, ProgramTrace};

pub struct Coverage {
    analyzed: BTreeSet<String>,
    total: BTreeSet<String>,
    unanalyzed: BTreeSet<String>,
    omp_fork_events: usize,
}

impl Coverage {
    pub fn new(program: &ProgramTrace) -> Self {
        let module = program.module;

        let total: BTreeSet<String> = module
            .functions
            .iter()
            .filter(|f| !f.is_external)
            .map(|f| f.name.clone())
            .collect();

        let mut analyzed = BTreeSet::new();
        let mut omp_fork_events = 0;
        for thread in program.threads() {
            analyzed.insert(module.function(thread.entry).name.clone());
            for event in &thread.events {
                match event.kind {
                    EventKind::EnterCall { callee } => {
                        analyzed.insert(module.function(callee).name.clone());
                    }
                    EventKind::Fork {
                        kind: ForkKind::OmpParallel { .. },
                        ..
                    } => {
                        omp_fork_events += 1;
                    }
                    _ => {}
                }
            }
        }

        let unanalyzed: BTreeSet<String> =
            total.difference(&analyzed).cloned().collect();

        Coverage {
            analyzed,
            total,
            unanalyzed,
            omp_fork_events,
        }
    }

    pub fn analyzed_count(&self) -> usize {
        self.analyzed.len()
    }

    pub fn total_count(&self) -> usize {
        self.total.len()
    }

    pub fn unanalyzed(&self) -> &BTreeSet<String> {
        &self.unanalyzed
    }

    /// Parallel regions visited; fork events come in duplicated pairs.
    pub fn omp_regions(&self) -> usize {
        self.omp_fork_events / 2
    }
}

impl fmt::Display for Coverage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pct = if self.total.is_empty() {
            100.0
        } else {
            100.0 * self.analyzed.len() as f64 / self.total.len() as f64
        };
        writeln!(f, "==== Coverage ====")?;
        writeln!(
            f,
            "-> Analyzed {} out of {} functions ({pct:.1}% after excluding external functions).",
            self.analyzed.len(),
            self.total.len()
        )?;
        writeln!(f, "#func (visited): {}", self.analyzed.len())?;
        writeln!(f, "#func (unvisited): {}", self.unanalyzed.len())?;
        writeln!(f, "#func (total in module): {}", self.total.len())?;
        writeln!(f, "#visited openmp parallel regions: {}", self.omp_regions())?;

        if !self.unanalyzed.is_empty() {
            writeln!(f, "Unvisited functions include:")?;
            for name in &self.unanalyzed {
                writeln!(f, "\t{name}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::build::{FuncBuilder, ModuleBuilder};
    use crate::ir::{GlobalId, Value};

    #[test]
    fn test_unvisited_functions_are_listed() {
        let mut m = ModuleBuilder::new();
        m.global("g");

        let mut helper = FuncBuilder::new("helper", 0);
        helper.store(Value::Global(GlobalId(0)), Value::Const(1));
        helper.ret();
        m.define(helper.finish());

        let mut dead = FuncBuilder::new("dead_code", 0);
        dead.ret();
        m.define(dead.finish());

        let mut main = FuncBuilder::new("main", 0);
        main.call("helper", vec![]);
        main.ret();
        m.define(main.finish());
        let module = m.finish();

        let program = ProgramTrace::build(&module, "main").unwrap();
        let coverage = Coverage::new(&program);

        assert_eq!(coverage.total_count(), 3);
        assert_eq!(coverage.analyzed_count(), 2);
        assert!(coverage.unanalyzed().contains("dead_code"));
        assert_eq!(coverage.omp_regions(), 0);

        let dump = coverage.to_string();
        assert!(dump.contains("dead_code"));
    }

    #[test]
    fn test_omp_region_count_halves_fork_pairs() {
        let mut m = ModuleBuilder::new();
        m.global("g");
        let mut outlined = FuncBuilder::new("main.omp_outlined", 2);
        outlined.store(Value::Global(GlobalId(0)), Value::Const(1));
        outlined.ret();
        let outlined_id = m.define(outlined.finish());

        let mut main = FuncBuilder::new("main", 0);
        main.call("__kmpc_fork_call", vec![Value::Const(0), Value::Func(outlined_id)]);
        main.call("__kmpc_fork_call", vec![Value::Const(0), Value::Func(outlined_id)]);
        main.ret();
        m.define(main.finish());
        let module = m.finish();

        let program = ProgramTrace::build(&module, "main").unwrap();
        let coverage = Coverage::new(&program);
        assert_eq!(coverage.omp_regions(), 1);
    }
}
