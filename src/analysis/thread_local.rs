//! Thread-local sharing filter.
//!
//! Two accesses cannot race when every abstract object they could both
//! touch is a thread-local global. The interesting shape is
//!
//! ```text
//! write: { O1, O2 }
//! other: { O1, O3 }
//! ```
//!
//! where `O1` is thread-local: the only shared object is thread-local, so
//! no race is possible even though the accesses also touch shared memory.
//! An empty intersection trivially satisfies the rule. Any non-thread-local
//! object in the intersection fails closed: the race stays a candidate.

use crate::analysis::alias::{MemObject, PointsTo};
use crate::ir::{FuncId, Module, Value};

pub struct ThreadLocalAnalysis;

impl ThreadLocalAnalysis {
    pub fn new() -> Self {
        ThreadLocalAnalysis
    }

    pub fn is_thread_local_access(
        &self,
        module: &Module,
        pts: &impl PointsTo,
        write: (FuncId, Value),
        other: (FuncId, Value),
    ) -> bool {
        // Object sets arrive sorted by handle. The ordering is arbitrary
        // with respect to the program, which is fine: intersection only
        // needs *some* consistent order.
        let write_objs = pts.objects(write.0, write.1);
        let other_objs = pts.objects(other.0, other.1);

        // Merge intersection that fails fast on the first shared
        // non-thread-local object.
        let (mut i, mut j) = (0, 0);
        while i < write_objs.len() && j < other_objs.len() {
            match write_objs[i].cmp(&other_objs[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    let thread_local = match pts.object_root(write_objs[i]) {
                        MemObject::Global(g) => module.global(*g).thread_local,
                        _ => false,
                    };
                    if !thread_local {
                        return false;
                    }
                    i += 1;
                    j += 1;
                }
            }
        }

        // every shared object was thread local, or nothing was shared
        true
    }
}

impl Default for ThreadLocalAnalysis {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::alias::ModulePointsTo;
    use crate::ir::build::{FuncBuilder, ModuleBuilder};
    use crate::ir::GlobalId;
    use crate::trace::ProgramTrace;

    /// Accesses reach `tls` through a phi so they survive summarization
    /// (direct thread-local accesses are dropped by the front end).
    fn module_with_tls_overlap() -> (crate::ir::Module, Value, Value) {
        let mut m = ModuleBuilder::new();
        let tls = m.thread_local_global("tls");
        let shared = m.global("shared");

        let mut main = FuncBuilder::new("main", 0);
        let body = main.new_block();
        main.br(body);
        main.switch_to(body);
        let p1 = main.phi(vec![(crate::ir::BlockId(0), Value::Global(tls))]);
        let p2 = main.phi(vec![(crate::ir::BlockId(0), Value::Global(tls))]);
        let q = main.phi(vec![(crate::ir::BlockId(0), Value::Global(shared))]);
        main.store(p1, Value::Const(1));
        main.store(p2, Value::Const(2));
        main.store(q, Value::Const(3));
        main.ret();
        m.define(main.finish());
        (m.finish(), p1, p2)
    }

    #[test]
    fn test_all_thread_local_intersection_is_safe() {
        let (module, p1, p2) = module_with_tls_overlap();
        let trace = ProgramTrace::build(&module, "main").unwrap();
        let pts = ModulePointsTo::new(&module, &trace);
        let tla = ThreadLocalAnalysis::new();

        let fid = crate::ir::FuncId(0);
        assert!(tla.is_thread_local_access(&module, &pts, (fid, p1), (fid, p2)));
    }

    #[test]
    fn test_shared_object_in_intersection_fails_closed() {
        let mut m = ModuleBuilder::new();
        let shared = m.global("shared");
        let mut main = FuncBuilder::new("main", 0);
        main.store(Value::Global(shared), Value::Const(1));
        main.store(Value::Global(shared), Value::Const(2));
        main.ret();
        let fid = m.define(main.finish());
        let module = m.finish();
        let trace = ProgramTrace::build(&module, "main").unwrap();
        let pts = ModulePointsTo::new(&module, &trace);
        let tla = ThreadLocalAnalysis::new();

        let access = (fid, Value::Global(GlobalId(0)));
        assert!(!tla.is_thread_local_access(&module, &pts, access, access));
    }

    #[test]
    fn test_empty_intersection_is_trivially_thread_local() {
        let mut m = ModuleBuilder::new();
        let a = m.global("a");
        let b = m.global("b");
        let mut main = FuncBuilder::new("main", 0);
        main.store(Value::Global(a), Value::Const(1));
        main.store(Value::Global(b), Value::Const(2));
        main.ret();
        let fid = m.define(main.finish());
        let module = m.finish();
        let trace = ProgramTrace::build(&module, "main").unwrap();
        let pts = ModulePointsTo::new(&module, &trace);
        let tla = ThreadLocalAnalysis::new();

        assert!(tla.is_thread_local_access(
            &module,
            &pts,
            (fid, Value::Global(a)),
            (fid, Value::Global(b))
        ));
    }
}
