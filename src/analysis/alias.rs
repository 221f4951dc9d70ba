//! The points-to oracle contract and a simple in-crate implementation.
//!
//! The detector only needs three queries from a points-to analysis: the
//! abstract objects an access may touch (sorted, for merge intersection),
//! a must-not-alias test, and the allocation root behind an object handle
//! (to test thread-local storage class). [`ModulePointsTo`] implements the
//! contract by resolving access pointers through geps, casts, loads, and
//! phis down to allocation roots; a real pointer analysis can be swapped in
//! behind the same trait.

use std::collections::BTreeMap;

use fnv::FnvHashMap;

use crate::ir::{FuncId, GlobalId, InstrId, InstrKind, Module, Value};
use crate::trace::{EventKind, ProgramTrace};

/// Handle to an abstract memory object. Ordering is stable but
/// semantically arbitrary; it only has to support deterministic merges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(pub u32);

/// An abstract memory object: the allocation root an access resolves to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MemObject {
    Global(GlobalId),
    /// An alloca.
    Stack { func: FuncId, instr: InstrId },
    /// Memory reachable through a pointer parameter.
    ArgMem { func: FuncId, arg: u32 },
    /// Memory reached by dereferencing a pointer stored in another object.
    Deref(Box<MemObject>),
    /// A constant address.
    Absolute(i64),
    /// Defined by an instruction we cannot see through (e.g. a call result).
    Opaque { func: FuncId, instr: InstrId },
    /// No resolution at all. All unknown accesses share this object, which
    /// keeps the downstream filters fail-closed.
    Unknown,
}

impl MemObject {
    /// Objects precise enough to support a must-not-alias verdict.
    fn is_strong(&self) -> bool {
        matches!(
            self,
            MemObject::Global(_) | MemObject::Stack { .. } | MemObject::Absolute(_)
        )
    }
}

/// Query surface the race detector needs from a pointer analysis.
pub trait PointsTo {
    /// Sorted set of objects the access `(func, ptr)` may reference.
    fn objects(&self, func: FuncId, ptr: Value) -> &[ObjectId];

    /// The allocation root behind an object handle.
    fn object_root(&self, obj: ObjectId) -> &MemObject;

    /// True only when the two accesses provably never touch the same
    /// memory.
    fn must_not_alias(&self, a: (FuncId, Value), b: (FuncId, Value)) -> bool;
}

/// Flow-insensitive resolution of every access in the trace to allocation
/// roots. Built once per trace; lookups are pure map reads afterwards.
pub struct ModulePointsTo {
    objects: FnvHashMap<(FuncId, Value), Vec<ObjectId>>,
    roots: Vec<MemObject>,
    intern: BTreeMap<MemObject, ObjectId>,
    empty: Vec<ObjectId>,
}

impl ModulePointsTo {
    pub fn new(module: &Module, program: &ProgramTrace) -> Self {
        let mut pts = ModulePointsTo {
            objects: FnvHashMap::default(),
            roots: Vec::new(),
            intern: BTreeMap::new(),
            empty: Vec::new(),
        };

        for thread in program.threads() {
            for event in &thread.events {
                if let EventKind::Read { ptr } | EventKind::Write { ptr } = event.kind {
                    let key = (event.site.func, ptr);
                    if pts.objects.contains_key(&key) {
                        continue;
                    }
                    let mut visited = Vec::new();
                    let mut roots = resolve(module, key.0, ptr, 0, &mut visited);
                    if roots.is_empty() {
                        // a degenerate resolution (pure phi cycle) must not
                        // look like "touches nothing"
                        roots.push(MemObject::Unknown);
                    }
                    roots.sort();
                    roots.dedup();
                    let mut ids: Vec<ObjectId> =
                        roots.into_iter().map(|root| pts.intern(root)).collect();
                    ids.sort_unstable();
                    pts.objects.insert(key, ids);
                }
            }
        }

        pts
    }

    fn intern(&mut self, obj: MemObject) -> ObjectId {
        if let Some(&id) = self.intern.get(&obj) {
            return id;
        }
        let id = ObjectId(self.roots.len() as u32);
        self.roots.push(obj.clone());
        self.intern.insert(obj, id);
        id
    }
}

impl PointsTo for ModulePointsTo {
    fn objects(&self, func: FuncId, ptr: Value) -> &[ObjectId] {
        self.objects
            .get(&(func, ptr))
            .map(Vec::as_slice)
            .unwrap_or(&self.empty)
    }

    fn object_root(&self, obj: ObjectId) -> &MemObject {
        &self.roots[obj.0 as usize]
    }

    fn must_not_alias(&self, a: (FuncId, Value), b: (FuncId, Value)) -> bool {
        let objs_a = self.objects(a.0, a.1);
        let objs_b = self.objects(b.0, b.1);
        if objs_a.is_empty() || objs_b.is_empty() {
            return false;
        }

        // Disjointness is only trusted between precisely named memory.
        let all_strong = objs_a
            .iter()
            .chain(objs_b)
            .all(|&o| self.object_root(o).is_strong());
        if !all_strong {
            return false;
        }

        objs_a.iter().all(|o| !objs_b.contains(o))
    }
}

const MAX_DEREF_DEPTH: usize = 4;

/// Backward resolution of a pointer to its allocation roots. Bounded on
/// load depth and guarded against phi cycles.
fn resolve(
    module: &Module,
    func: FuncId,
    value: Value,
    depth: usize,
    visited_phis: &mut Vec<InstrId>,
) -> Vec<MemObject> {
    if depth > MAX_DEREF_DEPTH {
        return vec![MemObject::Unknown];
    }

    match module.strip_casts(func, value) {
        Value::Global(g) => vec![MemObject::Global(g)],
        Value::Arg(a) => vec![MemObject::ArgMem { func, arg: a }],
        Value::Const(c) => vec![MemObject::Absolute(c)],
        Value::Func(_) => vec![MemObject::Unknown],
        Value::Instr(id) => match &module.function(func).instr(id).kind {
            InstrKind::Alloca => vec![MemObject::Stack { func, instr: id }],
            InstrKind::Gep { base, .. } => resolve(module, func, *base, depth, visited_phis),
            InstrKind::Load { ptr, .. } => resolve(module, func, *ptr, depth + 1, visited_phis)
                .into_iter()
                .map(|root| match root {
                    MemObject::Unknown => MemObject::Unknown,
                    other => MemObject::Deref(Box::new(other)),
                })
                .collect(),
            InstrKind::Phi { incoming } => {
                if visited_phis.contains(&id) {
                    return Vec::new();
                }
                visited_phis.push(id);
                let mut roots = Vec::new();
                for (_, value) in incoming {
                    roots.extend(resolve(module, func, *value, depth, visited_phis));
                }
                roots
            }
            InstrKind::BinOp { lhs, rhs, .. } => {
                // pointer arithmetic: the non-constant side carries the root
                let mut roots = Vec::new();
                for operand in [lhs, rhs] {
                    if !matches!(operand, Value::Const(_)) {
                        roots.extend(resolve(module, func, *operand, depth, visited_phis));
                    }
                }
                if roots.is_empty() {
                    vec![MemObject::Unknown]
                } else {
                    roots
                }
            }
            _ => vec![MemObject::Opaque { func, instr: id }],
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::build::{FuncBuilder, ModuleBuilder};

    fn trace_of(module: &Module) -> ProgramTrace<'_> {
        ProgramTrace::build(module, "main").unwrap()
    }

    #[test]
    fn test_global_access_resolves_to_global_object() {
        let mut m = ModuleBuilder::new();
        let g = m.global("x");
        let mut main = FuncBuilder::new("main", 0);
        main.store(Value::Global(g), Value::Const(1));
        main.ret();
        m.define(main.finish());
        let module = m.finish();
        let trace = trace_of(&module);

        let pts = ModulePointsTo::new(&module, &trace);
        let objs = pts.objects(crate::ir::FuncId(0), Value::Global(g));
        assert_eq!(objs.len(), 1);
        assert_eq!(pts.object_root(objs[0]), &MemObject::Global(g));
    }

    #[test]
    fn test_gep_chain_resolves_to_base() {
        let mut m = ModuleBuilder::new();
        let g = m.global("a");
        let mut main = FuncBuilder::new("main", 0);
        let inner = main.gep(Value::Global(g), Value::Const(0));
        let outer = main.gep(inner, Value::Const(4));
        main.store(outer, Value::Const(1));
        main.ret();
        m.define(main.finish());
        let module = m.finish();
        let trace = trace_of(&module);

        let pts = ModulePointsTo::new(&module, &trace);
        let objs = pts.objects(crate::ir::FuncId(0), outer);
        assert_eq!(pts.object_root(objs[0]), &MemObject::Global(g));
    }

    #[test]
    fn test_distinct_globals_must_not_alias() {
        let mut m = ModuleBuilder::new();
        let a = m.global("a");
        let b = m.global("b");
        let mut main = FuncBuilder::new("main", 0);
        main.store(Value::Global(a), Value::Const(1));
        main.store(Value::Global(b), Value::Const(1));
        main.ret();
        let fid = m.define(main.finish());
        let module = m.finish();
        let trace = trace_of(&module);

        let pts = ModulePointsTo::new(&module, &trace);
        assert!(pts.must_not_alias((fid, Value::Global(a)), (fid, Value::Global(b))));
        assert!(!pts.must_not_alias((fid, Value::Global(a)), (fid, Value::Global(a))));
    }

    #[test]
    fn test_phi_merges_both_roots() {
        let mut m = ModuleBuilder::new();
        let a = m.global("a");
        let b = m.global("b");
        let mut main = FuncBuilder::new("main", 0);
        let body = main.new_block();
        main.br(body);
        main.switch_to(body);
        let merged = main.phi(vec![
            (crate::ir::BlockId(0), Value::Global(a)),
            (body, Value::Global(b)),
        ]);
        main.store(merged, Value::Const(1));
        main.ret();
        let fid = m.define(main.finish());
        let module = m.finish();
        let trace = trace_of(&module);

        let pts = ModulePointsTo::new(&module, &trace);
        let objs = pts.objects(fid, merged);
        assert_eq!(objs.len(), 2);
    }

    #[test]
    fn test_param_memory_is_weak_for_must_not_alias() {
        let mut m = ModuleBuilder::new();
        let mut main = FuncBuilder::new("main", 2);
        main.store(Value::Arg(0), Value::Const(1));
        main.store(Value::Arg(1), Value::Const(1));
        main.ret();
        let fid = m.define(main.finish());
        let module = m.finish();
        let trace = trace_of(&module);

        let pts = ModulePointsTo::new(&module, &trace);
        // two params may point at the same memory; never claim disjointness
        assert!(!pts.must_not_alias((fid, Value::Arg(0)), (fid, Value::Arg(1))));
    }
}
