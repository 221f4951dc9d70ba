//! Lock-set computation: which locks are provably held at an event.
//!
//! The held set is a multiset so that re-entrant and nested locking behave
//! correctly: acquiring the same lock twice requires two releases before it
//! is free again. Held sets are a pure function of the thread prefix, so
//! they are computed once per event and cached.

use fnv::FnvHashMap;

use crate::ir::ValueKey;
use crate::trace::{EventKind, EventRef, ProgramTrace};

pub struct LockSet {
    /// Sorted lock multisets, cached per event.
    cache: FnvHashMap<EventRef, Vec<ValueKey>>,
}

impl LockSet {
    pub fn new(_program: &ProgramTrace) -> Self {
        LockSet {
            cache: FnvHashMap::default(),
        }
    }

    /// Multiset of locks held at (excluding) `target`, computed by
    /// replaying the thread's prefix: push on Lock, remove one matching
    /// instance on Unlock. Returned sorted for merge intersection.
    pub fn held_locks(&mut self, program: &ProgramTrace, target: EventRef) -> &[ValueKey] {
        if !self.cache.contains_key(&target) {
            let mut locks: Vec<ValueKey> = Vec::new();
            for event in &program.thread(target.thread).events {
                if event.id == target.event {
                    break;
                }
                match event.kind {
                    EventKind::Lock { key, .. } => locks.push(key),
                    EventKind::Unlock { key, .. } => {
                        // only remove the first matching instance
                        if let Some(pos) = locks.iter().position(|&held| held == key) {
                            locks.remove(pos);
                        }
                    }
                    _ => {}
                }
            }
            locks.sort_unstable();
            self.cache.insert(target, locks);
        }
        &self.cache[&target]
    }

    /// True iff the two events' held multisets share at least one lock.
    /// Sort-merge walk: true on the first common element, false when the
    /// streams diverge completely.
    pub fn shares_lock(&mut self, program: &ProgramTrace, lhs: EventRef, rhs: EventRef) -> bool {
        let lhs_locks = self.held_locks(program, lhs).to_vec();
        let rhs_locks = self.held_locks(program, rhs);

        let (mut i, mut j) = (0, 0);
        while i < lhs_locks.len() && j < rhs_locks.len() {
            match lhs_locks[i].cmp(&rhs_locks[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => return true,
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::build::{FuncBuilder, ModuleBuilder};
    use crate::ir::{GlobalId, Value};
    use crate::trace::ThreadId;

    /// worker: lock(m); lock(m); write x; unlock(m); write x; unlock(m); write x
    fn nested_lock_module() -> crate::ir::Module {
        let mut m = ModuleBuilder::new();
        m.global("x");
        m.global("m");

        let mut worker = FuncBuilder::new("worker", 1);
        worker.call("pthread_mutex_lock", vec![Value::Global(GlobalId(1))]);
        worker.call("pthread_mutex_lock", vec![Value::Global(GlobalId(1))]);
        worker.store(Value::Global(GlobalId(0)), Value::Const(1));
        worker.call("pthread_mutex_unlock", vec![Value::Global(GlobalId(1))]);
        worker.store(Value::Global(GlobalId(0)), Value::Const(2));
        worker.call("pthread_mutex_unlock", vec![Value::Global(GlobalId(1))]);
        worker.store(Value::Global(GlobalId(0)), Value::Const(3));
        worker.ret();
        let worker_id = m.define(worker.finish());

        let mut main = FuncBuilder::new("main", 0);
        let t = main.alloca();
        main.call(
            "pthread_create",
            vec![t, Value::Const(0), Value::Func(worker_id), Value::Const(0)],
        );
        main.ret();
        m.define(main.finish());
        m.finish()
    }

    fn eref(thread: u32, event: usize) -> EventRef {
        EventRef {
            thread: ThreadId(thread),
            event,
        }
    }

    #[test]
    fn test_nested_lock_released_pairwise() {
        let module = nested_lock_module();
        let trace = ProgramTrace::build(&module, "main").unwrap();
        let mut lockset = LockSet::new(&trace);

        // events on worker: 0 lock, 1 lock, 2 write, 3 unlock, 4 write, 5 unlock, 6 write
        assert_eq!(lockset.held_locks(&trace, eref(1, 2)).len(), 2);
        assert_eq!(lockset.held_locks(&trace, eref(1, 4)).len(), 1);
        assert!(lockset.held_locks(&trace, eref(1, 6)).is_empty());
    }

    #[test]
    fn test_shares_lock_on_common_mutex() {
        let module = nested_lock_module();
        let trace = ProgramTrace::build(&module, "main").unwrap();
        let mut lockset = LockSet::new(&trace);

        assert!(lockset.shares_lock(&trace, eref(1, 2), eref(1, 4)));
        assert!(!lockset.shares_lock(&trace, eref(1, 2), eref(1, 6)));
    }

    #[test]
    fn test_held_locks_cached_result_is_stable() {
        let module = nested_lock_module();
        let trace = ProgramTrace::build(&module, "main").unwrap();
        let mut lockset = LockSet::new(&trace);

        let first = lockset.held_locks(&trace, eref(1, 2)).to_vec();
        let second = lockset.held_locks(&trace, eref(1, 2)).to_vec();
        assert_eq!(first, second);
    }
}
