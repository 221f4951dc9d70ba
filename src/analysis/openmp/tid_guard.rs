//! Thread-id guard analysis.
//!
//! Models `if (omp_get_thread_num() == K) { ... }`: accesses guarded by
//! equality checks against the same constant thread id always execute on
//! the same thread and cannot race with each other. Guarded blocks are
//! found by forward reachability from the branch target, stopping at the
//! first block with an unguarded predecessor; back edges therefore end the
//! walk, so guarded code containing loops is not handled.

use fnv::FnvHashMap;

use crate::ir::cfg::Cfg;
use crate::ir::{BlockId, CmpPred, FuncId, InstrId, InstrKind, InstrSite, Module, Value};

pub struct TidGuardAnalysis {
    /// block -> the constant thread id guarding it
    guarded: FnvHashMap<(FuncId, BlockId), i64>,
}

impl TidGuardAnalysis {
    /// One-time module scan for all guards.
    pub fn new(module: &Module) -> Self {
        let mut guarded = FnvHashMap::default();

        for (fidx, func) in module.functions.iter().enumerate() {
            let func_id = FuncId(fidx as u32);
            let mut cfg: Option<Cfg> = None;

            for instr_id in func.instrs_in_order() {
                let InstrKind::Call {
                    callee: Some(name), ..
                } = &func.instr(instr_id).kind
                else {
                    continue;
                };
                if !crate::ir::model::openmp::is_get_thread_num(name) {
                    continue;
                }

                for (cmp, tid) in const_cmp_eq_insts(func, Value::Instr(instr_id)) {
                    for user in func.users(Value::Instr(cmp)) {
                        let InstrKind::Branch {
                            cond: Some(_),
                            then_blk,
                            else_blk: Some(_),
                            ..
                        } = &func.instr(user).kind
                        else {
                            continue;
                        };
                        let cfg = cfg.get_or_insert_with(|| Cfg::new(func));
                        for block in guarded_blocks(func, cfg, *then_blk) {
                            guarded.insert((func_id, block), tid);
                        }
                    }
                }
            }
        }

        TidGuardAnalysis { guarded }
    }

    fn guard_of(&self, module: &Module, site: InstrSite) -> Option<i64> {
        let block = module.function(site.func).block_of(site.instr);
        self.guarded.get(&(site.func, block)).copied()
    }

    /// True if both sites sit under guards comparing the thread id against
    /// the same constant.
    pub fn guarded_by_same_tid(&self, module: &Module, a: InstrSite, b: InstrSite) -> bool {
        match (self.guard_of(module, a), self.guard_of(module, b)) {
            (Some(ta), Some(tb)) => ta == tb,
            _ => false,
        }
    }
}

/// Equality compares of `value` against a constant, following loads and
/// store/load pairs through memory.
fn const_cmp_eq_insts(
    func: &crate::ir::Function,
    value: Value,
) -> Vec<(InstrId, i64)> {
    let mut result = Vec::new();
    let mut worklist = func.users(value);
    let mut tracked = vec![value];

    while let Some(user) = worklist.pop() {
        match &func.instr(user).kind {
            // follow loads of a tracked pointer
            InstrKind::Load { .. } => {
                if !tracked.contains(&Value::Instr(user)) {
                    tracked.push(Value::Instr(user));
                    worklist.extend(func.users(Value::Instr(user)));
                }
            }
            // follow a spill: track the slot the value is stored into
            InstrKind::Store { ptr, value: stored, .. } => {
                if tracked.contains(stored) && !tracked.contains(ptr) {
                    tracked.push(*ptr);
                    worklist.extend(func.users(*ptr));
                }
            }
            InstrKind::Cmp { pred, lhs, rhs } => {
                if *pred != CmpPred::Eq {
                    continue;
                }
                let constant = match (lhs, rhs) {
                    (Value::Const(c), other) if tracked.contains(other) => Some(*c),
                    (other, Value::Const(c)) if tracked.contains(other) => Some(*c),
                    _ => None,
                };
                if let Some(c) = constant {
                    result.push((user, c));
                }
            }
            _ => {}
        }
    }

    result
}

/// Blocks guarded by the taken branch: start from the target and extend
/// while every predecessor is already guarded.
fn guarded_blocks(func: &crate::ir::Function, cfg: &Cfg, target: BlockId) -> Vec<BlockId> {
    let mut guarded = vec![target];
    let mut visited = vec![target];
    let mut worklist: Vec<BlockId> = cfg.successors(target).to_vec();

    while let Some(block) = worklist.pop() {
        if visited.contains(&block) {
            continue;
        }
        let has_unguarded_pred = cfg
            .predecessors(block)
            .iter()
            .any(|pred| !guarded.contains(pred));
        if has_unguarded_pred {
            continue;
        }
        visited.push(block);
        guarded.push(block);
        for &succ in cfg.successors(block) {
            if !visited.contains(&succ) {
                worklist.push(succ);
            }
        }
    }

    guarded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::build::{FuncBuilder, ModuleBuilder};

    /// if (omp_get_thread_num() == tid) { store g; } store g;
    fn guarded_module(tid_a: i64, tid_b: i64) -> (crate::ir::Module, InstrSite, InstrSite, InstrSite) {
        let mut m = ModuleBuilder::new();
        let g = m.global("g");

        let mut f = FuncBuilder::new("main.omp_outlined", 2);
        let then_a = f.new_block();
        let mid = f.new_block();
        let then_b = f.new_block();
        let tail = f.new_block();

        let tid = f.call("omp_get_thread_num", vec![]);
        let cmp_a = f.cmp(CmpPred::Eq, tid, Value::Const(tid_a));
        f.br_cond(cmp_a, then_a, mid);

        f.switch_to(then_a);
        let Value::Instr(store_a) = f.store(Value::Global(g), Value::Const(1)) else {
            unreachable!()
        };
        f.br(mid);

        f.switch_to(mid);
        let tid2 = f.call("omp_get_thread_num", vec![]);
        let cmp_b = f.cmp(CmpPred::Eq, tid2, Value::Const(tid_b));
        f.br_cond(cmp_b, then_b, tail);

        f.switch_to(then_b);
        let Value::Instr(store_b) = f.store(Value::Global(g), Value::Const(2)) else {
            unreachable!()
        };
        f.br(tail);

        f.switch_to(tail);
        let Value::Instr(store_tail) = f.store(Value::Global(g), Value::Const(3)) else {
            unreachable!()
        };
        f.ret();
        let fid = m.define(f.finish());

        let site = |instr| InstrSite { func: fid, instr };
        (m.finish(), site(store_a), site(store_b), site(store_tail))
    }

    #[test]
    fn test_same_constant_guard_is_exclusive() {
        let (module, a, b, _) = guarded_module(0, 0);
        let guards = TidGuardAnalysis::new(&module);
        assert!(guards.guarded_by_same_tid(&module, a, b));
    }

    #[test]
    fn test_different_constants_are_not_exclusive() {
        let (module, a, b, _) = guarded_module(0, 1);
        let guards = TidGuardAnalysis::new(&module);
        assert!(!guards.guarded_by_same_tid(&module, a, b));
    }

    #[test]
    fn test_unguarded_access_is_not_exclusive() {
        let (module, a, _, tail) = guarded_module(0, 0);
        let guards = TidGuardAnalysis::new(&module);
        assert!(!guards.guarded_by_same_tid(&module, a, tail));
    }
}
