//! Lastprivate-block analysis.
//!
//! The `for_static_init` call writes an is-last-iteration flag; codegen
//! then branches on a constant compare of that flag around the copy-out
//! code. Blocks on the last-iteration side run on exactly one thread.
//!
//! Two accesses both inside lastprivate blocks are treated as non-racing.
//! That is faithful to observed codegen, which places a barrier after the
//! copy-out even when `nowait` would allow racing per the language spec;
//! the modeling choice is deliberate and recorded in DESIGN.md.

use std::collections::HashSet;

use fnv::FnvHashMap;

use crate::ir::cfg::Cfg;
use crate::ir::{BlockId, CmpPred, FuncId, InstrKind, InstrSite, Module, Value};

pub struct LastprivateAnalysis {
    blocks: HashSet<(FuncId, BlockId)>,
}

impl LastprivateAnalysis {
    /// One-time scan: every `for_static_init` call's lastiter flag, the
    /// constant compares against its loaded value, and the blocks guarded
    /// by the last-iteration side of those compares.
    pub fn new(module: &Module) -> Self {
        let mut blocks = HashSet::new();

        for (fidx, func) in module.functions.iter().enumerate() {
            let func_id = FuncId(fidx as u32);
            let mut cfg: Option<Cfg> = None;

            for instr_id in func.instrs_in_order() {
                let InstrKind::Call {
                    callee: Some(name),
                    args,
                } = &func.instr(instr_id).kind
                else {
                    continue;
                };
                if !crate::ir::model::openmp::is_for_static_init(name) {
                    continue;
                }
                // __kmpc_for_static_init(loc, gtid, schedtype, plastiter, ...)
                let Some(&flag_ptr) = args.get(3) else { continue };

                for (branch, last_is_true) in lastiter_branches(func, flag_ptr) {
                    let InstrKind::Branch {
                        then_blk,
                        else_blk: Some(else_blk),
                        ..
                    } = &func.instr(branch).kind
                    else {
                        continue;
                    };
                    let target = if last_is_true { *then_blk } else { *else_blk };
                    let cfg = cfg.get_or_insert_with(|| Cfg::new(func));
                    for block in guarded(func, cfg, target) {
                        blocks.insert((func_id, block));
                    }
                }
            }
        }

        LastprivateAnalysis { blocks }
    }

    pub fn is_guarded(&self, module: &Module, site: InstrSite) -> bool {
        let block = module.function(site.func).block_of(site.instr);
        self.blocks.contains(&(site.func, block))
    }
}

/// Branches on a constant-equality compare of the loaded lastiter flag.
/// Returns each branch plus whether the last-iteration path is the true
/// side (`flag == 0` puts it on the false side).
fn lastiter_branches(
    func: &crate::ir::Function,
    flag_ptr: Value,
) -> Vec<(crate::ir::InstrId, bool)> {
    let mut branches = Vec::new();
    let mut loads = Vec::new();
    for user in func.users(flag_ptr) {
        if matches!(func.instr(user).kind, InstrKind::Load { .. }) {
            loads.push(Value::Instr(user));
        }
    }

    let mut cmp_polarity: FnvHashMap<Value, bool> = FnvHashMap::default();
    for load in &loads {
        for user in func.users(*load) {
            if let InstrKind::Cmp { pred: CmpPred::Eq, lhs, rhs } = &func.instr(user).kind {
                let constant = match (lhs, rhs) {
                    (Value::Const(c), other) if other == load => Some(*c),
                    (other, Value::Const(c)) if other == load => Some(*c),
                    _ => None,
                };
                if let Some(c) = constant {
                    // flag == 0 means "not last": the guarded side is false
                    cmp_polarity.insert(Value::Instr(user), c != 0);
                }
            }
        }
    }

    for (cmp, last_is_true) in &cmp_polarity {
        for user in func.users(*cmp) {
            if matches!(
                func.instr(user).kind,
                InstrKind::Branch {
                    cond: Some(_),
                    else_blk: Some(_),
                    ..
                }
            ) {
                branches.push((user, *last_is_true));
            }
        }
    }

    branches
}

fn guarded(func: &crate::ir::Function, cfg: &Cfg, target: BlockId) -> Vec<BlockId> {
    let mut guarded = vec![target];
    let mut visited = vec![target];
    let mut worklist: Vec<BlockId> = cfg.successors(target).to_vec();

    while let Some(block) = worklist.pop() {
        if visited.contains(&block) {
            continue;
        }
        if cfg
            .predecessors(block)
            .iter()
            .any(|pred| !guarded.contains(pred))
        {
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

    /// for_static_init(.., &lastiter, ..); if (lastiter == 1) { store g; }
    /// store g;
    fn lastprivate_module() -> (crate::ir::Module, InstrSite, InstrSite) {
        let mut m = ModuleBuilder::new();
        let g = m.global("g");

        let mut f = FuncBuilder::new("main.omp_outlined", 2);
        let copy_out = f.new_block();
        let tail = f.new_block();

        let lastiter = f.alloca();
        f.store(lastiter, Value::Const(0));
        f.call(
            "__kmpc_for_static_init_4",
            vec![
                Value::Const(0),
                Value::Const(0),
                Value::Const(34),
                lastiter,
                Value::Const(0),
                Value::Const(0),
            ],
        );
        let flag = f.load(lastiter);
        let cmp = f.cmp(CmpPred::Eq, flag, Value::Const(1));
        f.br_cond(cmp, copy_out, tail);

        f.switch_to(copy_out);
        let Value::Instr(guarded_store) = f.store(Value::Global(g), Value::Const(1)) else {
            unreachable!()
        };
        f.br(tail);

        f.switch_to(tail);
        let Value::Instr(tail_store) = f.store(Value::Global(g), Value::Const(2)) else {
            unreachable!()
        };
        f.ret();
        let fid = m.define(f.finish());

        let site = |instr| InstrSite { func: fid, instr };
        (m.finish(), site(guarded_store), site(tail_store))
    }

    #[test]
    fn test_copy_out_block_is_lastprivate() {
        let (module, guarded_store, tail_store) = lastprivate_module();
        let lastprivate = LastprivateAnalysis::new(&module);
        assert!(lastprivate.is_guarded(&module, guarded_store));
        assert!(!lastprivate.is_guarded(&module, tail_store));
    }

    #[test]
    fn test_flag_eq_zero_guards_the_false_side() {
        let mut m = ModuleBuilder::new();
        let g = m.global("g");

        let mut f = FuncBuilder::new("main.omp_outlined", 2);
        let not_last = f.new_block();
        let copy_out = f.new_block();

        let lastiter = f.alloca();
        f.call(
            "__kmpc_for_static_init_4",
            vec![
                Value::Const(0),
                Value::Const(0),
                Value::Const(34),
                lastiter,
                Value::Const(0),
                Value::Const(0),
            ],
        );
        let flag = f.load(lastiter);
        let cmp = f.cmp(CmpPred::Eq, flag, Value::Const(0));
        f.br_cond(cmp, not_last, copy_out);

        f.switch_to(not_last);
        f.ret();

        f.switch_to(copy_out);
        let Value::Instr(guarded_store) = f.store(Value::Global(g), Value::Const(1)) else {
            unreachable!()
        };
        f.ret();
        let fid = m.define(f.finish());
        let module = m.finish();

        let lastprivate = LastprivateAnalysis::new(&module);
        assert!(lastprivate.is_guarded(
            &module,
            InstrSite {
                func: fid,
                instr: guarded_store
            }
        ));
    }
}
