//! Induction-variable provenance.
//!
//! The perfect-alignment check needs to know which loop's induction
//! variable an array index is derived from. The walk runs backwards from
//! the index value across casts, arithmetic, and phi merges (all handled by
//! the symbolic translation: a derivation lands on an add recurrence), and
//! additionally through one level of index-array indirection, so that
//! `A[B[i]]` counts as derived from `i`.

use crate::ir::{BlockId, FuncId, InstrId, InstrKind, Module, Value};
use crate::scev::{Expr, ScalarEvolution};

/// How many load indirections the walk is willing to look through.
const INDIRECTION_FUEL: usize = 3;

/// The header of the loop whose induction variable `value` derives from.
pub fn induction_source(
    module: &Module,
    func: FuncId,
    se: &mut ScalarEvolution,
    value: Value,
) -> Option<BlockId> {
    induction_source_bounded(module, func, se, value, INDIRECTION_FUEL)
}

fn induction_source_bounded(
    module: &Module,
    func: FuncId,
    se: &mut ScalarEvolution,
    value: Value,
    fuel: usize,
) -> Option<BlockId> {
    if fuel == 0 {
        return None;
    }

    let expr = se.expr(value);
    let expr = se.push_casts(&expr);
    if let Expr::AddRec { header, .. } = expr {
        return Some(header);
    }

    // indirection: the index is loaded from an array indexed by an
    // induction variable
    let stripped = module.strip_casts(func, value);
    let Value::Instr(id) = stripped else {
        return None;
    };
    let InstrKind::Load { ptr, .. } = module.function(func).instr(id).kind.clone() else {
        return None;
    };
    let Value::Instr(gep) = module.strip_casts(func, ptr) else {
        return None;
    };
    let InstrKind::Gep { index, .. } = module.function(func).instr(gep).kind.clone() else {
        return None;
    };
    induction_source_bounded(module, func, se, index, fuel - 1)
}

/// Index values of a (possibly chained) gep, outermost dimension first.
pub fn gep_chain(module: &Module, func: FuncId, gep: InstrId) -> Vec<Value> {
    let f = module.function(func);
    let mut indexes = Vec::new();
    let mut current = gep;

    loop {
        let InstrKind::Gep { base, index, .. } = f.instr(current).kind.clone() else {
            break;
        };
        indexes.push(index);
        match module.strip_casts(func, base) {
            Value::Instr(inner)
                if matches!(f.instr(inner).kind, InstrKind::Gep { .. }) =>
            {
                current = inner;
            }
            _ => break,
        }
    }

    indexes.reverse();
    indexes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::build::{FuncBuilder, ModuleBuilder};
    use crate::ir::{BinOp, CastOp, CmpPred, GlobalId};

    /// Loop writing A[i], A[2*i+1], and A[B[i]] each iteration.
    fn indexed_module() -> (crate::ir::Module, Vec<Value>, BlockId) {
        let mut m = ModuleBuilder::new();
        let a = m.global("A");
        let b = m.global("B");

        let mut f = FuncBuilder::new("f", 0);
        let body = f.new_block();
        let exit = f.new_block();
        f.br(body);
        f.switch_to(body);
        let entry = BlockId(0);
        let iv = f.phi(vec![(entry, Value::Const(0))]);

        // A[i]
        let direct = f.gep_scaled(Value::Global(a), iv, 4);
        f.store(direct, Value::Const(0));
        // A[2*i+1], through a sign extension
        let scaled = f.binop(BinOp::Mul, iv, Value::Const(2));
        let shifted = f.binop(BinOp::Add, scaled, Value::Const(1));
        let widened = f.cast(CastOp::SExt, shifted);
        let arith = f.gep_scaled(Value::Global(a), widened, 4);
        f.store(arith, Value::Const(0));
        // A[B[i]]
        let bslot = f.gep_scaled(Value::Global(b), iv, 4);
        let loaded = f.load(bslot);
        let indirect = f.gep_scaled(Value::Global(a), loaded, 4);
        f.store(indirect, Value::Const(0));

        let inc = f.binop(BinOp::Add, iv, Value::Const(1));
        let cmp = f.cmp(CmpPred::Slt, inc, Value::Const(100));
        f.br_cond(cmp, body, exit);
        f.switch_to(exit);
        f.ret();

        let mut func = f.finish();
        let Value::Instr(phi_id) = iv else { unreachable!() };
        if let InstrKind::Phi { incoming } = &mut func.instrs[phi_id.0 as usize].kind {
            incoming.push((body, inc));
        }
        m.define(func);
        (m.finish(), vec![iv, widened, loaded], body)
    }

    #[test]
    fn test_direct_and_arith_derivations_reach_the_loop() {
        let (module, values, header) = indexed_module();
        let mut se = ScalarEvolution::new(&module, FuncId(0));

        // plain induction variable
        assert_eq!(
            induction_source(&module, FuncId(0), &mut se, values[0]),
            Some(header)
        );
        // sext(2*i + 1) still derives from i
        assert_eq!(
            induction_source(&module, FuncId(0), &mut se, values[1]),
            Some(header)
        );
    }

    #[test]
    fn test_index_array_indirection_is_followed() {
        let (module, values, header) = indexed_module();
        let mut se = ScalarEvolution::new(&module, FuncId(0));
        assert_eq!(
            induction_source(&module, FuncId(0), &mut se, values[2]),
            Some(header)
        );
    }

    #[test]
    fn test_loop_invariant_value_has_no_source() {
        let (module, _, _) = indexed_module();
        let mut se = ScalarEvolution::new(&module, FuncId(0));
        assert_eq!(
            induction_source(&module, FuncId(0), &mut se, Value::Global(GlobalId(0))),
            None
        );
    }

    #[test]
    fn test_gep_chain_orders_outermost_first() {
        let mut m = ModuleBuilder::new();
        let a = m.global("A");
        let mut f = FuncBuilder::new("f", 2);
        let outer = f.gep_scaled(Value::Global(a), Value::Arg(0), 400);
        let inner = f.gep_scaled(outer, Value::Arg(1), 4);
        f.store(inner, Value::Const(0));
        f.ret();
        m.define(f.finish());
        let module = m.finish();

        let Value::Instr(inner_id) = inner else { unreachable!() };
        let chain = gep_chain(&module, FuncId(0), inner_id);
        assert_eq!(chain, vec![Value::Arg(0), Value::Arg(1)]);
    }
}
