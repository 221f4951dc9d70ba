//! Symbolic affine bound reasoning over index expressions.
//!
//! This is the oracle behind the parallel-loop overlap analysis: translate
//! an address computation into an affine expression over loop induction
//! variables, subtract two such expressions, and decide whether the gap is
//! a provable constant. Add recurrences are written `{start,+,step}<loop>`;
//! an access in a nested loop nests the outer recurrence inside the inner
//! one's start, so the outermost expression node always belongs to the
//! innermost loop.
//!
//! Everything here deliberately gives up early: any shape outside the
//! affine fragment becomes `Unknown`, and the overlap analysis treats
//! unknown gaps as "may overlap".

use fnv::FnvHashMap;

use crate::ir::cfg::{natural_loops, Cfg, Loop};
use crate::ir::{
    BinOp, BlockId, CastOp, CmpPred, FuncId, InstrId, InstrKind, Module, Value, ValueKey,
};

/// A symbolic expression in the affine fragment.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Expr {
    Const(i64),
    Unknown(ValueKey),
    Add(Vec<Expr>),
    Mul(Vec<Expr>),
    /// `start + n * step` after `n` iterations of the loop with this header.
    AddRec {
        start: Box<Expr>,
        step: Box<Expr>,
        header: BlockId,
    },
    SExt(Box<Expr>),
    ZExt(Box<Expr>),
}

impl Expr {
    pub fn const_value(&self) -> Option<i64> {
        match self {
            Expr::Const(c) => Some(*c),
            _ => None,
        }
    }

    /// Preorder search for a sub-expression satisfying `pred`.
    pub fn find<'a>(&'a self, pred: &impl Fn(&Expr) -> bool) -> Option<&'a Expr> {
        if pred(self) {
            return Some(self);
        }
        match self {
            Expr::Add(terms) | Expr::Mul(terms) => {
                terms.iter().find_map(|t| t.find(pred))
            }
            Expr::AddRec { start, step, .. } => {
                start.find(pred).or_else(|| step.find(pred))
            }
            Expr::SExt(inner) | Expr::ZExt(inner) => inner.find(pred),
            Expr::Const(_) | Expr::Unknown(_) => None,
        }
    }
}

/// Per-function symbolic evolution engine: expression translation, affine
/// algebra, loop backedge counts, and OpenMP static loop bounds.
pub struct ScalarEvolution<'m> {
    module: &'m Module,
    func: FuncId,
    pub cfg: Cfg,
    loops: Vec<Loop>,
    /// Blocks containing a `for_static_init` call.
    static_init_calls: FnvHashMap<BlockId, InstrId>,
    cache: FnvHashMap<Value, Expr>,
    /// Phi nodes currently being translated, to cut recurrence cycles.
    in_progress: Vec<InstrId>,
}

impl<'m> ScalarEvolution<'m> {
    pub fn new(module: &'m Module, func: FuncId) -> Self {
        let f = module.function(func);
        let cfg = Cfg::new(f);
        let loops = natural_loops(f, &cfg);

        let mut static_init_calls = FnvHashMap::default();
        for instr_id in f.instrs_in_order() {
            if let InstrKind::Call {
                callee: Some(name), ..
            } = &f.instr(instr_id).kind
            {
                if crate::ir::model::openmp::is_for_static_init(name) {
                    static_init_calls.insert(f.block_of(instr_id), instr_id);
                }
            }
        }

        ScalarEvolution {
            module,
            func,
            cfg,
            loops,
            static_init_calls,
            cache: FnvHashMap::default(),
            in_progress: Vec::new(),
        }
    }

    pub fn loops(&self) -> &[Loop] {
        &self.loops
    }

    fn loop_by_header(&self, header: BlockId) -> Option<&Loop> {
        self.loops.iter().find(|l| l.header == header)
    }

    /// Nesting depth of a loop header (0 = outermost).
    fn loop_depth(&self, header: BlockId) -> usize {
        self.loops
            .iter()
            .filter(|l| l.header != header && l.contains(header))
            .count()
    }

    // ---- translation -----------------------------------------------------

    /// Translate a value into the affine fragment.
    pub fn expr(&mut self, value: Value) -> Expr {
        if let Some(cached) = self.cache.get(&value) {
            return cached.clone();
        }
        let result = self.translate(value);
        self.cache.insert(value, result.clone());
        result
    }

    fn unknown(&self, value: Value) -> Expr {
        Expr::Unknown(self.module.value_key(self.func, value))
    }

    fn translate(&mut self, value: Value) -> Expr {
        let module = self.module;
        let func = module.function(self.func);
        match value {
            Value::Const(c) => Expr::Const(c),
            Value::Global(_) | Value::Arg(_) | Value::Func(_) => self.unknown(value),
            Value::Instr(id) => match func.instr(id).kind.clone() {
                InstrKind::BinOp { op, lhs, rhs } => {
                    let l = self.expr(lhs);
                    let r = self.expr(rhs);
                    match op {
                        BinOp::Add => self.add(vec![l, r]),
                        BinOp::Sub => {
                            let neg = self.mul(vec![Expr::Const(-1), r]);
                            self.add(vec![l, neg])
                        }
                        BinOp::Mul => self.mul(vec![l, r]),
                        BinOp::Shl => match r.const_value() {
                            Some(shift) if (0..63).contains(&shift) => {
                                self.mul(vec![Expr::Const(1i64 << shift), l])
                            }
                            _ => self.unknown(value),
                        },
                        _ => self.unknown(value),
                    }
                }
                InstrKind::Cast { op, value: inner } => match op {
                    CastOp::SExt => Expr::SExt(Box::new(self.expr(inner))),
                    CastOp::ZExt => Expr::ZExt(Box::new(self.expr(inner))),
                    CastOp::Bitcast => self.expr(inner),
                    CastOp::Trunc => self.unknown(value),
                },
                InstrKind::Gep {
                    base,
                    index,
                    elem_size,
                } => {
                    let base_expr = self.expr(base);
                    let idx = self.expr(index);
                    let scaled = self.mul(vec![Expr::Const(elem_size as i64), idx]);
                    self.add(vec![base_expr, scaled])
                }
                InstrKind::Phi { ref incoming } => self.translate_phi(id, incoming),
                _ => self.unknown(value),
            },
        }
    }

    /// Recognize a loop-header phi as an add recurrence.
    fn translate_phi(&mut self, id: InstrId, incoming: &[(BlockId, Value)]) -> Expr {
        let module = self.module;
        let func = module.function(self.func);
        let value = Value::Instr(id);

        if self.in_progress.contains(&id) {
            return self.unknown(value);
        }

        let header = func.block_of(id);
        let Some(l) = self.loop_by_header(header) else {
            return self.unknown(value);
        };
        let [a, b] = incoming else {
            return self.unknown(value);
        };

        // one incoming edge from inside the loop (latch), one from outside
        let (start_val, latch_val) = if l.contains(a.0) && !l.contains(b.0) {
            (b.1, a.1)
        } else if l.contains(b.0) && !l.contains(a.0) {
            (a.1, b.1)
        } else {
            return self.unknown(value);
        };

        // the latch value must be phi +/- step
        let stripped = module.strip_casts(self.func, latch_val);
        let Value::Instr(latch_id) = stripped else {
            return self.unknown(value);
        };
        let step_val = match func.instr(latch_id).kind.clone() {
            InstrKind::BinOp {
                op: BinOp::Add,
                lhs,
                rhs,
            } if lhs == value => Some((rhs, false)),
            InstrKind::BinOp {
                op: BinOp::Add,
                lhs,
                rhs,
            } if rhs == value => Some((lhs, false)),
            InstrKind::BinOp {
                op: BinOp::Sub,
                lhs,
                rhs,
            } if lhs == value => Some((rhs, true)),
            _ => None,
        };
        let Some((step_val, negate)) = step_val else {
            return self.unknown(value);
        };

        self.in_progress.push(id);
        let start = self.expr(start_val);
        let mut step = self.expr(step_val);
        if negate {
            step = self.mul(vec![Expr::Const(-1), step]);
        }
        self.in_progress.pop();

        Expr::AddRec {
            start: Box::new(start),
            step: Box::new(step),
            header,
        }
    }

    // ---- affine algebra --------------------------------------------------

    /// Normalized sum: constants folded, like terms combined by coefficient,
    /// recurrences on the same loop merged, remaining recurrences nested
    /// innermost-outermost with invariants folded into starts.
    pub fn add(&mut self, terms: Vec<Expr>) -> Expr {
        let mut constant = 0i64;
        let mut linear: Vec<(i64, Expr)> = Vec::new();
        let mut recs: Vec<(Expr, Expr, BlockId)> = Vec::new();

        let mut worklist = terms;
        while let Some(term) = worklist.pop() {
            match term {
                Expr::Const(c) => constant = constant.wrapping_add(c),
                Expr::Add(inner) => worklist.extend(inner),
                Expr::AddRec {
                    start,
                    step,
                    header,
                } => recs.push((*start, *step, header)),
                other => {
                    let (coeff, core) = split_coefficient(other);
                    if let Some(entry) = linear.iter_mut().find(|(_, t)| *t == core) {
                        entry.0 += coeff;
                    } else {
                        linear.push((coeff, core));
                    }
                }
            }
        }

        linear.retain(|(coeff, _)| *coeff != 0);
        linear.sort_by(|(_, a), (_, b)| a.cmp(b));

        let mut flat: Vec<Expr> = Vec::new();
        if constant != 0 {
            flat.push(Expr::Const(constant));
        }
        for (coeff, core) in linear {
            if coeff == 1 {
                flat.push(core);
            } else {
                flat.push(self.mul(vec![Expr::Const(coeff), core]));
            }
        }

        // merge recurrences over the same loop
        let mut merged: Vec<(Expr, Expr, BlockId)> = Vec::new();
        for (start, step, header) in recs {
            if let Some(existing) = merged.iter_mut().find(|(_, _, h)| *h == header) {
                existing.0 = self.add(vec![existing.0.clone(), start]);
                existing.1 = self.add(vec![existing.1.clone(), step]);
            } else {
                merged.push((start, step, header));
            }
        }

        if merged.is_empty() {
            return match flat.len() {
                0 => Expr::Const(0),
                1 => flat.pop().expect("len checked"),
                _ => Expr::Add(flat),
            };
        }

        // outer loops first, then wrap: invariants live in the start of the
        // innermost recurrence, which ends up outermost in the tree
        merged.sort_by_key(|(_, _, header)| (self.loop_depth(*header), *header));
        let mut result = match flat.len() {
            0 => Expr::Const(0),
            1 => flat.pop().expect("len checked"),
            _ => Expr::Add(flat),
        };
        for (start, step, header) in merged {
            let step = self.simplify_shallow(step);
            // a recurrence that no longer moves is just its start
            if step.const_value() == Some(0) {
                result = self.add(vec![result, start]);
                continue;
            }
            let folded_start = self.add(vec![result, start]);
            result = Expr::AddRec {
                start: Box::new(folded_start),
                step: Box::new(step),
                header,
            };
        }
        result
    }

    /// Normalized product: constants folded and distributed over sums and
    /// recurrence starts/steps; everything else stays opaque.
    pub fn mul(&mut self, factors: Vec<Expr>) -> Expr {
        let mut constant = 1i64;
        let mut rest: Vec<Expr> = Vec::new();

        let mut worklist = factors;
        while let Some(factor) = worklist.pop() {
            match factor {
                Expr::Const(c) => constant = constant.wrapping_mul(c),
                Expr::Mul(inner) => worklist.extend(inner),
                other => rest.push(other),
            }
        }

        if constant == 0 {
            return Expr::Const(0);
        }

        if rest.is_empty() {
            return Expr::Const(constant);
        }

        // distribute a constant over a single sum or recurrence
        if rest.len() == 1 && constant != 1 {
            match rest.pop().expect("len checked") {
                Expr::Add(terms) => {
                    let scaled = terms
                        .into_iter()
                        .map(|t| self.mul(vec![Expr::Const(constant), t]))
                        .collect();
                    return self.add(scaled);
                }
                Expr::AddRec {
                    start,
                    step,
                    header,
                } => {
                    let start = self.mul(vec![Expr::Const(constant), *start]);
                    let step = self.mul(vec![Expr::Const(constant), *step]);
                    return Expr::AddRec {
                        start: Box::new(start),
                        step: Box::new(step),
                        header,
                    };
                }
                other => rest.push(other),
            }
        }

        rest.sort();
        if constant != 1 {
            rest.insert(0, Expr::Const(constant));
        }
        if rest.len() == 1 {
            return rest.pop().expect("len checked");
        }
        Expr::Mul(rest)
    }

    fn simplify_shallow(&mut self, e: Expr) -> Expr {
        match e {
            Expr::Add(terms) => self.add(terms),
            Expr::Mul(factors) => self.mul(factors),
            other => other,
        }
    }

    /// `a - b`, normalized.
    pub fn minus(&mut self, a: &Expr, b: &Expr) -> Expr {
        let neg = self.mul(vec![Expr::Const(-1), b.clone()]);
        self.add(vec![a.clone(), neg])
    }

    /// Commute sign/zero extensions inward so casts stop blocking equality:
    /// `sext(2*x + 1)` becomes `2*sext(x) + 1`. Applied to fixpoint.
    pub fn push_casts(&mut self, e: &Expr) -> Expr {
        match e {
            Expr::SExt(inner) | Expr::ZExt(inner) => {
                let signed = matches!(e, Expr::SExt(_));
                let pushed = self.push_casts(inner);
                self.push_cast_into(pushed, signed)
            }
            Expr::Add(terms) => {
                let terms = terms.iter().map(|t| self.push_casts(t)).collect();
                self.add(terms)
            }
            Expr::Mul(factors) => {
                let factors = factors.iter().map(|f| self.push_casts(f)).collect();
                self.mul(factors)
            }
            Expr::AddRec {
                start,
                step,
                header,
            } => {
                let start = self.push_casts(start);
                let step = self.push_casts(step);
                let header = *header;
                self.add(vec![Expr::AddRec {
                    start: Box::new(start),
                    step: Box::new(step),
                    header,
                }])
            }
            Expr::Const(_) | Expr::Unknown(_) => e.clone(),
        }
    }

    fn push_cast_into(&mut self, e: Expr, signed: bool) -> Expr {
        let wrap = |inner: Expr| {
            if signed {
                Expr::SExt(Box::new(inner))
            } else {
                Expr::ZExt(Box::new(inner))
            }
        };
        match e {
            // widening preserves constants (zext only for non-negatives)
            Expr::Const(c) if signed || c >= 0 => Expr::Const(c),
            Expr::Add(terms) => {
                let terms = terms
                    .into_iter()
                    .map(|t| self.push_cast_into(t, signed))
                    .collect();
                self.add(terms)
            }
            Expr::Mul(factors) => {
                let factors = factors
                    .into_iter()
                    .map(|f| self.push_cast_into(f, signed))
                    .collect();
                self.mul(factors)
            }
            Expr::AddRec {
                start,
                step,
                header,
            } => {
                let start = self.push_cast_into(*start, signed);
                let step = self.push_cast_into(*step, signed);
                Expr::AddRec {
                    start: Box::new(start),
                    step: Box::new(step),
                    header,
                }
            }
            other => wrap(other),
        }
    }

    // ---- loop bounds -----------------------------------------------------

    /// Constant backedge-taken count of a loop, from a latch compare of an
    /// affine recurrence against a constant.
    pub fn backedge_count(&mut self, header: BlockId) -> Option<i64> {
        let module = self.module;
        let l = self.loop_by_header(header)?;
        let latch = l.latch;
        let func = module.function(self.func);
        let &term = func.block(latch).instrs.last()?;
        let InstrKind::Branch {
            cond: Some(cond),
            then_blk,
            else_blk,
        } = func.instr(term).kind.clone()
        else {
            return None;
        };
        let Value::Instr(cmp_id) = module.strip_casts(self.func, cond) else {
            return None;
        };
        let InstrKind::Cmp { pred, lhs, rhs } = func.instr(cmp_id).kind.clone() else {
            return None;
        };

        // orientation: does `true` take the backedge?
        let true_continues = if then_blk == header {
            true
        } else if else_blk == Some(header) {
            false
        } else {
            return None;
        };

        let le = self.expr(lhs);
        let re = self.expr(rhs);
        let (rec, bound, mut pred) = match (&le, re.const_value()) {
            (Expr::AddRec { .. }, Some(bound)) => (le.clone(), bound, pred),
            _ => match (le.const_value(), &re) {
                (Some(bound), Expr::AddRec { .. }) => (re.clone(), bound, flip_cmp(pred)),
                _ => return None,
            },
        };
        if !true_continues {
            pred = negate_cmp(pred)?;
        }

        let Expr::AddRec {
            start,
            step,
            header: rec_header,
        } = rec
        else {
            return None;
        };
        if rec_header != header {
            return None;
        }
        let start = start.const_value()?;
        let step = step.const_value()?;

        trip_count(start, step, bound, pred)
    }

    /// True if this natural loop is an OpenMP worksharing loop: a
    /// `for_static_init` call sits in (or directly above) its preheader.
    pub fn is_omp_for_loop(&self, header: BlockId) -> bool {
        self.omp_static_init_call(header).is_some()
    }

    fn omp_static_init_call(&self, header: BlockId) -> Option<InstrId> {
        let l = self.loop_by_header(header)?;
        let preheader = l.preheader?;
        if let Some(&call) = self.static_init_calls.get(&preheader) {
            return Some(call);
        }
        let preds = self.cfg.predecessors(preheader);
        if let [only] = preds {
            if let Some(&call) = self.static_init_calls.get(only) {
                return Some(call);
            }
        }
        None
    }

    /// The recurrence over an OpenMP worksharing loop inside `root`, if any.
    pub fn omp_loop_rec(&self, root: &Expr) -> Option<Expr> {
        root.find(&|e| {
            matches!(e, Expr::AddRec { header, .. } if self.is_omp_for_loop(*header))
        })
        .cloned()
    }

    /// Static lower/upper bounds of an OpenMP worksharing loop, resolved
    /// through the constant stores into the init call's bound allocas.
    pub fn omp_loop_bounds(&self, header: BlockId) -> (Option<i64>, Option<i64>) {
        let Some(call) = self.omp_static_init_call(header) else {
            return (None, None);
        };
        let func = self.module.function(self.func);
        let InstrKind::Call { args, .. } = &func.instr(call).kind else {
            return (None, None);
        };
        // __kmpc_for_static_init(loc, gtid, schedtype, plastiter, plower,
        // pupper, pstride, incr, chunk)
        let lower = args.get(4).and_then(|&v| self.resolve_bound_value(v, call));
        let upper = args.get(5).and_then(|&v| self.resolve_bound_value(v, call));
        (lower, upper)
    }

    /// A bound alloca resolves to a constant when exactly one store
    /// dominating the init call writes it, and that store writes a constant.
    fn resolve_bound_value(&self, bound_ptr: Value, init_call: InstrId) -> Option<i64> {
        let func = self.module.function(self.func);
        let Value::Instr(alloca) = self.module.strip_casts(self.func, bound_ptr) else {
            return None;
        };
        if !matches!(func.instr(alloca).kind, InstrKind::Alloca) {
            return None;
        }

        let mut dominating_store: Option<InstrId> = None;
        for user in func.users(Value::Instr(alloca)) {
            let InstrKind::Store { ptr, .. } = &func.instr(user).kind else {
                continue;
            };
            if *ptr != Value::Instr(alloca) {
                continue;
            }
            if self.cfg.instr_dominates(func, user, init_call) {
                if dominating_store.is_some() {
                    return None;
                }
                dominating_store = Some(user);
            }
        }

        let store = dominating_store?;
        let InstrKind::Store { value, .. } = func.instr(store).kind.clone() else {
            return None;
        };
        const_int(value)
    }

    /// The recurrence advanced by one iteration of its loop.
    pub fn next_iteration(&mut self, rec: &Expr) -> Option<Expr> {
        let Expr::AddRec {
            start,
            step,
            header,
        } = rec
        else {
            return None;
        };
        let next_start = self.add(vec![(**start).clone(), (**step).clone()]);
        Some(Expr::AddRec {
            start: Box::new(next_start),
            step: step.clone(),
            header: *header,
        })
    }

    /// Substitute the final value of every non-OpenMP recurrence whose
    /// backedge count is a known constant: `{s,+,t}<L>` becomes
    /// `s + count*t`. Projects an inner loop's full index range into one
    /// outer iteration.
    pub fn apply_inner_bounds(&mut self, e: &Expr, omp_header: BlockId) -> Expr {
        match e {
            Expr::AddRec {
                start,
                step,
                header,
            } => {
                let new_start = self.apply_inner_bounds(start, omp_header);
                let header = *header;
                let step = (**step).clone();
                if header == omp_header {
                    return Expr::AddRec {
                        start: Box::new(new_start),
                        step: Box::new(step),
                        header,
                    };
                }
                match self.backedge_count(header) {
                    Some(count) => {
                        let span = self.mul(vec![Expr::Const(count), step]);
                        self.add(vec![new_start, span])
                    }
                    None => Expr::AddRec {
                        start: Box::new(new_start),
                        step: Box::new(step),
                        header,
                    },
                }
            }
            Expr::Add(terms) => {
                let terms = terms
                    .iter()
                    .map(|t| self.apply_inner_bounds(t, omp_header))
                    .collect();
                self.add(terms)
            }
            Expr::Mul(factors) => {
                let factors = factors
                    .iter()
                    .map(|f| self.apply_inner_bounds(f, omp_header))
                    .collect();
                self.mul(factors)
            }
            Expr::SExt(inner) => {
                let inner = self.apply_inner_bounds(inner, omp_header);
                Expr::SExt(Box::new(inner))
            }
            Expr::ZExt(inner) => {
                let inner = self.apply_inner_bounds(inner, omp_header);
                Expr::ZExt(Box::new(inner))
            }
            Expr::Const(_) | Expr::Unknown(_) => e.clone(),
        }
    }
}

fn const_int(value: Value) -> Option<i64> {
    match value {
        Value::Const(c) => Some(c),
        _ => None,
    }
}

/// Pull a leading constant coefficient out of a product.
fn split_coefficient(e: Expr) -> (i64, Expr) {
    if let Expr::Mul(factors) = &e {
        let mut coeff = 1i64;
        let mut rest: Vec<Expr> = Vec::new();
        for f in factors {
            match f {
                Expr::Const(c) => coeff = coeff.wrapping_mul(*c),
                other => rest.push(other.clone()),
            }
        }
        if coeff != 1 {
            let core = match rest.len() {
                0 => Expr::Const(1),
                1 => rest.pop().expect("len checked"),
                _ => Expr::Mul(rest),
            };
            return (coeff, core);
        }
    }
    (1, e)
}

fn flip_cmp(pred: CmpPred) -> CmpPred {
    match pred {
        CmpPred::Slt => CmpPred::Sgt,
        CmpPred::Sle => CmpPred::Sge,
        CmpPred::Sgt => CmpPred::Slt,
        CmpPred::Sge => CmpPred::Sle,
        CmpPred::Eq | CmpPred::Ne => pred,
    }
}

fn negate_cmp(pred: CmpPred) -> Option<CmpPred> {
    Some(match pred {
        CmpPred::Slt => CmpPred::Sge,
        CmpPred::Sle => CmpPred::Sgt,
        CmpPred::Sgt => CmpPred::Sle,
        CmpPred::Sge => CmpPred::Slt,
        CmpPred::Eq => CmpPred::Ne,
        CmpPred::Ne => CmpPred::Eq,
    })
}

/// Number of `n >= 0` with `pred(start + n*step, bound)` true, for a
/// monotone recurrence. `None` when the count is unbounded or the shape is
/// not monotone toward the bound.
fn trip_count(start: i64, step: i64, bound: i64, pred: CmpPred) -> Option<i64> {
    if step == 0 {
        return None;
    }
    let (start, step, bound) = (start as i128, step as i128, bound as i128);
    let count = match pred {
        CmpPred::Slt if step > 0 => div_ceil(bound - start, step),
        CmpPred::Sle if step > 0 => div_floor(bound - start, step) + 1,
        CmpPred::Sgt if step < 0 => div_ceil(start - bound, -step),
        CmpPred::Sge if step < 0 => div_floor(start - bound, -step) + 1,
        CmpPred::Ne => {
            let gap = bound - start;
            if gap % step != 0 || gap / step < 0 {
                return None;
            }
            gap / step
        }
        _ => return None,
    };
    let count = count.max(0);
    i64::try_from(count).ok()
}

// both helpers assume b > 0, which every call site guarantees
fn div_ceil(a: i128, b: i128) -> i128 {
    (a + b - 1).div_euclid(b)
}

fn div_floor(a: i128, b: i128) -> i128 {
    a.div_euclid(b)
}
