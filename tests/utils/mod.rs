//! Shared module builders for the end-to-end detection tests.
//!
//! Each helper assembles the normalized IR a front end would produce for
//! the corresponding C source shape.
#![allow(dead_code)]

use carrera::ir::build::{FuncBuilder, ModuleBuilder};
use carrera::ir::{BinOp, CmpPred, InstrKind, Module, Value};

/// ```c
/// int counter;
/// void *worker(void *arg) {
///     pthread_mutex_lock(&m);   // when locked
///     counter = 1;              // simple.c:5:3
///     pthread_mutex_unlock(&m);
/// }
/// int main() {
///     pthread_create(&t1, 0, worker, 0);
///     pthread_create(&t2, 0, worker, 0);
///     pthread_join(t1, 0);
///     pthread_join(t2, 0);
/// }
/// ```
pub fn pthread_two_writers(locked: bool) -> Module {
    let mut m = ModuleBuilder::new();
    let counter = m.global("counter");
    let mutex = m.global("m");

    let mut worker = FuncBuilder::new("worker", 1);
    if locked {
        worker.loc("simple.c", 4, 3);
        worker.call("pthread_mutex_lock", vec![Value::Global(mutex)]);
    }
    worker.loc("simple.c", 5, 3);
    worker.store(Value::Global(counter), Value::Const(1));
    if locked {
        worker.loc("simple.c", 6, 3);
        worker.call("pthread_mutex_unlock", vec![Value::Global(mutex)]);
    }
    worker.ret();
    let worker_id = m.define(worker.finish());

    let mut main = FuncBuilder::new("main", 0);
    main.loc("simple.c", 10, 3);
    let t1 = main.alloca();
    let t2 = main.alloca();
    main.call(
        "pthread_create",
        vec![t1, Value::Const(0), Value::Func(worker_id), Value::Const(0)],
    );
    main.call(
        "pthread_create",
        vec![t2, Value::Const(0), Value::Func(worker_id), Value::Const(0)],
    );
    let t1v = main.load(t1);
    main.call("pthread_join", vec![t1v, Value::Const(0)]);
    let t2v = main.load(t2);
    main.call("pthread_join", vec![t2v, Value::Const(0)]);
    main.ret();
    m.define(main.finish());

    m.finish()
}

/// ```c
/// #pragma omp parallel for
/// for (int i = 0; i < 100; i += stride)
///     A[i] = A[i + read_offset] + 1;   // write loop.c:8:5, read loop.c:8:12
/// ```
/// With `read_offset == None` the body is just `A[i] = i` (no read).
pub fn omp_parallel_for(read_offset: Option<i64>, stride: i64) -> Module {
    let mut m = ModuleBuilder::new();
    let a = m.global("A");

    let mut f = FuncBuilder::new("main.omp_outlined", 2);
    let preheader = f.new_block();
    let body = f.new_block();
    let fini = f.new_block();

    // worksharing init sits above the loop preheader
    f.loc("loop.c", 7, 3);
    f.call(
        "__kmpc_for_static_init_4",
        vec![
            Value::Const(0),
            Value::Const(0),
            Value::Const(34),
            Value::Const(0),
            Value::Const(0),
            Value::Const(0),
        ],
    );
    f.br(preheader);
    f.switch_to(preheader);
    f.br(body);

    f.switch_to(body);
    let iv = f.phi(vec![(preheader, Value::Const(0))]);
    if let Some(offset) = read_offset {
        f.loc("loop.c", 8, 12);
        let shifted = f.binop(BinOp::Add, iv, Value::Const(offset));
        let read_slot = f.gep_scaled(Value::Global(a), shifted, 4);
        f.load(read_slot);
    }
    f.loc("loop.c", 8, 5);
    let write_slot = f.gep_scaled(Value::Global(a), iv, 4);
    f.store(write_slot, Value::Const(0));
    let inc = f.binop(BinOp::Add, iv, Value::Const(stride));
    let cmp = f.cmp(CmpPred::Slt, inc, Value::Const(100));
    f.br_cond(cmp, body, fini);

    f.switch_to(fini);
    f.loc("loop.c", 9, 3);
    f.call("__kmpc_for_static_fini", vec![Value::Const(0)]);
    f.ret();

    let mut func = f.finish();
    // wire the phi's latch edge
    let Value::Instr(phi_id) = iv else { unreachable!() };
    if let InstrKind::Phi { incoming } = &mut func.instrs[phi_id.0 as usize].kind {
        incoming.push((body, inc));
    }
    let outlined = m.define(func);

    let mut main = FuncBuilder::new("main", 0);
    main.loc("loop.c", 6, 1);
    main.call("__kmpc_fork_call", vec![Value::Const(0), Value::Func(outlined)]);
    main.call("__kmpc_fork_call", vec![Value::Const(0), Value::Func(outlined)]);
    main.ret();
    m.define(main.finish());

    m.finish()
}

/// ```c
/// #pragma omp parallel
/// {
///     #pragma omp single [nowait]
///     counter++;               // single.c:11:9
///     #pragma omp single [nowait]
///     counter++;               // single.c:15:9
/// }
/// ```
pub fn two_singles(nowait: bool) -> Module {
    let mut m = ModuleBuilder::new();
    let counter = m.global("counter");

    let mut f = FuncBuilder::new("main.omp_outlined", 2);
    for (line, idx) in [(11u32, 1i64), (15, 2)] {
        f.loc("single.c", line, 5);
        f.call("__kmpc_single", vec![Value::Const(0)]);
        f.loc("single.c", line, 9);
        let loaded = f.load(Value::Global(counter));
        let bumped = f.binop(BinOp::Add, loaded, Value::Const(idx));
        f.store(Value::Global(counter), bumped);
        f.loc("single.c", line + 1, 5);
        f.call("__kmpc_end_single", vec![Value::Const(0)]);
        if !nowait {
            f.call("__kmpc_barrier", vec![Value::Const(0)]);
        }
    }
    f.ret();
    let outlined = m.define(f.finish());

    let mut main = FuncBuilder::new("main", 0);
    main.loc("single.c", 8, 1);
    main.call("__kmpc_fork_call", vec![Value::Const(0), Value::Func(outlined)]);
    main.call("__kmpc_fork_call", vec![Value::Const(0), Value::Func(outlined)]);
    main.ret();
    m.define(main.finish());

    m.finish()
}
