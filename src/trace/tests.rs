//! Trace construction tests over small hand-built modules.

use crate::ir::build::{FuncBuilder, ModuleBuilder};
use crate::ir::summary::{ForkKind, MarkerKind};
use crate::ir::{Module, Value};
use crate::trace::event::{EventKind, ThreadId};
use crate::trace::program::ProgramTrace;

/// `main` spawning two pthread workers running `worker`, which writes the
/// global, then joining both.
fn two_pthread_writers() -> Module {
    let mut m = ModuleBuilder::new();
    let x = m.global("x");

    let mut worker = FuncBuilder::new("worker", 1);
    worker.loc("main.c", 5, 3);
    worker.store(Value::Global(x), Value::Const(1));
    worker.ret();
    let worker_id = m.define(worker.finish());

    let mut main = FuncBuilder::new("main", 0);
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
    let t1val = main.load(t1);
    main.call("pthread_join", vec![t1val, Value::Const(0)]);
    let t2val = main.load(t2);
    main.call("pthread_join", vec![t2val, Value::Const(0)]);
    main.ret();
    m.define(main.finish());

    m.finish()
}

#[test]
fn test_pthread_fork_join_matching() {
    let module = two_pthread_writers();
    let trace = ProgramTrace::build(&module, "main").unwrap();

    assert_eq!(trace.threads().len(), 3);
    let main = trace.main_thread();
    assert_eq!(main.children, vec![ThreadId(1), ThreadId(2)]);

    let joins: Vec<_> = main
        .events
        .iter()
        .filter_map(|e| match e.kind {
            EventKind::Join { joined, .. } => Some(joined),
            _ => None,
        })
        .collect();
    assert_eq!(joins, vec![Some(ThreadId(1)), Some(ThreadId(2))]);

    // Child threads carry their spawn site and a write event.
    let child = trace.thread(ThreadId(1));
    assert_eq!(child.spawn.unwrap().thread, ThreadId(0));
    assert!(child.events.iter().any(|e| e.is_write()));
}

#[test]
fn test_event_ids_are_contiguous_program_order() {
    let module = two_pthread_writers();
    let trace = ProgramTrace::build(&module, "main").unwrap();
    for thread in trace.threads() {
        for (i, event) in thread.events.iter().enumerate() {
            assert_eq!(event.id, i);
        }
    }
}

/// Duplicated omp fork pair: both sides spawn threads running the outlined
/// body, and both are joined immediately (implicit join).
fn omp_parallel(body: impl FnOnce(&mut FuncBuilder)) -> Module {
    let mut m = ModuleBuilder::new();
    m.global("g");

    let mut outlined = FuncBuilder::new("main.omp_outlined", 2);
    body(&mut outlined);
    outlined.ret();
    let outlined_id = m.define(outlined.finish());

    let mut main = FuncBuilder::new("main", 0);
    main.call("__kmpc_fork_call", vec![Value::Const(0), Value::Func(outlined_id)]);
    main.call("__kmpc_fork_call", vec![Value::Const(0), Value::Func(outlined_id)]);
    main.ret();
    m.define(main.finish());

    m.finish()
}

#[test]
fn test_omp_fork_creates_master_and_worker() {
    let module = omp_parallel(|f| {
        f.store(Value::Global(crate::ir::GlobalId(0)), Value::Const(1));
    });
    let trace = ProgramTrace::build(&module, "main").unwrap();

    assert_eq!(trace.threads().len(), 3);
    let master = trace.thread(ThreadId(1));
    let worker = trace.thread(ThreadId(2));
    assert!(master.is_omp_master());
    assert!(worker.is_omp_thread() && !worker.is_omp_master());

    // The two fork events on main are id-adjacent, followed by two joins.
    let main = trace.main_thread();
    assert!(matches!(
        main.events[0].kind,
        EventKind::Fork { kind: ForkKind::OmpParallel { master: true }, .. }
    ));
    assert!(matches!(
        main.events[1].kind,
        EventKind::Fork { kind: ForkKind::OmpParallel { master: false }, .. }
    ));
    assert!(matches!(main.events[2].kind, EventKind::Join { omp: true, .. }));
    assert!(matches!(main.events[3].kind, EventKind::Join { omp: true, .. }));
}

#[test]
fn test_master_region_skipped_on_worker() {
    let module = omp_parallel(|f| {
        f.call("__kmpc_master", vec![Value::Const(0)]);
        f.store(Value::Global(crate::ir::GlobalId(0)), Value::Const(1));
        f.call("__kmpc_end_master", vec![Value::Const(0)]);
    });
    let trace = ProgramTrace::build(&module, "main").unwrap();

    let master = trace.thread(ThreadId(1));
    assert!(master.events.iter().any(|e| e.is_write()));

    // Worker resumes at the region end marker; the body never appears.
    let worker = trace.thread(ThreadId(2));
    assert!(!worker.events.iter().any(|e| e.is_write()));
    assert_eq!(worker.events[0].marker(), Some(MarkerKind::MasterEnd));
}

#[test]
fn test_single_region_traced_on_both_threads() {
    let module = omp_parallel(|f| {
        f.call("__kmpc_single", vec![Value::Const(0)]);
        f.store(Value::Global(crate::ir::GlobalId(0)), Value::Const(1));
        f.call("__kmpc_end_single", vec![Value::Const(0)]);
    });
    let trace = ProgramTrace::build(&module, "main").unwrap();

    // Unlike master, single bodies land on every thread; exclusivity is an
    // analysis-phase decision.
    for tid in [ThreadId(1), ThreadId(2)] {
        assert!(trace.thread(tid).events.iter().any(|e| e.is_write()));
    }
}

fn omp_parallel_with_task(single: bool) -> Module {
    let mut m = ModuleBuilder::new();
    m.global("g");

    let mut task = FuncBuilder::new("task_body", 1);
    task.store(Value::Global(crate::ir::GlobalId(0)), Value::Const(1));
    task.ret();
    let task_id = m.define(task.finish());

    let mut outlined = FuncBuilder::new("main.omp_outlined", 2);
    if single {
        outlined.call("__kmpc_single", vec![Value::Const(0)]);
    }
    outlined.call("__kmpc_omp_task", vec![Value::Const(0), Value::Func(task_id)]);
    if single {
        outlined.call("__kmpc_end_single", vec![Value::Const(0)]);
    }
    outlined.call("__kmpc_barrier", vec![Value::Const(0)]);
    outlined.ret();
    let outlined_id = m.define(outlined.finish());

    let mut main = FuncBuilder::new("main", 0);
    main.call("__kmpc_fork_call", vec![Value::Const(0), Value::Func(outlined_id)]);
    main.call("__kmpc_fork_call", vec![Value::Const(0), Value::Func(outlined_id)]);
    main.ret();
    m.define(main.finish());

    m.finish()
}

#[test]
fn test_unjoined_tasks_join_at_barrier() {
    let module = omp_parallel_with_task(false);
    let trace = ProgramTrace::build(&module, "main").unwrap();

    let master = trace.thread(ThreadId(1));
    let kinds: Vec<&EventKind> = master.events.iter().map(|e| &e.kind).collect();

    let fork_pos = kinds
        .iter()
        .position(|k| matches!(k, EventKind::Fork { kind: ForkKind::OmpTask, .. }))
        .unwrap();
    let join_pos = kinds
        .iter()
        .position(|k| matches!(k, EventKind::Join { omp: true, .. }))
        .unwrap();
    let barrier_pos = kinds
        .iter()
        .position(|k| matches!(k, EventKind::Barrier { omp: true }))
        .unwrap();
    assert!(fork_pos < join_pos && join_pos < barrier_pos);
}

#[test]
fn test_tasks_in_single_created_on_master_only() {
    let module = omp_parallel_with_task(true);
    let trace = ProgramTrace::build(&module, "main").unwrap();

    let task_forks = |tid| {
        trace
            .thread(tid)
            .events
            .iter()
            .filter(|e| matches!(e.kind, EventKind::Fork { kind: ForkKind::OmpTask, .. }))
            .count()
    };
    assert_eq!(task_forks(ThreadId(1)), 1);
    // worker thread id shifts by the task thread spawned from master
    let worker = trace
        .threads()
        .iter()
        .find(|t| t.is_omp_thread() && !t.is_omp_master())
        .unwrap();
    assert_eq!(task_forks(worker.id), 0);
}

#[test]
fn test_teams_region_suppresses_team_local_sync() {
    let mut m = ModuleBuilder::new();
    m.global("g");

    let mut outlined = FuncBuilder::new("main.omp_outlined", 2);
    outlined.call("__kmpc_barrier", vec![Value::Const(0)]);
    outlined.store(Value::Global(crate::ir::GlobalId(0)), Value::Const(1));
    outlined.ret();
    let outlined_id = m.define(outlined.finish());

    let mut main = FuncBuilder::new("main", 0);
    main.call("__kmpc_fork_teams", vec![Value::Const(0), Value::Func(outlined_id)]);
    main.call("__kmpc_fork_teams", vec![Value::Const(0), Value::Func(outlined_id)]);
    main.ret();
    m.define(main.finish());
    let module = m.finish();

    let trace = ProgramTrace::build(&module, "main").unwrap();
    for thread in trace.threads().iter().filter(|t| t.spawn.is_some()) {
        assert!(
            !thread
                .events
                .iter()
                .any(|e| matches!(e.kind, EventKind::Barrier { .. })),
            "barrier must be suppressed inside a teams region"
        );
        assert!(thread.events.iter().any(|e| e.is_write()));
    }
}

#[test]
fn test_recursive_call_graph_terminates() {
    let mut m = ModuleBuilder::new();
    m.global("g");

    let mut f = FuncBuilder::new("f", 0);
    f.store(Value::Global(crate::ir::GlobalId(0)), Value::Const(1));
    f.call("f", vec![]);
    f.ret();
    m.define(f.finish());

    let mut main = FuncBuilder::new("main", 0);
    main.call("f", vec![]);
    main.ret();
    m.define(main.finish());
    let module = m.finish();

    let trace = ProgramTrace::build(&module, "main").unwrap();
    let main_events = &trace.main_thread().events;
    // One enter/leave pair and one write; the recursive frame adds nothing.
    assert_eq!(
        main_events
            .iter()
            .filter(|e| matches!(e.kind, EventKind::EnterCall { .. }))
            .count(),
        1
    );
    assert_eq!(main_events.iter().filter(|e| e.is_write()).count(), 1);
}

#[test]
fn test_missing_entry_is_error() {
    let module = two_pthread_writers();
    let err = ProgramTrace::build(&module, "not_main").unwrap_err();
    assert!(matches!(err, crate::trace::TraceError::MissingEntry(_)));
}

#[test]
fn test_extern_call_produces_extern_event() {
    let mut m = ModuleBuilder::new();
    m.declare("compute", 1);
    let mut main = FuncBuilder::new("main", 0);
    main.call("compute", vec![Value::Const(3)]);
    main.ret();
    m.define(main.finish());
    let module = m.finish();

    let trace = ProgramTrace::build(&module, "main").unwrap();
    assert!(matches!(
        trace.main_thread().events[0].kind,
        EventKind::ExternCall
    ));
}

#[test]
fn test_trace_display_lists_threads() {
    let module = two_pthread_writers();
    let trace = ProgramTrace::build(&module, "main").unwrap();
    let dump = trace.to_string();
    assert!(dump.contains("---Thread0"));
    assert!(dump.contains("(Spawned by T0:"));
    assert!(dump.contains("WRIT"));
}
