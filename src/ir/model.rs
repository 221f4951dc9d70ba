//! Name tables for the pthread and OpenMP runtime entry points the
//! summarizer recognizes.
//!
//! Lowering is driven entirely by called-function names, matching what the
//! clang/LLVM pipeline emits for `-fopenmp` and pthreads. A function whose
//! name marks it as OpenMP runtime but that is matched by none of the
//! recognizers below is an unmodeled primitive and must abort trace
//! construction (see `TraceError::UnmodeledOpenMp`).

/// pthread runtime recognizers.
pub mod pthread {
    pub fn is_create(name: &str) -> bool {
        name == "pthread_create"
    }

    pub fn is_join(name: &str) -> bool {
        name == "pthread_join"
    }

    pub fn is_mutex_lock(name: &str) -> bool {
        name == "pthread_mutex_lock"
    }

    pub fn is_mutex_unlock(name: &str) -> bool {
        name == "pthread_mutex_unlock"
    }

    pub fn is_spin_lock(name: &str) -> bool {
        name == "pthread_spin_lock"
    }

    pub fn is_spin_unlock(name: &str) -> bool {
        name == "pthread_spin_unlock"
    }

    pub fn is_barrier_wait(name: &str) -> bool {
        name == "pthread_barrier_wait"
    }

    /// pthread calls with no effect on the trace (init/destroy/attr noise).
    pub fn is_no_effect(name: &str) -> bool {
        matches!(
            name,
            "pthread_mutex_init"
                | "pthread_mutex_destroy"
                | "pthread_spin_init"
                | "pthread_spin_destroy"
                | "pthread_barrier_init"
                | "pthread_barrier_destroy"
                | "pthread_attr_init"
                | "pthread_attr_destroy"
                | "pthread_exit"
                | "pthread_self"
        )
    }
}

/// OpenMP (kmpc/omp) runtime recognizers.
pub mod openmp {
    /// Any name belonging to the OpenMP runtime surface. Used for the
    /// unmodeled-primitive hard error, so it must be a superset of every
    /// recognizer below.
    pub fn is_openmp(name: &str) -> bool {
        name.starts_with("__kmpc_") || name.starts_with("omp_")
    }

    pub fn is_fork(name: &str) -> bool {
        name == "__kmpc_fork_call"
    }

    pub fn is_fork_teams(name: &str) -> bool {
        name == "__kmpc_fork_teams"
    }

    pub fn is_for_static_init(name: &str) -> bool {
        name.starts_with("__kmpc_for_static_init")
    }

    pub fn is_for_static_fini(name: &str) -> bool {
        name == "__kmpc_for_static_fini"
    }

    pub fn is_dispatch_init(name: &str) -> bool {
        name.starts_with("__kmpc_dispatch_init")
    }

    pub fn is_dispatch_next(name: &str) -> bool {
        name.starts_with("__kmpc_dispatch_next")
    }

    pub fn is_dispatch_fini(name: &str) -> bool {
        name.starts_with("__kmpc_dispatch_fini")
    }

    pub fn is_single_start(name: &str) -> bool {
        name == "__kmpc_single"
    }

    pub fn is_single_end(name: &str) -> bool {
        name == "__kmpc_end_single"
    }

    pub fn is_master_start(name: &str) -> bool {
        name == "__kmpc_master"
    }

    pub fn is_master_end(name: &str) -> bool {
        name == "__kmpc_end_master"
    }

    pub fn is_barrier(name: &str) -> bool {
        name == "__kmpc_barrier"
    }

    pub fn is_reduce_start(name: &str) -> bool {
        name == "__kmpc_reduce"
    }

    pub fn is_reduce_end(name: &str) -> bool {
        name == "__kmpc_end_reduce"
    }

    pub fn is_reduce_nowait_start(name: &str) -> bool {
        name == "__kmpc_reduce_nowait"
    }

    pub fn is_reduce_nowait_end(name: &str) -> bool {
        name == "__kmpc_end_reduce_nowait"
    }

    pub fn is_critical_start(name: &str) -> bool {
        name == "__kmpc_critical"
    }

    pub fn is_critical_end(name: &str) -> bool {
        name == "__kmpc_end_critical"
    }

    pub fn is_sections_start(name: &str) -> bool {
        name == "__kmpc_sections"
    }

    pub fn is_sections_end(name: &str) -> bool {
        name == "__kmpc_end_sections"
    }

    pub fn is_set_lock(name: &str) -> bool {
        name == "omp_set_lock"
    }

    pub fn is_unset_lock(name: &str) -> bool {
        name == "omp_unset_lock"
    }

    pub fn is_set_nest_lock(name: &str) -> bool {
        name == "omp_set_nest_lock"
    }

    pub fn is_unset_nest_lock(name: &str) -> bool {
        name == "omp_unset_nest_lock"
    }

    pub fn is_task(name: &str) -> bool {
        name == "__kmpc_omp_task"
    }

    pub fn is_task_wait(name: &str) -> bool {
        name == "__kmpc_omp_taskwait"
    }

    pub fn is_get_thread_num(name: &str) -> bool {
        name == "omp_get_thread_num"
    }

    pub fn is_ordered_start(name: &str) -> bool {
        name == "__kmpc_ordered"
    }

    pub fn is_ordered_end(name: &str) -> bool {
        name == "__kmpc_end_ordered"
    }

    /// OpenMP calls that are sound to ignore.
    pub fn is_no_effect(name: &str) -> bool {
        matches!(
            name,
            "__kmpc_global_thread_num"
                | "__kmpc_push_num_threads"
                | "__kmpc_serialized_parallel"
                | "__kmpc_end_serialized_parallel"
                | "__kmpc_omp_task_alloc"
                | "__kmpc_omp_task_begin_if0"
                | "__kmpc_omp_task_complete_if0"
                | "omp_init_lock"
                | "omp_destroy_lock"
                | "omp_init_nest_lock"
                | "omp_destroy_nest_lock"
                | "omp_get_num_threads"
                | "omp_get_max_threads"
                | "omp_get_wtime"
                | "omp_set_num_threads"
        )
    }
}

/// LLVM intrinsics and libc noise that never produce events.
pub fn is_no_effect(name: &str) -> bool {
    name.starts_with("llvm.") || matches!(name, "printf" | "puts" | "malloc" | "free" | "calloc")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openmp_superset_covers_recognizers() {
        for name in [
            "__kmpc_fork_call",
            "__kmpc_for_static_init_4",
            "__kmpc_barrier",
            "__kmpc_reduce_nowait",
            "__kmpc_omp_task",
            "omp_set_lock",
            "omp_get_thread_num",
        ] {
            assert!(openmp::is_openmp(name), "{name} must be openmp-classified");
        }
    }

    #[test]
    fn test_static_init_matches_width_suffixes() {
        assert!(openmp::is_for_static_init("__kmpc_for_static_init_4"));
        assert!(openmp::is_for_static_init("__kmpc_for_static_init_8u"));
        assert!(!openmp::is_for_static_init("__kmpc_for_static_fini"));
    }

    #[test]
    fn test_pthread_recognizers() {
        assert!(pthread::is_create("pthread_create"));
        assert!(pthread::is_mutex_lock("pthread_mutex_lock"));
        assert!(!pthread::is_mutex_lock("pthread_mutex_unlock"));
        assert!(pthread::is_no_effect("pthread_mutex_init"));
    }
}
