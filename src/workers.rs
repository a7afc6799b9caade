//! A fixed-size pool of compilation worker threads.
//!
//! The pool is deliberately dumb: a queue of jobs, a condvar, and threads
//! that loop popping jobs. All completion signalling happens through each
//! task's own [`CompileTaskState`](crate::CompileTaskState), so one pool can
//! serve many concurrent generators, and a generator being dropped can pull
//! its not-yet-started jobs back out by identity.

use crate::compiler::Compiler;
use crate::task::{execute_compile_task_from_worker, CompileTask};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

/// A queued compilation job: the task plus the compiler to run it with.
pub struct QueuedJob {
    /// The task to execute.
    pub task: CompileTask,
    /// The compiler to execute it with.
    pub compiler: Arc<dyn Compiler>,
}

#[derive(Default)]
struct Queue {
    jobs: VecDeque<QueuedJob>,
    shutting_down: bool,
}

#[derive(Default)]
struct PoolState {
    queue: Mutex<Queue>,
    work_available: Condvar,
}

/// A fixed-size worker pool executing compilation jobs.
pub struct WorkerPool {
    state: Arc<PoolState>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `num_threads` workers.
    pub fn new(num_threads: usize) -> WorkerPool {
        assert!(num_threads > 0);
        let state = Arc::new(PoolState::default());
        let handles = (0..num_threads)
            .map(|i| {
                let state = state.clone();
                thread::Builder::new()
                    .name(format!("wasmgen-worker-{}", i))
                    .spawn(move || worker_loop(&state))
                    .expect("spawn worker thread")
            })
            .collect();
        WorkerPool { state, handles }
    }

    /// Number of worker threads.
    pub fn num_threads(&self) -> usize {
        self.handles.len()
    }

    /// Enqueues a job.
    pub fn submit(&self, job: QueuedJob) {
        let mut queue = self.state.queue.lock().unwrap();
        debug_assert!(!queue.shutting_down);
        queue.jobs.push_back(job);
        self.state.work_available.notify_one();
    }

    /// Removes all not-yet-started jobs matching `pred` and returns how many
    /// were removed. Jobs already claimed by a worker are unaffected.
    pub fn remove_pending(&self, mut pred: impl FnMut(&QueuedJob) -> bool) -> usize {
        let mut queue = self.state.queue.lock().unwrap();
        let before = queue.jobs.len();
        queue.jobs.retain(|job| !pred(job));
        before - queue.jobs.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        {
            let mut queue = self.state.queue.lock().unwrap();
            queue.shutting_down = true;
        }
        self.state.work_available.notify_all();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(state: &PoolState) {
    loop {
        let job = {
            let mut queue = state.queue.lock().unwrap();
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    break job;
                }
                if queue.shutting_down {
                    return;
                }
                queue = state.work_available.wait(queue).unwrap();
            }
        };
        log::trace!(
            "worker {:?} compiling batch of {} function(s)",
            thread::current().name().unwrap_or("?"),
            job.task.inputs.len()
        );
        execute_compile_task_from_worker(job.task, &*job.compiler);
    }
}
