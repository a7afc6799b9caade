//! Compilation tasks and the shared state workers report through.

use crate::code::CompiledCode;
use crate::compiler::{CompileError, Compiler};
use crate::env::ModuleEnvironment;
use crate::indices::FuncIndex;
use std::sync::{Arc, Condvar, Mutex};

/// One function body queued for compilation.
pub struct FuncCompileInput {
    /// Which function this body defines.
    pub func_index: FuncIndex,
    /// Source line (asm-ish embeddings) or bytecode offset of the body,
    /// carried through for error reporting and debug info.
    pub line_or_bytecode: u32,
    /// The body's bytecode.
    pub bytes: Vec<u8>,
    /// Per-instruction line numbers, when the embedder has them.
    pub line_nums: Vec<u32>,
}

/// The record every coordinator/worker exchange flows through.
///
/// Workers take the lock only to push a finished task or bump the failure
/// count; the coordinator takes it only to drain finished tasks or wait.
#[derive(Default)]
pub struct CompileTaskState {
    /// Completion list, failure count and the first error message.
    pub mutex: Mutex<TaskStateInner>,
    /// Signalled whenever a task finishes or fails.
    pub failed_or_finished: Condvar,
}

/// The data behind [`CompileTaskState`]'s mutex.
#[derive(Default)]
pub struct TaskStateInner {
    /// Tasks that have completed and await linking.
    pub finished: Vec<CompileTask>,
    /// How many tasks have failed.
    pub num_failed: u32,
    /// The first failure. Later failures do not overwrite it, so parallel
    /// runs surface errors deterministically.
    pub error: Option<CompileError>,
}

/// A unit of compilation: a batch of function bodies, the environment to
/// compile them against, and the output they produce.
///
/// Tasks are created once at `start_func_defs` and cycle between the
/// generator's free list, the worker pool and the finished list, carrying
/// their allocations with them.
pub struct CompileTask {
    /// The (frozen) module environment.
    pub env: Arc<ModuleEnvironment>,
    /// Where this task reports completion.
    pub state: Arc<CompileTaskState>,
    /// The batched inputs. Empty before compile and after linking.
    pub inputs: Vec<FuncCompileInput>,
    /// The batch's output. Empty before compile and after linking.
    pub output: CompiledCode,
}

impl CompileTask {
    /// Creates an idle task.
    pub fn new(env: Arc<ModuleEnvironment>, state: Arc<CompileTaskState>) -> CompileTask {
        CompileTask {
            env,
            state,
            inputs: Vec::new(),
            output: CompiledCode::default(),
        }
    }
}

/// Runs a task's batch through the compiler. On success the inputs are
/// consumed and the output holds one function code range per input.
pub fn execute_compile_task(
    task: &mut CompileTask,
    compiler: &dyn Compiler,
) -> Result<(), CompileError> {
    debug_assert!(task.output.is_empty());

    compiler.compile_functions(&task.env, &task.inputs, &mut task.output)?;

    let num_funcs = task
        .output
        .code_ranges
        .iter()
        .filter(|cr| cr.is_function())
        .count();
    assert_eq!(num_funcs, task.inputs.len());

    task.inputs.clear();
    Ok(())
}

/// Worker-side entry point: runs the task and reports through its shared
/// state. Failed tasks are dropped; their slot in the pool is accounted for
/// by the failure count.
pub fn execute_compile_task_from_worker(mut task: CompileTask, compiler: &dyn Compiler) {
    let result = execute_compile_task(&mut task, compiler);

    let state = task.state.clone();
    let mut inner = state.mutex.lock().unwrap();
    match result {
        Ok(()) => inner.finished.push(task),
        Err(e) => {
            log::debug!("compile task failed: {}", e);
            inner.num_failed += 1;
            if inner.error.is_none() {
                inner.error = Some(e);
            }
        }
    }
    state.failed_or_finished.notify_one();
}
