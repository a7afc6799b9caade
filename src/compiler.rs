//! The interface to the per-function compilers and the stub generator.
//!
//! The generator treats both as black boxes: a batch of function bodies goes
//! in, a [`CompiledCode`] comes out. Two tiers exist, selected through the
//! environment; an implementation is free to dispatch internally.

use crate::code::CompiledCode;
use crate::env::ModuleEnvironment;
use crate::metadata::{FuncExport, FuncImport};
use crate::task::FuncCompileInput;
use thiserror::Error;

/// An error while generating machine code for a module.
#[derive(Error, Debug, Clone)]
pub enum CompileError {
    /// The function compiler rejected a body.
    #[error("compilation error: {0}")]
    Codegen(String),

    /// The caller's cancellation flag was observed.
    #[error("compilation cancelled")]
    Cancelled,

    /// The global data area outgrew its addressable range.
    #[error("global data region overflow")]
    GlobalDataOverflow,

    /// The code buffer outgrew its addressable range.
    #[error("code buffer overflow")]
    CodeTooLarge,
}

/// A per-function compiler plus stub generator.
///
/// Implementations must be shareable across worker threads. The contract for
/// [`Compiler::compile_functions`]: the output contains exactly one
/// `Function` code range per input, in input order, and every recorded
/// offset is local to the output's bytes. Direct (`Func`-kind) call sites
/// may only target function definitions; calls to imports go through import
/// exits and are emitted as dynamic or symbolic sites.
pub trait Compiler: Send + Sync {
    /// Compiles a batch of function bodies into `output`.
    fn compile_functions(
        &self,
        env: &ModuleEnvironment,
        inputs: &[FuncCompileInput],
        output: &mut CompiledCode,
    ) -> Result<(), CompileError>;

    /// Generates the module's stubs: entry trampolines for `func_exports`,
    /// exits for `func_imports`, one trap exit per trap kind, the
    /// signal-handler exits, and the debug trap when debugging is on.
    fn compile_stubs(
        &self,
        env: &ModuleEnvironment,
        func_imports: &[FuncImport],
        func_exports: &[FuncExport],
        output: &mut CompiledCode,
    ) -> Result<(), CompileError>;
}
