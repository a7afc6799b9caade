//! Batched, parallel WebAssembly module generation.
//!
//! This crate turns a stream of function bodies, together with the module's
//! static structure (signatures, imports, exports, tables, globals, element
//! segments), into a single contiguous code image and the side-tables a
//! runtime needs to execute, relocate and debug it.
//!
//! It works roughly like this:
//!
//! * Function bodies are batched into [`CompileTask`]s and executed by a
//!   fixed-size worker pool, or inline on one thread.
//! * As tasks complete, each task's [`CompiledCode`] is appended to the
//!   master buffer and every recorded offset is rebased by the append
//!   position.
//! * Between appends, the call-site patcher resolves direct calls and
//!   synthesizes far-jump islands wherever a relative call would exceed the
//!   ISA's branch-displacement range.
//! * Finalization produces a [`Module`]: the code segment, a sorted export
//!   table, symbolic and internal relocations, and metadata.
//!
//! The per-function compilers and the stub generator are the embedder's,
//! provided through the [`Compiler`] trait; this crate supplies the
//! orchestration and the assembler facade they emit into.

#![deny(missing_docs)]

mod code;
mod compiler;
mod env;
mod generate;
mod indices;
mod masm;
mod metadata;
mod module;
mod task;
mod tunables;
mod types;
mod workers;

pub use crate::code::*;
pub use crate::compiler::*;
pub use crate::env::*;
pub use crate::generate::*;
pub use crate::indices::*;
pub use crate::masm::*;
pub use crate::metadata::*;
pub use crate::module::*;
pub use crate::task::*;
pub use crate::tunables::*;
pub use crate::types::*;
pub use crate::workers::*;

// Re-exported since entity maps appear throughout the public API.
pub use cranelift_entity::{EntityRef, PrimaryMap, SecondaryMap};

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
