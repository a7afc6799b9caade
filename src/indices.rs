//! Typed index spaces used across module generation.
//!
//! Each index wraps a `u32` and reserves `u32::MAX`, so a
//! `PackedOption<CodeRangeIndex>` is the same size as the index itself.

use cranelift_entity::entity_impl;
use serde::{Deserialize, Serialize};

/// Index of a function (imported or defined) within a module.
///
/// Imported functions come first: indices `0..num_func_imports` name imports
/// and everything past that names a function definition.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct FuncIndex(u32);
entity_impl!(FuncIndex);

/// Index of a function signature within a module.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct SignatureIndex(u32);
entity_impl!(SignatureIndex);

/// Index of a table within a module.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct TableIndex(u32);
entity_impl!(TableIndex);

/// Index of a global variable within a module.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct GlobalIndex(u32);
entity_impl!(GlobalIndex);

/// Index of an element segment within a module.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct ElemSegmentIndex(u32);
entity_impl!(ElemSegmentIndex);

/// Index of a `CodeRange` within a tier's `code_ranges` vector.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct CodeRangeIndex(u32);
entity_impl!(CodeRangeIndex);
