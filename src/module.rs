//! The artifacts module generation produces: the code segment, the optional
//! tier-1 jump table, and the `Module` container tying them to metadata and
//! link data.
//!
//! Mapping the segment executable, applying link data and instantiating are
//! the runtime linker's business, not this crate's.

use crate::env::{DataSegment, ElemSegment, EntityItem, Import};
use crate::indices::FuncIndex;
use crate::metadata::{LinkDataTier, Metadata, MetadataTier};
use crate::types::Tier;
use cranelift_entity::EntityRef;
use indexmap::IndexMap;
use std::sync::Arc;

/// One tier's worth of executable code.
#[derive(Debug)]
pub struct CodeSegment {
    tier: Tier,
    bytes: Box<[u8]>,
}

impl CodeSegment {
    /// Wraps finished code bytes.
    pub fn new(tier: Tier, bytes: Vec<u8>) -> CodeSegment {
        CodeSegment {
            tier,
            bytes: bytes.into_boxed_slice(),
        }
    }

    /// The tier this segment was compiled at.
    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Base address of the code. Stable for the segment's lifetime.
    pub fn base(&self) -> *const u8 {
        self.bytes.as_ptr()
    }

    /// Length of the code in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the segment is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The code bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// One entry per function, holding the address of the function's tier entry.
/// Built for tier-1 modules so tier-2 code can be patched in underneath
/// running code.
#[derive(Debug)]
pub struct JumpTable(Box<[usize]>);

impl JumpTable {
    /// Builds a table of `num_funcs` zeroed entries.
    pub fn new(num_funcs: usize) -> JumpTable {
        JumpTable(vec![0; num_funcs].into_boxed_slice())
    }

    /// Sets the entry for `func_index`.
    pub fn set(&mut self, func_index: FuncIndex, address: usize) {
        self.0[func_index.index()] = address;
    }

    /// The entry for `func_index`; zero for functions with no body (imports).
    pub fn get(&self, func_index: FuncIndex) -> usize {
        self.0[func_index.index()]
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A code segment together with the side-tables describing it.
#[derive(Debug)]
pub struct CompiledTier {
    /// The executable code.
    pub segment: CodeSegment,
    /// Code ranges, call sites, imports, exports.
    pub metadata: MetadataTier,
    /// What the loader must patch when mapping the segment.
    pub link_data: LinkDataTier,
}

/// A fully generated module: one or two compiled tiers plus the shared
/// metadata and the static structure the instantiator needs.
#[derive(Debug)]
pub struct Module {
    metadata: Metadata,
    tier1: CompiledTier,
    tier2: Option<CompiledTier>,
    jump_table: Option<JumpTable>,
    debug_bytes: Option<Box<[u8]>>,

    /// Imports, in declaration order.
    pub imports: Vec<Import>,
    /// Exported entities by field name, in declaration order.
    pub exports: IndexMap<String, EntityItem>,
    /// Data segments for the instantiator.
    pub data_segments: Vec<DataSegment>,
    /// Element segments for the instantiator.
    pub elem_segments: Vec<ElemSegment>,

    bytecode: Arc<[u8]>,
}

impl Module {
    /// Assembles a module from a finished tier-1 (or only-tier) compilation.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        metadata: Metadata,
        tier1: CompiledTier,
        jump_table: Option<JumpTable>,
        debug_bytes: Option<Box<[u8]>>,
        imports: Vec<Import>,
        exports: IndexMap<String, EntityItem>,
        data_segments: Vec<DataSegment>,
        elem_segments: Vec<ElemSegment>,
        bytecode: Arc<[u8]>,
    ) -> Module {
        Module {
            metadata,
            tier1,
            tier2: None,
            jump_table,
            debug_bytes,
            imports,
            exports,
            data_segments,
            elem_segments,
            bytecode,
        }
    }

    /// Module-wide metadata.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// The first (or only) compiled tier.
    pub fn tier1(&self) -> &CompiledTier {
        &self.tier1
    }

    /// The second tier, once `finish_tier2` has installed it.
    pub fn tier2(&self) -> Option<&CompiledTier> {
        self.tier2.as_ref()
    }

    /// The best available tier.
    pub fn best_tier(&self) -> &CompiledTier {
        self.tier2.as_ref().unwrap_or(&self.tier1)
    }

    /// The tier-1 jump table, present in two-tier modules.
    pub fn jump_table(&self) -> Option<&JumpTable> {
        self.jump_table.as_ref()
    }

    /// The unprotected copy of the code kept for debugging.
    pub fn debug_bytes(&self) -> Option<&[u8]> {
        self.debug_bytes.as_deref()
    }

    /// The module's bytecode, kept for tier-2 compilation and debugging.
    pub fn bytecode(&self) -> &Arc<[u8]> {
        &self.bytecode
    }

    /// Installs the tier-2 compilation. Must happen at most once, with
    /// optimized-tier code.
    pub fn finish_tier2(&mut self, tier2: CompiledTier) {
        assert!(self.tier2.is_none());
        assert_eq!(tier2.segment.tier(), Tier::Optimized);
        self.tier2 = Some(tier2);
    }
}
