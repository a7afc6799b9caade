//! Module-wide metadata and link data accumulated during generation.

use crate::code::{CallSite, CodeRange, MemoryAccess};
use crate::env::{CustomSection, GlobalDesc, MemoryUsage, TableDesc};
use crate::indices::{CodeRangeIndex, FuncIndex};
use crate::types::{FuncType, SigIdDesc, SymbolicAddress, Tier, ValType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::{Index, IndexMut};

/// Page granularity of the global data area. The loader maps the area with
/// the code segment, so its length is rounded up to this.
pub const PAGE_SIZE: u32 = 4096;

/// A fixed-size hash identifying a module's bytecode, kept for debugging.
pub type ModuleHash = [u8; 8];

/// Rounds `offset` up to a multiple of `align`.
pub fn align_up(offset: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two());
    (offset + (align - 1)) & !(align - 1)
}

/// Per-import metadata: the signature and the offsets code needs to reach
/// the import's TLS record and exit stubs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FuncImport {
    sig: FuncType,
    global_data_offset: u32,
    interp_exit_offset: Option<u32>,
    jit_exit_offset: Option<u32>,
}

impl FuncImport {
    /// Creates an import record with no exit offsets yet.
    pub fn new(sig: FuncType, global_data_offset: u32) -> FuncImport {
        FuncImport {
            sig,
            global_data_offset,
            interp_exit_offset: None,
            jit_exit_offset: None,
        }
    }

    /// The import's signature.
    pub fn sig(&self) -> &FuncType {
        &self.sig
    }

    /// Offset of the import's TLS record in the global data area.
    pub fn global_data_offset(&self) -> u32 {
        self.global_data_offset
    }

    /// Sets the interpreter exit entry. Must happen exactly once.
    pub fn init_interp_exit_offset(&mut self, offset: u32) {
        debug_assert!(self.interp_exit_offset.is_none());
        self.interp_exit_offset = Some(offset);
    }

    /// Sets the jit exit entry. Must happen exactly once.
    pub fn init_jit_exit_offset(&mut self, offset: u32) {
        debug_assert!(self.jit_exit_offset.is_none());
        self.jit_exit_offset = Some(offset);
    }

    /// The interpreter exit entry, once stubs are linked.
    pub fn interp_exit_offset(&self) -> Option<u32> {
        self.interp_exit_offset
    }

    /// The jit exit entry, once stubs are linked.
    pub fn jit_exit_offset(&self) -> Option<u32> {
        self.jit_exit_offset
    }
}

/// Per-export metadata: the signature, entry-stub offset and, after
/// finalization, the code range of the function body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FuncExport {
    sig: FuncType,
    func_index: FuncIndex,
    entry_offset: Option<u32>,
    code_range_index: Option<CodeRangeIndex>,
}

impl FuncExport {
    /// Creates an export record with no offsets yet.
    pub fn new(sig: FuncType, func_index: FuncIndex) -> FuncExport {
        FuncExport {
            sig,
            func_index,
            entry_offset: None,
            code_range_index: None,
        }
    }

    /// The export's signature.
    pub fn sig(&self) -> &FuncType {
        &self.sig
    }

    /// The exported function.
    pub fn func_index(&self) -> FuncIndex {
        self.func_index
    }

    /// Sets the entry-stub offset. Must happen exactly once.
    pub fn init_entry_offset(&mut self, offset: u32) {
        debug_assert!(self.entry_offset.is_none());
        self.entry_offset = Some(offset);
    }

    /// Sets the body's code range index. Must happen exactly once.
    pub fn init_code_range_index(&mut self, index: CodeRangeIndex) {
        debug_assert!(self.code_range_index.is_none());
        self.code_range_index = Some(index);
    }

    /// The entry-stub offset, once stubs are linked.
    pub fn entry_offset(&self) -> Option<u32> {
        self.entry_offset
    }

    /// The body's code range, once metadata is finished.
    pub fn code_range_index(&self) -> Option<CodeRangeIndex> {
        self.code_range_index
    }
}

/// Metadata describing one tier's code.
///
/// `code_ranges` and `call_sites` stay sorted by `begin` and
/// `ret_addr_offset` respectively: tasks emit them in order and linking
/// appends whole batches at monotonically increasing offsets.
#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct MetadataTier {
    /// The tier this metadata describes.
    pub tier: Option<Tier>,
    /// All code ranges, sorted by start offset.
    pub code_ranges: Vec<CodeRange>,
    /// All call sites, sorted by return address.
    pub call_sites: Vec<CallSite>,
    /// All heap accesses, sorted by instruction offset.
    pub memory_accesses: Vec<MemoryAccess>,
    /// Per-import records, in import order.
    pub func_imports: Vec<FuncImport>,
    /// Per-export records, sorted by function index. Built at finalization.
    pub func_exports: Vec<FuncExport>,
    /// Entry offsets of debug-trap islands, in emission (hence sorted)
    /// order. The breakpoint runtime searches this list for an island in
    /// range of a probe.
    pub debug_trap_far_jump_offsets: Vec<u32>,
    /// Per element segment, the code range of each element function;
    /// parallel to the environment's segment list. Filled at finalization.
    pub elem_code_range_indices: Vec<Vec<CodeRangeIndex>>,
    /// Function-to-code-range map kept when debugging is on; `None` entries
    /// are imports.
    pub debug_func_to_code_range: Vec<Option<CodeRangeIndex>>,
}

impl MetadataTier {
    /// Creates empty metadata for `tier`.
    pub fn new(tier: Tier) -> MetadataTier {
        MetadataTier {
            tier: Some(tier),
            ..Default::default()
        }
    }

    /// Looks up the export record for `func_index`. The export list is
    /// sorted, so this is a binary search.
    pub fn lookup_func_export_mut(&mut self, func_index: FuncIndex) -> &mut FuncExport {
        let i = self
            .func_exports
            .binary_search_by_key(&func_index, |fe| fe.func_index())
            .expect("function is exported");
        &mut self.func_exports[i]
    }

    /// Shared-reference variant of [`MetadataTier::lookup_func_export_mut`].
    pub fn lookup_func_export(&self, func_index: FuncIndex) -> Option<&FuncExport> {
        self.func_exports
            .binary_search_by_key(&func_index, |fe| fe.func_index())
            .ok()
            .map(|i| &self.func_exports[i])
    }
}

/// Module-wide metadata shared by all tiers.
#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct Metadata {
    /// Total length of the global data area, page-rounded at finalization.
    pub global_data_length: u32,
    /// Signatures whose id lives in a global data slot, with the assigned
    /// descriptor.
    pub sig_ids: Vec<(FuncType, SigIdDesc)>,
    /// How the module uses linear memory.
    pub memory_usage: MemoryUsage,
    /// Minimum memory size in bytes.
    pub min_memory_length: u32,
    /// Maximum memory size in bytes, if bounded.
    pub max_memory_length: Option<u32>,
    /// Table descriptors with their assigned global-data offsets.
    pub tables: Vec<TableDesc>,
    /// Global descriptors with their assigned global-data offsets.
    pub globals: Vec<GlobalDesc>,
    /// The start function, if any.
    pub start_func_index: Option<FuncIndex>,
    /// Function names, where known.
    pub func_names: HashMap<FuncIndex, String>,
    /// Custom sections carried through verbatim.
    pub custom_sections: Vec<CustomSection>,
    /// Source filename, if the embedder provided one.
    pub filename: Option<String>,
    /// Whether debug artifacts were captured.
    pub debug_enabled: bool,
    /// Per-function argument types, captured when debugging is on.
    pub debug_func_arg_types: Vec<Vec<ValType>>,
    /// Per-function return types, captured when debugging is on.
    pub debug_func_return_types: Vec<Option<ValType>>,
    /// Truncated hash of the bytecode, captured when debugging is on.
    pub debug_hash: ModuleHash,
}

/// A pair of module-global offsets: patch the slot at `patch_at_offset` with
/// the eventual absolute address of `target_offset`.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct InternalLink {
    /// The slot to patch.
    pub patch_at_offset: u32,
    /// The code offset whose address the slot receives.
    pub target_offset: u32,
}

/// Patch offsets per symbolic address.
#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct SymbolicLinkArray([Vec<u32>; SymbolicAddress::COUNT]);

impl Index<SymbolicAddress> for SymbolicLinkArray {
    type Output = Vec<u32>;

    fn index(&self, target: SymbolicAddress) -> &Vec<u32> {
        &self.0[target.index()]
    }
}

impl IndexMut<SymbolicAddress> for SymbolicLinkArray {
    fn index_mut(&mut self, target: SymbolicAddress) -> &mut Vec<u32> {
        &mut self.0[target.index()]
    }
}

/// Everything the loader needs to fix code up when mapping it: internal
/// links, symbolic links and the entries of the signal-handler exits.
#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct LinkDataTier {
    /// Slot/target pairs patched with absolute addresses at load time.
    pub internal_links: Vec<InternalLink>,
    /// Slots patched with runtime helper addresses at load time.
    pub symbolic_links: SymbolicLinkArray,
    /// Entry of the out-of-bounds exit. Set exactly once.
    pub out_of_bounds_offset: Option<u32>,
    /// Entry of the unaligned-access exit. Set exactly once.
    pub unaligned_access_offset: Option<u32>,
    /// Entry of the interrupt exit. Set exactly once.
    pub interrupt_offset: Option<u32>,
}
