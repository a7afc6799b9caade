//! The static description of a module under compilation.
//!
//! A `ModuleEnvironment` is produced by the bytecode parser (not part of this
//! crate) and handed to the [`ModuleGenerator`](crate::ModuleGenerator). The
//! generator mutates it once during construction, to lay out the global data
//! area and assign signature ids, then freezes it behind an `Arc` so worker
//! threads can read it while function bodies compile.

use crate::indices::{FuncIndex, GlobalIndex, SignatureIndex, TableIndex};
use crate::types::{CompileMode, SigWithId, Tier, ValType};
use cranelift_entity::{EntityRef, PrimaryMap};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Resizable limits of a table or memory.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct Limits {
    /// Initial number of elements or pages.
    pub initial: u32,
    /// Optional upper bound.
    pub maximum: Option<u32>,
}

/// A table declared by or imported into the module.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TableDesc {
    /// Size bounds.
    pub limits: Limits,
    /// Whether the table is visible outside the module (imported or
    /// exported). Elements of external tables count as exported functions.
    pub external: bool,
    /// Offset of this table's TLS record in the global data area. Assigned
    /// by the generator.
    pub global_data_offset: Option<u32>,
}

/// A constant-ish initializer expression.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub enum InitExpr {
    /// A constant element offset.
    I32Const(u32),
    /// The value of an (imported, immutable) global.
    GetGlobal(GlobalIndex),
}

/// A global variable declared by the module.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GlobalDesc {
    /// The value type of the global.
    pub ty: ValType,
    /// Whether the global is mutable. Immutable globals are constant-folded
    /// into code and get no storage.
    pub mutable: bool,
    /// The initial value.
    pub init: InitExpr,
    /// Offset of this global's cell in the global data area. Assigned by the
    /// generator for mutable globals only.
    pub offset: Option<u32>,
}

impl GlobalDesc {
    /// Whether this global needs no storage in the global data area.
    pub fn is_constant(&self) -> bool {
        !self.mutable
    }
}

/// What kind of entity an export or import refers to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityItem {
    /// A function.
    Func(FuncIndex),
    /// A table.
    Table(TableIndex),
    /// A global.
    Global(GlobalIndex),
    /// The (single) linear memory.
    Memory,
}

/// A module import.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Import {
    /// The module name of the import.
    pub module: String,
    /// The field name of the import.
    pub field: String,
    /// The imported entity.
    pub item: EntityItem,
}

/// An element segment: initializes a slice of a function table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ElemSegment {
    /// The table being initialized.
    pub table_index: TableIndex,
    /// Where in the table the elements land.
    pub offset: InitExpr,
    /// The function indices written into the table.
    pub elem_func_indices: Vec<FuncIndex>,
}

/// A data segment: initializes a slice of linear memory.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataSegment {
    /// Where in memory the bytes land.
    pub offset: InitExpr,
    /// The bytes themselves.
    pub bytes: Vec<u8>,
}

/// A custom section carried through to the final module.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CustomSection {
    /// Section name.
    pub name: String,
    /// Raw payload.
    pub payload: Vec<u8>,
}

/// Whether and how the module uses linear memory.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryUsage {
    /// No linear memory.
    None,
    /// A module-private or exported unshared memory.
    Unshared,
    /// A shared memory.
    Shared,
}

impl Default for MemoryUsage {
    fn default() -> MemoryUsage {
        MemoryUsage::None
    }
}

/// Everything the generator needs to know about the module being compiled,
/// minus the function bodies themselves.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModuleEnvironment {
    /// The tier this run compiles at.
    pub tier: Tier,
    /// The role of this run in the tiering workflow.
    pub mode: CompileMode,

    /// All signatures declared by the module. Ids are assigned by the
    /// generator during init.
    pub signatures: PrimaryMap<SignatureIndex, SigWithId>,
    /// Signature of every function, imports first.
    pub func_sigs: PrimaryMap<FuncIndex, SignatureIndex>,
    /// Number of imported functions; function indices below this are imports.
    pub num_func_imports: u32,
    /// Per-import offset of its TLS record in the global data area. Assigned
    /// by the generator; parallel to the first `num_func_imports` entries of
    /// `func_sigs`.
    pub func_import_global_data_offsets: Vec<Option<u32>>,

    /// Tables, in declaration order.
    pub tables: PrimaryMap<TableIndex, TableDesc>,
    /// Globals, in declaration order.
    pub globals: PrimaryMap<GlobalIndex, GlobalDesc>,

    /// All imports, in declaration order.
    pub imports: Vec<Import>,
    /// Exported entities by field name, in declaration order.
    pub exports: IndexMap<String, EntityItem>,
    /// The start function, if any.
    pub start_func: Option<FuncIndex>,

    /// Element segments initializing function tables.
    pub elem_segments: Vec<ElemSegment>,
    /// Data segments initializing linear memory.
    pub data_segments: Vec<DataSegment>,

    /// How the module uses linear memory.
    pub memory_usage: MemoryUsage,
    /// Minimum memory size in bytes.
    pub min_memory_length: u32,
    /// Maximum memory size in bytes, if bounded.
    pub max_memory_length: Option<u32>,

    /// Names from the name section, where present.
    pub func_names: HashMap<FuncIndex, String>,
    /// Custom sections carried through verbatim.
    pub custom_sections: Vec<CustomSection>,
}

impl ModuleEnvironment {
    /// Creates an empty environment for the given tier and mode.
    pub fn new(tier: Tier, mode: CompileMode) -> ModuleEnvironment {
        ModuleEnvironment {
            tier,
            mode,
            signatures: PrimaryMap::new(),
            func_sigs: PrimaryMap::new(),
            num_func_imports: 0,
            func_import_global_data_offsets: Vec::new(),
            tables: PrimaryMap::new(),
            globals: PrimaryMap::new(),
            imports: Vec::new(),
            exports: IndexMap::new(),
            start_func: None,
            elem_segments: Vec::new(),
            data_segments: Vec::new(),
            memory_usage: MemoryUsage::None,
            min_memory_length: 0,
            max_memory_length: None,
            func_names: HashMap::new(),
            custom_sections: Vec::new(),
        }
    }

    /// Total number of functions, imports included.
    pub fn num_funcs(&self) -> usize {
        self.func_sigs.len()
    }

    /// Number of function definitions (non-imports).
    pub fn num_func_defs(&self) -> usize {
        self.func_sigs.len() - self.num_func_imports as usize
    }

    /// Whether `index` names an imported function.
    pub fn is_imported_function(&self, index: FuncIndex) -> bool {
        (index.index() as u32) < self.num_func_imports
    }

    /// The signature of the function at `index`.
    pub fn func_sig(&self, index: FuncIndex) -> &SigWithId {
        &self.signatures[self.func_sigs[index]]
    }
}
