//! Records describing compiled code: code ranges, call sites and the other
//! side-tables a compilation task produces alongside its bytes.
//!
//! All offsets in these records are local to the buffer the code was emitted
//! into. When a [`CompiledCode`] is spliced into the master buffer every
//! record is rebased by the append position; the `offset_by` methods are that
//! rebasing.

use crate::indices::FuncIndex;
use crate::masm::{CodeOffset, MacroAssembler};
use crate::types::{SymbolicAddress, Trap};
use serde::{Deserialize, Serialize};
use std::mem;

/// What lives inside a [`CodeRange`], with the payload each kind carries.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodeRangeKind {
    /// A function body.
    Function {
        /// The function this body belongs to.
        func_index: FuncIndex,
    },
    /// A host-to-wasm entry trampoline for an exported function.
    Entry {
        /// The exported function.
        func_index: FuncIndex,
    },
    /// A wasm-to-jit exit for an imported function.
    ImportJitExit {
        /// The imported function.
        func_index: FuncIndex,
    },
    /// A wasm-to-interpreter exit for an imported function.
    ImportInterpExit {
        /// The imported function.
        func_index: FuncIndex,
    },
    /// The shared exit stub for one trap kind.
    TrapExit {
        /// Which trap.
        trap: Trap,
    },
    /// The single debug-trap stub.
    DebugTrap,
    /// The out-of-bounds signal-handler exit.
    OutOfBoundsExit,
    /// The unaligned-access signal-handler exit.
    UnalignedExit,
    /// The interrupt check exit.
    Interrupt,
    /// The throw stub; only ever jumped to.
    Throw,
    /// A far-jump island emitted between function bodies by the call-site
    /// patcher. Never produced by a compilation task.
    FarJumpIsland,
    /// A thunk bridging to a builtin; never produced by a compilation task.
    BuiltinThunk,
}

/// A `[begin, end)` byte interval of the code buffer tagged with what lives
/// there.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct CodeRange {
    /// First byte of the range.
    pub begin: u32,
    /// One past the last byte of the range.
    pub end: u32,
    /// What the range contains.
    pub kind: CodeRangeKind,
}

impl CodeRange {
    /// Builds a range over `[begin, end)`.
    pub fn new(kind: CodeRangeKind, begin: u32, end: u32) -> CodeRange {
        debug_assert!(begin <= end);
        CodeRange { begin, end, kind }
    }

    /// Rebases the range by the position its code was appended at.
    pub fn offset_by(&mut self, delta: u32) {
        self.begin += delta;
        self.end += delta;
    }

    /// Whether this range is a function body.
    pub fn is_function(&self) -> bool {
        matches!(self.kind, CodeRangeKind::Function { .. })
    }

    /// The function index carried by function, entry and import-exit ranges.
    pub fn func_index(&self) -> FuncIndex {
        match self.kind {
            CodeRangeKind::Function { func_index }
            | CodeRangeKind::Entry { func_index }
            | CodeRangeKind::ImportJitExit { func_index }
            | CodeRangeKind::ImportInterpExit { func_index } => func_index,
            _ => panic!("code range has no function index: {:?}", self.kind),
        }
    }

    /// The offset direct calls to this function land on. In the portable
    /// encoding a function's normal entry coincides with the start of its
    /// range.
    pub fn func_normal_entry(&self) -> u32 {
        debug_assert!(self.is_function());
        self.begin
    }

    /// The entry used by the tier-1 jump table; also the start of the range.
    pub fn func_tier_entry(&self) -> u32 {
        debug_assert!(self.is_function());
        self.begin
    }
}

/// How a call site was emitted and what patches it expects.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallSiteKind {
    /// A direct call to another function definition.
    Func,
    /// An indirect call through a table; patched nowhere, the callee is
    /// loaded at runtime.
    Dynamic,
    /// A call through a symbolic-address slot; fixed up by the symbolic
    /// linker.
    Symbolic,
    /// A call to a trap exit from an out-of-line trap path.
    TrapExit,
    /// A breakpoint probe.
    Breakpoint,
    /// A frame-entry debug probe.
    EnterFrame,
    /// A frame-exit debug probe.
    LeaveFrame,
}

/// A patchable relative call in emitted code.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct CallSite {
    /// How the site was emitted.
    pub kind: CallSiteKind,
    /// Offset just past the call instruction.
    pub ret_addr_offset: u32,
}

impl CallSite {
    /// Rebases the site by the position its code was appended at.
    pub fn offset_by(&mut self, delta: u32) {
        self.ret_addr_offset += delta;
    }
}

/// What a call site targets; parallel to the call-site list.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallSiteTarget {
    /// A function definition.
    Func(FuncIndex),
    /// A trap exit.
    Trap(Trap),
    /// No static target (dynamic, symbolic and breakpoint-class sites).
    None,
}

/// A far jump that must eventually land on a function's entry.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct CallFarJump {
    /// The callee.
    pub func_index: FuncIndex,
    /// The jump's patchable slot.
    pub jump: CodeOffset,
}

impl CallFarJump {
    /// Rebases the patch point by the position its code was appended at.
    pub fn offset_by(&mut self, delta: u32) {
        self.jump.offset_by(delta);
    }
}

/// A far jump that must eventually land on a trap handler's entry.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct TrapFarJump {
    /// The trap whose exit is targeted.
    pub trap: Trap,
    /// The jump's patchable slot.
    pub jump: CodeOffset,
}

impl TrapFarJump {
    /// Rebases the patch point by the position its code was appended at.
    pub fn offset_by(&mut self, delta: u32) {
        self.jump.offset_by(delta);
    }
}

/// A faulting-instruction record. Tasks drain these into out-of-line trap
/// calls before handing code back, so linked code never carries any.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct TrapSite {
    /// Which trap the instruction can raise.
    pub trap: Trap,
    /// Offset of the instruction.
    pub offset: u32,
}

/// A heap access that the signal handler may need to identify.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct MemoryAccess {
    /// Offset of the access instruction.
    pub insn_offset: u32,
}

impl MemoryAccess {
    /// Rebases the record by the position its code was appended at.
    pub fn offset_by(&mut self, delta: u32) {
        self.insn_offset += delta;
    }
}

/// A patchable slot that the loader fills with a runtime helper's address.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct SymbolicAccess {
    /// The slot to patch.
    pub patch_at: CodeOffset,
    /// Which helper it names.
    pub target: SymbolicAddress,
}

/// An intra-batch reference from one code offset to another, resolved by the
/// internal linker once absolute addresses exist.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct CodeLabel {
    /// The slot to patch.
    pub patch_at: CodeOffset,
    /// The code offset it refers to.
    pub target: CodeOffset,
}

/// The output of one compilation task: machine code plus the side-tables
/// describing it. All offsets are local to `bytes`.
#[derive(Default)]
pub struct CompiledCode {
    /// The machine code.
    pub bytes: Vec<u8>,
    /// Ranges tagging every part of `bytes`, ordered by start offset.
    pub code_ranges: Vec<CodeRange>,
    /// Patchable calls, ordered by return address.
    pub call_sites: Vec<CallSite>,
    /// Targets, parallel to `call_sites`.
    pub call_site_targets: Vec<CallSiteTarget>,
    /// Faulting instructions; must be empty by the time the code is linked.
    pub trap_sites: Vec<TrapSite>,
    /// Far jumps to function entries awaiting their final target.
    pub call_far_jumps: Vec<CallFarJump>,
    /// Far jumps to trap exits awaiting their final target.
    pub trap_far_jumps: Vec<TrapFarJump>,
    /// Heap accesses.
    pub memory_accesses: Vec<MemoryAccess>,
    /// Slots naming runtime helpers.
    pub symbolic_accesses: Vec<SymbolicAccess>,
    /// Intra-batch code references.
    pub code_labels: Vec<CodeLabel>,
}

impl CompiledCode {
    /// Moves the assembler's buffer and side-tables into `self`, leaving the
    /// assembler empty for reuse.
    pub fn swap(&mut self, masm: &mut MacroAssembler) {
        debug_assert!(self.bytes.is_empty());
        mem::swap(&mut self.bytes, &mut masm.bytes);
        mem::swap(&mut self.call_sites, &mut masm.call_sites);
        mem::swap(&mut self.call_site_targets, &mut masm.call_site_targets);
        mem::swap(&mut self.trap_sites, &mut masm.trap_sites);
        mem::swap(&mut self.call_far_jumps, &mut masm.call_far_jumps);
        mem::swap(&mut self.trap_far_jumps, &mut masm.trap_far_jumps);
        mem::swap(&mut self.memory_accesses, &mut masm.memory_accesses);
        mem::swap(&mut self.symbolic_accesses, &mut masm.symbolic_accesses);
        mem::swap(&mut self.code_labels, &mut masm.code_labels);
    }

    /// Whether the output carries no code and no records.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
            && self.code_ranges.is_empty()
            && self.call_sites.is_empty()
            && self.call_site_targets.is_empty()
            && self.trap_sites.is_empty()
            && self.call_far_jumps.is_empty()
            && self.trap_far_jumps.is_empty()
            && self.memory_accesses.is_empty()
            && self.symbolic_accesses.is_empty()
            && self.code_labels.is_empty()
    }

    /// Empties every vector, keeping allocations for the next batch.
    pub fn clear(&mut self) {
        self.bytes.clear();
        self.code_ranges.clear();
        self.call_sites.clear();
        self.call_site_targets.clear();
        self.trap_sites.clear();
        self.call_far_jumps.clear();
        self.trap_far_jumps.clear();
        self.memory_accesses.clear();
        self.symbolic_accesses.clear();
        self.code_labels.clear();
    }
}
