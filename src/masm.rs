//! The macro-assembler facade.
//!
//! Module generation only needs a byte buffer with patchable call and jump
//! sites plus per-batch side-tables, so this assembler emits a small
//! *portable encoding* rather than any real ISA:
//!
//! * near call: `0xE8` followed by a little-endian `i32` displacement
//!   relative to the end of the instruction (the return address);
//! * far jump: a 4-byte marker followed by an 8-byte target slot, patched
//!   with a module-global code offset and resolved to an absolute address by
//!   the loader;
//! * register loads and memory accesses: fixed byte sequences that exist so
//!   code ranges have realistic contents and side-tables have offsets to
//!   describe.
//!
//! Every offset handed out by the assembler is an offset into the buffer
//! being built, so code compiled into a task-local assembler is position
//! independent until it is spliced into the master buffer.

use crate::code::{
    CallFarJump, CallSite, CallSiteKind, CallSiteTarget, CodeLabel, MemoryAccess, SymbolicAccess,
    TrapFarJump, TrapSite,
};
use crate::types::{SymbolicAddress, Trap};
use serde::{Deserialize, Serialize};

/// Code must start on this alignment; padding is `HALT` bytes.
pub const CODE_ALIGNMENT: u32 = 16;

/// Largest displacement a near call can express. The effective branch range
/// of a module is `min(jump_threshold, JUMP_IMMEDIATE_RANGE)`.
pub const JUMP_IMMEDIATE_RANGE: u32 = i32::MAX as u32;

/// Byte offset of the saved TLS pointer within a call frame. Trap and
/// debug-trap islands reload the TLS register from here because the code
/// leading to them may have clobbered it.
pub const FRAME_TLS_OFFSET: i32 = 8;

const HALT: u8 = 0xCC;
const CALL_OPCODE: u8 = 0xE8;
const FAR_JUMP_MARKER: [u8; 4] = [0x49, 0xBB, 0x4A, 0x4D];
const LOAD_PTR_OPCODE: [u8; 2] = [0x48, 0x8B];
const MEMORY_ACCESS_OPCODE: [u8; 4] = [0x42, 0x8B, 0x04, 0x0F];
const SYMBOLIC_MOV_OPCODE: [u8; 2] = [0x48, 0xA1];

/// Length in bytes of a near call instruction.
pub const CALL_LENGTH: u32 = 5;
/// Length in bytes of a far jump (marker + 8-byte slot).
pub const FAR_JUMP_LENGTH: u32 = 12;
/// Length in bytes of a `load_ptr` instruction.
pub const LOAD_PTR_LENGTH: u32 = 8;

/// A patchable location in emitted code.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeOffset(
    /// Offset of the patchable bytes within their buffer.
    pub u32,
);

impl CodeOffset {
    /// Shifts this offset by the position its code was appended at.
    pub fn offset_by(&mut self, delta: u32) {
        self.0 += delta;
    }
}

/// Registers the generator's linking passes need to name.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Reg {
    /// The register holding the current instance's TLS base pointer.
    Tls,
    /// The frame pointer.
    FramePointer,
    /// A scratch register.
    Scratch,
}

impl Reg {
    fn encoding(self) -> u8 {
        match self {
            Reg::Tls => 0x0E,
            Reg::FramePointer => 0x05,
            Reg::Scratch => 0x0B,
        }
    }
}

/// A base-plus-displacement memory operand.
#[derive(Copy, Clone, Debug)]
pub struct Address {
    /// Base register.
    pub base: Reg,
    /// Byte displacement from the base.
    pub offset: i32,
}

impl Address {
    /// An operand relative to the frame pointer.
    pub fn frame(offset: i32) -> Address {
        Address {
            base: Reg::FramePointer,
            offset,
        }
    }
}

/// The macro assembler: an append-only code buffer plus the side-tables
/// produced for the batch of code currently being emitted.
#[derive(Default)]
pub struct MacroAssembler {
    pub(crate) bytes: Vec<u8>,
    oom: bool,
    finished: bool,

    pub(crate) call_sites: Vec<CallSite>,
    pub(crate) call_site_targets: Vec<CallSiteTarget>,
    pub(crate) trap_sites: Vec<TrapSite>,
    pub(crate) call_far_jumps: Vec<CallFarJump>,
    pub(crate) trap_far_jumps: Vec<TrapFarJump>,
    pub(crate) memory_accesses: Vec<MemoryAccess>,
    pub(crate) symbolic_accesses: Vec<SymbolicAccess>,
    pub(crate) code_labels: Vec<CodeLabel>,
}

impl MacroAssembler {
    /// Creates an empty assembler.
    pub fn new() -> MacroAssembler {
        MacroAssembler::default()
    }

    /// Pre-allocates buffer capacity.
    pub fn reserve(&mut self, bytes: usize) {
        self.bytes.reserve(bytes);
    }

    /// Current size of the buffer in bytes.
    pub fn size(&self) -> u32 {
        debug_assert!(self.bytes.len() <= u32::MAX as usize);
        self.bytes.len() as u32
    }

    /// Offset the next emitted byte will land at.
    pub fn current_offset(&self) -> u32 {
        self.size()
    }

    /// Whether the buffer has outgrown the addressable code range.
    pub fn oom(&self) -> bool {
        self.oom
    }

    /// The emitted bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Takes the emitted bytes out of the assembler.
    pub fn take_bytes(&mut self) -> Vec<u8> {
        debug_assert!(self.finished);
        std::mem::take(&mut self.bytes)
    }

    /// Pads with halt bytes until the buffer size is a multiple of `align`.
    pub fn halting_align(&mut self, align: u32) {
        debug_assert!(align.is_power_of_two());
        while self.size() % align != 0 {
            self.push(HALT);
        }
    }

    /// Appends raw, already-encoded machine code.
    pub fn append_raw_code(&mut self, code: &[u8]) {
        if self.bytes.len() + code.len() > u32::MAX as usize {
            self.oom = true;
            return;
        }
        self.bytes.extend_from_slice(code);
    }

    fn push(&mut self, byte: u8) {
        if self.bytes.len() + 1 > u32::MAX as usize {
            self.oom = true;
            return;
        }
        self.bytes.push(byte);
    }

    /// Emits a near call with a zero displacement and records the call site.
    /// Returns the call site's return address offset.
    pub fn call_site(&mut self, kind: CallSiteKind, target: CallSiteTarget) -> u32 {
        self.push(CALL_OPCODE);
        self.append_raw_code(&0i32.to_le_bytes());
        let ret_addr_offset = self.current_offset();
        self.call_sites.push(CallSite {
            kind,
            ret_addr_offset,
        });
        self.call_site_targets.push(target);
        ret_addr_offset
    }

    /// Emits a call to a trap exit.
    pub fn trap_call(&mut self, trap: Trap) -> u32 {
        self.call_site(CallSiteKind::TrapExit, CallSiteTarget::Trap(trap))
    }

    /// Emits a breakpoint-class call site. The site is left unpatched; the
    /// breakpoint runtime reaches the debug trap through the ordered island
    /// list instead.
    pub fn breakpoint(&mut self, kind: CallSiteKind) -> u32 {
        debug_assert!(matches!(
            kind,
            CallSiteKind::Breakpoint | CallSiteKind::EnterFrame | CallSiteKind::LeaveFrame
        ));
        self.call_site(kind, CallSiteTarget::None)
    }

    /// Patches the near call whose return address is `caller_ret_addr` to
    /// land on `callee_offset`.
    pub fn patch_call(&mut self, caller_ret_addr: u32, callee_offset: u32) {
        let at = caller_ret_addr as usize;
        debug_assert!(at >= CALL_LENGTH as usize);
        debug_assert_eq!(self.bytes[at - CALL_LENGTH as usize], CALL_OPCODE);
        let disp = callee_offset as i64 - caller_ret_addr as i64;
        debug_assert!(disp.unsigned_abs() < JUMP_IMMEDIATE_RANGE as u64);
        self.bytes[at - 4..at].copy_from_slice(&(disp as i32).to_le_bytes());
    }

    /// Emits a far jump with an unpatched target slot and returns the slot's
    /// location.
    pub fn far_jump_with_patch(&mut self) -> CodeOffset {
        self.append_raw_code(&FAR_JUMP_MARKER);
        let slot = CodeOffset(self.current_offset());
        self.append_raw_code(&u64::MAX.to_le_bytes());
        slot
    }

    /// Stores the module-global `target_offset` into a far jump's slot. The
    /// loader rewrites slots into absolute addresses when the code segment is
    /// mapped.
    pub fn patch_far_jump(&mut self, jump: CodeOffset, target_offset: u32) {
        let at = jump.0 as usize;
        debug_assert_eq!(&self.bytes[at - 4..at], &FAR_JUMP_MARKER[..]);
        self.bytes[at..at + 8].copy_from_slice(&u64::from(target_offset).to_le_bytes());
    }

    /// Emits a pointer load from `addr` into `reg`.
    pub fn load_ptr(&mut self, addr: Address, reg: Reg) {
        self.append_raw_code(&LOAD_PTR_OPCODE);
        self.push(reg.encoding());
        self.push(addr.base.encoding());
        self.append_raw_code(&addr.offset.to_le_bytes());
    }

    /// Emits a heap access and records it in the side-tables.
    pub fn memory_access(&mut self) -> u32 {
        let insn_offset = self.current_offset();
        self.append_raw_code(&MEMORY_ACCESS_OPCODE);
        self.memory_accesses.push(MemoryAccess { insn_offset });
        insn_offset
    }

    /// Emits a load of a runtime helper's address through a patchable slot.
    pub fn symbolic_access(&mut self, target: SymbolicAddress) -> CodeOffset {
        self.append_raw_code(&SYMBOLIC_MOV_OPCODE);
        let patch_at = CodeOffset(self.current_offset());
        self.append_raw_code(&u64::MAX.to_le_bytes());
        self.symbolic_accesses.push(SymbolicAccess { patch_at, target });
        patch_at
    }

    /// Embeds a pointer-sized slot referring to `target` elsewhere in this
    /// batch's code, recorded as a code label for the internal linker.
    pub fn embed_code_label(&mut self, target: CodeOffset) -> CodeOffset {
        let patch_at = CodeOffset(self.current_offset());
        self.append_raw_code(&u64::MAX.to_le_bytes());
        self.code_labels.push(CodeLabel { patch_at, target });
        patch_at
    }

    /// Records a trap site at the current offset.
    pub fn trap_site(&mut self, trap: Trap) {
        let offset = self.current_offset();
        self.trap_sites.push(TrapSite { trap, offset });
    }

    /// Flushes any buffered state. The portable buffer is always flushed;
    /// this exists to keep call sites aligned with real assemblers that
    /// buffer constant pools.
    pub fn flush_buffer(&mut self) {}

    /// Marks emission complete. No further code may be appended, only
    /// patched.
    pub fn finish(&mut self) {
        debug_assert!(!self.finished);
        self.finished = true;
    }

    /// Whether all per-batch side-tables have been drained.
    pub fn side_tables_empty(&self) -> bool {
        self.call_sites.is_empty()
            && self.call_site_targets.is_empty()
            && self.trap_sites.is_empty()
            && self.call_far_jumps.is_empty()
            && self.trap_far_jumps.is_empty()
            && self.memory_accesses.is_empty()
            && self.symbolic_accesses.is_empty()
            && self.code_labels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halting_align_pads_with_halt() {
        let mut masm = MacroAssembler::new();
        masm.append_raw_code(&[0x90; 3]);
        masm.halting_align(CODE_ALIGNMENT);
        assert_eq!(masm.size(), CODE_ALIGNMENT);
        assert!(masm.bytes()[3..].iter().all(|&b| b == 0xCC));
    }

    #[test]
    fn patch_call_writes_relative_displacement() {
        let mut masm = MacroAssembler::new();
        let ret = masm.call_site(CallSiteKind::Func, CallSiteTarget::None);
        masm.append_raw_code(&[0x90; 11]);
        masm.patch_call(ret, 16);
        let disp = i32::from_le_bytes(masm.bytes()[1..5].try_into().unwrap());
        assert_eq!(ret as i64 + disp as i64, 16);
    }

    #[test]
    fn far_jump_slot_round_trips() {
        let mut masm = MacroAssembler::new();
        let jump = masm.far_jump_with_patch();
        assert_eq!(masm.size(), FAR_JUMP_LENGTH);
        masm.patch_far_jump(jump, 0xDEAD_BEEF);
        let at = jump.0 as usize;
        let slot = u64::from_le_bytes(masm.bytes()[at..at + 8].try_into().unwrap());
        assert_eq!(slot, 0xDEAD_BEEF);
    }

    #[test]
    fn load_ptr_is_fixed_length() {
        let mut masm = MacroAssembler::new();
        masm.load_ptr(Address::frame(FRAME_TLS_OFFSET), Reg::Tls);
        assert_eq!(masm.size(), LOAD_PTR_LENGTH);
    }
}
