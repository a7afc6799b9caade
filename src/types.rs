//! Value types, function signatures, traps and symbolic addresses.

use serde::{Deserialize, Serialize};

/// The type of a WebAssembly value.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValType {
    /// 32-bit integer.
    I32,
    /// 64-bit integer.
    I64,
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
    /// 128-bit SIMD vector.
    V128,
}

impl ValType {
    /// Storage width of a value of this type in the global data area.
    pub fn byte_size(self) -> u32 {
        match self {
            ValType::I32 | ValType::F32 => 4,
            ValType::I64 | ValType::F64 => 8,
            ValType::V128 => 16,
        }
    }

    fn immediate_code(self) -> u32 {
        match self {
            ValType::I32 => 0,
            ValType::I64 => 1,
            ValType::F32 => 2,
            ValType::F64 => 3,
            ValType::V128 => 4,
        }
    }
}

/// A function signature: parameter types and an optional result type.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FuncType {
    params: Box<[ValType]>,
    result: Option<ValType>,
}

/// How many parameters an immediate signature id can describe. Each parameter
/// takes `IMMEDIATE_TYPE_BITS` bits and the whole id must fit a `u32` with the
/// tag bit clear.
const IMMEDIATE_MAX_PARAMS: usize = 8;
const IMMEDIATE_TYPE_BITS: u32 = 3;

impl FuncType {
    /// Creates a signature from parameter types and an optional result.
    pub fn new(params: impl Into<Box<[ValType]>>, result: Option<ValType>) -> FuncType {
        FuncType {
            params: params.into(),
            result,
        }
    }

    /// The parameter types, in order.
    pub fn params(&self) -> &[ValType] {
        &self.params
    }

    /// The result type, if the function returns a value.
    pub fn result(&self) -> Option<ValType> {
        self.result
    }

    /// Packs this signature into an immediate id, if it is small enough.
    ///
    /// Signature checks at indirect call sites compare ids. Small signatures
    /// encode directly into a compare-immediate; the rest get a pointer-sized
    /// slot in the global data area and compare by address.
    pub fn immediate_id(&self) -> Option<u32> {
        if self.params.len() > IMMEDIATE_MAX_PARAMS {
            return None;
        }
        // Tag bit 0 distinguishes immediate ids from global-slot addresses,
        // which are pointer-aligned.
        let mut id: u32 = 1;
        let mut shift = 1;
        let result_code = match self.result {
            Some(ty) => ty.immediate_code() + 1,
            None => 0,
        };
        id |= result_code << shift;
        shift += IMMEDIATE_TYPE_BITS;
        for &param in self.params.iter() {
            id |= (param.immediate_code() + 1) << shift;
            shift += IMMEDIATE_TYPE_BITS;
        }
        debug_assert!(shift <= 32);
        Some(id)
    }
}

/// How a signature id is represented at indirect call sites.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SigIdDesc {
    /// The id fits an instruction immediate.
    Immediate(u32),
    /// The id lives in a pointer-sized slot in the global data area.
    Global {
        /// Offset of the slot within the global data area.
        global_data_offset: u32,
    },
}

/// A signature together with its assigned id.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SigWithId {
    /// The signature itself.
    pub ty: FuncType,
    /// The id assigned during module generation. `None` until the generator
    /// has run its init step.
    pub id: Option<SigIdDesc>,
}

impl SigWithId {
    /// Wraps a signature with no id assigned yet.
    pub fn new(ty: FuncType) -> SigWithId {
        SigWithId { ty, id: None }
    }
}

/// A predefined runtime exception kind. Every trap shares one handler entry
/// per module, reached through a trap-exit stub.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Trap {
    /// The `unreachable` instruction was executed.
    Unreachable,
    /// Signed integer overflow in division or conversion.
    IntegerOverflow,
    /// Integer division by zero.
    IntegerDivideByZero,
    /// Float-to-integer conversion out of range.
    InvalidConversionToInteger,
    /// Indirect call through a null table entry.
    IndirectCallToNull,
    /// Indirect call signature mismatch.
    IndirectCallBadSig,
    /// Linear memory access out of bounds.
    OutOfBounds,
    /// Misaligned atomic access.
    UnalignedAccess,
    /// Call stack exhausted.
    StackOverflow,
    /// An exception was already reported to the embedder.
    ThrowReported,
}

impl Trap {
    /// All trap kinds, in index order.
    pub const ALL: [Trap; 10] = [
        Trap::Unreachable,
        Trap::IntegerOverflow,
        Trap::IntegerDivideByZero,
        Trap::InvalidConversionToInteger,
        Trap::IndirectCallToNull,
        Trap::IndirectCallBadSig,
        Trap::OutOfBounds,
        Trap::UnalignedAccess,
        Trap::StackOverflow,
        Trap::ThrowReported,
    ];

    /// Number of trap kinds.
    pub const COUNT: usize = Self::ALL.len();

    /// Dense index of this trap, for per-trap arrays.
    pub fn index(self) -> usize {
        Self::ALL.iter().position(|&t| t == self).unwrap()
    }
}

/// A named runtime helper whose address is only known at load time. Emitted
/// code refers to these through patchable slots recorded as symbolic links.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SymbolicAddress {
    /// Grow linear memory.
    MemoryGrow,
    /// Current linear memory size.
    MemorySize,
    /// Blocking wait on a 32-bit location.
    WaitI32,
    /// Blocking wait on a 64-bit location.
    WaitI64,
    /// Wake waiters on a location.
    Wake,
    /// Report a trap to the embedder.
    ReportTrap,
    /// Enter the debugger on a debug trap.
    HandleDebugTrap,
    /// Unwind to the nearest exception handler.
    HandleThrow,
}

impl SymbolicAddress {
    /// All symbolic addresses, in index order.
    pub const ALL: [SymbolicAddress; 8] = [
        SymbolicAddress::MemoryGrow,
        SymbolicAddress::MemorySize,
        SymbolicAddress::WaitI32,
        SymbolicAddress::WaitI64,
        SymbolicAddress::Wake,
        SymbolicAddress::ReportTrap,
        SymbolicAddress::HandleDebugTrap,
        SymbolicAddress::HandleThrow,
    ];

    /// Number of symbolic addresses.
    pub const COUNT: usize = Self::ALL.len();

    /// Dense index of this symbolic address.
    pub fn index(self) -> usize {
        Self::ALL.iter().position(|&s| s == self).unwrap()
    }
}

/// A compilation quality level.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// Fast single-pass compilation.
    Baseline,
    /// Optimizing compilation.
    Optimized,
}

/// Which role a generator run plays in the (up to) two-tier workflow.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompileMode {
    /// A single compilation produces the only tier.
    Once,
    /// First of two tiers; the module gets a jump table so tier 2 can be
    /// patched in later.
    Tier1,
    /// Second tier, re-invoked on an existing module.
    Tier2,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_ids_distinguish_signatures() {
        let a = FuncType::new(vec![ValType::I32], Some(ValType::I32));
        let b = FuncType::new(vec![ValType::I32], Some(ValType::I64));
        let c = FuncType::new(vec![ValType::I32, ValType::I32], Some(ValType::I32));
        let ids = [
            a.immediate_id().unwrap(),
            b.immediate_id().unwrap(),
            c.immediate_id().unwrap(),
        ];
        assert_ne!(ids[0], ids[1]);
        assert_ne!(ids[0], ids[2]);
        assert_ne!(ids[1], ids[2]);
        // Tag bit set on every immediate id.
        for id in ids {
            assert_eq!(id & 1, 1);
        }
    }

    #[test]
    fn large_signatures_are_not_immediate() {
        let big = FuncType::new(vec![ValType::I64; 9], None);
        assert!(big.immediate_id().is_none());
    }

    #[test]
    fn trap_indices_are_dense() {
        for (i, t) in Trap::ALL.iter().enumerate() {
            assert_eq!(t.index(), i);
        }
    }
}
