//! Tunable parameters for module generation.

use serde::{Deserialize, Serialize};

/// Knobs controlling batching, patching and debug capture.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tunables {
    /// A baseline task is dispatched once it has batched more than this many
    /// bytes of bytecode.
    pub batch_baseline_threshold: usize,

    /// Same, for the optimizing tier. Much smaller: optimizing compilation
    /// is slow enough that small batches keep all workers busy.
    pub batch_optimized_threshold: usize,

    /// Upper bound on how far apart a call and its callee may be before the
    /// patcher inserts a far-jump island. The effective range is the minimum
    /// of this and the ISA displacement bound; lowering it forces islands,
    /// which tests rely on.
    pub jump_threshold: u32,

    /// Whether to capture debug artifacts (per-function types, the
    /// function-to-code-range map, a bytecode hash, an unprotected copy of
    /// the code).
    pub debug_enabled: bool,

    /// Whether compilation tasks may be handed to a worker pool at all.
    pub parallel_compilation: bool,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            // Batching sweet spots: large enough to amortize per-task
            // overhead, small enough to pipeline compile and link.
            batch_baseline_threshold: 10_000,
            batch_optimized_threshold: 1_100,

            // No artificial limit; the ISA bound applies. The bound already
            // leaves slack for the return-address approximation of caller
            // offsets.
            jump_threshold: u32::MAX,

            debug_enabled: false,
            parallel_compilation: true,
        }
    }
}
