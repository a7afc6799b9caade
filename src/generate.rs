//! The module generator: batches function bodies into compilation tasks,
//! splices each task's code into one master buffer, patches inter-function
//! and trap-exit calls (inserting far-jump islands where a direct call would
//! leave the ISA's branch range), and finalizes the code image with its
//! export, relocation and metadata tables.
//!
//! One coordinator thread owns the generator and is the sole writer of the
//! master buffer and the module-global side-tables. Workers own the task
//! they execute and touch nothing else except the shared
//! [`CompileTaskState`]. Code lands in the master buffer in task-completion
//! order; `func_to_code_range` absorbs the resulting permutation.

use crate::code::{
    CallFarJump, CallSiteKind, CallSiteTarget, CodeRange, CodeRangeKind, CompiledCode, TrapFarJump,
};
use crate::compiler::{CompileError, Compiler};
use crate::env::{EntityItem, ModuleEnvironment};
use crate::indices::{CodeRangeIndex, FuncIndex};
use crate::masm::{
    Address, CodeOffset, MacroAssembler, Reg, CODE_ALIGNMENT, FRAME_TLS_OFFSET,
    JUMP_IMMEDIATE_RANGE,
};
use crate::metadata::{
    align_up, FuncExport, FuncImport, InternalLink, LinkDataTier, Metadata, MetadataTier,
    ModuleHash, PAGE_SIZE,
};
use crate::module::{CodeSegment, CompiledTier, JumpTable, Module};
use crate::task::{execute_compile_task, CompileTask, CompileTaskState, FuncCompileInput};
use crate::tunables::Tunables;
use crate::types::{CompileMode, SigIdDesc, Tier, Trap};
use crate::workers::{QueuedJob, WorkerPool};
use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::{EntityRef, SecondaryMap};
use more_asserts::{assert_ge, debug_assert_ge};
use std::collections::{HashMap, HashSet};
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Pointer size of the target, used for global-data alignment.
const PTR_SIZE: u32 = 8;

/// Size of a function import's TLS record: code pointer, baseline script,
/// instance TLS and callee object.
const FUNC_IMPORT_TLS_SIZE: u32 = 4 * PTR_SIZE;

/// Size of a table's TLS record: length and elements pointer.
const TABLE_TLS_SIZE: u32 = 2 * PTR_SIZE;

/// Conservative estimate of compiled code size for a bytecode section, used
/// to reserve the master buffer up front. Resizes are expensive enough that
/// over-reserving by 20% on top of this is still the cheaper bet.
fn estimate_compiled_code_size(tier: Tier, bytecode_size: usize) -> usize {
    match tier {
        Tier::Baseline => bytecode_size * 5,
        Tier::Optimized => bytecode_size * 4,
    }
}

/// Everything the embedder hands the generator besides the module itself.
#[derive(Clone)]
pub struct CompileArgs {
    /// Generation knobs.
    pub tunables: Tunables,
    /// The function compiler and stub generator.
    pub compiler: Arc<dyn Compiler>,
    /// The worker pool for parallel compilation, if any.
    pub workers: Option<Arc<WorkerPool>>,
    /// Cooperative cancellation flag, if the embedder wants one.
    pub cancelled: Option<Arc<AtomicBool>>,
    /// Source filename for metadata.
    pub filename: Option<String>,
}

/// Orchestrates module generation.
///
/// Drive it in exactly this order:
///
/// ```text
/// new -> start_func_defs -> compile_func_def* -> finish_func_defs
///     -> finish_module | finish_tier2
/// ```
pub struct ModuleGenerator {
    tunables: Tunables,
    compiler: Arc<dyn Compiler>,
    workers: Option<Arc<WorkerPool>>,
    cancelled: Option<Arc<AtomicBool>>,

    env: Arc<ModuleEnvironment>,
    metadata: Metadata,
    metadata_tier: MetadataTier,
    link_data: LinkDataTier,

    masm: MacroAssembler,
    func_to_code_range: SecondaryMap<FuncIndex, PackedOption<CodeRangeIndex>>,
    exported_funcs: HashSet<FuncIndex>,

    call_site_targets: Vec<CallSiteTarget>,
    call_far_jumps: Vec<CallFarJump>,
    trap_far_jumps: Vec<TrapFarJump>,
    debug_trap_far_jumps: Vec<CodeOffset>,
    trap_code_offsets: [Option<u32>; Trap::COUNT],
    debug_trap_code_offset: Option<u32>,
    last_patched_call_site: usize,
    start_of_unpatched_callsites: u32,

    task_state: Arc<CompileTaskState>,
    parallel: bool,
    outstanding: usize,
    current_task: Option<CompileTask>,
    free_tasks: Vec<CompileTask>,
    batched_bytecode: usize,
    num_func_defs: usize,
    started_func_defs: bool,
    finished_func_defs: bool,
}

fn allocate_global_bytes(
    global_data_length: &mut u32,
    bytes: u32,
    align: u32,
) -> Result<u32, CompileError> {
    let offset = global_data_length
        .checked_add(align - 1)
        .map(|n| n & !(align - 1))
        .ok_or(CompileError::GlobalDataOverflow)?;
    *global_data_length = offset
        .checked_add(bytes)
        .ok_or(CompileError::GlobalDataOverflow)?;
    Ok(offset)
}

impl ModuleGenerator {
    /// Creates a generator and lays out the module's global data area:
    /// import TLS records in import order, then table TLS records, then
    /// global signature-id slots, then mutable globals at natural alignment.
    /// Also seeds the exported-function set with the explicit exports and
    /// the start function.
    pub fn new(
        args: CompileArgs,
        mut env: ModuleEnvironment,
        code_section_size: usize,
    ) -> Result<ModuleGenerator, CompileError> {
        let mut metadata = Metadata::default();
        let mut metadata_tier = MetadataTier::new(env.tier);

        let mut masm = MacroAssembler::new();
        masm.reserve(estimate_compiled_code_size(env.tier, code_section_size) * 6 / 5);

        // Only the number of far-jump islands is unknown; twice the function
        // count is comfortably past it, and shrink-to-fit trims the rest at
        // finalization.
        metadata_tier.code_ranges.reserve(2 * env.num_func_defs());

        // About one call and one load/store per 10 bytes of bytecode.
        metadata_tier.call_sites.reserve(code_section_size / 10);
        metadata_tier.memory_accesses.reserve(code_section_size / 10);

        let mut global_data_length = 0u32;

        let num_func_imports = env.num_func_imports as usize;
        env.func_import_global_data_offsets
            .resize(num_func_imports, None);
        for i in 0..num_func_imports {
            let offset =
                allocate_global_bytes(&mut global_data_length, FUNC_IMPORT_TLS_SIZE, PTR_SIZE)?;
            env.func_import_global_data_offsets[i] = Some(offset);
            let sig = env.func_sig(FuncIndex::new(i)).ty.clone();
            metadata_tier.func_imports.push(FuncImport::new(sig, offset));
        }

        for table in env.tables.values_mut() {
            table.global_data_offset = Some(allocate_global_bytes(
                &mut global_data_length,
                TABLE_TLS_SIZE,
                PTR_SIZE,
            )?);
        }

        for sig in env.signatures.values_mut() {
            debug_assert!(sig.id.is_none());
            match sig.ty.immediate_id() {
                Some(id) => sig.id = Some(SigIdDesc::Immediate(id)),
                None => {
                    let offset =
                        allocate_global_bytes(&mut global_data_length, PTR_SIZE, PTR_SIZE)?;
                    let id = SigIdDesc::Global {
                        global_data_offset: offset,
                    };
                    sig.id = Some(id);
                    metadata.sig_ids.push((sig.ty.clone(), id));
                }
            }
        }

        for global in env.globals.values_mut() {
            if global.is_constant() {
                continue;
            }
            let width = global.ty.byte_size();
            global.offset = Some(allocate_global_bytes(&mut global_data_length, width, width)?);
        }

        metadata.global_data_length = global_data_length;

        let mut exported_funcs = HashSet::new();
        for item in env.exports.values() {
            if let EntityItem::Func(func_index) = *item {
                exported_funcs.insert(func_index);
            }
        }
        if let Some(start) = env.start_func {
            metadata.start_func_index = Some(start);
            exported_funcs.insert(start);
        }

        metadata.filename = args.filename.clone();

        Ok(ModuleGenerator {
            tunables: args.tunables,
            compiler: args.compiler,
            workers: args.workers,
            cancelled: args.cancelled,
            env: Arc::new(env),
            metadata,
            metadata_tier,
            link_data: Default::default(),
            masm,
            func_to_code_range: SecondaryMap::new(),
            exported_funcs,
            call_site_targets: Vec::new(),
            call_far_jumps: Vec::new(),
            trap_far_jumps: Vec::new(),
            debug_trap_far_jumps: Vec::new(),
            trap_code_offsets: [None; Trap::COUNT],
            debug_trap_code_offset: None,
            last_patched_call_site: 0,
            start_of_unpatched_callsites: 0,
            task_state: Arc::new(CompileTaskState::default()),
            parallel: false,
            outstanding: 0,
            current_task: None,
            free_tasks: Vec::new(),
            batched_bytecode: 0,
            num_func_defs: 0,
            started_func_defs: false,
            finished_func_defs: false,
        })
    }

    /// The frozen module environment.
    pub fn env(&self) -> &ModuleEnvironment {
        &self.env
    }

    fn tier(&self) -> Tier {
        self.env.tier
    }

    fn mode(&self) -> CompileMode {
        self.env.mode
    }

    fn cancelled(&self) -> bool {
        self.cancelled
            .as_ref()
            .map_or(false, |c| c.load(Ordering::Relaxed))
    }

    fn branch_range(&self) -> u32 {
        self.tunables.jump_threshold.min(JUMP_IMMEDIATE_RANGE)
    }

    /// Whether a branch between the two offsets stays in displacement range.
    /// Caller offsets are approximated by return addresses; the range
    /// carries enough slack for that.
    fn in_range(&self, caller: u32, callee: u32) -> bool {
        let range = self.branch_range();
        if caller < callee {
            callee - caller < range
        } else {
            caller - callee < range
        }
    }

    fn func_is_compiled(&self, func_index: FuncIndex) -> bool {
        self.func_to_code_range[func_index].is_some()
    }

    fn func_code_range(&self, func_index: FuncIndex) -> &CodeRange {
        let index = self.func_to_code_range[func_index]
            .expand()
            .expect("function is compiled");
        let cr = &self.metadata_tier.code_ranges[index.index()];
        debug_assert!(cr.is_function());
        cr
    }

    /// Decides serial vs parallel compilation and builds the task pool:
    /// twice the worker count when parallel (so compilation pipelines with
    /// linking), one task when serial.
    pub fn start_func_defs(&mut self) {
        debug_assert!(!self.started_func_defs);
        debug_assert!(!self.finished_func_defs);

        let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
        let num_tasks = match &self.workers {
            Some(pool)
                if self.tunables.parallel_compilation && pool.num_threads() >= 2 && cores > 1 =>
            {
                self.parallel = true;
                2 * pool.num_threads()
            }
            _ => 1,
        };
        log::debug!(
            "starting function definitions: {} task(s), parallel={}",
            num_tasks,
            self.parallel
        );

        self.free_tasks.reserve(num_tasks);
        for _ in 0..num_tasks {
            self.free_tasks
                .push(CompileTask::new(self.env.clone(), self.task_state.clone()));
        }

        self.started_func_defs = true;
    }

    /// Appends one function body to the current batch, dispatching the batch
    /// once it crosses the tier's bytecode threshold. Blocks only when every
    /// task is in flight.
    pub fn compile_func_def(
        &mut self,
        func_index: FuncIndex,
        line_or_bytecode: u32,
        bytes: Vec<u8>,
        line_nums: Vec<u32>,
    ) -> Result<(), CompileError> {
        debug_assert!(self.started_func_defs);
        debug_assert!(!self.finished_func_defs);
        debug_assert!(func_index.index() < self.env.num_funcs());
        debug_assert!(!self.env.is_imported_function(func_index));

        self.num_func_defs += 1;

        if self.current_task.is_none() {
            if self.free_tasks.is_empty() {
                self.finish_outstanding_task()?;
            }
            self.current_task = self.free_tasks.pop();
        }

        let func_bytecode_length = bytes.len();
        self.current_task
            .as_mut()
            .unwrap()
            .inputs
            .push(FuncCompileInput {
                func_index,
                line_or_bytecode,
                bytes,
                line_nums,
            });

        let threshold = match self.tier() {
            Tier::Baseline => self.tunables.batch_baseline_threshold,
            Tier::Optimized => self.tunables.batch_optimized_threshold,
        };

        self.batched_bytecode += func_bytecode_length;
        if self.batched_bytecode <= threshold {
            Ok(())
        } else {
            self.launch_batch_compile()
        }
    }

    fn launch_batch_compile(&mut self) -> Result<(), CompileError> {
        debug_assert!(self.current_task.is_some());

        if self.cancelled() {
            return Err(CompileError::Cancelled);
        }

        let mut task = self.current_task.take().unwrap();
        log::trace!(
            "launching batch of {} function(s), {} bytecode bytes",
            task.inputs.len(),
            self.batched_bytecode
        );

        if self.parallel {
            let pool = self.workers.as_ref().unwrap();
            pool.submit(QueuedJob {
                task,
                compiler: self.compiler.clone(),
            });
            self.outstanding += 1;
        } else {
            execute_compile_task(&mut task, &*self.compiler)?;
            self.finish_task(task)?;
        }

        self.batched_bytecode = 0;
        Ok(())
    }

    /// Waits for one outstanding task to complete or any task to fail, then
    /// links the completed task.
    fn finish_outstanding_task(&mut self) -> Result<(), CompileError> {
        debug_assert!(self.parallel);

        let task = {
            let mut inner = self.task_state.mutex.lock().unwrap();
            loop {
                debug_assert!(self.outstanding > 0);

                if inner.num_failed > 0 {
                    let err = inner
                        .error
                        .take()
                        .unwrap_or_else(|| CompileError::Codegen("worker failed".to_string()));
                    return Err(err);
                }

                if let Some(task) = inner.finished.pop() {
                    self.outstanding -= 1;
                    break task;
                }

                inner = self.task_state.failed_or_finished.wait(inner).unwrap();
            }
        };

        // Link outside the lock.
        self.finish_task(task)
    }

    /// Links one completed task's output into the master buffer and returns
    /// the task to the free list.
    fn finish_task(&mut self, mut task: CompileTask) -> Result<(), CompileError> {
        self.masm.halting_align(CODE_ALIGNMENT);

        // If appending this output could carry earlier call sites out of
        // branch range, patch them now, while islands between function
        // bodies can still reach both sides.
        let projected_end = self.masm.size() as u64 + task.output.bytes.len() as u64;
        let projected_end = u32::try_from(projected_end).map_err(|_| CompileError::CodeTooLarge)?;
        if !self.in_range(self.start_of_unpatched_callsites, projected_end) {
            self.start_of_unpatched_callsites = self.masm.size();
            self.link_call_sites()?;
        }

        self.link_compiled_code(&task.output)?;

        task.output.clear();
        debug_assert!(task.inputs.is_empty());
        debug_assert!(task.output.is_empty());
        self.free_tasks.push(task);
        Ok(())
    }

    /// Splices a `CompiledCode` into the master buffer, rebasing every
    /// recorded offset by the append position.
    fn link_compiled_code(&mut self, code: &CompiledCode) -> Result<(), CompileError> {
        self.masm.halting_align(CODE_ALIGNMENT);
        let offset_in_module = self.masm.size();
        self.masm.append_raw_code(&code.bytes);
        if self.masm.oom() {
            return Err(CompileError::CodeTooLarge);
        }

        for range in &code.code_ranges {
            let mut range = *range;
            range.offset_by(offset_in_module);
            let index = CodeRangeIndex::new(self.metadata_tier.code_ranges.len());
            self.note_code_range(index, &range);
            self.metadata_tier.code_ranges.push(range);
        }

        for call_site in &code.call_sites {
            let mut call_site = *call_site;
            call_site.offset_by(offset_in_module);
            self.metadata_tier.call_sites.push(call_site);
        }

        self.call_site_targets
            .extend_from_slice(&code.call_site_targets);
        debug_assert_eq!(
            self.call_site_targets.len(),
            self.metadata_tier.call_sites.len()
        );

        // Tasks drain trap sites into out-of-line trap calls before handing
        // code back.
        assert!(code.trap_sites.is_empty());

        for far_jump in &code.trap_far_jumps {
            let mut far_jump = *far_jump;
            far_jump.offset_by(offset_in_module);
            self.trap_far_jumps.push(far_jump);
        }

        for far_jump in &code.call_far_jumps {
            let mut far_jump = *far_jump;
            far_jump.offset_by(offset_in_module);
            self.call_far_jumps.push(far_jump);
        }

        for access in &code.memory_accesses {
            let mut access = *access;
            access.offset_by(offset_in_module);
            self.metadata_tier.memory_accesses.push(access);
        }

        for access in &code.symbolic_accesses {
            self.link_data.symbolic_links[access.target]
                .push(offset_in_module + access.patch_at.0);
        }

        for label in &code.code_labels {
            self.link_data.internal_links.push(InternalLink {
                patch_at_offset: offset_in_module + label.patch_at.0,
                target_offset: offset_in_module + label.target.0,
            });
        }

        Ok(())
    }

    /// Applies the per-kind side effect of a newly appended code range.
    fn note_code_range(&mut self, index: CodeRangeIndex, range: &CodeRange) {
        match range.kind {
            CodeRangeKind::Function { func_index } => {
                assert!(
                    self.func_to_code_range[func_index].is_none(),
                    "function compiled twice"
                );
                self.func_to_code_range[func_index] = Some(index).into();
            }
            CodeRangeKind::Entry { func_index } => {
                self.metadata_tier
                    .lookup_func_export_mut(func_index)
                    .init_entry_offset(range.begin);
            }
            CodeRangeKind::ImportJitExit { func_index } => {
                self.metadata_tier.func_imports[func_index.index()]
                    .init_jit_exit_offset(range.begin);
            }
            CodeRangeKind::ImportInterpExit { func_index } => {
                self.metadata_tier.func_imports[func_index.index()]
                    .init_interp_exit_offset(range.begin);
            }
            CodeRangeKind::TrapExit { trap } => {
                assert!(
                    self.trap_code_offsets[trap.index()].is_none(),
                    "trap exit noted twice"
                );
                self.trap_code_offsets[trap.index()] = Some(range.begin);
            }
            CodeRangeKind::DebugTrap => {
                assert!(self.debug_trap_code_offset.is_none());
                self.debug_trap_code_offset = Some(range.begin);
            }
            CodeRangeKind::OutOfBoundsExit => {
                assert!(self.link_data.out_of_bounds_offset.is_none());
                self.link_data.out_of_bounds_offset = Some(range.begin);
            }
            CodeRangeKind::UnalignedExit => {
                assert!(self.link_data.unaligned_access_offset.is_none());
                self.link_data.unaligned_access_offset = Some(range.begin);
            }
            CodeRangeKind::Interrupt => {
                assert!(self.link_data.interrupt_offset.is_none());
                self.link_data.interrupt_offset = Some(range.begin);
            }
            // Only ever jumped to.
            CodeRangeKind::Throw => {}
            CodeRangeKind::FarJumpIsland | CodeRangeKind::BuiltinThunk => {
                panic!("unexpected code range kind: {:?}", range.kind)
            }
        }
    }

    /// Walks call sites not yet patched, patching direct calls and
    /// synthesizing far-jump islands for everything out of range. Islands
    /// are shared within one pass; a later pass may need its own island for
    /// the same callee, since keeping old islands in range of future call
    /// sites would defeat their purpose.
    fn link_call_sites(&mut self) -> Result<(), CompileError> {
        self.masm.halting_align(CODE_ALIGNMENT);

        let mut existing_call_far_jumps: HashMap<FuncIndex, u32> = HashMap::new();
        let mut existing_trap_far_jumps: [Option<u32>; Trap::COUNT] = [None; Trap::COUNT];
        let first_unpatched = self.last_patched_call_site;

        while self.last_patched_call_site < self.metadata_tier.call_sites.len() {
            let call_site = self.metadata_tier.call_sites[self.last_patched_call_site];
            let target = self.call_site_targets[self.last_patched_call_site];
            let caller_offset = call_site.ret_addr_offset;

            match call_site.kind {
                // Patched at runtime or by the symbolic/internal linker.
                CallSiteKind::Dynamic | CallSiteKind::Symbolic => {}

                CallSiteKind::Func => {
                    let func_index = match target {
                        CallSiteTarget::Func(i) => i,
                        _ => panic!("direct call site without function target"),
                    };

                    if self.func_is_compiled(func_index) {
                        let callee_offset = self.func_code_range(func_index).func_normal_entry();
                        if self.in_range(caller_offset, callee_offset) {
                            self.masm.patch_call(caller_offset, callee_offset);
                            self.last_patched_call_site += 1;
                            continue;
                        }
                    }

                    let island_entry = match existing_call_far_jumps.get(&func_index) {
                        Some(&entry) => entry,
                        None => {
                            let begin = self.masm.current_offset();
                            let jump = self.masm.far_jump_with_patch();
                            let end = self.masm.current_offset();
                            if self.masm.oom() {
                                return Err(CompileError::CodeTooLarge);
                            }
                            self.call_far_jumps.push(CallFarJump { func_index, jump });
                            self.metadata_tier.code_ranges.push(CodeRange::new(
                                CodeRangeKind::FarJumpIsland,
                                begin,
                                end,
                            ));
                            existing_call_far_jumps.insert(func_index, begin);
                            begin
                        }
                    };

                    self.masm.patch_call(caller_offset, island_entry);
                }

                CallSiteKind::TrapExit => {
                    let trap = match target {
                        CallSiteTarget::Trap(t) => t,
                        _ => panic!("trap-exit call site without trap target"),
                    };

                    if existing_trap_far_jumps[trap.index()].is_none() {
                        let begin = self.masm.current_offset();
                        // Out-of-line trap paths may have clobbered the TLS
                        // register; restore it from the frame before leaving.
                        self.masm
                            .load_ptr(Address::frame(FRAME_TLS_OFFSET), Reg::Tls);
                        let jump = self.masm.far_jump_with_patch();
                        let end = self.masm.current_offset();
                        if self.masm.oom() {
                            return Err(CompileError::CodeTooLarge);
                        }
                        self.trap_far_jumps.push(TrapFarJump { trap, jump });
                        self.metadata_tier.code_ranges.push(CodeRange::new(
                            CodeRangeKind::FarJumpIsland,
                            begin,
                            end,
                        ));
                        existing_trap_far_jumps[trap.index()] = Some(begin);
                    }

                    self.masm
                        .patch_call(caller_offset, existing_trap_far_jumps[trap.index()].unwrap());
                }

                CallSiteKind::Breakpoint | CallSiteKind::EnterFrame | CallSiteKind::LeaveFrame => {
                    // The site itself stays unpatched: the breakpoint
                    // runtime searches the ordered island list for one in
                    // range of the probe.
                    let need_island = match self.metadata_tier.debug_trap_far_jump_offsets.last() {
                        Some(&last) => !self.in_range(last, caller_offset),
                        None => true,
                    };
                    if need_island {
                        let begin = self.masm.current_offset();
                        self.masm
                            .load_ptr(Address::frame(FRAME_TLS_OFFSET), Reg::Tls);
                        let jump = self.masm.far_jump_with_patch();
                        let end = self.masm.current_offset();
                        if self.masm.oom() {
                            return Err(CompileError::CodeTooLarge);
                        }
                        self.metadata_tier.code_ranges.push(CodeRange::new(
                            CodeRangeKind::FarJumpIsland,
                            begin,
                            end,
                        ));
                        self.debug_trap_far_jumps.push(jump);
                        self.metadata_tier.debug_trap_far_jump_offsets.push(begin);
                    }
                }
            }

            self.last_patched_call_site += 1;
        }

        if self.last_patched_call_site > first_unpatched {
            log::trace!(
                "patched call sites {}..{}, {} call island(s) this pass",
                first_unpatched,
                self.last_patched_call_site,
                existing_call_far_jumps.len()
            );
        }

        self.masm.flush_buffer();
        if self.masm.oom() {
            return Err(CompileError::CodeTooLarge);
        }
        Ok(())
    }

    /// Launches the partially filled batch, then drains every outstanding
    /// task.
    pub fn finish_func_defs(&mut self) -> Result<(), CompileError> {
        debug_assert!(self.started_func_defs);
        debug_assert!(!self.finished_func_defs);

        if self.current_task.is_some() {
            self.launch_batch_compile()?;
        }

        while self.outstanding > 0 {
            self.finish_outstanding_task()?;
        }

        debug_assert_eq!(self.num_func_defs, self.env.num_func_defs());
        self.finished_func_defs = true;
        Ok(())
    }

    /// Computes the exported-function set (explicit exports, the start
    /// function, and every element of an external table) and builds the
    /// export vector, sorted by function index for O(log n) lookup.
    fn finish_func_exports(&mut self) {
        for elems in &self.env.elem_segments {
            if self.env.tables[elems.table_index].external {
                for &func_index in &elems.elem_func_indices {
                    self.exported_funcs.insert(func_index);
                }
            }
        }

        let mut sorted: Vec<FuncIndex> = self.exported_funcs.iter().copied().collect();
        sorted.sort_unstable();

        debug_assert!(self.metadata_tier.func_exports.is_empty());
        self.metadata_tier.func_exports.reserve(sorted.len());
        for func_index in sorted {
            let sig = self.env.func_sig(func_index).ty.clone();
            self.metadata_tier
                .func_exports
                .push(FuncExport::new(sig, func_index));
        }
    }

    /// Final call-site pass, then resolution of every pending far jump.
    fn finish_linking(&mut self) -> Result<(), CompileError> {
        #[cfg(debug_assertions)]
        for i in 0..self.env.num_funcs() {
            let func_index = FuncIndex::new(i);
            if self.env.is_imported_function(func_index) {
                debug_assert!(self.func_to_code_range[func_index].is_none());
            } else {
                debug_assert!(
                    self.func_to_code_range[func_index].is_some(),
                    "function {:?} was never compiled",
                    func_index
                );
            }
        }

        // All functions and stubs are in place, so this pass patches every
        // remaining call, possibly emitting the last islands.
        self.link_call_sites()?;

        let call_far_jumps = mem::take(&mut self.call_far_jumps);
        for far in &call_far_jumps {
            let entry = self.func_code_range(far.func_index).func_normal_entry();
            self.masm.patch_far_jump(far.jump, entry);
        }

        let trap_far_jumps = mem::take(&mut self.trap_far_jumps);
        for far in &trap_far_jumps {
            let entry = self.trap_code_offsets[far.trap.index()].expect("trap exit noted");
            self.masm.patch_far_jump(far.jump, entry);
        }

        let debug_trap_far_jumps = mem::take(&mut self.debug_trap_far_jumps);
        if !debug_trap_far_jumps.is_empty() {
            let entry = self.debug_trap_code_offset.expect("debug trap stub noted");
            for &jump in &debug_trap_far_jumps {
                self.masm.patch_far_jump(jump, entry);
            }
        }

        // Linking and far-jump patching must not have produced any metadata
        // of their own.
        assert!(self.masm.side_tables_empty());

        self.masm.finish();
        if self.masm.oom() {
            return Err(CompileError::CodeTooLarge);
        }
        Ok(())
    }

    /// Copies environment data into the metadata, completes exports and
    /// element segments with code-range indices, and captures debug
    /// artifacts.
    fn finish_metadata(&mut self, bytecode: &[u8]) {
        #[cfg(debug_assertions)]
        {
            let mut last_end = 0;
            for range in &self.metadata_tier.code_ranges {
                debug_assert!(range.begin >= last_end);
                last_end = range.end;
            }
            let mut last_offset = 0;
            for &offset in &self.metadata_tier.debug_trap_far_jump_offsets {
                debug_assert!(offset >= last_offset);
                last_offset = offset;
            }
        }

        self.metadata.memory_usage = self.env.memory_usage;
        self.metadata.min_memory_length = self.env.min_memory_length;
        self.metadata.max_memory_length = self.env.max_memory_length;
        self.metadata.tables = self.env.tables.values().cloned().collect();
        self.metadata.globals = self.env.globals.values().cloned().collect();
        self.metadata.func_names = self.env.func_names.clone();
        self.metadata.custom_sections = self.env.custom_sections.clone();

        // The loader maps the global data area in whole pages.
        self.metadata.global_data_length =
            align_up(self.metadata.global_data_length, PAGE_SIZE);

        // These can carry a lot of excess capacity from the up-front
        // reservations.
        self.metadata_tier.memory_accesses.shrink_to_fit();
        self.metadata_tier.code_ranges.shrink_to_fit();
        self.metadata_tier.call_sites.shrink_to_fit();
        self.metadata_tier.debug_trap_far_jump_offsets.shrink_to_fit();

        for fe in &mut self.metadata_tier.func_exports {
            let index = self.func_to_code_range[fe.func_index()]
                .expand()
                .expect("exported function compiled");
            fe.init_code_range_index(index);
        }

        debug_assert!(self.metadata_tier.elem_code_range_indices.is_empty());
        for elems in &self.env.elem_segments {
            let indices = elems
                .elem_func_indices
                .iter()
                .map(|&f| self.func_to_code_range[f].expand().expect("element compiled"))
                .collect();
            self.metadata_tier.elem_code_range_indices.push(indices);
        }

        if self.tunables.debug_enabled {
            self.metadata.debug_enabled = true;

            let num_funcs = self.env.num_funcs();
            self.metadata.debug_func_arg_types.reserve(num_funcs);
            self.metadata.debug_func_return_types.reserve(num_funcs);
            for i in 0..num_funcs {
                let sig = &self.env.func_sig(FuncIndex::new(i)).ty;
                self.metadata
                    .debug_func_arg_types
                    .push(sig.params().to_vec());
                self.metadata.debug_func_return_types.push(sig.result());
            }

            self.metadata_tier.debug_func_to_code_range = (0..num_funcs)
                .map(|i| self.func_to_code_range[FuncIndex::new(i)].expand())
                .collect();

            self.metadata.debug_hash = module_hash(bytecode);
        }
    }

    /// Generates and links the stubs, runs final linking and metadata
    /// finalization, and takes the finished code out of the assembler.
    fn finish_code_segment(&mut self, bytecode: &[u8]) -> Result<CodeSegment, CompileError> {
        debug_assert!(self.finished_func_defs);

        self.finish_func_exports();

        // With imports and exports final, the stubs can be generated and
        // linked like one more task's output.
        let mut stub_code = CompiledCode::default();
        self.compiler.compile_stubs(
            &self.env,
            &self.metadata_tier.func_imports,
            &self.metadata_tier.func_exports,
            &mut stub_code,
        )?;
        self.link_compiled_code(&stub_code)?;

        // Linking can emit far-jump stubs of its own, so it must run before
        // the metadata is sealed.
        self.finish_linking()?;
        self.finish_metadata(bytecode);

        let bytes = self.masm.take_bytes();
        log::debug!(
            "code segment finished: {} bytes, {} code ranges, {} call sites",
            bytes.len(),
            self.metadata_tier.code_ranges.len(),
            self.metadata_tier.call_sites.len()
        );
        Ok(CodeSegment::new(self.tier(), bytes))
    }

    fn create_jump_table(&self, segment: &CodeSegment) -> JumpTable {
        debug_assert_eq!(self.mode(), CompileMode::Tier1);

        let mut table = JumpTable::new(self.env.num_funcs());
        let base = segment.base() as usize;
        for range in &self.metadata_tier.code_ranges {
            if range.is_function() {
                table.set(range.func_index(), base + range.func_tier_entry() as usize);
            }
        }
        table
    }

    /// Produces the final module: code segment, metadata, link data, and for
    /// tier-1 runs the jump table that lets tier-2 entries be patched in.
    pub fn finish_module(mut self, bytecode: &[u8]) -> Result<Module, CompileError> {
        assert!(matches!(
            self.mode(),
            CompileMode::Once | CompileMode::Tier1
        ));

        let segment = self.finish_code_segment(bytecode)?;

        let jump_table = if self.mode() == CompileMode::Tier1 {
            Some(self.create_jump_table(&segment))
        } else {
            None
        };

        // Debuggers want the code before the loader protects and relocates
        // it.
        let debug_bytes = if self.tunables.debug_enabled {
            debug_assert_eq!(self.mode(), CompileMode::Once);
            Some(segment.bytes().to_vec().into_boxed_slice())
        } else {
            None
        };

        let tier1 = CompiledTier {
            segment,
            metadata: mem::take(&mut self.metadata_tier),
            link_data: mem::take(&mut self.link_data),
        };

        Ok(Module::new(
            mem::take(&mut self.metadata),
            tier1,
            jump_table,
            debug_bytes,
            self.env.imports.clone(),
            self.env.exports.clone(),
            self.env.data_segments.clone(),
            self.env.elem_segments.clone(),
            bytecode.into(),
        ))
    }

    /// Completes a tier-2 run by installing its code into an existing
    /// module.
    pub fn finish_tier2(mut self, module: &mut Module) -> Result<(), CompileError> {
        assert_eq!(self.mode(), CompileMode::Tier2);
        assert_eq!(self.tier(), Tier::Optimized);
        assert!(!self.tunables.debug_enabled);

        if self.cancelled() {
            return Err(CompileError::Cancelled);
        }

        let bytecode = module.bytecode().clone();
        let segment = self.finish_code_segment(&bytecode)?;

        module.finish_tier2(CompiledTier {
            segment,
            metadata: mem::take(&mut self.metadata_tier),
            link_data: mem::take(&mut self.link_data),
        });
        Ok(())
    }
}

impl Drop for ModuleGenerator {
    /// Drains work still in flight: pulls this generator's not-yet-started
    /// tasks back out of the worker queue by identity of the shared task
    /// state, then waits for the rest to report.
    fn drop(&mut self) {
        if !self.parallel {
            debug_assert_eq!(self.outstanding, 0);
            return;
        }
        if self.outstanding == 0 {
            return;
        }

        if let Some(pool) = &self.workers {
            let state = self.task_state.clone();
            let removed = pool.remove_pending(|job| Arc::ptr_eq(&job.task.state, &state));
            debug_assert_ge!(self.outstanding, removed);
            self.outstanding -= removed;
        }

        let mut inner = self.task_state.mutex.lock().unwrap();
        loop {
            debug_assert_ge!(self.outstanding, inner.finished.len());
            self.outstanding -= inner.finished.len();
            inner.finished.clear();

            debug_assert_ge!(self.outstanding, inner.num_failed as usize);
            self.outstanding -= inner.num_failed as usize;
            inner.num_failed = 0;

            if self.outstanding == 0 {
                break;
            }

            inner = self.task_state.failed_or_finished.wait(inner).unwrap();
        }

        if let Some(error) = inner.error.take() {
            log::debug!("module generation abandoned with pending error: {}", error);
        }
    }
}

/// Hash of a module's bytecode, truncated into the fixed-size form kept in
/// metadata.
fn module_hash(bytecode: &[u8]) -> ModuleHash {
    use sha1::{Digest, Sha1};
    let digest = Sha1::digest(bytecode);
    let mut hash = ModuleHash::default();
    let len = hash.len();
    hash.copy_from_slice(&digest[..len]);
    hash
}

/// Drives a whole single-tier generation: construct, feed every body,
/// finish. Embedders with their own parser loop drive the generator
/// directly instead.
pub fn generate_module(
    args: CompileArgs,
    env: ModuleEnvironment,
    bodies: Vec<FuncCompileInput>,
    bytecode: &[u8],
) -> anyhow::Result<Module> {
    let code_section_size: usize = bodies.iter().map(|b| b.bytes.len()).sum();
    let mut generator = ModuleGenerator::new(args, env, code_section_size)?;
    generator.start_func_defs();
    for body in bodies {
        generator.compile_func_def(
            body.func_index,
            body.line_or_bytecode,
            body.bytes,
            body.line_nums,
        )?;
    }
    generator.finish_func_defs()?;
    Ok(generator.finish_module(bytecode)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_allocation_aligns_and_checks_overflow() {
        let mut len = 0;
        assert_eq!(allocate_global_bytes(&mut len, 4, 4).unwrap(), 0);
        assert_eq!(allocate_global_bytes(&mut len, 16, 16).unwrap(), 16);
        assert_eq!(len, 32);

        let mut len = u32::MAX - 2;
        assert!(allocate_global_bytes(&mut len, 8, 8).is_err());
    }
}
