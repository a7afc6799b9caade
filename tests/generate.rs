//! End-to-end tests of module generation, driven by a synthetic compiler
//! that interprets a tiny op format:
//!
//! ```text
//! 0x00 n        emit n filler bytes
//! 0x01 i32le    direct call to function index
//! 0x02 t        call the trap exit for trap index t
//! 0x03          breakpoint probe
//! 0x04          heap access
//! 0x05 s        load of symbolic address index s
//! 0x06          embed a code label referring to the function's entry
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use wasmgen::{
    generate_module, CallSiteKind, CallSiteTarget, CodeRange, CodeRangeKind, CompileArgs,
    CompileError, CompileMode, CompiledCode, Compiler, EntityItem, EntityRef, FuncCompileInput,
    FuncIndex, FuncType, Limits, MacroAssembler, Module, ModuleEnvironment, ModuleGenerator,
    SigWithId, SymbolicAddress, TableDesc, Tier, Trap, Tunables, ValType, WorkerPool,
    CODE_ALIGNMENT, FAR_JUMP_LENGTH, LOAD_PTR_LENGTH,
};

const NOP: u8 = 0x90;

/// A compiler for the op format above. `debug` controls whether stubs
/// include the debug trap; `fail_at` makes compilation of one function fail
/// to exercise error paths.
struct TestCompiler {
    debug: bool,
    fail_at: Option<FuncIndex>,
}

impl TestCompiler {
    fn new() -> TestCompiler {
        TestCompiler {
            debug: false,
            fail_at: None,
        }
    }

    fn with_debug() -> TestCompiler {
        TestCompiler {
            debug: true,
            fail_at: None,
        }
    }
}

impl Compiler for TestCompiler {
    fn compile_functions(
        &self,
        _env: &ModuleEnvironment,
        inputs: &[FuncCompileInput],
        output: &mut CompiledCode,
    ) -> Result<(), CompileError> {
        let mut masm = MacroAssembler::new();
        let mut ranges = Vec::new();

        for input in inputs {
            if self.fail_at == Some(input.func_index) {
                return Err(CompileError::Codegen(format!(
                    "synthetic failure at {:?}",
                    input.func_index
                )));
            }

            masm.halting_align(CODE_ALIGNMENT);
            let begin = masm.current_offset();
            let mut ops = input.bytes.iter().copied();
            while let Some(op) = ops.next() {
                match op {
                    0x00 => {
                        let n = ops.next().unwrap();
                        for _ in 0..n {
                            masm.append_raw_code(&[NOP]);
                        }
                    }
                    0x01 => {
                        let mut le = [0u8; 4];
                        for b in le.iter_mut() {
                            *b = ops.next().unwrap();
                        }
                        let callee = FuncIndex::new(u32::from_le_bytes(le) as usize);
                        masm.call_site(CallSiteKind::Func, CallSiteTarget::Func(callee));
                    }
                    0x02 => {
                        let t = Trap::ALL[ops.next().unwrap() as usize];
                        masm.trap_call(t);
                    }
                    0x03 => {
                        masm.breakpoint(CallSiteKind::Breakpoint);
                    }
                    0x04 => {
                        masm.memory_access();
                    }
                    0x05 => {
                        let s = SymbolicAddress::ALL[ops.next().unwrap() as usize];
                        masm.symbolic_access(s);
                    }
                    0x06 => {
                        masm.embed_code_label(wasmgen::CodeOffset(begin));
                    }
                    other => panic!("bad test op {:#x}", other),
                }
            }
            // Function epilogue.
            masm.append_raw_code(&[0xC3]);
            let end = masm.current_offset();
            ranges.push(CodeRange::new(
                CodeRangeKind::Function {
                    func_index: input.func_index,
                },
                begin,
                end,
            ));
        }

        output.swap(&mut masm);
        output.code_ranges = ranges;
        Ok(())
    }

    fn compile_stubs(
        &self,
        _env: &ModuleEnvironment,
        func_imports: &[wasmgen::FuncImport],
        func_exports: &[wasmgen::FuncExport],
        output: &mut CompiledCode,
    ) -> Result<(), CompileError> {
        let mut masm = MacroAssembler::new();
        let mut ranges = Vec::new();
        let mut stub = |masm: &mut MacroAssembler, kind: CodeRangeKind| {
            let begin = masm.current_offset();
            masm.append_raw_code(&[NOP, NOP, NOP, 0xC3]);
            ranges.push(CodeRange::new(kind, begin, masm.current_offset()));
        };

        for (i, _import) in func_imports.iter().enumerate() {
            let func_index = FuncIndex::new(i);
            stub(&mut masm, CodeRangeKind::ImportInterpExit { func_index });
            stub(&mut masm, CodeRangeKind::ImportJitExit { func_index });
        }
        for fe in func_exports {
            stub(
                &mut masm,
                CodeRangeKind::Entry {
                    func_index: fe.func_index(),
                },
            );
        }
        for trap in Trap::ALL {
            stub(&mut masm, CodeRangeKind::TrapExit { trap });
        }
        if self.debug {
            stub(&mut masm, CodeRangeKind::DebugTrap);
        }
        stub(&mut masm, CodeRangeKind::OutOfBoundsExit);
        stub(&mut masm, CodeRangeKind::UnalignedExit);
        stub(&mut masm, CodeRangeKind::Interrupt);
        stub(&mut masm, CodeRangeKind::Throw);

        output.swap(&mut masm);
        output.code_ranges = ranges;
        Ok(())
    }
}

fn test_env(num_funcs: usize) -> ModuleEnvironment {
    let mut env = ModuleEnvironment::new(Tier::Baseline, CompileMode::Once);
    let sig = env
        .signatures
        .push(SigWithId::new(FuncType::new(vec![], Some(ValType::I32))));
    for _ in 0..num_funcs {
        env.func_sigs.push(sig);
    }
    env
}

fn export_funcs(env: &mut ModuleEnvironment, indices: &[usize]) {
    for &i in indices {
        env.exports
            .insert(format!("f{}", i), EntityItem::Func(FuncIndex::new(i)));
    }
}

fn body(ops: &[u8]) -> Vec<u8> {
    ops.to_vec()
}

fn input(func: usize, ops: &[u8]) -> FuncCompileInput {
    FuncCompileInput {
        func_index: FuncIndex::new(func),
        line_or_bytecode: 0,
        bytes: body(ops),
        line_nums: Vec::new(),
    }
}

fn args(tunables: Tunables, compiler: TestCompiler) -> CompileArgs {
    let _ = env_logger::builder().is_test(true).try_init();
    CompileArgs {
        tunables,
        compiler: Arc::new(compiler),
        workers: None,
        cancelled: None,
        filename: None,
    }
}

fn call_op(callee: usize) -> Vec<u8> {
    let mut ops = vec![0x01];
    ops.extend_from_slice(&(callee as u32).to_le_bytes());
    ops
}

fn function_range(module: &Module, func: usize) -> &CodeRange {
    module
        .tier1()
        .metadata
        .code_ranges
        .iter()
        .find(|cr| cr.is_function() && cr.func_index() == FuncIndex::new(func))
        .expect("function has a code range")
}

fn islands(module: &Module) -> Vec<&CodeRange> {
    module
        .tier1()
        .metadata
        .code_ranges
        .iter()
        .filter(|cr| cr.kind == CodeRangeKind::FarJumpIsland)
        .collect()
}

/// Reads the displacement of the call whose return address is
/// `ret_addr_offset` and resolves it to the callee offset.
fn resolve_call(module: &Module, ret_addr_offset: u32) -> u32 {
    let bytes = module.tier1().segment.bytes();
    let at = ret_addr_offset as usize;
    let disp = i32::from_le_bytes(bytes[at - 4..at].try_into().unwrap());
    (ret_addr_offset as i64 + disp as i64) as u32
}

/// Reads the target slot of the far jump island starting at `begin`, given
/// the island's prelude length in bytes.
fn resolve_far_jump(module: &Module, begin: u32, prelude: u32) -> u64 {
    let bytes = module.tier1().segment.bytes();
    let slot = (begin + prelude + 4) as usize;
    u64::from_le_bytes(bytes[slot..slot + 8].try_into().unwrap())
}

fn assert_sorted_metadata(module: &Module) {
    let tier = &module.tier1().metadata;
    let mut last = 0;
    for cr in &tier.code_ranges {
        assert!(cr.begin >= last, "code ranges out of order");
        last = cr.end;
    }
    let mut last = 0;
    for cs in &tier.call_sites {
        assert!(cs.ret_addr_offset >= last, "call sites out of order");
        last = cs.ret_addr_offset;
    }
    let mut last = 0;
    for ma in &tier.memory_accesses {
        assert!(ma.insn_offset >= last, "memory accesses out of order");
        last = ma.insn_offset;
    }
}

#[test]
fn tiny_serial_module() {
    // S1: two exported functions, no calls.
    let mut env = test_env(2);
    export_funcs(&mut env, &[0, 1]);
    let module = generate_module(
        args(Tunables::default(), TestCompiler::new()),
        env,
        vec![input(0, &[0x00, 4]), input(1, &[0x00, 4])],
        b"s1",
    )
    .unwrap();

    let exports = &module.tier1().metadata.func_exports;
    assert_eq!(exports.len(), 2);
    assert_eq!(exports[0].func_index(), FuncIndex::new(0));
    assert_eq!(exports[1].func_index(), FuncIndex::new(1));
    for fe in exports {
        assert!(fe.entry_offset().is_some());
        assert!(fe.code_range_index().is_some());
    }
    assert!(module.tier1().metadata.call_sites.is_empty());
    assert!(module.tier1().link_data.internal_links.is_empty());
    assert!(islands(&module).is_empty());
    assert_sorted_metadata(&module);
}

#[test]
fn direct_call_in_range() {
    // S2: f1 calls f0; everything is close, so the call is patched direct.
    let mut env = test_env(2);
    export_funcs(&mut env, &[1]);
    let module = generate_module(
        args(Tunables::default(), TestCompiler::new()),
        env,
        vec![input(0, &[0x00, 4]), input(1, &call_op(0))],
        b"s2",
    )
    .unwrap();

    assert!(islands(&module).is_empty());
    let tier = &module.tier1().metadata;
    assert_eq!(tier.call_sites.len(), 1);
    let target = resolve_call(&module, tier.call_sites[0].ret_addr_offset);
    assert_eq!(target, function_range(&module, 0).func_normal_entry());
}

#[test]
fn far_call_gets_an_island() {
    // S3: f1 sits more than branch_range past f0, so the call goes through
    // a far-jump island whose slot ends up pointing at f0's entry.
    let mut env = test_env(2);
    export_funcs(&mut env, &[1]);
    let tunables = Tunables {
        jump_threshold: 256,
        ..Tunables::default()
    };
    let mut padded = vec![0x00, 255, 0x00, 255];
    padded.extend_from_slice(&call_op(0));
    let module = generate_module(
        args(tunables, TestCompiler::new()),
        env,
        vec![input(0, &[0x00, 4]), input(1, &padded)],
        b"s3",
    )
    .unwrap();

    let islands = islands(&module);
    assert_eq!(islands.len(), 1);
    let island = islands[0];
    // A call island is a bare far jump, no TLS prelude.
    assert_eq!(island.end - island.begin, FAR_JUMP_LENGTH);

    let tier = &module.tier1().metadata;
    let call = tier
        .call_sites
        .iter()
        .find(|cs| cs.kind == CallSiteKind::Func)
        .unwrap();
    assert_eq!(resolve_call(&module, call.ret_addr_offset), island.begin);
    assert_eq!(
        resolve_far_jump(&module, island.begin, 0),
        u64::from(function_range(&module, 0).func_normal_entry())
    );
}

#[test]
fn island_is_shared_within_a_pass() {
    // S4: f1 and f2 both call far-away f0 in one linking pass; they share
    // one island.
    let mut env = test_env(3);
    export_funcs(&mut env, &[0]);
    let tunables = Tunables {
        jump_threshold: 384,
        ..Tunables::default()
    };
    // f0 is padded past the branch range of both callers.
    let mut caller = vec![0x00, 120];
    caller.extend_from_slice(&call_op(0));
    let module = generate_module(
        args(tunables, TestCompiler::new()),
        env,
        vec![
            input(0, &[0x00, 255, 0x00, 255]),
            input(1, &caller.clone()),
            input(2, &caller),
        ],
        b"s4",
    )
    .unwrap();

    let islands = islands(&module);
    assert_eq!(islands.len(), 1);
    let entry = islands[0].begin;
    let tier = &module.tier1().metadata;
    let func_calls: Vec<_> = tier
        .call_sites
        .iter()
        .filter(|cs| cs.kind == CallSiteKind::Func)
        .collect();
    assert_eq!(func_calls.len(), 2);
    for cs in func_calls {
        assert_eq!(resolve_call(&module, cs.ret_addr_offset), entry);
    }
}

#[test]
fn trap_exit_islands_reload_tls() {
    // S5: a trap call always routes through an island that restores the TLS
    // register before the far jump.
    let mut env = test_env(1);
    export_funcs(&mut env, &[0]);
    let module = generate_module(
        args(Tunables::default(), TestCompiler::new()),
        env,
        vec![input(0, &[0x02, 0])],
        b"s5",
    )
    .unwrap();

    let tier = &module.tier1().metadata;
    let trap_exits: Vec<_> = tier
        .code_ranges
        .iter()
        .filter(|cr| {
            cr.kind
                == CodeRangeKind::TrapExit {
                    trap: Trap::Unreachable,
                }
        })
        .collect();
    assert_eq!(trap_exits.len(), 1);

    let islands = islands(&module);
    assert_eq!(islands.len(), 1);
    let island = islands[0];
    assert_eq!(
        island.end - island.begin,
        LOAD_PTR_LENGTH + FAR_JUMP_LENGTH,
        "trap island carries a TLS reload prelude"
    );
    assert_eq!(
        resolve_far_jump(&module, island.begin, LOAD_PTR_LENGTH),
        u64::from(trap_exits[0].begin)
    );

    let trap_call = tier
        .call_sites
        .iter()
        .find(|cs| cs.kind == CallSiteKind::TrapExit)
        .unwrap();
    assert_eq!(
        resolve_call(&module, trap_call.ret_addr_offset),
        island.begin
    );
}

#[test]
fn parallel_backpressure() {
    // S6: far more tiny functions than tasks; the free list caps memory and
    // compile_func_def never fails. Every function ends up compiled.
    let num_funcs = 64;
    let env = test_env(num_funcs);
    let workers = Arc::new(WorkerPool::new(4));
    let tunables = Tunables {
        batch_baseline_threshold: 1,
        ..Tunables::default()
    };
    let mut args = args(tunables, TestCompiler::new());
    args.workers = Some(workers);

    let bodies: Vec<_> = (0..num_funcs).map(|i| input(i, &[0x00, 8])).collect();
    let module = generate_module(args, env, bodies, b"s6").unwrap();

    let tier = &module.tier1().metadata;
    let compiled = tier.code_ranges.iter().filter(|cr| cr.is_function()).count();
    assert_eq!(compiled, num_funcs);
    assert_sorted_metadata(&module);

    // Structural determinism: every function has exactly one body range,
    // whatever order the tasks completed in.
    let mut seen = vec![false; num_funcs];
    for cr in tier.code_ranges.iter().filter(|cr| cr.is_function()) {
        let i = cr.func_index().index();
        assert!(!seen[i]);
        seen[i] = true;
    }
}

#[test]
fn offsets_are_rebased_by_append_position() {
    // Property 1: module-global offsets are the task-local offsets shifted
    // by the function's position in the image.
    let mut env = test_env(2);
    export_funcs(&mut env, &[0]);
    let module = generate_module(
        args(Tunables::default(), TestCompiler::new()),
        env,
        vec![
            input(0, &[0x00, 8, 0x04, 0x05, 0]),
            input(1, &[0x00, 16, 0x04]),
        ],
        b"rebase",
    )
    .unwrap();

    let tier = &module.tier1().metadata;
    // Function 0: 8 filler bytes then the access.
    let f0 = function_range(&module, 0);
    assert_eq!(tier.memory_accesses[0].insn_offset, f0.begin + 8);
    // Function 1: 16 filler bytes then the access.
    let f1 = function_range(&module, 1);
    assert_eq!(tier.memory_accesses[1].insn_offset, f1.begin + 16);

    // The symbolic access sits right after f0's heap access.
    let links = &module.tier1().link_data.symbolic_links[SymbolicAddress::MemoryGrow];
    assert_eq!(links.len(), 1);
    assert_eq!(links[0], f0.begin + 8 + 4 + 2);
}

#[test]
fn code_labels_become_internal_links() {
    let mut env = test_env(1);
    export_funcs(&mut env, &[0]);
    let module = generate_module(
        args(Tunables::default(), TestCompiler::new()),
        env,
        vec![input(0, &[0x00, 4, 0x06])],
        b"labels",
    )
    .unwrap();

    let links = &module.tier1().link_data.internal_links;
    assert_eq!(links.len(), 1);
    let f0 = function_range(&module, 0);
    assert_eq!(links[0].target_offset, f0.begin);
    assert_eq!(links[0].patch_at_offset, f0.begin + 4);
}

#[test]
fn exports_cover_elem_segments_and_start() {
    // Property 6: explicit exports, the start function and the elements of
    // external tables, sorted strictly by function index.
    let mut env = test_env(4);
    export_funcs(&mut env, &[0]);
    env.start_func = Some(FuncIndex::new(2));
    let table = env.tables.push(TableDesc {
        limits: Limits {
            initial: 2,
            maximum: None,
        },
        external: true,
        global_data_offset: None,
    });
    env.elem_segments.push(wasmgen::ElemSegment {
        table_index: table,
        offset: wasmgen::InitExpr::I32Const(0),
        elem_func_indices: vec![FuncIndex::new(3), FuncIndex::new(0)],
    });

    let bodies: Vec<_> = (0..4).map(|i| input(i, &[0x00, 4])).collect();
    let module = generate_module(
        args(Tunables::default(), TestCompiler::new()),
        env,
        bodies,
        b"exports",
    )
    .unwrap();

    let exports = &module.tier1().metadata.func_exports;
    let indices: Vec<_> = exports.iter().map(|fe| fe.func_index().index()).collect();
    assert_eq!(indices, vec![0, 2, 3]);

    // Element segments got their code-range indices filled in.
    let elem_indices = &module.tier1().metadata.elem_code_range_indices;
    assert_eq!(elem_indices.len(), 1);
    assert_eq!(elem_indices[0].len(), 2);
}

#[test]
fn sentinels_are_assigned_once() {
    // Property 7: each signal-handler sentinel and each trap entry is set
    // exactly once.
    let mut env = test_env(1);
    export_funcs(&mut env, &[0]);
    let module = generate_module(
        args(Tunables::default(), TestCompiler::new()),
        env,
        vec![input(0, &[0x00, 4])],
        b"sentinels",
    )
    .unwrap();

    let link_data = &module.tier1().link_data;
    assert!(link_data.out_of_bounds_offset.is_some());
    assert!(link_data.unaligned_access_offset.is_some());
    assert!(link_data.interrupt_offset.is_some());

    let tier = &module.tier1().metadata;
    for trap in Trap::ALL {
        let count = tier
            .code_ranges
            .iter()
            .filter(|cr| cr.kind == CodeRangeKind::TrapExit { trap })
            .count();
        assert_eq!(count, 1);
    }
}

#[test]
fn breakpoints_build_the_island_ladder() {
    // Breakpoint-class sites stay unpatched; islands with TLS preludes are
    // emitted so every probe has one in range, and their entry list stays
    // sorted.
    let mut env = test_env(2);
    export_funcs(&mut env, &[0]);
    let tunables = Tunables {
        debug_enabled: true,
        ..Tunables::default()
    };
    let module = generate_module(
        args(tunables, TestCompiler::with_debug()),
        env,
        vec![input(0, &[0x03, 0x00, 16, 0x03]), input(1, &[0x03])],
        b"breakpoints",
    )
    .unwrap();

    let tier = &module.tier1().metadata;
    assert!(!tier.debug_trap_far_jump_offsets.is_empty());
    let mut last = 0;
    for &offset in &tier.debug_trap_far_jump_offsets {
        assert!(offset >= last);
        last = offset;
    }

    // Debug artifacts came along.
    assert!(module.metadata().debug_enabled);
    assert!(module.debug_bytes().is_some());
    assert_ne!(module.metadata().debug_hash, [0; 8]);
    assert_eq!(module.metadata().debug_func_arg_types.len(), 2);
}

#[test]
fn serial_batching_splits_tasks() {
    // A small threshold forces multiple serial batches; linking still
    // produces one coherent image.
    let mut env = test_env(6);
    export_funcs(&mut env, &[5]);
    let tunables = Tunables {
        batch_baseline_threshold: 4,
        ..Tunables::default()
    };
    let bodies: Vec<_> = (0..6).map(|i| input(i, &[0x00, 8])).collect();
    let module = generate_module(
        args(tunables, TestCompiler::new()),
        env,
        bodies,
        b"batches",
    )
    .unwrap();

    let tier = &module.tier1().metadata;
    assert_eq!(
        tier.code_ranges.iter().filter(|cr| cr.is_function()).count(),
        6
    );
    assert_sorted_metadata(&module);
}

#[test]
fn cancellation_stops_batch_launch() {
    let env = test_env(2);
    let cancelled = Arc::new(AtomicBool::new(false));
    let mut args = args(
        Tunables {
            batch_baseline_threshold: 1,
            ..Tunables::default()
        },
        TestCompiler::new(),
    );
    args.cancelled = Some(cancelled.clone());

    let mut generator = ModuleGenerator::new(args, env, 64).unwrap();
    generator.start_func_defs();
    cancelled.store(true, Ordering::Relaxed);
    let err = generator
        .compile_func_def(FuncIndex::new(0), 0, body(&[0x00, 8]), Vec::new())
        .unwrap_err();
    assert!(matches!(err, CompileError::Cancelled));
}

#[test]
fn compile_failure_surfaces() {
    let env = test_env(2);
    let compiler = TestCompiler {
        debug: false,
        fail_at: Some(FuncIndex::new(1)),
    };
    let bodies: Vec<_> = (0..2).map(|i| input(i, &[0x00, 4])).collect();
    let err = generate_module(args(Tunables::default(), compiler), env, bodies, b"fail")
        .unwrap_err();
    assert!(err.to_string().contains("synthetic failure"));
}

#[test]
fn global_data_layout_is_page_rounded_and_ordered() {
    let mut env = test_env(1);
    export_funcs(&mut env, &[0]);
    // A mutable i32 and a mutable v128 global; the i32 comes first, the
    // v128 gets 16-byte alignment.
    env.globals.push(wasmgen::GlobalDesc {
        ty: ValType::I32,
        mutable: true,
        init: wasmgen::InitExpr::I32Const(0),
        offset: None,
    });
    env.globals.push(wasmgen::GlobalDesc {
        ty: ValType::V128,
        mutable: true,
        init: wasmgen::InitExpr::I32Const(0),
        offset: None,
    });

    let module = generate_module(
        args(Tunables::default(), TestCompiler::new()),
        env,
        vec![input(0, &[0x00, 4])],
        b"layout",
    )
    .unwrap();

    let metadata = module.metadata();
    assert_eq!(metadata.global_data_length % 4096, 0);
    let offsets: Vec<_> = metadata.globals.iter().map(|g| g.offset.unwrap()).collect();
    assert_eq!(offsets[0] % 4, 0);
    assert_eq!(offsets[1] % 16, 0);
    assert!(offsets[1] >= offsets[0] + 4);
}

#[test]
fn tier1_builds_a_jump_table() {
    let mut env = test_env(2);
    env.mode = CompileMode::Tier1;
    export_funcs(&mut env, &[0]);
    let module = generate_module(
        args(Tunables::default(), TestCompiler::new()),
        env,
        vec![input(0, &[0x00, 4]), input(1, &[0x00, 4])],
        b"tiers",
    )
    .unwrap();

    let table = module.jump_table().expect("tier-1 module has a jump table");
    assert_eq!(table.len(), 2);
    let base = module.tier1().segment.base() as usize;
    for i in 0..2 {
        let expected = base + function_range(&module, i).func_tier_entry() as usize;
        assert_eq!(table.get(FuncIndex::new(i)), expected);
    }
}

#[test]
fn tier2_installs_into_the_module() {
    let mut env1 = test_env(1);
    env1.mode = CompileMode::Tier1;
    export_funcs(&mut env1, &[0]);
    let mut module = generate_module(
        args(Tunables::default(), TestCompiler::new()),
        env1,
        vec![input(0, &[0x00, 4])],
        b"two-tier",
    )
    .unwrap();

    let mut env2 = test_env(1);
    env2.tier = Tier::Optimized;
    env2.mode = CompileMode::Tier2;
    export_funcs(&mut env2, &[0]);
    let mut generator = ModuleGenerator::new(
        args(Tunables::default(), TestCompiler::new()),
        env2,
        64,
    )
    .unwrap();
    generator.start_func_defs();
    generator
        .compile_func_def(FuncIndex::new(0), 0, body(&[0x00, 4]), Vec::new())
        .unwrap();
    generator.finish_func_defs().unwrap();
    generator.finish_tier2(&mut module).unwrap();

    let tier2 = module.tier2().expect("tier 2 installed");
    assert_eq!(tier2.segment.tier(), Tier::Optimized);
    assert!(std::ptr::eq(module.best_tier(), tier2));
}

#[test]
fn dropping_a_generator_with_work_in_flight_drains() {
    let env = test_env(32);
    let workers = Arc::new(WorkerPool::new(2));
    let mut args = args(
        Tunables {
            batch_baseline_threshold: 1,
            ..Tunables::default()
        },
        TestCompiler::new(),
    );
    args.workers = Some(workers.clone());

    let mut generator = ModuleGenerator::new(args, env, 1024).unwrap();
    generator.start_func_defs();
    for i in 0..32 {
        generator
            .compile_func_def(FuncIndex::new(i), 0, body(&[0x00, 8]), Vec::new())
            .unwrap();
    }
    // Drop without finishing; the drain must not hang or leak tasks into
    // the pool.
    drop(generator);
    drop(workers);
}
