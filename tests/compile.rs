//! End-to-end compiler scenarios (§8 "Testable properties"), exercised through the
//! public `compile` entry point the way an embedder would call it.

use xvm_compile::config::{CompileOptions, WasmFeatures};
use xvm_compile::environment::{Environment, ExternVal, FuncEntry, Global, RegisteredModule, Value};
use xvm_compile::error::CompileError;
use xvm_compile::opcode::Opcode;
use xvm_compile::value_type::{FuncSig, ValType};
use xvm_compile::{compile, Module};

fn wat(src: &str) -> Vec<u8> {
    wat::parse_str(src).expect("test fixture must parse as valid wat")
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(buf[at..at + 4].try_into().unwrap())
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(buf[at..at + 8].try_into().unwrap())
}

fn defined_offset(env: &Environment, module: &Module, export: &str) -> usize {
    let Some(ExternVal::Func(func_idx)) = module.exports.get(export).copied() else {
        panic!("export \"{export}\" is not a function");
    };
    match &env.functions[func_idx as usize] {
        FuncEntry::Defined { offset, .. } => *offset as usize,
        FuncEntry::Host { .. } => panic!("export \"{export}\" is a host function, not defined"),
    }
}

// S1: a nullary function returning a constant emits alloca/const/return, with the
// (0, 1) drop-keep elided as a no-op.
#[test]
fn s1_minimal_function_emits_alloca_const_return() {
    let mut env = Environment::new();
    let wasm = wat(r#"(module (func (export "f") (result i32) i32.const 42))"#);
    let options = CompileOptions::new().with_gas_metering(false);
    let module = compile(&mut env, &wasm, &options).expect("compile should succeed");

    let start = defined_offset(&env, &module, "f");
    let buf = &env.istream;
    let mut pos = start;
    assert_eq!(read_u32(buf, pos), Opcode::InterpAlloca.index());
    pos += 4;
    assert_eq!(read_u32(buf, pos), 0, "no locals beyond the (nonexistent) params");
    pos += 4;
    assert_eq!(read_u32(buf, pos), Opcode::I32Const.index());
    pos += 4;
    assert_eq!(read_u32(buf, pos) as i32, 42);
    pos += 4;
    assert_eq!(read_u32(buf, pos), Opcode::Return.index(), "drop-keep(0,1) elides to nothing");
    pos += 4;
    assert_eq!(pos, buf.len());
}

// S2: a function adding its one parameter to itself. Each `local.get 0`'s slot is
// the distance from the operand stack's current top (before that get's own push)
// down to the param's position, so the two accesses differ (1, then 2) even though
// both name local index 0; the closing `end` then drops the reserved param slot.
#[test]
fn s2_local_get_add_emits_two_local_gets_and_add() {
    let mut env = Environment::new();
    let wasm = wat(r#"(module (func (export "f") (param i32) (result i32)
        local.get 0 local.get 0 i32.add))"#);
    let options = CompileOptions::new().with_gas_metering(false);
    let module = compile(&mut env, &wasm, &options).expect("compile should succeed");

    let start = defined_offset(&env, &module, "f");
    let buf = &env.istream;
    let mut pos = start;
    assert_eq!(read_u32(buf, pos), Opcode::InterpAlloca.index());
    pos += 4;
    assert_eq!(read_u32(buf, pos), 0, "no locals beyond the one param");
    pos += 4;
    for expected_slot in [1u32, 2u32] {
        assert_eq!(read_u32(buf, pos), Opcode::LocalGet.index());
        pos += 4;
        assert_eq!(read_u32(buf, pos), expected_slot, "stack-relative slot, not the raw local index");
        pos += 4;
    }
    assert_eq!(read_u32(buf, pos), Opcode::I32Add.index());
    pos += 4;
    assert_eq!(read_u32(buf, pos), Opcode::InterpDropKeep.index(), "drop the one param's slot on return");
    pos += 4;
    assert_eq!(read_u32(buf, pos), 1, "drop the reserved param slot");
    pos += 4;
    assert_eq!(read_u32(buf, pos), 1, "keep the add's result");
    pos += 4;
    assert_eq!(read_u32(buf, pos), Opcode::Return.index());
    pos += 4;
    assert_eq!(pos, buf.len());
}

// S3: importing a memory whose declared minimum the registered module satisfies
// succeeds; a larger declared minimum than the module actually has fails.
#[test]
fn s3_memory_import_limits_compatibility() {
    let mut env = Environment::new();
    let mem_idx = env.push_memory(xvm_compile::environment::Memory::new(1, Some(2)));
    let mut exports = xvm_compile::environment::FnvHashMap::default();
    exports.insert("memory".into(), ExternVal::Memory(mem_idx));
    env.register_module("env".into(), RegisteredModule { exports });

    let ok_wasm = wat(r#"(module (import "env" "memory" (memory 1)))"#);
    let options = CompileOptions::default();
    compile(&mut env, &ok_wasm, &options).expect("min=1 against a min=1,max=2 memory should resolve");

    let bad_wasm = wat(r#"(module (import "env" "memory" (memory 2)))"#);
    let err = compile(&mut env, &bad_wasm, &options).expect_err("min=2 against a min=1 memory should fail");
    assert!(matches!(err, CompileError::ImportUnresolved { .. }));
}

// S4: an `if`/`else` with matching single-i32 arms compiles to a conditional skip
// followed by an unconditional jump over the else arm.
#[test]
fn s4_if_else_emits_br_unless_then_br() {
    let mut env = Environment::new();
    let wasm = wat(r#"(module (func (export "f") (param i32) (result i32)
        local.get 0
        (if (result i32) (then i32.const 1) (else i32.const 2))))"#);
    let options = CompileOptions::new().with_gas_metering(false);
    let module = compile(&mut env, &wasm, &options).expect("compile should succeed");

    let start = defined_offset(&env, &module, "f");
    let buf = &env.istream;
    // Operand word count for every opcode this tiny fixture can emit; `InterpDropKeep`
    // is the one non-uniform width, so a fixed stride can't be used to scan past it.
    let operand_words = |opcode: u32| -> usize {
        if opcode == Opcode::InterpDropKeep.index() {
            2
        } else if opcode == Opcode::Return.index() {
            0
        } else {
            1
        }
    };
    let opcodes_from = |mut pos: usize| {
        let mut seen = Vec::new();
        while pos < buf.len() {
            let opcode = read_u32(buf, pos);
            seen.push(opcode);
            pos += 4 * (1 + operand_words(opcode));
        }
        seen
    };
    let seen = opcodes_from(start + 8); // skip InterpAlloca + its count operand
    assert!(seen.contains(&Opcode::InterpBrUnless.index()));
    assert!(seen.contains(&Opcode::Br.index()));
    assert!(seen.contains(&Opcode::I32Const.index()));
    assert_eq!(*seen.last().unwrap(), Opcode::Return.index(), "drop-keep(1,1) for the param's slot precedes the final Return");
}

// S5: the gas pass on a straight-line run charges once, at the run's first
// operator, for the sum of every operator's cost in that run.
#[test]
fn s5_gas_pass_charges_once_for_a_straight_line_run() {
    let mut env = Environment::new();
    let wasm = wat(r#"(module (func (export "f") (result i32)
        i32.const 1 i32.const 2 i32.add return))"#);
    let options = CompileOptions::new().with_gas_metering(true);
    let module = compile(&mut env, &wasm, &options).expect("compile should succeed");

    let start = defined_offset(&env, &module, "f");
    let buf = &env.istream;
    // InterpAlloca, count, then the single AddGas prefix (an i64 operand, §6).
    assert_eq!(read_u32(buf, start), Opcode::InterpAlloca.index());
    assert_eq!(read_u32(buf, start + 8), Opcode::AddGas.index());
    let charge = read_u64(buf, start + 12);
    assert_eq!(charge, 1 + 1 + 1 + 1, "two consts + add + return, base cost 1 each");
    // No second AddGas anywhere else in the body — it's one straight-line run.
    let mut pos = start + 20;
    let mut add_gas_count = 0;
    while pos + 4 <= buf.len() {
        if read_u32(buf, pos) == Opcode::AddGas.index() {
            add_gas_count += 1;
        }
        pos += 4;
    }
    assert_eq!(add_gas_count, 0);
}

// S6: assigning to a global declared immutable is rejected, and the environment is
// left exactly as it was found.
#[test]
fn s6_immutable_global_assignment_rejected_and_rolled_back() {
    let mut env = Environment::new();
    env.push_global(Global { val_type: ValType::I32, mutable: false, value: Value::I32(0) });
    let before = format!("{:?}", env.mark());

    let wasm = wat(r#"(module (global i32 (i32.const 0))
        (func (export "f") i32.const 1 global.set 0))"#);
    let err = compile(&mut env, &wasm, &CompileOptions::default()).expect_err("assigning an immutable global must fail");
    assert!(matches!(err, CompileError::ImmutableAssignment { .. }));
    assert_eq!(before, format!("{:?}", env.mark()));
}

// Invariant 1 / boundary-adjacent: a malformed function body leaves the environment
// byte-identical, including its istream length.
#[test]
fn invariant_mark_reset_purity_on_type_mismatch() {
    let mut env = Environment::new();
    let istream_len_before = env.istream.len();
    let wasm = wat(r#"(module (func (result i32) f64.const 1.0))"#);
    let err = compile(&mut env, &wasm, &CompileOptions::default()).expect_err("type mismatch must fail");
    assert!(matches!(err, CompileError::TypeMismatch { .. }));
    assert_eq!(env.istream.len(), istream_len_before);
    assert!(env.functions.is_empty());
    assert!(env.signatures.is_empty());
}

// Invariant 7: importing the same export twice from two different modules yields
// byte-identical ExternVal entries in func_map.
#[test]
fn invariant_import_equality_for_repeated_imports() {
    let mut env = Environment::new();
    let sig = FuncSig::new(vec![], vec![ValType::I32]);
    let sig_idx = env.push_signature(sig.clone());
    let func_idx = env.push_function(FuncEntry::Host { sig: sig_idx, handle: 0 });
    let mut exports = xvm_compile::environment::FnvHashMap::default();
    exports.insert("answer".into(), ExternVal::Func(func_idx));
    env.register_module("host".into(), RegisteredModule { exports });

    let wasm = wat(r#"(module
        (import "host" "answer" (func (result i32)))
        (import "host" "answer" (func (result i32))))"#);
    let module = compile(&mut env, &wasm, &CompileOptions::default()).expect("both imports should resolve identically");
    assert_eq!(module.func_map[0], module.func_map[1]);
    assert_eq!(module.func_map[0], func_idx);
}

// Boundary 8: a zero-initial memory with no maximum and a zero-length data segment
// is accepted.
#[test]
fn boundary_zero_length_data_segment_on_zero_initial_memory() {
    let mut env = Environment::new();
    let wasm = wat(r#"(module (memory 0) (data (i32.const 0) ""))"#);
    compile(&mut env, &wasm, &CompileOptions::default()).expect("empty data segment on an empty memory must be accepted");
}

// Boundary 9: an element segment landing exactly on the table's last slot is
// accepted; one past the end is rejected as out of bounds.
#[test]
fn boundary_element_segment_exact_fit_vs_one_past() {
    let mut env = Environment::new();
    let exact = wat(r#"(module (table 2 funcref) (func $f)
        (elem (i32.const 1) $f))"#);
    compile(&mut env, &exact, &CompileOptions::default()).expect("element segment landing on the last slot must be accepted");

    let mut env2 = Environment::new();
    let one_past = wat(r#"(module (table 2 funcref) (func $f) (func $g)
        (elem (i32.const 1) $f $g))"#);
    let err = compile(&mut env2, &one_past, &CompileOptions::default()).expect_err("element segment overrunning the table must fail");
    assert!(matches!(err, CompileError::OutOfBounds(_)));
}

// Boundary 10: a br_table with zero labeled targets validates only its default arm.
#[test]
fn boundary_br_table_zero_targets_validates_default_only() {
    let mut env = Environment::new();
    let wasm = wat(r#"(module (func (export "f") (param i32) (result i32)
        (block (result i32)
            (br_table 0 (i32.const 7) (local.get 0)))))"#);
    compile(&mut env, &wasm, &CompileOptions::default()).expect("br_table with only a default target must validate");
}

// A forward call to a function defined later in the module resolves to a real
// offset, not the INVALID_OFFSET fixup sentinel (invariant 2: no dangling offset).
#[test]
fn invariant_no_dangling_offset_after_forward_call() {
    let mut env = Environment::new();
    let wasm = wat(r#"(module
        (func (export "caller") (result i32) (call $callee))
        (func $callee (result i32) i32.const 9))"#);
    let options = CompileOptions::new().with_gas_metering(false);
    let module = compile(&mut env, &wasm, &options).expect("compile should succeed");

    let start = defined_offset(&env, &module, "caller");
    let buf = &env.istream;
    assert_eq!(read_u32(buf, start + 8), Opcode::Call.index());
    let callee_offset = read_u32(buf, start + 12);
    assert_ne!(callee_offset, xvm_compile::istream::INVALID_OFFSET);
}

// A backward call (to a function declared earlier in the module, already translated
// by the time the caller is) resolves directly to that function's real offset
// without ever touching the forward-fixup path.
#[test]
fn invariant_backward_call_resolves_without_fixup() {
    let mut env = Environment::new();
    let wasm = wat(r#"(module
        (func $callee (export "callee") (result i32) i32.const 9)
        (func (export "caller") (result i32) (call $callee)))"#);
    let options = CompileOptions::new().with_gas_metering(false);
    let module = compile(&mut env, &wasm, &options).expect("compile should succeed");

    let callee_start = defined_offset(&env, &module, "callee") as u32;
    let caller_start = defined_offset(&env, &module, "caller");
    let buf = &env.istream;
    assert_eq!(read_u32(buf, caller_start + 8), Opcode::Call.index());
    let target = read_u32(buf, caller_start + 12);
    assert_eq!(target, callee_start, "a backward call must resolve directly, not via a fixup");
    assert_ne!(target, xvm_compile::istream::INVALID_OFFSET);
}

// A direct self-recursive call resolves to the caller's own offset, set before its
// own body is translated.
#[test]
fn invariant_self_recursive_call_resolves_to_own_offset() {
    let mut env = Environment::new();
    let wasm = wat(r#"(module (func $f (export "f") (param i32) (result i32)
        local.get 0
        (if (result i32)
            (then local.get 0 call $f)
            (else i32.const 0))))"#);
    let options = CompileOptions::new().with_gas_metering(false);
    let module = compile(&mut env, &wasm, &options).expect("self-recursive call must compile");

    let start = defined_offset(&env, &module, "f") as u32;
    let buf = &env.istream;
    let mut pos = 0usize;
    let mut found_self_call = false;
    while pos + 8 <= buf.len() {
        if read_u32(buf, pos) == Opcode::Call.index() {
            let target = read_u32(buf, pos + 4);
            if target == start {
                found_self_call = true;
            }
            assert_ne!(target, xvm_compile::istream::INVALID_OFFSET);
        }
        pos += 4;
    }
    assert!(found_self_call, "the call to $f itself must resolve to f's own start offset");
}

// Calling an imported host function resolves to `InterpCallHost` + its handle, never
// a dangling-offset `Call`.
#[test]
fn invariant_call_to_host_import_emits_interp_call_host() {
    let mut env = Environment::new();
    let sig = FuncSig::new(vec![], vec![ValType::I32]);
    let sig_idx = env.push_signature(sig.clone());
    let func_idx = env.push_function(FuncEntry::Host { sig: sig_idx, handle: 77 });
    let mut exports = xvm_compile::environment::FnvHashMap::default();
    exports.insert("answer".into(), ExternVal::Func(func_idx));
    env.register_module("host".into(), RegisteredModule { exports });

    let wasm = wat(r#"(module
        (import "host" "answer" (func $answer (result i32)))
        (func (export "f") (result i32) (call $answer)))"#);
    let options = CompileOptions::new().with_gas_metering(false);
    let module = compile(&mut env, &wasm, &options).expect("compile should succeed");

    let start = defined_offset(&env, &module, "f");
    let buf = &env.istream;
    assert_eq!(read_u32(buf, start + 8), Opcode::InterpCallHost.index());
    assert_eq!(read_u32(buf, start + 12), 77, "the host handle, not an istream offset");
}

// §4.E.1: a `return_call` with one stray value on the operand stack below its one
// argument drops that stray value and keeps the argument, emitting drop-keep(1, 1)
// before the tail-call opcode.
#[test]
fn return_call_drop_keep_preserves_argument_over_stray_stack_value() {
    let mut env = Environment::new();
    let wasm = wat(r#"(module
        (func $callee (param i32) (result i32) local.get 0)
        (func (export "caller") (param i32) (result i32)
            local.get 0
            local.get 0
            (return_call $callee)))"#);
    let options = CompileOptions::new().with_gas_metering(false);
    let module = compile(&mut env, &wasm, &options).expect("return_call should compile");

    let start = defined_offset(&env, &module, "caller");
    let buf = &env.istream;
    // InterpAlloca(0 locals beyond the param) + two LocalGets precede the reshape.
    assert_eq!(read_u32(buf, start), Opcode::InterpAlloca.index());
    assert_eq!(read_u32(buf, start + 4), 0);
    let mut pos = start + 8;
    for _ in 0..2 {
        assert_eq!(read_u32(buf, pos), Opcode::LocalGet.index());
        pos += 8;
    }
    assert_eq!(read_u32(buf, pos), Opcode::InterpDropKeep.index(), "drop=1, keep=1 does not elide");
    pos += 4;
    assert_eq!(read_u32(buf, pos), 1, "drop the stray value underneath");
    pos += 4;
    assert_eq!(read_u32(buf, pos), 1, "keep the one argument");
    pos += 4;
    assert_eq!(read_u32(buf, pos), Opcode::ReturnCallInternal.index());
}

// Feature gating: SIMD/threads/etc. stay off by default, and a module needing a
// disabled feature (mutable globals) is rejected rather than silently accepted.
#[test]
fn feature_disabled_by_default_is_rejected() {
    let mut env = Environment::new();
    let wasm = wat(r#"(module (global (export "g") (mut i32) (i32.const 0)))"#);
    let options = CompileOptions::new().with_features(WasmFeatures {
        mutable_globals: false,
        ..WasmFeatures::default()
    });
    let err = compile(&mut env, &wasm, &options).expect_err("mutable globals must be rejected when disabled");
    assert!(matches!(err, CompileError::FeatureDisabled { feature: "mutable-globals" }));
}
