//! The Compiler (§4.E): drives `wasmparser`'s binary reader over one module's bytes,
//! translating each function body while accumulating the in-progress [`Module`],
//! grounded on the teacher's `compiler/parser.rs` payload-dispatch loop (buffer code
//! entries, process them once every other section has been seen).

pub mod imports;
pub mod segments;
pub mod translate;

use crate::{
    config::CompileOptions,
    environment::{Environment, ExternVal, FuncEntry, Global, Memory, Table},
    error::{CompileError, IndexKind},
    limits,
    module::Module,
    value_type::{FuncSig, ValType},
};
use alloc::{
    string::{String, ToString},
    vec::Vec,
};
use wasmparser::{Parser, Payload};

struct PendingFunc<'a> {
    /// Module-local function index (imports counted first), the same index space
    /// `call`'s `function_index` operand and `func_fixups` are keyed by.
    module_func_idx: u32,
    sig: FuncSig,
    body: wasmparser::FunctionBody<'a>,
}

/// Drives the parse of one module's bytes to completion, leaving every side effect
/// (new signatures/functions/tables/memories/globals, the shared istream) recorded
/// directly on `env`, and returns the finished [`Module`] on success.
///
/// The caller (`crate::public::compile`) is responsible for the mark/reset rollback
/// around this call — this function assumes a clean slate and never rolls back
/// partial progress itself.
pub fn compile_module(
    env: &mut Environment,
    wasm: &[u8],
    options: &CompileOptions,
) -> Result<Module, CompileError> {
    let mut module = Module::new();
    let mut signatures: Vec<FuncSig> = Vec::new();
    let mut func_sigs: Vec<u32> = Vec::new();
    let mut globals: Vec<(ValType, bool)> = Vec::new();
    let mut has_memory = false;
    let mut has_table = false;
    let mut start_func: Option<u32> = None;
    let mut pending_funcs: Vec<PendingFunc> = Vec::new();
    let mut labels = crate::label::LabelStack::new();

    let mut istream = env.take_istream();
    let result = (|| -> Result<(), CompileError> {
        for payload in Parser::new(0).parse_all(wasm) {
            let payload = payload.map_err(CompileError::from)?;
            match payload {
                Payload::Version { .. } => {}
                Payload::TypeSection(reader) => {
                    for ty in reader {
                        let ty = ty.map_err(CompileError::from)?;
                        let wasmparser::Type::Func(func_ty) = ty;
                        if signatures.len() as u32 >= limits::MAX_FUNCTION_SIGNATURES {
                            return Err(CompileError::OutOfBounds("too many signatures".to_string()));
                        }
                        let sig = FuncSig::new(
                            func_ty.params().iter().map(|t| ValType::from(*t)).collect(),
                            func_ty.results().iter().map(|t| ValType::from(*t)).collect(),
                        );
                        let env_idx = env.push_signature(sig.clone());
                        module.sig_map.push(env_idx);
                        signatures.push(sig);
                    }
                }
                Payload::ImportSection(reader) => {
                    for imp in reader {
                        let imp = imp.map_err(CompileError::from)?;
                        process_import(env, &mut module, &signatures, &mut func_sigs, &mut globals, &mut has_memory, &mut has_table, imp)?;
                    }
                }
                Payload::FunctionSection(reader) => {
                    for type_idx in reader {
                        let type_idx = type_idx.map_err(CompileError::from)?;
                        if func_sigs.len() as u32 >= limits::MAX_FUNCTIONS {
                            return Err(CompileError::OutOfBounds("too many functions".to_string()));
                        }
                        func_sigs.push(type_idx);
                    }
                }
                Payload::TableSection(reader) => {
                    for t in reader {
                        let t = t.map_err(CompileError::from)?;
                        if has_table {
                            return Err(CompileError::DuplicateResource { kind: IndexKind::Table });
                        }
                        let initial = t.ty.initial;
                        let maximum = t.ty.maximum;
                        if initial > limits::MAX_TABLE_SIZE as u64
                            || maximum.map_or(false, |m| m > limits::MAX_TABLE_SIZE as u64)
                        {
                            return Err(CompileError::OutOfBounds("table size exceeds engine limit".to_string()));
                        }
                        let table = Table {
                            initial: initial as u32,
                            maximum: maximum.map(|m| m as u32),
                            elements: alloc::vec![None; initial as usize],
                        };
                        has_table = true;
                        let idx = env.push_table(table);
                        module.table_map.push(idx);
                    }
                }
                Payload::MemorySection(reader) => {
                    for m in reader {
                        let m = m.map_err(CompileError::from)?;
                        if has_memory {
                            return Err(CompileError::DuplicateResource { kind: IndexKind::Memory });
                        }
                        if m.initial > limits::MAX_MEMORY_PAGES as u64
                            || m.maximum.map_or(false, |mx| mx > limits::MAX_MEMORY_PAGES as u64)
                        {
                            return Err(CompileError::OutOfBounds("memory size exceeds engine limit".to_string()));
                        }
                        let mem = Memory::new(m.initial as u32, m.maximum.map(|mx| mx as u32));
                        has_memory = true;
                        let idx = env.push_memory(mem);
                        module.memory_map.push(idx);
                    }
                }
                Payload::GlobalSection(reader) => {
                    // Imports are always processed first (ImportSection precedes
                    // GlobalSection), so this is exactly the count of imported globals
                    // — the boundary §4.E's init-expr rule checks `global.get` against.
                    let num_imported_globals = module.global_map.len() as u32;
                    for g in reader {
                        let g = g.map_err(CompileError::from)?;
                        if !options.features.mutable_globals && g.ty.mutable {
                            return Err(CompileError::FeatureDisabled { feature: "mutable-globals" });
                        }
                        if globals.len() as u32 >= limits::MAX_GLOBALS {
                            return Err(CompileError::OutOfBounds("too many globals".to_string()));
                        }
                        let vt = ValType::from(g.ty.content_type);
                        let value = eval_const_global_init(
                            &g.init_expr,
                            &globals,
                            env,
                            &module.global_map,
                            num_imported_globals,
                            vt,
                        )?;
                        globals.push((vt, g.ty.mutable));
                        let idx = env.push_global(Global {
                            val_type: vt,
                            mutable: g.ty.mutable,
                            value,
                        });
                        module.global_map.push(idx);
                    }
                }
                Payload::ExportSection(reader) => {
                    for e in reader {
                        let e = e.map_err(CompileError::from)?;
                        let extern_val = resolve_export_target(&module, e.kind, e.index)?;
                        module.add_export(e.name.to_string(), extern_val)?;
                    }
                }
                Payload::StartSection { func, .. } => {
                    start_func = Some(func);
                }
                Payload::ElementSection(reader) => {
                    for elem in reader {
                        let elem = elem.map_err(CompileError::from)?;
                        process_element(&mut module, elem)?;
                    }
                }
                Payload::DataSection(reader) => {
                    for data in reader {
                        let data = data.map_err(CompileError::from)?;
                        process_data(&mut module, data)?;
                    }
                }
                Payload::CodeSectionEntry(body) => {
                    let num_imported = module.func_map.len();
                    let module_func_idx = (num_imported + pending_funcs.len()) as u32;
                    let sig_idx = func_sigs[module_func_idx as usize];
                    let sig = signatures[sig_idx as usize].clone();
                    pending_funcs.push(PendingFunc { module_func_idx, sig, body });
                }
                Payload::End(_) => {
                    // Imports and same-module functions translated earlier in this
                    // loop (including a function calling itself) already have a real
                    // istream offset or host handle; only a same-module call to a
                    // function not yet reached in this loop needs the forward-fixup
                    // path in `translate::emit_call_target`.
                    let num_imported = module.func_map.len();
                    let mut call_targets: Vec<Option<translate::CallTarget>> =
                        alloc::vec![None; func_sigs.len()];
                    for (local_idx, target) in call_targets.iter_mut().enumerate().take(num_imported) {
                        let env_idx = module.func_map[local_idx];
                        *target = Some(match &env.functions[env_idx as usize] {
                            FuncEntry::Defined { offset, .. } => translate::CallTarget::Offset(*offset),
                            FuncEntry::Host { handle, .. } => translate::CallTarget::Host(*handle),
                        });
                    }
                    for pending in pending_funcs.drain(..) {
                        let start_offset = istream.len() as u32;
                        call_targets[pending.module_func_idx as usize] =
                            Some(translate::CallTarget::Offset(start_offset));
                        let fixups = labels.take_func_fixups(pending.module_func_idx);
                        {
                            let mut patch = crate::istream::Istream::new(&mut istream);
                            patch.patch_func_fixups(&fixups, start_offset);
                        }
                        let ctx = translate::ModuleCtx {
                            signatures: &signatures,
                            func_sigs: &func_sigs,
                            globals: &globals,
                            has_memory,
                            has_table,
                            call_targets: &call_targets,
                        };
                        let mut locals_out = Vec::new();
                        translate::translate_function(
                            &mut istream,
                            &mut labels,
                            &ctx,
                            pending.module_func_idx,
                            &pending.sig,
                            pending.body,
                            options,
                            &mut locals_out,
                        )?;
                        let sig_idx = func_sigs[pending.module_func_idx as usize];
                        let env_func_idx = env.push_function(FuncEntry::Defined {
                            sig: module.sig_map[sig_idx as usize],
                            offset: start_offset,
                            locals: locals_out,
                        });
                        module.func_map.push(env_func_idx);
                    }
                }
                _ => {}
            }
        }
        Ok(())
    })();

    if let Err(e) = result {
        env.give_back_istream(istream);
        return Err(e);
    }

    if let Some(start) = start_func {
        let env_idx = *module.func_map.get(start as usize).ok_or(CompileError::InvalidIndex {
            kind: IndexKind::Func,
            index: start,
            limit: module.func_map.len() as u32,
        })?;
        let sig = &env.signatures[env.functions[env_idx as usize].sig() as usize];
        if !sig.is_nullary() && !options.allow_malformed_entrypoint_func_type {
            env.give_back_istream(istream);
            return Err(CompileError::InvalidIndex {
                kind: IndexKind::Func,
                index: start,
                limit: 0,
            });
        }
        module.start = Some(env_idx);
    }

    env.give_back_istream(istream);

    if !labels.all_func_fixups_resolved() {
        return Err(CompileError::MalformedBinary(
            "unresolved forward call to a function never defined".to_string(),
        ));
    }

    segments::commit_segments(env, &module)?;

    Ok(module)
}

fn resolve_export_target(
    module: &Module,
    kind: wasmparser::ExternalKind,
    index: u32,
) -> Result<ExternVal, CompileError> {
    Ok(match kind {
        wasmparser::ExternalKind::Func => ExternVal::Func(*module.func_map.get(index as usize).ok_or(
            CompileError::InvalidIndex { kind: IndexKind::Func, index, limit: module.func_map.len() as u32 },
        )?),
        wasmparser::ExternalKind::Table => ExternVal::Table(*module.table_map.get(index as usize).ok_or(
            CompileError::InvalidIndex { kind: IndexKind::Table, index, limit: module.table_map.len() as u32 },
        )?),
        wasmparser::ExternalKind::Memory => ExternVal::Memory(*module.memory_map.get(index as usize).ok_or(
            CompileError::InvalidIndex { kind: IndexKind::Memory, index, limit: module.memory_map.len() as u32 },
        )?),
        wasmparser::ExternalKind::Global => ExternVal::Global(*module.global_map.get(index as usize).ok_or(
            CompileError::InvalidIndex { kind: IndexKind::Global, index, limit: module.global_map.len() as u32 },
        )?),
        wasmparser::ExternalKind::Tag => {
            return Err(CompileError::FeatureDisabled { feature: "exceptions" })
        }
    })
}

#[allow(clippy::too_many_arguments)]
fn process_import(
    env: &mut Environment,
    module: &mut Module,
    signatures: &[FuncSig],
    func_sigs: &mut Vec<u32>,
    globals: &mut Vec<(ValType, bool)>,
    has_memory: &mut bool,
    has_table: &mut bool,
    imp: wasmparser::Import,
) -> Result<(), CompileError> {
    let resolved = match imp.ty {
        wasmparser::TypeRef::Func(type_idx) => {
            let sig = signatures.get(type_idx as usize).ok_or(CompileError::InvalidIndex {
                kind: IndexKind::Signature,
                index: type_idx,
                limit: signatures.len() as u32,
            })?;
            let extern_val = imports::resolve_func_import(env, imp.module, imp.name, sig)?;
            func_sigs.push(type_idx);
            let ExternVal::Func(func_idx) = extern_val else {
                unreachable!("resolve_func_import always returns ExternVal::Func")
            };
            module.func_map.push(func_idx);
            extern_val
        }
        wasmparser::TypeRef::Global(ty) => {
            let (extern_val, global) =
                imports::resolve_global_import(env, imp.module, imp.name, ValType::from(ty.content_type), ty.mutable)?;
            globals.push((global.val_type, global.mutable));
            let ExternVal::Global(idx) = extern_val else {
                unreachable!("resolve_global_import always returns ExternVal::Global")
            };
            module.global_map.push(idx);
            extern_val
        }
        wasmparser::TypeRef::Table(ty) => {
            if *has_table {
                return Err(CompileError::DuplicateResource { kind: IndexKind::Table });
            }
            let (extern_val, _) =
                imports::resolve_table_import(env, imp.module, imp.name, ty.initial as u32, ty.maximum.map(|m| m as u32))?;
            *has_table = true;
            let ExternVal::Table(idx) = extern_val else {
                unreachable!("resolve_table_import always returns ExternVal::Table")
            };
            module.table_map.push(idx);
            extern_val
        }
        wasmparser::TypeRef::Memory(ty) => {
            if *has_memory {
                return Err(CompileError::DuplicateResource { kind: IndexKind::Memory });
            }
            let extern_val =
                imports::resolve_memory_import(env, imp.module, imp.name, ty.initial as u32, ty.maximum.map(|m| m as u32))?;
            *has_memory = true;
            let ExternVal::Memory(idx) = extern_val else {
                unreachable!("resolve_memory_import always returns ExternVal::Memory")
            };
            module.memory_map.push(idx);
            extern_val
        }
        wasmparser::TypeRef::Tag(_) => {
            return Err(CompileError::FeatureDisabled { feature: "exceptions" });
        }
    };
    module.imports.push(crate::module::ImportRequest {
        module: imp.module.to_string(),
        field: imp.name.to_string(),
        resolved,
    });
    Ok(())
}

/// §4.E "Init expressions": a `global.get` operand may only name an *imported*
/// immutable global, whose value is already resident in `env`. `num_imported_globals`
/// is the prefix of `module.global_map`/`globals` that imports occupy; `declared_type`
/// is the type of the global currently being declared, which the reference must match.
fn eval_const_global_init(
    expr: &wasmparser::ConstExpr,
    globals: &[(ValType, bool)],
    env: &Environment,
    global_map: &[u32],
    num_imported_globals: u32,
    declared_type: ValType,
) -> Result<crate::environment::Value, CompileError> {
    let mut reader = expr.get_operators_reader();
    let op = reader.read().map_err(CompileError::from)?;
    let value = match op {
        wasmparser::Operator::I32Const { value } => crate::environment::Value::I32(value),
        wasmparser::Operator::I64Const { value } => crate::environment::Value::I64(value),
        wasmparser::Operator::F32Const { value } => crate::environment::Value::F32(value.bits()),
        wasmparser::Operator::F64Const { value } => crate::environment::Value::F64(value.bits()),
        wasmparser::Operator::GlobalGet { global_index } => {
            let (ref_type, mutable) = *globals.get(global_index as usize).ok_or(CompileError::InvalidIndex {
                kind: IndexKind::Global,
                index: global_index,
                limit: globals.len() as u32,
            })?;
            if global_index >= num_imported_globals {
                return Err(CompileError::InitExprIllegal(
                    "global initializer may only reference an imported global".to_string(),
                ));
            }
            if mutable {
                return Err(CompileError::InitExprIllegal(
                    "global initializer cannot reference a mutable global".to_string(),
                ));
            }
            if ref_type != declared_type {
                return Err(CompileError::TypeMismatch { expected: declared_type, found: ref_type });
            }
            let env_idx = global_map[global_index as usize];
            env.globals[env_idx as usize].value
        }
        other => {
            return Err(CompileError::InitExprIllegal(alloc::format!(
                "unsupported constant expression operator {other:?}"
            )))
        }
    };
    Ok(value)
}

fn eval_offset_init_expr(expr: &wasmparser::ConstExpr) -> Result<u32, CompileError> {
    let mut reader = expr.get_operators_reader();
    let op = reader.read().map_err(CompileError::from)?;
    match op {
        wasmparser::Operator::I32Const { value } => Ok(value as u32),
        other => Err(CompileError::InitExprIllegal(alloc::format!(
            "unsupported offset expression operator {other:?}"
        ))),
    }
}

fn process_element(module: &mut Module, elem: wasmparser::Element) -> Result<(), CompileError> {
    let (table_idx, offset) = match elem.kind {
        wasmparser::ElementKind::Active { table_index, offset_expr } => {
            let table = table_index.unwrap_or(0);
            let env_table = *module.table_map.get(table as usize).ok_or(CompileError::InvalidIndex {
                kind: IndexKind::Table,
                index: table,
                limit: module.table_map.len() as u32,
            })?;
            (env_table, eval_offset_init_expr(&offset_expr)?)
        }
        wasmparser::ElementKind::Passive | wasmparser::ElementKind::Declared => return Ok(()),
    };
    let func_indices = match elem.items {
        wasmparser::ElementItems::Functions(reader) => reader
            .into_iter()
            .map(|f| {
                f.map_err(CompileError::from).and_then(|idx| {
                    module.func_map.get(idx as usize).copied().ok_or(CompileError::InvalidIndex {
                        kind: IndexKind::Func,
                        index: idx,
                        limit: module.func_map.len() as u32,
                    })
                })
            })
            .collect::<Result<Vec<_>, _>>()?,
        wasmparser::ElementItems::Expressions(_) => {
            return Err(CompileError::FeatureDisabled { feature: "reference-types" })
        }
    };
    segments::stage_element_segment(module, table_idx, offset, func_indices);
    Ok(())
}

fn process_data(module: &mut Module, data: wasmparser::Data) -> Result<(), CompileError> {
    match data.kind {
        wasmparser::DataKind::Active { memory_index, offset_expr } => {
            let env_mem = *module.memory_map.get(memory_index as usize).ok_or(CompileError::InvalidIndex {
                kind: IndexKind::Memory,
                index: memory_index,
                limit: module.memory_map.len() as u32,
            })?;
            let offset = eval_offset_init_expr(&offset_expr)?;
            segments::stage_data_segment(module, env_mem, offset, data.data.to_vec());
        }
        wasmparser::DataKind::Passive => {}
    }
    Ok(())
}
