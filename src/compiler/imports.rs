//! Import resolution against previously registered modules (§4.E "Import
//! resolution"), grounded on the teacher's `process_import` dispatch generalized to
//! check kind, limits, and signature/mutability compatibility explicitly.

use crate::{
    environment::{Environment, ExternVal, Global, Table},
    error::CompileError,
    value_type::ValType,
};
use alloc::string::ToString;

fn limits_compatible(import_initial: u32, import_max: Option<u32>, have_initial: u32, have_max: Option<u32>) -> bool {
    if have_initial < import_initial {
        return false;
    }
    match (import_max, have_max) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(want_max), Some(have_max)) => have_max <= want_max,
    }
}

pub fn resolve_func_import(
    env: &Environment,
    module_name: &str,
    field: &str,
    want_sig: &crate::value_type::FuncSig,
) -> Result<ExternVal, CompileError> {
    let reg = env.lookup_module(module_name).ok_or_else(|| CompileError::ImportUnresolved {
        module: module_name.to_string(),
        field: field.to_string(),
        reason: "module not registered".to_string(),
    })?;
    let extern_val = *reg.exports.get(field).ok_or_else(|| CompileError::ImportUnresolved {
        module: module_name.to_string(),
        field: field.to_string(),
        reason: "field not exported".to_string(),
    })?;
    let ExternVal::Func(func_idx) = extern_val else {
        return Err(CompileError::ImportUnresolved {
            module: module_name.to_string(),
            field: field.to_string(),
            reason: "export is not a function".to_string(),
        });
    };
    let have_sig = &env.signatures[env.functions[func_idx as usize].sig() as usize];
    if have_sig != want_sig {
        return Err(CompileError::ImportUnresolved {
            module: module_name.to_string(),
            field: field.to_string(),
            reason: "function signature mismatch".to_string(),
        });
    }
    Ok(extern_val)
}

pub fn resolve_global_import(
    env: &Environment,
    module_name: &str,
    field: &str,
    want_type: ValType,
    want_mutable: bool,
) -> Result<(ExternVal, Global), CompileError> {
    let reg = env.lookup_module(module_name).ok_or_else(|| CompileError::ImportUnresolved {
        module: module_name.to_string(),
        field: field.to_string(),
        reason: "module not registered".to_string(),
    })?;
    let extern_val = *reg.exports.get(field).ok_or_else(|| CompileError::ImportUnresolved {
        module: module_name.to_string(),
        field: field.to_string(),
        reason: "field not exported".to_string(),
    })?;
    let ExternVal::Global(idx) = extern_val else {
        return Err(CompileError::ImportUnresolved {
            module: module_name.to_string(),
            field: field.to_string(),
            reason: "export is not a global".to_string(),
        });
    };
    let have = env.globals[idx as usize].clone();
    if have.val_type != want_type || have.mutable != want_mutable {
        return Err(CompileError::ImportUnresolved {
            module: module_name.to_string(),
            field: field.to_string(),
            reason: "global type or mutability mismatch".to_string(),
        });
    }
    Ok((extern_val, have))
}

pub fn resolve_table_import(
    env: &Environment,
    module_name: &str,
    field: &str,
    want_initial: u32,
    want_max: Option<u32>,
) -> Result<(ExternVal, Table), CompileError> {
    let reg = env.lookup_module(module_name).ok_or_else(|| CompileError::ImportUnresolved {
        module: module_name.to_string(),
        field: field.to_string(),
        reason: "module not registered".to_string(),
    })?;
    let extern_val = *reg.exports.get(field).ok_or_else(|| CompileError::ImportUnresolved {
        module: module_name.to_string(),
        field: field.to_string(),
        reason: "field not exported".to_string(),
    })?;
    let ExternVal::Table(idx) = extern_val else {
        return Err(CompileError::ImportUnresolved {
            module: module_name.to_string(),
            field: field.to_string(),
            reason: "export is not a table".to_string(),
        });
    };
    let have = env.tables[idx as usize].clone();
    if !limits_compatible(want_initial, want_max, have.initial, have.maximum) {
        return Err(CompileError::ImportUnresolved {
            module: module_name.to_string(),
            field: field.to_string(),
            reason: "table limits incompatible".to_string(),
        });
    }
    Ok((extern_val, have))
}

pub fn resolve_memory_import(
    env: &Environment,
    module_name: &str,
    field: &str,
    want_initial: u32,
    want_max: Option<u32>,
) -> Result<ExternVal, CompileError> {
    let reg = env.lookup_module(module_name).ok_or_else(|| CompileError::ImportUnresolved {
        module: module_name.to_string(),
        field: field.to_string(),
        reason: "module not registered".to_string(),
    })?;
    let extern_val = *reg.exports.get(field).ok_or_else(|| CompileError::ImportUnresolved {
        module: module_name.to_string(),
        field: field.to_string(),
        reason: "field not exported".to_string(),
    })?;
    let ExternVal::Memory(idx) = extern_val else {
        return Err(CompileError::ImportUnresolved {
            module: module_name.to_string(),
            field: field.to_string(),
            reason: "export is not a memory".to_string(),
        });
    };
    let have = &env.memories[idx as usize];
    if !limits_compatible(want_initial, want_max, have.initial, have.maximum) {
        return Err(CompileError::ImportUnresolved {
            module: module_name.to_string(),
            field: field.to_string(),
            reason: "memory limits incompatible".to_string(),
        });
    }
    Ok(extern_val)
}
