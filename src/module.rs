//! The compiled `Module` (§3 "Module") and the translation maps a single compile
//! accumulates while consuming a binary's sections.

use crate::{
    environment::{ExternVal, FnvHashMap, FuncIdx, GlobalIdx, MemIdx, SigIdx, TableIdx},
    error::CompileError,
};
use alloc::{string::String, vec::Vec};

/// One `(module, field)` import request recorded during the import section and
/// resolved against already-registered modules before compilation finishes.
#[derive(Debug, Clone)]
pub struct ImportRequest {
    pub module: String,
    pub field: String,
    pub resolved: ExternVal,
}

/// A pending data or element segment: an owned copy of its payload plus where it
/// lands, staged so a later out-of-bounds active offset can still be rejected
/// atomically (§5, §9 Design Notes — `(container_id, offset, length)` triples).
#[derive(Debug, Clone)]
pub struct PendingDataSegment {
    pub memory: MemIdx,
    pub offset: u32,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct PendingElementSegment {
    pub table: TableIdx,
    pub offset: u32,
    pub func_indices: Vec<FuncIdx>,
}

/// The module under construction by one `compile()` call, and the result handed
/// back on success (§3 "Module").
#[derive(Debug, Clone, Default)]
pub struct Module {
    /// Every import this module declared, in declaration order, already resolved.
    pub imports: Vec<ImportRequest>,
    pub start: Option<FuncIdx>,
    pub exports: FnvHashMap<String, ExternVal>,

    /// Maps this module's local type-section index to an environment `SigIdx`.
    pub sig_map: Vec<SigIdx>,
    /// Maps this module's local function index (imports first, then defined) to an
    /// environment `FuncIdx`.
    pub func_map: Vec<FuncIdx>,
    pub global_map: Vec<GlobalIdx>,
    pub table_map: Vec<TableIdx>,
    pub memory_map: Vec<MemIdx>,

    pub pending_data: Vec<PendingDataSegment>,
    pub pending_elements: Vec<PendingElementSegment>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_export(&mut self, name: String, value: ExternVal) -> Result<(), CompileError> {
        if self.exports.contains_key(&name) {
            return Err(CompileError::DuplicateExport { name });
        }
        self.exports.insert(name, value);
        Ok(())
    }

    pub fn func_count(&self) -> u32 {
        self.func_map.len() as u32
    }
}
