//! Data/element segment staging and commit (§5, §9 Design Notes): segments are held
//! as owned copies until every section has been seen, then committed against the
//! environment's tables/memories in one pass so an out-of-bounds active offset
//! aborts the whole compile rather than leaving a partially written memory.

use crate::{
    environment::{Environment, FuncIdx, MemIdx, TableIdx},
    error::CompileError,
    module::{Module, PendingDataSegment, PendingElementSegment},
};
use alloc::vec::Vec;

pub fn stage_data_segment(module: &mut Module, memory: MemIdx, offset: u32, bytes: Vec<u8>) {
    module.pending_data.push(PendingDataSegment { memory, offset, bytes });
}

pub fn stage_element_segment(
    module: &mut Module,
    table: TableIdx,
    offset: u32,
    func_indices: Vec<FuncIdx>,
) {
    module
        .pending_elements
        .push(PendingElementSegment { table, offset, func_indices });
}

/// Commits every staged segment into the environment. Checked up front, before any
/// byte is written, so a later segment's out-of-bounds offset can't leave an earlier
/// one applied (§5 "must commit all-or-nothing with the module").
pub fn commit_segments(env: &mut Environment, module: &Module) -> Result<(), CompileError> {
    for seg in &module.pending_data {
        let mem = &env.memories[seg.memory as usize];
        let end = (seg.offset as u64) + (seg.bytes.len() as u64);
        if end > mem.data.len() as u64 {
            return Err(CompileError::OutOfBounds(alloc::format!(
                "data segment end {end} exceeds memory size {}",
                mem.data.len()
            )));
        }
    }
    for seg in &module.pending_elements {
        let table = &env.tables[seg.table as usize];
        let end = (seg.offset as u64) + (seg.func_indices.len() as u64);
        if end > table.size() as u64 {
            return Err(CompileError::OutOfBounds(alloc::format!(
                "element segment end {end} exceeds table size {}",
                table.size()
            )));
        }
    }

    for seg in &module.pending_data {
        let mem = &mut env.memories[seg.memory as usize];
        let start = seg.offset as usize;
        mem.data[start..start + seg.bytes.len()].copy_from_slice(&seg.bytes);
    }
    for seg in &module.pending_elements {
        let table = &mut env.tables[seg.table as usize];
        let start = seg.offset as usize;
        for (i, func_idx) in seg.func_indices.iter().enumerate() {
            table.elements[start + i] = Some(*func_idx);
        }
    }
    Ok(())
}
