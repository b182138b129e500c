//! The Istream Emitter (§4.C): a thin wrapper over an append-only byte buffer.

use crate::{label::LabelStack, opcode::Opcode};
use alloc::vec::Vec;

/// Sentinel marking an unresolved forward reference.
pub const INVALID_OFFSET: u32 = 0xFFFF_FFFF;

/// Writes little-endian opcodes and operands into the shared istream buffer,
/// recording and patching forward-reference fixups (§4.C).
pub struct Istream<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> Istream<'a> {
    pub fn new(buf: &'a mut Vec<u8>) -> Self {
        Self { buf }
    }

    pub fn position(&self) -> u32 {
        self.buf.len() as u32
    }

    pub fn emit_opcode(&mut self, op: Opcode) -> u32 {
        let pos = self.position();
        self.buf.extend_from_slice(&op.index().to_le_bytes());
        pos
    }

    pub fn emit_i8(&mut self, v: i8) {
        self.buf.push(v as u8);
    }

    pub fn emit_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn emit_i32(&mut self, v: i32) {
        self.emit_u32(v as u32);
    }

    pub fn emit_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn emit_i64(&mut self, v: i64) {
        self.emit_u64(v as u64);
    }

    pub fn emit_v128(&mut self, v: u128) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Patches 4 previously-emitted bytes at `offset` — the fixup primitive.
    pub fn emit_at(&mut self, offset: u32, value: u32) {
        let offset = offset as usize;
        self.buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// §4.C `emit_drop_keep`: drop `drop` values from just below the top `keep` values.
    pub fn emit_drop_keep(&mut self, drop: u32, keep: u32) {
        if drop == 0 {
            return;
        }
        if drop == 1 && keep == 0 {
            self.emit_opcode(Opcode::Drop);
            return;
        }
        self.emit_opcode(Opcode::InterpDropKeep);
        self.emit_u32(drop);
        self.emit_u32(keep);
    }

    /// §4.C `emit_br_offset`: records a depth-keyed fixup when `offset` is unresolved,
    /// then writes the offset (sentinel or real) regardless.
    pub fn emit_br_offset(&mut self, labels: &mut LabelStack, depth_from_bottom: usize, offset: u32) {
        if offset == INVALID_OFFSET {
            let pos = self.position();
            labels.record_depth_fixup(depth_from_bottom, pos);
        }
        self.emit_u32(offset);
    }

    /// §4.C `fixup_top_label`: overwrites every recorded forward-branch fixup target
    /// with the current istream position.
    pub fn fixup_top_label(&mut self, fixups: &[u32]) {
        let target = self.position();
        for &off in fixups {
            self.emit_at(off, target);
        }
    }

    /// §4.C `emit_func_offset`: appends a per-function fixup when the callee's offset
    /// is not yet known, otherwise writes the real offset.
    pub fn emit_func_offset(&mut self, labels: &mut LabelStack, func_idx: u32, current_offset: u32) {
        if current_offset == INVALID_OFFSET {
            let pos = self.position();
            labels.record_func_fixup(func_idx, pos);
        }
        self.emit_u32(current_offset);
    }

    /// Patches every fixup recorded for `func_idx` to `resolved_offset` (called from
    /// `BeginFunctionBody`, §4.E).
    pub fn patch_func_fixups(&mut self, fixups: &[u32], resolved_offset: u32) {
        for &off in fixups {
            self.emit_at(off, resolved_offset);
        }
    }

    /// §6 istream byte layout, `br_table`'s `InterpData` block: one `(target, drop,
    /// keep)` triple, 12 bytes. `target` goes through the same depth-keyed fixup as
    /// a plain `br`'s target.
    pub fn emit_br_table_entry(
        &mut self,
        labels: &mut LabelStack,
        depth_from_bottom: usize,
        target: u32,
        drop: u32,
        keep: u32,
    ) {
        self.emit_br_offset(labels, depth_from_bottom, target);
        self.emit_u32(drop);
        self.emit_u32(keep);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn emits_opcode_and_immediate_little_endian() {
        let mut buf = Vec::new();
        let mut istream = Istream::new(&mut buf);
        // `Unreachable` is opcode index 0, so its 4-byte encoding is all zero.
        istream.emit_opcode(Opcode::Unreachable);
        istream.emit_i32(1);
        assert_eq!(buf, hex!("00000000 01000000"));
    }

    #[test]
    fn emit_at_patches_in_place_without_growing_the_buffer() {
        let mut buf = Vec::new();
        let mut istream = Istream::new(&mut buf);
        let fixup = istream.emit_opcode(Opcode::Br);
        istream.emit_u32(INVALID_OFFSET);
        let len_before = buf.len();
        istream.emit_at(fixup, 0);
        assert_eq!(buf.len(), len_before);
        assert_eq!(&buf[0..4], &0u32.to_le_bytes());
    }

    #[test]
    fn drop_keep_elides_the_no_op_case() {
        let mut buf = Vec::new();
        let mut istream = Istream::new(&mut buf);
        istream.emit_drop_keep(0, 3);
        assert!(buf.is_empty());
    }
}
