//! The Gas Instrumenter (§4.F): a pass independent of type checking and emission,
//! grounded on `gas.cc`'s `GasWriter::WriteExprList`. It decides *where* an `AddGas`
//! belongs and *how much* it charges; `crate::compiler` decides *when* to actually
//! write the opcode, by asking a [`GasPlan`] before translating each operator.

pub mod ast;
pub mod cost_table;

use alloc::vec::Vec;
use hashbrown::HashMap;

pub use ast::{GasEvent, GasEventKind};
pub use cost_table::CostTable;

/// The result of one function body's gas pass: the operator index each straight-line
/// run starts at, and the total cost to charge there.
#[derive(Debug, Default, Clone)]
pub struct GasPlan {
    charges: HashMap<u32, u64>,
}

impl GasPlan {
    /// Returns the gas charge to emit immediately before operator `op_index`, if any.
    pub fn charge_before(&self, op_index: u32) -> Option<u64> {
        self.charges.get(&op_index).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.charges.is_empty()
    }
}

struct Frame {
    accum: u64,
    start_index: Option<u32>,
}

impl Frame {
    fn new() -> Self {
        Self {
            accum: 0,
            start_index: None,
        }
    }
}

/// Accumulates [`GasEvent`]s for one function body and reduces them to a [`GasPlan`].
pub struct GasBuilder {
    events: Vec<GasEvent>,
}

impl GasBuilder {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn record(&mut self, op_index: u32, kind: GasEventKind) {
        self.events.push(GasEvent { op_index, kind });
    }

    /// Reduces the recorded events into a plan. One frame per currently open list
    /// (function body, or a `block`/`loop`/`if` branch), mirroring `gas.cc`'s
    /// recursion into each nested `ExprList` without actually recursing: a flat
    /// stack does the same job for a flat event stream.
    pub fn finish(self) -> GasPlan {
        let mut charges = HashMap::new();
        let mut stack: Vec<Frame> = alloc::vec![Frame::new()];

        let flush = |frame: &mut Frame, charges: &mut HashMap<u32, u64>| {
            if let Some(start) = frame.start_index.take() {
                charges.insert(start, frame.accum);
            }
            frame.accum = 0;
        };

        for event in &self.events {
            match event.kind {
                GasEventKind::Simple(cost) => {
                    let frame = stack.last_mut().expect("gas frame stack is never empty");
                    if frame.start_index.is_none() {
                        frame.start_index = Some(event.op_index);
                    }
                    frame.accum += cost;
                }
                GasEventKind::Branchy(cost) => {
                    let frame = stack.last_mut().expect("gas frame stack is never empty");
                    if frame.start_index.is_none() {
                        frame.start_index = Some(event.op_index);
                    }
                    frame.accum += cost;
                    flush(frame, &mut charges);
                }
                GasEventKind::Enter => {
                    let frame = stack.last_mut().expect("gas frame stack is never empty");
                    flush(frame, &mut charges);
                    stack.push(Frame::new());
                }
                GasEventKind::Else => {
                    let frame = stack.last_mut().expect("gas frame stack is never empty");
                    flush(frame, &mut charges);
                }
                GasEventKind::Exit => {
                    let mut frame = stack.pop().expect("unbalanced gas Enter/Exit events");
                    flush(&mut frame, &mut charges);
                    if let Some(parent) = stack.last_mut() {
                        // Resuming the parent list after a nested block always starts
                        // a fresh run, even if the parent had nothing pending.
                        parent.start_index = None;
                    }
                }
            }
        }
        while let Some(mut frame) = stack.pop() {
            flush(&mut frame, &mut charges);
        }

        GasPlan { charges }
    }
}

impl Default for GasBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn straight_line_run_charges_once_at_start() {
        let mut b = GasBuilder::new();
        b.record(0, GasEventKind::Simple(1));
        b.record(1, GasEventKind::Simple(1));
        b.record(2, GasEventKind::Simple(1));
        b.record(3, GasEventKind::Exit);
        let plan = b.finish();
        assert_eq!(plan.charge_before(0), Some(3));
        assert_eq!(plan.charge_before(1), None);
    }

    #[test]
    fn branch_flushes_and_starts_new_segment_after() {
        let mut b = GasBuilder::new();
        b.record(0, GasEventKind::Simple(1));
        b.record(1, GasEventKind::Branchy(1));
        b.record(2, GasEventKind::Simple(1));
        b.record(3, GasEventKind::Exit);
        let plan = b.finish();
        assert_eq!(plan.charge_before(0), Some(2));
        assert_eq!(plan.charge_before(2), Some(1));
    }

    #[test]
    fn nested_block_gets_its_own_segment() {
        let mut b = GasBuilder::new();
        b.record(0, GasEventKind::Simple(1));
        b.record(1, GasEventKind::Enter);
        b.record(2, GasEventKind::Simple(1));
        b.record(3, GasEventKind::Exit);
        b.record(4, GasEventKind::Simple(1));
        b.record(5, GasEventKind::Exit);
        let plan = b.finish();
        assert_eq!(plan.charge_before(0), Some(1));
        assert_eq!(plan.charge_before(2), Some(1));
        assert_eq!(plan.charge_before(4), Some(1));
    }
}
