//! A lightweight event stream standing in for the gas pass's own AST (§4.F),
//! grounded on `gas.cc`'s recursive `ExprList` walk — flattened into events keyed by
//! operator index so the compiler's own operator walk can consult the resulting
//! plan without sharing any state with the type checker or emitter.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GasEventKind {
    /// A straight-line operator with a known flat cost.
    Simple(u64),
    /// Opens a nested list: `block`/`loop`/`if`-then. Flushes the enclosing run.
    Enter,
    /// Switches from an `if`'s then-list to its else-list within the same label.
    Else,
    /// Closes the innermost open list (`end`).
    Exit,
    /// A control-transfer instruction (`br`, `br_if`, `br_table`, `return`,
    /// `unreachable`, `return_call*`): ends the current run immediately after its
    /// own cost is charged.
    Branchy(u64),
}

#[derive(Debug, Clone, Copy)]
pub struct GasEvent {
    pub op_index: u32,
    pub kind: GasEventKind,
}
