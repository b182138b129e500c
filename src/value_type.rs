//! Value types used by the type checker and the istream data model.

use core::fmt;

/// One of the Wasm value types, plus the two validator-only pseudo-types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValType {
    I32,
    I64,
    F32,
    F64,
    V128,
    /// Top type produced by unreachable code: matches any expected type.
    Any,
    /// The empty type, used for labels with no params/results.
    Void,
}

impl ValType {
    /// `true` if `self` satisfies an expected type `want`, honoring the `any` top type
    /// in both directions (either side may be `any` while validating dead code).
    pub fn matches(self, want: ValType) -> bool {
        self == want || self == ValType::Any || want == ValType::Any
    }

    /// Natural alignment, as a log2 byte count, for the memory access width implied
    /// by this value type's "full width" load/store (used for the *default* alignment
    /// check on ops like `i32.load`, `i64.store`, etc).
    pub fn natural_align_log2(self) -> u32 {
        match self {
            ValType::I32 | ValType::F32 => 2,
            ValType::I64 | ValType::F64 => 3,
            ValType::V128 => 4,
            ValType::Any | ValType::Void => 0,
        }
    }
}

impl fmt::Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValType::I32 => "i32",
            ValType::I64 => "i64",
            ValType::F32 => "f32",
            ValType::F64 => "f64",
            ValType::V128 => "v128",
            ValType::Any => "any",
            ValType::Void => "void",
        };
        f.write_str(s)
    }
}

impl From<wasmparser::ValType> for ValType {
    fn from(value: wasmparser::ValType) -> Self {
        match value {
            wasmparser::ValType::I32 => ValType::I32,
            wasmparser::ValType::I64 => ValType::I64,
            wasmparser::ValType::F32 => ValType::F32,
            wasmparser::ValType::F64 => ValType::F64,
            wasmparser::ValType::V128 => ValType::V128,
            wasmparser::ValType::FuncRef | wasmparser::ValType::ExternRef => ValType::I32,
        }
    }
}

/// An ordered function signature: parameter types followed by result types.
///
/// Identity is structural: two signatures with element-wise equal `params`/`results`
/// are the same signature and are interned once per [`crate::environment::Environment`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct FuncSig {
    pub params: alloc::vec::Vec<ValType>,
    pub results: alloc::vec::Vec<ValType>,
}

impl FuncSig {
    pub fn new(params: alloc::vec::Vec<ValType>, results: alloc::vec::Vec<ValType>) -> Self {
        Self { params, results }
    }

    pub fn is_nullary(&self) -> bool {
        self.params.is_empty() && self.results.is_empty()
    }
}
