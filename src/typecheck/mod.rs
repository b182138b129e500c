//! The Type Checker (§4.B, §4.B.1): validates one function body as a stream of
//! operator events against a value-type stack and a label stack.

use crate::{
    error::CompileError,
    value_type::{FuncSig, ValType},
};
use alloc::vec::Vec;
use smallvec::SmallVec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelKind {
    Block,
    Loop,
    If,
    Else,
    Func,
}

/// The type checker's own label (§3 "Label (type-checker)"), kept separate from the
/// emitter's `Label` (§9 Design Notes).
#[derive(Debug, Clone)]
pub struct CheckLabel {
    pub kind: LabelKind,
    pub param_types: Vec<ValType>,
    pub result_types: Vec<ValType>,
    pub type_stack_limit: usize,
    pub unreachable: bool,
}

impl CheckLabel {
    /// The types a `br` targeting this label must find on the stack: a `loop`'s own
    /// parameters (branching back to the header re-enters with the params), or every
    /// other label's results.
    pub fn branch_types(&self) -> &[ValType] {
        if self.kind == LabelKind::Loop {
            &self.param_types
        } else {
            &self.result_types
        }
    }
}

pub struct TypeChecker {
    value_stack: SmallVec<[ValType; 16]>,
    labels: Vec<CheckLabel>,
    /// Expected signature for the target currently open `br_table` scope, established
    /// from its first target (§4.B.1).
    br_table_sig: Option<Vec<ValType>>,
}

impl TypeChecker {
    pub fn new() -> Self {
        Self {
            value_stack: SmallVec::new(),
            labels: Vec::new(),
            br_table_sig: None,
        }
    }

    /// §4.E "Function-body prologue": push the implicit function label so that
    /// `return` is structurally a `br` to it.
    pub fn begin_function(&mut self, sig: &FuncSig) {
        self.labels.push(CheckLabel {
            kind: LabelKind::Func,
            param_types: sig.params.clone(),
            result_types: sig.results.clone(),
            type_stack_limit: 0,
            unreachable: false,
        });
    }

    pub fn depth(&self) -> usize {
        self.labels.len()
    }

    pub fn is_function_done(&self) -> bool {
        self.labels.is_empty()
    }

    fn top(&self) -> &CheckLabel {
        self.labels.last().expect("label stack must be non-empty")
    }

    fn top_mut(&mut self) -> &mut CheckLabel {
        self.labels.last_mut().expect("label stack must be non-empty")
    }

    fn push_type(&mut self, t: ValType) {
        self.value_stack.push(t);
    }

    fn push_types(&mut self, types: &[ValType]) {
        for &t in types {
            self.push_type(t);
        }
    }

    /// Pops one value, honoring the `any` top type once the current label has gone
    /// unreachable and the stack above its `type_stack_limit` has been exhausted.
    fn pop_any(&mut self) -> Result<ValType, CompileError> {
        let label = self.top();
        if self.value_stack.len() > label.type_stack_limit {
            Ok(self.value_stack.pop().unwrap())
        } else if label.unreachable {
            Ok(ValType::Any)
        } else {
            Err(CompileError::TypeMismatch {
                expected: ValType::Any,
                found: ValType::Void,
            })
        }
    }

    fn pop_type(&mut self, expected: ValType) -> Result<ValType, CompileError> {
        let found = self.pop_any()?;
        if !found.matches(expected) {
            return Err(CompileError::TypeMismatch { expected, found });
        }
        Ok(found)
    }

    fn pop_types(&mut self, types: &[ValType]) -> Result<(), CompileError> {
        for &t in types.iter().rev() {
            self.pop_type(t)?;
        }
        Ok(())
    }

    /// Non-destructively checks that the top `types.len()` stack slots match `types`,
    /// relative to the *current* (innermost) label — used by `br`/`br_if`/`br_table`,
    /// which must not disturb the operand stack (the compiler's drop-keep handles the
    /// actual reshaping at runtime).
    fn check_types_top(&self, types: &[ValType]) -> Result<(), CompileError> {
        let label = self.top();
        let avail = self.value_stack.len() - label.type_stack_limit;
        for (i, &want) in types.iter().rev().enumerate() {
            let found = if i < avail {
                self.value_stack[self.value_stack.len() - 1 - i]
            } else if label.unreachable {
                ValType::Any
            } else {
                return Err(CompileError::TypeMismatch {
                    expected: want,
                    found: ValType::Void,
                });
            };
            if !found.matches(want) {
                return Err(CompileError::TypeMismatch { expected: want, found });
            }
        }
        Ok(())
    }

    fn set_unreachable(&mut self) {
        let limit = self.top().type_stack_limit;
        self.value_stack.truncate(limit);
        self.top_mut().unreachable = true;
    }

    fn label_at_depth(&self, depth: u32) -> Result<&CheckLabel, CompileError> {
        let len = self.labels.len();
        let idx = depth as usize;
        if idx >= len {
            return Err(CompileError::InvalidIndex {
                kind: crate::error::IndexKind::Label,
                index: depth,
                limit: len as u32,
            });
        }
        Ok(&self.labels[len - 1 - idx])
    }

    // ---- constants / locals / globals ----

    pub fn on_const(&mut self, t: ValType) {
        self.push_type(t);
    }

    pub fn on_local_get(&mut self, t: ValType) {
        self.push_type(t);
    }

    pub fn on_local_set(&mut self, t: ValType) -> Result<(), CompileError> {
        self.pop_type(t)?;
        Ok(())
    }

    pub fn on_local_tee(&mut self, t: ValType) -> Result<(), CompileError> {
        self.pop_type(t)?;
        self.push_type(t);
        Ok(())
    }

    pub fn on_global_get(&mut self, t: ValType) {
        self.push_type(t);
    }

    pub fn on_global_set(&mut self, t: ValType, mutable: bool) -> Result<(), CompileError> {
        if !mutable {
            return Err(CompileError::ImmutableAssignment { global: 0 });
        }
        self.pop_type(t)?;
        Ok(())
    }

    // ---- numeric ops ----

    pub fn on_unary(&mut self, input: ValType, output: ValType) -> Result<(), CompileError> {
        self.pop_type(input)?;
        self.push_type(output);
        Ok(())
    }

    pub fn on_binary(&mut self, input: ValType, output: ValType) -> Result<(), CompileError> {
        self.pop_type(input)?;
        self.pop_type(input)?;
        self.push_type(output);
        Ok(())
    }

    pub fn on_compare(&mut self, input: ValType) -> Result<(), CompileError> {
        self.on_binary(input, ValType::I32)
    }

    pub fn on_convert(&mut self, input: ValType, output: ValType) -> Result<(), CompileError> {
        self.on_unary(input, output)
    }

    // ---- memory ----

    pub fn check_memory_present(&self, has_memory: bool) -> Result<(), CompileError> {
        if has_memory {
            Ok(())
        } else {
            Err(CompileError::InvalidIndex {
                kind: crate::error::IndexKind::Memory,
                index: 0,
                limit: 0,
            })
        }
    }

    pub fn check_align(
        &self,
        align_log2: u32,
        natural_align_log2: u32,
        exact: bool,
    ) -> Result<(), CompileError> {
        let ok = if exact {
            align_log2 == natural_align_log2
        } else {
            align_log2 <= natural_align_log2
        };
        if ok {
            Ok(())
        } else {
            Err(CompileError::OutOfBounds(alloc::format!(
                "alignment 2^{align_log2} exceeds natural alignment 2^{natural_align_log2}"
            )))
        }
    }

    pub fn on_load(&mut self, has_memory: bool, value_type: ValType) -> Result<(), CompileError> {
        self.check_memory_present(has_memory)?;
        self.pop_type(ValType::I32)?;
        self.push_type(value_type);
        Ok(())
    }

    pub fn on_store(&mut self, has_memory: bool, value_type: ValType) -> Result<(), CompileError> {
        self.check_memory_present(has_memory)?;
        self.pop_type(value_type)?;
        self.pop_type(ValType::I32)?;
        Ok(())
    }

    pub fn on_memory_size(&mut self, has_memory: bool) -> Result<(), CompileError> {
        self.check_memory_present(has_memory)?;
        self.push_type(ValType::I32);
        Ok(())
    }

    pub fn on_memory_grow(&mut self, has_memory: bool) -> Result<(), CompileError> {
        self.check_memory_present(has_memory)?;
        self.pop_type(ValType::I32)?;
        self.push_type(ValType::I32);
        Ok(())
    }

    // ---- parametric ----

    pub fn on_drop(&mut self) -> Result<(), CompileError> {
        self.pop_any()?;
        Ok(())
    }

    pub fn on_select(&mut self) -> Result<(), CompileError> {
        self.pop_type(ValType::I32)?;
        let b = self.pop_any()?;
        let a = self.pop_any()?;
        if !a.matches(b) {
            return Err(CompileError::TypeMismatch { expected: a, found: b });
        }
        let result = if a == ValType::Any { b } else { a };
        self.push_type(result);
        Ok(())
    }

    pub fn on_nop(&mut self) {}

    pub fn on_unreachable(&mut self) {
        self.set_unreachable();
    }

    // ---- structured control ----

    fn begin_block_like(
        &mut self,
        kind: LabelKind,
        params: Vec<ValType>,
        results: Vec<ValType>,
    ) -> Result<(), CompileError> {
        self.pop_types(&params)?;
        let limit = self.value_stack.len();
        self.labels.push(CheckLabel {
            kind,
            param_types: params.clone(),
            result_types: results,
            type_stack_limit: limit,
            unreachable: false,
        });
        self.push_types(&params);
        Ok(())
    }

    pub fn on_block(&mut self, params: Vec<ValType>, results: Vec<ValType>) -> Result<(), CompileError> {
        self.begin_block_like(LabelKind::Block, params, results)
    }

    pub fn on_loop(&mut self, params: Vec<ValType>, results: Vec<ValType>) -> Result<(), CompileError> {
        self.begin_block_like(LabelKind::Loop, params, results)
    }

    pub fn on_if(&mut self, params: Vec<ValType>, results: Vec<ValType>) -> Result<(), CompileError> {
        self.pop_type(ValType::I32)?;
        self.begin_block_like(LabelKind::If, params, results)
    }

    pub fn on_else(&mut self) -> Result<(), CompileError> {
        let result_types = self.top().result_types.clone();
        self.pop_types(&result_types)?;
        if self.top().kind != LabelKind::If {
            return Err(CompileError::TypeMismatch {
                expected: ValType::Void,
                found: ValType::Void,
            });
        }
        let limit = self.top().type_stack_limit;
        self.value_stack.truncate(limit);
        let label = self.top_mut();
        label.kind = LabelKind::Else;
        label.unreachable = false;
        let params = label.param_types.clone();
        self.push_types(&params);
        Ok(())
    }

    pub fn on_end(&mut self) -> Result<(), CompileError> {
        let result_types = self.top().result_types.clone();
        self.pop_types(&result_types)?;
        let label = self.labels.pop().expect("label stack must be non-empty");
        self.value_stack.truncate(label.type_stack_limit);
        self.push_types(&label.result_types);
        Ok(())
    }

    // ---- branches ----

    /// Returns the branch types for the targeted label so the compiler can compute
    /// its drop-keep; does not mutate the stack (the caller decides whether to mark
    /// unreachable, since `br` does and `br_if` does not).
    pub fn check_branch(&self, depth: u32) -> Result<Vec<ValType>, CompileError> {
        let types = self.label_at_depth(depth)?.branch_types().to_vec();
        self.check_types_top(&types)?;
        Ok(types)
    }

    pub fn on_br(&mut self, depth: u32) -> Result<Vec<ValType>, CompileError> {
        let types = self.check_branch(depth)?;
        self.set_unreachable();
        Ok(types)
    }

    pub fn on_br_if(&mut self, depth: u32) -> Result<Vec<ValType>, CompileError> {
        self.pop_type(ValType::I32)?;
        self.check_branch(depth)
    }

    pub fn br_table_begin(&mut self) {
        self.br_table_sig = None;
    }

    pub fn br_table_target(&mut self, depth: u32) -> Result<(), CompileError> {
        let types = self.label_at_depth(depth)?.branch_types().to_vec();
        match &self.br_table_sig {
            None => {
                self.check_types_top(&types)?;
                self.br_table_sig = Some(types);
            }
            Some(expected) => {
                if expected.len() != types.len() {
                    return Err(CompileError::TypeMismatch {
                        expected: expected.first().copied().unwrap_or(ValType::Void),
                        found: types.first().copied().unwrap_or(ValType::Void),
                    });
                }
                self.check_types_top(expected)?;
            }
        }
        Ok(())
    }

    /// §8 boundary 10: zero labeled targets means only the default is validated.
    pub fn br_table_end(&mut self, default_depth: u32) -> Result<(), CompileError> {
        let types = match self.br_table_sig.take() {
            Some(types) => types,
            None => self.label_at_depth(default_depth)?.branch_types().to_vec(),
        };
        self.check_types_top(&types)?;
        self.pop_type(ValType::I32)?;
        self.set_unreachable();
        Ok(())
    }

    // ---- calls ----

    pub fn on_call(&mut self, sig: &FuncSig) -> Result<(), CompileError> {
        self.pop_types(&sig.params)?;
        self.push_types(&sig.results);
        Ok(())
    }

    pub fn on_call_indirect(&mut self, sig: &FuncSig) -> Result<(), CompileError> {
        self.pop_type(ValType::I32)?;
        self.on_call(sig)
    }

    fn on_return_like(&mut self, sig: &FuncSig) -> Result<(), CompileError> {
        self.pop_types(&sig.params)?;
        let func_results = self.labels[0].result_types.clone();
        if sig.results != func_results {
            return Err(CompileError::TypeMismatch {
                expected: func_results.first().copied().unwrap_or(ValType::Void),
                found: sig.results.first().copied().unwrap_or(ValType::Void),
            });
        }
        self.set_unreachable();
        Ok(())
    }

    pub fn on_return_call(&mut self, sig: &FuncSig) -> Result<(), CompileError> {
        self.on_return_like(sig)
    }

    pub fn on_return_call_indirect(&mut self, sig: &FuncSig) -> Result<(), CompileError> {
        self.pop_type(ValType::I32)?;
        self.on_return_like(sig)
    }

    pub fn on_return(&mut self) -> Result<(), CompileError> {
        let func_results = self.labels[0].result_types.clone();
        self.check_types_top(&func_results)?;
        self.set_unreachable();
        Ok(())
    }

    /// Current operand-stack height, for local-slot addressing (§6 istream byte
    /// layout: `local.* → stack-relative slot`).
    pub fn value_stack_len(&self) -> usize {
        self.value_stack.len()
    }

    // ---- drop-keep (§3 "drop-keep") ----

    /// The `type_stack_limit` belonging to the label `depth` levels up from the
    /// innermost — the floor a branch's drop-keep must never dig below.
    pub fn label_floor_at_depth(&self, depth: u32) -> Result<usize, CompileError> {
        Ok(self.label_at_depth(depth)?.type_stack_limit)
    }

    /// Arity of the label `depth` levels up — the `keep` a branch to it carries
    /// (§4.B.1; used per-target by `br_table`, which has no single fixed arity the
    /// way `br`/`br_if` do).
    pub fn branch_arity_at_depth(&self, depth: u32) -> Result<usize, CompileError> {
        Ok(self.label_at_depth(depth)?.branch_types().len())
    }

    /// Computes `(drop, keep)` to reshape the operand stack down to exactly `arity`
    /// values before a branch fires: everything above the targeted label's floor
    /// that isn't one of the `arity` values the label expects gets dropped.
    pub fn branch_drop_keep(&self, depth: u32, arity: usize) -> Result<(u32, u32), CompileError> {
        let floor = self.label_floor_at_depth(depth)?;
        let avail = self.value_stack.len().saturating_sub(floor);
        let drop = avail.saturating_sub(arity);
        Ok((drop as u32, arity as u32))
    }

    /// Drop-keep for an explicit `return` or the implicit return at a function
    /// body's final `end` (§4.E "Function-body epilogue", §4.E.1 "General return
    /// drop-keep"): drop the operand-stack excess above the function's results,
    /// plus `total_locals` (params+locals) — the runtime frame's local-slot
    /// region, reserved by `InterpAlloca` below the operand stack the checker
    /// tracks, which a `return` unwinds along with everything above it.
    /// Must be called before the state-mutating half of `on_end`/`on_return` would
    /// otherwise discard the information (`on_end` truncates and re-pushes; call
    /// this first for that case, order doesn't matter for `on_return`, which never
    /// truncates the stack).
    pub fn function_drop_keep(&self, total_locals: usize) -> (u32, u32) {
        let (drop, keep) = self.return_call_drop_keep(self.labels[0].result_types.len());
        (drop + total_locals as u32, keep)
    }

    /// `(drop, keep)` for `return_call`'s own argument-preserving reshape (§4.E.1):
    /// keep the callee's `arity` argument values already on top of the stack, drop
    /// everything below them down to the function label's floor (always 0, since a
    /// tail call can only be reached from top level or inside other blocks whose own
    /// `end` will have already reshaped past their floor). Must be called before
    /// `on_return_call` pops the arguments it validates.
    pub fn return_call_drop_keep(&self, arity: usize) -> (u32, u32) {
        let keep = arity;
        let drop = self.value_stack.len().saturating_sub(keep);
        (drop as u32, keep as u32)
    }

    /// Same as [`Self::return_call_drop_keep`], but for `return_call_indirect`, whose
    /// stack additionally carries the `i32` table index on top of the arguments
    /// (§4.E.1: "table index popped first... before the drop-keep is computed over
    /// the remaining argument values"). Must be called before
    /// `on_return_call_indirect` pops either.
    pub fn return_call_indirect_drop_keep(&self, arity: usize) -> (u32, u32) {
        let keep = arity;
        let drop = self.value_stack.len().saturating_sub(1).saturating_sub(keep);
        (drop as u32, keep as u32)
    }
}

impl Default for TypeChecker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value_type::ValType::*;

    fn sig(params: &[ValType], results: &[ValType]) -> FuncSig {
        FuncSig::new(params.to_vec(), results.to_vec())
    }

    #[test]
    fn simple_function_balances() {
        let mut tc = TypeChecker::new();
        tc.begin_function(&sig(&[], &[I32]));
        tc.on_const(I32);
        tc.on_return().unwrap();
        tc.on_end().unwrap();
        assert!(tc.is_function_done());
    }

    #[test]
    fn add_two_locals() {
        let mut tc = TypeChecker::new();
        tc.begin_function(&sig(&[I32], &[I32]));
        tc.on_local_get(I32);
        tc.on_local_get(I32);
        tc.on_binary(I32, I32).unwrap();
        tc.on_return().unwrap();
        tc.on_end().unwrap();
        assert!(tc.is_function_done());
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let mut tc = TypeChecker::new();
        tc.begin_function(&sig(&[], &[I32]));
        tc.on_const(F32);
        let err = tc.on_return();
        assert!(matches!(err, Err(CompileError::TypeMismatch { .. })));
    }

    #[test]
    fn dead_code_after_branch_tolerates_any() {
        let mut tc = TypeChecker::new();
        tc.begin_function(&sig(&[], &[I32]));
        tc.on_block(Vec::new(), vec![I32]).unwrap();
        tc.on_unreachable();
        // Dead code: wrong-looking operand types must still validate.
        tc.on_binary(F64, F64).unwrap();
        tc.on_end().unwrap();
        tc.on_return().unwrap();
        tc.on_end().unwrap();
        assert!(tc.is_function_done());
    }

    #[test]
    fn br_table_zero_targets_validates_default_only() {
        let mut tc = TypeChecker::new();
        tc.begin_function(&sig(&[], &[I32]));
        tc.on_block(Vec::new(), vec![I32]).unwrap();
        tc.on_const(I32);
        tc.on_const(I32);
        tc.br_table_begin();
        tc.br_table_end(0).unwrap();
        tc.on_end().unwrap();
        // `br_table` marked the block unreachable; the block's `end` still produces I32.
        tc.on_return().unwrap();
        tc.on_end().unwrap();
        assert!(tc.is_function_done());
    }
}
