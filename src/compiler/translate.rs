//! Per-function translation (§4.E "Function-body prologue/epilogue"): drives one
//! function body's operators through the type checker and the istream emitter in
//! lock step, consulting a pre-computed [`crate::gas::GasPlan`] to interleave
//! `AddGas` charges without coupling gas accounting to either pass.

use crate::{
    config::CompileOptions,
    error::CompileError,
    gas::{ast::GasEventKind, CostTable, GasBuilder, GasPlan},
    istream::{Istream, INVALID_OFFSET},
    label::{EmitterLabel, LabelStack},
    opcode::Opcode,
    typecheck::TypeChecker,
    value_type::{FuncSig, ValType},
};
use alloc::{format, vec::Vec};
use wasmparser::{FunctionBody, Operator};

/// Where a `call`'s target already resolves to, as of the moment the caller is
/// translated: either a real istream offset (an import already compiled in an
/// earlier `compile()`, or a same-module function translated earlier in this
/// drain loop — including itself, for direct recursion) or a host handle. `None`
/// means the target is a same-module function not yet translated, which still
/// needs the old forward-fixup treatment.
#[derive(Debug, Clone, Copy)]
pub enum CallTarget {
    Offset(u32),
    Host(crate::environment::HostFuncHandle),
}

/// Module-wide context a function translation needs read access to: resolved
/// signatures and which tables/memories exist, to validate `call_indirect` and
/// memory ops without reaching into the shared `Environment` directly.
pub struct ModuleCtx<'a> {
    pub signatures: &'a [FuncSig],
    pub func_sigs: &'a [u32],
    pub globals: &'a [(ValType, bool)],
    pub has_memory: bool,
    pub has_table: bool,
    /// Indexed by module-local function index; see [`CallTarget`].
    pub call_targets: &'a [Option<CallTarget>],
}

fn block_sig(ty: &wasmparser::BlockType, ctx: &ModuleCtx) -> Result<(Vec<ValType>, Vec<ValType>), CompileError> {
    match ty {
        wasmparser::BlockType::Empty => Ok((Vec::new(), Vec::new())),
        wasmparser::BlockType::Type(t) => Ok((Vec::new(), alloc::vec![ValType::from(*t)])),
        wasmparser::BlockType::FuncType(idx) => {
            let sig = ctx
                .signatures
                .get(*idx as usize)
                .ok_or(CompileError::InvalidIndex {
                    kind: crate::error::IndexKind::Signature,
                    index: *idx,
                    limit: ctx.signatures.len() as u32,
                })?;
            Ok((sig.params.clone(), sig.results.clone()))
        }
    }
}

/// Builds the gas AST events for one already-decoded operator list. Runs strictly
/// before emission; its output never feeds back into the type checker.
fn build_gas_plan(ops: &[Operator], options: &CompileOptions) -> Result<GasPlan, CompileError> {
    if !options.enable_gas_metering {
        return Ok(GasPlan::default());
    }
    let costs = CostTable::standard();
    let mut builder = GasBuilder::new();
    for (i, op) in ops.iter().enumerate() {
        let idx = i as u32;
        let kind = match op {
            Operator::Block { .. } | Operator::Loop { .. } | Operator::If { .. } => GasEventKind::Enter,
            Operator::Else => GasEventKind::Else,
            Operator::End => GasEventKind::Exit,
            Operator::Br { .. }
            | Operator::BrIf { .. }
            | Operator::BrTable { .. }
            | Operator::Return
            | Operator::Unreachable
            | Operator::ReturnCall { .. }
            | Operator::ReturnCallIndirect { .. } => {
                GasEventKind::Branchy(gas_opcode_cost(op, &costs)?)
            }
            _ => GasEventKind::Simple(gas_opcode_cost(op, &costs)?),
        };
        builder.record(idx, kind);
    }
    Ok(builder.finish())
}

/// Maps one operator to the [`Opcode`] the gas cost table knows about. Operators the
/// translator will reject outright (e.g. unrecognized proposal ops) are charged a
/// base cost of 1 here; `translate_function`'s own match is the authority on which
/// operators are actually supported.
fn gas_opcode_cost(op: &Operator, costs: &CostTable) -> Result<u64, CompileError> {
    match opcode_for(op) {
        Some(code) => costs.cost_of(code),
        None => Ok(1),
    }
}

fn opcode_for(op: &Operator) -> Option<Opcode> {
    use Opcode as O;
    Some(match op {
        Operator::Unreachable => O::Unreachable,
        Operator::Nop => O::Nop,
        Operator::Drop => O::Drop,
        Operator::Select => O::Select,
        Operator::LocalGet { .. } => O::LocalGet,
        Operator::LocalSet { .. } => O::LocalSet,
        Operator::LocalTee { .. } => O::LocalTee,
        Operator::GlobalGet { .. } => O::GlobalGet,
        Operator::GlobalSet { .. } => O::GlobalSet,
        Operator::I32Load { .. } => O::I32Load,
        Operator::I64Load { .. } => O::I64Load,
        Operator::F32Load { .. } => O::F32Load,
        Operator::F64Load { .. } => O::F64Load,
        Operator::I32Load8S { .. } => O::I32Load8S,
        Operator::I32Load8U { .. } => O::I32Load8U,
        Operator::I32Load16S { .. } => O::I32Load16S,
        Operator::I32Load16U { .. } => O::I32Load16U,
        Operator::I64Load8S { .. } => O::I64Load8S,
        Operator::I64Load8U { .. } => O::I64Load8U,
        Operator::I64Load16S { .. } => O::I64Load16S,
        Operator::I64Load16U { .. } => O::I64Load16U,
        Operator::I64Load32S { .. } => O::I64Load32S,
        Operator::I64Load32U { .. } => O::I64Load32U,
        Operator::I32Store { .. } => O::I32Store,
        Operator::I64Store { .. } => O::I64Store,
        Operator::F32Store { .. } => O::F32Store,
        Operator::F64Store { .. } => O::F64Store,
        Operator::I32Store8 { .. } => O::I32Store8,
        Operator::I32Store16 { .. } => O::I32Store16,
        Operator::I64Store8 { .. } => O::I64Store8,
        Operator::I64Store16 { .. } => O::I64Store16,
        Operator::I64Store32 { .. } => O::I64Store32,
        Operator::MemorySize { .. } => O::MemorySize,
        Operator::MemoryGrow { .. } => O::MemoryGrow,
        Operator::I32Const { .. } => O::I32Const,
        Operator::I64Const { .. } => O::I64Const,
        Operator::F32Const { .. } => O::F32Const,
        Operator::F64Const { .. } => O::F64Const,
        Operator::I32Eqz => O::I32Eqz,
        Operator::I32Eq => O::I32Eq,
        Operator::I32Ne => O::I32Ne,
        Operator::I32LtS => O::I32LtS,
        Operator::I32LtU => O::I32LtU,
        Operator::I32GtS => O::I32GtS,
        Operator::I32GtU => O::I32GtU,
        Operator::I32LeS => O::I32LeS,
        Operator::I32LeU => O::I32LeU,
        Operator::I32GeS => O::I32GeS,
        Operator::I32GeU => O::I32GeU,
        Operator::I64Eqz => O::I64Eqz,
        Operator::I64Eq => O::I64Eq,
        Operator::I64Ne => O::I64Ne,
        Operator::I64LtS => O::I64LtS,
        Operator::I64LtU => O::I64LtU,
        Operator::I64GtS => O::I64GtS,
        Operator::I64GtU => O::I64GtU,
        Operator::I64LeS => O::I64LeS,
        Operator::I64LeU => O::I64LeU,
        Operator::I64GeS => O::I64GeS,
        Operator::I64GeU => O::I64GeU,
        Operator::F32Eq => O::F32Eq,
        Operator::F32Ne => O::F32Ne,
        Operator::F32Lt => O::F32Lt,
        Operator::F32Gt => O::F32Gt,
        Operator::F32Le => O::F32Le,
        Operator::F32Ge => O::F32Ge,
        Operator::F64Eq => O::F64Eq,
        Operator::F64Ne => O::F64Ne,
        Operator::F64Lt => O::F64Lt,
        Operator::F64Gt => O::F64Gt,
        Operator::F64Le => O::F64Le,
        Operator::F64Ge => O::F64Ge,
        Operator::I32Clz => O::I32Clz,
        Operator::I32Ctz => O::I32Ctz,
        Operator::I32Popcnt => O::I32Popcnt,
        Operator::I32Add => O::I32Add,
        Operator::I32Sub => O::I32Sub,
        Operator::I32Mul => O::I32Mul,
        Operator::I32DivS => O::I32DivS,
        Operator::I32DivU => O::I32DivU,
        Operator::I32RemS => O::I32RemS,
        Operator::I32RemU => O::I32RemU,
        Operator::I32And => O::I32And,
        Operator::I32Or => O::I32Or,
        Operator::I32Xor => O::I32Xor,
        Operator::I32Shl => O::I32Shl,
        Operator::I32ShrS => O::I32ShrS,
        Operator::I32ShrU => O::I32ShrU,
        Operator::I32Rotl => O::I32Rotl,
        Operator::I32Rotr => O::I32Rotr,
        Operator::I64Clz => O::I64Clz,
        Operator::I64Ctz => O::I64Ctz,
        Operator::I64Popcnt => O::I64Popcnt,
        Operator::I64Add => O::I64Add,
        Operator::I64Sub => O::I64Sub,
        Operator::I64Mul => O::I64Mul,
        Operator::I64DivS => O::I64DivS,
        Operator::I64DivU => O::I64DivU,
        Operator::I64RemS => O::I64RemS,
        Operator::I64RemU => O::I64RemU,
        Operator::I64And => O::I64And,
        Operator::I64Or => O::I64Or,
        Operator::I64Xor => O::I64Xor,
        Operator::I64Shl => O::I64Shl,
        Operator::I64ShrS => O::I64ShrS,
        Operator::I64ShrU => O::I64ShrU,
        Operator::I64Rotl => O::I64Rotl,
        Operator::I64Rotr => O::I64Rotr,
        Operator::F32Abs => O::F32Abs,
        Operator::F32Neg => O::F32Neg,
        Operator::F32Ceil => O::F32Ceil,
        Operator::F32Floor => O::F32Floor,
        Operator::F32Trunc => O::F32Trunc,
        Operator::F32Nearest => O::F32Nearest,
        Operator::F32Sqrt => O::F32Sqrt,
        Operator::F32Add => O::F32Add,
        Operator::F32Sub => O::F32Sub,
        Operator::F32Mul => O::F32Mul,
        Operator::F32Div => O::F32Div,
        Operator::F32Min => O::F32Min,
        Operator::F32Max => O::F32Max,
        Operator::F32Copysign => O::F32Copysign,
        Operator::F64Abs => O::F64Abs,
        Operator::F64Neg => O::F64Neg,
        Operator::F64Ceil => O::F64Ceil,
        Operator::F64Floor => O::F64Floor,
        Operator::F64Trunc => O::F64Trunc,
        Operator::F64Nearest => O::F64Nearest,
        Operator::F64Sqrt => O::F64Sqrt,
        Operator::F64Add => O::F64Add,
        Operator::F64Sub => O::F64Sub,
        Operator::F64Mul => O::F64Mul,
        Operator::F64Div => O::F64Div,
        Operator::F64Min => O::F64Min,
        Operator::F64Max => O::F64Max,
        Operator::F64Copysign => O::F64Copysign,
        Operator::I32WrapI64 => O::I32WrapI64,
        Operator::I32TruncF32S => O::I32TruncF32S,
        Operator::I32TruncF32U => O::I32TruncF32U,
        Operator::I32TruncF64S => O::I32TruncF64S,
        Operator::I32TruncF64U => O::I32TruncF64U,
        Operator::I64ExtendI32S => O::I64ExtendI32S,
        Operator::I64ExtendI32U => O::I64ExtendI32U,
        Operator::I64TruncF32S => O::I64TruncF32S,
        Operator::I64TruncF32U => O::I64TruncF32U,
        Operator::I64TruncF64S => O::I64TruncF64S,
        Operator::I64TruncF64U => O::I64TruncF64U,
        Operator::F32ConvertI32S => O::F32ConvertI32S,
        Operator::F32ConvertI32U => O::F32ConvertI32U,
        Operator::F32ConvertI64S => O::F32ConvertI64S,
        Operator::F32ConvertI64U => O::F32ConvertI64U,
        Operator::F32DemoteF64 => O::F32DemoteF64,
        Operator::F64ConvertI32S => O::F64ConvertI32S,
        Operator::F64ConvertI32U => O::F64ConvertI32U,
        Operator::F64ConvertI64S => O::F64ConvertI64S,
        Operator::F64ConvertI64U => O::F64ConvertI64U,
        Operator::F64PromoteF32 => O::F64PromoteF32,
        Operator::I32Extend8S => O::I32Extend8S,
        Operator::I32Extend16S => O::I32Extend16S,
        Operator::I64Extend8S => O::I64Extend8S,
        Operator::I64Extend16S => O::I64Extend16S,
        Operator::I64Extend32S => O::I64Extend32S,
        Operator::Call { .. } => O::Call,
        Operator::CallIndirect { .. } => O::CallIndirect,
        Operator::ReturnCall { .. } => O::ReturnCallInternal,
        Operator::ReturnCallIndirect { .. } => O::ReturnCallIndirect,
        Operator::Br { .. } => O::Br,
        Operator::BrTable { .. } => O::BrTable,
        Operator::Return => O::Return,
        _ => return None,
    })
}

struct Translator<'m, 'i> {
    checker: TypeChecker,
    labels: &'m mut LabelStack,
    istream: Istream<'i>,
    ctx: &'m ModuleCtx<'m>,
    locals: &'m [ValType],
    #[allow(dead_code)]
    func_idx: u32,
}

macro_rules! unary_op {
    ($self:expr, $op:expr, $in:expr, $out:expr) => {{
        $self.checker.on_unary($in, $out)?;
        $self.istream.emit_opcode($op);
    }};
}

macro_rules! binary_op {
    ($self:expr, $op:expr, $in:expr, $out:expr) => {{
        $self.checker.on_binary($in, $out)?;
        $self.istream.emit_opcode($op);
    }};
}

macro_rules! compare_op {
    ($self:expr, $op:expr, $in:expr) => {{
        $self.checker.on_compare($in)?;
        $self.istream.emit_opcode($op);
    }};
}

impl<'m, 'i> Translator<'m, 'i> {
    fn emit_load(&mut self, op: Opcode, value_type: ValType) -> Result<(), CompileError> {
        self.checker.on_load(self.ctx.has_memory, value_type)?;
        self.istream.emit_opcode(op);
        Ok(())
    }

    fn emit_store(&mut self, op: Opcode, value_type: ValType) -> Result<(), CompileError> {
        self.checker.on_store(self.ctx.has_memory, value_type)?;
        self.istream.emit_opcode(op);
        Ok(())
    }

    fn call_sig(&self, func_idx: u32) -> Result<FuncSig, CompileError> {
        let sig_idx = *self.ctx.func_sigs.get(func_idx as usize).ok_or(CompileError::InvalidIndex {
            kind: crate::error::IndexKind::Func,
            index: func_idx,
            limit: self.ctx.func_sigs.len() as u32,
        })?;
        Ok(self.ctx.signatures[sig_idx as usize].clone())
    }

    /// Emits a direct `call`'s opcode + target payload: a resolved offset or host
    /// handle if `function_index` already has one (an import, or a same-module
    /// function translated earlier in this compile, including itself), else the
    /// forward-fixup path for a same-module function not yet translated.
    fn emit_call_target(&mut self, function_index: u32) -> Result<(), CompileError> {
        match self.ctx.call_targets.get(function_index as usize).and_then(|t| *t) {
            Some(CallTarget::Host(handle)) => {
                self.istream.emit_opcode(Opcode::InterpCallHost);
                self.istream.emit_u32(handle);
            }
            Some(CallTarget::Offset(offset)) => {
                self.istream.emit_opcode(Opcode::Call);
                self.istream.emit_u32(offset);
            }
            None => {
                self.istream.emit_opcode(Opcode::Call);
                self.istream
                    .emit_func_offset(self.labels, function_index, INVALID_OFFSET);
            }
        }
        Ok(())
    }

    fn sig_at(&self, sig_idx: u32) -> Result<FuncSig, CompileError> {
        self.ctx
            .signatures
            .get(sig_idx as usize)
            .cloned()
            .ok_or(CompileError::InvalidIndex {
                kind: crate::error::IndexKind::Signature,
                index: sig_idx,
                limit: self.ctx.signatures.len() as u32,
            })
    }

    fn one(&mut self, op: &Operator) -> Result<(), CompileError> {
        use Operator::*;
        match op {
            Unreachable => {
                self.checker.on_unreachable();
                self.istream.emit_opcode(Opcode::Unreachable);
            }
            Nop => {
                self.checker.on_nop();
                self.istream.emit_opcode(Opcode::Nop);
            }
            Block { blockty } => {
                let (params, results) = block_sig(blockty, self.ctx)?;
                self.checker.on_block(params, results)?;
                self.labels.push_label(EmitterLabel::block());
            }
            Loop { blockty } => {
                let (params, results) = block_sig(blockty, self.ctx)?;
                self.checker.on_loop(params, results)?;
                let header = self.istream.position();
                self.labels.push_label(EmitterLabel::loop_(header));
            }
            If { blockty } => {
                let (params, results) = block_sig(blockty, self.ctx)?;
                self.checker.on_if(params, results)?;
                self.istream.emit_opcode(Opcode::InterpBrUnless);
                let fixup_pos = self.istream.position();
                self.istream.emit_u32(INVALID_OFFSET);
                self.labels.push_label(EmitterLabel::if_(fixup_pos));
            }
            Else => {
                self.checker.on_else()?;
                self.istream.emit_opcode(Opcode::Br);
                let end_jump_fixup = self.istream.position();
                self.istream.emit_u32(INVALID_OFFSET);
                let then_fixup = self.labels.top().fixup_offset;
                let else_target = self.istream.position();
                self.istream.emit_at(then_fixup, else_target);
                self.labels.top_mut().fixup_offset = end_jump_fixup;
            }
            End => {
                // Captured before `on_end` truncates+re-pushes the checker's stack,
                // which would otherwise erase the information this needs.
                let closing_function = self.checker.depth() == 1;
                let end_drop_keep = closing_function.then(|| self.checker.function_drop_keep(self.locals.len()));
                self.checker.on_end()?;
                let (label, fixups) = self.labels.pop_label();
                self.istream.fixup_top_label(&fixups);
                if label.kind == crate::label::LabelKind::If && label.fixup_offset != INVALID_OFFSET {
                    let target = self.istream.position();
                    self.istream.emit_at(label.fixup_offset, target);
                } else if label.kind == crate::label::LabelKind::Else {
                    let target = self.istream.position();
                    self.istream.emit_at(label.fixup_offset, target);
                }
                if let Some((drop, keep)) = end_drop_keep {
                    self.istream.emit_drop_keep(drop, keep);
                    self.istream.emit_opcode(Opcode::Return);
                }
            }
            Br { relative_depth } => {
                let types = self.checker.on_br(*relative_depth)?;
                let (drop, keep) = self.checker.branch_drop_keep(*relative_depth, types.len())?;
                self.istream.emit_drop_keep(drop, keep);
                self.istream.emit_opcode(Opcode::Br);
                let depth_from_bottom = self.labels.depth_from_bottom(*relative_depth);
                let target = self.labels.label_at_depth(*relative_depth).branch_target;
                self.istream.emit_br_offset(self.labels, depth_from_bottom, target);
            }
            BrIf { relative_depth } => {
                let types = self.checker.on_br_if(*relative_depth)?;
                self.istream.emit_opcode(Opcode::InterpBrUnless);
                // `br_if` branches when true; the istream's conditional primitive
                // branches when false, so the branch-taken path is the fallthrough
                // and the fallthrough path becomes a forward skip around it.
                let skip_fixup = self.istream.position();
                self.istream.emit_u32(INVALID_OFFSET);
                let (drop, keep) = self.checker.branch_drop_keep(*relative_depth, types.len())?;
                self.istream.emit_drop_keep(drop, keep);
                self.istream.emit_opcode(Opcode::Br);
                let depth_from_bottom = self.labels.depth_from_bottom(*relative_depth);
                let target = self.labels.label_at_depth(*relative_depth).branch_target;
                self.istream.emit_br_offset(self.labels, depth_from_bottom, target);
                let after = self.istream.position();
                self.istream.emit_at(skip_fixup, after);
            }
            BrTable { targets } => {
                self.checker.br_table_begin();
                let mut depths = Vec::with_capacity(targets.len() as usize + 1);
                for t in targets.targets() {
                    let depth = t.map_err(|e| CompileError::from(e))?;
                    self.checker.br_table_target(depth)?;
                    depths.push(depth);
                }
                let default_depth = targets.default();
                self.checker.br_table_end(default_depth)?;
                depths.push(default_depth);

                // §6: `BrTable, count, data-offset` header, followed by an
                // `InterpData` block of one (target, drop, keep) triple per entry
                // (labeled targets then the default), 12 bytes each.
                self.istream.emit_opcode(Opcode::BrTable);
                self.istream.emit_u32(depths.len() as u32 - 1);
                // `InterpData` immediately follows this header, so its position is
                // known without a fixup: header (3 words) + the `InterpData` opcode
                // word itself.
                let data_start = self.istream.position() + 8;
                self.istream.emit_u32(data_start);
                self.istream.emit_opcode(Opcode::InterpData);
                for depth in &depths {
                    let arity = self.checker.branch_arity_at_depth(*depth)?;
                    let (drop, keep) = self.checker.branch_drop_keep(*depth, arity)?;
                    let depth_from_bottom = self.labels.depth_from_bottom(*depth);
                    let target = self.labels.label_at_depth(*depth).branch_target;
                    self.istream
                        .emit_br_table_entry(self.labels, depth_from_bottom, target, drop, keep);
                }
            }
            Return => {
                self.checker.on_return()?;
                let (drop, keep) = self.checker.function_drop_keep(self.locals.len());
                self.istream.emit_drop_keep(drop, keep);
                self.istream.emit_opcode(Opcode::Return);
            }
            Call { function_index } => {
                let sig = self.call_sig(*function_index)?;
                self.checker.on_call(&sig)?;
                self.emit_call_target(*function_index)?;
            }
            CallIndirect { type_index, table_index, .. } => {
                if !self.ctx.has_table {
                    return Err(CompileError::InvalidIndex {
                        kind: crate::error::IndexKind::Table,
                        index: *table_index,
                        limit: 0,
                    });
                }
                let sig = self.sig_at(*type_index)?;
                self.checker.on_call_indirect(&sig)?;
                self.istream.emit_opcode(Opcode::CallIndirect);
                self.istream.emit_u32(*type_index);
                self.istream.emit_u32(*table_index);
            }
            ReturnCall { function_index } => {
                let sig = self.call_sig(*function_index)?;
                let (drop, keep) = self.checker.return_call_drop_keep(sig.params.len());
                self.checker.on_return_call(&sig)?;
                self.istream.emit_drop_keep(drop, keep);
                // No tail-call-into-host primitive exists, so a host target degrades
                // to an ordinary call immediately followed by `return`.
                match self.ctx.call_targets.get(*function_index as usize).and_then(|t| *t) {
                    Some(CallTarget::Host(handle)) => {
                        self.istream.emit_opcode(Opcode::InterpCallHost);
                        self.istream.emit_u32(handle);
                        self.istream.emit_opcode(Opcode::Return);
                    }
                    Some(CallTarget::Offset(offset)) => {
                        self.istream.emit_opcode(Opcode::ReturnCallInternal);
                        self.istream.emit_u32(offset);
                        self.istream.emit_u32(sig.params.len() as u32);
                    }
                    None => {
                        self.istream.emit_opcode(Opcode::ReturnCallInternal);
                        self.istream
                            .emit_func_offset(self.labels, *function_index, INVALID_OFFSET);
                        self.istream.emit_u32(sig.params.len() as u32);
                    }
                }
            }
            ReturnCallIndirect { type_index, table_index } => {
                if !self.ctx.has_table {
                    return Err(CompileError::InvalidIndex {
                        kind: crate::error::IndexKind::Table,
                        index: *table_index,
                        limit: 0,
                    });
                }
                let sig = self.sig_at(*type_index)?;
                let (drop, keep) = self.checker.return_call_indirect_drop_keep(sig.params.len());
                self.checker.on_return_call_indirect(&sig)?;
                self.istream.emit_drop_keep(drop, keep);
                self.istream.emit_opcode(Opcode::ReturnCallIndirect);
                self.istream.emit_u32(*type_index);
                self.istream.emit_u32(*table_index);
                self.istream.emit_u32(sig.params.len() as u32);
            }
            Drop => {
                self.checker.on_drop()?;
                self.istream.emit_opcode(Opcode::Drop);
            }
            Select => {
                self.checker.on_select()?;
                self.istream.emit_opcode(Opcode::Select);
            }
            LocalGet { local_index } => {
                let slot = self.local_slot(*local_index);
                self.checker.on_local_get(self.local_type(*local_index)?);
                self.istream.emit_opcode(Opcode::LocalGet);
                self.istream.emit_u32(slot);
            }
            LocalSet { local_index } => {
                let slot = self.local_slot(*local_index);
                let t = self.local_type(*local_index)?;
                self.checker.on_local_set(t)?;
                self.istream.emit_opcode(Opcode::LocalSet);
                self.istream.emit_u32(slot);
            }
            LocalTee { local_index } => {
                let slot = self.local_slot(*local_index);
                let t = self.local_type(*local_index)?;
                self.checker.on_local_tee(t)?;
                self.istream.emit_opcode(Opcode::LocalTee);
                self.istream.emit_u32(slot);
            }
            GlobalGet { global_index } => {
                self.checker.on_global_get(self.global_type(*global_index)?);
                self.istream.emit_opcode(Opcode::GlobalGet);
                self.istream.emit_u32(*global_index);
            }
            GlobalSet { global_index } => {
                let (t, mutable) = self.global_type_mut(*global_index)?;
                self.checker.on_global_set(t, mutable)?;
                self.istream.emit_opcode(Opcode::GlobalSet);
                self.istream.emit_u32(*global_index);
            }
            I32Load { memarg } => self.emit_memarg_load(Opcode::I32Load, ValType::I32, memarg, 2)?,
            I64Load { memarg } => self.emit_memarg_load(Opcode::I64Load, ValType::I64, memarg, 3)?,
            F32Load { memarg } => self.emit_memarg_load(Opcode::F32Load, ValType::F32, memarg, 2)?,
            F64Load { memarg } => self.emit_memarg_load(Opcode::F64Load, ValType::F64, memarg, 3)?,
            I32Load8S { memarg } => self.emit_memarg_load(Opcode::I32Load8S, ValType::I32, memarg, 0)?,
            I32Load8U { memarg } => self.emit_memarg_load(Opcode::I32Load8U, ValType::I32, memarg, 0)?,
            I32Load16S { memarg } => self.emit_memarg_load(Opcode::I32Load16S, ValType::I32, memarg, 1)?,
            I32Load16U { memarg } => self.emit_memarg_load(Opcode::I32Load16U, ValType::I32, memarg, 1)?,
            I64Load8S { memarg } => self.emit_memarg_load(Opcode::I64Load8S, ValType::I64, memarg, 0)?,
            I64Load8U { memarg } => self.emit_memarg_load(Opcode::I64Load8U, ValType::I64, memarg, 0)?,
            I64Load16S { memarg } => self.emit_memarg_load(Opcode::I64Load16S, ValType::I64, memarg, 1)?,
            I64Load16U { memarg } => self.emit_memarg_load(Opcode::I64Load16U, ValType::I64, memarg, 1)?,
            I64Load32S { memarg } => self.emit_memarg_load(Opcode::I64Load32S, ValType::I64, memarg, 2)?,
            I64Load32U { memarg } => self.emit_memarg_load(Opcode::I64Load32U, ValType::I64, memarg, 2)?,
            I32Store { memarg } => self.emit_memarg_store(Opcode::I32Store, ValType::I32, memarg, 2)?,
            I64Store { memarg } => self.emit_memarg_store(Opcode::I64Store, ValType::I64, memarg, 3)?,
            F32Store { memarg } => self.emit_memarg_store(Opcode::F32Store, ValType::F32, memarg, 2)?,
            F64Store { memarg } => self.emit_memarg_store(Opcode::F64Store, ValType::F64, memarg, 3)?,
            I32Store8 { memarg } => self.emit_memarg_store(Opcode::I32Store8, ValType::I32, memarg, 0)?,
            I32Store16 { memarg } => self.emit_memarg_store(Opcode::I32Store16, ValType::I32, memarg, 1)?,
            I64Store8 { memarg } => self.emit_memarg_store(Opcode::I64Store8, ValType::I64, memarg, 0)?,
            I64Store16 { memarg } => self.emit_memarg_store(Opcode::I64Store16, ValType::I64, memarg, 1)?,
            I64Store32 { memarg } => self.emit_memarg_store(Opcode::I64Store32, ValType::I64, memarg, 2)?,
            MemorySize { .. } => {
                self.checker.on_memory_size(self.ctx.has_memory)?;
                self.istream.emit_opcode(Opcode::MemorySize);
            }
            MemoryGrow { .. } => {
                self.checker.on_memory_grow(self.ctx.has_memory)?;
                self.istream.emit_opcode(Opcode::MemoryGrow);
            }
            I32Const { value } => {
                self.checker.on_const(ValType::I32);
                self.istream.emit_opcode(Opcode::I32Const);
                self.istream.emit_i32(*value);
            }
            I64Const { value } => {
                self.checker.on_const(ValType::I64);
                self.istream.emit_opcode(Opcode::I64Const);
                self.istream.emit_i64(*value);
            }
            F32Const { value } => {
                self.checker.on_const(ValType::F32);
                self.istream.emit_opcode(Opcode::F32Const);
                self.istream.emit_u32(value.bits());
            }
            F64Const { value } => {
                self.checker.on_const(ValType::F64);
                self.istream.emit_opcode(Opcode::F64Const);
                self.istream.emit_u64(value.bits());
            }
            I32Eqz => unary_op!(self, Opcode::I32Eqz, ValType::I32, ValType::I32),
            I32Eq => compare_op!(self, Opcode::I32Eq, ValType::I32),
            I32Ne => compare_op!(self, Opcode::I32Ne, ValType::I32),
            I32LtS => compare_op!(self, Opcode::I32LtS, ValType::I32),
            I32LtU => compare_op!(self, Opcode::I32LtU, ValType::I32),
            I32GtS => compare_op!(self, Opcode::I32GtS, ValType::I32),
            I32GtU => compare_op!(self, Opcode::I32GtU, ValType::I32),
            I32LeS => compare_op!(self, Opcode::I32LeS, ValType::I32),
            I32LeU => compare_op!(self, Opcode::I32LeU, ValType::I32),
            I32GeS => compare_op!(self, Opcode::I32GeS, ValType::I32),
            I32GeU => compare_op!(self, Opcode::I32GeU, ValType::I32),
            I64Eqz => unary_op!(self, Opcode::I64Eqz, ValType::I64, ValType::I32),
            I64Eq => compare_op!(self, Opcode::I64Eq, ValType::I64),
            I64Ne => compare_op!(self, Opcode::I64Ne, ValType::I64),
            I64LtS => compare_op!(self, Opcode::I64LtS, ValType::I64),
            I64LtU => compare_op!(self, Opcode::I64LtU, ValType::I64),
            I64GtS => compare_op!(self, Opcode::I64GtS, ValType::I64),
            I64GtU => compare_op!(self, Opcode::I64GtU, ValType::I64),
            I64LeS => compare_op!(self, Opcode::I64LeS, ValType::I64),
            I64LeU => compare_op!(self, Opcode::I64LeU, ValType::I64),
            I64GeS => compare_op!(self, Opcode::I64GeS, ValType::I64),
            I64GeU => compare_op!(self, Opcode::I64GeU, ValType::I64),
            F32Eq => compare_op!(self, Opcode::F32Eq, ValType::F32),
            F32Ne => compare_op!(self, Opcode::F32Ne, ValType::F32),
            F32Lt => compare_op!(self, Opcode::F32Lt, ValType::F32),
            F32Gt => compare_op!(self, Opcode::F32Gt, ValType::F32),
            F32Le => compare_op!(self, Opcode::F32Le, ValType::F32),
            F32Ge => compare_op!(self, Opcode::F32Ge, ValType::F32),
            F64Eq => compare_op!(self, Opcode::F64Eq, ValType::F64),
            F64Ne => compare_op!(self, Opcode::F64Ne, ValType::F64),
            F64Lt => compare_op!(self, Opcode::F64Lt, ValType::F64),
            F64Gt => compare_op!(self, Opcode::F64Gt, ValType::F64),
            F64Le => compare_op!(self, Opcode::F64Le, ValType::F64),
            F64Ge => compare_op!(self, Opcode::F64Ge, ValType::F64),
            I32Clz => unary_op!(self, Opcode::I32Clz, ValType::I32, ValType::I32),
            I32Ctz => unary_op!(self, Opcode::I32Ctz, ValType::I32, ValType::I32),
            I32Popcnt => unary_op!(self, Opcode::I32Popcnt, ValType::I32, ValType::I32),
            I32Add => binary_op!(self, Opcode::I32Add, ValType::I32, ValType::I32),
            I32Sub => binary_op!(self, Opcode::I32Sub, ValType::I32, ValType::I32),
            I32Mul => binary_op!(self, Opcode::I32Mul, ValType::I32, ValType::I32),
            I32DivS => binary_op!(self, Opcode::I32DivS, ValType::I32, ValType::I32),
            I32DivU => binary_op!(self, Opcode::I32DivU, ValType::I32, ValType::I32),
            I32RemS => binary_op!(self, Opcode::I32RemS, ValType::I32, ValType::I32),
            I32RemU => binary_op!(self, Opcode::I32RemU, ValType::I32, ValType::I32),
            I32And => binary_op!(self, Opcode::I32And, ValType::I32, ValType::I32),
            I32Or => binary_op!(self, Opcode::I32Or, ValType::I32, ValType::I32),
            I32Xor => binary_op!(self, Opcode::I32Xor, ValType::I32, ValType::I32),
            I32Shl => binary_op!(self, Opcode::I32Shl, ValType::I32, ValType::I32),
            I32ShrS => binary_op!(self, Opcode::I32ShrS, ValType::I32, ValType::I32),
            I32ShrU => binary_op!(self, Opcode::I32ShrU, ValType::I32, ValType::I32),
            I32Rotl => binary_op!(self, Opcode::I32Rotl, ValType::I32, ValType::I32),
            I32Rotr => binary_op!(self, Opcode::I32Rotr, ValType::I32, ValType::I32),
            I64Clz => unary_op!(self, Opcode::I64Clz, ValType::I64, ValType::I64),
            I64Ctz => unary_op!(self, Opcode::I64Ctz, ValType::I64, ValType::I64),
            I64Popcnt => unary_op!(self, Opcode::I64Popcnt, ValType::I64, ValType::I64),
            I64Add => binary_op!(self, Opcode::I64Add, ValType::I64, ValType::I64),
            I64Sub => binary_op!(self, Opcode::I64Sub, ValType::I64, ValType::I64),
            I64Mul => binary_op!(self, Opcode::I64Mul, ValType::I64, ValType::I64),
            I64DivS => binary_op!(self, Opcode::I64DivS, ValType::I64, ValType::I64),
            I64DivU => binary_op!(self, Opcode::I64DivU, ValType::I64, ValType::I64),
            I64RemS => binary_op!(self, Opcode::I64RemS, ValType::I64, ValType::I64),
            I64RemU => binary_op!(self, Opcode::I64RemU, ValType::I64, ValType::I64),
            I64And => binary_op!(self, Opcode::I64And, ValType::I64, ValType::I64),
            I64Or => binary_op!(self, Opcode::I64Or, ValType::I64, ValType::I64),
            I64Xor => binary_op!(self, Opcode::I64Xor, ValType::I64, ValType::I64),
            I64Shl => binary_op!(self, Opcode::I64Shl, ValType::I64, ValType::I64),
            I64ShrS => binary_op!(self, Opcode::I64ShrS, ValType::I64, ValType::I64),
            I64ShrU => binary_op!(self, Opcode::I64ShrU, ValType::I64, ValType::I64),
            I64Rotl => binary_op!(self, Opcode::I64Rotl, ValType::I64, ValType::I64),
            I64Rotr => binary_op!(self, Opcode::I64Rotr, ValType::I64, ValType::I64),
            F32Abs => unary_op!(self, Opcode::F32Abs, ValType::F32, ValType::F32),
            F32Neg => unary_op!(self, Opcode::F32Neg, ValType::F32, ValType::F32),
            F32Ceil => unary_op!(self, Opcode::F32Ceil, ValType::F32, ValType::F32),
            F32Floor => unary_op!(self, Opcode::F32Floor, ValType::F32, ValType::F32),
            F32Trunc => unary_op!(self, Opcode::F32Trunc, ValType::F32, ValType::F32),
            F32Nearest => unary_op!(self, Opcode::F32Nearest, ValType::F32, ValType::F32),
            F32Sqrt => unary_op!(self, Opcode::F32Sqrt, ValType::F32, ValType::F32),
            F32Add => binary_op!(self, Opcode::F32Add, ValType::F32, ValType::F32),
            F32Sub => binary_op!(self, Opcode::F32Sub, ValType::F32, ValType::F32),
            F32Mul => binary_op!(self, Opcode::F32Mul, ValType::F32, ValType::F32),
            F32Div => binary_op!(self, Opcode::F32Div, ValType::F32, ValType::F32),
            F32Min => binary_op!(self, Opcode::F32Min, ValType::F32, ValType::F32),
            F32Max => binary_op!(self, Opcode::F32Max, ValType::F32, ValType::F32),
            F32Copysign => binary_op!(self, Opcode::F32Copysign, ValType::F32, ValType::F32),
            F64Abs => unary_op!(self, Opcode::F64Abs, ValType::F64, ValType::F64),
            F64Neg => unary_op!(self, Opcode::F64Neg, ValType::F64, ValType::F64),
            F64Ceil => unary_op!(self, Opcode::F64Ceil, ValType::F64, ValType::F64),
            F64Floor => unary_op!(self, Opcode::F64Floor, ValType::F64, ValType::F64),
            F64Trunc => unary_op!(self, Opcode::F64Trunc, ValType::F64, ValType::F64),
            F64Nearest => unary_op!(self, Opcode::F64Nearest, ValType::F64, ValType::F64),
            F64Sqrt => unary_op!(self, Opcode::F64Sqrt, ValType::F64, ValType::F64),
            F64Add => binary_op!(self, Opcode::F64Add, ValType::F64, ValType::F64),
            F64Sub => binary_op!(self, Opcode::F64Sub, ValType::F64, ValType::F64),
            F64Mul => binary_op!(self, Opcode::F64Mul, ValType::F64, ValType::F64),
            F64Div => binary_op!(self, Opcode::F64Div, ValType::F64, ValType::F64),
            F64Min => binary_op!(self, Opcode::F64Min, ValType::F64, ValType::F64),
            F64Max => binary_op!(self, Opcode::F64Max, ValType::F64, ValType::F64),
            F64Copysign => binary_op!(self, Opcode::F64Copysign, ValType::F64, ValType::F64),
            I32WrapI64 => unary_op!(self, Opcode::I32WrapI64, ValType::I64, ValType::I32),
            I32TruncF32S => unary_op!(self, Opcode::I32TruncF32S, ValType::F32, ValType::I32),
            I32TruncF32U => unary_op!(self, Opcode::I32TruncF32U, ValType::F32, ValType::I32),
            I32TruncF64S => unary_op!(self, Opcode::I32TruncF64S, ValType::F64, ValType::I32),
            I32TruncF64U => unary_op!(self, Opcode::I32TruncF64U, ValType::F64, ValType::I32),
            I64ExtendI32S => unary_op!(self, Opcode::I64ExtendI32S, ValType::I32, ValType::I64),
            I64ExtendI32U => unary_op!(self, Opcode::I64ExtendI32U, ValType::I32, ValType::I64),
            I64TruncF32S => unary_op!(self, Opcode::I64TruncF32S, ValType::F32, ValType::I64),
            I64TruncF32U => unary_op!(self, Opcode::I64TruncF32U, ValType::F32, ValType::I64),
            I64TruncF64S => unary_op!(self, Opcode::I64TruncF64S, ValType::F64, ValType::I64),
            I64TruncF64U => unary_op!(self, Opcode::I64TruncF64U, ValType::F64, ValType::I64),
            F32ConvertI32S => unary_op!(self, Opcode::F32ConvertI32S, ValType::I32, ValType::F32),
            F32ConvertI32U => unary_op!(self, Opcode::F32ConvertI32U, ValType::I32, ValType::F32),
            F32ConvertI64S => unary_op!(self, Opcode::F32ConvertI64S, ValType::I64, ValType::F32),
            F32ConvertI64U => unary_op!(self, Opcode::F32ConvertI64U, ValType::I64, ValType::F32),
            F32DemoteF64 => unary_op!(self, Opcode::F32DemoteF64, ValType::F64, ValType::F32),
            F64ConvertI32S => unary_op!(self, Opcode::F64ConvertI32S, ValType::I32, ValType::F64),
            F64ConvertI32U => unary_op!(self, Opcode::F64ConvertI32U, ValType::I32, ValType::F64),
            F64ConvertI64S => unary_op!(self, Opcode::F64ConvertI64S, ValType::I64, ValType::F64),
            F64ConvertI64U => unary_op!(self, Opcode::F64ConvertI64U, ValType::I64, ValType::F64),
            F64PromoteF32 => unary_op!(self, Opcode::F64PromoteF32, ValType::F32, ValType::F64),
            I32Extend8S => unary_op!(self, Opcode::I32Extend8S, ValType::I32, ValType::I32),
            I32Extend16S => unary_op!(self, Opcode::I32Extend16S, ValType::I32, ValType::I32),
            I64Extend8S => unary_op!(self, Opcode::I64Extend8S, ValType::I64, ValType::I64),
            I64Extend16S => unary_op!(self, Opcode::I64Extend16S, ValType::I64, ValType::I64),
            I64Extend32S => unary_op!(self, Opcode::I64Extend32S, ValType::I64, ValType::I64),
            other => {
                return Err(CompileError::Unimplemented {
                    opcode: format!("{other:?}"),
                })
            }
        }
        Ok(())
    }

    fn emit_memarg_load(
        &mut self,
        op: Opcode,
        value_type: ValType,
        memarg: &wasmparser::MemArg,
        natural_align_log2: u32,
    ) -> Result<(), CompileError> {
        self.checker.check_align(memarg.align as u32, natural_align_log2, false)?;
        self.emit_load(op, value_type)?;
        self.istream.emit_u32(memarg.offset as u32);
        Ok(())
    }

    fn emit_memarg_store(
        &mut self,
        op: Opcode,
        value_type: ValType,
        memarg: &wasmparser::MemArg,
        natural_align_log2: u32,
    ) -> Result<(), CompileError> {
        self.checker.check_align(memarg.align as u32, natural_align_log2, false)?;
        self.emit_store(op, value_type)?;
        self.istream.emit_u32(memarg.offset as u32);
        Ok(())
    }

    fn local_type(&self, idx: u32) -> Result<ValType, CompileError> {
        self.locals.get(idx as usize).copied().ok_or(CompileError::InvalidIndex {
            kind: crate::error::IndexKind::Local,
            index: idx,
            limit: self.locals.len() as u32,
        })
    }

    /// Stack-relative slot for a `local.*` access (§6 istream byte layout): the
    /// distance from the operand stack's current top down to this local's fixed
    /// position, computed from the checker's stack height *before* this operator's
    /// own push/pop — matching `TranslateLocalIndex` in the original reader.
    fn local_slot(&self, local_index: u32) -> u32 {
        self.checker.value_stack_len() as u32 + self.locals.len() as u32 - local_index
    }

    fn global_type(&self, idx: u32) -> Result<ValType, CompileError> {
        self.global_type_mut(idx).map(|(t, _)| t)
    }

    fn global_type_mut(&self, idx: u32) -> Result<(ValType, bool), CompileError> {
        self.ctx
            .globals
            .get(idx as usize)
            .copied()
            .ok_or(CompileError::InvalidIndex {
                kind: crate::error::IndexKind::Global,
                index: idx,
                limit: self.ctx.globals.len() as u32,
            })
    }
}

/// Translates one function body end to end: aggregates local declarations (§4.E.1),
/// builds the gas plan, then drives the type checker and emitter together.
///
/// `locals` receives the accumulated params+locals slot table for the caller to
/// store on the `FuncEntry`; `start_offset` is the istream position of the first
/// emitted instruction, already patched into any forward `call` fixups by the
/// caller before this returns.
pub fn translate_function(
    istream_buf: &mut Vec<u8>,
    labels: &mut LabelStack,
    ctx: &ModuleCtx,
    func_idx: u32,
    sig: &FuncSig,
    body: FunctionBody,
    options: &CompileOptions,
    locals_out: &mut Vec<ValType>,
) -> Result<(), CompileError> {
    locals_out.extend_from_slice(&sig.params);
    let mut locals_reader = body.get_locals_reader().map_err(CompileError::from)?;
    let mut local_count: u64 = sig.params.len() as u64;
    for _ in 0..locals_reader.get_count() {
        let (count, ty) = locals_reader.read().map_err(CompileError::from)?;
        local_count += count as u64;
        if local_count > crate::limits::MAX_LOCALS as u64 {
            return Err(CompileError::OutOfBounds(format!(
                "function declares more than {} locals",
                crate::limits::MAX_LOCALS
            )));
        }
        let vt = ValType::from(ty);
        for _ in 0..count {
            locals_out.push(vt);
        }
    }

    let ops_reader = body.get_operators_reader().map_err(CompileError::from)?;
    let ops: Vec<Operator> = ops_reader
        .into_iter()
        .collect::<Result<Vec<_>, _>>()
        .map_err(CompileError::from)?;

    let gas_plan = build_gas_plan(&ops, options)?;

    let mut checker = TypeChecker::new();
    checker.begin_function(sig);
    labels.push_label(EmitterLabel::func());

    {
        let mut istream = Istream::new(istream_buf);
        istream.emit_opcode(Opcode::InterpAlloca);
        istream.emit_u32(locals_out.len() as u32 - sig.params.len() as u32);

        let mut translator = Translator {
            checker,
            labels,
            istream,
            ctx,
            locals: locals_out.as_slice(),
            func_idx,
        };

        for (i, op) in ops.iter().enumerate() {
            if let Some(cost) = gas_plan.charge_before(i as u32) {
                translator.istream.emit_opcode(Opcode::AddGas);
                translator.istream.emit_i64(cost as i64);
            }
            translator.one(op)?;
        }
    }

    Ok(())
}
