//! Opcode dispatch: one match arm per opcode, consulting the lowering
//! state and emitting SSA through the builder.
//!
//! Dead code (after `br`, `return`, `unreachable`, a diverging branch of
//! an `if`) goes through [`Frontend::skip_dead_opcode`], which consumes
//! immediates to keep the cursor in sync and tracks the nesting of skipped
//! constructs, but emits nothing.

use anyhow::{bail, Result};

use super::cursor::{BytecodeCursor, Opcode};
use super::state::{ControlFrame, FrameKind};
use super::Frontend;
use crate::abi::TrapCode;
use crate::error::CompileError;
use crate::ssa::{BranchTarget, FloatCond, InstrData, IntCond, SsaType, Value};

impl<'m> Frontend<'m> {
    pub(super) fn lower_opcode(&mut self, op: Opcode, cursor: &mut BytecodeCursor) -> Result<()> {
        if self.state.is_unreachable() {
            return self.skip_dead_opcode(op, cursor);
        }
        use Opcode::*;
        match op {
            Unreachable => {
                let trap = self.trap_block(TrapCode::Unreachable)?;
                self.jump_to(trap, Vec::new())?;
                self.state.set_unreachable();
            }
            Nop => {}
            Drop => {
                self.state.pop()?;
            }
            Select => self.lower_select()?,
            SelectT => {
                let count = cursor.read_u32_leb()?;
                for _ in 0..count {
                    cursor.read_value_type()?;
                }
                self.lower_select()?;
            }

            // ─── Structured control ────────────────────────────────────
            Block => self.lower_block(cursor)?,
            Loop => self.lower_loop(cursor)?,
            If => self.lower_if(cursor)?,
            Else => self.lower_else(true)?,
            End => self.lower_end()?,
            Br => {
                let depth = cursor.read_u32_leb()?;
                self.lower_br(depth)?;
            }
            BrIf => {
                let depth = cursor.read_u32_leb()?;
                self.lower_br_if(depth)?;
            }
            BrTable => self.lower_br_table(cursor)?,
            Return => self.lower_return()?,
            Call => self.lower_call(cursor)?,
            CallIndirect => self.lower_call_indirect(cursor)?,

            // ─── Locals and globals ────────────────────────────────────
            LocalGet => {
                let var = self.local_var(cursor.read_u32_leb()?)?;
                let value = self.builder.find_value(var)?;
                self.state.push(value);
            }
            LocalSet => {
                let var = self.local_var(cursor.read_u32_leb()?)?;
                let value = self.state.pop()?;
                self.builder.define_variable_in_current_block(var, value)?;
            }
            LocalTee => {
                let var = self.local_var(cursor.read_u32_leb()?)?;
                let value = self.state.peek()?;
                self.builder.define_variable_in_current_block(var, value)?;
            }
            GlobalGet => {
                let index = cursor.read_u32_leb()?;
                let ty = match self.env.global_type(index) {
                    Some(ty) => ty.ssa_type(),
                    None => bail!(CompileError::invariant(format!(
                        "global index {} out of range",
                        index
                    ))),
                };
                let offset = self.env.offsets().global_offset(index);
                let module_ctx = self.module_ctx;
                let value = self.emit_value(InstrData::Load { ty, addr: module_ctx, offset })?;
                self.state.push(value);
            }
            GlobalSet => {
                let index = cursor.read_u32_leb()?;
                if self.env.global_type(index).is_none() {
                    bail!(CompileError::invariant(format!(
                        "global index {} out of range",
                        index
                    )));
                }
                let offset = self.env.offsets().global_offset(index);
                let value = self.state.pop()?;
                let module_ctx = self.module_ctx;
                self.builder.insert(InstrData::Store { value, addr: module_ctx, offset })?;
            }

            // ─── Constants ─────────────────────────────────────────────
            I32Const => {
                let imm = cursor.read_i32_leb()?;
                let value = self.emit_value(InstrData::Iconst32 { imm })?;
                self.state.push(value);
            }
            I64Const => {
                let imm = cursor.read_i64_leb()?;
                let value = self.emit_value(InstrData::Iconst64 { imm })?;
                self.state.push(value);
            }
            F32Const => {
                let bits = cursor.read_f32()?;
                let value = self.emit_value(InstrData::F32const { bits })?;
                self.state.push(value);
            }
            F64Const => {
                let bits = cursor.read_f64()?;
                let value = self.emit_value(InstrData::F64const { bits })?;
                self.state.push(value);
            }

            // ─── Arithmetic ────────────────────────────────────────────
            I32Add | I64Add => self.emit_binop(|lhs, rhs| InstrData::Iadd { lhs, rhs })?,
            I32Sub | I64Sub => self.emit_binop(|lhs, rhs| InstrData::Isub { lhs, rhs })?,
            I32Shl | I64Shl => self.emit_binop(|lhs, rhs| InstrData::Ishl { lhs, rhs })?,
            I32ShrS | I64ShrS => self.emit_binop(|lhs, rhs| InstrData::Isshr { lhs, rhs })?,
            I32ShrU | I64ShrU => self.emit_binop(|lhs, rhs| InstrData::Iushr { lhs, rhs })?,
            F32Add | F64Add => self.emit_binop(|lhs, rhs| InstrData::Fadd { lhs, rhs })?,
            F32Sub | F64Sub => self.emit_binop(|lhs, rhs| InstrData::Fsub { lhs, rhs })?,

            // ─── Comparisons ───────────────────────────────────────────
            I32Eqz => self.emit_eqz(SsaType::I32)?,
            I64Eqz => self.emit_eqz(SsaType::I64)?,
            I32Eq | I64Eq => self.emit_icmp(IntCond::Eq)?,
            I32Ne | I64Ne => self.emit_icmp(IntCond::Neq)?,
            I32LtS | I64LtS => self.emit_icmp(IntCond::LtS)?,
            I32LtU | I64LtU => self.emit_icmp(IntCond::LtU)?,
            I32GtS | I64GtS => self.emit_icmp(IntCond::GtS)?,
            I32GtU | I64GtU => self.emit_icmp(IntCond::GtU)?,
            I32LeS | I64LeS => self.emit_icmp(IntCond::LeS)?,
            I32LeU | I64LeU => self.emit_icmp(IntCond::LeU)?,
            I32GeS | I64GeS => self.emit_icmp(IntCond::GeS)?,
            I32GeU | I64GeU => self.emit_icmp(IntCond::GeU)?,
            F32Eq | F64Eq => self.emit_fcmp(FloatCond::Eq)?,
            F32Ne | F64Ne => self.emit_fcmp(FloatCond::Neq)?,
            F32Lt | F64Lt => self.emit_fcmp(FloatCond::Lt)?,
            F32Gt | F64Gt => self.emit_fcmp(FloatCond::Gt)?,
            F32Le | F64Le => self.emit_fcmp(FloatCond::Le)?,
            F32Ge | F64Ge => self.emit_fcmp(FloatCond::Ge)?,

            // ─── Extensions ────────────────────────────────────────────
            I64ExtendI32S => self.emit_extend(true, 32, 64)?,
            I64ExtendI32U => self.emit_extend(false, 32, 64)?,
            I32Extend8S => self.emit_extend(true, 8, 32)?,
            I32Extend16S => self.emit_extend(true, 16, 32)?,
            I64Extend8S => self.emit_extend(true, 8, 64)?,
            I64Extend16S => self.emit_extend(true, 16, 64)?,
            I64Extend32S => self.emit_extend(true, 32, 64)?,

            // ─── Memory ────────────────────────────────────────────────
            I32Load => self.lower_memory_load(cursor, SsaType::I32, 4)?,
            I64Load => self.lower_memory_load(cursor, SsaType::I64, 8)?,
            F32Load => self.lower_memory_load(cursor, SsaType::F32, 4)?,
            F64Load => self.lower_memory_load(cursor, SsaType::F64, 8)?,
            I32Store => self.lower_memory_store(cursor, 4)?,
            I64Store => self.lower_memory_store(cursor, 8)?,
            F32Store => self.lower_memory_store(cursor, 4)?,
            F64Store => self.lower_memory_store(cursor, 8)?,

            // No narrow access exists in the SSA instruction set, and
            // memory management needs runtime calls; both stay unlowered.
            _ => bail!(CompileError::unsupported(op)),
        }
        Ok(())
    }

    /// Dead code: consume immediates, track construct nesting, emit
    /// nothing.
    fn skip_dead_opcode(&mut self, op: Opcode, cursor: &mut BytecodeCursor) -> Result<()> {
        use Opcode::*;
        match op {
            Block | Loop | If => {
                cursor.read_block_type(self.env.types())?;
                self.state.enter_unreachable_construct();
            }
            Else => {
                // An `else` of a skipped `if` is itself skipped; an `else`
                // at depth 0 belongs to the live frame and re-activates
                // lowering on the (always reachable) else path.
                if self.state.unreachable_depth() == 0 {
                    self.lower_else(false)?;
                }
            }
            End => {
                if self.state.unreachable_depth() > 0 {
                    self.state.leave_unreachable_construct();
                } else {
                    self.lower_end()?;
                }
            }

            Br | BrIf | Call | LocalGet | LocalSet | LocalTee | GlobalGet | GlobalSet
            | RefFunc | TableGet | TableSet | MemorySize | MemoryGrow | DataDrop | ElemDrop
            | MemoryFill | TableGrow | TableSize | TableFill => {
                cursor.read_u32_leb()?;
            }
            CallIndirect | MemoryInit | TableInit | MemoryCopy | TableCopy => {
                cursor.read_u32_leb()?;
                cursor.read_u32_leb()?;
            }
            I32Const => {
                cursor.read_i32_leb()?;
            }
            I64Const => {
                cursor.read_i64_leb()?;
            }
            F32Const => {
                cursor.read_f32()?;
            }
            F64Const => {
                cursor.read_f64()?;
            }
            I32Load | I64Load | F32Load | F64Load | I32Load8S | I32Load8U | I32Load16S
            | I32Load16U | I64Load8S | I64Load8U | I64Load16S | I64Load16U | I64Load32S
            | I64Load32U | I32Store | I64Store | F32Store | F64Store | I32Store8 | I32Store16
            | I64Store8 | I64Store16 | I64Store32 => {
                cursor.read_u32_leb()?;
                cursor.read_u32_leb()?;
            }
            BrTable => {
                let count = cursor.read_u32_leb()?;
                for _ in 0..=count {
                    cursor.read_u32_leb()?;
                }
            }
            SelectT => {
                let count = cursor.read_u32_leb()?;
                for _ in 0..count {
                    cursor.read_value_type()?;
                }
            }
            RefNull => {
                cursor.read_value_type()?;
            }
            // SIMD immediates cannot be skipped without decoding the
            // sub-opcode, and the engine never lowers SIMD anyway.
            Simd => bail!(CompileError::unsupported(op)),
            _ => {}
        }
        Ok(())
    }

    // ─── Emission helpers ──────────────────────────────────────────────

    fn emit_binop(&mut self, make: impl FnOnce(Value, Value) -> InstrData) -> Result<()> {
        let rhs = self.state.pop()?;
        let lhs = self.state.pop()?;
        let value = self.emit_value(make(lhs, rhs))?;
        self.state.push(value);
        Ok(())
    }

    fn emit_icmp(&mut self, cond: IntCond) -> Result<()> {
        self.emit_binop(|lhs, rhs| InstrData::Icmp { cond, lhs, rhs })
    }

    fn emit_fcmp(&mut self, cond: FloatCond) -> Result<()> {
        self.emit_binop(|lhs, rhs| InstrData::Fcmp { cond, lhs, rhs })
    }

    fn emit_eqz(&mut self, ty: SsaType) -> Result<()> {
        let value = self.state.pop()?;
        let zero = self.zero_constant(ty)?;
        let result = self.emit_value(InstrData::Icmp { cond: IntCond::Eq, lhs: value, rhs: zero })?;
        self.state.push(result);
        Ok(())
    }

    fn emit_extend(&mut self, signed: bool, from_bits: u8, to_bits: u8) -> Result<()> {
        let value = self.state.pop()?;
        let data = if signed {
            InstrData::Sextend { from_bits, to_bits, value }
        } else {
            InstrData::Uextend { from_bits, to_bits, value }
        };
        let result = self.emit_value(data)?;
        self.state.push(result);
        Ok(())
    }

    // ─── Parametric ────────────────────────────────────────────────────

    /// `select` has no SSA opcode; it becomes a two-edge merge block with
    /// one parameter.
    fn lower_select(&mut self) -> Result<()> {
        let cond = self.state.pop()?;
        let if_zero = self.state.pop()?;
        let if_nonzero = self.state.pop()?;
        let ty = self.builder.value_type(if_nonzero);

        let merge = self.builder.allocate_block()?;
        let result = self.builder.add_block_param(merge, ty)?;
        self.brz_to(merge, cond, vec![if_zero])?;
        self.jump_to(merge, vec![if_nonzero])?;
        self.builder.seal(merge)?;
        self.builder.set_current_block(merge);
        self.state.push(result);
        Ok(())
    }

    // ─── Structured control ────────────────────────────────────────────

    fn lower_block(&mut self, cursor: &mut BytecodeCursor) -> Result<()> {
        let bt = cursor.read_block_type(self.env.types())?;
        let params: Vec<SsaType> = bt.params.iter().map(|p| p.ssa_type()).collect();
        let results: Vec<SsaType> = bt.results.iter().map(|r| r.ssa_type()).collect();

        let following = self.builder.allocate_block()?;
        for &ty in &results {
            self.builder.add_block_param(following, ty)?;
        }
        let original = self.entry_height(params.len())?;
        self.state.ctrl_push(ControlFrame {
            kind: FrameKind::Block,
            original_stack_height: original,
            header_block: None,
            following_block: following,
            params,
            results,
            cloned_args: Vec::new(),
        });
        Ok(())
    }

    fn lower_loop(&mut self, cursor: &mut BytecodeCursor) -> Result<()> {
        let bt = cursor.read_block_type(self.env.types())?;
        let params: Vec<SsaType> = bt.params.iter().map(|p| p.ssa_type()).collect();
        let results: Vec<SsaType> = bt.results.iter().map(|r| r.ssa_type()).collect();

        let header = self.builder.allocate_block()?;
        for &ty in &params {
            self.builder.add_block_param(header, ty)?;
        }
        let following = self.builder.allocate_block()?;
        for &ty in &results {
            self.builder.add_block_param(following, ty)?;
        }

        // Enter the loop: the block-type parameters travel into the header
        // as branch arguments and come back as the header's parameters.
        let args = self.state.pop_n(params.len())?;
        let original = self.state.height();
        self.jump_to(header, args)?;
        self.builder.set_current_block(header);
        for value in self.builder.block_params(header).to_vec() {
            self.state.push(value);
        }

        // The header stays unsealed until `End`: back-edges are unknown.
        self.state.ctrl_push(ControlFrame {
            kind: FrameKind::Loop,
            original_stack_height: original,
            header_block: Some(header),
            following_block: following,
            params,
            results,
            cloned_args: Vec::new(),
        });
        Ok(())
    }

    fn lower_if(&mut self, cursor: &mut BytecodeCursor) -> Result<()> {
        let bt = cursor.read_block_type(self.env.types())?;
        let params: Vec<SsaType> = bt.params.iter().map(|p| p.ssa_type()).collect();
        let results: Vec<SsaType> = bt.results.iter().map(|r| r.ssa_type()).collect();

        let cond = self.state.pop()?;
        let then_block = self.builder.allocate_block()?;
        let else_block = self.builder.allocate_block()?;
        let following = self.builder.allocate_block()?;
        for &ty in &results {
            self.builder.add_block_param(following, ty)?;
        }

        // The block-type parameters stay on the stack for the then branch;
        // the else branch re-pushes this snapshot on entry.
        let cloned_args = self.state.peek_n_copy(params.len())?;

        self.brz_to(else_block, cond, Vec::new())?;
        self.jump_to(then_block, Vec::new())?;
        // Each arm has exactly one predecessor.
        self.builder.seal(then_block)?;
        self.builder.seal(else_block)?;
        self.builder.set_current_block(then_block);

        let original = self.entry_height(params.len())?;
        self.state.ctrl_push(ControlFrame {
            kind: FrameKind::IfWithoutElse,
            original_stack_height: original,
            header_block: Some(else_block),
            following_block: following,
            params,
            results,
            cloned_args,
        });
        Ok(())
    }

    /// `else`, reachable or not: finish the then branch, restore the
    /// operand stack to the `if` entry snapshot, continue in the else
    /// block.
    fn lower_else(&mut self, reachable: bool) -> Result<()> {
        let frame = self.state.ctrl_peek_at(0)?;
        if frame.kind != FrameKind::IfWithoutElse {
            bail!(CompileError::invariant("else without matching if"));
        }
        let following = frame.following_block;
        let else_block = frame.header_block.expect("if frame has an else block");
        let results_len = frame.results.len();
        let original = frame.original_stack_height;
        let cloned_args = frame.cloned_args.clone();

        if reachable {
            let args = self.state.peek_n_copy(results_len)?;
            self.jump_to(following, args)?;
        } else {
            self.state.clear_unreachable();
        }

        self.state.truncate(original);
        for value in cloned_args {
            self.state.push(value);
        }
        self.builder.set_current_block(else_block);
        self.state.ctrl_top_mut()?.kind = FrameKind::IfWithElse;
        Ok(())
    }

    fn lower_end(&mut self) -> Result<()> {
        let frame = self.state.ctrl_pop()?;
        if self.state.is_unreachable() {
            self.state.clear_unreachable();
        } else {
            let expected = frame.original_stack_height + frame.results.len();
            if self.state.height() != expected {
                bail!(CompileError::invariant(format!(
                    "operand stack height {} at End, expected {}",
                    self.state.height(),
                    expected
                )));
            }
            let args = self.state.peek_n_copy(frame.results.len())?;
            self.jump_to(frame.following_block, args)?;
        }

        match frame.kind {
            FrameKind::Function => {
                // End of function; the caller finalizes the return block.
                self.done = true;
                return Ok(());
            }
            FrameKind::Loop => {
                // All back-edges are known now.
                let header = frame.header_block.expect("loop frame has a header");
                self.builder.seal(header)?;
            }
            FrameKind::IfWithoutElse => {
                // Implicit empty else: pass the cloned entry values
                // through. The validator only admits this when the block
                // type's parameters and results agree.
                if frame.cloned_args.len() != frame.results.len() {
                    bail!(CompileError::invariant(
                        "if without else whose parameters and results differ"
                    ));
                }
                let else_block = frame.header_block.expect("if frame has an else block");
                self.builder.set_current_block(else_block);
                self.jump_to(frame.following_block, frame.cloned_args.clone())?;
            }
            FrameKind::Block | FrameKind::IfWithElse => {}
        }

        // Every inbound terminator exists; no further predecessors.
        self.builder.seal(frame.following_block)?;
        self.builder.set_current_block(frame.following_block);
        self.state.truncate(frame.original_stack_height);
        let params = self.builder.block_params(frame.following_block).to_vec();
        for value in params.into_iter().take(frame.results.len()) {
            self.state.push(value);
        }
        Ok(())
    }

    fn lower_br(&mut self, depth: u32) -> Result<()> {
        let (target, arity) = self.state.ctrl_peek_at(depth)?.branch_destination();
        let args = self.state.peek_n_copy(arity)?;
        self.jump_to(target, args)?;
        self.state.set_unreachable();
        Ok(())
    }

    /// `br_if`: branch past the break to a fresh continuation when the
    /// condition is zero, otherwise take the break edge with its
    /// arguments.
    fn lower_br_if(&mut self, depth: u32) -> Result<()> {
        let cond = self.state.pop()?;
        let (target, arity) = self.state.ctrl_peek_at(depth)?.branch_destination();

        let continuation = self.builder.allocate_block()?;
        self.brz_to(continuation, cond, Vec::new())?;
        let args = self.state.peek_n_copy(arity)?;
        self.jump_to(target, args)?;

        self.builder.seal(continuation)?;
        self.builder.set_current_block(continuation);
        Ok(())
    }

    fn lower_br_table(&mut self, cursor: &mut BytecodeCursor) -> Result<()> {
        let count = cursor.read_u32_leb()?;
        let mut depths = Vec::with_capacity(count as usize + 1);
        for _ in 0..=count {
            depths.push(cursor.read_u32_leb()?);
        }
        let selector = self.state.pop()?;

        let default_depth = *depths.last().expect("br_table has a default label");
        let (_, arity) = self.state.ctrl_peek_at(default_depth)?.branch_destination();

        let mut targets = Vec::with_capacity(depths.len());
        for &depth in &depths {
            let (block, target_arity) = self.state.ctrl_peek_at(depth)?.branch_destination();
            if target_arity != arity {
                bail!(CompileError::invariant(format!(
                    "br_table target arity {} differs from default arity {}",
                    target_arity, arity
                )));
            }
            let args = self.state.peek_n_copy(arity)?;
            targets.push(BranchTarget::new(block, args));
        }

        let blocks: Vec<crate::ssa::Block> = targets.iter().map(|t| t.block).collect();
        let pred = match self.builder.current_block() {
            Some(b) => b,
            None => bail!(CompileError::invariant("no current block")),
        };
        let inst = self.builder.insert(InstrData::BrTable { selector, targets })?;
        for block in blocks {
            self.builder.add_predecessor(block, pred, inst)?;
        }
        self.state.set_unreachable();
        Ok(())
    }

    fn lower_return(&mut self) -> Result<()> {
        let ret = match self.builder.return_block() {
            Some(b) => b,
            None => bail!(CompileError::invariant("no return block")),
        };
        let args = self.state.peek_n_copy(self.func_results.len())?;
        self.jump_to(ret, args)?;
        self.state.set_unreachable();
        Ok(())
    }

    // ─── Calls ─────────────────────────────────────────────────────────

    fn lower_call(&mut self, cursor: &mut BytecodeCursor) -> Result<()> {
        let func = cursor.read_u32_leb()?;
        let (func_type, sig) = match (self.env.func_type(func), self.env.func_sig(func)) {
            (Some(ty), Some(sig)) => (ty.clone(), sig),
            _ => bail!(CompileError::invariant(format!(
                "call to unknown function {}",
                func
            ))),
        };
        let wasm_args = self.state.pop_n(func_type.params.len())?;

        // Make the caller's module context reachable from the execution
        // context before transferring control.
        self.spill_caller_module_ctx()?;

        let mut args = Vec::with_capacity(wasm_args.len() + 2);
        args.push(self.exec_ctx);
        args.push(self.module_ctx);
        args.extend(wasm_args);
        let result_tys: Vec<SsaType> = func_type.results.iter().map(|r| r.ssa_type()).collect();
        let inst = self.builder.insert_call(InstrData::Call { func, sig, args }, &result_tys)?;
        for value in self.builder.inst_results(inst).to_vec() {
            self.state.push(value);
        }
        Ok(())
    }

    /// `call_indirect`: table bounds check, slot load, null check, type
    /// check, then an indirect call through the function-instance record.
    fn lower_call_indirect(&mut self, cursor: &mut BytecodeCursor) -> Result<()> {
        let type_index = cursor.read_u32_leb()?;
        let table_index = cursor.read_u32_leb()?;
        if table_index != 0 {
            bail!(CompileError::Unsupported(format!(
                "call_indirect through table {}",
                table_index
            )));
        }
        let (func_type, sig) = match (self.env.type_at(type_index), self.env.sig_of_type(type_index))
        {
            (Some(ty), Some(sig)) => (ty.clone(), sig),
            _ => bail!(CompileError::invariant(format!(
                "call_indirect type index {} out of range",
                type_index
            ))),
        };
        let offs = *self.env.offsets();
        let module_ctx = self.module_ctx;

        let index = self.state.pop()?;

        // index < table length, or trap.
        let len = self.emit_value(InstrData::Load {
            ty: SsaType::I32,
            addr: module_ctx,
            offset: offs.table_len,
        })?;
        let in_bounds =
            self.emit_value(InstrData::Icmp { cond: IntCond::LtU, lhs: index, rhs: len })?;
        let oob = self.trap_block(TrapCode::TableOutOfBounds)?;
        self.brz_to(oob, in_bounds, Vec::new())?;

        // Load the function-instance pointer from the 8-byte table slot.
        let index64 = self.emit_value(InstrData::Uextend { from_bits: 32, to_bits: 64, value: index })?;
        let three = self.emit_value(InstrData::Iconst64 { imm: 3 })?;
        let byte_offset = self.emit_value(InstrData::Ishl { lhs: index64, rhs: three })?;
        let base = self.emit_value(InstrData::Load {
            ty: SsaType::I64,
            addr: module_ctx,
            offset: offs.table_base,
        })?;
        let slot = self.emit_value(InstrData::Iadd { lhs: base, rhs: byte_offset })?;
        let func_ref = self.emit_value(InstrData::Load { ty: SsaType::I64, addr: slot, offset: 0 })?;

        // Null slot traps.
        let null = self.trap_block(TrapCode::IndirectCallNullRef)?;
        self.brz_to(null, func_ref, Vec::new())?;

        // The stored type id must match the interned signature.
        let type_id = self.emit_value(InstrData::Load {
            ty: SsaType::I32,
            addr: func_ref,
            offset: offs.func_ref_type_id,
        })?;
        let wanted = self.emit_value(InstrData::Iconst32 { imm: sig.0 as i32 })?;
        let type_ok =
            self.emit_value(InstrData::Icmp { cond: IntCond::Eq, lhs: type_id, rhs: wanted })?;
        let mismatch = self.trap_block(TrapCode::IndirectCallTypeMismatch)?;
        self.brz_to(mismatch, type_ok, Vec::new())?;

        let callee = self.emit_value(InstrData::Load {
            ty: SsaType::I64,
            addr: func_ref,
            offset: offs.func_ref_executable,
        })?;
        let callee_module_ctx = self.emit_value(InstrData::Load {
            ty: SsaType::I64,
            addr: func_ref,
            offset: offs.func_ref_module_ctx,
        })?;

        let wasm_args = self.state.pop_n(func_type.params.len())?;
        self.spill_caller_module_ctx()?;

        let mut args = Vec::with_capacity(wasm_args.len() + 2);
        args.push(self.exec_ctx);
        args.push(callee_module_ctx);
        args.extend(wasm_args);
        let result_tys: Vec<SsaType> = func_type.results.iter().map(|r| r.ssa_type()).collect();
        let inst =
            self.builder.insert_call(InstrData::CallIndirect { sig, callee, args }, &result_tys)?;
        for value in self.builder.inst_results(inst).to_vec() {
            self.state.push(value);
        }
        Ok(())
    }

    fn spill_caller_module_ctx(&mut self) -> Result<()> {
        let offset = self.env.offsets().caller_module_context_ptr;
        let module_ctx = self.module_ctx;
        let exec_ctx = self.exec_ctx;
        self.builder
            .insert(InstrData::Store { value: module_ctx, addr: exec_ctx, offset })?;
        Ok(())
    }

    // ─── Memory accesses ───────────────────────────────────────────────

    /// Zero-extend the 32-bit address and trap unless
    /// `addr + offset + size` fits the current memory length.
    fn memory_checked_address(
        &mut self,
        addr32: Value,
        offset: u32,
        size: u32,
    ) -> Result<Value> {
        let offs = *self.env.offsets();
        let module_ctx = self.module_ctx;

        let addr = self.emit_value(InstrData::Uextend { from_bits: 32, to_bits: 64, value: addr32 })?;
        let span = self.emit_value(InstrData::Iconst64 { imm: offset as i64 + size as i64 })?;
        let end = self.emit_value(InstrData::Iadd { lhs: addr, rhs: span })?;
        let len = self.emit_value(InstrData::Load {
            ty: SsaType::I64,
            addr: module_ctx,
            offset: offs.memory_len,
        })?;
        let in_bounds = self.emit_value(InstrData::Icmp { cond: IntCond::LeU, lhs: end, rhs: len })?;
        let oob = self.trap_block(TrapCode::MemoryOutOfBounds)?;
        self.brz_to(oob, in_bounds, Vec::new())?;

        let base = self.emit_value(InstrData::Load {
            ty: SsaType::I64,
            addr: module_ctx,
            offset: offs.memory_base,
        })?;
        self.emit_value(InstrData::Iadd { lhs: base, rhs: addr })
    }

    fn lower_memory_load(
        &mut self,
        cursor: &mut BytecodeCursor,
        ty: SsaType,
        size: u32,
    ) -> Result<()> {
        let _align = cursor.read_u32_leb()?;
        let offset = cursor.read_u32_leb()?;
        let addr32 = self.state.pop()?;
        let addr = self.memory_checked_address(addr32, offset, size)?;
        let value = self.emit_value(InstrData::Load { ty, addr, offset })?;
        self.state.push(value);
        Ok(())
    }

    fn lower_memory_store(&mut self, cursor: &mut BytecodeCursor, size: u32) -> Result<()> {
        let _align = cursor.read_u32_leb()?;
        let offset = cursor.read_u32_leb()?;
        let value = self.state.pop()?;
        let addr32 = self.state.pop()?;
        let addr = self.memory_checked_address(addr32, offset, size)?;
        self.builder.insert(InstrData::Store { value, addr, offset })?;
        Ok(())
    }

    // ─── Small helpers ─────────────────────────────────────────────────

    /// Stack height at construct entry, block parameters excluded.
    fn entry_height(&self, params: usize) -> Result<usize> {
        match self.state.height().checked_sub(params) {
            Some(h) => Ok(h),
            None => bail!(CompileError::invariant(
                "operand stack shorter than block parameters"
            )),
        }
    }
}
