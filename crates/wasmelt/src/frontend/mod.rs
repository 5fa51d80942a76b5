//! The frontend: drives the cursor, the lowering state and the SSA
//! builder to translate one validated function body at a time.
//!
//! A [`Frontend`] borrows its module's read-only [`ModuleEnv`] and owns
//! the per-function arenas. Compiling a new function resets the arenas
//! without releasing memory, so a frontend can chew through a module's
//! code section with amortized-free setup. One instance is single-threaded;
//! compile functions in parallel by giving each thread its own frontend
//! over the shared environment.

pub mod cursor;
mod lower;
mod state;

pub use cursor::{BytecodeCursor, Opcode};

use anyhow::{bail, Context, Result};

use crate::abi::{TrapCode, TRAP_CODE_COUNT};
use crate::error::CompileError;
use crate::module::{ModuleEnv, ValueType};
use crate::ssa::{Block, FunctionBuilder, InstrData, SsaType, Value, Variable};
use state::{ControlFrame, FrameKind, LoweringState};

/// Translates validated function bodies into SSA, one at a time.
pub struct Frontend<'m> {
    env: &'m ModuleEnv,
    builder: FunctionBuilder,
    state: LoweringState,
    /// Execution-context pointer parameter of the current function.
    exec_ctx: Value,
    /// Module-context pointer parameter of the current function.
    module_ctx: Value,
    /// Result types of the current function.
    func_results: Vec<SsaType>,
    /// Number of Wasm locals (parameters included).
    num_locals: u32,
    /// Shared trap block per trap code, created on first use.
    trap_blocks: [Option<Block>; TRAP_CODE_COUNT],
    /// Set when the function-level `End` has been lowered.
    done: bool,
}

impl<'m> Frontend<'m> {
    pub fn new(env: &'m ModuleEnv) -> Self {
        Self {
            env,
            builder: FunctionBuilder::new(),
            state: LoweringState::new(),
            exec_ctx: Value(0),
            module_ctx: Value(0),
            func_results: Vec::new(),
            num_locals: 0,
            trap_blocks: [None; TRAP_CODE_COUNT],
            done: false,
        }
    }

    /// The SSA function built by the last `compile_function` call.
    pub fn ssa(&self) -> &FunctionBuilder {
        &self.builder
    }

    /// Clear all per-function state, keeping allocated capacity.
    pub fn reset(&mut self) {
        self.builder.reset();
        self.state.reset();
        self.func_results.clear();
        self.num_locals = 0;
        self.trap_blocks = [None; TRAP_CODE_COUNT];
        self.done = false;
    }

    /// Translate the body of function `func_index` into SSA.
    ///
    /// `locals` are the declared (non-parameter) locals, already expanded
    /// from their count-grouped encoding; `body` is the instruction
    /// sequence, ending with the function-level `End`.
    pub fn compile_function(
        &mut self,
        func_index: u32,
        locals: &[ValueType],
        body: &[u8],
    ) -> Result<()> {
        self.reset();
        let env = self.env;
        let func_type = match env.func_type(func_index) {
            Some(ty) => ty.clone(),
            None => bail!(CompileError::invariant(format!(
                "function index {} out of range",
                func_index
            ))),
        };

        // Return block first: the function's unique exit, parameterized by
        // its result types. Jumping to it is a return.
        let ret = self.builder.allocate_block()?;
        self.builder.set_return_block(ret);
        for &r in &func_type.results {
            self.builder.add_block_param(ret, r.ssa_type())?;
        }
        self.func_results = func_type.results.iter().map(|r| r.ssa_type()).collect();

        // Entry block: two implicit context pointers, then the Wasm
        // parameters. No predecessors, so it is sealed immediately.
        let entry = self.builder.allocate_block()?;
        self.exec_ctx = self.builder.add_block_param(entry, SsaType::Ptr)?;
        self.module_ctx = self.builder.add_block_param(entry, SsaType::Ptr)?;
        let mut param_values = Vec::with_capacity(func_type.params.len());
        for &p in &func_type.params {
            param_values.push(self.builder.add_block_param(entry, p.ssa_type())?);
        }
        self.builder.seal(entry)?;
        self.builder.set_current_block(entry);

        // Parameters read through the same variable mechanism as locals.
        let mut next_var = 0u32;
        for (&p, &value) in func_type.params.iter().zip(&param_values) {
            let var = Variable(next_var);
            next_var += 1;
            self.builder.declare_variable(var, p.ssa_type());
            self.builder.define_variable_in_block(var, value, entry);
        }
        // Declared locals are zero-initialized.
        for &l in locals {
            let var = Variable(next_var);
            next_var += 1;
            let ty = l.ssa_type();
            self.builder.declare_variable(var, ty);
            let zero = self.zero_constant(ty)?;
            self.builder.define_variable_in_block(var, zero, entry);
        }
        self.num_locals = next_var;

        self.state.ctrl_push(ControlFrame {
            kind: FrameKind::Function,
            original_stack_height: 0,
            header_block: None,
            following_block: ret,
            params: func_type.params.iter().map(|p| p.ssa_type()).collect(),
            results: self.func_results.clone(),
            cloned_args: Vec::new(),
        });

        let mut cursor = BytecodeCursor::new(body);
        while !self.done {
            if cursor.is_at_end() {
                bail!(CompileError::invariant("body ended before the function's End"));
            }
            let at = cursor.pc();
            let op = cursor.read_opcode()?;
            self.lower_opcode(op, &mut cursor)
                .with_context(|| format!("lowering {:?} at offset {}", op, at))?;
        }
        if !cursor.is_at_end() {
            bail!(CompileError::invariant(format!(
                "{} trailing bytes after the function's End",
                body.len() - cursor.pc()
            )));
        }

        self.finalize(ret)
    }

    /// Seal the late-bound blocks and give the return block its
    /// terminator.
    fn finalize(&mut self, ret: Block) -> Result<()> {
        self.builder.seal(ret)?;
        for code in 0..TRAP_CODE_COUNT {
            if let Some(block) = self.trap_blocks[code] {
                self.builder.seal(block)?;
            }
        }
        self.builder.set_current_block(ret);
        let args = self.builder.block_params(ret).to_vec();
        self.builder.insert(InstrData::Return { args })?;
        Ok(())
    }

    pub(super) fn zero_constant(&mut self, ty: SsaType) -> Result<Value> {
        let data = match ty {
            SsaType::I32 => InstrData::Iconst32 { imm: 0 },
            SsaType::I64 => InstrData::Iconst64 { imm: 0 },
            SsaType::F32 => InstrData::F32const { bits: 0 },
            SsaType::F64 => InstrData::F64const { bits: 0 },
            SsaType::Ptr | SsaType::V128 => {
                bail!(CompileError::Unsupported(format!("local of type {}", ty)))
            }
        };
        self.emit_value(data)
    }

    // ─── Shared emission helpers ───────────────────────────────────────

    /// Insert a single-result instruction and return its value.
    pub(super) fn emit_value(&mut self, data: InstrData) -> Result<Value> {
        let inst = self.builder.insert(data)?;
        Ok(self.builder.inst_results(inst)[0])
    }

    /// Emit `Jump` to `block` with `args` and record the edge.
    pub(super) fn jump_to(&mut self, block: Block, args: Vec<Value>) -> Result<()> {
        let pred = match self.builder.current_block() {
            Some(b) => b,
            None => bail!(CompileError::invariant("no current block")),
        };
        let inst = self.builder.insert(InstrData::Jump {
            target: crate::ssa::BranchTarget::new(block, args),
        })?;
        self.builder.add_predecessor(block, pred, inst)
    }

    /// Emit `Brz` (branch to `block` when `cond` is zero) and record the
    /// edge. Control falls through in the current block.
    pub(super) fn brz_to(&mut self, block: Block, cond: Value, args: Vec<Value>) -> Result<()> {
        let pred = match self.builder.current_block() {
            Some(b) => b,
            None => bail!(CompileError::invariant("no current block")),
        };
        let inst = self.builder.insert(InstrData::Brz {
            cond,
            target: crate::ssa::BranchTarget::new(block, args),
        })?;
        self.builder.add_predecessor(block, pred, inst)
    }

    /// The shared trap block for `code`, created on first use:
    /// store the code into the execution context, then `Trap`.
    pub(super) fn trap_block(&mut self, code: TrapCode) -> Result<Block> {
        if let Some(block) = self.trap_blocks[code.index()] {
            return Ok(block);
        }
        let saved = self.builder.current_block();
        let block = self.builder.allocate_block()?;
        self.builder.set_current_block(block);
        let code_value = self.emit_value(InstrData::Iconst32 { imm: code as i32 })?;
        self.builder.insert(InstrData::Store {
            value: code_value,
            addr: self.exec_ctx,
            offset: self.env.offsets().trap_code,
        })?;
        self.builder.insert(InstrData::Trap)?;
        if let Some(saved) = saved {
            self.builder.set_current_block(saved);
        }
        self.trap_blocks[code.index()] = Some(block);
        Ok(block)
    }

    pub(super) fn local_var(&self, index: u32) -> Result<Variable> {
        if index < self.num_locals {
            Ok(Variable(index))
        } else {
            bail!(CompileError::invariant(format!("local index {} out of range", index)))
        }
    }
}
