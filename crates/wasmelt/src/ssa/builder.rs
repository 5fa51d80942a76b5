//! Per-function SSA graph and incremental SSA construction.
//!
//! [`FunctionBuilder`] owns the basic blocks, instructions, values and
//! variables of one function under construction and provides the
//! primitives the lowerer drives: allocate blocks, insert instructions
//! into the current block, define and read variables, record predecessor
//! edges, seal blocks.
//!
//! Variable reads resolve through the algorithm of Braun et al., "Simple
//! and Efficient Construction of Static Single Assignment Form" (CC 2013):
//!
//! - a read first consults the block's local definitions;
//! - on an **unsealed** block (predecessors not all known yet, e.g. a loop
//!   header before its `End`) it appends a placeholder block parameter and
//!   records it as an incomplete phi;
//! - on a sealed block it recurses into the unique predecessor, or appends
//!   a block parameter and resolves the read in every predecessor,
//!   appending the result to that predecessor's branch arguments;
//! - [`seal`](FunctionBuilder::seal) completes every incomplete phi the
//!   same way once the predecessor set is final.
//!
//! A completed phi whose incoming arguments are all the same value (or the
//! phi itself) is trivial: the parameter is removed, recorded as an alias
//! of its unique source, and the argument lists of all inbound branches
//! are spliced. Removal can make other phis trivial, so a fixpoint sweep
//! re-examines the remaining ones; it terminates because every round
//! removes at least one parameter.

use std::collections::HashMap;

use anyhow::{bail, Result};

use super::instr::InstrData;
use super::types::{Block, Inst, SsaType, Value, Variable};
use crate::error::CompileError;

/// One recorded control-flow edge: `block` ends with `branch`, which
/// carries a target entry for the successor owning this edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PredEdge {
    pub block: Block,
    pub branch: Inst,
}

/// Where a value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueDef {
    /// Parameter of `block`.
    Param { block: Block },
    /// `num`-th result of `inst`.
    InstResult { inst: Inst, num: u16 },
}

#[derive(Debug, Default)]
struct BlockData {
    params: Vec<Value>,
    preds: Vec<PredEdge>,
    insts: Vec<Inst>,
    sealed: bool,
    terminated: bool,
    /// Last definition of each variable on exit from this block.
    defs: HashMap<Variable, Value>,
    /// Placeholder parameters awaiting the predecessor set (unsealed only).
    incomplete_phis: Vec<(Variable, Value)>,
}

/// SSA builder state for a single function.
#[derive(Debug, Default)]
pub struct FunctionBuilder {
    blocks: Vec<BlockData>,
    insts: Vec<InstrData>,
    /// Owning block of each instruction.
    inst_blocks: Vec<Block>,
    /// Result values of each instruction.
    inst_results: Vec<Vec<Value>>,
    value_types: Vec<SsaType>,
    value_defs: Vec<ValueDef>,
    /// Removed trivial phis, pointing at their replacement.
    aliases: HashMap<Value, Value>,
    /// Declared type per variable index.
    variable_types: Vec<Option<SsaType>>,
    /// Every phi parameter ever inserted, for the triviality sweep.
    phis: Vec<(Block, Value)>,
    current: Option<Block>,
    ret_block: Option<Block>,
}

impl FunctionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all per-function arenas without releasing their memory.
    pub fn reset(&mut self) {
        self.blocks.clear();
        self.insts.clear();
        self.inst_blocks.clear();
        self.inst_results.clear();
        self.value_types.clear();
        self.value_defs.clear();
        self.aliases.clear();
        self.variable_types.clear();
        self.phis.clear();
        self.current = None;
        self.ret_block = None;
    }

    // ─── Blocks ────────────────────────────────────────────────────────

    /// Create a new, unsealed, empty block.
    pub fn allocate_block(&mut self) -> Result<Block> {
        if self.blocks.len() >= u32::MAX as usize {
            bail!(CompileError::Overflow("blocks"));
        }
        let block = Block(self.blocks.len() as u32);
        self.blocks.push(BlockData::default());
        Ok(block)
    }

    /// Mark `block` as the function's unique exit. Affects only the dump.
    pub fn set_return_block(&mut self, block: Block) {
        self.ret_block = Some(block);
    }

    pub fn return_block(&self) -> Option<Block> {
        self.ret_block
    }

    /// Subsequent insertions append to `block`.
    pub fn set_current_block(&mut self, block: Block) {
        self.current = Some(block);
    }

    pub fn current_block(&self) -> Option<Block> {
        self.current
    }

    /// Record that `pred` ends with `branch`, which targets `block`.
    pub fn add_predecessor(&mut self, block: Block, pred: Block, branch: Inst) -> Result<()> {
        if self.block(block).sealed {
            bail!(CompileError::invariant(format!(
                "predecessor added to sealed block {}",
                block.0
            )));
        }
        debug_assert!(
            self.insts[branch.index()]
                .branch_targets()
                .iter()
                .any(|t| t.block == block),
            "branch does not target the block it is recorded on"
        );
        self.blocks[block.index()].preds.push(PredEdge { block: pred, branch });
        Ok(())
    }

    /// Declare the predecessor set of `block` final and complete its
    /// pending phi placeholders.
    pub fn seal(&mut self, block: Block) -> Result<()> {
        if self.block(block).sealed {
            bail!(CompileError::invariant(format!("block {} sealed twice", block.0)));
        }
        self.blocks[block.index()].sealed = true;
        let pending = std::mem::take(&mut self.blocks[block.index()].incomplete_phis);
        for (var, param) in pending {
            self.complete_phi(block, var, param)?;
        }
        Ok(())
    }

    pub fn is_sealed(&self, block: Block) -> bool {
        self.block(block).sealed
    }

    /// Append a declared parameter (entry/context/result plumbing, not a
    /// phi) of the given type to `block`.
    pub fn add_block_param(&mut self, block: Block, ty: SsaType) -> Result<Value> {
        let value = self.make_value(ty, ValueDef::Param { block })?;
        self.blocks[block.index()].params.push(value);
        Ok(value)
    }

    // ─── Instructions ──────────────────────────────────────────────────

    /// Append an instruction to the current block and create its result
    /// value, if the opcode has one. Calls must use
    /// [`insert_call`](Self::insert_call) instead, since their result
    /// types come from the signature.
    pub fn insert(&mut self, data: InstrData) -> Result<Inst> {
        let result_ty = self.single_result_type(&data)?;
        let tys: Vec<SsaType> = result_ty.into_iter().collect();
        self.insert_with_results(data, &tys)
    }

    /// Append a call instruction with the given result types.
    pub fn insert_call(&mut self, data: InstrData, result_tys: &[SsaType]) -> Result<Inst> {
        debug_assert!(matches!(
            data,
            InstrData::Call { .. } | InstrData::CallIndirect { .. }
        ));
        self.insert_with_results(data, result_tys)
    }

    fn insert_with_results(&mut self, data: InstrData, result_tys: &[SsaType]) -> Result<Inst> {
        let current = match self.current {
            Some(b) => b,
            None => bail!(CompileError::invariant("no current block")),
        };
        if self.block(current).terminated {
            bail!(CompileError::invariant(format!(
                "instruction inserted after terminator in block {}",
                current.0
            )));
        }
        if self.insts.len() >= u32::MAX as usize {
            bail!(CompileError::Overflow("instructions"));
        }
        let inst = Inst(self.insts.len() as u32);
        let terminator = data.is_terminator();
        self.insts.push(data);
        self.inst_blocks.push(current);

        let mut results = Vec::with_capacity(result_tys.len());
        for (num, &ty) in result_tys.iter().enumerate() {
            results.push(self.make_value(ty, ValueDef::InstResult { inst, num: num as u16 })?);
        }
        self.inst_results.push(results);

        let block = &mut self.blocks[current.index()];
        block.insts.push(inst);
        if terminator {
            block.terminated = true;
        }
        Ok(inst)
    }

    fn single_result_type(&self, data: &InstrData) -> Result<Option<SsaType>> {
        Ok(match data {
            InstrData::Iconst32 { .. } => Some(SsaType::I32),
            InstrData::Iconst64 { .. } => Some(SsaType::I64),
            InstrData::F32const { .. } => Some(SsaType::F32),
            InstrData::F64const { .. } => Some(SsaType::F64),

            InstrData::Iadd { lhs, .. }
            | InstrData::Isub { lhs, .. }
            | InstrData::Ishl { lhs, .. }
            | InstrData::Isshr { lhs, .. }
            | InstrData::Iushr { lhs, .. }
            | InstrData::Fadd { lhs, .. }
            | InstrData::Fsub { lhs, .. } => Some(self.value_type(*lhs)),

            InstrData::Icmp { .. } | InstrData::Fcmp { .. } => Some(SsaType::I32),

            InstrData::Sextend { to_bits, .. } | InstrData::Uextend { to_bits, .. } => {
                Some(match to_bits {
                    32 => SsaType::I32,
                    64 => SsaType::I64,
                    other => bail!(CompileError::invariant(format!(
                        "extension to {} bits",
                        other
                    ))),
                })
            }

            InstrData::Load { ty, .. } => Some(*ty),

            InstrData::Store { .. }
            | InstrData::Jump { .. }
            | InstrData::Brz { .. }
            | InstrData::BrTable { .. }
            | InstrData::Return { .. }
            | InstrData::Trap => None,

            InstrData::Call { .. } | InstrData::CallIndirect { .. } => {
                bail!(CompileError::invariant("calls require insert_call"))
            }
        })
    }

    // ─── Variables ─────────────────────────────────────────────────────

    /// Register a variable with its declared type.
    pub fn declare_variable(&mut self, var: Variable, ty: SsaType) {
        if var.index() >= self.variable_types.len() {
            self.variable_types.resize(var.index() + 1, None);
        }
        self.variable_types[var.index()] = Some(ty);
    }

    /// Record that on exit from the current block, `var` holds `value`.
    pub fn define_variable_in_current_block(&mut self, var: Variable, value: Value) -> Result<()> {
        let current = match self.current {
            Some(b) => b,
            None => bail!(CompileError::invariant("no current block")),
        };
        self.define_variable_in_block(var, value, current);
        Ok(())
    }

    pub fn define_variable_in_block(&mut self, var: Variable, value: Value, block: Block) {
        self.blocks[block.index()].defs.insert(var, value);
    }

    /// Read `var` in the current block, inserting block parameters on
    /// demand.
    pub fn find_value(&mut self, var: Variable) -> Result<Value> {
        let current = match self.current {
            Some(b) => b,
            None => bail!(CompileError::invariant("no current block")),
        };
        self.find_value_in(var, current)
    }

    fn find_value_in(&mut self, var: Variable, block: Block) -> Result<Value> {
        if let Some(&v) = self.block(block).defs.get(&var) {
            return Ok(self.resolve(v));
        }
        let ty = self.variable_type(var)?;
        if !self.block(block).sealed {
            // Predecessors unknown: placeholder parameter, completed at seal.
            let param = self.append_phi_param(block, ty)?;
            self.blocks[block.index()].incomplete_phis.push((var, param));
            self.blocks[block.index()].defs.insert(var, param);
            return Ok(param);
        }
        if self.block(block).preds.len() == 1 {
            let pred = self.block(block).preds[0].block;
            let v = self.find_value_in(var, pred)?;
            self.blocks[block.index()].defs.insert(var, v);
            return Ok(v);
        }
        // Zero or several predecessors: parameter first (breaks cycles),
        // then resolve the read in every predecessor.
        let param = self.append_phi_param(block, ty)?;
        self.blocks[block.index()].defs.insert(var, param);
        self.complete_phi(block, var, param)
    }

    fn complete_phi(&mut self, block: Block, var: Variable, param: Value) -> Result<Value> {
        let preds = self.block(block).preds.clone();
        for edge in &preds {
            let arg = self.find_value_in(var, edge.block)?;
            self.append_branch_arg(edge.branch, block, arg)?;
        }
        Ok(self.try_remove_trivial_phi(block, param))
    }

    fn append_phi_param(&mut self, block: Block, ty: SsaType) -> Result<Value> {
        let value = self.make_value(ty, ValueDef::Param { block })?;
        self.blocks[block.index()].params.push(value);
        self.phis.push((block, value));
        Ok(value)
    }

    /// Append `arg` to the first deficient target entry for `block` on
    /// `branch`. A branch with several entries for the same block (br_table
    /// with repeated labels) fills them in edge order, one per call.
    fn append_branch_arg(&mut self, branch: Inst, block: Block, arg: Value) -> Result<()> {
        let want = self.block(block).params.len();
        for target in self.insts[branch.index()].branch_targets_mut() {
            if target.block == block && target.args.len() < want {
                target.args.push(arg);
                return Ok(());
            }
        }
        bail!(CompileError::invariant(format!(
            "no branch-argument slot for block {} on instruction {}",
            block.0, branch.0
        )))
    }

    // ─── Trivial-phi removal ───────────────────────────────────────────

    fn try_remove_trivial_phi(&mut self, block: Block, param: Value) -> Value {
        if self.remove_if_trivial(block, param) {
            // Replacement can make other phis trivial in turn.
            self.cascade_trivial_phis();
        }
        self.resolve(param)
    }

    /// Check one completed phi for triviality and remove it if so.
    /// Returns whether a removal happened. Never cascades.
    fn remove_if_trivial(&mut self, block: Block, param: Value) -> bool {
        let pos = match self.block(block).params.iter().position(|&p| p == param) {
            Some(pos) => pos,
            None => return false, // already removed
        };
        let preds = self.block(block).preds.clone();
        let mut same: Option<Value> = None;
        let mut counts: HashMap<Inst, usize> = HashMap::new();
        for edge in &preds {
            let nth = counts.entry(edge.branch).or_insert(0);
            let arg = match self.nth_target_arg(edge.branch, block, *nth, pos) {
                Some(a) => self.resolve(a),
                // An edge not yet carrying this argument means a sibling
                // phi completion is still in flight; retry later.
                None => return false,
            };
            *nth += 1;
            if arg == param {
                continue;
            }
            match same {
                None => same = Some(arg),
                Some(s) if s == arg => {}
                Some(_) => return false,
            }
        }
        let unique = match same {
            // Only self-references: an undefined read in dead code. Keep it.
            None => return false,
            Some(v) => v,
        };

        self.aliases.insert(param, unique);
        self.blocks[block.index()].params.remove(pos);
        let mut counts: HashMap<Inst, usize> = HashMap::new();
        for edge in &preds {
            let nth = counts.entry(edge.branch).or_insert(0);
            self.remove_nth_target_arg(edge.branch, block, *nth, pos);
            *nth += 1;
        }
        true
    }

    fn cascade_trivial_phis(&mut self) {
        loop {
            let mut removed_any = false;
            for i in 0..self.phis.len() {
                let (block, param) = self.phis[i];
                if self.aliases.contains_key(&param) || !self.block(block).sealed {
                    continue;
                }
                if self.remove_if_trivial(block, param) {
                    removed_any = true;
                }
            }
            if !removed_any {
                break;
            }
        }
    }

    fn nth_target_arg(&self, branch: Inst, block: Block, nth: usize, pos: usize) -> Option<Value> {
        self.insts[branch.index()]
            .branch_targets()
            .iter()
            .filter(|t| t.block == block)
            .nth(nth)
            .and_then(|t| t.args.get(pos).copied())
    }

    fn remove_nth_target_arg(&mut self, branch: Inst, block: Block, nth: usize, pos: usize) {
        if let Some(target) = self.insts[branch.index()]
            .branch_targets_mut()
            .iter_mut()
            .filter(|t| t.block == block)
            .nth(nth)
        {
            if pos < target.args.len() {
                target.args.remove(pos);
            }
        }
    }

    // ─── Values ────────────────────────────────────────────────────────

    fn make_value(&mut self, ty: SsaType, def: ValueDef) -> Result<Value> {
        if self.value_types.len() >= u32::MAX as usize {
            bail!(CompileError::Overflow("values"));
        }
        let value = Value(self.value_types.len() as u32);
        self.value_types.push(ty);
        self.value_defs.push(def);
        Ok(value)
    }

    /// Follow the alias chain of removed trivial phis to the live value.
    pub fn resolve(&self, mut value: Value) -> Value {
        while let Some(&next) = self.aliases.get(&value) {
            value = next;
        }
        value
    }

    pub fn value_type(&self, value: Value) -> SsaType {
        self.value_types[value.index()]
    }

    pub fn value_def(&self, value: Value) -> ValueDef {
        self.value_defs[value.index()]
    }

    pub fn num_values(&self) -> usize {
        self.value_types.len()
    }

    fn variable_type(&self, var: Variable) -> Result<SsaType> {
        match self.variable_types.get(var.index()).copied().flatten() {
            Some(ty) => Ok(ty),
            None => bail!(CompileError::invariant(format!("undeclared variable {}", var))),
        }
    }

    // ─── Structure accessors ───────────────────────────────────────────

    pub fn blocks(&self) -> impl Iterator<Item = Block> {
        (0..self.blocks.len() as u32).map(Block)
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn block_params(&self, block: Block) -> &[Value] {
        &self.block(block).params
    }

    pub fn block_preds(&self, block: Block) -> &[PredEdge] {
        &self.block(block).preds
    }

    pub fn block_insts(&self, block: Block) -> &[Inst] {
        &self.block(block).insts
    }

    pub fn inst_data(&self, inst: Inst) -> &InstrData {
        &self.insts[inst.index()]
    }

    pub fn inst_results(&self, inst: Inst) -> &[Value] {
        &self.inst_results[inst.index()]
    }

    pub fn inst_block(&self, inst: Inst) -> Block {
        self.inst_blocks[inst.index()]
    }

    fn block(&self, block: Block) -> &BlockData {
        &self.blocks[block.index()]
    }
}
