//! SSA instruction store.
//!
//! Instructions are a sum type keyed by opcode with per-variant payload.
//! Branching variants carry their destination and outgoing arguments as a
//! [`BranchTarget`]; the argument list supplies, in order, the target
//! block's parameters. Phi completion appends to these lists after the
//! branch has been emitted, which is why they live on the instruction and
//! not on the edge.

use std::fmt;

use super::types::{Block, SigId, SsaType, Value};

/// Integer comparison predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntCond {
    Eq,
    Neq,
    LtS,
    LtU,
    GtS,
    GtU,
    LeS,
    LeU,
    GeS,
    GeU,
}

impl fmt::Display for IntCond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IntCond::Eq => "eq",
            IntCond::Neq => "neq",
            IntCond::LtS => "lt_s",
            IntCond::LtU => "lt_u",
            IntCond::GtS => "gt_s",
            IntCond::GtU => "gt_u",
            IntCond::LeS => "le_s",
            IntCond::LeU => "le_u",
            IntCond::GeS => "ge_s",
            IntCond::GeU => "ge_u",
        };
        write!(f, "{}", s)
    }
}

/// Floating-point comparison predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatCond {
    Eq,
    Neq,
    Lt,
    Gt,
    Le,
    Ge,
}

impl fmt::Display for FloatCond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FloatCond::Eq => "eq",
            FloatCond::Neq => "neq",
            FloatCond::Lt => "lt",
            FloatCond::Gt => "gt",
            FloatCond::Le => "le",
            FloatCond::Ge => "ge",
        };
        write!(f, "{}", s)
    }
}

/// Destination of a branch, with the values feeding the target's
/// parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchTarget {
    pub block: Block,
    pub args: Vec<Value>,
}

impl BranchTarget {
    pub fn new(block: Block, args: Vec<Value>) -> Self {
        Self { block, args }
    }
}

/// One SSA instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum InstrData {
    Iconst32 { imm: i32 },
    Iconst64 { imm: i64 },
    F32const { bits: u32 },
    F64const { bits: u64 },

    Iadd { lhs: Value, rhs: Value },
    Isub { lhs: Value, rhs: Value },
    /// Shift left.
    Ishl { lhs: Value, rhs: Value },
    /// Arithmetic (sign-propagating) shift right.
    Isshr { lhs: Value, rhs: Value },
    /// Logical shift right.
    Iushr { lhs: Value, rhs: Value },
    Icmp { cond: IntCond, lhs: Value, rhs: Value },

    Fadd { lhs: Value, rhs: Value },
    Fsub { lhs: Value, rhs: Value },
    Fcmp { cond: FloatCond, lhs: Value, rhs: Value },

    /// Sign-extend the low `from_bits` of `value` to `to_bits`.
    Sextend { from_bits: u8, to_bits: u8, value: Value },
    /// Zero-extend the low `from_bits` of `value` to `to_bits`.
    Uextend { from_bits: u8, to_bits: u8, value: Value },

    Load { ty: SsaType, addr: Value, offset: u32 },
    Store { value: Value, addr: Value, offset: u32 },

    /// Direct call to function index `func` with resolved signature.
    /// `args` starts with the two context pointers.
    Call { func: u32, sig: SigId, args: Vec<Value> },
    /// Indirect call through `callee`, the executable pointer loaded from
    /// a function-instance record. `args` starts with the two context
    /// pointers (the callee's own module context).
    CallIndirect { sig: SigId, callee: Value, args: Vec<Value> },

    /// Unconditional jump. Terminator.
    Jump { target: BranchTarget },
    /// Branch to `target` when `cond` is zero, fall through otherwise.
    /// Not a terminator: the fall-through continues in the same block.
    Brz { cond: Value, target: BranchTarget },
    /// Multi-way branch on `selector`; the last target is the default.
    /// Terminator.
    BrTable { selector: Value, targets: Vec<BranchTarget> },
    /// Function return. Terminator; only the return block carries one.
    Return { args: Vec<Value> },
    /// Abort guest execution. Terminator.
    Trap,
}

impl InstrData {
    /// Whether this instruction ends its block. `Brz` is conditional and
    /// falls through, so it does not terminate.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            InstrData::Jump { .. }
                | InstrData::BrTable { .. }
                | InstrData::Return { .. }
                | InstrData::Trap
        )
    }

    /// Branch destinations of this instruction, empty for non-branches.
    pub fn branch_targets(&self) -> &[BranchTarget] {
        match self {
            InstrData::Jump { target } | InstrData::Brz { target, .. } => {
                std::slice::from_ref(target)
            }
            InstrData::BrTable { targets, .. } => targets,
            _ => &[],
        }
    }

    pub fn branch_targets_mut(&mut self) -> &mut [BranchTarget] {
        match self {
            InstrData::Jump { target } | InstrData::Brz { target, .. } => {
                std::slice::from_mut(target)
            }
            InstrData::BrTable { targets, .. } => targets,
            _ => &mut [],
        }
    }

    /// Every value this instruction reads, branch arguments included.
    pub fn operands(&self) -> Vec<Value> {
        match self {
            InstrData::Iconst32 { .. }
            | InstrData::Iconst64 { .. }
            | InstrData::F32const { .. }
            | InstrData::F64const { .. }
            | InstrData::Trap => Vec::new(),

            InstrData::Iadd { lhs, rhs }
            | InstrData::Isub { lhs, rhs }
            | InstrData::Ishl { lhs, rhs }
            | InstrData::Isshr { lhs, rhs }
            | InstrData::Iushr { lhs, rhs }
            | InstrData::Icmp { lhs, rhs, .. }
            | InstrData::Fadd { lhs, rhs }
            | InstrData::Fsub { lhs, rhs }
            | InstrData::Fcmp { lhs, rhs, .. } => vec![*lhs, *rhs],

            InstrData::Sextend { value, .. } | InstrData::Uextend { value, .. } => vec![*value],

            InstrData::Load { addr, .. } => vec![*addr],
            InstrData::Store { value, addr, .. } => vec![*value, *addr],

            InstrData::Call { args, .. } => args.clone(),
            InstrData::CallIndirect { callee, args, .. } => {
                let mut ops = vec![*callee];
                ops.extend_from_slice(args);
                ops
            }

            InstrData::Jump { target } => target.args.clone(),
            InstrData::Brz { cond, target } => {
                let mut ops = vec![*cond];
                ops.extend_from_slice(&target.args);
                ops
            }
            InstrData::BrTable { selector, targets } => {
                let mut ops = vec![*selector];
                for t in targets {
                    ops.extend_from_slice(&t.args);
                }
                ops
            }
            InstrData::Return { args } => args.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminators() {
        let jump = InstrData::Jump { target: BranchTarget::new(Block(1), vec![]) };
        let brz = InstrData::Brz {
            cond: Value(0),
            target: BranchTarget::new(Block(1), vec![]),
        };
        assert!(jump.is_terminator());
        assert!(!brz.is_terminator());
        assert!(InstrData::Trap.is_terminator());
        assert!(InstrData::Return { args: vec![] }.is_terminator());
        assert!(!InstrData::Iconst32 { imm: 0 }.is_terminator());
    }

    #[test]
    fn operands_include_branch_args() {
        let brz = InstrData::Brz {
            cond: Value(3),
            target: BranchTarget::new(Block(2), vec![Value(4), Value(5)]),
        };
        assert_eq!(brz.operands(), vec![Value(3), Value(4), Value(5)]);
    }

    #[test]
    fn cond_display_uses_wasm_spelling() {
        assert_eq!(IntCond::Neq.to_string(), "neq");
        assert_eq!(IntCond::LtU.to_string(), "lt_u");
        assert_eq!(FloatCond::Ge.to_string(), "ge");
    }
}
