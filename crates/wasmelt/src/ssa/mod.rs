//! Typed SSA intermediate representation with block parameters.
//!
//! Classical phi nodes are replaced by block parameters: a block that
//! merges values declares parameters, and every branch into it supplies a
//! matching argument list. The [`FunctionBuilder`] constructs this form
//! incrementally while the frontend walks the bytecode, including across
//! unsealed loop headers.

mod builder;
mod display;
mod instr;
mod types;

pub use builder::{FunctionBuilder, PredEdge, ValueDef};
pub use instr::{BranchTarget, FloatCond, InstrData, IntCond};
pub use types::{Block, Inst, SigId, Signature, SsaType, Value, Variable};
