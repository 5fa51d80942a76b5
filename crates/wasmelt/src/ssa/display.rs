//! Deterministic textual dump of a constructed function.
//!
//! Blocks print in allocation order with the return block last, labeled
//! `blk_ret`; the remaining blocks are numbered `blk0, blk1, ...` skipping
//! it. Every printed operand is alias-resolved, so removed trivial phis
//! never appear in the output. The format is part of the testable surface:
//!
//! ```text
//! blk0: (v1:ptr, v2:ptr, v3:i32) <-- ()
//!   v5:i32 = Iadd v3, v3
//!   Jump v5 -> blk_ret
//! blk_ret: (v0:i32) <-- (blk0)
//!   Return v0
//! ```

use std::fmt::Write;

use super::builder::FunctionBuilder;
use super::instr::{BranchTarget, InstrData};
use super::types::{Block, Inst, Value};

impl FunctionBuilder {
    /// Render the whole function as text.
    pub fn dump(&self) -> String {
        let labels = self.block_labels();
        let mut out = String::new();
        let order = self
            .blocks()
            .filter(|&b| Some(b) != self.return_block())
            .chain(self.return_block());
        for block in order {
            self.write_block(&mut out, block, &labels);
        }
        out
    }

    fn block_labels(&self) -> Vec<String> {
        let mut labels = Vec::with_capacity(self.num_blocks());
        let mut next = 0usize;
        for block in self.blocks() {
            if Some(block) == self.return_block() {
                labels.push("blk_ret".to_string());
            } else {
                labels.push(format!("blk{}", next));
                next += 1;
            }
        }
        labels
    }

    fn write_block(&self, out: &mut String, block: Block, labels: &[String]) {
        let params = self
            .block_params(block)
            .iter()
            .map(|&p| format!("{}:{}", p, self.value_type(p)))
            .collect::<Vec<_>>()
            .join(", ");
        let preds = self
            .block_preds(block)
            .iter()
            .map(|edge| labels[edge.block.index()].clone())
            .collect::<Vec<_>>()
            .join(", ");
        let _ = writeln!(out, "{}: ({}) <-- ({})", labels[block.index()], params, preds);
        for &inst in self.block_insts(block) {
            let _ = writeln!(out, "  {}", self.format_inst(inst, labels));
        }
    }

    fn format_inst(&self, inst: Inst, labels: &[String]) -> String {
        let mut line = String::new();
        let results = self.inst_results(inst);
        if !results.is_empty() {
            let defs = results
                .iter()
                .map(|&v| format!("{}:{}", v, self.value_type(v)))
                .collect::<Vec<_>>()
                .join(", ");
            let _ = write!(line, "{} = ", defs);
        }
        let _ = write!(line, "{}", self.format_op(self.inst_data(inst), labels));
        line
    }

    fn vals(&self, values: &[Value]) -> String {
        values
            .iter()
            .map(|&v| self.resolve(v).to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn target(&self, t: &BranchTarget, labels: &[String]) -> String {
        if t.args.is_empty() {
            format!("-> {}", labels[t.block.index()])
        } else {
            format!("{} -> {}", self.vals(&t.args), labels[t.block.index()])
        }
    }

    fn format_op(&self, data: &InstrData, labels: &[String]) -> String {
        match data {
            InstrData::Iconst32 { imm } => format!("Iconst32 {}", imm),
            InstrData::Iconst64 { imm } => format!("Iconst64 {}", imm),
            InstrData::F32const { bits } => format!("F32const {}", f32::from_bits(*bits)),
            InstrData::F64const { bits } => format!("F64const {}", f64::from_bits(*bits)),

            InstrData::Iadd { lhs, rhs } => format!("Iadd {}", self.vals(&[*lhs, *rhs])),
            InstrData::Isub { lhs, rhs } => format!("Isub {}", self.vals(&[*lhs, *rhs])),
            InstrData::Ishl { lhs, rhs } => format!("Ishl {}", self.vals(&[*lhs, *rhs])),
            InstrData::Isshr { lhs, rhs } => format!("Isshr {}", self.vals(&[*lhs, *rhs])),
            InstrData::Iushr { lhs, rhs } => format!("Iushr {}", self.vals(&[*lhs, *rhs])),
            InstrData::Icmp { cond, lhs, rhs } => {
                format!("Icmp {} {}", cond, self.vals(&[*lhs, *rhs]))
            }
            InstrData::Fadd { lhs, rhs } => format!("Fadd {}", self.vals(&[*lhs, *rhs])),
            InstrData::Fsub { lhs, rhs } => format!("Fsub {}", self.vals(&[*lhs, *rhs])),
            InstrData::Fcmp { cond, lhs, rhs } => {
                format!("Fcmp {} {}", cond, self.vals(&[*lhs, *rhs]))
            }

            InstrData::Sextend { from_bits, to_bits, value } => {
                format!("Sextend{}_{} {}", from_bits, to_bits, self.resolve(*value))
            }
            InstrData::Uextend { from_bits, to_bits, value } => {
                format!("Uextend{}_{} {}", from_bits, to_bits, self.resolve(*value))
            }

            InstrData::Load { addr, offset, .. } => {
                format!("Load {}, +{}", self.resolve(*addr), offset)
            }
            InstrData::Store { value, addr, offset } => {
                format!("Store {}, {}, +{}", self.resolve(*value), self.resolve(*addr), offset)
            }

            InstrData::Call { func, sig, args } => {
                format!("Call fn{}:{}, {}", func, sig, self.vals(args))
            }
            InstrData::CallIndirect { sig, callee, args } => {
                format!("CallIndirect {}, {}, {}", sig, self.resolve(*callee), self.vals(args))
            }

            InstrData::Jump { target } => format!("Jump {}", self.target(target, labels)),
            InstrData::Brz { cond, target } => {
                if target.args.is_empty() {
                    format!("Brz {} -> {}", self.resolve(*cond), labels[target.block.index()])
                } else {
                    format!(
                        "Brz {}, {} -> {}",
                        self.resolve(*cond),
                        self.vals(&target.args),
                        labels[target.block.index()]
                    )
                }
            }
            InstrData::BrTable { selector, targets } => {
                let entries = targets
                    .iter()
                    .map(|t| {
                        if t.args.is_empty() {
                            labels[t.block.index()].clone()
                        } else {
                            format!("{}({})", labels[t.block.index()], self.vals(&t.args))
                        }
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("BrTable {} -> [{}]", self.resolve(*selector), entries)
            }
            InstrData::Return { args } => {
                if args.is_empty() {
                    "Return".to_string()
                } else {
                    format!("Return {}", self.vals(args))
                }
            }
            InstrData::Trap => "Trap".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssa::SsaType;

    #[test]
    fn dump_prints_return_block_last_as_blk_ret() {
        let mut b = FunctionBuilder::new();
        let ret = b.allocate_block().unwrap();
        b.set_return_block(ret);
        let entry = b.allocate_block().unwrap();
        b.seal(entry).unwrap();

        b.set_current_block(entry);
        let j = b
            .insert(InstrData::Jump { target: BranchTarget::new(ret, vec![]) })
            .unwrap();
        b.add_predecessor(ret, entry, j).unwrap();
        b.seal(ret).unwrap();
        b.set_current_block(ret);
        b.insert(InstrData::Return { args: vec![] }).unwrap();

        let dump = b.dump();
        assert_eq!(
            dump,
            "blk0: () <-- ()\n  Jump -> blk_ret\nblk_ret: () <-- (blk0)\n  Return\n"
        );
    }

    #[test]
    fn dump_resolves_aliases_in_operands() {
        let mut b = FunctionBuilder::new();
        let b0 = b.allocate_block().unwrap();
        b.seal(b0).unwrap();
        b.set_current_block(b0);
        let c = b.insert(InstrData::Iconst32 { imm: 2 }).unwrap();
        let cv = b.inst_results(c)[0];
        let add = b.insert(InstrData::Iadd { lhs: cv, rhs: cv }).unwrap();
        let av = b.inst_results(add)[0];
        b.insert(InstrData::Return { args: vec![av] }).unwrap();

        let dump = b.dump();
        assert!(dump.contains(&format!("{}:{} = Iadd {}, {}", av, SsaType::I32, cv, cv)));
        assert!(dump.ends_with(&format!("Return {}\n", av)));
    }
}
