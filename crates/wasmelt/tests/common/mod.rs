//! Shared helpers for the frontend integration tests: a structural
//! invariant checker for constructed SSA functions, and a minimal wasm
//! container scanner so fixtures can be written in WAT.
//!
//! Each integration test binary compiles its own copy and uses a subset.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};

use wasmelt::module::{FunctionType, ModuleEnv, ValueType};
use wasmelt::ssa::{Block, FunctionBuilder, ValueDef};

/// The entry block of every frontend-constructed function: the return
/// block is allocated first, the entry second.
pub fn entry_block(_f: &FunctionBuilder) -> Block {
    Block(1)
}

/// Check the structural SSA invariants of a constructed function:
/// one trailing terminator per block, branch arity and types matching the
/// target's parameters, predecessor-edge consistency, all blocks sealed,
/// and dominance of definitions over uses on reachable blocks.
pub fn verify(f: &FunctionBuilder) {
    for block in f.blocks() {
        let insts = f.block_insts(block);
        let terminators = insts.iter().filter(|&&i| f.inst_data(i).is_terminator()).count();
        assert_eq!(terminators, 1, "block {:?} must have exactly one terminator", block);
        let last = *insts.last().expect("no empty blocks");
        assert!(
            f.inst_data(last).is_terminator(),
            "the terminator of {:?} must come last",
            block
        );
        assert!(f.is_sealed(block), "block {:?} left unsealed", block);

        // Predecessor edges point back at a branch that targets us.
        for edge in f.block_preds(block) {
            assert_eq!(f.inst_block(edge.branch), edge.block);
            assert!(
                f.inst_data(edge.branch).branch_targets().iter().any(|t| t.block == block),
                "recorded predecessor branch does not target {:?}",
                block
            );
        }

        // Branch arity and types match the target's parameters.
        for &inst in insts {
            for target in f.inst_data(inst).branch_targets() {
                let params = f.block_params(target.block);
                assert_eq!(
                    target.args.len(),
                    params.len(),
                    "branch {:?} -> {:?} carries {} args for {} params",
                    inst,
                    target.block,
                    target.args.len(),
                    params.len()
                );
                for (&arg, &param) in target.args.iter().zip(params) {
                    assert_eq!(
                        f.value_type(f.resolve(arg)),
                        f.value_type(param),
                        "argument type mismatch on edge into {:?}",
                        target.block
                    );
                }
            }
        }
    }

    check_dominance(f);
}

fn reachable_blocks(f: &FunctionBuilder) -> HashSet<Block> {
    let mut seen = HashSet::new();
    let mut work = vec![entry_block(f)];
    while let Some(block) = work.pop() {
        if !seen.insert(block) {
            continue;
        }
        for &inst in f.block_insts(block) {
            for target in f.inst_data(inst).branch_targets() {
                work.push(target.block);
            }
        }
    }
    seen
}

/// Iterative dominator sets over the reachable subgraph.
fn dominator_sets(f: &FunctionBuilder, reachable: &HashSet<Block>) -> HashMap<Block, HashSet<Block>> {
    let entry = entry_block(f);
    let all: HashSet<Block> = reachable.clone();
    let mut dom: HashMap<Block, HashSet<Block>> = HashMap::new();
    for &b in reachable {
        if b == entry {
            dom.insert(b, [b].into_iter().collect());
        } else {
            dom.insert(b, all.clone());
        }
    }
    let mut changed = true;
    while changed {
        changed = false;
        for &b in reachable {
            if b == entry {
                continue;
            }
            let mut next: Option<HashSet<Block>> = None;
            for edge in f.block_preds(b) {
                if !reachable.contains(&edge.block) {
                    continue;
                }
                let pred_dom = &dom[&edge.block];
                next = Some(match next {
                    None => pred_dom.clone(),
                    Some(acc) => acc.intersection(pred_dom).copied().collect(),
                });
            }
            let mut next = next.unwrap_or_default();
            next.insert(b);
            if next != dom[&b] {
                dom.insert(b, next);
                changed = true;
            }
        }
    }
    dom
}

/// Every (resolved) operand must be defined in a dominating block, or
/// earlier in the same block.
fn check_dominance(f: &FunctionBuilder) {
    let reachable = reachable_blocks(f);
    let dom = dominator_sets(f, &reachable);

    for block in f.blocks() {
        if !reachable.contains(&block) {
            continue;
        }
        let insts = f.block_insts(block);
        for (pos, &inst) in insts.iter().enumerate() {
            for operand in f.inst_data(inst).operands() {
                let value = f.resolve(operand);
                match f.value_def(value) {
                    ValueDef::Param { block: def_block } => {
                        assert!(
                            dom[&block].contains(&def_block),
                            "{} used in {:?} but defined as a param of non-dominating {:?}",
                            value,
                            block,
                            def_block
                        );
                    }
                    ValueDef::InstResult { inst: def_inst, .. } => {
                        let def_block = f.inst_block(def_inst);
                        if def_block == block {
                            let def_pos = insts
                                .iter()
                                .position(|&i| i == def_inst)
                                .expect("defining instruction lives in its block");
                            assert!(
                                def_pos < pos,
                                "{} used at position {} before its definition at {} in {:?}",
                                value,
                                pos,
                                def_pos,
                                block
                            );
                        } else {
                            assert!(
                                dom[&block].contains(&def_block),
                                "{} used in {:?} but defined in non-dominating {:?}",
                                value,
                                block,
                                def_block
                            );
                        }
                    }
                }
            }
        }
    }
}

// ─── Minimal wasm container scanning for WAT fixtures ──────────────────

/// One function extracted from a wasm binary: expanded local types plus
/// the instruction bytes (final `End` included).
pub struct FunctionFixture {
    pub locals: Vec<ValueType>,
    pub body: Vec<u8>,
}

/// Type and code sections of a wasm binary, scanned just deeply enough to
/// drive the frontend. Anything beyond types/functions/code is skipped.
pub struct ScannedModule {
    pub types: Vec<FunctionType>,
    /// Type index per function, in code-section order.
    pub func_types: Vec<u32>,
    pub functions: Vec<FunctionFixture>,
}

impl ScannedModule {
    /// Build the module environment the frontend compiles against.
    pub fn env(&self) -> ModuleEnv {
        let mut env = ModuleEnv::default();
        for ty in &self.types {
            env.push_type(ty.clone());
        }
        for &ti in &self.func_types {
            env.push_function(ti);
        }
        env
    }
}

/// Assemble WAT and scan the resulting binary.
pub fn scan_wat(source: &str) -> ScannedModule {
    let wasm = wat::parse_str(source).expect("fixture WAT must assemble");
    scan_module(&wasm)
}

fn read_u32(bytes: &[u8], pos: &mut usize) -> u32 {
    let mut result = 0u32;
    let mut shift = 0;
    loop {
        let byte = bytes[*pos];
        *pos += 1;
        result |= ((byte & 0x7f) as u32) << shift;
        if byte & 0x80 == 0 {
            return result;
        }
        shift += 7;
    }
}

fn read_value_type(bytes: &[u8], pos: &mut usize) -> ValueType {
    let byte = bytes[*pos];
    *pos += 1;
    match byte {
        0x7f => ValueType::I32,
        0x7e => ValueType::I64,
        0x7d => ValueType::F32,
        0x7c => ValueType::F64,
        0x7b => ValueType::V128,
        0x70 => ValueType::FuncRef,
        0x6f => ValueType::ExternRef,
        other => panic!("fixture uses unexpected value type {:#04x}", other),
    }
}

fn scan_module(wasm: &[u8]) -> ScannedModule {
    assert_eq!(&wasm[..8], &b"\0asm\x01\0\0\0"[..], "not a wasm binary");
    let mut module = ScannedModule { types: Vec::new(), func_types: Vec::new(), functions: Vec::new() };

    let mut pos = 8;
    while pos < wasm.len() {
        let id = wasm[pos];
        pos += 1;
        let size = read_u32(wasm, &mut pos) as usize;
        let end = pos + size;
        match id {
            1 => {
                // Type section.
                let count = read_u32(wasm, &mut pos);
                for _ in 0..count {
                    assert_eq!(wasm[pos], 0x60, "only plain function types expected");
                    pos += 1;
                    let n_params = read_u32(wasm, &mut pos);
                    let params: Vec<ValueType> =
                        (0..n_params).map(|_| read_value_type(wasm, &mut pos)).collect();
                    let n_results = read_u32(wasm, &mut pos);
                    let results: Vec<ValueType> =
                        (0..n_results).map(|_| read_value_type(wasm, &mut pos)).collect();
                    module.types.push(FunctionType::new(params, results));
                }
            }
            3 => {
                // Function section: type index per local function.
                let count = read_u32(wasm, &mut pos);
                for _ in 0..count {
                    module.func_types.push(read_u32(wasm, &mut pos));
                }
            }
            10 => {
                // Code section.
                let count = read_u32(wasm, &mut pos);
                for _ in 0..count {
                    let body_size = read_u32(wasm, &mut pos) as usize;
                    let body_end = pos + body_size;
                    let n_groups = read_u32(wasm, &mut pos);
                    let mut locals = Vec::new();
                    for _ in 0..n_groups {
                        let repeat = read_u32(wasm, &mut pos);
                        let ty = read_value_type(wasm, &mut pos);
                        locals.extend(std::iter::repeat(ty).take(repeat as usize));
                    }
                    module.functions.push(FunctionFixture {
                        locals,
                        body: wasm[pos..body_end].to_vec(),
                    });
                    pos = body_end;
                }
            }
            _ => {}
        }
        pos = end;
    }
    module
}
