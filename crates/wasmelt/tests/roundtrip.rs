//! The textual SSA dump, re-parsed by a hand-written reader, must
//! reconstruct the block, predecessor and terminator structure of the
//! function it was printed from.

mod common;

use std::collections::HashMap;

use common::verify;
use wasmelt::frontend::Frontend;
use wasmelt::module::{FunctionType, ModuleEnv, ValueType};
use wasmelt::ssa::{FunctionBuilder, InstrData};

/// One block as read back from the dump text.
#[derive(Debug)]
struct TextBlock {
    label: String,
    param_count: usize,
    preds: Vec<String>,
    /// Mnemonic of the last instruction.
    terminator: String,
    /// (target label, argument count) per branch in the block.
    edges: Vec<(String, usize)>,
}

fn parse_dump(dump: &str) -> Vec<TextBlock> {
    let mut blocks: Vec<TextBlock> = Vec::new();
    for line in dump.lines() {
        if let Some(body) = line.strip_prefix("  ") {
            let block = blocks.last_mut().expect("instruction before first block header");
            let op = body.split_whitespace().next().expect("empty instruction line").to_string();
            // `v1:i32 = Op ...` lines carry their opcode after the `=`.
            let op = if op.starts_with('v') && body.contains(" = ") {
                body.split(" = ").nth(1).unwrap().split_whitespace().next().unwrap().to_string()
            } else {
                op
            };
            for (target, args) in parse_edges(body) {
                block.edges.push((target, args));
            }
            block.terminator = op;
        } else {
            blocks.push(parse_header(line));
        }
    }
    blocks
}

fn parse_header(line: &str) -> TextBlock {
    // `blkN: (v0:ptr, v1:i32) <-- (blk0, blk1)`
    let (label, rest) = line.split_once(':').expect("block header has a label");
    let (params, preds) = rest.split_once("<--").expect("block header lists predecessors");
    TextBlock {
        label: label.trim().to_string(),
        param_count: count_paren_list(params),
        preds: paren_list(preds),
        terminator: String::new(),
        edges: Vec::new(),
    }
}

fn paren_list(text: &str) -> Vec<String> {
    let inner = text.trim().trim_start_matches('(').trim_end_matches(')');
    if inner.trim().is_empty() {
        Vec::new()
    } else {
        inner.split(',').map(|s| s.trim().to_string()).collect()
    }
}

fn count_paren_list(text: &str) -> usize {
    paren_list(text).len()
}

/// Branch edges of one instruction line: `(target label, argument count)`.
fn parse_edges(body: &str) -> Vec<(String, usize)> {
    let Some((head, dest)) = body.split_once(" -> ") else {
        return Vec::new();
    };
    if body.trim_start().starts_with("BrTable") {
        // `BrTable v1 -> [blk1, blk2(v3, v4)]`
        let list = dest.trim().trim_start_matches('[').trim_end_matches(']');
        return split_table_entries(list)
            .into_iter()
            .map(|entry| match entry.split_once('(') {
                Some((label, args)) => {
                    (label.trim().to_string(), args.trim_end_matches(')').split(',').count())
                }
                None => (entry.trim().to_string(), 0),
            })
            .collect();
    }
    // `Jump v1, v2 -> blk3` / `Brz v0 -> blk2`: operands after the
    // mnemonic; the Brz condition is not a branch argument.
    let mut operands = head
        .trim()
        .split_whitespace()
        .skip(1)
        .collect::<Vec<_>>()
        .join(" ")
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .count();
    if head.trim_start().starts_with("Brz") {
        operands -= 1;
    }
    vec![(dest.trim().to_string(), operands)]
}

fn split_table_entries(list: &str) -> Vec<String> {
    // Comma-split, but commas inside `(...)` belong to argument lists.
    let mut entries = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for ch in list.chars() {
        match ch {
            '(' => {
                depth += 1;
                current.push(ch);
            }
            ')' => {
                depth -= 1;
                current.push(ch);
            }
            ',' if depth == 0 => {
                entries.push(current.trim().to_string());
                current = String::new();
            }
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        entries.push(current.trim().to_string());
    }
    entries
}

/// Re-derive each block's predecessors from the parsed branches and check
/// both against the header lists and the builder's structure.
fn check_round_trip(f: &FunctionBuilder) {
    let dump = f.dump();
    let parsed = parse_dump(&dump);

    // Same block count, one terminator line per block.
    assert_eq!(parsed.len(), f.num_blocks());

    // Predecessors reconstructed from edges match the printed headers.
    let mut derived: HashMap<String, Vec<String>> = HashMap::new();
    for block in &parsed {
        for (target, _) in &block.edges {
            derived.entry(target.clone()).or_default().push(block.label.clone());
        }
    }
    for block in &parsed {
        let mut expected = block.preds.clone();
        let mut got = derived.remove(&block.label).unwrap_or_default();
        expected.sort();
        got.sort();
        assert_eq!(expected, got, "predecessors of {} disagree with edges", block.label);
    }

    // Parsed structure matches the builder: per-block parameter count,
    // predecessor count, terminator shape and branch arities.
    let labels: Vec<&TextBlock> = {
        // Dump order: allocation order with the return block moved last.
        let mut order: Vec<&TextBlock> = parsed.iter().collect();
        let ret_pos = order.iter().position(|b| b.label == "blk_ret");
        if let Some(pos) = ret_pos {
            let ret = order.remove(pos);
            let ret_index = f.return_block().unwrap().index();
            order.insert(ret_index, ret);
        }
        order
    };
    for (block, text) in f.blocks().zip(&labels) {
        assert_eq!(f.block_params(block).len(), text.param_count);
        assert_eq!(f.block_preds(block).len(), text.preds.len());
        let last = *f.block_insts(block).last().unwrap();
        let mnemonic = match f.inst_data(last) {
            InstrData::Jump { .. } => "Jump",
            InstrData::BrTable { .. } => "BrTable",
            InstrData::Return { .. } => "Return",
            InstrData::Trap => "Trap",
            other => panic!("non-terminator {:?} ends a block", other),
        };
        assert_eq!(text.terminator, mnemonic, "terminator of {} disagrees", text.label);

        // Branch arities as printed equal the target's parameter count.
        let by_label: HashMap<&str, usize> =
            labels.iter().map(|b| (b.label.as_str(), b.param_count)).collect();
        for (target, args) in &text.edges {
            assert_eq!(
                by_label[target.as_str()],
                *args,
                "printed arity into {} disagrees",
                target
            );
        }
    }
}

fn compile<'a>(env: &'a ModuleEnv, locals: &'a [ValueType], body: &'a [u8]) -> Frontend<'a> {
    let mut frontend = Frontend::new(env);
    frontend.compile_function(0, locals, body).unwrap();
    verify(frontend.ssa());
    frontend
}

#[test]
fn round_trip_straight_line() {
    let mut env = ModuleEnv::default();
    let ty = env.push_type(FunctionType::new(
        [ValueType::I32, ValueType::I32],
        [ValueType::I32],
    ));
    env.push_function(ty);
    let frontend = compile(&env, &[], &[0x20, 0x00, 0x20, 0x01, 0x6a, 0x20, 0x00, 0x6b, 0x0b]);
    check_round_trip(frontend.ssa());
}

#[test]
fn round_trip_loop_with_br_if() {
    let mut env = ModuleEnv::default();
    let ty = env.push_type(FunctionType::new([], []));
    env.push_function(ty);
    let frontend = compile(&env, &[], &[0x03, 0x40, 0x41, 0x01, 0x0d, 0x00, 0x0f, 0x0b, 0x0b]);
    check_round_trip(frontend.ssa());
}

#[test]
fn round_trip_if_else_merge() {
    let mut env = ModuleEnv::default();
    let ty = env.push_type(FunctionType::new(
        [ValueType::I32, ValueType::I32],
        [ValueType::I32],
    ));
    env.push_function(ty);
    let body = [
        0x20, 0x00, 0x04, 0x40, 0x20, 0x00, 0x21, 0x02, 0x05, 0x20, 0x01, 0x21, 0x02, 0x0b,
        0x20, 0x02, 0x0b,
    ];
    let frontend = compile(&env, &[ValueType::I32], &body);
    check_round_trip(frontend.ssa());
}

#[test]
fn round_trip_br_table() {
    let module = common::scan_wat(
        r#"
        (module
          (func (param i32) (result i32) (local i32)
            block
              block
                local.get 0
                br_table 0 1
              end
              i32.const 1
              local.set 1
            end
            local.get 1))
        "#,
    );
    let env = module.env();
    let mut frontend = Frontend::new(&env);
    frontend
        .compile_function(0, &module.functions[0].locals, &module.functions[0].body)
        .unwrap();
    verify(frontend.ssa());
    check_round_trip(frontend.ssa());
}

#[test]
fn round_trip_select_merge() {
    let mut env = ModuleEnv::default();
    let ty = env.push_type(FunctionType::new(
        [ValueType::I32, ValueType::I32, ValueType::I32],
        [ValueType::I32],
    ));
    env.push_function(ty);
    let frontend = compile(&env, &[], &[0x20, 0x00, 0x20, 0x01, 0x20, 0x02, 0x1b, 0x0b]);
    check_round_trip(frontend.ssa());
}
