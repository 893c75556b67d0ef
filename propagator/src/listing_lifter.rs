//! A lifter from a plain-text listing of the structured IR.
//!
//! A listing holds one or more functions:
//!
//! ```text
//! FUNCTION 401000 main
//! BLOCK 401000
//! 401000 (Assign r16:64 (Sub r48:64 0x10:64))
//! 401004 (Store r16:64 0x5:64 le)
//! 401008 (CJump (CmpEQ r24:64 0x0:64) 0x401010:64 0x401020:64)
//! BLOCK 401010
//! 401010 (Assign r0:64 (Call 0x402000:64 r56:64))
//! 401014 (Return r0:64)
//! EDGE 401000 401010
//! ```
//!
//! Addresses are hexadecimal without a prefix; a block may carry an index (`BLOCK 401000 1`),
//! referred to as `401000.1` in `EDGE` lines. Expressions are S-expressions whose leaves are
//! `0x5:64` (constant), `t0:64` (temporary), `r16:64` (register) and `sb-16:64` (stack base
//! offset). Lines starting with `#` are ignored.

use crate::ail::{BinOp, Block, Call, Expr, Stmt, StmtKind, UnOp};
use crate::arch::Endness;
use crate::containers::unordered::UnorderedMap;
use crate::graph::{FunctionGraph, NodeIdx};
use crate::log::*;

use itertools::Itertools;

/// Lift a textual listing into one graph per function.
///
/// Panics on malformed input.
pub fn lift_from(listing: &str) -> Vec<FunctionGraph<Block>> {
    let mut funcs: Vec<FunctionGraph<Block>> = vec![];
    let mut blocks: Vec<Block> = vec![];
    let mut edges: Vec<(&str, &str)> = vec![];

    for line in listing.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (head, rest) = line.split_once(' ').unwrap_or((line, ""));
        match head {
            "FUNCTION" => {
                finish_function(&mut funcs, &mut blocks, &mut edges);
                let (addr, name) = match rest.split_whitespace().collect_tuple() {
                    Some((addr, name)) => (parse_hex(addr), name),
                    None => panic!("Expected `FUNCTION <addr> <name>`, got {:?}", line),
                };
                funcs.push(FunctionGraph::new(addr, name));
            }
            "BLOCK" => {
                let mut words = rest.split_whitespace();
                let addr = parse_hex(words.next().expect("BLOCK without an address"));
                let idx = words.next().map(|i| i.parse().expect("Invalid block index"));
                assert!(words.next().is_none(), "Trailing input on {:?}", line);
                blocks.push(Block::new(addr, idx, vec![]));
            }
            "EDGE" => match rest.split_whitespace().collect_tuple() {
                Some((from, to)) => edges.push((from, to)),
                None => panic!("Expected `EDGE <from> <to>`, got {:?}", line),
            },
            ins_addr => {
                let ins_addr = parse_hex(ins_addr);
                let block = blocks
                    .last_mut()
                    .unwrap_or_else(|| panic!("Statement outside a block: {:?}", line));
                let idx = block.statements.len();
                block
                    .statements
                    .push(Stmt::new(idx, ins_addr, parse_stmt(&parse_sexpr(rest))));
            }
        }
    }
    finish_function(&mut funcs, &mut blocks, &mut edges);

    funcs
}

/// Attach the pending blocks and edges to the last function
fn finish_function(
    funcs: &mut Vec<FunctionGraph<Block>>,
    blocks: &mut Vec<Block>,
    edges: &mut Vec<(&str, &str)>,
) {
    let g = match funcs.last_mut() {
        Some(g) => g,
        None => {
            assert!(
                blocks.is_empty() && edges.is_empty(),
                "Blocks found before any FUNCTION"
            );
            return;
        }
    };
    let mut by_key: UnorderedMap<(u64, Option<usize>), NodeIdx> = Default::default();
    for b in blocks.drain(..) {
        let key = (b.addr, b.idx);
        let n = g.add_node(b);
        if by_key.insert(key, n).is_some() {
            panic!("Duplicate block {:#x}{:?} in {}", key.0, key.1, g.name);
        }
    }
    for (from, to) in edges.drain(..) {
        let lookup = |k: &str| match by_key.get(&parse_block_key(k)) {
            Some(&n) => n,
            None => panic!("Edge to unknown block {} in {}", k, g.name),
        };
        let (from, to) = (lookup(from), lookup(to));
        g.add_edge(from, to);
    }
    debug!("Lifted function"; "name" => &g.name, "blocks" => g.len());
}

fn parse_hex(s: &str) -> u64 {
    u64::from_str_radix(s.trim_start_matches("0x"), 16)
        .unwrap_or_else(|_| panic!("Expected a hexadecimal number, got {:?}", s))
}

fn parse_block_key(s: &str) -> (u64, Option<usize>) {
    match s.split_once('.') {
        Some((addr, idx)) => (
            parse_hex(addr),
            Some(idx.parse().expect("Invalid block index")),
        ),
        None => (parse_hex(s), None),
    }
}

#[derive(Debug)]
enum SExpr<'a> {
    Leaf(&'a str),
    List(Vec<SExpr<'a>>),
}

fn parse_sexpr(s: &str) -> SExpr {
    let tokens: Vec<&str> = s
        .split_inclusive(|c: char| c == '(' || c == ')' || c.is_whitespace())
        .flat_map(|t| {
            // Separate a trailing delimiter from the token it ends
            let (body, delim) = t.split_at(t.len() - t.chars().last().map_or(0, char::len_utf8));
            match delim {
                "(" | ")" => vec![body, delim],
                _ if delim.trim().is_empty() => vec![body],
                _ => vec![t],
            }
        })
        .filter(|t| !t.trim().is_empty())
        .collect();

    fn go<'a>(tokens: &[&'a str], pos: &mut usize) -> SExpr<'a> {
        let t = tokens
            .get(*pos)
            .unwrap_or_else(|| panic!("Unexpected end of expression"));
        *pos += 1;
        match *t {
            "(" => {
                let mut items = vec![];
                while tokens.get(*pos) != Some(&")") {
                    items.push(go(tokens, pos));
                }
                *pos += 1;
                SExpr::List(items)
            }
            ")" => panic!("Unbalanced `)`"),
            leaf => SExpr::Leaf(leaf),
        }
    }

    let mut pos = 0;
    let r = go(&tokens, &mut pos);
    assert_eq!(pos, tokens.len(), "Trailing input in {:?}", s);
    r
}

/// Split `name:bits`
fn with_bits(s: &str) -> (&str, usize) {
    match s.rsplit_once(':') {
        Some((v, bits)) => (v, bits.parse().expect("Invalid bit width")),
        None => panic!("Missing bit width on {:?}", s),
    }
}

fn parse_endness(s: &SExpr) -> Endness {
    match s {
        SExpr::Leaf("le") => Endness::Little,
        SExpr::Leaf("be") => Endness::Big,
        _ => panic!("Expected `le` or `be`, got {:?}", s),
    }
}

fn parse_usize(s: &SExpr) -> usize {
    match s {
        SExpr::Leaf(n) => n.parse().expect("Expected a number"),
        _ => panic!("Expected a number, got {:?}", s),
    }
}

fn parse_call(items: &[SExpr], bits: Option<usize>) -> Call {
    let (target, args) = items
        .split_first()
        .unwrap_or_else(|| panic!("Call without a target"));
    let target = parse_expr(target);
    let bits = bits.unwrap_or_else(|| target.bits());
    Call {
        target,
        args: args.iter().map(parse_expr).collect(),
        bits,
    }
}

fn parse_expr(s: &SExpr) -> Expr {
    let items = match s {
        SExpr::Leaf(leaf) => {
            let (v, bits) = with_bits(leaf);
            return if let Some(hex) = v.strip_prefix("0x") {
                Expr::constant(parse_hex(hex), bits)
            } else if let Some(off) = v.strip_prefix("sb") {
                Expr::stack_base_offset(off.parse().expect("Invalid stack offset"), bits)
            } else if let Some(idx) = v.strip_prefix('t') {
                Expr::tmp(idx.parse().expect("Invalid temporary"), bits)
            } else if let Some(off) = v.strip_prefix('r') {
                Expr::reg(off.parse().expect("Invalid register offset"), bits)
            } else {
                panic!("Unknown leaf {:?}", leaf)
            };
        }
        SExpr::List(items) => items,
    };
    let (head, args) = match items.split_first() {
        Some((SExpr::Leaf(head), args)) => (*head, args),
        _ => panic!("Expected an operator at the head of {:?}", s),
    };
    match (head, args) {
        ("Load", [addr, size, endness]) => {
            Expr::load(parse_expr(addr), parse_usize(size), parse_endness(endness))
        }
        ("Conv", [from, to, sign, e]) => Expr::convert(
            parse_usize(from),
            parse_usize(to),
            matches!(sign, SExpr::Leaf("s")),
            parse_expr(e),
        ),
        ("Not" | "Neg", [e]) => Expr::UnaryOp {
            op: if head == "Not" { UnOp::Not } else { UnOp::Neg },
            operand: Box::new(parse_expr(e)),
        },
        ("Ite", [c, t, f]) => Expr::Ite {
            cond: Box::new(parse_expr(c)),
            iftrue: Box::new(parse_expr(t)),
            iffalse: Box::new(parse_expr(f)),
        },
        ("Call", args) => Expr::Call(Box::new(parse_call(args, None))),
        ("Dirty", [SExpr::Leaf(name), bits]) => Expr::Dirty {
            name: name.to_string(),
            bits: parse_usize(bits),
        },
        (op, [a, b]) | (op, [a, b, SExpr::Leaf("s")]) => match BinOp::from_name(op) {
            Some(op) => Expr::binop(op, parse_expr(a), parse_expr(b), args.len() == 3),
            None => panic!("Unknown operator {:?}", op),
        },
        _ => panic!("Malformed expression {:?}", s),
    }
}

fn parse_stmt(s: &SExpr) -> StmtKind {
    let items = match s {
        SExpr::List(items) => items,
        SExpr::Leaf(_) => panic!("Expected a statement, got {:?}", s),
    };
    match &items[..] {
        [SExpr::Leaf("Assign"), dst, SExpr::List(src)]
            if matches!(src.first(), Some(SExpr::Leaf("Call"))) =>
        {
            let dst = parse_expr(dst);
            StmtKind::Call {
                call: parse_call(&src[1..], Some(dst.bits())),
                ret_expr: Some(dst),
            }
        }
        [SExpr::Leaf("Assign"), dst, src] => StmtKind::Assignment {
            dst: parse_expr(dst),
            src: parse_expr(src),
        },
        [SExpr::Leaf("Store"), addr, data, endness] => StmtKind::Store {
            addr: parse_expr(addr),
            data: parse_expr(data),
            endness: parse_endness(endness),
        },
        [SExpr::Leaf("Jump"), target] => StmtKind::Jump {
            target: parse_expr(target),
        },
        [SExpr::Leaf("CJump"), c, t, f] => StmtKind::ConditionalJump {
            condition: parse_expr(c),
            true_target: parse_expr(t),
            false_target: parse_expr(f),
        },
        [SExpr::Leaf("Call"), rest @ ..] => StmtKind::Call {
            call: parse_call(rest, None),
            ret_expr: None,
        },
        [SExpr::Leaf("Return"), rets @ ..] => StmtKind::Return {
            ret_exprs: rets.iter().map(parse_expr).collect(),
        },
        [SExpr::Leaf("Dirty"), SExpr::Leaf(name)] => StmtKind::Dirty {
            name: name.to_string(),
        },
        _ => panic!("Malformed statement {:?}", s),
    }
}
