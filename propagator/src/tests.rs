//! Small functions in both IRs, along with end-to-end propagation tests over them.

use crate::ail::{BinOp, Block, Call, Expr, Stmt, StmtKind};
use crate::arch::Endness;
use crate::graph::FunctionGraph;
use crate::vex::{Irsb, VexBinop, VexExpr, VexStmt};

#[cfg(test)]
use crate::{
    ail::Atom,
    ail_state::{AilState, AilValue},
    arch::Arch,
    code_location::CodeLocation,
    config::PropagatorConfig,
    engine_ail::AilEngine,
    ledger::{Ledger, Replaced, Replacement},
    oracle::StaticStackPointerTracker,
    propagator::{
        analyze_block, analyze_function, AnalysisContext, KnowledgeBase, NodeKey, Propagation,
    },
};

/// Register-file offsets used below (AMD64)
pub const RAX: u64 = 16;
pub const RCX: u64 = 24;
pub const RDX: u64 = 32;
pub const RBX: u64 = 40;
pub const RSP: u64 = 48;
pub const RBP: u64 = 56;

fn stmt(block_addr: u64, idx: usize, kind: StmtKind) -> Stmt {
    Stmt::new(idx, block_addr + 4 * idx as u64, kind)
}

fn assign(dst: Expr, src: Expr) -> StmtKind {
    StmtKind::Assignment { dst, src }
}

fn block(addr: u64, kinds: Vec<StmtKind>) -> Block {
    Block::new(
        addr,
        None,
        kinds
            .into_iter()
            .enumerate()
            .map(|(i, k)| stmt(addr, i, k))
            .collect(),
    )
}

fn single_block_function(b: Block) -> FunctionGraph<Block> {
    let mut g = FunctionGraph::new(b.addr, format!("sub_{:x}", b.addr));
    g.add_node(b);
    g
}

/// ```text
/// t0 = rsp - 0x10
/// rsp = t0
/// store t0, 5
/// rax = load t0
/// rcx = rax
/// ```
pub fn stack_slot_block() -> Block {
    let t0 = Expr::tmp(0, 64);
    block(
        0x1000,
        vec![
            assign(
                t0.clone(),
                Expr::binop(BinOp::Sub, Expr::reg(RSP, 64), Expr::constant(0x10, 64), false),
            ),
            assign(Expr::reg(RSP, 64), t0.clone()),
            StmtKind::Store {
                addr: t0.clone(),
                data: Expr::constant(5, 64),
                endness: Endness::Little,
            },
            assign(Expr::reg(RAX, 64), Expr::load(t0, 8, Endness::Little)),
            assign(Expr::reg(RCX, 64), Expr::reg(RAX, 64)),
        ],
    )
}

/// ```text
/// rax = rcx
/// rdx = rax
/// ```
pub fn copy_chain_function() -> FunctionGraph<Block> {
    single_block_function(block(
        0x2000,
        vec![
            assign(Expr::reg(RAX, 64), Expr::reg(RCX, 64)),
            assign(Expr::reg(RDX, 64), Expr::reg(RAX, 64)),
        ],
    ))
}

pub fn call_target() -> Call {
    Call {
        target: Expr::constant(0x401000, 64),
        args: vec![Expr::reg(RCX, 64)],
        bits: 64,
    }
}

/// ```text
/// rax = call 0x401000(rcx)
/// rdx = rax
/// ```
pub fn call_result_function() -> FunctionGraph<Block> {
    single_block_function(block(
        0x3000,
        vec![
            StmtKind::Call {
                call: call_target(),
                ret_expr: Some(Expr::reg(RAX, 64)),
            },
            assign(Expr::reg(RDX, 64), Expr::reg(RAX, 64)),
        ],
    ))
}

/// ```text
/// rax = rcx + 4
/// rdx = rax
/// rbx = rax
/// ```
pub fn shared_expression_function() -> FunctionGraph<Block> {
    single_block_function(block(
        0x4000,
        vec![
            assign(
                Expr::reg(RAX, 64),
                Expr::binop(BinOp::Add, Expr::reg(RCX, 64), Expr::constant(4, 64), false),
            ),
            assign(Expr::reg(RDX, 64), Expr::reg(RAX, 64)),
            assign(Expr::reg(RBX, 64), Expr::reg(RAX, 64)),
        ],
    ))
}

/// ```text
/// 0x5000: rax = 0
/// 0x5010: rcx = rax
///         rax = rax + 1
///         jump 0x5010
/// ```
pub fn counting_loop_function() -> FunctionGraph<Block> {
    let mut g = FunctionGraph::new(0x5000, "counting_loop");
    let entry = g.add_node(block(
        0x5000,
        vec![assign(Expr::reg(RAX, 64), Expr::constant(0, 64))],
    ));
    let body = g.add_node(block(
        0x5010,
        vec![
            assign(Expr::reg(RCX, 64), Expr::reg(RAX, 64)),
            assign(
                Expr::reg(RAX, 64),
                Expr::binop(BinOp::Add, Expr::reg(RAX, 64), Expr::constant(1, 64), false),
            ),
            StmtKind::Jump {
                target: Expr::constant(0x5010, 64),
            },
        ],
    ));
    g.add_edge(entry, body);
    g.add_edge(body, body);
    g
}

/// ```text
/// 0xc000: rax = rcx + 4                 (to 0xc010 and 0xc020)
/// 0xc010: rdx = rax; rax = rbx         (loops back to itself)
/// 0xc020: rbx = rax
/// ```
///
/// `0xc010` first sees `rcx + 4` in `rax`, then, once its back edge is merged in, an unknown
/// value. `0xc020` is processed last and sees `rcx + 4` again.
pub fn evicted_then_reused_function() -> FunctionGraph<Block> {
    let mut g = FunctionGraph::new(0xc000, "evicted_then_reused");
    let entry = g.add_node(block(
        0xc000,
        vec![assign(
            Expr::reg(RAX, 64),
            Expr::binop(BinOp::Add, Expr::reg(RCX, 64), Expr::constant(4, 64), false),
        )],
    ));
    let looping = g.add_node(block(
        0xc010,
        vec![
            assign(Expr::reg(RDX, 64), Expr::reg(RAX, 64)),
            assign(Expr::reg(RAX, 64), Expr::reg(RBX, 64)),
        ],
    ));
    let tail = g.add_node(block(
        0xc020,
        vec![assign(Expr::reg(RBX, 64), Expr::reg(RAX, 64))],
    ));
    // Edge order puts the loop first in reverse post-order
    g.add_edge(entry, tail);
    g.add_edge(entry, looping);
    g.add_edge(looping, looping);
    g
}

/// Low-level IR: `0x6000` sets `rax = 0x2a` and falls through to `0x6010`, which copies `rax`
/// into `rcx`
pub fn vex_two_blocks() -> FunctionGraph<Irsb> {
    let mut g = FunctionGraph::new(0x6000, "vex_two_blocks");
    let a = g.add_node(Irsb {
        addr: 0x6000,
        size: 7,
        statements: vec![
            VexStmt::IMark {
                addr: 0x6000,
                len: 7,
            },
            VexStmt::Put {
                offset: RAX,
                data: VexExpr::Const {
                    value: 0x2a,
                    bits: 64,
                },
            },
        ],
        next: Some(VexExpr::Const {
            value: 0x6010,
            bits: 64,
        }),
    });
    let b = g.add_node(Irsb {
        addr: 0x6010,
        size: 3,
        statements: vec![
            VexStmt::IMark {
                addr: 0x6010,
                len: 3,
            },
            VexStmt::WrTmp {
                tmp: 0,
                data: VexExpr::binop(
                    VexBinop::Add,
                    VexExpr::Get {
                        offset: RAX,
                        bits: 64,
                    },
                    VexExpr::Const { value: 1, bits: 64 },
                ),
            },
            VexStmt::Put {
                offset: RCX,
                data: VexExpr::RdTmp { tmp: 0, bits: 64 },
            },
        ],
        next: None,
    });
    g.add_edge(a, b);
    g
}

#[cfg(test)]
fn ctx() -> AnalysisContext<'static> {
    AnalysisContext::new(Arch::amd64(), PropagatorConfig::default())
}

#[cfg(test)]
fn reg_atom(offset: u64) -> Replaced {
    Replaced::Atom(Atom::Register { offset, bits: 64 })
}

#[cfg(test)]
fn iterations(r: &Propagation, block_addr: u64) -> usize {
    let key: NodeKey = (block_addr, None);
    r.node_iterations[&key]
}

#[cfg(test)]
fn no_call_replacements(p: &Propagation) -> bool {
    p.replacements.values().all(|at| {
        at.values()
            .all(|r| !matches!(r, Replacement::Expr(e) if e.is_call()))
    })
}

#[test]
fn stack_slot_round_trip_in_block_mode() {
    let ctx = ctx();
    let b = stack_slot_block();
    let g = single_block_function(b.clone());
    let r = analyze_block(&ctx, &g, 0).unwrap();
    dbg!(&r);

    // The stack pointer read resolves to the stack base
    assert_eq!(
        r.replacement_at(&b.codeloc(0), &reg_atom(RSP)),
        Some(&Replacement::Expr(Expr::stack_base_offset(0, 64)))
    );
    // The temporary is replaced by the adjusted stack pointer everywhere it is read
    let t0 = Replaced::Atom(Atom::Tmp { idx: 0, bits: 64 });
    for i in 1..=3 {
        assert_eq!(
            r.replacement_at(&b.codeloc(i), &t0),
            Some(&Replacement::Expr(Expr::stack_base_offset(-16, 64)))
        );
    }
    // The load from the stack slot gives the stored constant
    assert_eq!(
        r.replacement_at(&b.codeloc(4), &reg_atom(RAX)),
        Some(&Replacement::Expr(Expr::constant(5, 64)))
    );
    assert!(r.equivalence.contains(&crate::ledger::Equivalence {
        codeloc: b.codeloc(2),
        atom: Atom::StackVariable { offset: -16, size: 8 },
        expr: Expr::constant(5, 64),
    }));
}

#[test]
fn temporaries_do_not_outlive_their_block() {
    let ctx = ctx();
    let b = stack_slot_block();
    let mut ledger = Ledger::new(false);
    let mut state = AilState::initial(ctx.arch.clone()).unwrap();
    AilEngine::new(&ctx, &mut ledger, true)
        .process(&mut state, &b)
        .unwrap();
    let t0 = Expr::tmp(0, 64);
    assert!(state.get_variable(&t0).is_some());
    assert!(state.clone().get_variable(&t0).is_none());
}

#[test]
fn function_runs_do_not_propagate_temporaries() {
    let ctx = ctx();
    let b = stack_slot_block();
    let g = single_block_function(b.clone());
    let r = analyze_function(&ctx, &g, None).unwrap();
    let t0 = Replaced::Atom(Atom::Tmp { idx: 0, bits: 64 });
    assert!((0..5).all(|i| r.replacement_at(&b.codeloc(i), &t0).is_none()));
    // Without the temporary, the stack slot cannot be found
    assert!(r.replacement_at(&b.codeloc(4), &reg_atom(RAX)).is_none());
}

#[test]
fn copies_are_propagated_and_recorded() {
    let ctx = ctx();
    let g = copy_chain_function();
    let r = analyze_function(&ctx, &g, None).unwrap();
    let b = g.node(0);

    let eqs: Vec<_> = r
        .equivalence
        .iter()
        .map(|e| (e.codeloc, e.atom.clone(), e.expr.untagged()))
        .collect();
    assert!(eqs.contains(&(
        b.codeloc(0),
        Atom::Register { offset: RAX, bits: 64 },
        Expr::reg(RCX, 64)
    )));
    assert!(eqs.contains(&(
        b.codeloc(1),
        Atom::Register { offset: RDX, bits: 64 },
        Expr::reg(RAX, 64)
    )));

    match r.replacement_at(&b.codeloc(1), &reg_atom(RAX)) {
        Some(Replacement::Expr(e)) => assert_eq!(e.untagged(), Expr::reg(RCX, 64)),
        other => panic!("Expected rcx to replace rax, got {:?}", other),
    }
}

#[test]
fn call_results_are_never_propagated() {
    let ctx = ctx();
    let g = call_result_function();
    let r = analyze_function(&ctx, &g, None).unwrap();
    let b = g.node(0);

    assert!(r.equivalence.contains(&crate::ledger::Equivalence {
        codeloc: b.codeloc(0),
        atom: Atom::Register { offset: RAX, bits: 64 },
        expr: Expr::Call(Box::new(call_target())),
    }));
    assert!(r.replacement_at(&b.codeloc(1), &reg_atom(RAX)).is_none());
    assert!(no_call_replacements(&r));
}

#[test]
fn expressions_used_twice_are_not_propagated() {
    let ctx = ctx();
    let g = shared_expression_function();
    let r = analyze_function(&ctx, &g, None).unwrap();
    let sum = Expr::binop(BinOp::Add, Expr::reg(RCX, 64), Expr::constant(4, 64), false);
    for at in r.replacements.values() {
        for new in at.values() {
            if let Replacement::Expr(e) = new {
                assert_ne!(e.untagged(), sum);
            }
        }
    }
}

#[test]
fn evicted_sites_still_count_as_uses() {
    let ctx = ctx();
    let g = evicted_then_reused_function();
    let r = analyze_function(&ctx, &g, None).unwrap();
    assert_eq!(iterations(&r, 0xc010), ctx.config.max_iterations);
    assert_eq!(iterations(&r, 0xc020), 1);

    let sum = Expr::binop(BinOp::Add, Expr::reg(RCX, 64), Expr::constant(4, 64), false);
    for at in r.replacements.values() {
        for new in at.values() {
            if let Replacement::Expr(e) = new {
                assert_ne!(e.untagged(), sum);
            }
        }
    }
    assert!(r
        .replacement_at(&CodeLocation::new(0xc020, None, 0), &reg_atom(RAX))
        .is_none());
}

#[test]
fn expressions_used_once_are_propagated() {
    let ctx = ctx();
    let mut g = shared_expression_function();
    let mut b = g.node(0).clone();
    b.statements.pop();
    g = single_block_function(b.clone());
    let r = analyze_function(&ctx, &g, None).unwrap();
    match r.replacement_at(&b.codeloc(1), &reg_atom(RAX)) {
        Some(Replacement::Expr(e)) => assert_eq!(
            e.untagged(),
            Expr::binop(BinOp::Add, Expr::reg(RCX, 64), Expr::constant(4, 64), false)
        ),
        other => panic!("Expected rcx + 4, got {:?}", other),
    }
}

#[test]
fn self_referential_assignments_bind_nothing() {
    let ctx = ctx();
    let b = block(
        0x7000,
        vec![
            assign(Expr::reg(RAX, 64), Expr::load(Expr::reg(RCX, 64), 8, Endness::Little)),
            assign(
                Expr::reg(RCX, 64),
                Expr::binop(BinOp::Xor, Expr::reg(RCX, 64), Expr::reg(RDX, 64), false),
            ),
        ],
    );
    let mut ledger = Ledger::new(false);
    let mut state = AilState::initial(ctx.arch.clone()).unwrap();
    AilEngine::new(&ctx, &mut ledger, true)
        .process(&mut state, &b)
        .unwrap();
    assert!(state.get_variable(&Expr::reg(RCX, 64)).is_none());
    assert!(state.get_variable(&Expr::reg(RAX, 64)).is_some());
}

#[test]
fn stack_alignment_keeps_the_stack_offset() {
    let ctx = ctx();
    let t0 = Expr::tmp(0, 64);
    let b = block(
        0x8000,
        vec![
            assign(
                t0.clone(),
                Expr::binop(
                    BinOp::And,
                    Expr::reg(RSP, 64),
                    Expr::constant(0xffff_ffff_ffff_fff0, 64),
                    false,
                ),
            ),
            assign(Expr::reg(RBP, 64), t0),
        ],
    );
    let g = single_block_function(b.clone());
    let r = analyze_block(&ctx, &g, 0).unwrap();
    assert_eq!(
        r.replacement_at(&b.codeloc(1), &Replaced::Atom(Atom::Tmp { idx: 0, bits: 64 })),
        Some(&Replacement::Expr(Expr::stack_base_offset(0, 64)))
    );
}

#[test]
fn stack_slots_past_the_end_of_the_frame_are_unknown() {
    let ctx = ctx();
    let slot = || {
        Expr::binop(
            BinOp::Add,
            Expr::reg(RSP, 64),
            Expr::constant(0x7fff_ffff_ffff_fffc, 64),
            false,
        )
    };
    let b = block(
        0xd000,
        vec![
            StmtKind::Store {
                addr: slot(),
                data: Expr::constant(5, 64),
                endness: Endness::Little,
            },
            assign(Expr::reg(RAX, 64), Expr::load(slot(), 8, Endness::Little)),
            assign(Expr::reg(RCX, 64), Expr::reg(RAX, 64)),
        ],
    );
    let g = single_block_function(b.clone());
    let r = analyze_function(&ctx, &g, None).unwrap();
    // The store was dropped, so rax is the load itself rather than the stored constant
    assert_eq!(
        r.replacement_at(&b.codeloc(2), &reg_atom(RAX)),
        Some(&Replacement::Expr(Expr::load(
            Expr::stack_base_offset(0x7fff_ffff_ffff_fffc, 64),
            8,
            Endness::Little
        )))
    );
}

#[test]
fn constants_fold() {
    let ctx = ctx();
    let b = block(
        0x9000,
        vec![
            assign(
                Expr::reg(RAX, 64),
                Expr::binop(BinOp::Add, Expr::constant(2, 64), Expr::constant(3, 64), false),
            ),
            assign(
                Expr::reg(RCX, 32),
                Expr::convert(64, 32, false, Expr::reg(RAX, 64)),
            ),
            assign(
                Expr::reg(RDX, 64),
                Expr::binop(BinOp::Sub, Expr::reg(RAX, 64), Expr::constant(7, 64), false),
            ),
            assign(Expr::reg(RBX, 32), Expr::reg(RCX, 32)),
            assign(Expr::reg(RBP, 64), Expr::reg(RDX, 64)),
        ],
    );
    let g = single_block_function(b.clone());
    let r = analyze_function(&ctx, &g, None).unwrap();
    assert_eq!(
        r.replacement_at(&b.codeloc(1), &reg_atom(RAX)),
        Some(&Replacement::Expr(Expr::constant(5, 64)))
    );
    assert_eq!(
        r.replacement_at(
            &b.codeloc(3),
            &Replaced::Atom(Atom::Register { offset: RCX, bits: 32 })
        ),
        Some(&Replacement::Expr(Expr::constant(5, 32)))
    );
    assert_eq!(
        r.replacement_at(&b.codeloc(4), &reg_atom(RDX)),
        Some(&Replacement::Expr(Expr::constant(5u64.wrapping_sub(7), 64)))
    );
}

#[test]
fn outdated_copies_are_rejected() {
    let ctx = ctx();
    let b = block(
        0xa000,
        vec![
            // rax = rcx, then rcx is redefined, so rax can no longer be replaced by rcx
            assign(Expr::reg(RAX, 64), Expr::reg(RCX, 64)),
            assign(Expr::reg(RCX, 64), Expr::constant(1, 64)),
            assign(Expr::reg(RDX, 64), Expr::reg(RAX, 64)),
        ],
    );
    let g = single_block_function(b.clone());
    let r = analyze_function(&ctx, &g, None).unwrap();
    assert!(r.replacement_at(&b.codeloc(2), &reg_atom(RAX)).is_none());

    // The rejected read is unknown, not a stale copy of rcx
    let mut ledger = Ledger::new(false);
    let mut state = AilState::initial(ctx.arch.clone()).unwrap();
    AilEngine::new(&ctx, &mut ledger, false)
        .process(&mut state, &b)
        .unwrap();
    assert_eq!(
        state.get_variable(&Expr::reg(RDX, 64)),
        Some(AilValue::Top(64))
    );
}

#[test]
fn stack_pointer_tracker_resolves_frame_pointer() {
    let mut tracker = StaticStackPointerTracker::new();
    tracker.set(0xb000, RBP, -8);
    let mut ctx = ctx();
    ctx.stack_pointer_tracker = Some(&tracker);
    let b = block(0xb000, vec![assign(Expr::reg(RAX, 64), Expr::reg(RBP, 64))]);
    let g = single_block_function(b.clone());
    let r = analyze_function(&ctx, &g, None).unwrap();
    assert_eq!(
        r.replacement_at(&b.codeloc(0), &reg_atom(RBP)),
        Some(&Replacement::Expr(Expr::stack_base_offset(-8, 64)))
    );
}

#[test]
fn transfer_is_idempotent_at_fixpoint() {
    let ctx = ctx();
    let b = stack_slot_block();
    let input = AilState::initial(ctx.arch.clone()).unwrap();
    let mut ledger = Ledger::new(false);

    let mut first = input.clone();
    AilEngine::new(&ctx, &mut ledger, true)
        .process(&mut first, &b)
        .unwrap();
    let replacements = ledger.replacements().clone();
    let equivalence = ledger.equivalence().clone();

    let mut second = input.clone();
    AilEngine::new(&ctx, &mut ledger, true)
        .process(&mut second, &b)
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(ledger.replacements(), &replacements);
    assert_eq!(ledger.equivalence(), &equivalence);
}

#[test]
fn loops_stop_at_the_iteration_cap() {
    let ctx = ctx();
    let g = counting_loop_function();
    let r = analyze_function(&ctx, &g, None).unwrap();
    assert_eq!(iterations(&r, 0x5000), 1);
    assert_eq!(iterations(&r, 0x5010), ctx.config.max_iterations);
    // rax differs between the entry and the back edge
    assert!(r
        .replacement_at(&CodeLocation::new(0x5010, None, 0), &reg_atom(RAX))
        .is_none());

    let mut config = PropagatorConfig::default();
    config.max_iterations = 2;
    let ctx = AnalysisContext::new(Arch::amd64(), config);
    let r = analyze_function(&ctx, &g, None).unwrap();
    assert_eq!(iterations(&r, 0x5010), 2);
}

#[test]
fn results_are_published_for_completed_functions() {
    let mut ctx = ctx();
    let g = copy_chain_function();
    let mut kb = KnowledgeBase::new();

    analyze_function(&ctx, &g, Some(&mut kb)).unwrap();
    assert!(kb.get(g.addr).is_none());

    ctx.completed_funcs.insert(g.addr);
    let r = analyze_function(&ctx, &g, Some(&mut kb)).unwrap();
    assert_eq!(kb.get(g.addr), Some(&r.replacements));

    // Cached results are reused as is, even if the function changed
    let changed = single_block_function(block(
        g.addr,
        vec![assign(Expr::reg(RAX, 64), Expr::constant(1, 64))],
    ));
    let cached = analyze_function(&ctx, &changed, Some(&mut kb)).unwrap();
    assert_eq!(cached.replacements, r.replacements);
    assert!(cached.node_iterations.is_empty());
}

#[test]
fn vex_constants_flow_across_blocks() {
    let ctx = ctx();
    let g = vex_two_blocks();
    let r = analyze_function(&ctx, &g, None).unwrap();
    assert_eq!(
        r.replacement_at(&CodeLocation::new(0x6010, None, 2), &reg_atom(RCX)),
        Some(&Replacement::Value(crate::value::Value::concrete(0x2b, 64)))
    );
}

#[test]
fn empty_vex_blocks_keep_their_prior_state() {
    let ctx = ctx();
    let mut g = vex_two_blocks();
    let mut empty = g.node(0).clone();
    empty.size = 0;
    let mut broken = FunctionGraph::new(g.addr, g.name.clone());
    let a = broken.add_node(empty);
    let b = broken.add_node(g.node(1).clone());
    broken.add_edge(a, b);
    g = broken;

    let r = analyze_function(&ctx, &g, None).unwrap();
    assert_eq!(iterations(&r, 0x6000), 1);
    // The successor still runs, from the initial state, so rax is unknown there
    assert_eq!(iterations(&r, 0x6010), 1);
    assert!(r
        .replacement_at(&CodeLocation::new(0x6010, None, 2), &reg_atom(RCX))
        .is_none());
}

#[test]
fn dot_output_lists_replacements() {
    let ctx = ctx();
    let g = copy_chain_function();
    let r = analyze_function(&ctx, &g, None).unwrap();
    let dot = r.generate_dot(&g);
    assert!(dot.starts_with("digraph Propagation"));
    assert!(dot.contains("0x2000"));
    assert!(dot.contains("r16:64"));
    assert!(r.to_string().contains("Equivalence:"));
}
