//! Transfer functions over the structured IR.
//!
//! Every expression handler returns the (possibly rewritten) expression, or `Top` if nothing is
//! known about it. Reads of temporaries and registers propose replacements to the [`Ledger`] as a
//! side effect.

use crate::ail::{Atom, BinOp, Block, Expr, Stmt, StmtKind};
use crate::ail_state::{expr_to_value, AilState, AilValue};
use crate::code_location::CodeLocation;
use crate::error::PropagatorError;
use crate::ledger::{Ledger, Replaced, Replacement};
use crate::log::*;
use crate::propagator::AnalysisContext;
use crate::value::{is_alignment_mask, sign_extend};

pub struct AilEngine<'c, 'l> {
    ctx: &'l AnalysisContext<'c>,
    ledger: &'l mut Ledger,
    propagate_tmps: bool,
    block_addr: u64,
    block_idx: Option<usize>,
    stmt_idx: usize,
    ins_addr: u64,
}

fn to_replacement(v: &AilValue) -> Replacement {
    match v {
        AilValue::Top(_) => Replacement::Top,
        AilValue::Expr(e) => Replacement::Expr(e.clone()),
    }
}

/// Offset to the stack pointer at function entry, for stack-relative values
fn extract_offset_to_sp(v: &AilValue) -> Option<i64> {
    match v {
        AilValue::Expr(Expr::StackBaseOffset { offset, .. }) => Some(*offset),
        _ => None,
    }
}

impl<'c, 'l> AilEngine<'c, 'l> {
    pub fn new(ctx: &'l AnalysisContext<'c>, ledger: &'l mut Ledger, propagate_tmps: bool) -> Self {
        Self {
            ctx,
            ledger,
            propagate_tmps,
            block_addr: 0,
            block_idx: None,
            stmt_idx: 0,
            ins_addr: 0,
        }
    }

    fn codeloc(&self) -> CodeLocation {
        CodeLocation::new(self.block_addr, self.block_idx, self.stmt_idx)
    }

    /// Run every statement of `block`, in order, over `state`
    pub fn process(&mut self, state: &mut AilState, block: &Block) -> Result<(), PropagatorError> {
        self.block_addr = block.addr;
        self.block_idx = block.idx;
        for (stmt_idx, stmt) in block.statements.iter().enumerate() {
            self.stmt_idx = stmt_idx;
            self.ins_addr = stmt.ins_addr;
            self.handle_stmt(state, stmt)?;
        }
        Ok(())
    }

    fn handle_stmt(&mut self, state: &mut AilState, stmt: &Stmt) -> Result<(), PropagatorError> {
        let codeloc = self.codeloc();
        match &stmt.kind {
            StmtKind::Assignment { dst, src } => {
                let v = self.expr(state, src)?;
                match dst {
                    Expr::Tmp { .. } => state.store_variable(Some(dst), Some(&v), codeloc)?,
                    Expr::Register { .. } => {
                        state.store_variable(Some(dst), Some(&v), codeloc)?;
                        if let (Some(atom), Expr::Register { .. } | Expr::Call(_)) =
                            (Atom::from_expr(dst), src)
                        {
                            self.ledger.add_equivalence(codeloc, atom, src.clone());
                        }
                    }
                    _ => {
                        warn!("Unsupported type of assignment destination";
                              "dst" => ?dst, "codeloc" => ?codeloc);
                    }
                }
            }
            StmtKind::Store {
                addr,
                data,
                endness,
            } => {
                let a = self.expr(state, addr)?;
                let d = self.expr(state, data)?;
                match extract_offset_to_sp(&a) {
                    Some(offset) => {
                        let size = data.size();
                        let value = d
                            .as_expr()
                            .and_then(expr_to_value)
                            .filter(|v| v.bits() == size * crate::arch::BYTE_WIDTH);
                        state.store_stack_variable(offset, size, value, *endness, codeloc)?;
                        self.ledger.add_equivalence(
                            codeloc,
                            Atom::StackVariable { offset, size },
                            data.clone(),
                        );
                    }
                    None => {
                        debug!("Store through an unresolved address"; "addr" => ?a, "codeloc" => ?codeloc);
                    }
                }
            }
            StmtKind::Jump { target } => {
                let t = self.expr(state, target)?;
                if let AilValue::Expr(t) = t {
                    if t != *target {
                        let new_jump = Stmt::new(stmt.idx, stmt.ins_addr, StmtKind::Jump { target: t });
                        self.ledger.add_replacement(
                            codeloc,
                            Replaced::Statement,
                            Replacement::Stmt(new_jump),
                        );
                    }
                }
            }
            StmtKind::ConditionalJump {
                condition,
                true_target,
                false_target,
            } => {
                self.expr(state, condition)?;
                self.expr(state, true_target)?;
                self.expr(state, false_target)?;
            }
            StmtKind::Call { call, ret_expr } => {
                self.expr(state, &call.target)?;
                for arg in &call.args {
                    self.expr(state, arg)?;
                }
                if let Some(ret_expr) = ret_expr {
                    // Treat it as an assignment of an unknown value
                    let top = AilValue::Top(ret_expr.bits());
                    state.store_variable(Some(ret_expr), Some(&top), codeloc)?;
                    if let Some(atom) = Atom::from_expr(ret_expr) {
                        self.ledger.add_equivalence(
                            codeloc,
                            atom,
                            Expr::Call(Box::new(call.clone())),
                        );
                    }
                }
            }
            StmtKind::Return { ret_exprs } => {
                for e in ret_exprs {
                    self.expr(state, e)?;
                }
            }
            StmtKind::Dirty { name } => {
                debug!("Skipping dirty statement"; "name" => name, "codeloc" => ?codeloc);
            }
        }
        Ok(())
    }

    /// Evaluate `e` in `state`
    pub fn expr(&mut self, state: &mut AilState, e: &Expr) -> Result<AilValue, PropagatorError> {
        match e {
            Expr::Tmp { .. } => Ok(self.handle_tmp(state, e)),
            Expr::Register { offset, .. } => Ok(self.handle_register(state, e, *offset)),
            Expr::Load {
                addr,
                size,
                endness,
            } => {
                let a = self.expr(state, addr)?;
                let a = match a {
                    AilValue::Top(_) => return Ok(AilValue::Top(e.bits())),
                    AilValue::Expr(a) => a,
                };
                if let Expr::StackBaseOffset { offset, .. } = a {
                    if let Some(v) = state.get_stack_variable(offset, *size, *endness) {
                        return Ok(AilValue::Expr(v));
                    }
                }
                if a != **addr {
                    Ok(AilValue::Expr(Expr::load(a, *size, *endness)))
                } else {
                    Ok(AilValue::Expr(e.clone()))
                }
            }
            Expr::Convert {
                from_bits,
                to_bits,
                signed,
                operand,
            } => {
                let o = match self.expr(state, operand)? {
                    AilValue::Top(_) => return Ok(AilValue::Top(*to_bits)),
                    AilValue::Expr(o) => o,
                };
                Ok(AilValue::Expr(convert(*from_bits, *to_bits, *signed, o)))
            }
            Expr::BinaryOp {
                op,
                operands,
                signed,
                bits,
            } => self.handle_binop(state, e, *op, operands, *signed, *bits),
            Expr::Ite {
                cond,
                iftrue,
                iffalse,
            } => {
                self.expr(state, cond)?;
                self.expr(state, iftrue)?;
                self.expr(state, iffalse)?;
                Ok(AilValue::Expr(e.clone()))
            }
            Expr::Call(call) => {
                self.expr(state, &call.target)?;
                for arg in &call.args {
                    self.expr(state, arg)?;
                }
                Ok(AilValue::Expr(e.clone()))
            }
            Expr::Const { .. } | Expr::StackBaseOffset { .. } | Expr::Dirty { .. } => {
                Ok(AilValue::Expr(e.clone()))
            }
            Expr::UnaryOp { .. } => {
                debug!("Unsupported expression, leaving as is"; "expr" => ?e, "codeloc" => ?self.codeloc());
                Ok(AilValue::Expr(e.clone()))
            }
        }
    }

    fn handle_tmp(&mut self, state: &AilState, e: &Expr) -> AilValue {
        if !self.propagate_tmps {
            return AilValue::Top(e.bits());
        }
        if let Some(new) = state.get_variable(e) {
            if let AilValue::Expr(n) = &new {
                if state.is_using_outdated_def(n) {
                    return AilValue::Top(e.bits());
                }
            }
            self.propose(e, &new);
            if let AilValue::Expr(
                n @ (Expr::Register { .. }
                | Expr::Const { .. }
                | Expr::Convert { .. }
                | Expr::StackBaseOffset { .. }),
            ) = new
            {
                return AilValue::Expr(n);
            }
        }
        AilValue::Top(e.bits())
    }

    fn handle_register(&mut self, state: &AilState, e: &Expr, offset: u64) -> AilValue {
        // Special handling for SP and BP
        let arch = &self.ctx.arch;
        if let Some(tracker) = self.ctx.stack_pointer_tracker {
            if offset == arch.sp_offset || offset == arch.bp_offset {
                if let Some(sb_offset) = tracker.offset_before(self.ins_addr, offset) {
                    let new = AilValue::Expr(Expr::stack_base_offset(sb_offset, arch.bits));
                    self.propose(e, &new);
                    return new;
                }
            }
        }
        match state.get_variable(e) {
            Some(new) => {
                if matches!(&new, AilValue::Expr(n) if state.is_using_outdated_def(n)) {
                    trace!("Rejecting an outdated candidate"; "reg" => ?e, "candidate" => ?new);
                    return AilValue::Top(e.bits());
                }
                self.propose(e, &new);
                new
            }
            None => AilValue::Expr(e.clone()),
        }
    }

    fn propose(&mut self, old: &Expr, new: &AilValue) {
        let atom = match Atom::from_expr(old) {
            Some(atom) => atom,
            None => return,
        };
        trace!("Add a replacement"; "codeloc" => ?self.codeloc(), "old" => ?atom, "new" => ?new);
        self.ledger
            .add_replacement(self.codeloc(), Replaced::Atom(atom), to_replacement(new));
    }

    fn handle_binop(
        &mut self,
        state: &mut AilState,
        e: &Expr,
        op: BinOp,
        operands: &(Expr, Expr),
        signed: bool,
        bits: usize,
    ) -> Result<AilValue, PropagatorError> {
        if matches!(op, BinOp::Mul | BinOp::Div | BinOp::Mod | BinOp::Or | BinOp::Sar) {
            debug!("Unsupported binary operation, leaving as is"; "op" => op.name(), "codeloc" => ?self.codeloc());
            return Ok(AilValue::Expr(e.clone()));
        }

        let o0 = self.expr(state, &operands.0)?;
        let o1 = self.expr(state, &operands.1)?;

        let (o0, o1) = match (o0, o1) {
            (AilValue::Expr(o0), AilValue::Expr(o1)) => (o0, o1),
            _ if op.is_comparison() => return Ok(AilValue::Top(1)),
            (AilValue::Top(b), _) | (_, AilValue::Top(b)) => return Ok(AilValue::Top(b)),
        };

        let folded = match (op, &o0, &o1) {
            (
                BinOp::Add,
                Expr::Const { value: a, .. },
                Expr::Const { value: b, .. },
            ) => Some(Expr::constant(a.wrapping_add(*b), bits)),
            (
                BinOp::Sub,
                Expr::Const { value: a, .. },
                Expr::Const { value: b, .. },
            ) => Some(Expr::constant(a.wrapping_sub(*b), bits)),
            (
                BinOp::Add,
                Expr::StackBaseOffset { offset, bits: sbits },
                Expr::Const { value, bits: cbits },
            )
            | (
                BinOp::Add,
                Expr::Const { value, bits: cbits },
                Expr::StackBaseOffset { offset, bits: sbits },
            ) => Some(Expr::stack_base_offset(
                offset.wrapping_add(sign_extend(*value, *cbits)),
                *sbits,
            )),
            (
                BinOp::Sub,
                Expr::StackBaseOffset { offset, bits: sbits },
                Expr::Const { value, bits: cbits },
            ) => Some(Expr::stack_base_offset(
                offset.wrapping_sub(sign_extend(*value, *cbits)),
                *sbits,
            )),
            // Stack pointer alignment
            (BinOp::And, sp @ Expr::StackBaseOffset { .. }, Expr::Const { value, bits })
            | (BinOp::And, Expr::Const { value, bits }, sp @ Expr::StackBaseOffset { .. })
                if is_alignment_mask(*value, *bits) =>
            {
                Some(sp.clone())
            }
            _ => None,
        };

        Ok(AilValue::Expr(match folded {
            Some(f) => f,
            None => Expr::BinaryOp {
                op,
                operands: Box::new((o0, o1)),
                signed,
                bits,
            },
        }))
    }
}

/// Conversion of an already-evaluated operand
fn convert(from_bits: usize, to_bits: usize, signed: bool, operand: Expr) -> Expr {
    match operand {
        Expr::Convert {
            from_bits: inner_from,
            to_bits: inner_to,
            signed: inner_signed,
            operand: inner,
        } => {
            if from_bits == inner_to && to_bits == inner_from && signed == inner_signed {
                // Round trip
                *inner
            } else if signed == inner_signed
                && ((inner_from < inner_to && inner_to < to_bits)
                    || (inner_from > inner_to && inner_to > to_bits))
            {
                // Two steps in the same direction
                Expr::convert(inner_from, to_bits, signed, *inner)
            } else {
                Expr::convert(
                    from_bits,
                    to_bits,
                    signed,
                    Expr::Convert {
                        from_bits: inner_from,
                        to_bits: inner_to,
                        signed: inner_signed,
                        operand: inner,
                    },
                )
            }
        }
        Expr::Const { value, .. } => Expr::constant(value, to_bits),
        operand => Expr::convert(from_bits, to_bits, signed, operand),
    }
}
