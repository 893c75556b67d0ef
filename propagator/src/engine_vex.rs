//! Transfer functions over the low-level IR. Only constants and stack-relative values are
//! propagated here; no expressions are copied.

use crate::ail::Atom;
use crate::arch::BYTE_WIDTH;
use crate::code_location::CodeLocation;
use crate::containers::unordered::UnorderedMap;
use crate::error::PropagatorError;
use crate::ledger::{Ledger, Replaced, Replacement};
use crate::log::*;
use crate::machine_state::MachineState;
use crate::propagator::AnalysisContext;
use crate::value::Value;
use crate::vex::{Irsb, VexBinop, VexExpr, VexStmt, VexUnop};

pub struct VexEngine<'c, 'l> {
    ctx: &'l AnalysisContext<'c>,
    ledger: &'l mut Ledger,
    block_addr: u64,
    stmt_idx: usize,
    ins_addr: u64,
    tmps: UnorderedMap<usize, Value>,
}

impl<'c, 'l> VexEngine<'c, 'l> {
    pub fn new(ctx: &'l AnalysisContext<'c>, ledger: &'l mut Ledger) -> Self {
        Self {
            ctx,
            ledger,
            block_addr: 0,
            stmt_idx: 0,
            ins_addr: 0,
            tmps: Default::default(),
        }
    }

    fn codeloc(&self) -> CodeLocation {
        CodeLocation::new(self.block_addr, None, self.stmt_idx)
    }

    /// Run every statement of `block` over `state`
    pub fn process(&mut self, state: &mut MachineState, block: &Irsb) -> Result<(), PropagatorError> {
        self.block_addr = block.addr;
        self.ins_addr = block.addr;
        self.tmps.clear();
        for (stmt_idx, stmt) in block.statements.iter().enumerate() {
            self.stmt_idx = stmt_idx;
            self.handle_stmt(state, stmt)?;
        }
        if let Some(next) = &block.next {
            self.expr(state, next)?;
        }
        Ok(())
    }

    fn handle_stmt(&mut self, state: &mut MachineState, stmt: &VexStmt) -> Result<(), PropagatorError> {
        let codeloc = self.codeloc();
        match stmt {
            VexStmt::IMark { addr, .. } => {
                self.ins_addr = *addr;
            }
            VexStmt::Put { offset, data } => {
                let v = self.expr(state, data)?;
                let bits = data.bits();
                state.store_register(*offset, data.size(), widen_to_bytes(v))?;
                self.ledger.add_replacement(
                    codeloc,
                    Replaced::Atom(Atom::Register {
                        offset: *offset,
                        bits,
                    }),
                    Replacement::Value(self.reload(state, *offset, data.size())?),
                );
            }
            VexStmt::WrTmp { tmp, data } => {
                let v = self.expr(state, data)?;
                self.ledger.add_replacement(
                    codeloc,
                    Replaced::Atom(Atom::Tmp {
                        idx: *tmp,
                        bits: data.bits(),
                    }),
                    Replacement::Value(v.clone()),
                );
                self.tmps.insert(*tmp, v);
            }
            VexStmt::Store {
                addr,
                data,
                endness,
            } => {
                let a = self.expr(state, addr)?;
                let d = self.expr(state, data)?;
                let size = data.size();
                if let Some(offset) = a.extract_offset_to_sp() {
                    state.store_local_variable(offset, size, widen_to_bytes(d), *endness)?;
                } else if let Some(addr) = a.as_concrete() {
                    self.ledger.add_replacement(
                        codeloc,
                        Replaced::Atom(Atom::MemoryVariable { addr, size }),
                        Replacement::Value(d),
                    );
                } else {
                    debug!("Store through an unresolved address"; "addr" => ?a, "codeloc" => ?codeloc);
                }
            }
            VexStmt::Exit { guard, .. } => {
                self.expr(state, guard)?;
            }
            VexStmt::Dirty { callee } => {
                debug!("Skipping dirty statement"; "callee" => callee, "codeloc" => ?codeloc);
            }
            VexStmt::NoOp => {}
        }
        Ok(())
    }

    /// What a register-sized read of `offset` gives right after a write, so the proposed
    /// replacement is exactly what later reads will see
    fn reload(&self, state: &MachineState, offset: u64, size: usize) -> Result<Value, PropagatorError> {
        if size == state.gpr_size() {
            state.load_register(offset, size)
        } else {
            Ok(Value::top(size * BYTE_WIDTH))
        }
    }

    /// Evaluate `e` in `state`
    pub fn expr(&mut self, state: &MachineState, e: &VexExpr) -> Result<Value, PropagatorError> {
        Ok(match e {
            VexExpr::Const { value, bits } => Value::concrete(*value, *bits),
            VexExpr::Get { offset, bits } => {
                let arch = &self.ctx.arch;
                let tracked = match self.ctx.stack_pointer_tracker {
                    Some(tracker) if *offset == arch.sp_offset || *offset == arch.bp_offset => {
                        tracker.offset_before(self.ins_addr, *offset)
                    }
                    _ => None,
                };
                match tracked {
                    Some(sb_offset) => Value::sp_offset(sb_offset, *bits),
                    None => state.load_register(*offset, e.size())?,
                }
            }
            VexExpr::RdTmp { tmp, bits } => match self.tmps.get(tmp) {
                Some(v) => v.clone(),
                None => Value::top(*bits),
            },
            VexExpr::Load {
                addr,
                bits,
                endness,
            } => {
                let a = self.expr(state, addr)?;
                let size = e.size();
                if let Some(offset) = a.extract_offset_to_sp() {
                    state.load_local_variable(offset, size, *endness)
                } else if let Some(addr) = a.as_concrete() {
                    self.load_from_memory(addr, size, *endness, *bits)
                } else {
                    Value::top(*bits)
                }
            }
            VexExpr::Binop { op, args } => {
                let a = self.expr(state, &args.0)?;
                let b = self.expr(state, &args.1)?;
                match op {
                    VexBinop::Add => a.add(&b),
                    VexBinop::Sub => a.sub(&b),
                    VexBinop::Mul => a.mul(&b),
                    VexBinop::And => a.and(&b),
                    VexBinop::Or => a.or(&b),
                    VexBinop::Xor => a.xor(&b),
                    VexBinop::Shl => a.shl(&b),
                    VexBinop::Shr => a.shr(&b),
                    VexBinop::Sar => a.sar(&b),
                    VexBinop::CmpEQ => a.compare(&b, |x, y| x == y),
                    VexBinop::CmpNE => a.compare(&b, |x, y| x != y),
                    VexBinop::CmpLTU => a.compare(&b, |x, y| x < y),
                    VexBinop::CmpLEU => a.compare(&b, |x, y| x <= y),
                    VexBinop::CmpLTS => {
                        let bits = a.bits();
                        a.compare(&b, |x, y| {
                            crate::value::sign_extend(x, bits) < crate::value::sign_extend(y, bits)
                        })
                    }
                    VexBinop::CmpLES => {
                        let bits = a.bits();
                        a.compare(&b, |x, y| {
                            crate::value::sign_extend(x, bits) <= crate::value::sign_extend(y, bits)
                        })
                    }
                }
            }
            VexExpr::Unop { op, arg } => {
                let a = self.expr(state, arg)?;
                match op {
                    VexUnop::Not => a.xor(&Value::concrete(u64::MAX, a.bits())),
                    VexUnop::Widen { to_bits, signed } => a.extend(*to_bits, *signed),
                    VexUnop::Narrow { to_bits } => a.truncate(*to_bits),
                }
            }
            VexExpr::CCall { bits, .. } => Value::top(*bits),
            VexExpr::Ite {
                cond,
                iftrue,
                iffalse,
            } => {
                let c = self.expr(state, cond)?;
                let t = self.expr(state, iftrue)?;
                let f = self.expr(state, iffalse)?;
                match c.as_concrete() {
                    Some(0) => f,
                    Some(_) => t,
                    None => Value::top(t.bits()),
                }
            }
        })
    }

    fn load_from_memory(&self, addr: u64, size: usize, endness: crate::arch::Endness, bits: usize) -> Value {
        let allowed = match self.ctx.load_callback {
            Some(callback) => callback(addr, size),
            None => true,
        };
        if !allowed {
            trace!("Load from memory disallowed"; "addr" => addr, "size" => size);
            return Value::top(bits);
        }
        match self
            .ctx
            .base_state
            .and_then(|m| m.load(addr, size, endness))
        {
            Some(v) => Value::concrete(v, bits),
            None => Value::top(bits),
        }
    }
}

/// Registers and stack slots hold whole bytes; sub-byte values (flags) are stored zero-extended
fn widen_to_bytes(v: Value) -> Value {
    let bits = v.bits();
    if bits % BYTE_WIDTH == 0 {
        v
    } else {
        v.extend((bits + BYTE_WIDTH - 1) / BYTE_WIDTH * BYTE_WIDTH, false)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::arch::{Arch, Endness};
    use crate::config::PropagatorConfig;
    use crate::oracle::MemoryImage;

    fn ctx<'a>(memory: Option<&'a MemoryImage>) -> AnalysisContext<'a> {
        let mut ctx = AnalysisContext::new(Arch::amd64(), PropagatorConfig::default());
        if let Some(m) = memory {
            ctx.base_state = Some(m);
        }
        ctx
    }

    #[test]
    fn constants_fold_through_temporaries() {
        let ctx = ctx(None);
        let mut ledger = Ledger::new(false);
        let mut state = MachineState::initial(ctx.arch.clone()).unwrap();
        let block = Irsb {
            addr: 0x1000,
            size: 8,
            statements: vec![
                VexStmt::IMark { addr: 0x1000, len: 4 },
                VexStmt::WrTmp {
                    tmp: 0,
                    data: VexExpr::Const { value: 40, bits: 64 },
                },
                VexStmt::WrTmp {
                    tmp: 1,
                    data: VexExpr::binop(
                        VexBinop::Add,
                        VexExpr::RdTmp { tmp: 0, bits: 64 },
                        VexExpr::Const { value: 2, bits: 64 },
                    ),
                },
                VexStmt::Put {
                    offset: 16,
                    data: VexExpr::RdTmp { tmp: 1, bits: 64 },
                },
            ],
            next: None,
        };
        VexEngine::new(&ctx, &mut ledger)
            .process(&mut state, &block)
            .unwrap();
        assert_eq!(state.load_register(16, 8).unwrap(), Value::concrete(42, 64));
        let at = &ledger.replacements()[&CodeLocation::new(0x1000, None, 3)];
        assert_eq!(
            at[&Replaced::Atom(Atom::Register { offset: 16, bits: 64 })],
            Replacement::Value(Value::concrete(42, 64))
        );
    }

    #[test]
    fn stack_pushes_and_pops() {
        let ctx = ctx(None);
        let arch = ctx.arch.clone();
        let mut ledger = Ledger::new(false);
        let mut state = MachineState::initial(arch.clone()).unwrap();
        let rsp = VexExpr::Get {
            offset: arch.sp_offset,
            bits: 64,
        };
        let block = Irsb {
            addr: 0x2000,
            size: 8,
            statements: vec![
                // push 7
                VexStmt::WrTmp {
                    tmp: 0,
                    data: VexExpr::binop(
                        VexBinop::Sub,
                        rsp.clone(),
                        VexExpr::Const { value: 8, bits: 64 },
                    ),
                },
                VexStmt::Put {
                    offset: arch.sp_offset,
                    data: VexExpr::RdTmp { tmp: 0, bits: 64 },
                },
                VexStmt::Store {
                    addr: VexExpr::RdTmp { tmp: 0, bits: 64 },
                    data: VexExpr::Const { value: 7, bits: 64 },
                    endness: Endness::Little,
                },
                // pop rax
                VexStmt::Put {
                    offset: 16,
                    data: VexExpr::Load {
                        addr: Box::new(rsp),
                        bits: 64,
                        endness: Endness::Little,
                    },
                },
            ],
            next: None,
        };
        VexEngine::new(&ctx, &mut ledger)
            .process(&mut state, &block)
            .unwrap();
        assert_eq!(
            state.load_register(arch.sp_offset, 8).unwrap(),
            Value::sp_offset(-8, 64)
        );
        assert_eq!(state.load_register(16, 8).unwrap(), Value::concrete(7, 64));
    }

    #[test]
    fn loads_from_known_memory() {
        let mut memory = MemoryImage::new();
        memory.add_segment(0x600000, vec![0xef, 0xbe, 0xad, 0xde]);
        let ctx = ctx(Some(&memory));
        let mut ledger = Ledger::new(false);
        let state = MachineState::initial(ctx.arch.clone()).unwrap();
        let mut engine = VexEngine::new(&ctx, &mut ledger);
        let load = VexExpr::Load {
            addr: Box::new(VexExpr::Const {
                value: 0x600000,
                bits: 64,
            }),
            bits: 32,
            endness: Endness::Little,
        };
        assert_eq!(
            engine.expr(&state, &load).unwrap(),
            Value::concrete(0xdeadbeef, 32)
        );
    }

    #[test]
    fn load_callback_can_veto_memory_reads() {
        let mut memory = MemoryImage::new();
        memory.add_segment(0x600000, vec![1, 0, 0, 0]);
        let deny = |_addr: u64, _size: usize| false;
        let mut ctx = ctx(Some(&memory));
        ctx.load_callback = Some(&deny);
        let mut ledger = Ledger::new(false);
        let state = MachineState::initial(ctx.arch.clone()).unwrap();
        let load = VexExpr::Load {
            addr: Box::new(VexExpr::Const {
                value: 0x600000,
                bits: 64,
            }),
            bits: 32,
            endness: Endness::Little,
        };
        assert!(VexEngine::new(&ctx, &mut ledger)
            .expr(&state, &load)
            .unwrap()
            .is_top());
    }
}
