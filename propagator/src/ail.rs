//! The structured IR: expressions and statements over registers, temporaries and memory, grouped
//! into blocks.

use crate::arch::{Endness, BYTE_WIDTH};
use crate::code_location::CodeLocation;
use crate::value::mask;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Sar,
    CmpLE,
    CmpLT,
    CmpGE,
    CmpGT,
    CmpEQ,
    CmpNE,
}

impl BinOp {
    pub fn is_comparison(self) -> bool {
        use BinOp::*;
        matches!(self, CmpLE | CmpLT | CmpGE | CmpGT | CmpEQ | CmpNE)
    }

    pub fn name(self) -> &'static str {
        use BinOp::*;
        match self {
            Add => "Add",
            Sub => "Sub",
            Mul => "Mul",
            Div => "Div",
            Mod => "Mod",
            And => "And",
            Or => "Or",
            Xor => "Xor",
            Shl => "Shl",
            Shr => "Shr",
            Sar => "Sar",
            CmpLE => "CmpLE",
            CmpLT => "CmpLT",
            CmpGE => "CmpGE",
            CmpGT => "CmpGT",
            CmpEQ => "CmpEQ",
            CmpNE => "CmpNE",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        use BinOp::*;
        Some(match name {
            "Add" => Add,
            "Sub" => Sub,
            "Mul" => Mul,
            "Div" => Div,
            "Mod" => Mod,
            "And" => And,
            "Or" => Or,
            "Xor" => Xor,
            "Shl" => Shl,
            "Shr" => Shr,
            "Sar" => Sar,
            "CmpLE" => CmpLE,
            "CmpLT" => CmpLT,
            "CmpGE" => CmpGE,
            "CmpGT" => CmpGT,
            "CmpEQ" => CmpEQ,
            "CmpNE" => CmpNE,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum UnOp {
    Not,
    Neg,
}

/// A call, either as an expression or as the body of a [`StmtKind::Call`]
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Call {
    pub target: Expr,
    pub args: Vec<Expr>,
    /// Width of the returned value
    pub bits: usize,
}

/// A structured-IR expression.
///
/// `Register::def_at` is a tag: it names the definition a copied register reference was taken
/// from, and is ignored by [`Expr::untagged`] comparisons.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Expr {
    Const {
        value: u64,
        bits: usize,
    },
    Tmp {
        idx: usize,
        bits: usize,
    },
    Register {
        offset: u64,
        bits: usize,
        def_at: Option<CodeLocation>,
    },
    /// The stack pointer at function entry plus `offset`
    StackBaseOffset {
        offset: i64,
        bits: usize,
    },
    Load {
        addr: Box<Expr>,
        /// Size in bytes
        size: usize,
        endness: Endness,
    },
    Convert {
        from_bits: usize,
        to_bits: usize,
        signed: bool,
        operand: Box<Expr>,
    },
    BinaryOp {
        op: BinOp,
        operands: Box<(Expr, Expr)>,
        signed: bool,
        bits: usize,
    },
    UnaryOp {
        op: UnOp,
        operand: Box<Expr>,
    },
    Ite {
        cond: Box<Expr>,
        iftrue: Box<Expr>,
        iffalse: Box<Expr>,
    },
    Call(Box<Call>),
    /// Something with effects or semantics the IR does not model
    Dirty {
        name: String,
        bits: usize,
    },
}

impl Expr {
    pub fn constant(value: u64, bits: usize) -> Self {
        Expr::Const {
            value: value & mask(bits),
            bits,
        }
    }

    pub fn tmp(idx: usize, bits: usize) -> Self {
        Expr::Tmp { idx, bits }
    }

    pub fn reg(offset: u64, bits: usize) -> Self {
        Expr::Register {
            offset,
            bits,
            def_at: None,
        }
    }

    pub fn stack_base_offset(offset: i64, bits: usize) -> Self {
        Expr::StackBaseOffset { offset, bits }
    }

    pub fn load(addr: Expr, size: usize, endness: Endness) -> Self {
        Expr::Load {
            addr: Box::new(addr),
            size,
            endness,
        }
    }

    pub fn convert(from_bits: usize, to_bits: usize, signed: bool, operand: Expr) -> Self {
        Expr::Convert {
            from_bits,
            to_bits,
            signed,
            operand: Box::new(operand),
        }
    }

    pub fn binop(op: BinOp, lhs: Expr, rhs: Expr, signed: bool) -> Self {
        let bits = if op.is_comparison() { 1 } else { lhs.bits() };
        Expr::BinaryOp {
            op,
            operands: Box::new((lhs, rhs)),
            signed,
            bits,
        }
    }

    pub fn call(target: Expr, args: Vec<Expr>, bits: usize) -> Self {
        Expr::Call(Box::new(Call { target, args, bits }))
    }

    pub fn bits(&self) -> usize {
        match self {
            Expr::Const { bits, .. }
            | Expr::Tmp { bits, .. }
            | Expr::Register { bits, .. }
            | Expr::StackBaseOffset { bits, .. }
            | Expr::BinaryOp { bits, .. }
            | Expr::Dirty { bits, .. } => *bits,
            Expr::Load { size, .. } => size * BYTE_WIDTH,
            Expr::Convert { to_bits, .. } => *to_bits,
            Expr::UnaryOp { operand, .. } => operand.bits(),
            Expr::Ite { iftrue, .. } => iftrue.bits(),
            Expr::Call(c) => c.bits,
        }
    }

    /// Size in bytes, rounded up
    pub fn size(&self) -> usize {
        (self.bits() + BYTE_WIDTH - 1) / BYTE_WIDTH
    }

    /// Immediate sub-expressions, in evaluation order
    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Const { .. }
            | Expr::Tmp { .. }
            | Expr::Register { .. }
            | Expr::StackBaseOffset { .. }
            | Expr::Dirty { .. } => vec![],
            Expr::Load { addr, .. } => vec![addr.as_ref()],
            Expr::Convert { operand, .. } | Expr::UnaryOp { operand, .. } => vec![operand.as_ref()],
            Expr::BinaryOp { operands, .. } => vec![&operands.0, &operands.1],
            Expr::Ite {
                cond,
                iftrue,
                iffalse,
            } => vec![cond.as_ref(), iftrue.as_ref(), iffalse.as_ref()],
            Expr::Call(c) => std::iter::once(&c.target).chain(c.args.iter()).collect(),
        }
    }

    /// Visit `self` and every sub-expression, parents before children
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a Expr)) {
        f(self);
        for c in self.children() {
            c.walk(f);
        }
    }

    /// Whether `atom` occurs anywhere in this expression. Widths and tags are not considered.
    pub fn has_atom(&self, atom: &Atom) -> bool {
        let mut found = false;
        self.walk(&mut |e| match (e, atom) {
            (Expr::Tmp { idx, .. }, Atom::Tmp { idx: a, .. }) if idx == a => found = true,
            (Expr::Register { offset, .. }, Atom::Register { offset: a, .. }) if offset == a => {
                found = true
            }
            _ => {}
        });
        found
    }

    /// A copy with every tag removed
    pub fn untagged(&self) -> Expr {
        match self {
            Expr::Register { offset, bits, .. } => Expr::reg(*offset, *bits),
            Expr::Const { .. }
            | Expr::Tmp { .. }
            | Expr::StackBaseOffset { .. }
            | Expr::Dirty { .. } => self.clone(),
            Expr::Load {
                addr,
                size,
                endness,
            } => Expr::load(addr.untagged(), *size, *endness),
            Expr::Convert {
                from_bits,
                to_bits,
                signed,
                operand,
            } => Expr::convert(*from_bits, *to_bits, *signed, operand.untagged()),
            Expr::BinaryOp {
                op,
                operands,
                signed,
                bits,
            } => Expr::BinaryOp {
                op: *op,
                operands: Box::new((operands.0.untagged(), operands.1.untagged())),
                signed: *signed,
                bits: *bits,
            },
            Expr::UnaryOp { op, operand } => Expr::UnaryOp {
                op: *op,
                operand: Box::new(operand.untagged()),
            },
            Expr::Ite {
                cond,
                iftrue,
                iffalse,
            } => Expr::Ite {
                cond: Box::new(cond.untagged()),
                iftrue: Box::new(iftrue.untagged()),
                iffalse: Box::new(iffalse.untagged()),
            },
            Expr::Call(c) => Expr::call(
                c.target.untagged(),
                c.args.iter().map(Expr::untagged).collect(),
                c.bits,
            ),
        }
    }

    pub fn is_const(&self) -> bool {
        matches!(self, Expr::Const { .. })
    }

    pub fn is_call(&self) -> bool {
        matches!(self, Expr::Call(_))
    }
}

impl std::fmt::Debug for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Expr::Const { value, bits } => write!(f, "{:#x}:{}", value, bits),
            Expr::Tmp { idx, bits } => write!(f, "t{}:{}", idx, bits),
            Expr::Register {
                offset,
                bits,
                def_at,
            } => {
                write!(f, "r{}:{}", offset, bits)?;
                if let Some(d) = def_at {
                    write!(f, "{:?}", d)?;
                }
                Ok(())
            }
            Expr::StackBaseOffset { offset, bits } => write!(f, "stack({}):{}", offset, bits),
            Expr::Load {
                addr,
                size,
                endness,
            } => write!(
                f,
                "(Load {:?} {} {})",
                addr,
                size,
                match endness {
                    Endness::Little => "le",
                    Endness::Big => "be",
                }
            ),
            Expr::Convert {
                from_bits,
                to_bits,
                signed,
                operand,
            } => write!(
                f,
                "(Conv {} {} {} {:?})",
                from_bits,
                to_bits,
                if *signed { "s" } else { "u" },
                operand
            ),
            Expr::BinaryOp {
                op,
                operands,
                signed,
                ..
            } => write!(
                f,
                "({}{} {:?} {:?})",
                op.name(),
                if *signed && op.is_comparison() { "s" } else { "" },
                operands.0,
                operands.1
            ),
            Expr::UnaryOp { op, operand } => write!(f, "({:?} {:?})", op, operand),
            Expr::Ite {
                cond,
                iftrue,
                iffalse,
            } => write!(f, "(Ite {:?} {:?} {:?})", cond, iftrue, iffalse),
            Expr::Call(c) => write!(f, "{:?}", c),
            Expr::Dirty { name, bits } => write!(f, "(Dirty {}):{}", name, bits),
        }
    }
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "(Call {:?}", self.target)?;
        for a in &self.args {
            write!(f, " {:?}", a)?;
        }
        write!(f, "):{}", self.bits)
    }
}

/// An addressable unit of state
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Atom {
    Tmp { idx: usize, bits: usize },
    Register { offset: u64, bits: usize },
    /// A stack slot, relative to the stack pointer at function entry
    StackVariable { offset: i64, size: usize },
    /// A global memory location
    MemoryVariable { addr: u64, size: usize },
}

impl Atom {
    /// The atom an expression directly names, if it names one
    pub fn from_expr(e: &Expr) -> Option<Self> {
        match e {
            Expr::Tmp { idx, bits } => Some(Atom::Tmp {
                idx: *idx,
                bits: *bits,
            }),
            Expr::Register { offset, bits, .. } => Some(Atom::Register {
                offset: *offset,
                bits: *bits,
            }),
            _ => None,
        }
    }

    pub fn is_tmp(&self) -> bool {
        matches!(self, Atom::Tmp { .. })
    }
}

impl std::fmt::Debug for Atom {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Atom::Tmp { idx, bits } => write!(f, "t{}:{}", idx, bits),
            Atom::Register { offset, bits } => write!(f, "r{}:{}", offset, bits),
            Atom::StackVariable { offset, size } => write!(f, "Stack({}, {})", offset, size),
            Atom::MemoryVariable { addr, size } => write!(f, "Mem({:#x}, {})", addr, size),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StmtKind {
    Assignment {
        dst: Expr,
        src: Expr,
    },
    Store {
        addr: Expr,
        data: Expr,
        endness: Endness,
    },
    Jump {
        target: Expr,
    },
    ConditionalJump {
        condition: Expr,
        true_target: Expr,
        false_target: Expr,
    },
    Call {
        call: Call,
        ret_expr: Option<Expr>,
    },
    Return {
        ret_exprs: Vec<Expr>,
    },
    Dirty {
        name: String,
    },
}

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Stmt {
    /// Index of the statement within its block
    pub idx: usize,
    /// Address of the machine instruction the statement was lifted from
    pub ins_addr: u64,
    pub kind: StmtKind,
}

impl Stmt {
    pub fn new(idx: usize, ins_addr: u64, kind: StmtKind) -> Self {
        Self {
            idx,
            ins_addr,
            kind,
        }
    }
}

impl std::fmt::Debug for Stmt {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:02} | {:#x} | ", self.idx, self.ins_addr)?;
        match &self.kind {
            StmtKind::Assignment { dst, src } => write!(f, "{:?} = {:?}", dst, src),
            StmtKind::Store {
                addr,
                data,
                endness,
            } => write!(
                f,
                "store {:?} {:?}{}",
                addr,
                data,
                if *endness == Endness::Big { " be" } else { "" }
            ),
            StmtKind::Jump { target } => write!(f, "jump {:?}", target),
            StmtKind::ConditionalJump {
                condition,
                true_target,
                false_target,
            } => write!(f, "cjump {:?} {:?} {:?}", condition, true_target, false_target),
            StmtKind::Call { call, ret_expr } => {
                write!(f, "call {:?}", call.target)?;
                for a in &call.args {
                    write!(f, " {:?}", a)?;
                }
                if let Some(r) = ret_expr {
                    write!(f, " -> {:?}", r)?;
                }
                Ok(())
            }
            StmtKind::Return { ret_exprs } => {
                write!(f, "ret")?;
                for r in ret_exprs {
                    write!(f, " {:?}", r)?;
                }
                Ok(())
            }
            StmtKind::Dirty { name } => write!(f, "dirty {}", name),
        }
    }
}

/// A basic block of the structured IR
#[derive(Clone, PartialEq, Eq)]
pub struct Block {
    pub addr: u64,
    /// Distinguishes blocks that share an address
    pub idx: Option<usize>,
    pub statements: Vec<Stmt>,
}

impl Block {
    pub fn new(addr: u64, idx: Option<usize>, statements: Vec<Stmt>) -> Self {
        Self {
            addr,
            idx,
            statements,
        }
    }

    /// Location of the `stmt_idx`th statement of this block
    pub fn codeloc(&self, stmt_idx: usize) -> CodeLocation {
        CodeLocation::new(self.addr, self.idx, stmt_idx)
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.idx {
            Some(idx) => writeln!(f, "## Block {:#x}.{}", self.addr, idx)?,
            None => writeln!(f, "## Block {:#x}", self.addr)?,
        }
        for s in &self.statements {
            writeln!(f, "{:?}", s)?;
        }
        Ok(())
    }
}
