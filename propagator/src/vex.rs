//! The low-level IR: flat, single-assignment temporaries over a register file and memory.

use crate::arch::{Endness, BYTE_WIDTH};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum VexBinop {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Sar,
    CmpEQ,
    CmpNE,
    CmpLTU,
    CmpLTS,
    CmpLEU,
    CmpLES,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum VexUnop {
    Not,
    /// Zero- or sign-extend to `to_bits`
    Widen { to_bits: usize, signed: bool },
    /// Keep the lowest `to_bits` bits
    Narrow { to_bits: usize },
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum VexExpr {
    Const {
        value: u64,
        bits: usize,
    },
    Get {
        offset: u64,
        bits: usize,
    },
    RdTmp {
        tmp: usize,
        bits: usize,
    },
    Load {
        addr: Box<VexExpr>,
        bits: usize,
        endness: Endness,
    },
    Binop {
        op: VexBinop,
        args: Box<(VexExpr, VexExpr)>,
    },
    Unop {
        op: VexUnop,
        arg: Box<VexExpr>,
    },
    /// A call to a helper function
    CCall {
        callee: String,
        args: Vec<VexExpr>,
        bits: usize,
    },
    Ite {
        cond: Box<VexExpr>,
        iftrue: Box<VexExpr>,
        iffalse: Box<VexExpr>,
    },
}

impl VexExpr {
    pub fn bits(&self) -> usize {
        match self {
            VexExpr::Const { bits, .. }
            | VexExpr::Get { bits, .. }
            | VexExpr::RdTmp { bits, .. }
            | VexExpr::Load { bits, .. }
            | VexExpr::CCall { bits, .. } => *bits,
            VexExpr::Binop { op, args } => match op {
                VexBinop::CmpEQ
                | VexBinop::CmpNE
                | VexBinop::CmpLTU
                | VexBinop::CmpLTS
                | VexBinop::CmpLEU
                | VexBinop::CmpLES => 1,
                _ => args.0.bits(),
            },
            VexExpr::Unop { op, arg } => match op {
                VexUnop::Not => arg.bits(),
                VexUnop::Widen { to_bits, .. } | VexUnop::Narrow { to_bits } => *to_bits,
            },
            VexExpr::Ite { iftrue, .. } => iftrue.bits(),
        }
    }

    pub fn size(&self) -> usize {
        (self.bits() + BYTE_WIDTH - 1) / BYTE_WIDTH
    }

    pub fn binop(op: VexBinop, lhs: VexExpr, rhs: VexExpr) -> Self {
        VexExpr::Binop {
            op,
            args: Box::new((lhs, rhs)),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum VexStmt {
    /// Marks the start of the machine instruction at `addr`
    IMark {
        addr: u64,
        len: usize,
    },
    Put {
        offset: u64,
        data: VexExpr,
    },
    WrTmp {
        tmp: usize,
        data: VexExpr,
    },
    Store {
        addr: VexExpr,
        data: VexExpr,
        endness: Endness,
    },
    /// Conditional side exit to `dst`
    Exit {
        guard: VexExpr,
        dst: u64,
    },
    Dirty {
        callee: String,
    },
    NoOp,
}

/// A lifted super-block of the low-level IR
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Irsb {
    pub addr: u64,
    /// Number of machine-code bytes the block was lifted from. Zero if lifting failed.
    pub size: usize,
    pub statements: Vec<VexStmt>,
    pub next: Option<VexExpr>,
}
