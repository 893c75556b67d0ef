//! The small slice of architecture knowledge the propagator needs.

/// Byte order of a memory access
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum Endness {
    Big,
    Little,
}

impl Endness {
    pub fn swapped(self) -> Self {
        match self {
            Endness::Big => Endness::Little,
            Endness::Little => Endness::Big,
        }
    }
}

/// Description of the analyzed architecture. Register offsets are offsets into the register file
/// (as used by [`Expr::Register`](crate::ail::Expr::Register) and
/// [`VexExpr::Get`](crate::vex::VexExpr::Get)).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Arch {
    pub name: &'static str,
    /// Width of a general-purpose register, in bits
    pub bits: usize,
    /// Register-file offset of the stack pointer
    pub sp_offset: u64,
    /// Register-file offset of the frame (base) pointer
    pub bp_offset: u64,
    pub memory_endness: Endness,
}

/// Bits per byte. Fixed; no supported architecture uses anything else.
pub const BYTE_WIDTH: usize = 8;

impl Arch {
    pub fn amd64() -> Self {
        Self {
            name: "AMD64",
            bits: 64,
            sp_offset: 48,
            bp_offset: 56,
            memory_endness: Endness::Little,
        }
    }

    pub fn x86() -> Self {
        Self {
            name: "X86",
            bits: 32,
            sp_offset: 24,
            bp_offset: 28,
            memory_endness: Endness::Little,
        }
    }

    /// Size of a general-purpose register, in bytes
    pub fn bytes(&self) -> usize {
        self.bits / BYTE_WIDTH
    }

    /// Look up an architecture by (case-insensitive) name
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "amd64" | "x86_64" | "x64" => Some(Self::amd64()),
            "x86" | "i386" => Some(Self::x86()),
            _ => None,
        }
    }
}
