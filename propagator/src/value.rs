//! The flat value lattice tracked in registers and stack slots.
//!
//! Values are either [`Value::Top`] (nothing known at that width) or one of a small set of
//! concrete representations. There is no ordering among the concrete values; `Top` sits above all
//! of them.

use crate::arch::BYTE_WIDTH;
use crate::code_location::CodeLocation;
use std::sync::atomic::{AtomicU64, Ordering};

static TOP_COUNT: AtomicU64 = AtomicU64::new(0);

/// The identity of a `Top`. Two `Top`s are equal only if their identities are.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TopId {
    /// A freshly allocated unknown
    Fresh(u64),
    /// The unknown value written at `offset` (of the register file, or of the stack frame) by the
    /// statement at `codeloc`
    Definition { codeloc: CodeLocation, offset: i64 },
}

impl std::fmt::Debug for TopId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            TopId::Fresh(n) => write!(f, "#{}", n),
            TopId::Definition { codeloc, offset } => write!(f, "{:?}@{}", codeloc, offset),
        }
    }
}

/// An abstract value of a fixed bit-width
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Value {
    /// Not known, or not trackable
    Top { bits: usize, id: TopId },
    /// A known constant, always kept masked to `bits`
    Concrete { value: u64, bits: usize },
    /// The stack pointer at function entry, plus `offset`
    SpOffset { offset: i64, bits: usize },
}

/// All-ones mask for the lowest `bits` bits
pub fn mask(bits: usize) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

/// Interpret the lowest `bits` bits of `value` as a two's complement number
pub fn sign_extend(value: u64, bits: usize) -> i64 {
    if bits == 0 || bits >= 64 {
        return value as i64;
    }
    let shift = 64 - bits;
    ((value << shift) as i64) >> shift
}

/// Whether `value` (at width `bits`) is a mask that only clears a handful of low bits, as used to
/// align the stack pointer (e.g. `and rsp, 0xfffffffffffffff0`).
pub fn is_alignment_mask(value: u64, bits: usize) -> bool {
    let full = mask(bits);
    (1..=12usize)
        .filter(|&k| k < bits)
        .any(|k| value == full & !((1u64 << k) - 1))
}

impl Value {
    /// A fresh `Top` of width `bits`, distinct from every other `Top` allocated so far
    pub fn top(bits: usize) -> Self {
        Value::Top {
            bits,
            id: TopId::Fresh(TOP_COUNT.fetch_add(1, Ordering::Relaxed)),
        }
    }

    /// The `Top` standing for whatever the statement at `codeloc` wrote at `offset`. Unlike
    /// [`Self::top`], asking twice gives equal values.
    pub fn top_defined_at(bits: usize, codeloc: CodeLocation, offset: i64) -> Self {
        Value::Top {
            bits,
            id: TopId::Definition { codeloc, offset },
        }
    }

    pub fn concrete(value: u64, bits: usize) -> Self {
        Value::Concrete {
            value: value & mask(bits),
            bits,
        }
    }

    pub fn sp_offset(offset: i64, bits: usize) -> Self {
        Value::SpOffset { offset, bits }
    }

    pub fn is_top(&self) -> bool {
        matches!(self, Value::Top { .. })
    }

    pub fn bits(&self) -> usize {
        match self {
            Value::Top { bits, .. } | Value::Concrete { bits, .. } | Value::SpOffset { bits, .. } => {
                *bits
            }
        }
    }

    pub fn as_concrete(&self) -> Option<u64> {
        match self {
            Value::Concrete { value, .. } => Some(*value),
            _ => None,
        }
    }

    /// The offset to the stack pointer at function entry, if this is a stack-relative value.
    /// Anything else (including `Top`) is not tracked, and returns `None`.
    pub fn extract_offset_to_sp(&self) -> Option<i64> {
        match self {
            Value::SpOffset { offset, .. } => Some(*offset),
            _ => None,
        }
    }

    pub fn add(&self, other: &Self) -> Self {
        let bits = self.bits();
        match (self, other) {
            (Value::Concrete { value: a, .. }, Value::Concrete { value: b, .. }) => {
                Value::concrete(a.wrapping_add(*b), bits)
            }
            (Value::SpOffset { offset, bits }, Value::Concrete { value, bits: cbits })
            | (Value::Concrete { value, bits: cbits }, Value::SpOffset { offset, bits }) => {
                Value::sp_offset(offset.wrapping_add(sign_extend(*value, *cbits)), *bits)
            }
            _ => Value::top(bits),
        }
    }

    pub fn sub(&self, other: &Self) -> Self {
        let bits = self.bits();
        match (self, other) {
            (Value::Concrete { value: a, .. }, Value::Concrete { value: b, .. }) => {
                Value::concrete(a.wrapping_sub(*b), bits)
            }
            (Value::SpOffset { offset, bits }, Value::Concrete { value, bits: cbits }) => {
                Value::sp_offset(offset.wrapping_sub(sign_extend(*value, *cbits)), *bits)
            }
            (Value::SpOffset { offset: a, .. }, Value::SpOffset { offset: b, .. }) => {
                // Both relative to the same base, so the base cancels out
                Value::concrete(a.wrapping_sub(*b) as u64, bits)
            }
            _ => Value::top(bits),
        }
    }

    pub fn and(&self, other: &Self) -> Self {
        match (self, other) {
            (sp @ Value::SpOffset { .. }, Value::Concrete { value, bits })
            | (Value::Concrete { value, bits }, sp @ Value::SpOffset { .. })
                if is_alignment_mask(*value, *bits) =>
            {
                sp.clone()
            }
            _ => self.concrete_binop(other, |a, b| a & b),
        }
    }

    pub fn or(&self, other: &Self) -> Self {
        self.concrete_binop(other, |a, b| a | b)
    }

    pub fn xor(&self, other: &Self) -> Self {
        self.concrete_binop(other, |a, b| a ^ b)
    }

    pub fn mul(&self, other: &Self) -> Self {
        self.concrete_binop(other, |a, b| a.wrapping_mul(b))
    }

    pub fn shl(&self, other: &Self) -> Self {
        self.concrete_binop(other, |a, b| if b >= 64 { 0 } else { a << b })
    }

    pub fn shr(&self, other: &Self) -> Self {
        self.concrete_binop(other, |a, b| if b >= 64 { 0 } else { a >> b })
    }

    pub fn sar(&self, other: &Self) -> Self {
        let bits = self.bits();
        self.concrete_binop(other, |a, b| {
            (sign_extend(a, bits) >> b.min(63)) as u64
        })
    }

    /// A 1-bit comparison result, if both sides are concrete
    pub fn compare(&self, other: &Self, f: impl FnOnce(u64, u64) -> bool) -> Self {
        match (self, other) {
            (Value::Concrete { value: a, .. }, Value::Concrete { value: b, .. }) => {
                Value::concrete(f(*a, *b) as u64, 1)
            }
            (Value::SpOffset { offset: a, .. }, Value::SpOffset { offset: b, .. }) => {
                Value::concrete(f(*a as u64, *b as u64) as u64, 1)
            }
            _ => Value::top(1),
        }
    }

    /// Zero- or sign-extend to `to_bits`
    pub fn extend(&self, to_bits: usize, signed: bool) -> Self {
        match self {
            Value::Concrete { value, bits } if signed => {
                Value::concrete(sign_extend(*value, *bits) as u64, to_bits)
            }
            Value::Concrete { value, .. } => Value::concrete(*value, to_bits),
            Value::SpOffset { offset, .. } => Value::sp_offset(*offset, to_bits),
            Value::Top { .. } => Value::top(to_bits),
        }
    }

    /// Keep only the lowest `to_bits` bits
    pub fn truncate(&self, to_bits: usize) -> Self {
        match self {
            Value::Concrete { value, .. } => Value::concrete(*value, to_bits),
            _ => Value::top(to_bits),
        }
    }

    /// Reverse the byte order of a concrete value
    pub fn byteswap(&self) -> Self {
        match self {
            Value::Concrete { value, bits } if bits % BYTE_WIDTH == 0 && *bits <= 64 => {
                let swapped = value.swap_bytes() >> (64 - bits);
                Value::concrete(swapped, *bits)
            }
            Value::Concrete { bits, .. } => Value::top(*bits),
            _ => self.clone(),
        }
    }

    fn concrete_binop(&self, other: &Self, f: impl FnOnce(u64, u64) -> u64) -> Self {
        let bits = self.bits();
        match (self, other) {
            (Value::Concrete { value: a, .. }, Value::Concrete { value: b, .. }) => {
                Value::concrete(f(*a, *b), bits)
            }
            _ => Value::top(bits),
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Value::Top { bits, id } => write!(f, "TOP{}{:?}", bits, id),
            Value::Concrete { value, bits } => write!(f, "{:#x}<{}>", value, bits),
            Value::SpOffset { offset, bits } => write!(f, "SpOffset({:+})<{}>", offset, bits),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tops_only_equal_themselves() {
        let a = Value::top(64);
        let b = Value::top(64);
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
        assert!(a.is_top());
    }

    #[test]
    fn concrete_arithmetic_wraps_at_width() {
        let a = Value::concrete(0xff, 8);
        let b = Value::concrete(0x02, 8);
        assert_eq!(a.add(&b), Value::concrete(1, 8));
        assert_eq!(b.sub(&a), Value::concrete(3, 8));
    }

    #[test]
    fn sp_offsets_adjust_by_constants() {
        let sp = Value::sp_offset(0, 64);
        let minus_16 = sp.sub(&Value::concrete(16, 64));
        assert_eq!(minus_16.extract_offset_to_sp(), Some(-16));
        // Adding a negative constant is the same as subtracting
        let also = sp.add(&Value::concrete((-16i64) as u64, 64));
        assert_eq!(also, minus_16);
        assert_eq!(minus_16.sub(&sp), Value::concrete((-16i64) as u64, 64));
        assert_eq!(Value::concrete(3, 64).extract_offset_to_sp(), None);
    }

    #[test]
    fn stack_alignment_is_a_no_op_on_sp_offsets() {
        let sp = Value::sp_offset(-8, 64);
        let aligned = sp.and(&Value::concrete(0xffff_ffff_ffff_fff0, 64));
        assert_eq!(aligned, sp);
        // Not an alignment mask
        assert!(sp.and(&Value::concrete(0xff, 64)).is_top());
    }

    #[test]
    fn alignment_masks() {
        assert!(is_alignment_mask(0xffff_ffff_ffff_fff0, 64));
        assert!(is_alignment_mask(0xffff_fff0, 32));
        assert!(!is_alignment_mask(0xffff_fff0, 64));
        assert!(!is_alignment_mask(0xffff_ffff_ffff_ffff, 64));
        assert!(!is_alignment_mask(0x10, 64));
    }

    #[test]
    fn extension_and_byteswap() {
        let v = Value::concrete(0x80, 8);
        assert_eq!(v.extend(32, true), Value::concrete(0xffff_ff80, 32));
        assert_eq!(v.extend(32, false), Value::concrete(0x80, 32));
        assert_eq!(
            Value::concrete(0x1122_3344, 32).byteswap(),
            Value::concrete(0x4433_2211, 32)
        );
    }
}
