//! Knowledge supplied from outside the analysis: where the stack pointer is, and what memory
//! holds.

use crate::arch::Endness;
use crate::containers::unordered::UnorderedMap;

/// Answers where the stack and frame pointers point right before an instruction
pub trait StackPointerTracker {
    /// Offset of register `reg_offset` from the stack pointer at function entry, right before
    /// the instruction at `ins_addr` executes. `None` if unknown.
    fn offset_before(&self, ins_addr: u64, reg_offset: u64) -> Option<i64>;
}

/// Read access to memory contents known before the analysis runs (e.g. the loaded binary)
pub trait MemoryOracle {
    /// The `size`-byte value at `addr`, if known
    fn load(&self, addr: u64, size: usize, endness: Endness) -> Option<u64>;
}

/// A [`StackPointerTracker`] backed by a precomputed table
#[derive(Clone, Debug, Default)]
pub struct StaticStackPointerTracker {
    offsets: UnorderedMap<(u64, u64), i64>,
}

impl StaticStackPointerTracker {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn set(&mut self, ins_addr: u64, reg_offset: u64, offset: i64) {
        self.offsets.insert((ins_addr, reg_offset), offset);
    }
}

impl StackPointerTracker for StaticStackPointerTracker {
    fn offset_before(&self, ins_addr: u64, reg_offset: u64) -> Option<i64> {
        self.offsets.get(&(ins_addr, reg_offset)).cloned()
    }
}

/// A [`MemoryOracle`] over a set of non-overlapping byte segments
#[derive(Clone, Debug, Default)]
pub struct MemoryImage {
    segments: Vec<(u64, Vec<u8>)>,
}

impl MemoryImage {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn add_segment(&mut self, addr: u64, bytes: Vec<u8>) {
        self.segments.push((addr, bytes));
    }
}

impl MemoryOracle for MemoryImage {
    fn load(&self, addr: u64, size: usize, endness: Endness) -> Option<u64> {
        if size == 0 || size > 8 {
            return None;
        }
        let bytes = self.segments.iter().find_map(|(start, data)| {
            let from = addr.checked_sub(*start)? as usize;
            data.get(from..from.checked_add(size)?)
        })?;
        let fold = |acc: u64, b: &u8| (acc << 8) | *b as u64;
        Some(match endness {
            Endness::Big => bytes.iter().fold(0, fold),
            Endness::Little => bytes.iter().rev().fold(0, fold),
        })
    }
}
