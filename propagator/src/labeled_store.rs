//! An offset-addressed store of [`Value`]s, each optionally carrying a label.
//!
//! Used both as a register file (offsets into the register file) and as a stack frame (offsets
//! relative to the stack pointer at function entry).

use crate::arch::{Endness, BYTE_WIDTH};
use crate::containers::unordered::UnorderedMap;
use crate::error::PropagatorError;
use crate::log::*;
use crate::value::Value;

/// A single write into the store
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Record<L> {
    pub value: Value,
    /// Size of the write, in bytes
    pub size: usize,
    pub endness: Endness,
    pub label: Option<L>,
}

/// Whether every byte of `[offset, offset + size)` has an `i64` offset
fn addressable(offset: i64, size: usize) -> bool {
    offset as i128 + size as i128 <= i64::MAX as i128 + 1
}

impl<L> Record<L> {
    fn overlaps(&self, at: i64, offset: i64, size: usize) -> bool {
        (at as i128) < offset as i128 + size as i128
            && (offset as i128) < at as i128 + self.size as i128
    }

    fn covers(&self, at: i64, offset: i64, size: usize) -> bool {
        at <= offset && offset as i128 + size as i128 <= at as i128 + self.size as i128
    }
}

/// The result of a read that hit at least one record
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Loaded<L> {
    pub value: Value,
    /// Label of the covering record. Reads that do not hit exactly one covering record have no
    /// label.
    pub label: Option<L>,
    /// Whether the covering record spans exactly the bytes read
    pub exact: bool,
}

#[derive(Clone, PartialEq, Eq)]
pub struct LabeledStore<L> {
    name: &'static str,
    records: UnorderedMap<i64, Record<L>>,
}

impl<L: Clone + PartialEq> LabeledStore<L> {
    /// A new, empty store. `name` only shows up in diagnostics.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            records: Default::default(),
        }
    }

    /// Strong update of `[offset, offset + size)`. Every record overlapping the range is dropped,
    /// including the parts of it that fall outside the range. A range running past the end of the
    /// address space is not stored.
    pub fn store(
        &mut self,
        offset: i64,
        value: Value,
        size: usize,
        endness: Endness,
        label: Option<L>,
    ) -> Result<(), PropagatorError> {
        if size == 0 || value.bits() != size * BYTE_WIDTH {
            return Err(PropagatorError::MalformedStoreValue {
                store: self.name,
                offset,
                size,
                bits: value.bits(),
            });
        }
        if !addressable(offset, size) {
            debug!("Store past the end of the address space, skipping";
                   "store" => self.name, "offset" => offset, "size" => size);
            return Ok(());
        }
        let overlapping: Vec<i64> = self
            .records
            .iter()
            .filter(|&(&at, r)| r.overlaps(at, offset, size))
            .map(|(&at, _)| at)
            .collect();
        for at in overlapping {
            if at != offset {
                trace!("Invalidating partially overwritten record";
                       "store" => self.name, "at" => at, "offset" => offset);
            }
            self.records.remove(&at);
        }
        self.records.insert(
            offset,
            Record {
                value,
                size,
                endness,
                label,
            },
        );
        Ok(())
    }

    /// Read `[offset, offset + size)`. Returns `None` if nothing was ever written there, or if the
    /// range runs past the end of the address space.
    ///
    /// If a single record covers the whole range, its value and label are returned (byte-swapped
    /// if it was written with the other endianness and spans the range exactly). Any other
    /// overlap gives a fresh `Top`.
    pub fn load_with_labels(&self, offset: i64, size: usize, endness: Endness) -> Option<Loaded<L>> {
        if !addressable(offset, size) {
            return None;
        }
        let mut hits = self
            .records
            .iter()
            .filter(|&(&at, r)| r.overlaps(at, offset, size));
        let (&at, record) = hits.next()?;
        if hits.next().is_some() || !record.covers(at, offset, size) {
            trace!("Read of partially known bytes";
                   "store" => self.name, "offset" => offset, "size" => size);
            return Some(Loaded {
                value: Value::top(size * BYTE_WIDTH),
                label: None,
                exact: false,
            });
        }
        let exact = at == offset && record.size == size;
        let value = if exact && record.endness != endness {
            record.value.byteswap()
        } else {
            record.value.clone()
        };
        Some(Loaded {
            value,
            label: record.label.clone(),
            exact,
        })
    }

    /// Like [`Self::load_with_labels`], but only the value; unknown bytes read as `Top`.
    pub fn load(&self, offset: i64, size: usize, endness: Endness) -> Value {
        match self.load_with_labels(offset, size, endness) {
            Some(loaded) => loaded.value,
            None => Value::top(size * BYTE_WIDTH),
        }
    }

    /// The record starting exactly at `offset`, if any
    pub fn get(&self, offset: i64) -> Option<&Record<L>> {
        self.records.get(&offset)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&i64, &Record<L>)> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Merge `self` with all of `others` at once.
    ///
    /// Only offsets written in every store survive. Where all of them hold the same record it is
    /// kept as is; otherwise the slot becomes a fresh `Top` with no label.
    pub fn merge(&self, others: &[&Self]) -> Self {
        let mut records: UnorderedMap<i64, Record<L>> = Default::default();
        for (&at, record) in self.records.iter() {
            let theirs: Option<Vec<&Record<L>>> =
                others.iter().map(|o| o.records.get(&at)).collect();
            let theirs = match theirs {
                Some(theirs) => theirs,
                None => continue,
            };
            if theirs.iter().all(|r| *r == record) {
                records.insert(at, record.clone());
            } else {
                trace!("Disagreement at merge"; "store" => self.name, "at" => at);
                records.insert(
                    at,
                    Record {
                        value: Value::top(record.size * BYTE_WIDTH),
                        size: record.size,
                        endness: record.endness,
                        label: None,
                    },
                );
            }
        }
        Self {
            name: self.name,
            records,
        }
    }
}

impl<L: std::fmt::Debug> std::fmt::Debug for LabeledStore<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} ", self.name)?;
        f.debug_map()
            .entries(
                self.records
                    .iter()
                    .map(|(at, r)| (at, (&r.value, r.size, &r.label))),
            )
            .finish()
    }
}
