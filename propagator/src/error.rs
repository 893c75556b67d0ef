//! Errors that abort a propagation run.
//!
//! Only internal-consistency violations end up here; shapes the engines do not understand are
//! logged and skipped instead.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PropagatorError {
    /// A concrete register value was read with a width different from the one it was written with.
    #[error(
        "incorrectly sized register read at offset {offset:#x}: expected {expected_bits} bits, \
         found a {found_bits}-bit value"
    )]
    RegisterWidthMismatch {
        offset: u64,
        expected_bits: usize,
        found_bits: usize,
    },
    /// A store was handed a value that cannot occupy the slot it was asked to fill.
    #[error("cannot store a {bits}-bit value into {size} byte(s) at offset {offset:#x} of `{store}`")]
    MalformedStoreValue {
        store: &'static str,
        offset: i64,
        size: usize,
        bits: usize,
    },
}
