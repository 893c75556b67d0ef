//! Abstract state used when propagating over the low-level IR

use crate::arch::{Arch, BYTE_WIDTH};
use crate::error::PropagatorError;
use crate::labeled_store::LabeledStore;
use crate::value::Value;

/// Registers and stack-frame contents, as raw values
#[derive(Clone, PartialEq, Eq)]
pub struct MachineState {
    pub arch: Arch,
    registers: LabeledStore<()>,
    stack: LabeledStore<()>,
}

impl MachineState {
    /// A state that knows nothing
    pub fn new(arch: Arch) -> Self {
        Self {
            arch,
            registers: LabeledStore::new("reg"),
            stack: LabeledStore::new("stack"),
        }
    }

    /// The state at function entry: the stack pointer holds its own initial value.
    pub fn initial(arch: Arch) -> Result<Self, PropagatorError> {
        let mut state = Self::new(arch);
        let sp = Value::sp_offset(0, state.arch.bits);
        state.store_register(state.arch.sp_offset, state.arch.bytes(), sp)?;
        Ok(state)
    }

    /// Size of a general-purpose register, in bytes
    pub fn gpr_size(&self) -> usize {
        self.arch.bytes()
    }

    pub fn store_register(
        &mut self,
        offset: u64,
        size: usize,
        value: Value,
    ) -> Result<(), PropagatorError> {
        self.registers
            .store(offset as i64, value, size, self.arch.memory_endness, None)
    }

    /// Read a register. Reads narrower or wider than a general-purpose register are not tracked
    /// and give `Top`.
    pub fn load_register(&self, offset: u64, size: usize) -> Result<Value, PropagatorError> {
        if size != self.gpr_size() {
            return Ok(Value::top(size * BYTE_WIDTH));
        }
        match self
            .registers
            .load_with_labels(offset as i64, size, self.arch.memory_endness)
        {
            None => Ok(Value::top(size * BYTE_WIDTH)),
            Some(loaded) if loaded.value.is_top() && loaded.exact => Ok(loaded.value),
            Some(loaded) if loaded.value.is_top() => Ok(Value::top(size * BYTE_WIDTH)),
            Some(loaded) if loaded.value.bits() != size * BYTE_WIDTH => {
                Err(PropagatorError::RegisterWidthMismatch {
                    offset,
                    expected_bits: size * BYTE_WIDTH,
                    found_bits: loaded.value.bits(),
                })
            }
            Some(loaded) => Ok(loaded.value),
        }
    }

    pub fn store_local_variable(
        &mut self,
        offset: i64,
        size: usize,
        value: Value,
        endness: crate::arch::Endness,
    ) -> Result<(), PropagatorError> {
        self.stack.store(offset, value, size, endness, None)
    }

    pub fn load_local_variable(
        &self,
        offset: i64,
        size: usize,
        endness: crate::arch::Endness,
    ) -> Value {
        self.stack.load(offset, size, endness)
    }

    /// Merge `self` with all of `others` at once
    pub fn merge(&self, others: &[&Self]) -> Self {
        let regs: Vec<&LabeledStore<()>> = others.iter().map(|s| &s.registers).collect();
        let stack: Vec<&LabeledStore<()>> = others.iter().map(|s| &s.stack).collect();
        Self {
            arch: self.arch.clone(),
            registers: self.registers.merge(&regs),
            stack: self.stack.merge(&stack),
        }
    }
}

impl std::fmt::Debug for MachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "MachineState({})", self.arch.name)?;
        writeln!(f, "  {:?}", self.registers)?;
        write!(f, "  {:?}", self.stack)
    }
}
