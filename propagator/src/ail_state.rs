//! Abstract state used when propagating over the structured IR.
//!
//! Registers hold either a plain [`Value`] or, when they were assigned an expression that cannot
//! be computed, a `Top` whose label remembers that expression (and where it was assigned). This
//! is what lets whole expressions, not only constants, be propagated.

use crate::ail::{Atom, Expr};
use crate::arch::{Arch, Endness, BYTE_WIDTH};
use crate::code_location::CodeLocation;
use crate::containers::unordered::UnorderedMap;
use crate::error::PropagatorError;
use crate::labeled_store::{LabeledStore, Loaded};
use crate::log::*;
use crate::value::Value;

/// What evaluating a structured-IR expression produces
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum AilValue {
    /// Unknown, of the given width in bits
    Top(usize),
    Expr(Expr),
}

impl AilValue {
    pub fn is_top(&self) -> bool {
        matches!(self, AilValue::Top(_))
    }

    pub fn bits(&self) -> usize {
        match self {
            AilValue::Top(bits) => *bits,
            AilValue::Expr(e) => e.bits(),
        }
    }

    pub fn as_expr(&self) -> Option<&Expr> {
        match self {
            AilValue::Top(_) => None,
            AilValue::Expr(e) => Some(e),
        }
    }
}

/// Provenance of a register's contents
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct RegisterLabel {
    /// The expression assigned to the register, if it could not be computed to a value
    pub expr: Option<Expr>,
    /// Where the register was assigned. `None` for the contents at function entry.
    pub def_at: Option<CodeLocation>,
}

/// The expression form of a tracked value, if it has one
pub fn value_to_expr(value: &Value) -> Option<Expr> {
    match value {
        Value::Top { .. } => None,
        Value::Concrete { value, bits } => Some(Expr::constant(*value, *bits)),
        Value::SpOffset { offset, bits } => Some(Expr::stack_base_offset(*offset, *bits)),
    }
}

/// The value of an expression, if it is simple enough to be tracked as one
pub fn expr_to_value(expr: &Expr) -> Option<Value> {
    match expr {
        Expr::Const { value, bits } => Some(Value::concrete(*value, *bits)),
        Expr::StackBaseOffset { offset, bits } => Some(Value::sp_offset(*offset, *bits)),
        _ => None,
    }
}

#[derive(PartialEq, Eq)]
pub struct AilState {
    pub arch: Arch,
    registers: LabeledStore<RegisterLabel>,
    stack: LabeledStore<()>,
    /// Block-local temporaries. Never survive a copy of the state.
    tmps: UnorderedMap<usize, AilValue>,
}

impl Clone for AilState {
    fn clone(&self) -> Self {
        Self {
            arch: self.arch.clone(),
            registers: self.registers.clone(),
            stack: self.stack.clone(),
            tmps: Default::default(),
        }
    }
}

impl AilState {
    /// A state that knows nothing
    pub fn new(arch: Arch) -> Self {
        Self {
            arch,
            registers: LabeledStore::new("reg"),
            stack: LabeledStore::new("stack"),
            tmps: Default::default(),
        }
    }

    /// The state at function entry: the stack pointer holds the stack base, with no definition
    /// site.
    pub fn initial(arch: Arch) -> Result<Self, PropagatorError> {
        let mut state = Self::new(arch);
        let sp = Value::sp_offset(0, state.arch.bits);
        state.registers.store(
            state.arch.sp_offset as i64,
            sp,
            state.arch.bytes(),
            state.arch.memory_endness,
            Some(RegisterLabel {
                expr: None,
                def_at: None,
            }),
        )?;
        Ok(state)
    }

    /// Bind `variable` to `value`, as assigned at `def_at`.
    ///
    /// Nothing happens if either is missing, or if `value` mentions `variable` itself.
    pub fn store_variable(
        &mut self,
        variable: Option<&Expr>,
        value: Option<&AilValue>,
        def_at: CodeLocation,
    ) -> Result<(), PropagatorError> {
        let (variable, value) = match (variable, value) {
            (Some(variable), Some(value)) => (variable, value),
            _ => return Ok(()),
        };
        if let (Some(atom), AilValue::Expr(e)) = (Atom::from_expr(variable), value) {
            if e.has_atom(&atom) {
                trace!("Not binding a self-referential value";
                       "variable" => ?variable, "value" => ?e, "codeloc" => ?def_at);
                return Ok(());
            }
        }

        match variable {
            Expr::Tmp { idx, .. } => {
                self.tmps.insert(*idx, value.clone());
            }
            Expr::Register { offset, .. } => {
                let size = variable.size();
                // Expressions are kept only in the label; the value itself is unknown
                let stored = Value::top_defined_at(size * BYTE_WIDTH, def_at, *offset as i64);
                let label = RegisterLabel {
                    expr: value.as_expr().cloned(),
                    def_at: Some(def_at),
                };
                self.registers.store(
                    *offset as i64,
                    stored,
                    size,
                    self.arch.memory_endness,
                    Some(label),
                )?;
            }
            _ => {
                warn!("Unsupported type of variable to store to";
                      "variable" => ?variable, "codeloc" => ?def_at);
            }
        }
        Ok(())
    }

    /// Current binding of `variable`, if there is one
    pub fn get_variable(&self, variable: &Expr) -> Option<AilValue> {
        match variable {
            Expr::Tmp { idx, .. } => self.tmps.get(idx).cloned(),
            Expr::Register { offset, bits, .. } => {
                let loaded = self.registers.load_with_labels(
                    *offset as i64,
                    variable.size(),
                    self.arch.memory_endness,
                )?;
                let Loaded {
                    value: stored,
                    label,
                    exact,
                } = loaded;
                let (expr, def_at) = match (exact, label) {
                    (true, Some(label)) => (label.expr, label.def_at),
                    _ => (None, None),
                };

                if stored.is_top() {
                    return Some(match expr {
                        Some(Expr::Register {
                            offset, bits: rbits, ..
                        }) => AilValue::Expr(Expr::Register {
                            offset,
                            bits: rbits,
                            def_at,
                        }),
                        Some(e) => AilValue::Expr(e),
                        None => AilValue::Top(*bits),
                    });
                }

                if stored.bits() != *bits {
                    debug!("Incorrectly sized register read, treating as unknown";
                           "offset" => offset, "bits" => bits, "stored" => ?stored);
                    return Some(AilValue::Top(*bits));
                }
                Some(match value_to_expr(&stored) {
                    Some(e) => AilValue::Expr(e),
                    None => AilValue::Top(*bits),
                })
            }
            _ => None,
        }
    }

    /// Write `size` bytes at stack offset `offset`. A `None` value invalidates the slot.
    pub fn store_stack_variable(
        &mut self,
        offset: i64,
        size: usize,
        value: Option<Value>,
        endness: Endness,
        codeloc: CodeLocation,
    ) -> Result<(), PropagatorError> {
        let value = value.unwrap_or_else(|| Value::top_defined_at(size * BYTE_WIDTH, codeloc, offset));
        self.stack.store(offset, value, size, endness, None)
    }

    /// The known contents of `size` bytes at stack offset `offset`, as an expression
    pub fn get_stack_variable(&self, offset: i64, size: usize, endness: Endness) -> Option<Expr> {
        let loaded = self.stack.load_with_labels(offset, size, endness)?;
        if loaded.value.bits() != size * BYTE_WIDTH {
            return None;
        }
        value_to_expr(&loaded.value)
    }

    /// Whether `expr` mentions a register that has been redefined since `expr` was computed
    pub fn is_using_outdated_def(&self, expr: &Expr) -> bool {
        let mut walker = OutdatedDefinitionWalker::new(self);
        walker.walk_expression(expr);
        walker.out_dated
    }

    /// Merge `self` with all of `others` at once. The result has no temporaries.
    pub fn merge(&self, others: &[&Self]) -> Self {
        let regs: Vec<&LabeledStore<RegisterLabel>> =
            others.iter().map(|s| &s.registers).collect();
        let stack: Vec<&LabeledStore<()>> = others.iter().map(|s| &s.stack).collect();
        Self {
            arch: self.arch.clone(),
            registers: self.registers.merge(&regs),
            stack: self.stack.merge(&stack),
            tmps: Default::default(),
        }
    }

    pub fn registers(&self) -> &LabeledStore<RegisterLabel> {
        &self.registers
    }

    pub fn stack(&self) -> &LabeledStore<()> {
        &self.stack
    }
}

impl std::fmt::Debug for AilState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "AilState({})", self.arch.name)?;
        writeln!(f, "  {:?}", self.registers)?;
        writeln!(f, "  {:?}", self.stack)?;
        write!(f, "  tmps {:?}", self.tmps)
    }
}

/// Looks for register references whose recorded definition is no longer the live one
struct OutdatedDefinitionWalker<'a> {
    state: &'a AilState,
    out_dated: bool,
}

impl<'a> OutdatedDefinitionWalker<'a> {
    fn new(state: &'a AilState) -> Self {
        Self {
            state,
            out_dated: false,
        }
    }

    fn walk_expression(&mut self, expr: &Expr) {
        expr.walk(&mut |e| {
            if let Expr::Register { offset, def_at, .. } = e {
                self.handle_register(*offset, e.size(), *def_at);
            }
        });
    }

    fn handle_register(&mut self, offset: u64, size: usize, def_at: Option<CodeLocation>) {
        let loaded = match self.state.registers.load_with_labels(
            offset as i64,
            size,
            self.state.arch.memory_endness,
        ) {
            Some(loaded) => loaded,
            None => return,
        };
        let live_def = match (loaded.exact, loaded.label) {
            (true, Some(label)) => label.def_at,
            _ => {
                self.out_dated = true;
                return;
            }
        };
        if live_def != def_at {
            trace!("Outdated register reference";
                   "offset" => offset, "live" => ?live_def, "referenced" => ?def_at);
            self.out_dated = true;
        }
    }
}
