//! Bookkeeping of proposed replacements and recorded equivalences, shared by every node of an
//! analysis run.

use crate::ail::{Atom, Expr, Stmt};
use crate::code_location::CodeLocation;
use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::containers::InsertionOrderedSet;
use crate::log::*;
use crate::value::Value;

/// What is being replaced at a location
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Replaced {
    Atom(Atom),
    /// The whole statement at the location
    Statement,
}

impl std::fmt::Debug for Replaced {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Replaced::Atom(a) => write!(f, "{:?}", a),
            Replaced::Statement => write!(f, "<stmt>"),
        }
    }
}

/// What it is replaced with
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Replacement {
    /// Not a replacement: proposing `Top` withdraws whatever was proposed before
    Top,
    Expr(Expr),
    Stmt(Stmt),
    Value(Value),
}

impl Replacement {
    pub fn is_top(&self) -> bool {
        match self {
            Replacement::Top => true,
            Replacement::Value(v) => v.is_top(),
            Replacement::Expr(_) | Replacement::Stmt(_) => false,
        }
    }

    fn is_constant(&self) -> bool {
        match self {
            Replacement::Expr(e) => e.is_const(),
            Replacement::Value(v) => v.as_concrete().is_some(),
            Replacement::Top | Replacement::Stmt(_) => false,
        }
    }
}

impl std::fmt::Debug for Replacement {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Replacement::Top => write!(f, "TOP"),
            Replacement::Expr(e) => write!(f, "{:?}", e),
            Replacement::Stmt(s) => write!(f, "{:?}", s),
            Replacement::Value(v) => write!(f, "{:?}", v),
        }
    }
}

/// `atom` and `expr` denote the same value at `codeloc`
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Equivalence {
    pub codeloc: CodeLocation,
    pub atom: Atom,
    pub expr: Expr,
}

impl std::fmt::Debug for Equivalence {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "<Eq@{:?}: {:?}=={:?}>", self.codeloc, self.atom, self.expr)
    }
}

pub type Replacements = UnorderedMap<CodeLocation, UnorderedMap<Replaced, Replacement>>;

type Site = (CodeLocation, Replaced);

#[derive(Clone, Default)]
pub struct Ledger {
    only_consts: bool,
    replacements: Replacements,
    /// For each (untagged) non-constant expression, every site that has proposed it during the
    /// run. Sites are never removed, even once they propose something else.
    prop_sites: UnorderedMap<Expr, UnorderedSet<Site>>,
    /// Expressions seen proposed at more than one site; never recorded again
    frozen: UnorderedSet<Expr>,
    equivalence: InsertionOrderedSet<Equivalence>,
}

impl Ledger {
    /// An empty ledger. With `only_consts`, only constants are ever recorded as replacements.
    pub fn new(only_consts: bool) -> Self {
        Self {
            only_consts,
            ..Default::default()
        }
    }

    /// Propose replacing `old` with `new` at `codeloc`.
    ///
    /// Calls are never recorded. A `Top` proposal removes the entry at that site. A non-constant
    /// expression replacing anything but a temporary is recorded only until a second site proposes
    /// it, counting sites that have since moved on to something else; from then on it is removed
    /// from every site replacing `old` and never recorded again.
    pub fn add_replacement(&mut self, codeloc: CodeLocation, old: Replaced, new: Replacement) {
        if matches!(&new, Replacement::Expr(e) if e.is_call()) {
            trace!("Not replacing anything with a call"; "codeloc" => ?codeloc, "old" => ?old);
            return;
        }

        if new.is_top() {
            if let Some(at) = self.replacements.get_mut(&codeloc) {
                at.remove(&old);
            }
            return;
        }

        let counted = match (&old, &new) {
            (Replaced::Atom(a), _) if a.is_tmp() => None,
            (_, Replacement::Expr(e)) if !e.is_const() => Some(e.untagged()),
            _ => None,
        };
        let prop_count = match counted {
            None => 0,
            Some(key) if self.frozen.contains(&key) => usize::MAX,
            Some(key) => {
                let sites = self.prop_sites.entry(key.clone()).or_default();
                sites.insert((codeloc, old.clone()));
                let count = sites.len();
                if count > 1 {
                    debug!("Expression propagated to multiple sites, retracting";
                           "expr" => ?key, "count" => count);
                    self.prop_sites.remove(&key);
                    self.frozen.insert(key);
                }
                count
            }
        };

        if prop_count <= 1 {
            if self.only_consts && !new.is_constant() {
                if let Some(at) = self.replacements.get_mut(&codeloc) {
                    at.remove(&old);
                }
                return;
            }
            self.replacements
                .entry(codeloc)
                .or_default()
                .insert(old, new);
        } else {
            for at in self.replacements.values_mut() {
                at.remove(&old);
            }
        }
    }

    /// Drop every recorded replacement whose expression has since been seen at a second site
    pub fn filter_replacements(&mut self) {
        let frozen = &self.frozen;
        for at in self.replacements.values_mut() {
            at.retain(|_, new| match new {
                Replacement::Expr(e) if !e.is_const() => !frozen.contains(&e.untagged()),
                _ => true,
            });
        }
        self.replacements.retain(|_, at| !at.is_empty());
    }

    /// Record that `atom` and `expr` are the same at `codeloc`
    pub fn add_equivalence(&mut self, codeloc: CodeLocation, atom: Atom, expr: Expr) {
        self.equivalence.insert(Equivalence {
            codeloc,
            atom,
            expr,
        });
    }

    pub fn replacements(&self) -> &Replacements {
        &self.replacements
    }

    pub fn equivalence(&self) -> &InsertionOrderedSet<Equivalence> {
        &self.equivalence
    }

    /// Number of distinct sites that have proposed (the untagged form of) `expr`
    pub fn prop_count(&self, expr: &Expr) -> usize {
        let key = expr.untagged();
        if self.frozen.contains(&key) {
            return usize::MAX;
        }
        self.prop_sites.get(&key).map_or(0, |s| s.len())
    }

    pub fn into_parts(self) -> (Replacements, InsertionOrderedSet<Equivalence>) {
        (self.replacements, self.equivalence)
    }
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("replacements", &self.replacements)
            .field("frozen", &self.frozen)
            .field("equivalence", &self.equivalence)
            .finish()
    }
}
