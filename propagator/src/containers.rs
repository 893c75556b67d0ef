//! Container types shared across the analysis

use unordered::UnorderedMap;

/// A set of values of type `T` that remembers the order in which its members were first inserted.
/// Iteration (and [`Self::into_vec`]) follows that order.
#[derive(Clone, PartialEq, Eq)]
pub struct InsertionOrderedSet<T: Eq + std::hash::Hash + Ord + Clone> {
    data: Vec<T>,
    revmap: UnorderedMap<T, usize>,
}

impl<T: Eq + std::hash::Hash + Ord + Clone> InsertionOrderedSet<T> {
    /// A new, empty set
    pub fn new() -> Self {
        Self {
            data: Default::default(),
            revmap: Default::default(),
        }
    }

    /// Insert `v`, returning `true` if it was not already a member. Re-inserting an existing member
    /// keeps its original position.
    pub fn insert(&mut self, v: T) -> bool {
        if self.revmap.contains_key(&v) {
            false
        } else {
            self.revmap.insert(v.clone(), self.data.len());
            self.data.push(v);
            true
        }
    }

    /// Whether `v` is a member of the set
    pub fn contains(&self, v: &T) -> bool {
        self.revmap.contains_key(v)
    }

    /// Number of members
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the set has no members
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Iterate over the members, in the order of insertion
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.data.iter()
    }

    /// Convert into a vec, maintaining the order of insertion
    pub fn into_vec(self) -> Vec<T> {
        self.data
    }
}

impl<T: Eq + std::hash::Hash + Ord + Clone> Default for InsertionOrderedSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Eq + std::hash::Hash + Ord + Clone> Extend<T> for InsertionOrderedSet<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        for v in iter {
            self.insert(v);
        }
    }
}

impl<T: Eq + std::hash::Hash + Ord + Clone + std::fmt::Debug> std::fmt::Debug
    for InsertionOrderedSet<T>
{
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_set().entries(self.data.iter()).finish()
    }
}

/// Maps and sets that express the _intention_ of being unordered, while letting the crate's
/// features decide whether they are actually backed by a hashing (non-deterministic iteration
/// order) or a B-tree (deterministic iteration order) implementation.
///
/// Code using these types must only rely on the API common to both backings, and keys must
/// satisfy both `Hash` and `Ord`.
pub mod unordered {
    #[cfg(not(feature = "deterministic_containers"))]
    pub type UnorderedMap<K, V> = std::collections::HashMap<K, V>;
    #[cfg(feature = "deterministic_containers")]
    pub type UnorderedMap<K, V> = std::collections::BTreeMap<K, V>;

    #[cfg(not(feature = "deterministic_containers"))]
    pub type UnorderedSet<T> = std::collections::HashSet<T>;
    #[cfg(feature = "deterministic_containers")]
    pub type UnorderedSet<T> = std::collections::BTreeSet<T>;
}
