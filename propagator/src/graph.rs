//! Control-flow graphs of a function, and the schedulers that decide which node the fixpoint
//! driver processes next.

use std::collections::BTreeSet;

pub type NodeIdx = usize;

/// A function's control-flow graph over nodes of type `N` (blocks of some IR)
#[derive(Clone, Debug)]
pub struct FunctionGraph<N> {
    pub addr: u64,
    pub name: String,
    nodes: Vec<N>,
    successors: Vec<Vec<NodeIdx>>,
    predecessors: Vec<Vec<NodeIdx>>,
    entry: Option<NodeIdx>,
}

impl<N> FunctionGraph<N> {
    pub fn new(addr: u64, name: impl Into<String>) -> Self {
        Self {
            addr,
            name: name.into(),
            nodes: vec![],
            successors: vec![],
            predecessors: vec![],
            entry: None,
        }
    }

    /// Add a node. The first node added is the entry, unless overridden with
    /// [`Self::set_entry`].
    pub fn add_node(&mut self, n: N) -> NodeIdx {
        let idx = self.nodes.len();
        self.nodes.push(n);
        self.successors.push(vec![]);
        self.predecessors.push(vec![]);
        if self.entry.is_none() {
            self.entry = Some(idx);
        }
        idx
    }

    /// Add an edge. Duplicate edges are ignored.
    pub fn add_edge(&mut self, from: NodeIdx, to: NodeIdx) {
        assert!(from < self.nodes.len() && to < self.nodes.len());
        if !self.successors[from].contains(&to) {
            self.successors[from].push(to);
            self.predecessors[to].push(from);
        }
    }

    pub fn set_entry(&mut self, entry: NodeIdx) {
        assert!(entry < self.nodes.len());
        self.entry = Some(entry);
    }

    pub fn entry(&self) -> Option<NodeIdx> {
        self.entry
    }

    pub fn node(&self, n: NodeIdx) -> &N {
        &self.nodes[n]
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeIdx, &N)> {
        self.nodes.iter().enumerate()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn successors(&self, n: NodeIdx) -> &[NodeIdx] {
        &self.successors[n]
    }

    pub fn predecessors(&self, n: NodeIdx) -> &[NodeIdx] {
        &self.predecessors[n]
    }

    pub fn edges(&self) -> impl Iterator<Item = (NodeIdx, NodeIdx)> + '_ {
        self.successors
            .iter()
            .enumerate()
            .flat_map(|(from, succs)| succs.iter().map(move |&to| (from, to)))
    }

    /// All nodes, in reverse post-order from the entry. Nodes unreachable from the entry follow,
    /// in insertion order.
    pub fn reverse_post_order(&self) -> Vec<NodeIdx> {
        let mut visited = vec![false; self.nodes.len()];
        let mut post_order = Vec::with_capacity(self.nodes.len());

        if let Some(entry) = self.entry {
            // Iterative DFS; each stack entry remembers how many successors were explored
            let mut stack: Vec<(NodeIdx, usize)> = vec![(entry, 0)];
            visited[entry] = true;
            while let Some((n, i)) = stack.pop() {
                if let Some(&s) = self.successors[n].get(i) {
                    stack.push((n, i + 1));
                    if !visited[s] {
                        visited[s] = true;
                        stack.push((s, 0));
                    }
                } else {
                    post_order.push(n);
                }
            }
        }

        post_order.reverse();
        post_order.extend((0..self.nodes.len()).filter(|&n| !visited[n]));
        post_order
    }
}

/// Decides the order in which nodes are processed, and which get processed again
pub trait GraphVisitor {
    /// The next node to process, or `None` once there is no pending work
    fn next_node(&mut self) -> Option<NodeIdx>;
    /// Ask for `node` to be processed (again)
    fn notify_revisit(&mut self, node: NodeIdx);
}

/// Visits every node of a function, always picking the pending node earliest in reverse
/// post-order. A node is pending at most once.
pub struct FunctionGraphVisitor {
    rank: Vec<usize>,
    pending: BTreeSet<(usize, NodeIdx)>,
}

impl FunctionGraphVisitor {
    pub fn new<N>(graph: &FunctionGraph<N>) -> Self {
        let order = graph.reverse_post_order();
        let mut rank = vec![0; graph.len()];
        for (r, &n) in order.iter().enumerate() {
            rank[n] = r;
        }
        let pending = order.iter().enumerate().map(|(r, &n)| (r, n)).collect();
        Self { rank, pending }
    }
}

impl GraphVisitor for FunctionGraphVisitor {
    fn next_node(&mut self) -> Option<NodeIdx> {
        let first = *self.pending.iter().next()?;
        self.pending.remove(&first);
        Some(first.1)
    }

    fn notify_revisit(&mut self, node: NodeIdx) {
        self.pending.insert((self.rank[node], node));
    }
}

/// Visits exactly one node, once
pub struct SingleNodeGraphVisitor {
    node: Option<NodeIdx>,
}

impl SingleNodeGraphVisitor {
    pub fn new(node: NodeIdx) -> Self {
        Self { node: Some(node) }
    }
}

impl GraphVisitor for SingleNodeGraphVisitor {
    fn next_node(&mut self) -> Option<NodeIdx> {
        self.node.take()
    }

    fn notify_revisit(&mut self, _node: NodeIdx) {}
}
