//! The fixpoint driver: runs a transfer engine over the nodes of a graph until every node's
//! outgoing state stabilizes, or hits the iteration cap.

use crate::ail::Block;
use crate::ail_state::AilState;
use crate::arch::Arch;
use crate::code_location::CodeLocation;
use crate::config::PropagatorConfig;
use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::containers::InsertionOrderedSet;
use crate::engine_ail::AilEngine;
use crate::engine_vex::VexEngine;
use crate::error::PropagatorError;
use crate::graph::{FunctionGraph, FunctionGraphVisitor, GraphVisitor, NodeIdx, SingleNodeGraphVisitor};
use crate::ledger::{Equivalence, Ledger, Replaced, Replacement, Replacements};
use crate::log::*;
use crate::machine_state::MachineState;
use crate::oracle::{MemoryOracle, StackPointerTracker};
use crate::vex::Irsb;

/// Everything an analysis run reads but never changes
pub struct AnalysisContext<'a> {
    pub arch: Arch,
    pub config: PropagatorConfig,
    pub stack_pointer_tracker: Option<&'a dyn StackPointerTracker>,
    /// Memory known before the analysis starts. Only consulted for the low-level IR.
    pub base_state: Option<&'a dyn MemoryOracle>,
    /// Whether a load of `size` bytes from a concrete address may consult `base_state`
    pub load_callback: Option<&'a dyn Fn(u64, usize) -> bool>,
    /// Functions whose graphs are known to be complete; only their results are published to the
    /// knowledge base
    pub completed_funcs: UnorderedSet<u64>,
}

impl<'a> AnalysisContext<'a> {
    pub fn new(arch: Arch, config: PropagatorConfig) -> Self {
        Self {
            arch,
            config,
            stack_pointer_tracker: None,
            base_state: None,
            load_callback: None,
            completed_funcs: Default::default(),
        }
    }
}

/// Identifies a node across runs: block address and block index
pub type NodeKey = (u64, Option<usize>);

/// A graph node the driver knows how to propagate over
pub trait PropagationNode {
    type State: Clone + PartialEq + std::fmt::Debug;

    fn key(&self) -> NodeKey;

    /// The state flowing into the entry node
    fn initial_state(ctx: &AnalysisContext<'_>) -> Result<Self::State, PropagatorError>;

    /// Merge all incoming states at once
    fn merge_states(first: &Self::State, rest: &[&Self::State]) -> Self::State;

    /// Run the transfer engine over this node. `Ok(false)` if the node could not be materialized,
    /// in which case `state` must be ignored.
    fn process(
        &self,
        ctx: &AnalysisContext<'_>,
        ledger: &mut Ledger,
        state: &mut Self::State,
        propagate_tmps: bool,
    ) -> Result<bool, PropagatorError>;
}

impl PropagationNode for Block {
    type State = AilState;

    fn key(&self) -> NodeKey {
        (self.addr, self.idx)
    }

    fn initial_state(ctx: &AnalysisContext<'_>) -> Result<AilState, PropagatorError> {
        if ctx.config.seed_stack_pointer {
            AilState::initial(ctx.arch.clone())
        } else {
            Ok(AilState::new(ctx.arch.clone()))
        }
    }

    fn merge_states(first: &AilState, rest: &[&AilState]) -> AilState {
        first.merge(rest)
    }

    fn process(
        &self,
        ctx: &AnalysisContext<'_>,
        ledger: &mut Ledger,
        state: &mut AilState,
        propagate_tmps: bool,
    ) -> Result<bool, PropagatorError> {
        AilEngine::new(ctx, ledger, propagate_tmps).process(state, self)?;
        Ok(true)
    }
}

impl PropagationNode for Irsb {
    type State = MachineState;

    fn key(&self) -> NodeKey {
        (self.addr, None)
    }

    fn initial_state(ctx: &AnalysisContext<'_>) -> Result<MachineState, PropagatorError> {
        if ctx.config.seed_stack_pointer {
            MachineState::initial(ctx.arch.clone())
        } else {
            Ok(MachineState::new(ctx.arch.clone()))
        }
    }

    fn merge_states(first: &MachineState, rest: &[&MachineState]) -> MachineState {
        first.merge(rest)
    }

    fn process(
        &self,
        ctx: &AnalysisContext<'_>,
        ledger: &mut Ledger,
        state: &mut MachineState,
        _propagate_tmps: bool,
    ) -> Result<bool, PropagatorError> {
        if self.size == 0 {
            return Ok(false);
        }
        VexEngine::new(ctx, ledger).process(state, self)?;
        Ok(true)
    }
}

/// Results of earlier function-wide runs, by function address
#[derive(Clone, Debug, Default)]
pub struct KnowledgeBase {
    replacements: UnorderedMap<u64, Replacements>,
}

impl KnowledgeBase {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn get(&self, func_addr: u64) -> Option<&Replacements> {
        self.replacements.get(&func_addr)
    }

    pub fn update(&mut self, func_addr: u64, replacements: Replacements) {
        self.replacements.insert(func_addr, replacements);
    }
}

/// What a propagation run found
#[derive(Clone, Debug, Default)]
pub struct Propagation {
    pub replacements: Replacements,
    pub equivalence: InsertionOrderedSet<Equivalence>,
    /// How many times each node was processed
    pub node_iterations: UnorderedMap<NodeKey, usize>,
}

/// Propagate over a whole function.
///
/// Temporaries are never propagated, whatever the configuration says. If `kb` already holds a
/// non-empty result for this function, it is returned without analyzing anything; otherwise the
/// result is published to `kb` if the function is in `completed_funcs`.
pub fn analyze_function<N: PropagationNode>(
    ctx: &AnalysisContext<'_>,
    graph: &FunctionGraph<N>,
    kb: Option<&mut KnowledgeBase>,
) -> Result<Propagation, PropagatorError> {
    if let Some(cached) = kb
        .as_deref()
        .and_then(|kb| kb.get(graph.addr))
        .filter(|r| !r.is_empty())
    {
        info!("Reusing replacements from the knowledge base"; "func" => &graph.name, "addr" => graph.addr);
        return Ok(Propagation {
            replacements: cached.clone(),
            ..Default::default()
        });
    }

    let mut visitor = FunctionGraphVisitor::new(graph);
    let r = run(ctx, graph, &mut visitor, false)?;

    if ctx.completed_funcs.contains(&graph.addr) {
        if let Some(kb) = kb {
            kb.update(graph.addr, r.replacements.clone());
        }
    }
    Ok(r)
}

/// Propagate over the single node `node` of `graph`, starting from the initial state
pub fn analyze_block<N: PropagationNode>(
    ctx: &AnalysisContext<'_>,
    graph: &FunctionGraph<N>,
    node: NodeIdx,
) -> Result<Propagation, PropagatorError> {
    let mut visitor = SingleNodeGraphVisitor::new(node);
    run(ctx, graph, &mut visitor, ctx.config.propagate_temporaries)
}

/// The state flowing into `n`: the merge of every processed predecessor's latest outgoing state,
/// along with the initial state at the entry (or when no predecessor has been processed yet)
fn input_state<N: PropagationNode>(
    graph: &FunctionGraph<N>,
    n: NodeIdx,
    initial: &N::State,
    out_states: &UnorderedMap<NodeIdx, N::State>,
) -> N::State {
    let preds: Vec<&N::State> = graph
        .predecessors(n)
        .iter()
        .filter_map(|p| out_states.get(p))
        .collect();
    let (first, rest) = if graph.entry() == Some(n) || preds.is_empty() {
        (initial, &preds[..])
    } else {
        (preds[0], &preds[1..])
    };
    if rest.is_empty() {
        first.clone()
    } else {
        N::merge_states(first, rest)
    }
}

fn run<N: PropagationNode>(
    ctx: &AnalysisContext<'_>,
    graph: &FunctionGraph<N>,
    visitor: &mut dyn GraphVisitor,
    propagate_tmps: bool,
) -> Result<Propagation, PropagatorError> {
    let max_iterations = ctx.config.max_iterations;
    let mut ledger = Ledger::new(ctx.config.only_consts);
    let initial = N::initial_state(ctx)?;
    let mut out_states: UnorderedMap<NodeIdx, N::State> = Default::default();
    let mut iterations: UnorderedMap<NodeIdx, usize> = Default::default();

    while let Some(n) = visitor.next_node() {
        let node = graph.node(n);
        let count = iterations.entry(n).or_insert(0);
        if *count >= max_iterations {
            trace!("Node reached the iteration cap"; "node" => ?node.key());
            continue;
        }
        *count += 1;
        let count = *count;

        let mut state = input_state(graph, n, &initial, &out_states);
        if !node.process(ctx, &mut ledger, &mut state, propagate_tmps)? {
            let (addr, idx) = node.key();
            debug!("Block could not be materialized, keeping its prior state";
                   "block_addr" => format_args!("{:#x}", addr),
                   OptionalKV("block_idx", idx));
            continue;
        }
        ledger.filter_replacements();

        if ctx.config.debug_print_node_states {
            let (addr, idx) = node.key();
            debug!("Processed node";
                   "block_addr" => format_args!("{:#x}", addr),
                   OptionalKV("block_idx", idx),
                   "iteration" => count,
                   "state" => ?state,
            );
        }

        let changed = out_states.get(&n) != Some(&state);
        out_states.insert(n, state);
        if changed && count < max_iterations {
            for &s in graph.successors(n) {
                visitor.notify_revisit(s);
            }
        }
    }

    let node_iterations = iterations
        .into_iter()
        .map(|(n, c)| (graph.node(n).key(), c))
        .collect();
    let (replacements, equivalence) = ledger.into_parts();
    Ok(Propagation {
        replacements,
        equivalence,
        node_iterations,
    })
}

impl Propagation {
    pub fn replacement_at(&self, codeloc: &CodeLocation, old: &Replaced) -> Option<&Replacement> {
        self.replacements.get(codeloc)?.get(old)
    }

    /// Every replacement recorded in block `key`, ordered by location
    pub fn replacements_in(&self, key: NodeKey) -> Vec<(CodeLocation, &Replaced, &Replacement)> {
        let mut r: Vec<_> = self
            .replacements
            .iter()
            .filter(|(loc, _)| (loc.block_addr, loc.block_idx) == key)
            .flat_map(|(loc, at)| at.iter().map(move |(old, new)| (*loc, old, new)))
            .collect();
        r.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        r
    }

    /// Render `graph` as a `.dot` file, each node listing the replacements found in it
    pub fn write_dot<N: PropagationNode>(
        &self,
        graph: &FunctionGraph<N>,
        w: &mut impl std::io::Write,
    ) -> std::io::Result<()> {
        type Edge = (NodeIdx, NodeIdx);

        struct Graph<'a, N> {
            graph: &'a FunctionGraph<N>,
            result: &'a Propagation,
        }

        impl<'a, N: PropagationNode> dot::Labeller<'a, NodeIdx, Edge> for Graph<'a, N> {
            fn graph_id(&'a self) -> dot::Id<'a> {
                dot::Id::new("Propagation").unwrap()
            }
            fn node_id(&'a self, n: &NodeIdx) -> dot::Id<'a> {
                dot::Id::new(format!("n{}", n)).unwrap()
            }
            fn node_label<'b>(&'b self, n: &NodeIdx) -> dot::LabelText<'b> {
                let key = self.graph.node(*n).key();
                let mut label = match key.1 {
                    Some(idx) => format!("{:#x}.{}\\l", key.0, idx),
                    None => format!("{:#x}\\l", key.0),
                };
                for (loc, old, new) in self.result.replacements_in(key) {
                    label += &format!("[{}] {:?} => {:?}\\l", loc.stmt_idx, old, new)
                        .replace('"', "\\\"");
                }
                dot::LabelText::escaped(label)
            }
            fn node_shape(&'a self, _n: &NodeIdx) -> Option<dot::LabelText<'a>> {
                Some(dot::LabelText::label("box"))
            }
        }

        impl<'a, N> dot::GraphWalk<'a, NodeIdx, Edge> for Graph<'a, N> {
            fn nodes(&self) -> dot::Nodes<'a, NodeIdx> {
                (0..self.graph.len()).collect::<Vec<_>>().into()
            }
            fn edges(&'a self) -> dot::Edges<'a, Edge> {
                self.graph.edges().collect::<Vec<_>>().into()
            }
            fn source(&self, e: &Edge) -> NodeIdx {
                e.0
            }
            fn target(&self, e: &Edge) -> NodeIdx {
                e.1
            }
        }

        dot::render(
            &Graph {
                graph,
                result: self,
            },
            w,
        )
    }

    /// Generate a `.dot` file representing `graph` annotated with these results
    pub fn generate_dot<N: PropagationNode>(&self, graph: &FunctionGraph<N>) -> String {
        let mut s: Vec<u8> = vec![];
        self.write_dot(graph, &mut s).unwrap();
        String::from_utf8(s).unwrap()
    }
}

impl std::fmt::Display for Propagation {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut locs: Vec<_> = self.replacements.iter().collect();
        locs.sort_by_key(|(loc, _)| **loc);
        writeln!(f, "Replacements:")?;
        for (loc, at) in locs {
            let mut at: Vec<_> = at.iter().collect();
            at.sort();
            for (old, new) in at {
                writeln!(f, "  {:?} {:?} => {:?}", loc, old, new)?;
            }
        }
        writeln!(f, "Equivalence:")?;
        for eq in self.equivalence.iter() {
            writeln!(f, "  {:?}", eq)?;
        }
        Ok(())
    }
}
