//! Flags that impact a propagation run. A configuration is handed to each analysis run.

/// Configuration of a single propagation run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PropagatorConfig {
    /// Record only constants as replacements, dropping expression-shaped ones.
    pub only_consts: bool,
    /// Maximum number of times any single node is processed. Nodes that hit this cap are not
    /// revisited, even if the analysis has not converged.
    pub max_iterations: usize,
    /// Substitute block-local temporaries with their values. Ignored (treated as `false`) when
    /// analyzing whole functions, since a temporary only lives within one block.
    pub propagate_temporaries: bool,
    /// Seed entry states with the stack pointer holding its own initial value. Without this, stack
    /// accesses are only resolved through an explicit stack pointer tracker.
    pub seed_stack_pointer: bool,
    /// Log the outgoing state of every processed node (at debug level).
    pub debug_print_node_states: bool,
}

impl Default for PropagatorConfig {
    fn default() -> Self {
        PropagatorConfig {
            only_consts: false,
            max_iterations: 3,
            propagate_temporaries: true,
            seed_stack_pointer: true,
            debug_print_node_states: false,
        }
    }
}

#[derive(clap::ArgEnum, Clone, Debug)]
/// Propagation configuration parameters
pub enum CommandLineConfig {
    OnlyConsts,
    DisableTemporaryPropagation,
    DisableStackPointerSeeding,
    EnableDebugPrintNodeStates,
}

impl From<Vec<CommandLineConfig>> for PropagatorConfig {
    fn from(v: Vec<CommandLineConfig>) -> Self {
        use CommandLineConfig::*;
        let mut r = PropagatorConfig::default();
        for v in v {
            match v {
                OnlyConsts => {
                    r.only_consts = true;
                }
                DisableTemporaryPropagation => {
                    r.propagate_temporaries = false;
                }
                DisableStackPointerSeeding => {
                    r.seed_stack_pointer = false;
                }
                EnableDebugPrintNodeStates => {
                    r.debug_print_node_states = true;
                }
            }
        }
        r
    }
}
