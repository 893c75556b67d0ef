/// A program point: a statement inside a (possibly duplicated) block.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodeLocation {
    /// Address of the block the statement lives in
    pub block_addr: u64,
    /// Disambiguates multiple structured-IR blocks sharing one address
    pub block_idx: Option<usize>,
    /// Index of the statement in the block
    pub stmt_idx: usize,
}

impl CodeLocation {
    pub fn new(block_addr: u64, block_idx: Option<usize>, stmt_idx: usize) -> Self {
        Self {
            block_addr,
            block_idx,
            stmt_idx,
        }
    }
}

impl std::fmt::Debug for CodeLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.block_idx {
            Some(idx) => write!(f, "<{:#x}.{}[{}]>", self.block_addr, idx, self.stmt_idx),
            None => write!(f, "<{:#x}[{}]>", self.block_addr, self.stmt_idx),
        }
    }
}
