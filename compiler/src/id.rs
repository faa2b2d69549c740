// id.rs — Stable identifiers for blocks, allocation groups and kernels
//
// Blocks are numbered by their index in a function body. Groups and kernels
// are allocated in deterministic (instruction / discovery) order so that
// emitted names and kernel ids do not depend on hash iteration order.

use std::fmt;

/// Index of a block inside one function body. Block 0 is the entry block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl BlockId {
    pub const ENTRY: BlockId = BlockId(0);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A coalescing class produced by the variable allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub u32);

/// Identity of a generated kernel within one compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KernelId(pub u32);

impl fmt::Display for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Allocator for stable IDs and fresh temporaries. Produces monotonically
/// increasing values in allocation order.
#[derive(Debug, Clone, Default)]
pub struct IdAllocator {
    next_group: u32,
    next_kernel: u32,
    next_temp: u32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc_group(&mut self) -> GroupId {
        let id = GroupId(self.next_group);
        self.next_group += 1;
        id
    }

    pub fn alloc_kernel(&mut self) -> KernelId {
        let id = KernelId(self.next_kernel);
        self.next_kernel += 1;
        id
    }

    /// Fresh emitted-name candidate, e.g. `swap_0`.
    pub fn alloc_temp(&mut self, prefix: &str) -> String {
        let name = format!("{prefix}_{}", self.next_temp);
        self.next_temp += 1;
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic() {
        let mut ids = IdAllocator::new();
        assert_eq!(ids.alloc_group(), GroupId(0));
        assert_eq!(ids.alloc_group(), GroupId(1));
        assert_eq!(ids.alloc_kernel(), KernelId(0));
        assert_eq!(ids.alloc_temp("swap"), "swap_0");
        assert_eq!(ids.alloc_temp("swap"), "swap_1");
    }

    #[test]
    fn block_display() {
        assert_eq!(BlockId(3).to_string(), "#3");
        assert_eq!(BlockId::ENTRY.index(), 0);
    }
}
