/// Upper bound on captured return addresses per allocation. Deeper stacks
/// are silently truncated.
pub const MAX_STACK_DEPTH: usize = 32;

/// Source annotation carried by allocations made through the tagged path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallSite {
    /// Caller-chosen usage tag.
    pub category: u32,
    pub file: &'static str,
    pub line: u32,
}

/// One outstanding or historical allocation.
///
/// Every field is `Copy`, so building and moving a record never allocates.
/// `frames` holds raw return addresses, most-recent-first; only the first
/// `depth` entries are meaningful. Symbolization is deferred to report time.
#[derive(Clone, Copy, Debug)]
pub struct AllocationRecord {
    /// Address of the returned block. Unique among currently live
    /// allocations only; freed addresses are reused.
    pub address: usize,
    /// Requested byte count.
    pub size: usize,
    pub frames: [usize; MAX_STACK_DEPTH],
    pub depth: u32,
    pub site: Option<CallSite>,
}

impl AllocationRecord {
    /// The captured portion of the call stack.
    pub fn stack(&self) -> &[usize] {
        &self.frames[..self.depth as usize]
    }
}
