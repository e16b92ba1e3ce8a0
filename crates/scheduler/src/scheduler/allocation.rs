use std::thread::ThreadId;

/// Reports how many bytes a thread has allocated over its lifetime.
///
/// Rust has no portable per-thread allocation counter, so this is supplied
/// by the embedder (for instance backed by a counting global allocator).
/// Without a sampler the [`Metric::ThreadAllocation`] metric is never
/// observed.
///
/// [`Metric::ThreadAllocation`]: super::metrics::Metric::ThreadAllocation
pub trait AllocationSampler: Send + Sync {
    /// Total bytes allocated by `thread`, or `None` if unknown.
    fn allocated_bytes(&self, thread: ThreadId) -> Option<u64>;
}

/// Allocation information about a specific thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadAllocation {
    pub thread: ThreadId,
    pub allocated_bytes: u64,
    /// Clock reading (nanoseconds) when this was sampled.
    pub time: i64,
}
