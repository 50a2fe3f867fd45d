use crate::{
    address_space::{memory_range::MemoryRange, memory_region::MemoryRegion},
    sig::{Sig, SIGXFSZ},
};
use std::time::Duration;

/// Which threads `suspend_all()` has to freeze.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ThreadScope {
    /// Only threads registered with the `ThreadRegistry`.
    Registered,
    /// Every thread listed in /proc/self/task.
    WholeProcess,
}

/// Which memory regions a savestate covers.
///
/// The checkpointer runs inside the process it rewinds, so its own stack,
/// buffers and bookkeeping must stay out of scope. Saves and loads whose
/// scope reaches any of that fail with `CheckpointError::Unsupported`, which
/// rules out capturing the whole address space.
#[derive(Clone, Debug)]
pub enum RegionScope {
    /// Only these ranges; regions are clipped to them. They should cover
    /// memory the program owns, not allocator free space.
    Ranges(Vec<MemoryRange>),
    /// Everything except regions intersecting these ranges.
    Exclude(Vec<MemoryRange>),
}

impl RegionScope {
    /// Apply the scope to a freshly read region list, preserving order.
    pub fn filter(&self, regions: Vec<MemoryRegion>) -> Vec<MemoryRegion> {
        match self {
            RegionScope::Ranges(ranges) => {
                let mut result = Vec::new();
                for r in regions {
                    for range in ranges {
                        if r.intersects(range) {
                            let clipped = r.intersect(range);
                            result.push(r.subrange(clipped.start(), clipped.end()));
                        }
                    }
                }
                result.sort_by_key(|r| r.start());
                result
            }
            RegionScope::Exclude(ranges) => regions
                .into_iter()
                .filter(|r| !ranges.iter().any(|range| r.intersects(range)))
                .collect(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CheckpointConfig {
    /// Signal used to park threads. Must not be blocked by any of them.
    pub suspend_signal: Sig,
    pub thread_scope: ThreadScope,
    pub region_scope: RegionScope,
    /// A thread slower than this is excused and logged, but still waited for.
    pub fast_ack_timeout: Duration,
    /// Give up suspending after this long.
    pub stall_timeout: Duration,
    /// Granularity of the sliced waits.
    pub wait_slice: Duration,
    /// Compressed pages per brotli stream before the context is reset.
    pub block_pages: u32,
    pub brotli_quality: u32,
    pub max_chain_depth: u32,
    /// Write incremental savestates when soft-dirty tracking is available.
    pub incremental: bool,
    /// Decompress every chunk once before touching memory.
    pub verify_before_load: bool,
    /// Largest pipe backlog buffered in a savestate.
    pub pipe_drain_limit: usize,
    /// Pick up descriptors the subject opened without going through the registry.
    pub scan_descriptors: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        CheckpointConfig {
            suspend_signal: SIGXFSZ,
            thread_scope: ThreadScope::Registered,
            // Nothing until the program says what to rewind.
            region_scope: RegionScope::Ranges(Vec::new()),
            fast_ack_timeout: Duration::from_millis(100),
            stall_timeout: Duration::from_secs(5),
            wait_slice: Duration::from_millis(1),
            block_pages: 256,
            brotli_quality: 2,
            max_chain_depth: 8,
            incremental: true,
            verify_before_load: true,
            pipe_drain_limit: 1 << 20,
            scan_descriptors: true,
        }
    }
}

impl CheckpointConfig {
    /// Only save and restore `ranges`.
    pub fn with_ranges(ranges: Vec<MemoryRange>) -> Self {
        CheckpointConfig {
            region_scope: RegionScope::Ranges(ranges),
            scan_descriptors: false,
            ..Default::default()
        }
    }
}
