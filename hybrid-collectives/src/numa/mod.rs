//! NUMA Placement and Platform Capabilities
//!
//! Collective transports are latency-bound: a ring buffer should live on the
//! NUMA node of the core that polls it, and a cluster's shared region on the
//! node of its coordinator. This module discovers the machine layout and
//! exposes the narrow capability set the rest of the crate needs.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐
//! │   NUMA Node 0   │     │   NUMA Node 1   │
//! │  cores 0-7      │     │  cores 8-15     │
//! │  ┌───────────┐  │     │  ┌───────────┐  │
//! │  │ rx rings  │◄─┼─────┼──┤ producers │  │
//! │  │ cluster 0 │  │     │  │ cluster 1 │  │
//! │  └───────────┘  │     │  └───────────┘  │
//! └─────────────────┘     └─────────────────┘
//! ```
//!
//! # Platform Support
//!
//! - Linux: sysfs topology discovery, `mmap` + `mbind` placement,
//!   `sched_setaffinity` pinning
//! - Elsewhere: a single simulated node, heap allocation, no pinning

mod allocator;
mod platform;
mod topology;

pub use allocator::{AllocationPolicy, NumaAllocator};
pub use platform::{HeapPlatform, NumaBox, NumaPlatform, NumaSlice, Platform};
pub use topology::{CpuSet, NodeId, NumaTopology};

use core::sync::atomic::{AtomicU64, Ordering};

/// Maximum supported NUMA nodes
pub const MAX_NUMA_NODES: usize = 64;

/// Error types for platform operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NumaError {
    /// The node is not part of the discovered topology
    #[error("invalid NUMA node: {0}")]
    InvalidNode(u32),

    /// Memory allocation failed
    #[error("NUMA allocation of {0} bytes failed")]
    AllocationFailed(usize),

    /// Thread affinity operation failed
    #[error("pinning to core {core} failed (errno {errno})")]
    AffinityError {
        /// Target core
        core: usize,
        /// OS error code
        errno: i32,
    },

    /// Operation not supported on this platform
    #[error("operation not supported on this platform")]
    NotSupported,
}

/// Result type for NUMA operations
pub type Result<T> = core::result::Result<T, NumaError>;

/// A NUMA node with its associated CPUs.
#[derive(Debug)]
pub struct NumaNode {
    id: u32,
    cpus: CpuSet,
}

impl NumaNode {
    pub(crate) fn new(id: u32, cpus: CpuSet) -> Self {
        Self { id, cpus }
    }

    /// Returns the node ID.
    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Returns the CPUs associated with this node.
    #[inline]
    pub fn cpus(&self) -> &CpuSet {
        &self.cpus
    }
}

/// Bytes currently placed on each node by one allocator.
#[derive(Debug)]
pub struct NumaStats {
    /// Live bytes per node
    pub bytes_allocated: [AtomicU64; MAX_NUMA_NODES],
}

impl Default for NumaStats {
    fn default() -> Self {
        const INIT: AtomicU64 = AtomicU64::new(0);
        Self {
            bytes_allocated: [INIT; MAX_NUMA_NODES],
        }
    }
}

impl NumaStats {
    /// Records an allocation.
    pub fn record_allocation(&self, node: u32, bytes: u64) {
        if (node as usize) < MAX_NUMA_NODES {
            self.bytes_allocated[node as usize].fetch_add(bytes, Ordering::Relaxed);
        }
    }

    /// Records a deallocation.
    pub fn record_deallocation(&self, node: u32, bytes: u64) {
        if (node as usize) < MAX_NUMA_NODES {
            self.bytes_allocated[node as usize].fetch_sub(bytes, Ordering::Relaxed);
        }
    }

    /// Live bytes summed over all nodes.
    pub fn live_bytes(&self) -> u64 {
        self.bytes_allocated
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .sum()
    }
}
