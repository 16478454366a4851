//! NUMA-Aware Memory Allocator
//!
//! Allocates transport regions with explicit NUMA node placement. Large
//! blocks are mapped with `mmap` and bound with `mbind`; small blocks, and
//! every block on non-Linux targets, come from the global allocator.

use core::alloc::Layout;
use core::ptr::NonNull;
use std::alloc::{alloc, alloc_zeroed, dealloc};

use super::{NodeId, NumaError, NumaStats, NumaTopology, Result, MAX_NUMA_NODES};

/// Blocks at least this large are page-mapped and node-bound.
const MMAP_THRESHOLD: usize = 4096;

/// NUMA-aware memory allocator.
///
/// ```rust
/// use hybrid_collectives::numa::{AllocationPolicy, NodeId, NumaAllocator};
/// use std::alloc::Layout;
///
/// let allocator = NumaAllocator::new();
/// let layout = Layout::from_size_align(8192, 64).unwrap();
/// let node = allocator.resolve_node(AllocationPolicy::Local).unwrap();
/// let ptr = allocator.allocate_raw(layout, AllocationPolicy::OnNode(node), true).unwrap();
/// unsafe { allocator.deallocate_raw(ptr, layout, node) };
///
/// let missing = AllocationPolicy::OnNode(NodeId(63));
/// assert!(allocator.allocate_raw(layout, missing, false).is_err());
/// ```
pub struct NumaAllocator {
    topology: &'static NumaTopology,
    stats: NumaStats,
}

/// Policy for memory allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocationPolicy {
    /// Allocate on the node of the calling CPU
    #[default]
    Local,

    /// Bind to a specific node
    OnNode(NodeId),
}

impl NumaAllocator {
    /// Creates a new NUMA allocator over the discovered topology.
    pub fn new() -> Self {
        Self {
            topology: NumaTopology::get(),
            stats: NumaStats::default(),
        }
    }

    /// Returns the topology this allocator places memory on.
    pub fn topology(&self) -> &'static NumaTopology {
        self.topology
    }

    /// Allocates raw memory with the specified layout.
    ///
    /// Fails with [`NumaError::InvalidNode`] if the policy names a node
    /// outside the topology, so the block always lives where the caller
    /// asked. Zero-sized layouts yield a dangling, well-aligned pointer.
    pub fn allocate_raw(
        &self,
        layout: Layout,
        policy: AllocationPolicy,
        zero: bool,
    ) -> Result<NonNull<u8>> {
        let node = self.resolve_node(policy)?;
        if layout.size() == 0 {
            return NonNull::new(layout.align() as *mut u8).ok_or(NumaError::AllocationFailed(0));
        }

        let ptr = self
            .allocate_on_node(layout, node, zero)
            .ok_or(NumaError::AllocationFailed(layout.size()))?;
        self.stats.record_allocation(node.0, layout.size() as u64);
        Ok(ptr)
    }

    /// Deallocates raw memory.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate_raw` on this allocator with the same
    /// layout, and `node` must be the node the policy resolved to.
    pub unsafe fn deallocate_raw(&self, ptr: NonNull<u8>, layout: Layout, node: NodeId) {
        if layout.size() == 0 {
            return;
        }

        self.deallocate_from_node(ptr, layout);
        self.stats.record_deallocation(node.0, layout.size() as u64);
    }

    /// Returns the allocation statistics.
    pub fn stats(&self) -> &NumaStats {
        &self.stats
    }

    /// Resolves a policy to a node of the topology.
    pub fn resolve_node(&self, policy: AllocationPolicy) -> Result<NodeId> {
        match policy {
            AllocationPolicy::Local => Ok(self.topology.current_node()),
            AllocationPolicy::OnNode(node) if self.topology.node(node.0).is_some() => Ok(node),
            AllocationPolicy::OnNode(node) => {
                tracing::debug!(node = node.0, "allocation requested on unknown NUMA node");
                Err(NumaError::InvalidNode(node.0))
            }
        }
    }

    fn allocate_on_node(&self, layout: Layout, node: NodeId, zero: bool) -> Option<NonNull<u8>> {
        #[cfg(target_os = "linux")]
        {
            if layout.size() >= MMAP_THRESHOLD && layout.align() <= MMAP_THRESHOLD {
                return self.allocate_linux(layout, node);
            }
        }

        let _ = node;
        let ptr = unsafe {
            if zero {
                alloc_zeroed(layout)
            } else {
                alloc(layout)
            }
        };
        NonNull::new(ptr)
    }

    /// Maps anonymous memory, binds it to `node` and pre-faults it so the
    /// pages are physically resident there before the first poll.
    /// Anonymous mappings are always zero-filled.
    #[cfg(target_os = "linux")]
    fn allocate_linux(&self, layout: Layout, node: NodeId) -> Option<NonNull<u8>> {
        use std::ptr;

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                layout.size(),
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return None;
        }

        if self.topology.is_numa_available() {
            let bits = std::mem::size_of::<libc::c_ulong>() * 8;
            let mut nodemask: [libc::c_ulong; MAX_NUMA_NODES / 64 + 1] = [0; MAX_NUMA_NODES / 64 + 1];
            let word = node.0 as usize / bits;
            if word < nodemask.len() {
                nodemask[word] = 1 << (node.0 as usize % bits);
            }

            // MPOL_BIND = 2, MPOL_MF_MOVE = 1 << 1; a failure leaves default placement
            let rc = unsafe {
                libc::syscall(
                    libc::SYS_mbind,
                    ptr,
                    layout.size(),
                    2 as libc::c_int,
                    nodemask.as_ptr(),
                    (nodemask.len() * bits) as libc::c_ulong,
                    (1 << 1) as libc::c_uint,
                )
            };
            if rc != 0 {
                tracing::debug!(node = node.0, "mbind failed, keeping default placement");
            }
        }

        unsafe {
            let page_size = libc::sysconf(libc::_SC_PAGESIZE).max(1) as usize;
            let mut offset = 0;
            while offset < layout.size() {
                (ptr as *mut u8).add(offset).write_volatile(0);
                offset += page_size;
            }
        }

        NonNull::new(ptr as *mut u8)
    }

    fn deallocate_from_node(&self, ptr: NonNull<u8>, layout: Layout) {
        #[cfg(target_os = "linux")]
        {
            if layout.size() >= MMAP_THRESHOLD && layout.align() <= MMAP_THRESHOLD {
                unsafe {
                    libc::munmap(ptr.as_ptr() as *mut libc::c_void, layout.size());
                }
                return;
            }
        }

        unsafe { dealloc(ptr.as_ptr(), layout) };
    }
}

impl Default for NumaAllocator {
    fn default() -> Self {
        Self::new()
    }
}
