//! Platform capability set and placement-owning containers.
//!
//! The collectives never talk to the OS directly. They allocate transport
//! regions, pin threads and ask for the node of a core through [`Platform`],
//! which keeps the core of the crate testable on any host.

use core::alloc::Layout;
use core::fmt;
use core::marker::PhantomData;
use core::ops::Deref;
use core::ptr::{self, NonNull};
use std::alloc::{alloc, alloc_zeroed, dealloc};
use std::sync::Arc;

use super::{AllocationPolicy, NodeId, NumaAllocator, NumaError, NumaTopology, Result};

/// Capabilities the collectives need from the machine.
pub trait Platform: Send + Sync + fmt::Debug {
    /// Allocates memory on the caller's node. Returns the block and the node
    /// it was placed on; pass that node back to [`Platform::free`].
    fn alloc(&self, layout: Layout, zero: bool) -> Result<(NonNull<u8>, NodeId)>;

    /// Allocates memory on `node`. Fails with [`NumaError::InvalidNode`] if
    /// the machine has no such node.
    fn alloc_on_node(&self, layout: Layout, node: NodeId, zero: bool) -> Result<NonNull<u8>>;

    /// Releases a block.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `alloc`/`alloc_on_node` on this platform with the
    /// same `layout` and the `node` the block was placed on, and must not be
    /// used afterwards.
    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout, node: NodeId);

    /// Pins the calling thread to hardware core `core`.
    fn pin_to_core(&self, core: usize) -> Result<()>;

    /// Number of hardware threads available to this process.
    fn num_available_cores(&self) -> usize;

    /// NUMA node of hardware core `core`.
    fn node_of_core(&self, core: usize) -> NodeId;
}

/// NUMA-aware platform backed by sysfs discovery, `mbind` placement and
/// `sched_setaffinity`.
#[derive(Default)]
pub struct NumaPlatform {
    allocator: NumaAllocator,
}

impl NumaPlatform {
    /// Creates a platform over the discovered topology.
    pub fn new() -> Self {
        let platform = Self {
            allocator: NumaAllocator::new(),
        };
        let topology = platform.topology();
        tracing::debug!(
            nodes = topology.num_nodes(),
            cpus = topology.num_cpus(),
            numa = topology.is_numa_available(),
            "discovered machine topology"
        );
        platform
    }

    /// Returns the discovered topology.
    pub fn topology(&self) -> &'static NumaTopology {
        self.allocator.topology()
    }

    /// Bytes currently held by transport regions.
    pub fn live_bytes(&self) -> u64 {
        self.allocator.stats().live_bytes()
    }
}

impl fmt::Debug for NumaPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NumaPlatform")
            .field("nodes", &self.topology().num_nodes())
            .field("live_bytes", &self.live_bytes())
            .finish()
    }
}

impl Platform for NumaPlatform {
    fn alloc(&self, layout: Layout, zero: bool) -> Result<(NonNull<u8>, NodeId)> {
        let node = self.allocator.resolve_node(AllocationPolicy::Local)?;
        let ptr = self.alloc_on_node(layout, node, zero)?;
        Ok((ptr, node))
    }

    fn alloc_on_node(&self, layout: Layout, node: NodeId, zero: bool) -> Result<NonNull<u8>> {
        self.allocator
            .allocate_raw(layout, AllocationPolicy::OnNode(node), zero)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout, node: NodeId) {
        self.allocator.deallocate_raw(ptr, layout, node);
    }

    fn pin_to_core(&self, core: usize) -> Result<()> {
        #[cfg(target_os = "linux")]
        {
            if core >= libc::CPU_SETSIZE as usize {
                return Err(NumaError::AffinityError {
                    core,
                    errno: libc::EINVAL,
                });
            }

            let rc = unsafe {
                let mut set: libc::cpu_set_t = core::mem::zeroed();
                libc::CPU_SET(core, &mut set);
                libc::sched_setaffinity(0, core::mem::size_of::<libc::cpu_set_t>(), &set)
            };
            if rc != 0 {
                let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
                return Err(NumaError::AffinityError { core, errno });
            }
            Ok(())
        }

        #[cfg(not(target_os = "linux"))]
        {
            let _ = core;
            Err(NumaError::NotSupported)
        }
    }

    fn num_available_cores(&self) -> usize {
        std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or_else(|_| self.topology().num_cpus().max(1))
    }

    fn node_of_core(&self, core: usize) -> NodeId {
        self.topology().node_of_cpu(core as u32)
    }
}

/// Single-node platform on the global allocator. Pinning is a no-op.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapPlatform {
    cores: Option<usize>,
}

impl HeapPlatform {
    /// Reports the host's parallelism as the core count.
    pub fn new() -> Self {
        Self { cores: None }
    }

    /// Reports a fixed core count, regardless of the host.
    pub fn with_cores(cores: usize) -> Self {
        Self { cores: Some(cores) }
    }
}

impl Platform for HeapPlatform {
    fn alloc(&self, layout: Layout, zero: bool) -> Result<(NonNull<u8>, NodeId)> {
        Ok((self.alloc_on_node(layout, NodeId(0), zero)?, NodeId(0)))
    }

    fn alloc_on_node(&self, layout: Layout, node: NodeId, zero: bool) -> Result<NonNull<u8>> {
        if node != NodeId(0) {
            return Err(NumaError::InvalidNode(node.0));
        }
        if layout.size() == 0 {
            return NonNull::new(layout.align() as *mut u8)
                .ok_or(NumaError::AllocationFailed(0));
        }

        let ptr = unsafe {
            if zero {
                alloc_zeroed(layout)
            } else {
                alloc(layout)
            }
        };
        NonNull::new(ptr).ok_or(NumaError::AllocationFailed(layout.size()))
    }

    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout, _node: NodeId) {
        if layout.size() != 0 {
            dealloc(ptr.as_ptr(), layout);
        }
    }

    fn pin_to_core(&self, _core: usize) -> Result<()> {
        Ok(())
    }

    fn num_available_cores(&self) -> usize {
        self.cores.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(1)
        })
    }

    fn node_of_core(&self, _core: usize) -> NodeId {
        NodeId(0)
    }
}

/// A single value placed on a chosen NUMA node.
pub struct NumaBox<T> {
    ptr: NonNull<T>,
    node: NodeId,
    platform: Arc<dyn Platform>,
    _marker: PhantomData<T>,
}

// SAFETY: NumaBox uniquely owns its T, like Box<T>.
unsafe impl<T: Send> Send for NumaBox<T> {}
unsafe impl<T: Sync> Sync for NumaBox<T> {}

impl<T> NumaBox<T> {
    /// Moves `value` into memory on `node`.
    pub fn new_on_node(value: T, node: NodeId, platform: Arc<dyn Platform>) -> Result<Self> {
        let layout = Layout::new::<T>();
        let ptr = platform.alloc_on_node(layout, node, false)?.cast::<T>();
        unsafe { ptr.as_ptr().write(value) };
        Ok(Self {
            ptr,
            node,
            platform,
            _marker: PhantomData,
        })
    }

    /// Node the value lives on.
    pub fn node(&self) -> NodeId {
        self.node
    }
}

impl<T> Deref for NumaBox<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> Drop for NumaBox<T> {
    fn drop(&mut self) {
        unsafe {
            ptr::drop_in_place(self.ptr.as_ptr());
            self.platform
                .free(self.ptr.cast(), Layout::new::<T>(), self.node);
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for NumaBox<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NumaBox")
            .field("node", &self.node)
            .field("value", &**self)
            .finish()
    }
}

/// A fixed-length array placed on a chosen NUMA node.
pub struct NumaSlice<T> {
    ptr: NonNull<T>,
    len: usize,
    layout: Layout,
    node: NodeId,
    platform: Arc<dyn Platform>,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for NumaSlice<T> {}
unsafe impl<T: Sync> Sync for NumaSlice<T> {}

impl<T> NumaSlice<T> {
    /// Allocates `len` elements on `node`, initialising element `i` with `init(i)`.
    pub fn from_fn_on_node(
        len: usize,
        node: NodeId,
        platform: Arc<dyn Platform>,
        mut init: impl FnMut(usize) -> T,
    ) -> Result<Self> {
        let layout = Self::layout(len)?;
        let ptr = platform.alloc_on_node(layout, node, false)?.cast::<T>();

        // Build a guard first so a panicking `init` frees what was written.
        let mut slice = Self {
            ptr,
            len: 0,
            layout,
            node,
            platform,
            _marker: PhantomData,
        };
        for i in 0..len {
            unsafe { slice.ptr.as_ptr().add(i).write(init(i)) };
            slice.len = i + 1;
        }
        Ok(slice)
    }

    /// Node the elements live on.
    pub fn node(&self) -> NodeId {
        self.node
    }

    fn layout(len: usize) -> Result<Layout> {
        Layout::array::<T>(len).map_err(|_| NumaError::AllocationFailed(usize::MAX))
    }
}

impl<T> Deref for NumaSlice<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T> Drop for NumaSlice<T> {
    fn drop(&mut self) {
        unsafe {
            ptr::drop_in_place(ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len));
        }
        unsafe { self.platform.free(self.ptr.cast(), self.layout, self.node) };
    }
}

impl<T: fmt::Debug> fmt::Debug for NumaSlice<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NumaSlice")
            .field("node", &self.node)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_heap_platform_box() {
        let platform: Arc<dyn Platform> = Arc::new(HeapPlatform::new());
        let value = NumaBox::new_on_node([7u64; 8], NodeId(0), Arc::clone(&platform)).unwrap();
        assert_eq!(value[3], 7);
        assert_eq!(value.node(), NodeId(0));
        assert!(platform.pin_to_core(0).is_ok());
        assert_eq!(HeapPlatform::with_cores(3).num_available_cores(), 3);
    }

    #[test]
    fn test_slice_drops_every_element() {
        static DROPS: AtomicUsize = AtomicUsize::new(0);

        struct Counted;
        impl Drop for Counted {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::Relaxed);
            }
        }

        let platform: Arc<dyn Platform> = Arc::new(HeapPlatform::new());
        let slice = NumaSlice::from_fn_on_node(5, NodeId(0), platform, |_| Counted).unwrap();
        assert_eq!(slice.len(), 5);
        drop(slice);
        assert_eq!(DROPS.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn test_numa_platform_places_and_frees() {
        let platform = Arc::new(NumaPlatform::new());
        let node = platform.node_of_core(0);
        {
            let dyn_platform: Arc<dyn Platform> = platform.clone();
            let slice =
                NumaSlice::from_fn_on_node(1024, node, dyn_platform, |i| i as u64).unwrap();
            assert_eq!(slice[1023], 1023);
            assert!(platform.live_bytes() >= 8 * 1024);
        }
        assert_eq!(platform.live_bytes(), 0);
        assert!(platform.num_available_cores() >= 1);

        let layout = Layout::from_size_align(256, 64).unwrap();
        let (ptr, local) = platform.alloc(layout, true).unwrap();
        assert!(platform.topology().node(local.0).is_some());
        assert_eq!(platform.live_bytes(), 256);
        unsafe { platform.free(ptr, layout, local) };
        assert_eq!(platform.live_bytes(), 0);
    }

    #[test]
    fn test_unknown_node_is_not_silently_relocated() {
        let numa = Arc::new(NumaPlatform::new());
        let missing = NodeId(40);
        assert!(numa.topology().node(missing.0).is_none());

        let platforms: [Arc<dyn Platform>; 2] = [numa.clone(), Arc::new(HeapPlatform::new())];
        for platform in platforms {
            let layout = Layout::from_size_align(8192, 64).unwrap();
            assert!(matches!(
                platform.alloc_on_node(layout, missing, false),
                Err(NumaError::InvalidNode(40))
            ));
            assert!(matches!(
                NumaBox::new_on_node(1u64, missing, Arc::clone(&platform)),
                Err(NumaError::InvalidNode(40))
            ));
            assert!(matches!(
                NumaSlice::from_fn_on_node(64, missing, platform, |i| i as u64),
                Err(NumaError::InvalidNode(40))
            ));
        }
        assert_eq!(numa.live_bytes(), 0);
    }
}
