//! NUMA Topology Discovery
//!
//! Discovers which CPUs belong to which NUMA node, so transports can place
//! each ring next to its consumer.

use std::sync::OnceLock;

use super::NumaNode;

/// Global topology instance
static TOPOLOGY: OnceLock<NumaTopology> = OnceLock::new();

/// A set of CPU IDs.
#[derive(Debug, Clone, Default)]
pub struct CpuSet {
    /// Bitmask of CPUs (supports up to 256 CPUs)
    mask: [u64; 4],
}

impl CpuSet {
    /// Creates an empty CPU set.
    pub const fn new() -> Self {
        Self { mask: [0; 4] }
    }

    /// Adds a CPU to the set.
    pub fn insert(&mut self, cpu: u32) {
        if cpu < 256 {
            self.mask[(cpu / 64) as usize] |= 1 << (cpu % 64);
        }
    }

    /// Checks if a CPU is in the set.
    pub fn contains(&self, cpu: u32) -> bool {
        cpu < 256 && (self.mask[(cpu / 64) as usize] & (1 << (cpu % 64))) != 0
    }

    /// Returns the number of CPUs in the set.
    pub fn count(&self) -> usize {
        self.mask.iter().map(|m| m.count_ones() as usize).sum()
    }

    /// Parses a sysfs cpulist such as `0-3,8,10-11`.
    pub fn parse_list(list: &str) -> Self {
        let mut cpus = Self::new();
        for range in list.trim().split(',').filter(|r| !r.is_empty()) {
            match range.split_once('-') {
                Some((start, end)) => {
                    if let (Ok(start), Ok(end)) = (start.parse::<u32>(), end.parse::<u32>()) {
                        for cpu in start..=end {
                            cpus.insert(cpu);
                        }
                    }
                }
                None => {
                    if let Ok(cpu) = range.parse::<u32>() {
                        cpus.insert(cpu);
                    }
                }
            }
        }
        cpus
    }
}

/// A NUMA node identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u32);

/// NUMA topology information.
#[derive(Debug)]
pub struct NumaTopology {
    nodes: Vec<NumaNode>,
    numa_available: bool,
}

impl NumaTopology {
    /// Gets or initializes the global topology.
    pub fn get() -> &'static Self {
        TOPOLOGY.get_or_init(Self::discover)
    }

    /// Discovers the system's NUMA topology, falling back to one node.
    pub fn discover() -> Self {
        #[cfg(target_os = "linux")]
        {
            Self::discover_linux().unwrap_or_else(Self::fallback)
        }

        #[cfg(not(target_os = "linux"))]
        {
            Self::fallback()
        }
    }

    /// Creates a fallback single-node topology covering every available CPU.
    pub fn fallback() -> Self {
        let num_cpus = std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(1);

        let mut cpus = CpuSet::new();
        for i in 0..num_cpus {
            cpus.insert(i as u32);
        }

        Self {
            nodes: vec![NumaNode::new(0, cpus)],
            numa_available: false,
        }
    }

    #[cfg(target_os = "linux")]
    fn discover_linux() -> Option<Self> {
        use std::fs;
        use std::path::Path;

        let numa_path = Path::new("/sys/devices/system/node");

        let mut node_ids: Vec<u32> = fs::read_dir(numa_path)
            .ok()?
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name();
                name.to_string_lossy()
                    .strip_prefix("node")
                    .and_then(|id| id.parse::<u32>().ok())
            })
            .collect();

        if node_ids.is_empty() {
            return None;
        }
        node_ids.sort_unstable();

        let nodes = node_ids
            .into_iter()
            .map(|node_id| {
                let node_path = numa_path.join(format!("node{node_id}"));

                let cpus = fs::read_to_string(node_path.join("cpulist"))
                    .map(|list| CpuSet::parse_list(&list))
                    .unwrap_or_default();
                NumaNode::new(node_id, cpus)
            })
            .collect();

        Some(Self {
            nodes,
            numa_available: true,
        })
    }

    /// Returns the number of NUMA nodes.
    #[inline]
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Returns whether real NUMA information was discovered.
    #[inline]
    pub fn is_numa_available(&self) -> bool {
        self.numa_available
    }

    /// Gets a node by ID.
    pub fn node(&self, id: u32) -> Option<&NumaNode> {
        self.nodes.iter().find(|n| n.id() == id)
    }

    /// Total CPUs across all nodes.
    pub fn num_cpus(&self) -> usize {
        self.nodes.iter().map(|n| n.cpus().count()).sum()
    }

    /// Returns the node owning `cpu`, or the first node if the CPU is unknown.
    pub fn node_of_cpu(&self, cpu: u32) -> NodeId {
        self.nodes
            .iter()
            .find(|node| node.cpus().contains(cpu))
            .or_else(|| self.nodes.first())
            .map_or(NodeId(0), |node| NodeId(node.id()))
    }

    /// Gets the current node for the calling thread.
    pub fn current_node(&self) -> NodeId {
        #[cfg(target_os = "linux")]
        {
            let cpu = unsafe { libc::sched_getcpu() };
            if cpu >= 0 {
                return self.node_of_cpu(cpu as u32);
            }
        }

        self.node_of_cpu(0)
    }
}
