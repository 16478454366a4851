//! The `(sender, receiver)` connection table.
//!
//! [`BindingTable::connect_all`] runs once per context. It creates a
//! [`QueuePair`] for every tree edge and every administrative edge between
//! the root and a message-passing core, and one [`Cluster`] per cluster in
//! the topology. Both directions of an edge share the same object.

use std::sync::Arc;

use crate::config::Config;
use crate::numa::Platform;
use crate::topology::Topology;
use crate::transport::{Cluster, QueuePair};
use crate::{ClusterId, CoreId, Error, Result};

/// An established channel between two cores.
#[derive(Debug, Clone, Copy)]
pub enum Binding<'a> {
    /// Point-to-point message passing
    Queue(&'a QueuePair),
    /// A coordinator/member edge inside a shared-memory cluster
    Cluster {
        /// The cluster region
        cluster: &'a Cluster,
        /// Reader id of the member end
        reader_id: usize,
    },
}

#[derive(Debug, Clone, Copy)]
struct ClusterLink {
    cluster: ClusterId,
    reader_id: usize,
}

/// Dense `n×n` table of bindings, owned by a context.
#[derive(Debug)]
pub struct BindingTable {
    num_cores: usize,
    queues: Vec<Option<Arc<QueuePair>>>,
    cluster_links: Vec<Option<ClusterLink>>,
    clusters: Vec<Option<Cluster>>,
}

impl BindingTable {
    /// Connects every edge `topology` needs; with `config.eager_connect`,
    /// every core pair.
    pub fn connect_all(
        topology: &Topology,
        config: &Config,
        platform: &Arc<dyn Platform>,
    ) -> Result<Self> {
        let n = topology.num_nodes();
        let mut table = Self {
            num_cores: n,
            queues: vec![None; n * n],
            cluster_links: vec![None; n * n],
            clusters: Vec::new(),
        };

        for spec in topology.clusters() {
            let cluster = Cluster::new(
                spec.id,
                spec.coordinator,
                spec.members.clone(),
                config.cluster_slots,
                platform,
            )?;
            for (reader_id, &member) in cluster.members().iter().enumerate() {
                let link = Some(ClusterLink {
                    cluster: spec.id,
                    reader_id,
                });
                table.cluster_links[spec.coordinator * n + member] = link;
                table.cluster_links[member * n + spec.coordinator] = link;
            }
            if table.clusters.len() <= spec.id {
                table.clusters.resize_with(spec.id + 1, || None);
            }
            table.clusters[spec.id] = Some(cluster);
        }

        let root = topology.root();
        let mut pairs = 0usize;
        for i in 0..n {
            for j in (i + 1)..n {
                let wanted = config.eager_connect
                    || Self::needs_queue(topology, i, j)?
                    || Self::needs_queue(topology, j, i)?;
                if !wanted {
                    continue;
                }

                let pair = Arc::new(QueuePair::new(i, j, config.queue_slots, platform)?);
                table.queues[i * n + j] = Some(Arc::clone(&pair));
                table.queues[j * n + i] = Some(pair);
                pairs += 1;
            }
        }

        tracing::info!(
            cores = n,
            root,
            queue_pairs = pairs,
            clusters = topology.clusters().len(),
            eager = config.eager_connect,
            "bindings connected"
        );
        Ok(table)
    }

    /// A queue from `i` to `j` is needed when `j` is `i`'s message-passing
    /// parent, or when `i` is the root and `j` uses message passing.
    fn needs_queue(topology: &Topology, i: CoreId, j: CoreId) -> Result<bool> {
        if topology.node(i)?.mp_parent() == Some(j) {
            return Ok(true);
        }
        Ok(i == topology.root() && i != j && topology.roles(j)?.uses_mp())
    }

    /// Number of cores the table spans.
    pub fn num_cores(&self) -> usize {
        self.num_cores
    }

    fn index(&self, sender: CoreId, receiver: CoreId) -> Result<usize> {
        if sender >= self.num_cores {
            return Err(Error::UnknownCore(sender));
        }
        if receiver >= self.num_cores {
            return Err(Error::UnknownCore(receiver));
        }
        Ok(sender * self.num_cores + receiver)
    }

    /// Looks up the channel from `sender` to `receiver`.
    ///
    /// A pair with both a queue (eager mode) and a cluster edge resolves to
    /// the queue.
    pub fn get_binding(&self, sender: CoreId, receiver: CoreId) -> Result<Binding<'_>> {
        let idx = self.index(sender, receiver)?;
        if let Some(pair) = &self.queues[idx] {
            return Ok(Binding::Queue(pair));
        }
        match self.cluster_links[idx] {
            Some(link) => Ok(Binding::Cluster {
                cluster: self.cluster(link.cluster)?,
                reader_id: link.reader_id,
            }),
            None => Err(Error::ChannelNotFound { sender, receiver }),
        }
    }

    /// The queue pair between `sender` and `receiver`.
    pub fn link(&self, sender: CoreId, receiver: CoreId) -> Result<&QueuePair> {
        match self.get_binding(sender, receiver)? {
            Binding::Queue(pair) => Ok(pair),
            Binding::Cluster { .. } => Err(Error::NotPointToPoint { sender, receiver }),
        }
    }

    /// Whether `sender` can reach `receiver` point-to-point.
    pub fn has_link(&self, sender: CoreId, receiver: CoreId) -> bool {
        self.link(sender, receiver).is_ok()
    }

    /// Cluster `id`.
    pub fn cluster(&self, id: ClusterId) -> Result<&Cluster> {
        self.clusters
            .get(id)
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::InvalidModel(format!("cluster {id} is not connected")))
    }

    /// All connected clusters.
    pub fn clusters(&self) -> impl Iterator<Item = &Cluster> {
        self.clusters.iter().flatten()
    }
}
