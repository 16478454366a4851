//! Tree-structured collectives over the hybrid transport.
//!
//! Every algorithm walks the same overlay tree. For one core the work per call
//! is fixed by its [`Roles`](crate::Roles) and its node in the
//! [`Topology`](crate::Topology):
//!
//! ```text
//!            root (sequentializer)
//!           /    \
//!      mp child   coordinator ══ shm ══ member, member
//!         |
//!      mp child
//! ```
//!
//! - reduce: children first (message-passing children in order, then the
//!   cluster), then one hand-off upstream
//! - broadcast: one receive from upstream, then fan-out in child order
//! - barrier: reduce of the invocation counter followed by its broadcast

mod barrier;
mod broadcast;
mod reduce;

pub(crate) use barrier::{tree_barrier, ShmBarrierArena};
pub(crate) use broadcast::{broadcast, broadcast_from};
pub(crate) use reduce::{reduce, reduce_notify};

use crate::binding::BindingTable;
use crate::message::Word;
use crate::sync::atomic::{AtomicU64, Ordering};
use crate::sync::SpinPolicy;
use crate::topology::{Roles, Topology, TopologyNode};
use crate::transport::{Cluster, Ring};
use crate::{CoreId, Error, Result};

/// One core's view of a context: everything a collective step touches.
#[derive(Clone, Copy)]
pub(crate) struct Endpoint<'a> {
    pub(crate) core: CoreId,
    pub(crate) topology: &'a Topology,
    pub(crate) bindings: &'a BindingTable,
    pub(crate) spin: &'a SpinPolicy,
}

impl<'a> Endpoint<'a> {
    pub(crate) fn node(&self) -> Result<&'a TopologyNode> {
        self.topology.node(self.core)
    }

    pub(crate) fn roles(&self) -> Result<Roles> {
        self.topology.roles(self.core)
    }

    /// The ring this core writes to reach `receiver`.
    pub(crate) fn tx(&self, receiver: CoreId) -> Result<&'a Ring> {
        self.bindings
            .link(self.core, receiver)?
            .tx(self.core)
            .ok_or(Error::ChannelNotFound {
                sender: self.core,
                receiver,
            })
    }

    /// The ring this core reads to hear from `sender`.
    pub(crate) fn rx(&self, sender: CoreId) -> Result<&'a Ring> {
        self.bindings
            .link(sender, self.core)?
            .rx(self.core)
            .ok_or(Error::ChannelNotFound {
                sender,
                receiver: self.core,
            })
    }

    /// The cluster this core coordinates.
    pub(crate) fn coordinated_cluster(&self) -> Result<Option<&'a Cluster>> {
        self.node()?
            .coordinates()
            .map(|id| self.bindings.cluster(id))
            .transpose()
    }

    /// The cluster this core is a member of, with its reader id.
    pub(crate) fn member_cluster(&self) -> Result<Option<(&'a Cluster, usize)>> {
        let Some(id) = self.node()?.member_of() else {
            return Ok(None);
        };
        let cluster = self.bindings.cluster(id)?;
        let reader_id = cluster
            .reader_id(self.core)
            .ok_or(Error::UnknownCore(self.core))?;
        Ok(Some((cluster, reader_id)))
    }
}

/// A commutative, associative combining operator.
///
/// Each operator has an identity and a lock-free atomic counterpart, so the
/// same operator runs over message-passing edges and shared-memory clusters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    /// Wrapping integer addition
    Sum,
    /// Minimum
    Min,
    /// Maximum
    Max,
    /// Bitwise or
    BitOr,
    /// Bitwise and
    BitAnd,
}

impl ReduceOp {
    /// All operators, in lane order.
    pub const ALL: [ReduceOp; 5] = [
        ReduceOp::Sum,
        ReduceOp::Min,
        ReduceOp::Max,
        ReduceOp::BitOr,
        ReduceOp::BitAnd,
    ];

    /// Neutral element: `combine(identity, x) == x`.
    #[inline]
    pub const fn identity(self) -> Word {
        match self {
            ReduceOp::Sum | ReduceOp::Max | ReduceOp::BitOr => 0,
            ReduceOp::Min | ReduceOp::BitAnd => Word::MAX,
        }
    }

    /// Combines two values.
    #[inline]
    pub fn combine(self, a: Word, b: Word) -> Word {
        match self {
            ReduceOp::Sum => a.wrapping_add(b),
            ReduceOp::Min => a.min(b),
            ReduceOp::Max => a.max(b),
            ReduceOp::BitOr => a | b,
            ReduceOp::BitAnd => a & b,
        }
    }

    /// Atomically folds `value` into `cell`.
    #[inline]
    pub(crate) fn fetch_combine(self, cell: &AtomicU64, value: Word, order: Ordering) {
        match self {
            ReduceOp::Sum => cell.fetch_add(value, order),
            ReduceOp::Min => cell.fetch_min(value, order),
            ReduceOp::Max => cell.fetch_max(value, order),
            ReduceOp::BitOr => cell.fetch_or(value, order),
            ReduceOp::BitAnd => cell.fetch_and(value, order),
        };
    }

    /// Index of this operator's accumulator lane in a cluster.
    #[inline]
    pub(crate) const fn lane(self) -> usize {
        self as usize
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use super::Endpoint;
    use crate::binding::BindingTable;
    use crate::config::Config;
    use crate::numa::{HeapPlatform, Platform};
    use crate::sync::SpinPolicy;
    use crate::topology::Topology;

    /// Runs `f` on one thread per core of `topology` and returns the results
    /// in core order.
    pub(crate) fn run_endpoints<R: Send>(
        topology: &Topology,
        f: impl Fn(Endpoint<'_>) -> R + Sync,
    ) -> Vec<R> {
        let platform: Arc<dyn Platform> = Arc::new(HeapPlatform::new());
        let config = Config {
            queue_slots: 8,
            cluster_slots: 8,
            ..Config::default()
        };
        let bindings = BindingTable::connect_all(topology, &config, &platform).unwrap();
        let spin = SpinPolicy::yielding(32);

        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..topology.num_nodes())
                .map(|core| {
                    let ep = Endpoint {
                        core,
                        topology,
                        bindings: &bindings,
                        spin: &spin,
                    };
                    let f = &f;
                    scope.spawn(move || f(ep))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect()
        })
    }
}
