//! Shared-memory clusters.
//!
//! A cluster is one coordinator core and the member cores that share its
//! NUMA-local region. The region holds:
//!
//! - a [`ClusterQueue`]: the coordinator writes each message once and every
//!   member reads it at its own pace, addressed by its reader id
//! - a [`ClusterReduction`]: one atomic accumulator lane per
//!   [`ReduceOp`], a contribution counter and a round gate
//!
//! # Reduction Rounds
//!
//! ```text
//! member m                          coordinator
//! ────────                          ───────────
//! wait round == expected[m]
//! lane.fetch_op(value)
//! counter += 1            ──────►   wait counter == members
//! expected[m] += 1                  value = lane.swap(identity)
//!                                   counter = 0
//!                         ◄──────   round += 1 (Release)
//! ```
//!
//! A member that finishes round `r` early blocks at the gate of round `r+1`
//! until the coordinator has drained round `r`, so no contribution is ever
//! counted twice or folded into the wrong round.

use std::sync::Arc;

use crossbeam_utils::CachePadded;

use super::queue::in_flight;
use super::{placement_error, slot_bytes, Slot};
use crate::collective::ReduceOp;
use crate::message::{Message, Word};
use crate::numa::{NodeId, NumaBox, NumaSlice, Platform};
use crate::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use crate::sync::SpinPolicy;
use crate::{ClusterId, CoreId, Error, Result};

/// Writer-local state.
#[derive(Debug)]
struct WriterState {
    seq: AtomicU64,
    /// Oldest reader position as last observed.
    min_ack: AtomicU64,
}

/// One-writer/many-reader ring. Every reader receives every message.
pub struct ClusterQueue {
    slots: NumaSlice<Slot>,
    mask: u64,
    writer: CachePadded<WriterState>,
    readers: NumaSlice<CachePadded<AtomicU64>>,
}

impl ClusterQueue {
    /// Allocates a queue of `capacity` slots for `num_readers` readers on `node`.
    pub fn new(
        capacity: usize,
        num_readers: usize,
        node: NodeId,
        platform: Arc<dyn Platform>,
    ) -> Result<Self> {
        let bytes = slot_bytes(capacity)?;
        let slots = NumaSlice::from_fn_on_node(capacity, node, Arc::clone(&platform), |_| {
            Slot::new()
        })
        .map_err(placement_error(bytes))?;
        let readers = NumaSlice::from_fn_on_node(num_readers, node, platform, |_| {
            CachePadded::new(AtomicU64::new(0))
        })
        .map_err(placement_error(
            num_readers.saturating_mul(core::mem::size_of::<CachePadded<AtomicU64>>()),
        ))?;

        Ok(Self {
            slots,
            mask: capacity as u64 - 1,
            writer: CachePadded::new(WriterState {
                seq: AtomicU64::new(0),
                min_ack: AtomicU64::new(0),
            }),
            readers,
        })
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of readers.
    pub fn num_readers(&self) -> usize {
        self.readers.len()
    }

    #[inline]
    fn slot(&self, seq: u64) -> &Slot {
        &self.slots[(seq & self.mask) as usize]
    }

    fn reader(&self, reader_id: usize) -> Result<&AtomicU64> {
        self.readers
            .get(reader_id)
            .map(|pos| &**pos)
            .ok_or(Error::UnknownCore(reader_id))
    }

    fn reserve(&self) -> Option<u64> {
        let seq = self.writer.seq.load(Ordering::Relaxed);
        let capacity = self.capacity() as u64;

        if in_flight(seq, self.writer.min_ack.load(Ordering::Relaxed)) >= capacity {
            let behind = self
                .readers
                .iter()
                .map(|pos| in_flight(seq, pos.load(Ordering::Acquire)))
                .max()
                .unwrap_or(0);
            let min_ack = seq.wrapping_sub(behind);
            self.writer.min_ack.store(min_ack, Ordering::Relaxed);
            if behind >= capacity {
                return None;
            }
        }
        Some(seq)
    }

    /// Writer side: publishes `msg` to every reader without blocking.
    pub fn try_send(&self, msg: &Message) -> Result<()> {
        let seq = self.reserve().ok_or(Error::WouldBlock)?;
        self.slot(seq).publish(seq, msg);
        self.writer.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        Ok(())
    }

    /// Writer side: publishes `msg`, spinning while the slowest reader lags a full ring.
    pub fn send(&self, msg: &Message, spin: &SpinPolicy) -> Result<()> {
        spin.retry(|| self.try_send(msg))
    }

    /// Reader side: takes the next message for `reader_id` without blocking.
    pub fn try_recv(&self, reader_id: usize) -> Result<Message> {
        let pos = self.reader(reader_id)?;
        let seq = pos.load(Ordering::Relaxed);
        let msg = self.slot(seq).take(seq).ok_or(Error::QueueEmpty)?;
        pos.store(seq.wrapping_add(1), Ordering::Release);
        Ok(msg)
    }

    /// Reader side: spins until the next message for `reader_id` arrives.
    pub fn recv(&self, reader_id: usize, spin: &SpinPolicy) -> Result<Message> {
        spin.retry(|| self.try_recv(reader_id))
    }

    /// Reader side: whether a message is waiting for `reader_id`.
    pub fn can_recv(&self, reader_id: usize) -> bool {
        self.reader(reader_id)
            .map(|pos| {
                let seq = pos.load(Ordering::Relaxed);
                self.slot(seq).is_ready(seq)
            })
            .unwrap_or(false)
    }

    /// Writer side: whether `try_send` would succeed now.
    pub fn can_send(&self) -> bool {
        self.reserve().is_some()
    }
}

impl core::fmt::Debug for ClusterQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ClusterQueue")
            .field("capacity", &self.capacity())
            .field("readers", &self.num_readers())
            .finish()
    }
}

/// Round-gated atomic reduction shared by one cluster.
pub struct ClusterReduction {
    lanes: [CachePadded<AtomicU64>; ReduceOp::ALL.len()],
    counter: CachePadded<AtomicU64>,
    round: CachePadded<AtomicU8>,
    /// Next round each member may contribute to. Written only by that member.
    expected: Vec<CachePadded<AtomicU8>>,
}

impl ClusterReduction {
    /// Creates the reduction state for `num_members` contributors.
    pub fn new(num_members: usize) -> Self {
        Self {
            lanes: core::array::from_fn(|lane| {
                CachePadded::new(AtomicU64::new(ReduceOp::ALL[lane].identity()))
            }),
            counter: CachePadded::new(AtomicU64::new(0)),
            round: CachePadded::new(AtomicU8::new(0)),
            expected: (0..num_members)
                .map(|_| CachePadded::new(AtomicU8::new(0)))
                .collect(),
        }
    }

    /// Number of contributors per round (the coordinator excluded).
    pub fn num_members(&self) -> usize {
        self.expected.len()
    }

    /// Current round, as published by the coordinator.
    pub fn round(&self) -> u8 {
        self.round.load(Ordering::Acquire)
    }

    /// Member side: folds `value` into this round's aggregate.
    ///
    /// Spins until the coordinator has opened the member's next round.
    pub fn contribute(
        &self,
        reader_id: usize,
        value: Word,
        op: ReduceOp,
        spin: &SpinPolicy,
    ) -> Result<()> {
        let expected = self
            .expected
            .get(reader_id)
            .ok_or(Error::UnknownCore(reader_id))?;
        let round = expected.load(Ordering::Relaxed);

        spin.wait_eq_u8(&self.round, round);
        op.fetch_combine(&self.lanes[op.lane()], value, Ordering::AcqRel);
        self.counter.fetch_add(1, Ordering::Release);
        expected.store(round.wrapping_add(1), Ordering::Relaxed);
        Ok(())
    }

    /// Coordinator side: waits for every member, drains the aggregate and
    /// opens the next round.
    pub fn collect(&self, op: ReduceOp, spin: &SpinPolicy) -> Word {
        spin.wait_eq_u64(&self.counter, self.num_members() as u64);

        let value = self.lanes[op.lane()].swap(op.identity(), Ordering::AcqRel);
        self.counter.store(0, Ordering::Relaxed);
        let round = self.round.load(Ordering::Relaxed);
        self.round.store(round.wrapping_add(1), Ordering::Release);
        value
    }
}

impl core::fmt::Debug for ClusterReduction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ClusterReduction")
            .field("members", &self.num_members())
            .field("round", &self.round())
            .finish()
    }
}

/// A coordinator, its members and their shared region.
#[derive(Debug)]
pub struct Cluster {
    id: ClusterId,
    coordinator: CoreId,
    members: Vec<CoreId>,
    queue: ClusterQueue,
    reduction: NumaBox<ClusterReduction>,
}

impl Cluster {
    /// Allocates the cluster region on the coordinator's node.
    ///
    /// Reader ids are assigned in core-id order.
    pub fn new(
        id: ClusterId,
        coordinator: CoreId,
        mut members: Vec<CoreId>,
        capacity: usize,
        platform: &Arc<dyn Platform>,
    ) -> Result<Self> {
        members.sort_unstable();
        members.dedup();

        let node = platform.node_of_core(coordinator);
        let queue = ClusterQueue::new(capacity, members.len(), node, Arc::clone(platform))?;
        let reduction =
            NumaBox::new_on_node(ClusterReduction::new(members.len()), node, Arc::clone(platform))
                .map_err(placement_error(core::mem::size_of::<ClusterReduction>()))?;

        tracing::debug!(
            cluster = id,
            coordinator,
            members = ?members,
            node = node.0,
            "shared-memory cluster initialised"
        );

        Ok(Self {
            id,
            coordinator,
            members,
            queue,
            reduction,
        })
    }

    /// Cluster id within its model.
    pub fn id(&self) -> ClusterId {
        self.id
    }

    /// The coordinator core.
    pub fn coordinator(&self) -> CoreId {
        self.coordinator
    }

    /// Member cores in reader-id order.
    pub fn members(&self) -> &[CoreId] {
        &self.members
    }

    /// Reader id of `core`, if it is a member.
    pub fn reader_id(&self, core: CoreId) -> Option<usize> {
        self.members.binary_search(&core).ok()
    }

    /// The shared message queue.
    pub fn queue(&self) -> &ClusterQueue {
        &self.queue
    }

    /// The shared reduction state.
    pub fn reduction(&self) -> &ClusterReduction {
        &self.reduction
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numa::HeapPlatform;

    fn platform() -> Arc<dyn Platform> {
        Arc::new(HeapPlatform::new())
    }

    #[test]
    fn test_reader_ids_follow_core_order() {
        let cluster = Cluster::new(0, 4, vec![9, 5, 7], 8, &platform()).unwrap();
        assert_eq!(cluster.members(), &[5, 7, 9]);
        assert_eq!(cluster.reader_id(5), Some(0));
        assert_eq!(cluster.reader_id(9), Some(2));
        assert_eq!(cluster.reader_id(4), None);
    }

    #[test]
    fn test_oversized_queue_is_rejected() {
        assert!(matches!(
            ClusterQueue::new(1 << 58, 2, NodeId(0), platform()),
            Err(Error::InvalidCapacity(c)) if c == 1 << 58
        ));
        assert!(matches!(
            Cluster::new(0, 4, vec![5, 7], 1 << 60, &platform()),
            Err(Error::InvalidCapacity(_))
        ));
    }

    #[test]
    fn test_every_reader_sees_every_message() {
        let queue = ClusterQueue::new(4, 2, NodeId(0), platform()).unwrap();
        for i in 0..4 {
            queue.try_send(&Message::word_message(i)).unwrap();
        }
        assert!(matches!(
            queue.try_send(&Message::word_message(4)),
            Err(Error::WouldBlock)
        ));

        for i in 0..4 {
            assert_eq!(queue.try_recv(0).unwrap().word(0), i);
        }
        // Reader 1 has not consumed anything; the ring is still full.
        assert!(!queue.can_send());

        assert_eq!(queue.try_recv(1).unwrap().word(0), 0);
        queue.try_send(&Message::word_message(4)).unwrap();
        assert_eq!(queue.try_recv(0).unwrap().word(0), 4);
        assert!(matches!(queue.try_recv(0), Err(Error::QueueEmpty)));
        assert!(matches!(queue.try_recv(2), Err(Error::UnknownCore(2))));
    }

    #[test]
    fn test_reduction_rounds_are_isolated() {
        const K: usize = 6;
        let cluster = Arc::new(Cluster::new(0, 0, (1..=K).collect(), 8, &platform()).unwrap());
        let spin = SpinPolicy::yielding(32);

        let handles: Vec<_> = (1..=K)
            .map(|core| {
                let cluster = Arc::clone(&cluster);
                std::thread::spawn(move || {
                    let reader = cluster.reader_id(core).unwrap();
                    let reduction = cluster.reduction();
                    reduction.contribute(reader, 1, ReduceOp::Sum, &spin).unwrap();
                    reduction.contribute(reader, 2, ReduceOp::Sum, &spin).unwrap();
                })
            })
            .collect();

        let reduction = cluster.reduction();
        assert_eq!(reduction.collect(ReduceOp::Sum, &spin), K as Word);
        assert_eq!(reduction.collect(ReduceOp::Sum, &spin), 2 * K as Word);

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(reduction.round(), 2);
    }

    #[test]
    fn test_min_lane_resets_to_identity() {
        let reduction = ClusterReduction::new(2);
        let spin = SpinPolicy::busy();

        reduction.contribute(0, 9, ReduceOp::Min, &spin).unwrap();
        reduction.contribute(1, 4, ReduceOp::Min, &spin).unwrap();
        assert_eq!(reduction.collect(ReduceOp::Min, &spin), 4);

        reduction.contribute(0, 30, ReduceOp::Min, &spin).unwrap();
        reduction.contribute(1, 12, ReduceOp::Min, &spin).unwrap();
        assert_eq!(reduction.collect(ReduceOp::Min, &spin), 12);
    }

    #[test]
    fn test_round_counter_wraps() {
        let reduction = ClusterReduction::new(1);
        let spin = SpinPolicy::busy();
        for i in 0..300u64 {
            reduction.contribute(0, i, ReduceOp::Max, &spin).unwrap();
            assert_eq!(reduction.collect(ReduceOp::Max, &spin), i);
        }
        assert_eq!(reduction.round(), (300 % 256) as u8);
    }
}
