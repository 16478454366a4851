//! Lock-free SPSC rings and queue pairs.
//!
//! # Flow Control
//!
//! The producer owns a wrapping sequence number and a cached copy of the
//! consumer's acknowledgement. It only reads the consumer's cache line when
//! the cached view says the ring is full:
//!
//! ```text
//! in_flight = seq.wrapping_sub(last_ack)
//! if in_flight == capacity:
//!     last_ack = consumed.load(Acquire)     // one remote read
//!     still full -> WouldBlock
//! ```
//!
//! The consumer publishes `consumed` with `Release` after copying each
//! payload, which is what makes the producer's reuse of that slot safe.

use std::sync::Arc;

use crossbeam_utils::CachePadded;

use super::{placement_error, slot_bytes, Slot};
use crate::message::Message;
use crate::numa::{NodeId, NumaSlice, Platform};
use crate::sync::atomic::{AtomicU64, Ordering};
use crate::sync::SpinPolicy;
use crate::{CoreId, Error, Result};

/// Messages sent but not yet acknowledged. Correct across wraparound.
#[inline]
pub(crate) fn in_flight(seq: u64, last_ack: u64) -> u64 {
    seq.wrapping_sub(last_ack)
}

/// Producer-local state, on its own cache line.
#[derive(Debug)]
struct ProducerState {
    seq: AtomicU64,
    last_ack: AtomicU64,
}

/// A fixed-capacity single-producer/single-consumer ring.
///
/// Exactly one thread may send and one thread may receive at a time; the
/// [`Participant`](crate::Participant) claim enforces this for rings owned by
/// a context. Violating it corrupts message order, never memory.
pub struct Ring {
    slots: NumaSlice<Slot>,
    mask: u64,
    producer: CachePadded<ProducerState>,
    /// Count of received messages; the consumer's acknowledgement.
    consumed: CachePadded<AtomicU64>,
}

impl Ring {
    /// Allocates a ring of `capacity` slots on `node`.
    pub fn new(capacity: usize, node: NodeId, platform: Arc<dyn Platform>) -> Result<Self> {
        let bytes = slot_bytes(capacity)?;
        let slots = NumaSlice::from_fn_on_node(capacity, node, platform, |_| Slot::new())
            .map_err(placement_error(bytes))?;

        Ok(Self {
            slots,
            mask: capacity as u64 - 1,
            producer: CachePadded::new(ProducerState {
                seq: AtomicU64::new(0),
                last_ack: AtomicU64::new(0),
            }),
            consumed: CachePadded::new(AtomicU64::new(0)),
        })
    }

    /// Number of slots.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Node the slots live on.
    pub fn node(&self) -> NodeId {
        self.slots.node()
    }

    #[inline]
    fn slot(&self, seq: u64) -> &Slot {
        &self.slots[(seq & self.mask) as usize]
    }

    /// Producer side: refreshes the acknowledgement if the cached view is full
    /// and returns the sequence number to write, or `None` when full.
    #[inline]
    fn reserve(&self) -> Option<u64> {
        let seq = self.producer.seq.load(Ordering::Relaxed);
        let capacity = self.capacity() as u64;

        if in_flight(seq, self.producer.last_ack.load(Ordering::Relaxed)) >= capacity {
            let ack = self.consumed.load(Ordering::Acquire);
            self.producer.last_ack.store(ack, Ordering::Relaxed);
            if in_flight(seq, ack) >= capacity {
                return None;
            }
        }
        Some(seq)
    }

    /// Sends without blocking; `WouldBlock` when `capacity` messages are unacknowledged.
    pub fn try_send(&self, msg: &Message) -> Result<()> {
        let seq = self.reserve().ok_or(Error::WouldBlock)?;
        self.slot(seq).publish(seq, msg);
        self.producer
            .seq
            .store(seq.wrapping_add(1), Ordering::Relaxed);
        Ok(())
    }

    /// Sends, spinning while the ring is full.
    pub fn send(&self, msg: &Message, spin: &SpinPolicy) -> Result<()> {
        spin.retry(|| self.try_send(msg))
    }

    /// Receives without blocking; `QueueEmpty` when nothing new was posted.
    pub fn try_recv(&self) -> Result<Message> {
        let seq = self.consumed.load(Ordering::Relaxed);
        let msg = self.slot(seq).take(seq).ok_or(Error::QueueEmpty)?;
        self.consumed
            .store(seq.wrapping_add(1), Ordering::Release);
        Ok(msg)
    }

    /// Receives, spinning until a message arrives.
    pub fn recv(&self, spin: &SpinPolicy) -> Result<Message> {
        spin.retry(|| self.try_recv())
    }

    /// Sends a zero-payload message.
    pub fn notify(&self, spin: &SpinPolicy) -> Result<()> {
        self.send(&Message::notification(), spin)
    }

    /// Producer side: whether `try_send` would succeed now.
    pub fn can_send(&self) -> bool {
        self.reserve().is_some()
    }

    /// Consumer side: whether `try_recv` would succeed now.
    pub fn can_recv(&self) -> bool {
        let seq = self.consumed.load(Ordering::Relaxed);
        self.slot(seq).is_ready(seq)
    }

    /// Producer side: unacknowledged messages as last observed.
    pub fn in_flight(&self) -> usize {
        in_flight(
            self.producer.seq.load(Ordering::Relaxed),
            self.producer.last_ack.load(Ordering::Relaxed),
        ) as usize
    }
}

impl core::fmt::Debug for Ring {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Ring")
            .field("capacity", &self.capacity())
            .field("node", &self.node())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Two rings between cores `a` and `b`, each on its consumer's node.
#[derive(Debug)]
pub struct QueuePair {
    a: CoreId,
    b: CoreId,
    forward: Ring,
    reverse: Ring,
}

impl QueuePair {
    /// Connects `a` and `b` with rings of `capacity` slots per direction.
    pub fn new(a: CoreId, b: CoreId, capacity: usize, platform: &Arc<dyn Platform>) -> Result<Self> {
        let forward = Ring::new(capacity, platform.node_of_core(b), Arc::clone(platform))?;
        let reverse = Ring::new(capacity, platform.node_of_core(a), Arc::clone(platform))?;
        tracing::trace!(a, b, capacity, "queue pair connected");
        Ok(Self {
            a,
            b,
            forward,
            reverse,
        })
    }

    /// The two cores.
    pub fn endpoints(&self) -> (CoreId, CoreId) {
        (self.a, self.b)
    }

    /// The ring `sender` writes to.
    pub fn tx(&self, sender: CoreId) -> Option<&Ring> {
        match sender {
            s if s == self.a => Some(&self.forward),
            s if s == self.b => Some(&self.reverse),
            _ => None,
        }
    }

    /// The ring `receiver` reads from.
    pub fn rx(&self, receiver: CoreId) -> Option<&Ring> {
        match receiver {
            r if r == self.b => Some(&self.forward),
            r if r == self.a => Some(&self.reverse),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numa::{HeapPlatform, NumaError};

    fn ring(capacity: usize) -> Ring {
        Ring::new(capacity, NodeId(0), Arc::new(HeapPlatform::new())).unwrap()
    }

    #[test]
    fn test_fifo_interleaved() {
        let ring = ring(4);
        let mut next_expected = 0;

        for round in 0..10u64 {
            for i in 0..3 {
                ring.try_send(&Message::word_message(round * 3 + i)).unwrap();
            }
            for _ in 0..3 {
                assert_eq!(ring.try_recv().unwrap().word(0), next_expected);
                next_expected += 1;
            }
        }
        assert!(matches!(ring.try_recv(), Err(Error::QueueEmpty)));
    }

    #[test]
    fn test_backpressure() {
        let ring = ring(8);
        for i in 0..8 {
            assert!(ring.can_send());
            ring.try_send(&Message::word_message(i)).unwrap();
        }

        assert!(!ring.can_send());
        assert!(matches!(
            ring.try_send(&Message::word_message(8)),
            Err(Error::WouldBlock)
        ));

        assert_eq!(ring.try_recv().unwrap().word(0), 0);
        ring.try_send(&Message::word_message(8)).unwrap();

        let rest: Vec<_> = (0..8).map(|_| ring.try_recv().unwrap().word(0)).collect();
        assert_eq!(rest, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_in_flight_wraps() {
        assert_eq!(in_flight(3, u64::MAX - 1), 5);
        assert_eq!(in_flight(0, u64::MAX), 1);
        assert_eq!(in_flight(7, 7), 0);
    }

    #[test]
    fn test_invalid_capacity() {
        let platform: Arc<dyn Platform> = Arc::new(HeapPlatform::new());
        assert!(matches!(
            Ring::new(12, NodeId(0), Arc::clone(&platform)),
            Err(Error::InvalidCapacity(12))
        ));
        assert!(matches!(
            Ring::new(1 << 58, NodeId(0), Arc::clone(&platform)),
            Err(Error::InvalidCapacity(c)) if c == 1 << 58
        ));
        assert!(matches!(
            Ring::new(4, NodeId(3), platform),
            Err(Error::Numa(NumaError::InvalidNode(3)))
        ));
    }

    #[test]
    fn test_notification_and_can_recv() {
        let ring = ring(2);
        assert!(!ring.can_recv());
        ring.notify(&SpinPolicy::busy()).unwrap();
        assert!(ring.can_recv());
        assert!(ring.try_recv().unwrap().is_notification());
    }

    #[test]
    fn test_queue_pair_directions() {
        let platform: Arc<dyn Platform> = Arc::new(HeapPlatform::new());
        let pair = QueuePair::new(1, 3, 4, &platform).unwrap();

        pair.tx(1).unwrap().try_send(&Message::word_message(13)).unwrap();
        pair.tx(3).unwrap().try_send(&Message::word_message(31)).unwrap();

        assert_eq!(pair.rx(3).unwrap().try_recv().unwrap().word(0), 13);
        assert_eq!(pair.rx(1).unwrap().try_recv().unwrap().word(0), 31);
        assert!(pair.tx(2).is_none());
        assert_eq!(pair.endpoints(), (1, 3));
    }

    #[test]
    fn test_threaded_stream() {
        const COUNT: u64 = 20_000;
        let ring = Arc::new(ring(16));
        let producer = Arc::clone(&ring);
        let spin = SpinPolicy::yielding(64);

        let handle = std::thread::spawn(move || {
            for i in 0..COUNT {
                let msg = Message::from_words(&[i, i * 2, !i]).unwrap();
                producer.send(&msg, &spin).unwrap();
            }
        });

        for i in 0..COUNT {
            let msg = ring.recv(&spin).unwrap();
            assert_eq!(msg.words(), &[i, i * 2, !i]);
        }
        handle.join().unwrap();
        assert!(!ring.can_recv());
    }
}
