//! Hybrid Transport Layer
//!
//! Two channel kinds share one slot format:
//!
//! - [`QueuePair`]: two single-producer/single-consumer rings, one per
//!   direction, for message passing between any two cores
//! - [`Cluster`]: a coordinator-owned region holding a one-writer/many-reader
//!   ring plus the atomic lanes of the cluster reduction
//!
//! # Slot Format
//!
//! ```text
//! ┌──────────────┬────────┬────────┬─────┬────────┐
//! │ ctrl: u64    │ word 0 │ word 1 │ ... │ word 6 │   64 bytes
//! │ stamp<<3|len │        │        │     │        │
//! └──────────────┴────────┴────────┴─────┴────────┘
//! ```
//!
//! `stamp` is the producer's sequence number plus one, so the zeroed slot of
//! a fresh ring never matches. The payload is written first and the control
//! word is published with `Release`; a reader that observes its expected
//! stamp with `Acquire` therefore sees the whole payload.

mod cluster;
mod queue;

pub use cluster::{Cluster, ClusterQueue, ClusterReduction};
pub use queue::{QueuePair, Ring};

use crate::config::MAX_PAYLOAD_WORDS;
use crate::message::{Message, Word};
use crate::numa::NumaError;
use crate::sync::atomic::{AtomicU64, Ordering};

/// One cache line: control word and payload.
#[repr(C, align(64))]
pub(crate) struct Slot {
    ctrl: AtomicU64,
    words: [AtomicU64; MAX_PAYLOAD_WORDS],
}

#[cfg(not(loom))]
const _: () = assert!(core::mem::size_of::<Slot>() == crate::config::CACHE_LINE_SIZE);

impl Slot {
    pub(crate) fn new() -> Self {
        Self {
            ctrl: AtomicU64::new(0),
            words: core::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    #[inline]
    fn ctrl_for(seq: u64, len: usize) -> u64 {
        (seq.wrapping_add(1) << 3) | len as u64
    }

    /// Writes `msg` as sequence number `seq`.
    #[inline]
    pub(crate) fn publish(&self, seq: u64, msg: &Message) {
        let raw = msg.raw_words();
        for (cell, word) in self.words.iter().zip(raw.iter()).take(msg.len()) {
            cell.store(*word, Ordering::Relaxed);
        }
        self.ctrl
            .store(Self::ctrl_for(seq, msg.len()), Ordering::Release);
    }

    /// Reads sequence number `seq` if it has been published.
    #[inline]
    pub(crate) fn take(&self, seq: u64) -> Option<Message> {
        let ctrl = self.ctrl.load(Ordering::Acquire);
        if ctrl & !0b111 != Self::ctrl_for(seq, 0) {
            return None;
        }

        let len = (ctrl & 0b111) as usize;
        let mut words: [Word; MAX_PAYLOAD_WORDS] = [0; MAX_PAYLOAD_WORDS];
        for (word, cell) in words.iter_mut().zip(self.words.iter()).take(len) {
            *word = cell.load(Ordering::Relaxed);
        }
        Some(Message::from_raw(words, len))
    }

    /// Whether sequence number `seq` has been published.
    #[inline]
    pub(crate) fn is_ready(&self, seq: u64) -> bool {
        self.ctrl.load(Ordering::Acquire) & !0b111 == Self::ctrl_for(seq, 0)
    }
}

/// Returns the bytes occupied by `capacity` slots. Rejects capacities that
/// are zero, not a power of two, or too large to address.
pub(crate) fn slot_bytes(capacity: usize) -> crate::Result<usize> {
    if capacity == 0 || !capacity.is_power_of_two() {
        return Err(crate::Error::InvalidCapacity(capacity));
    }
    capacity
        .checked_mul(core::mem::size_of::<Slot>())
        .filter(|&bytes| bytes <= isize::MAX as usize)
        .ok_or(crate::Error::InvalidCapacity(capacity))
}

/// Maps a placement failure of a `bytes`-sized region. Exhaustion becomes
/// [`Error::AllocationFailed`](crate::Error::AllocationFailed); node errors
/// pass through.
pub(crate) fn placement_error(bytes: usize) -> impl FnOnce(NumaError) -> crate::Error {
    move |err| match err {
        NumaError::AllocationFailed(_) => crate::Error::AllocationFailed { bytes },
        other => crate::Error::Numa(other),
    }
}
