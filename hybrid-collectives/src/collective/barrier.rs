//! Barriers.
//!
//! Two flavours:
//!
//! - [`tree_barrier`]: reduce of the caller's invocation counter followed by a
//!   broadcast of the root's counter; runs over whatever transports the
//!   topology uses
//! - [`ShmBarrierArena`]: a topology-independent counting barrier on a small
//!   ring of atomic round slots, used around topology switches

use crossbeam_utils::CachePadded;

use super::{broadcast, reduce, Endpoint, ReduceOp};
use crate::config::SHM_BARRIER_ROUNDS;
use crate::message::{Message, Word};
use crate::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use crate::sync::SpinPolicy;
use crate::{CoreId, Error, Result};

/// Tree barrier. `counter` is the caller's invocation count and is advanced
/// before the round starts; returns the round observed from the root.
pub(crate) fn tree_barrier(ep: &Endpoint<'_>, counter: &AtomicU64) -> Result<Word> {
    let round = counter.load(Ordering::Relaxed).wrapping_add(1);
    counter.store(round, Ordering::Relaxed);

    if let Some(sum) = reduce(ep, round, ReduceOp::Sum)? {
        debug_assert_eq!(
            sum,
            round.wrapping_mul(ep.topology.num_nodes() as Word),
            "participants disagree on the barrier round"
        );
    }

    let mut msg = Message::word_message(round);
    broadcast(ep, &mut msg)?;
    let observed = msg.word(0);
    debug_assert_eq!(observed, round, "core {} is out of step", ep.core);

    tracing::trace!(core = ep.core, round = observed, "barrier passed");
    Ok(observed)
}

/// Process-wide counting barrier state.
pub(crate) struct ShmBarrierArena {
    rounds: [CachePadded<AtomicU32>; SHM_BARRIER_ROUNDS],
    /// Slot each core arrives at next. Written only by that core.
    local: Vec<CachePadded<AtomicU8>>,
}

impl ShmBarrierArena {
    pub(crate) fn new(num_participants: usize) -> Self {
        Self {
            rounds: core::array::from_fn(|_| CachePadded::new(AtomicU32::new(0))),
            local: (0..num_participants)
                .map(|_| CachePadded::new(AtomicU8::new(0)))
                .collect(),
        }
    }

    pub(crate) fn num_participants(&self) -> usize {
        self.local.len()
    }

    /// Blocks `core` until all participants have arrived at the same slot.
    ///
    /// Core 0 clears the slot of the previous round: every participant has
    /// left it once anyone has arrived at the current one, and the slot is
    /// not reused for another `SHM_BARRIER_ROUNDS - 1` rounds.
    pub(crate) fn wait(&self, core: CoreId, spin: &SpinPolicy) -> Result<()> {
        let local = self.local.get(core).ok_or(Error::UnknownCore(core))?;
        let slot = local.load(Ordering::Relaxed) as usize;
        let total = self.num_participants() as u32;

        self.rounds[slot].fetch_add(1, Ordering::AcqRel);
        spin.wait_until(|| self.rounds[slot].load(Ordering::Acquire) >= total);

        if core == 0 {
            let previous = (slot + SHM_BARRIER_ROUNDS - 1) % SHM_BARRIER_ROUNDS;
            self.rounds[previous].store(0, Ordering::Release);
        }
        local.store(((slot + 1) % SHM_BARRIER_ROUNDS) as u8, Ordering::Relaxed);
        Ok(())
    }
}

impl core::fmt::Debug for ShmBarrierArena {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ShmBarrierArena")
            .field("participants", &self.num_participants())
            .finish()
    }
}
