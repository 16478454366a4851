//! Conditional Synchronization Primitives
//!
//! Every atomic used by the transports is imported from this module so the
//! same code runs on `core` atomics in production and on Loom's model-checked
//! atomics under test.
//!
//! # Loom Integration
//!
//! ```bash
//! RUSTFLAGS="--cfg loom" cargo test --features loom --test loom_verification
//! ```
//!
//! # Spinning
//!
//! Collectives never sleep. A blocked `recv`/`send` polls shared state through
//! [`SpinPolicy`], which is the single place where the hot loop relaxes the
//! CPU, optionally yields (oversubscribed hosts, cycle-accurate simulators),
//! and hands control back to Loom's scheduler during model checking.

use crate::Result;

#[cfg(all(feature = "loom", loom))]
pub mod atomic {
    //! Atomic types for Loom model checking.

    pub use loom::sync::atomic::{fence, AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
}

#[cfg(not(all(feature = "loom", loom)))]
pub mod atomic {
    //! Zero-cost re-exports from `core::sync::atomic`.

    pub use core::sync::atomic::{fence, AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
}

#[cfg(all(feature = "loom", loom))]
pub mod thread {
    //! Loom thread primitives for model checking.

    pub use loom::thread::{spawn, yield_now, JoinHandle};
}

#[cfg(not(all(feature = "loom", loom)))]
pub mod thread {
    //! Standard library thread primitives.

    pub use std::thread::{spawn, yield_now, JoinHandle};
}

use atomic::{AtomicU64, AtomicU8, Ordering};

/// How a blocked participant waits for shared state to change.
///
/// The default is a pure busy poll with `spin_loop` hints, which is what a
/// pinned one-thread-per-core deployment wants. `yielding(n)` additionally
/// gives up the time slice every `n` polls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpinPolicy {
    yield_every: Option<u32>,
}

impl SpinPolicy {
    /// Pure busy polling.
    pub const fn busy() -> Self {
        Self { yield_every: None }
    }

    /// Busy polling with a voluntary yield every `every` polls.
    pub const fn yielding(every: u32) -> Self {
        let every = if every == 0 { 1 } else { every };
        Self {
            yield_every: Some(every),
        }
    }

    /// Builds a policy from an optional yield interval.
    pub const fn from_interval(interval: Option<u32>) -> Self {
        match interval {
            Some(every) => Self::yielding(every),
            None => Self::busy(),
        }
    }

    /// Returns the yield interval, if any.
    pub fn yield_interval(&self) -> Option<u32> {
        self.yield_every
    }

    /// Polls `ready` until it returns `true`.
    #[inline]
    pub fn wait_until(&self, mut ready: impl FnMut() -> bool) {
        let mut polls = 0u32;
        while !ready() {
            self.relax(&mut polls);
        }
    }

    /// Spins until `value` holds `expected` (acquire load).
    #[inline]
    pub fn wait_eq_u64(&self, value: &AtomicU64, expected: u64) {
        self.wait_until(|| value.load(Ordering::Acquire) == expected);
    }

    /// Spins until `value` holds `expected` (acquire load).
    #[inline]
    pub fn wait_eq_u8(&self, value: &AtomicU8, expected: u8) {
        self.wait_until(|| value.load(Ordering::Acquire) == expected);
    }

    /// Re-runs `op` for as long as it fails with a transient error.
    ///
    /// This is how every blocking transport call is built from its `try_`
    /// counterpart; `WouldBlock` and `QueueEmpty` never leave this loop.
    #[inline]
    pub fn retry<T>(&self, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let mut polls = 0u32;
        loop {
            match op() {
                Err(err) if err.is_transient() => self.relax(&mut polls),
                other => return other,
            }
        }
    }

    #[inline]
    fn relax(&self, polls: &mut u32) {
        #[cfg(all(feature = "loom", loom))]
        {
            let _ = polls;
            thread::yield_now();
        }

        #[cfg(not(all(feature = "loom", loom)))]
        {
            core::hint::spin_loop();
            if let Some(every) = self.yield_every {
                *polls += 1;
                if *polls >= every {
                    *polls = 0;
                    thread::yield_now();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::atomic::{AtomicU64, Ordering};
    use super::*;
    use crate::Error;
    use std::sync::Arc;

    #[test]
    fn test_yield_interval_never_zero() {
        assert_eq!(SpinPolicy::yielding(0).yield_interval(), Some(1));
        assert_eq!(SpinPolicy::from_interval(None), SpinPolicy::busy());
    }

    #[test]
    fn test_retry_passes_through_fatal_errors() {
        let mut attempts = 0;
        let result: Result<()> = SpinPolicy::busy().retry(|| {
            attempts += 1;
            if attempts < 3 {
                Err(Error::WouldBlock)
            } else {
                Err(Error::UnknownCore(7))
            }
        });

        assert_eq!(attempts, 3);
        assert!(matches!(result, Err(Error::UnknownCore(7))));
    }

    #[test]
    fn test_wait_observes_other_thread() {
        let flag = Arc::new(AtomicU64::new(0));
        let setter = Arc::clone(&flag);

        let handle = std::thread::spawn(move || setter.store(42, Ordering::Release));

        SpinPolicy::yielding(16).wait_eq_u64(&flag, 42);
        handle.join().unwrap();
    }
}
