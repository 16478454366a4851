//! Compile-time constants and runtime configuration.

use serde::Deserialize;

use crate::sync::SpinPolicy;
use crate::{Error, Result};

/// Cache line size for alignment
pub const CACHE_LINE_SIZE: usize = 64;

/// Payload words carried by one message (one cache line minus the control word)
pub const MAX_PAYLOAD_WORDS: usize = 7;

/// Maximum number of shared-memory clusters in one model
pub const MAX_CLUSTERS: usize = 20;

/// Slots in the process-wide shared-memory barrier round array
pub const SHM_BARRIER_ROUNDS: usize = 8;

/// Model cell marking the column as the row's parent
pub const MODEL_PARENT: u16 = 99;

/// Largest child order a model cell may encode
pub const MODEL_CHILD_MAX: u16 = 49;

/// First model cell value marking cluster membership (row is a member)
pub const SHM_MEMBER_START: u16 = 50;

/// First model cell value marking cluster coordination (row is the coordinator)
pub const SHM_COORDINATOR_START: u16 = SHM_MEMBER_START + MAX_CLUSTERS as u16;

/// One past the last coordinator value
pub const SHM_COORDINATOR_END: u16 = SHM_COORDINATOR_START + MAX_CLUSTERS as u16;

/// Runtime configuration of an [`Instance`](crate::Instance).
///
/// ```rust
/// use hybrid_collectives::Config;
///
/// let cfg = Config::from_json_str(r#"{ "queue_slots": 128, "eager_connect": true }"#).unwrap();
/// assert_eq!(cfg.queue_slots, 128);
/// assert_eq!(cfg.cluster_slots, 64);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Slots per direction of every message-passing queue pair.
    /// Must be a power of two. Default: 64.
    pub queue_slots: usize,

    /// Slots of every shared-memory cluster queue. Must be a power of two.
    /// Default: 64 (one 4 KiB page of cache lines).
    pub cluster_slots: usize,

    /// Connect every ordered core pair at context creation instead of only
    /// the tree and sequentializer edges. Default: false.
    pub eager_connect: bool,

    /// Yield the time slice every this many polls while spinning.
    /// `None` spins without yielding. Default: `None`.
    pub spin_yield_interval: Option<u32>,

    /// Pin each thread started by [`Context::run`](crate::Context::run)
    /// to the hardware core with the same id. Default: false.
    pub pin_threads: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue_slots: 64,
            cluster_slots: 64,
            eager_connect: false,
            spin_yield_interval: None,
            pin_threads: false,
        }
    }
}

impl Config {
    /// Parses a JSON document; missing fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<()> {
        for (name, slots) in [
            ("queue_slots", self.queue_slots),
            ("cluster_slots", self.cluster_slots),
        ] {
            if slots == 0 || !slots.is_power_of_two() {
                return Err(Error::InvalidConfig(format!(
                    "{name} must be a non-zero power of two, got {slots}"
                )));
            }
        }

        if self.spin_yield_interval == Some(0) {
            return Err(Error::InvalidConfig(
                "spin_yield_interval must be positive".into(),
            ));
        }

        Ok(())
    }

    /// Spin policy derived from `spin_yield_interval`.
    pub fn spin_policy(&self) -> SpinPolicy {
        SpinPolicy::from_interval(self.spin_yield_interval)
    }
}
