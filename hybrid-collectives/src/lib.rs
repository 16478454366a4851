//! Hybrid Collectives: Topology-Aware Broadcast, Reduction and Barrier for Many-Core Machines
//!
//! This crate builds an overlay tree across the hardware threads of one machine
//! and runs collective operations over a *hybrid* transport: lock-free
//! point-to-point queues between cores in different NUMA domains, and
//! cache-line ring buffers plus atomic counters inside a shared-memory
//! cluster.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────────────────────┐
//!                 │ Instance (platform, arena)   │
//!                 └──────────────┬───────────────┘
//!                                │ context_create(topology)
//!                 ┌──────────────▼───────────────┐
//!                 │ Context                      │
//!                 │  Topology ─ Roles            │
//!                 │  BindingTable  Clusters      │
//!                 └──────────────┬───────────────┘
//!                                │ participant(core)
//!        ┌───────────────┬───────┴───────┬───────────────┐
//!        ▼               ▼               ▼               ▼
//!   Participant 0   Participant 1   Participant 2   Participant 3
//!   (one pinned thread each: broadcast / reduce / barrier)
//! ```
//!
//! - [`transport`]: SPSC queue pairs and shared-memory clusters
//! - [`topology`]: the overlay tree, model decoding and per-core roles
//! - [`binding`]: the `(sender, receiver)` connection table
//! - [`collective`]: broadcast, reduction and barrier algorithms
//! - [`context`]: the externally visible `Instance` / `Context` / `Participant`
//! - [`numa`]: platform capabilities (placement, pinning, core discovery)
//!
//! # Example
//!
//! ```rust
//! use hybrid_collectives::{Config, Instance, Message, ReduceOp};
//! use hybrid_collectives::numa::HeapPlatform;
//! use std::sync::Arc;
//!
//! let config = Config { spin_yield_interval: Some(64), ..Config::default() };
//! let instance = Instance::new(4, config, Arc::new(HeapPlatform::new())).unwrap();
//! let topology = instance.topology_create(None, "binary").unwrap();
//! let context = instance.context_create(topology).unwrap();
//!
//! let sums = context
//!     .run(|p| {
//!         let mut msg = Message::from_words(&[7]).unwrap();
//!         p.broadcast(&mut msg)?;
//!         let sum = p.reduce(msg.word(0), ReduceOp::Sum)?;
//!         p.barrier()?;
//!         Ok(sum)
//!     })
//!     .unwrap();
//!
//! assert_eq!(sums[0], Some(28));
//! ```
//!
//! # Failure Model
//!
//! There are no timeouts. A participant that never arrives leaves its peers
//! spinning forever; the collectives target fixed-membership HPC runs.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod binding;
pub mod collective;
pub mod config;
pub mod context;
pub mod message;
pub mod numa;
pub mod sync;
pub mod topology;
pub mod transport;

pub use binding::{Binding, BindingTable};
pub use collective::ReduceOp;
pub use config::Config;
pub use context::{Context, Instance, Participant};
pub use message::{Message, Word};
pub use topology::{EdgeKind, Model, Roles, Topology};

use numa::NumaError;

/// Dense identifier of a participating core, `0..num_participants`.
pub type CoreId = usize;

/// Identifier of a shared-memory cluster within one model.
pub type ClusterId = usize;

/// Error types for the hybrid-collectives crate
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The producer has `capacity` unacknowledged messages in flight
    #[error("queue full, send would block")]
    WouldBlock,

    /// No new slot has been posted by the producer
    #[error("queue empty")]
    QueueEmpty,

    /// Memory for a transport region could not be obtained
    #[error("memory allocation failed ({bytes} bytes)")]
    AllocationFailed {
        /// Requested size
        bytes: usize,
    },

    /// The topology model or participant count is inconsistent
    #[error("invalid model: {0}")]
    InvalidModel(String),

    /// Setup did not create a channel for this core pair
    #[error("no channel from core {sender} to core {receiver}")]
    ChannelNotFound {
        /// Sending core
        sender: CoreId,
        /// Receiving core
        receiver: CoreId,
    },

    /// The pair is connected through a shared-memory cluster, which only
    /// carries collective traffic
    #[error("cores {sender} and {receiver} share a cluster, not a point-to-point queue")]
    NotPointToPoint {
        /// Sending core
        sender: CoreId,
        /// Receiving core
        receiver: CoreId,
    },

    /// Ring capacities must be non-zero powers of two
    #[error("capacity {0} is not a non-zero power of two")]
    InvalidCapacity(usize),

    /// The core id is outside the topology
    #[error("core {0} is not part of this topology")]
    UnknownCore(CoreId),

    /// Another handle already drives this core
    #[error("core {0} already has an active participant")]
    ParticipantClaimed(CoreId),

    /// A message carries at most `MAX_PAYLOAD_WORDS` words
    #[error("payload of {0} words exceeds the {max} word limit", max = config::MAX_PAYLOAD_WORDS)]
    PayloadTooLarge(usize),

    /// A runtime configuration value is out of range
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Platform layer failure
    #[error(transparent)]
    Numa(#[from] NumaError),

    /// Reading a model or configuration file failed
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A model or configuration document is malformed
    #[error("malformed document: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns whether a retry of the same operation may succeed.
    ///
    /// Blocking wrappers spin on exactly these errors.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::WouldBlock | Error::QueueEmpty)
    }
}

/// Result type for hybrid-collectives operations
pub type Result<T> = core::result::Result<T, Error>;
