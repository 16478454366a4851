//! Instances, contexts and participants.
//!
//! ```text
//! Instance ──owns──► platform, config, SHM barrier arena, active slot
//!    │
//!    └─ context_create(topology) ──► Arc<Context>
//!                                      │  topology, bindings, clusters
//!                                      └─ participant(core) ──► Participant
//! ```
//!
//! A [`Participant`] is the only way to drive a core. Each core can be claimed
//! by at most one participant per context at a time, which is what keeps
//! every ring single-producer/single-consumer.

use std::sync::{Arc, Weak};

use crossbeam_utils::CachePadded;
use parking_lot::RwLock;

use crate::binding::BindingTable;
use crate::collective::{self, Endpoint, ReduceOp, ShmBarrierArena};
use crate::config::Config;
use crate::message::{Message, Word};
use crate::numa::{NumaBox, NumaError, NumaPlatform, Platform};
use crate::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use crate::sync::SpinPolicy;
use crate::topology::{Model, Topology};
use crate::transport::placement_error;
use crate::{CoreId, Error, Result};

struct InstanceShared {
    platform: Arc<dyn Platform>,
    config: Config,
    num_participants: usize,
    arena: NumaBox<ShmBarrierArena>,
    active: RwLock<Option<Weak<Context>>>,
}

/// The process-wide handle: participant count, platform and shared arena.
#[derive(Clone)]
pub struct Instance {
    shared: Arc<InstanceShared>,
}

impl Instance {
    /// Creates an instance for `num_participants` cores.
    pub fn new(num_participants: usize, config: Config, platform: Arc<dyn Platform>) -> Result<Self> {
        config.validate()?;
        if num_participants == 0 {
            return Err(Error::InvalidModel("an instance needs at least one participant".into()));
        }

        let available = platform.num_available_cores();
        if num_participants > available {
            tracing::warn!(
                participants = num_participants,
                available,
                "more participants than cores; spinning collectives will be slow"
            );
        }

        let arena = NumaBox::new_on_node(
            ShmBarrierArena::new(num_participants),
            platform.node_of_core(0),
            Arc::clone(&platform),
        )
        .map_err(placement_error(core::mem::size_of::<ShmBarrierArena>()))?;

        tracing::info!(
            participants = num_participants,
            eager = config.eager_connect,
            queue_slots = config.queue_slots,
            cluster_slots = config.cluster_slots,
            "instance initialised"
        );

        Ok(Self {
            shared: Arc::new(InstanceShared {
                platform,
                config,
                num_participants,
                arena,
                active: RwLock::new(None),
            }),
        })
    }

    /// Creates an instance on the NUMA platform with default configuration.
    pub fn init(num_participants: usize, eager_connect: bool) -> Result<Self> {
        let config = Config {
            eager_connect,
            ..Config::default()
        };
        Self::new(num_participants, config, Arc::new(NumaPlatform::new()))
    }

    /// Number of participating cores.
    pub fn num_participants(&self) -> usize {
        self.shared.num_participants
    }

    /// Runtime configuration.
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// The platform capability set.
    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.shared.platform
    }

    /// Builds a topology from `model`, or the binary tree over all
    /// participants when `model` is `None`.
    pub fn topology_create(&self, model: Option<&Model>, name: &str) -> Result<Topology> {
        match model {
            Some(model) => Topology::build_from_model(model, name),
            None => Topology::build_binary_tree(self.num_participants(), name),
        }
    }

    /// Connects `topology`. The first context created becomes active.
    pub fn context_create(&self, topology: Topology) -> Result<Arc<Context>> {
        if topology.num_nodes() != self.num_participants() {
            return Err(Error::InvalidModel(format!(
                "topology '{}' has {} nodes, instance has {} participants",
                topology.name(),
                topology.num_nodes(),
                self.num_participants()
            )));
        }

        let shared = &self.shared;
        let bindings = BindingTable::connect_all(&topology, &shared.config, &shared.platform)?;
        let n = topology.num_nodes();

        let context = Arc::new(Context {
            instance: Arc::clone(shared),
            spin: shared.config.spin_policy(),
            claims: (0..n).map(|_| CachePadded::new(AtomicBool::new(false))).collect(),
            barrier_counters: (0..n).map(|_| CachePadded::new(AtomicU64::new(0))).collect(),
            topology,
            bindings,
        });

        let mut active = shared.active.write();
        if active.as_ref().and_then(Weak::upgrade).is_none() {
            *active = Some(Arc::downgrade(&context));
            tracing::info!(topology = context.topology.name(), "context activated");
        }
        drop(active);

        Ok(context)
    }

    /// The active context, if it is still alive.
    pub fn active_context(&self) -> Option<Arc<Context>> {
        self.shared.active.read().as_ref().and_then(Weak::upgrade)
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("participants", &self.num_participants())
            .field("config", &self.shared.config)
            .field("platform", &self.shared.platform)
            .finish()
    }
}

/// One connected topology.
pub struct Context {
    instance: Arc<InstanceShared>,
    topology: Topology,
    bindings: BindingTable,
    spin: SpinPolicy,
    claims: Vec<CachePadded<AtomicBool>>,
    barrier_counters: Vec<CachePadded<AtomicU64>>,
}

impl Context {
    /// The topology.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// The connection table.
    pub fn bindings(&self) -> &BindingTable {
        &self.bindings
    }

    /// Number of participating cores.
    pub fn num_participants(&self) -> usize {
        self.topology.num_nodes()
    }

    /// The owning instance.
    pub fn instance(&self) -> Instance {
        Instance {
            shared: Arc::clone(&self.instance),
        }
    }

    /// Whether this is the instance's active context.
    pub fn is_active(&self) -> bool {
        self.instance
            .active
            .read()
            .as_ref()
            .is_some_and(|weak| core::ptr::eq(weak.as_ptr(), self))
    }

    /// Makes this the instance's active context.
    pub fn activate(self: &Arc<Self>) {
        *self.instance.active.write() = Some(Arc::downgrade(self));
        tracing::info!(topology = self.topology.name(), "context activated");
    }

    /// Claims `core`. Fails with `ParticipantClaimed` while another
    /// participant for the same core is alive.
    pub fn participant(self: &Arc<Self>, core: CoreId) -> Result<Participant> {
        let claim = self.claims.get(core).ok_or(Error::UnknownCore(core))?;
        if claim
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(Error::ParticipantClaimed(core));
        }

        tracing::debug!(core, topology = self.topology.name(), "participant claimed");
        Ok(Participant {
            context: Arc::clone(self),
            core,
        })
    }

    /// Runs `f` once per core, each on its own thread, and returns the
    /// results in core order. Threads are pinned when `pin_threads` is set.
    ///
    /// Every core is claimed before any thread starts, and no thread calls
    /// `f` until all of them have been spawned. If a spawn fails, the
    /// threads already started return without running `f` and the spawn
    /// error is returned.
    pub fn run<R, F>(self: &Arc<Self>, f: F) -> Result<Vec<R>>
    where
        R: Send,
        F: Fn(Participant) -> Result<R> + Sync,
    {
        self.run_gated(f, |_| Ok(()))
    }

    /// `run` with a hook consulted before each thread is spawned.
    fn run_gated<R, F>(
        self: &Arc<Self>,
        f: F,
        mut before_spawn: impl FnMut(CoreId) -> std::io::Result<()>,
    ) -> Result<Vec<R>>
    where
        R: Send,
        F: Fn(Participant) -> Result<R> + Sync,
    {
        let participants = (0..self.num_participants())
            .map(|core| self.participant(core))
            .collect::<Result<Vec<_>>>()?;
        let pin = self.instance.config.pin_threads;
        let spin = self.spin;
        let gate = StartGate::new();
        let (f, gate) = (&f, &gate);

        std::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(participants.len());
            for participant in participants {
                let core = participant.core();
                let spawned = before_spawn(core).and_then(|()| {
                    std::thread::Builder::new()
                        .name(format!("collective-{core}"))
                        .spawn_scoped(scope, move || {
                            if !gate.wait(&spin) {
                                return Err(Error::Io(std::io::Error::new(
                                    std::io::ErrorKind::Interrupted,
                                    "run aborted before start",
                                )));
                            }
                            if pin {
                                if let Err(err) = participant.pin() {
                                    tracing::warn!(core, %err, "pinning failed, running unpinned");
                                }
                            }
                            f(participant)
                        })
                });

                match spawned {
                    Ok(handle) => handles.push(handle),
                    Err(err) => {
                        tracing::warn!(core, %err, "thread spawn failed, aborting run");
                        gate.abort();
                        return Err(err.into());
                    }
                }
            }
            gate.open();

            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
                })
                .collect()
        })
    }
}

const GATE_PENDING: u8 = 0;
const GATE_OPEN: u8 = 1;
const GATE_ABORTED: u8 = 2;

/// Holds the threads of one `run` until all of them exist.
struct StartGate {
    state: AtomicU8,
}

impl StartGate {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(GATE_PENDING),
        }
    }

    /// Blocks until the gate opens (`true`) or is aborted (`false`).
    fn wait(&self, spin: &SpinPolicy) -> bool {
        spin.wait_until(|| self.state.load(Ordering::Acquire) != GATE_PENDING);
        self.state.load(Ordering::Acquire) == GATE_OPEN
    }

    fn open(&self) {
        self.state.store(GATE_OPEN, Ordering::Release);
    }

    fn abort(&self) {
        self.state.store(GATE_ABORTED, Ordering::Release);
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("topology", &self.topology.name())
            .field("participants", &self.num_participants())
            .field("active", &self.is_active())
            .finish()
    }
}

/// The handle one thread uses to drive one core.
pub struct Participant {
    context: Arc<Context>,
    core: CoreId,
}

impl Participant {
    /// The core this participant drives.
    pub fn core(&self) -> CoreId {
        self.core
    }

    /// The context this participant belongs to.
    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    /// Whether this core is the root.
    pub fn is_root(&self) -> bool {
        self.core == self.context.topology.root()
    }

    fn endpoint(&self) -> Endpoint<'_> {
        Endpoint {
            core: self.core,
            topology: &self.context.topology,
            bindings: &self.context.bindings,
            spin: &self.context.spin,
        }
    }

    /// Sends `msg` to `dst`, spinning while the queue is full.
    pub fn send(&self, dst: CoreId, msg: &Message) -> Result<()> {
        self.endpoint().tx(dst)?.send(msg, &self.context.spin)
    }

    /// Sends `msg` to `dst`; `WouldBlock` when the queue is full.
    pub fn try_send(&self, dst: CoreId, msg: &Message) -> Result<()> {
        self.endpoint().tx(dst)?.try_send(msg)
    }

    /// Receives the next message from `src`, spinning until it arrives.
    pub fn recv(&self, src: CoreId) -> Result<Message> {
        self.endpoint().rx(src)?.recv(&self.context.spin)
    }

    /// Receives the next message from `src`; `QueueEmpty` when none is waiting.
    pub fn try_recv(&self, src: CoreId) -> Result<Message> {
        self.endpoint().rx(src)?.try_recv()
    }

    /// Sends a zero-payload message to `dst`.
    pub fn notify(&self, dst: CoreId) -> Result<()> {
        self.endpoint().tx(dst)?.notify(&self.context.spin)
    }

    /// Whether a send to `dst` would succeed now. `false` without a queue.
    pub fn can_send(&self, dst: CoreId) -> bool {
        self.endpoint().tx(dst).is_ok_and(|ring| ring.can_send())
    }

    /// Whether a message from `src` is waiting. `false` without a queue.
    pub fn can_recv(&self, src: CoreId) -> bool {
        self.endpoint().rx(src).is_ok_and(|ring| ring.can_recv())
    }

    /// Broadcasts from the root; `msg` is overwritten on every other core.
    pub fn broadcast(&self, msg: &mut Message) -> Result<()> {
        collective::broadcast(&self.endpoint(), msg)
    }

    /// Zero-payload broadcast.
    pub fn broadcast_notify(&self) -> Result<()> {
        let mut msg = Message::notification();
        collective::broadcast(&self.endpoint(), &mut msg)
    }

    /// Broadcasts `msg` from `sender` through the root. All cores must name
    /// the same sender.
    pub fn broadcast_from(&self, sender: CoreId, msg: &mut Message) -> Result<()> {
        collective::broadcast_from(&self.endpoint(), sender, msg)
    }

    /// Reduces `value` with `op`; `Some(result)` on the root.
    pub fn reduce(&self, value: Word, op: ReduceOp) -> Result<Option<Word>> {
        collective::reduce(&self.endpoint(), value, op)
    }

    /// Zero-payload reduction; `true` on the root.
    pub fn reduce_notify(&self) -> Result<bool> {
        collective::reduce_notify(&self.endpoint())
    }

    /// Tree barrier. Returns this core's barrier round, starting at 1.
    pub fn barrier(&self) -> Result<Word> {
        let counter = &self.context.barrier_counters[self.core];
        collective::tree_barrier(&self.endpoint(), counter)
    }

    /// Process-wide shared-memory barrier, independent of the topology.
    pub fn shm_barrier(&self) -> Result<()> {
        self.context
            .instance
            .arena
            .wait(self.core, &self.context.spin)
    }

    /// Moves this core to `next`: barrier, claim in `next`, activate `next`,
    /// barrier. Every participant must switch together.
    pub fn switch_topology(self, next: &Arc<Context>) -> Result<Participant> {
        if !Arc::ptr_eq(&self.context.instance, &next.instance) {
            return Err(Error::InvalidModel(
                "cannot switch to a context of another instance".into(),
            ));
        }

        self.shm_barrier()?;
        let switched = next.participant(self.core)?;
        if self.core == 0 {
            next.activate();
            tracing::info!(
                from = self.context.topology.name(),
                to = next.topology.name(),
                "topology switched"
            );
        }
        drop(self);
        switched.shm_barrier()?;
        Ok(switched)
    }

    /// Pins the calling thread to this participant's core.
    pub fn pin(&self) -> Result<()> {
        match self.context.instance.platform.pin_to_core(self.core) {
            Err(NumaError::NotSupported) => {
                tracing::warn!(core = self.core, "thread pinning is not supported here");
                Ok(())
            }
            other => other.map_err(Error::from),
        }
    }
}

impl Drop for Participant {
    fn drop(&mut self) {
        if let Some(claim) = self.context.claims.get(self.core) {
            claim.store(false, Ordering::Release);
        }
    }
}

impl std::fmt::Debug for Participant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Participant")
            .field("core", &self.core)
            .field("topology", &self.context.topology.name())
            .finish()
    }
}
