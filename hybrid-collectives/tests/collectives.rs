//! Multi-threaded collective runs through the public surface.
//!
//! ```bash
//! RUST_LOG=hybrid_collectives=debug cargo test --test collectives -- --nocapture
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hybrid_collectives::numa::HeapPlatform;
use hybrid_collectives::{Config, Error, Instance, Message, Model, ReduceOp, Word};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn instance(n: usize, eager_connect: bool) -> Instance {
    init_tracing();
    let config = Config {
        queue_slots: 16,
        cluster_slots: 16,
        eager_connect,
        spin_yield_interval: Some(32),
        ..Config::default()
    };
    Instance::new(n, config, Arc::new(HeapPlatform::new())).unwrap()
}

const HYBRID_JSON: &str = r#"{
    "model": [
        [0, 70, 70, 1],
        [50, 0, 0, 0],
        [50, 0, 0, 0],
        [99, 0, 0, 0]
    ],
    "leafs": [1, 2, 3],
    "root": 0
}"#;

#[test]
fn broadcast_waits_for_the_root() {
    let instance = instance(4, false);
    let context = instance
        .context_create(instance.topology_create(None, "binary").unwrap())
        .unwrap();
    let released = AtomicBool::new(false);

    let seen = context
        .run(|p| {
            let mut msg = Message::notification();
            if p.is_root() {
                std::thread::sleep(Duration::from_millis(20));
                msg = Message::from_words(&[0xdead, 0xbeef, 7]).unwrap();
                released.store(true, Ordering::SeqCst);
            }
            p.broadcast(&mut msg)?;
            assert!(released.load(Ordering::SeqCst), "core {} ran ahead", p.core());
            Ok(msg)
        })
        .unwrap();

    for msg in seen {
        assert_eq!(msg.words(), &[0xdead, 0xbeef, 7]);
    }
}

#[test]
fn barrier_rounds_stay_in_step() {
    const CORES: usize = 6;
    const ROUNDS: u64 = 300;

    let instance = instance(CORES, false);
    let context = instance
        .context_create(instance.topology_create(None, "binary").unwrap())
        .unwrap();
    let entered: Vec<AtomicU64> = (0..CORES).map(|_| AtomicU64::new(0)).collect();

    context
        .run(|p| {
            for round in 1..=ROUNDS {
                entered[p.core()].store(round, Ordering::SeqCst);
                let observed = p.barrier()?;
                assert!(observed >= round);

                for peer in &entered {
                    let peer_round = peer.load(Ordering::SeqCst);
                    assert!(peer_round >= round, "a peer left round {round} early");
                    assert!(peer_round <= round + 1, "a peer overtook round {round}");
                }
            }
            Ok(())
        })
        .unwrap();
}

#[test]
fn hybrid_model_from_json() {
    let instance = instance(4, false);
    let model = Model::from_json_str(HYBRID_JSON).unwrap();
    let topology = instance.topology_create(Some(&model), "hybrid").unwrap();

    assert_eq!(topology.children(0), &[3, 1, 2]);
    assert_eq!(topology.parent(2), Some(0));
    assert!(topology.roles(0).unwrap().is_hybrid());

    let context = instance.context_create(topology).unwrap();
    let results = context
        .run(|p| {
            let mut msg = Message::word_message(if p.is_root() { 11 } else { 0 });
            p.broadcast(&mut msg)?;

            let sum = p.reduce(msg.word(0) + p.core() as Word, ReduceOp::Sum)?;
            let max = p.reduce(p.core() as Word, ReduceOp::Max)?;
            let done = p.reduce_notify()?;
            p.broadcast_notify()?;
            p.barrier()?;
            Ok((msg.word(0), sum, max, done))
        })
        .unwrap();

    assert_eq!(results[0], (11, Some(11 * 4 + 6), Some(3), true));
    for result in &results[1..] {
        assert_eq!(*result, (11, None, None, false));
    }
}

#[test]
fn broadcast_from_any_sender() {
    let instance = instance(7, false);
    let context = instance
        .context_create(instance.topology_create(None, "binary").unwrap())
        .unwrap();

    let seen = context
        .run(|p| {
            let mut out = Vec::new();
            for sender in 0..7 {
                let mut msg = Message::word_message(if p.core() == sender {
                    100 + sender as Word
                } else {
                    0
                });
                p.broadcast_from(sender, &mut msg)?;
                out.push(msg.word(0));
            }
            Ok(out)
        })
        .unwrap();

    let expected: Vec<Word> = (100..107).collect();
    for values in seen {
        assert_eq!(values, expected);
    }
}

#[test]
fn eager_mesh_connects_every_pair() {
    const CORES: usize = 5;

    let instance = instance(CORES, true);
    let context = instance
        .context_create(instance.topology_create(None, "binary").unwrap())
        .unwrap();

    let received = context
        .run(|p| {
            let me = p.core();
            for peer in (0..CORES).filter(|&peer| peer != me) {
                p.send(peer, &Message::from_words(&[me as Word, peer as Word])?)?;
            }
            let mut from = Vec::new();
            for peer in (0..CORES).filter(|&peer| peer != me) {
                let msg = p.recv(peer)?;
                assert_eq!(msg.words(), &[peer as Word, me as Word]);
                from.push(msg.word(0));
            }
            p.barrier()?;
            Ok(from)
        })
        .unwrap();

    for (core, from) in received.into_iter().enumerate() {
        let expected: Vec<Word> = (0..CORES as Word).filter(|&c| c != core as Word).collect();
        assert_eq!(from, expected);
    }
}

#[test]
fn switch_between_topologies() {
    let instance = instance(4, false);
    let binary = instance
        .context_create(instance.topology_create(None, "binary").unwrap())
        .unwrap();
    let model = Model::from_json_str(HYBRID_JSON).unwrap();
    let hybrid = instance
        .context_create(instance.topology_create(Some(&model), "hybrid").unwrap())
        .unwrap();
    assert!(binary.is_active());

    let results = binary
        .run(|p| {
            let before = p.reduce(1, ReduceOp::Sum)?;
            let p = p.switch_topology(&hybrid)?;
            assert_eq!(p.context().topology().name(), "hybrid");
            let after = p.reduce(2, ReduceOp::Sum)?;
            p.barrier()?;
            Ok((before, after))
        })
        .unwrap();

    assert_eq!(results[0], (Some(4), Some(8)));
    assert!(hybrid.is_active());
    assert!(!binary.is_active());
    assert_eq!(instance.active_context().unwrap().topology().name(), "hybrid");

    // All claims on both contexts were released.
    assert!(binary.participant(3).is_ok());
    assert!(hybrid.participant(3).is_ok());
}

#[test]
fn setup_errors() {
    let instance = instance(3, false);
    let context = instance
        .context_create(instance.topology_create(None, "binary").unwrap())
        .unwrap();

    let held = context.participant(2).unwrap();
    assert!(matches!(
        context.run(|_| Ok(())),
        Err(Error::ParticipantClaimed(2))
    ));
    drop(held);
    assert!(context.run(|_| Ok(())).is_ok());

    let model = Model::from_json_str(HYBRID_JSON).unwrap();
    assert!(matches!(
        instance.topology_create(Some(&model), "hybrid").and_then(|t| instance.context_create(t)),
        Err(Error::InvalidModel(_))
    ));

    let bad = Config {
        queue_slots: 12,
        ..Config::default()
    };
    assert!(matches!(
        Instance::new(3, bad, Arc::new(HeapPlatform::new())),
        Err(Error::InvalidConfig(_))
    ));
}

#[test]
fn oversized_queues_fail_context_creation() {
    init_tracing();
    let model = Model::from_json_str(HYBRID_JSON).unwrap();

    for (queue_slots, cluster_slots) in [(1usize << 58, 16usize), (16, 1 << 58), (1 << 63, 16)] {
        let config = Config {
            queue_slots,
            cluster_slots,
            ..Config::default()
        };
        assert!(config.validate().is_ok());

        let instance = Instance::new(4, config, Arc::new(HeapPlatform::new())).unwrap();
        let topology = instance.topology_create(Some(&model), "hybrid").unwrap();
        assert!(matches!(
            instance.context_create(topology),
            Err(Error::InvalidCapacity(_))
        ));
        assert!(instance.active_context().is_none());
    }
}

#[test]
fn point_to_point_off_the_tree() {
    let instance = instance(4, false);
    let model = Model::from_json_str(HYBRID_JSON).unwrap();
    let context = instance
        .context_create(instance.topology_create(Some(&model), "hybrid").unwrap())
        .unwrap();

    let member = context.participant(1).unwrap();
    let root = context.participant(0).unwrap();

    // Cluster edges carry collective traffic only.
    assert!(matches!(
        root.send(1, &Message::notification()),
        Err(Error::NotPointToPoint { sender: 0, receiver: 1 })
    ));
    assert!(matches!(
        member.try_recv(2),
        Err(Error::ChannelNotFound { sender: 2, receiver: 1 })
    ));
    assert!(!member.can_send(2));

    root.notify(3).unwrap();
    let leaf = context.participant(3).unwrap();
    assert!(leaf.can_recv(0));
    assert!(leaf.recv(0).unwrap().is_notification());
}
