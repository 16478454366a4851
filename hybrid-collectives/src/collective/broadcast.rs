//! Down-sweep: one receive from upstream, then fan-out in child order.

use super::Endpoint;
use crate::message::Message;
use crate::{CoreId, Result};

/// Broadcasts `msg` from the root. On every other core `msg` is replaced by
/// the root's payload.
pub(crate) fn broadcast(ep: &Endpoint<'_>, msg: &mut Message) -> Result<()> {
    let roles = ep.roles()?;
    let node = ep.node()?;

    if roles.mp_recv {
        if let Some(parent) = node.mp_parent() {
            *msg = ep.rx(parent)?.recv(ep.spin)?;
        }
    } else if roles.shm_recv {
        if let Some((cluster, reader_id)) = ep.member_cluster()? {
            *msg = cluster.queue().recv(reader_id, ep.spin)?;
        }
    }

    if roles.mp_send {
        for &child in node.mp_children() {
            ep.tx(child)?.send(msg, ep.spin)?;
        }
    }

    if roles.shm_send {
        if let Some(cluster) = ep.coordinated_cluster()? {
            cluster.queue().send(msg, ep.spin)?;
        }
    }

    tracing::trace!(core = ep.core, words = msg.len(), "broadcast step done");
    Ok(())
}

/// Broadcasts `msg` from an arbitrary `sender`: the sender first hands the
/// payload to the root over their administrative link, then the root
/// broadcasts it. Every core must pass the same `sender`.
pub(crate) fn broadcast_from(ep: &Endpoint<'_>, sender: CoreId, msg: &mut Message) -> Result<()> {
    let root = ep.topology.root();

    if sender != root {
        if ep.core == sender {
            ep.tx(root)?.send(msg, ep.spin)?;
        } else if ep.core == root {
            *msg = ep.rx(sender)?.recv(ep.spin)?;
        }
    }

    broadcast(ep, msg)
}
