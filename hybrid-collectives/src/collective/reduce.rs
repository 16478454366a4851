//! Up-sweep: combine children, then one hand-off upstream.

use super::{Endpoint, ReduceOp};
use crate::message::{Message, Word};
use crate::Result;

/// Reduces `value` across all cores with `op`.
///
/// Returns `Some(result)` on the root and `None` everywhere else. Children
/// arrive in [`children`](crate::topology::TopologyNode::children) order,
/// message-passing children first and then the coordinated cluster, so a
/// core forwards one value covering its whole subtree.
pub(crate) fn reduce(ep: &Endpoint<'_>, value: Word, op: ReduceOp) -> Result<Option<Word>> {
    up_sweep(ep, value, op, true)
}

/// Zero-payload reduction: returns `true` on the root once every core has arrived.
pub(crate) fn reduce_notify(ep: &Endpoint<'_>) -> Result<bool> {
    up_sweep(ep, ReduceOp::Sum.identity(), ReduceOp::Sum, false).map(|r| r.is_some())
}

fn up_sweep(
    ep: &Endpoint<'_>,
    value: Word,
    op: ReduceOp,
    with_payload: bool,
) -> Result<Option<Word>> {
    let roles = ep.roles()?;
    let node = ep.node()?;
    let mut acc = value;

    if roles.mp_send {
        for &child in node.mp_children() {
            let msg = ep.rx(child)?.recv(ep.spin)?;
            if with_payload {
                acc = op.combine(acc, msg.word(0));
            }
        }
    }

    if roles.shm_send {
        if let Some(cluster) = ep.coordinated_cluster()? {
            acc = op.combine(acc, cluster.reduction().collect(op, ep.spin));
        }
    }

    if roles.mp_recv {
        if let Some(parent) = node.mp_parent() {
            let msg = if with_payload {
                Message::word_message(acc)
            } else {
                Message::notification()
            };
            ep.tx(parent)?.send(&msg, ep.spin)?;
            return Ok(None);
        }
    }

    if roles.shm_recv {
        if let Some((cluster, reader_id)) = ep.member_cluster()? {
            cluster.reduction().contribute(reader_id, acc, op, ep.spin)?;
            return Ok(None);
        }
    }

    tracing::trace!(core = ep.core, ?op, "reduction complete at root");
    Ok(Some(acc))
}
