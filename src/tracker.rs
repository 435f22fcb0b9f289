//! The per-viewer dirty tracker.
//!
//! Each connected viewer gets one tracker task. It folds dirty
//! broadcasts and the viewer's own update requests into a two-slot
//! region, and whenever the viewer wants pixels that are dirty it asks
//! the arbiter for exactly one encoded update, which it relays to the
//! writer. At most one update is ever in flight or buffered per viewer,
//! so a stalled socket costs one frame of memory, never more.

use tokio::sync::{mpsc, oneshot};

use crate::arbiter::{ArbiterHandle, RenderRequest};
use crate::dirty::Dirty;
use crate::protocol::UpdateRequest;
use crate::rect::{Rect, ZR};
use crate::syncer::Syncer;

/// Registers with the arbiter, runs the tracker loop, unregisters.
pub(crate) async fn tracker_task(
    arb: ArbiterHandle,
    update_rx: mpsc::Receiver<UpdateRequest>,
    out_tx: mpsc::Sender<Vec<Vec<u8>>>,
    snc: Syncer,
) {
    let (tx, rx) = oneshot::channel();
    let reg = tokio::select! {
        _ = snc.killed() => None,
        sent = arb.reg_tx.send(tx) => match sent {
            Err(_) => None,
            Ok(()) => rx.await.ok(),
        },
    };
    let Some(reg) = reg else { return };

    run(update_rx, reg.broadcast_rx, arb.render_tx.clone(), out_tx, &snc).await;

    // the arbiter takes unregisters even while it is mid-broadcast, so
    // this send cannot wedge against it
    let _ = arb.unreg_tx.send(reg.id).await;
}

async fn run(
    mut update_rx: mpsc::Receiver<UpdateRequest>,
    mut broadcast_rx: mpsc::Receiver<Vec<Rect>>,
    render_tx: mpsc::Sender<RenderRequest>,
    out_tx: mpsc::Sender<Vec<Vec<u8>>>,
    snc: &Syncer,
) {
    let mut wanted: Rect = ZR;
    let mut dirty = Dirty::clean();
    let mut buffered: Option<Vec<Vec<u8>>> = None;
    let mut in_flight = false;
    let (reply_tx, mut reply_rx) = mpsc::channel::<Vec<Vec<u8>>>(1);

    loop {
        let pending = dirty.intersect(wanted);
        let can_render = !pending.is_empty() && !in_flight && buffered.is_none();

        tokio::select! {
            _ = snc.killed() => return,

            msg = update_rx.recv() => {
                let Some(req) = msg else { return };
                wanted = req.rect;
                if !req.incremental {
                    dirty = dirty.add(req.rect);
                }
            }

            msg = broadcast_rx.recv() => {
                let Some(rects) = msg else { return };
                for r in rects {
                    dirty = dirty.add(r);
                }
            }

            msg = reply_rx.recv(), if in_flight => {
                let Some(chunks) = msg else { return };
                in_flight = false;
                buffered = Some(chunks);
            }

            permit = render_tx.reserve(), if can_render => {
                let Ok(permit) = permit else { return };
                permit.send(RenderRequest { dirty: pending, reply: reply_tx.clone() });
                // the viewer must ask again to get anything further
                wanted = ZR;
                dirty = Dirty::clean();
                in_flight = true;
            }

            permit = out_tx.reserve(), if buffered.is_some() => {
                let Ok(permit) = permit else { return };
                if let Some(chunks) = buffered.take() {
                    permit.send(chunks);
                }
            }
        }
    }
}
