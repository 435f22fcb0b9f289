//! The surface arbiter: a single task that owns the pixels.
//!
//! The arbiter leases the surface to the embedder one draw phase at a
//! time, broadcasts the rectangles each phase dirtied to every registered
//! tracker, and Raw-encodes update responses against the pixels it holds
//! between leases. Because the buffer itself moves across the lease
//! channel, the embedder and the arbiter can never touch it concurrently.

use log::{debug, trace};
use tokio::sync::{mpsc, oneshot};

use crate::dirty::Dirty;
use crate::protocol::encode_update;
use crate::rect::Rect;
use crate::surface::Surface;
use crate::syncer::Syncer;

/// A tracker's request for pixels: the region to encode and the channel
/// the encoded chunks go back on.
pub(crate) struct RenderRequest {
    pub dirty: Dirty,
    pub reply: mpsc::Sender<Vec<Vec<u8>>>,
}

/// What a tracker gets back when it registers: its registry id and the
/// channel dirty broadcasts arrive on.
pub(crate) struct Registration {
    pub id: u64,
    pub broadcast_rx: mpsc::Receiver<Vec<Rect>>,
}

#[derive(Clone)]
pub(crate) struct ArbiterHandle {
    pub lease_tx: mpsc::Sender<oneshot::Sender<Surface>>,
    pub release_tx: mpsc::Sender<(Surface, Vec<Rect>)>,
    pub render_tx: mpsc::Sender<RenderRequest>,
    pub reg_tx: mpsc::Sender<oneshot::Sender<Registration>>,
    pub unreg_tx: mpsc::Sender<u64>,
}

/// Spawns the arbiter task and returns the handle everyone else talks
/// through.
pub(crate) fn start(fb: Surface, snc: &Syncer) -> ArbiterHandle {
    let (lease_tx, lease_rx) = mpsc::channel(1);
    let (release_tx, release_rx) = mpsc::channel(1);
    let (render_tx, render_rx) = mpsc::channel(1);
    let (reg_tx, reg_rx) = mpsc::channel(1);
    let (unreg_tx, unreg_rx) = mpsc::channel(1);

    snc.add("arbiter");
    let snc2 = snc.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = snc2.killed() => {}
            _ = run(fb, lease_rx, release_rx, render_rx, reg_rx, unreg_rx) => {}
        }
        snc2.report_dead("arbiter");
    });

    ArbiterHandle { lease_tx, release_tx, render_tx, reg_tx, unreg_tx }
}

async fn run(
    mut fb: Surface,
    mut lease_rx: mpsc::Receiver<oneshot::Sender<Surface>>,
    mut release_rx: mpsc::Receiver<(Surface, Vec<Rect>)>,
    mut render_rx: mpsc::Receiver<RenderRequest>,
    mut reg_rx: mpsc::Receiver<oneshot::Sender<Registration>>,
    mut unreg_rx: mpsc::Receiver<u64>,
) {
    let mut registry: Vec<(u64, mpsc::Sender<Vec<Rect>>)> = Vec::new();
    let mut next_id: u64 = 0;

    loop {
        tokio::select! {
            msg = lease_rx.recv() => {
                let Some(reply) = msg else { return };
                fb = match reply.send(fb) {
                    // the embedder gave up between request and grant
                    Err(back) => back,
                    Ok(()) => {
                        let Some((back, rects)) = release_rx.recv().await else { return };
                        trace!("draw phase released {} dirty rect(s)", rects.len());
                        broadcast(&mut registry, &mut unreg_rx, rects).await;
                        back
                    }
                };
            }
            msg = render_rx.recv() => {
                let Some(req) = msg else { return };
                let chunks = encode_update(&fb, &req.dirty);
                // a tracker that died mid-request just drops its receiver
                let _ = req.reply.send(chunks).await;
            }
            msg = reg_rx.recv() => {
                let Some(reply) = msg else { return };
                let (tx, rx) = mpsc::channel(1);
                next_id += 1;
                let id = next_id;
                if reply.send(Registration { id, broadcast_rx: rx }).is_ok() {
                    debug!("tracker {} registered", id);
                    registry.push((id, tx));
                }
            }
            msg = unreg_rx.recv() => {
                let Some(id) = msg else { return };
                debug!("tracker {} unregistered", id);
                registry.retain(|(i, _)| *i != id);
            }
        }
    }
}

/// Delivers a dirty-rectangle list to every registered tracker. At each
/// not-yet-served tracker this waits on the send *or* on an unregister
/// arriving, so a tracker that is shutting down while we hold rectangles
/// for it cannot wedge the loop.
async fn broadcast(
    registry: &mut Vec<(u64, mpsc::Sender<Vec<Rect>>)>,
    unreg_rx: &mut mpsc::Receiver<u64>,
    rects: Vec<Rect>,
) {
    let mut pending: Vec<u64> = registry.iter().map(|(id, _)| *id).collect();
    while let Some(id) = pending.first().copied() {
        let Some(tx) = registry
            .iter()
            .find(|(i, _)| *i == id)
            .map(|(_, tx)| tx.clone())
        else {
            pending.remove(0);
            continue;
        };
        tokio::select! {
            res = tx.reserve() => {
                match res {
                    Ok(permit) => permit.send(rects.clone()),
                    // receiver already dropped without unregistering
                    Err(_) => registry.retain(|(i, _)| *i != id),
                }
                pending.remove(0);
            }
            msg = unreg_rx.recv() => {
                match msg {
                    Some(gone) => {
                        debug!("tracker {} unregistered mid-broadcast", gone);
                        registry.retain(|(i, _)| *i != gone);
                        pending.retain(|i| *i != gone);
                    }
                    // every handle is gone, nobody is left to deliver to
                    None => return,
                }
            }
        }
    }
}
