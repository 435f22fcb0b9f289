//! Fans input from every peer into the embedder's two streams.
//!
//! Events from different peers interleave in arrival order; events from
//! one peer keep their order because its reader blocks on each send. The
//! embedder channels are bounded, so a slow embedder backpressures the
//! peer that produced the event.

use log::debug;
use tokio::sync::mpsc;

use crate::protocol::InputEvent;

pub(crate) enum MuxMsg {
    Input(InputEvent),
    Cut(String),
}

pub(crate) async fn run(
    mut rx: mpsc::Receiver<MuxMsg>,
    input_tx: mpsc::Sender<InputEvent>,
    cut_tx: mpsc::Sender<String>,
) {
    while let Some(msg) = rx.recv().await {
        match msg {
            MuxMsg::Input(ev) => {
                if input_tx.send(ev).await.is_err() {
                    debug!("input stream dropped, discarding event");
                }
            }
            MuxMsg::Cut(text) => {
                if cut_tx.send(text).await.is_err() {
                    debug!("cut stream dropped, discarding text");
                }
            }
        }
    }
}
