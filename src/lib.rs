//! fbcast: an embeddable RFB (VNC) server for one shared drawable
//! surface and any number of concurrent viewers.
//!
//! The embedding application draws into the surface in discrete phases
//! (`get_fb` / `release_fb`); the server pushes incremental Raw-encoded
//! updates to every viewer and delivers pointer, keyboard and clipboard
//! input back on the `input` and `cut` streams. Protocol coverage is
//! deliberately narrow: RFB 3.8, security type None, Raw encoding.
//!
//! ```no_run
//! use fbcast::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), fbcast::ServerError> {
//!     let mut serv = Server::dumb("127.0.0.1:5900", 320, 240).await?;
//!     let mut fb = serv.get_fb().await?;
//!     let all = fb.bounds();
//!     fb.fill(all, [255, 0, 0, 255]);
//!     serv.release_fb(fb, vec![all]).await?;
//!     while let Some(ev) = serv.input.recv().await {
//!         println!("{:?}", ev);
//!     }
//!     Ok(())
//! }
//! ```

pub mod dirty;
pub mod protocol;
pub mod rect;
pub mod surface;
pub mod syncer;

mod arbiter;
mod mux;
mod peer;
mod tracker;

use std::net::SocketAddr;

use log::{debug, info};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};

use arbiter::ArbiterHandle;
use mux::MuxMsg;
use syncer::Syncer;

pub use dirty::Dirty;
pub use protocol::InputEvent;
pub use rect::Rect;
pub use surface::Surface;

/// Errors the public API can return. Everything that goes wrong inside
/// a single peer is logged and disposes of that peer only.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("server is shut down")]
    Shutdown,
}

/// A running server and the embedder's side of its streams.
///
/// Each `get_fb` must be paired with exactly one `release_fb`; the
/// surface is exclusively the embedder's between the two calls, and
/// exclusively the server's otherwise.
pub struct Server {
    /// Pointer and keyboard events from all viewers, per-viewer order
    /// preserved.
    pub input: mpsc::Receiver<InputEvent>,
    /// Clipboard text cut on any viewer.
    pub cut: mpsc::Receiver<String>,
    lease_tx: mpsc::Sender<oneshot::Sender<Surface>>,
    release_tx: mpsc::Sender<(Surface, Vec<Rect>)>,
    snc: Syncer,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds `addr` and serves `fb` to every viewer that connects.
    pub async fn bind(addr: &str, fb: Surface) -> Result<Server, ServerError> {
        let listener = TcpListener::bind(addr).await.map_err(|source| {
            ServerError::Bind { addr: addr.to_string(), source }
        })?;
        let local_addr = listener.local_addr().map_err(|source| {
            ServerError::Bind { addr: addr.to_string(), source }
        })?;
        info!("listening on {}", local_addr);

        let bounds = fb.bounds();
        let snc = Syncer::new();
        let arb = arbiter::start(fb, &snc);

        let (mux_tx, mux_rx) = mpsc::channel::<MuxMsg>(1);
        let (input_tx, input) = mpsc::channel(1);
        let (cut_tx, cut) = mpsc::channel(1);

        snc.add("mux");
        {
            let snc = snc.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = snc.killed() => {}
                    _ = mux::run(mux_rx, input_tx, cut_tx) => {}
                }
                snc.report_dead("mux");
            });
        }

        snc.add("accepter");
        {
            let snc = snc.clone();
            let arb = arb.clone();
            tokio::spawn(async move {
                accepter(listener, bounds, mux_tx, arb, snc.clone()).await;
                snc.report_dead("accepter");
            });
        }

        Ok(Server {
            input,
            cut,
            lease_tx: arb.lease_tx.clone(),
            release_tx: arb.release_tx.clone(),
            snc,
            local_addr,
        })
    }

    /// Binds `addr` with a freshly allocated black surface.
    pub async fn dumb(addr: &str, width: u16, height: u16) -> Result<Server, ServerError> {
        Server::bind(addr, Surface::new(width, height)).await
    }

    /// The address actually bound, useful with a `:0` port.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Starts a draw phase: takes the surface out of the server. Viewers
    /// see no updates until `release_fb` hands it back.
    pub async fn get_fb(&self) -> Result<Surface, ServerError> {
        let (tx, rx) = oneshot::channel();
        self.lease_tx
            .send(tx)
            .await
            .map_err(|_| ServerError::Shutdown)?;
        rx.await.map_err(|_| ServerError::Shutdown)
    }

    /// Ends a draw phase: returns the surface together with the
    /// rectangles that were written, which are broadcast to every
    /// viewer's tracker.
    pub async fn release_fb(&self, fb: Surface, dirty: Vec<Rect>) -> Result<(), ServerError> {
        self.release_tx
            .send((fb, dirty))
            .await
            .map_err(|_| ServerError::Shutdown)
    }

    /// Stops accepting, disconnects every peer, closes the input and cut
    /// streams, and waits for the server tasks to wind down.
    pub async fn shutdown(&self) {
        self.snc.kill();
        self.snc.wait().await;
    }
}

async fn accepter(
    listener: TcpListener,
    bounds: Rect,
    mux_tx: mpsc::Sender<MuxMsg>,
    arb: ArbiterHandle,
    snc: Syncer,
) {
    loop {
        tokio::select! {
            _ = snc.killed() => return,
            res = listener.accept() => {
                match res {
                    Ok((stream, addr)) => {
                        debug!("viewer connected from {}", addr);
                        tokio::spawn(peer::handle_conn(
                            stream,
                            bounds,
                            mux_tx.clone(),
                            arb.clone(),
                            snc.clone(),
                        ));
                    }
                    Err(e) => {
                        debug!("accept failed: {}", e);
                        return;
                    }
                }
            }
        }
    }
}
