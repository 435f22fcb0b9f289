//! One connected viewer: handshake, message pump, and task wiring.
//!
//! After a successful handshake the connection splits into a reader and
//! a writer task, with a tracker between them and a watcher that folds
//! the server-wide shutdown into this peer's lifecycle. All four share
//! one `Syncer`, so the first of them to die (a protocol violation, an
//! I/O error, plain EOF, server shutdown) takes the rest down, and the
//! socket closes exactly once when both halves have been dropped.

use anyhow::{bail, Context, Result};
use byteorder::{BigEndian, ByteOrder};
use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::arbiter::ArbiterHandle;
use crate::mux::MuxMsg;
use crate::protocol::{
    self, InputEvent, PixelFormat, ServerInit, UpdateRequest, CLIENT_CUT_TEXT,
    FRAMEBUFFER_UPDATE_REQUEST, KEY_EVENT, POINTER_EVENT, PROTOCOL_VERSION, SECURITY_NONE,
    SET_ENCODINGS, SET_PIXEL_FORMAT,
};
use crate::rect::Rect;
use crate::syncer::Syncer;
use crate::tracker::tracker_task;

/// Clipboard payloads larger than this are treated as a protocol error.
const MAX_CUT_TEXT: usize = 1 << 20;

pub(crate) async fn handle_conn(
    mut stream: TcpStream,
    bounds: Rect,
    mux_tx: mpsc::Sender<MuxMsg>,
    arb: ArbiterHandle,
    server_snc: Syncer,
) {
    let shaken = tokio::select! {
        _ = server_snc.killed() => return,
        res = handshake(&mut stream, bounds) => res,
    };
    if let Err(e) = shaken {
        debug!("handshake failed: {:#}", e);
        return;
    }

    let (read_half, write_half) = stream.into_split();
    let (update_tx, update_rx) = mpsc::channel::<UpdateRequest>(1);
    let (out_tx, out_rx) = mpsc::channel::<Vec<Vec<u8>>>(1);
    let snc = Syncer::new();

    snc.add("shutdown watch");
    {
        let snc = snc.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = server_snc.killed() => {}
                _ = snc.killed() => {}
            }
            snc.report_dead("shutdown watch");
        });
    }

    snc.add("tracker");
    {
        let snc = snc.clone();
        tokio::spawn(async move {
            tracker_task(arb, update_rx, out_tx, snc.clone()).await;
            snc.report_dead("tracker");
        });
    }

    snc.add("reader");
    {
        let snc = snc.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = snc.killed() => {}
                res = read_loop(read_half, mux_tx, update_tx) => {
                    if let Err(e) = res {
                        debug!("peer read ended: {:#}", e);
                    }
                }
            }
            snc.report_dead("reader");
        });
    }

    snc.add("writer");
    {
        let snc = snc.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = snc.killed() => {}
                res = write_loop(write_half, out_rx) => {
                    if let Err(e) = res {
                        debug!("peer write ended: {:#}", e);
                    }
                }
            }
            snc.report_dead("writer");
        });
    }

    snc.wait().await;
    debug!("peer torn down");
}

/// RFB 3.8 opening exchange: version banner, security (None only),
/// ClientInit's shared flag, ServerInit. A rejected client gets a
/// length-prefixed reason before the connection drops.
async fn handshake(stream: &mut TcpStream, bounds: Rect) -> Result<()> {
    stream.write_all(PROTOCOL_VERSION).await?;
    let mut version = [0u8; 12];
    stream.read_exact(&mut version).await?;
    if &version != PROTOCOL_VERSION {
        stream.write_all(&[0]).await?;
        write_reason(stream, "unsupported protocol version").await?;
        bail!(
            "unsupported client version {:?}",
            String::from_utf8_lossy(&version)
        );
    }

    stream.write_all(&[1, SECURITY_NONE]).await?;
    let mut sec = [0u8; 1];
    stream.read_exact(&mut sec).await?;
    if sec[0] != SECURITY_NONE {
        stream.write_all(&[0, 0, 0, 1]).await?;
        write_reason(stream, &format!("unsupported security type {}", sec[0])).await?;
        bail!("unsupported security type {}", sec[0]);
    }
    // SecurityResult: ok
    stream.write_all(&[0, 0, 0, 0]).await?;

    let mut shared = [0u8; 1];
    stream.read_exact(&mut shared).await?;
    debug!("peer shared flag: {}", shared[0]);

    let init = ServerInit {
        width: bounds.width() as u16,
        height: bounds.height() as u16,
        format: PixelFormat::rgb32(),
        name: protocol::SERVER_NAME.to_string(),
    };
    stream.write_all(&init.encode()).await?;
    Ok(())
}

async fn write_reason(stream: &mut TcpStream, reason: &str) -> Result<()> {
    let mut b = [0u8; 4];
    BigEndian::write_u32(&mut b, reason.len() as u32);
    stream.write_all(&b).await?;
    stream.write_all(reason.as_bytes()).await?;
    Ok(())
}

/// Parses inbound messages and routes them: update requests to the
/// tracker, input and clipboard to the mux, format and encoding
/// housekeeping to the log. Returns on the first I/O or protocol error.
async fn read_loop(
    mut stream: OwnedReadHalf,
    mux_tx: mpsc::Sender<MuxMsg>,
    update_tx: mpsc::Sender<UpdateRequest>,
) -> Result<()> {
    loop {
        let msg_type = stream.read_u8().await.context("message type")?;
        match msg_type {
            SET_PIXEL_FORMAT => {
                let mut b = [0u8; 19];
                stream.read_exact(&mut b).await?;
                let mut fmt = [0u8; 16];
                fmt.copy_from_slice(&b[3..]);
                // the server format is fixed, nothing to do with it
                debug!("peer pixel format: {:?}", PixelFormat::decode(&fmt));
            }
            SET_ENCODINGS => {
                let mut head = [0u8; 3];
                stream.read_exact(&mut head).await?;
                let count = protocol::decode_encoding_count(&head);
                let mut b = vec![0u8; 4 * count];
                stream.read_exact(&mut b).await?;
                // only Raw is ever sent regardless
                debug!("peer encodings: {:?}", protocol::decode_encodings(&b));
            }
            FRAMEBUFFER_UPDATE_REQUEST => {
                let mut b = [0u8; 9];
                stream.read_exact(&mut b).await?;
                if update_tx.send(UpdateRequest::decode(&b)).await.is_err() {
                    return Ok(());
                }
            }
            KEY_EVENT => {
                let mut b = [0u8; 7];
                stream.read_exact(&mut b).await?;
                let ev = InputEvent::decode_key(&b);
                if mux_tx.send(MuxMsg::Input(ev)).await.is_err() {
                    return Ok(());
                }
            }
            POINTER_EVENT => {
                let mut b = [0u8; 5];
                stream.read_exact(&mut b).await?;
                let ev = InputEvent::decode_pointer(&b);
                if mux_tx.send(MuxMsg::Input(ev)).await.is_err() {
                    return Ok(());
                }
            }
            CLIENT_CUT_TEXT => {
                let mut head = [0u8; 7];
                stream.read_exact(&mut head).await?;
                let len = protocol::decode_cut_len(&head);
                if len > MAX_CUT_TEXT {
                    bail!("cut text of {} bytes refused", len);
                }
                let mut b = vec![0u8; len];
                stream.read_exact(&mut b).await?;
                let text = String::from_utf8_lossy(&b).into_owned();
                if mux_tx.send(MuxMsg::Cut(text)).await.is_err() {
                    return Ok(());
                }
            }
            t => bail!("unrecognised message type {}", t),
        }
    }
}

/// Writes each batch of chunks back to back; a failed write ends the
/// peer.
async fn write_loop(
    mut stream: OwnedWriteHalf,
    mut out_rx: mpsc::Receiver<Vec<Vec<u8>>>,
) -> Result<()> {
    while let Some(chunks) = out_rx.recv().await {
        for c in &chunks {
            stream.write_all(c).await?;
        }
        stream.flush().await?;
    }
    Ok(())
}
