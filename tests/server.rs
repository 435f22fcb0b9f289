//! End-to-end tests: a real server on an ephemeral port, exercised by a
//! hand-rolled RFB viewer over a real TCP connection.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, timeout_at};

use fbcast::{InputEvent, Rect, Server};

const VERSION: &[u8; 12] = b"RFB 003.008\n";

/// Connects and walks the whole 3.8 opening exchange, returning the
/// stream plus the advertised framebuffer geometry.
async fn connect(addr: SocketAddr) -> (TcpStream, u16, u16) {
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let mut banner = [0u8; 12];
    stream.read_exact(&mut banner).await.unwrap();
    assert_eq!(&banner, VERSION);
    stream.write_all(VERSION).await.unwrap();

    let mut sec = [0u8; 2];
    stream.read_exact(&mut sec).await.unwrap();
    assert_eq!(sec, [1, 1], "exactly one security type: None");
    stream.write_all(&[1]).await.unwrap();

    let mut result = [0u8; 4];
    stream.read_exact(&mut result).await.unwrap();
    assert_eq!(result, [0, 0, 0, 0]);

    // ClientInit: shared
    stream.write_all(&[1]).await.unwrap();

    let mut init = [0u8; 24];
    stream.read_exact(&mut init).await.unwrap();
    let width = u16::from_be_bytes([init[0], init[1]]);
    let height = u16::from_be_bytes([init[2], init[3]]);
    assert_eq!(init[4], 32, "bpp");
    assert_eq!(init[5], 24, "depth");
    let name_len = u32::from_be_bytes([init[20], init[21], init[22], init[23]]) as usize;
    let mut name = vec![0u8; name_len];
    stream.read_exact(&mut name).await.unwrap();

    (stream, width, height)
}

async fn send_update_request(stream: &mut TcpStream, incremental: bool, x: u16, y: u16, w: u16, h: u16) {
    let mut msg = vec![3u8, incremental as u8];
    msg.extend_from_slice(&x.to_be_bytes());
    msg.extend_from_slice(&y.to_be_bytes());
    msg.extend_from_slice(&w.to_be_bytes());
    msg.extend_from_slice(&h.to_be_bytes());
    stream.write_all(&msg).await.unwrap();
}

struct UpdateRect {
    x: u16,
    y: u16,
    w: u16,
    h: u16,
    data: Vec<u8>,
}

async fn read_update(stream: &mut TcpStream) -> Vec<UpdateRect> {
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await.unwrap();
    assert_eq!(head[0], 0, "FramebufferUpdate message type");
    let nrects = u16::from_be_bytes([head[2], head[3]]);

    let mut rects = Vec::new();
    for _ in 0..nrects {
        let mut rh = [0u8; 12];
        stream.read_exact(&mut rh).await.unwrap();
        let x = u16::from_be_bytes([rh[0], rh[1]]);
        let y = u16::from_be_bytes([rh[2], rh[3]]);
        let w = u16::from_be_bytes([rh[4], rh[5]]);
        let h = u16::from_be_bytes([rh[6], rh[7]]);
        let encoding = i32::from_be_bytes([rh[8], rh[9], rh[10], rh[11]]);
        assert_eq!(encoding, 0, "Raw encoding");
        let mut data = vec![0u8; w as usize * h as usize * 4];
        stream.read_exact(&mut data).await.unwrap();
        rects.push(UpdateRect { x, y, w, h, data });
    }
    rects
}

#[tokio::test]
async fn full_screen_solid_fill() {
    let serv = Server::dumb("127.0.0.1:0", 320, 240).await.unwrap();
    let (mut stream, w, h) = connect(serv.local_addr()).await;
    assert_eq!((w, h), (320, 240));

    let mut fb = serv.get_fb().await.unwrap();
    fb.fill(Rect::new(0, 0, 320, 240), [255, 0, 0, 255]);
    serv.release_fb(fb, vec![Rect::new(0, 0, 320, 240)]).await.unwrap();

    send_update_request(&mut stream, false, 0, 0, 320, 240).await;
    let rects = timeout(Duration::from_secs(5), read_update(&mut stream))
        .await
        .unwrap();
    assert_eq!(rects.len(), 1);
    let r = &rects[0];
    assert_eq!((r.x, r.y, r.w, r.h), (0, 0, 320, 240));
    assert_eq!(r.data.len(), 307_200);
    assert!(r.data.chunks(4).all(|p| p == [0, 0, 255, 255]), "red as BGRA");

    serv.shutdown().await;
}

#[tokio::test]
async fn disjoint_updates_arrive_coalesced_without_loss() {
    let serv = Server::dumb("127.0.0.1:0", 320, 240).await.unwrap();
    let (mut stream, ..) = connect(serv.local_addr()).await;

    // drain the initial full frame so the tracker is known-registered
    send_update_request(&mut stream, false, 0, 0, 320, 240).await;
    let first = timeout(Duration::from_secs(5), read_update(&mut stream))
        .await
        .unwrap();
    assert_eq!(first.len(), 1);
    assert!(first[0].data.iter().all(|&b| b == 0), "starts black");

    send_update_request(&mut stream, true, 0, 0, 320, 240).await;

    let r1 = Rect::new(10, 10, 20, 20);
    let r2 = Rect::new(100, 100, 110, 110);
    let mut fb = serv.get_fb().await.unwrap();
    fb.fill(r1, [255, 255, 255, 255]);
    fb.fill(r2, [255, 255, 255, 255]);
    serv.release_fb(fb, vec![r1, r2]).await.unwrap();

    let rects = timeout(Duration::from_secs(5), read_update(&mut stream))
        .await
        .unwrap();
    assert_eq!(rects.len(), 2);
    // the tracker lists its newest slot first
    assert_eq!((rects[0].x, rects[0].y, rects[0].w, rects[0].h), (100, 100, 10, 10));
    assert_eq!((rects[1].x, rects[1].y, rects[1].w, rects[1].h), (10, 10, 10, 10));
    for r in &rects {
        assert!(r.data.chunks(4).all(|p| p == [255, 255, 255, 255]));
    }

    serv.shutdown().await;
}

#[tokio::test]
async fn non_incremental_request_redirties_the_viewport() {
    let serv = Server::dumb("127.0.0.1:0", 64, 64).await.unwrap();
    let (mut stream, ..) = connect(serv.local_addr()).await;

    send_update_request(&mut stream, false, 0, 0, 64, 64).await;
    timeout(Duration::from_secs(5), read_update(&mut stream))
        .await
        .unwrap();

    // no drawing happened in between, yet a second non-incremental
    // request must produce a full frame again
    send_update_request(&mut stream, false, 0, 0, 64, 64).await;
    let rects = timeout(Duration::from_secs(5), read_update(&mut stream))
        .await
        .unwrap();
    assert_eq!(rects.len(), 1);
    assert_eq!((rects[0].w, rects[0].h), (64, 64));

    serv.shutdown().await;
}

#[tokio::test]
async fn input_events_reach_the_embedder_in_order() {
    let mut serv = Server::dumb("127.0.0.1:0", 64, 64).await.unwrap();
    let (mut stream, ..) = connect(serv.local_addr()).await;

    // PointerEvent, KeyEvent, ClientCutText, back to back
    stream.write_all(&[5, 0x01, 0, 10, 0, 20]).await.unwrap();
    stream
        .write_all(&[4, 1, 0, 0, 0x00, 0x00, 0xFF, 0x0D])
        .await
        .unwrap();
    let text = b"copied";
    let mut cut = vec![6u8, 0, 0, 0];
    cut.extend_from_slice(&(text.len() as u32).to_be_bytes());
    cut.extend_from_slice(text);
    stream.write_all(&cut).await.unwrap();

    let ev = timeout(Duration::from_secs(5), serv.input.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ev, InputEvent::Pointer { buttons: 1, x: 10, y: 20 });

    let ev = timeout(Duration::from_secs(5), serv.input.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ev, InputEvent::Key { down: true, keysym: 0xFF0D });

    let txt = timeout(Duration::from_secs(5), serv.cut.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(txt, "copied");

    serv.shutdown().await;
}

#[tokio::test]
async fn version_mismatch_is_rejected_with_a_reason() {
    let serv = Server::dumb("127.0.0.1:0", 64, 64).await.unwrap();
    let mut stream = TcpStream::connect(serv.local_addr()).await.unwrap();

    let mut banner = [0u8; 12];
    stream.read_exact(&mut banner).await.unwrap();
    stream.write_all(b"RFB 003.003\n").await.unwrap();

    let mut ok = [0u8; 1];
    stream.read_exact(&mut ok).await.unwrap();
    assert_eq!(ok[0], 0);
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).await.unwrap();
    let mut reason = vec![0u8; u32::from_be_bytes(len) as usize];
    stream.read_exact(&mut reason).await.unwrap();
    assert!(!reason.is_empty());

    // the peer is closed afterwards
    let n = timeout(Duration::from_secs(5), stream.read(&mut [0u8; 16]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);

    serv.shutdown().await;
}

#[tokio::test]
async fn viewer_disconnect_does_not_stall_the_others() {
    let serv = Server::dumb("127.0.0.1:0", 64, 64).await.unwrap();

    let (mut a, ..) = connect(serv.local_addr()).await;
    let (b, ..) = connect(serv.local_addr()).await;
    let (mut c, ..) = connect(serv.local_addr()).await;

    for s in [&mut a, &mut c] {
        send_update_request(s, false, 0, 0, 64, 64).await;
        timeout(Duration::from_secs(5), read_update(s)).await.unwrap();
        send_update_request(s, true, 0, 0, 64, 64).await;
    }

    // b goes away without ever asking for anything; its tracker
    // unregisters while broadcasts may be on foot
    drop(b);

    for _ in 0..5 {
        let mut fb = serv.get_fb().await.unwrap();
        fb.fill(Rect::new(0, 0, 8, 8), [1, 2, 3, 4]);
        serv.release_fb(fb, vec![Rect::new(0, 0, 8, 8)]).await.unwrap();
    }

    // a and c still receive updates
    for s in [&mut a, &mut c] {
        let rects = timeout(Duration::from_secs(5), read_update(s)).await.unwrap();
        assert!(!rects.is_empty());
    }

    serv.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_streams_and_peers() {
    let mut serv = Server::dumb("127.0.0.1:0", 64, 64).await.unwrap();
    let (mut stream, ..) = connect(serv.local_addr()).await;

    serv.shutdown().await;

    // the embedder-facing streams end
    assert!(timeout(Duration::from_secs(5), serv.input.recv())
        .await
        .unwrap()
        .is_none());
    assert!(serv.get_fb().await.is_err());

    // the peer socket reaches EOF
    let mut buf = [0u8; 64];
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        match timeout_at(deadline, stream.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(_)) => continue,
            Ok(Err(_)) => break,
            Err(_) => panic!("peer socket still open after shutdown"),
        }
    }

    // new connections are refused or dropped immediately
    match TcpStream::connect(serv.local_addr()).await {
        Err(_) => {}
        Ok(mut s) => {
            let n = timeout(Duration::from_secs(5), s.read(&mut buf)).await;
            assert!(matches!(n, Ok(Ok(0)) | Ok(Err(_))));
        }
    }
}
