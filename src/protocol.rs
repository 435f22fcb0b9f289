//! RFB 3.8 wire layouts: pure encode/decode over byte buffers.
//!
//! Everything here is synchronous and allocation-light so it can be unit
//! tested without sockets. Integers are big-endian throughout, per the
//! protocol.

use anyhow::{bail, Result};
use byteorder::{BigEndian, ByteOrder};

use crate::dirty::Dirty;
use crate::rect::Rect;
use crate::surface::Surface;

pub const PROTOCOL_VERSION: &[u8; 12] = b"RFB 003.008\n";
pub const SECURITY_NONE: u8 = 1;

/// Desktop name sent in ServerInit.
pub const SERVER_NAME: &str = "fbcast";

// client to server message types
pub const SET_PIXEL_FORMAT: u8 = 0;
pub const SET_ENCODINGS: u8 = 2;
pub const FRAMEBUFFER_UPDATE_REQUEST: u8 = 3;
pub const KEY_EVENT: u8 = 4;
pub const POINTER_EVENT: u8 = 5;
pub const CLIENT_CUT_TEXT: u8 = 6;

// server to client message types
pub const FRAMEBUFFER_UPDATE: u8 = 0;

pub const ENCODING_RAW: i32 = 0;

/// The 16-byte pixel format block of the ServerInit message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelFormat {
    pub bpp: u8,
    pub depth: u8,
    pub big_endian: u8,
    pub true_color: u8,
    pub red_max: u16,
    pub green_max: u16,
    pub blue_max: u16,
    pub red_shift: u8,
    pub green_shift: u8,
    pub blue_shift: u8,
}

impl PixelFormat {
    /// The only format this server speaks: 32bpp truecolor, 8 bits per
    /// channel, little-endian pixels so the wire bytes come out BGRA.
    pub fn rgb32() -> PixelFormat {
        PixelFormat {
            bpp: 32,
            depth: 24,
            big_endian: 0,
            true_color: 1,
            red_max: 255,
            green_max: 255,
            blue_max: 255,
            red_shift: 16,
            green_shift: 8,
            blue_shift: 0,
        }
    }

    pub fn encode(&self) -> [u8; 16] {
        let mut b = [0u8; 16];
        b[0] = self.bpp;
        b[1] = self.depth;
        b[2] = self.big_endian;
        b[3] = self.true_color;
        BigEndian::write_u16(&mut b[4..6], self.red_max);
        BigEndian::write_u16(&mut b[6..8], self.green_max);
        BigEndian::write_u16(&mut b[8..10], self.blue_max);
        b[10] = self.red_shift;
        b[11] = self.green_shift;
        b[12] = self.blue_shift;
        b
    }

    pub fn decode(b: &[u8; 16]) -> PixelFormat {
        PixelFormat {
            bpp: b[0],
            depth: b[1],
            big_endian: b[2],
            true_color: b[3],
            red_max: BigEndian::read_u16(&b[4..6]),
            green_max: BigEndian::read_u16(&b[6..8]),
            blue_max: BigEndian::read_u16(&b[8..10]),
            red_shift: b[10],
            green_shift: b[11],
            blue_shift: b[12],
        }
    }
}

/// ServerInit: framebuffer geometry, pixel format and desktop name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInit {
    pub width: u16,
    pub height: u16,
    pub format: PixelFormat,
    pub name: String,
}

impl ServerInit {
    pub fn encode(&self) -> Vec<u8> {
        let mut b = vec![0u8; 24 + self.name.len()];
        BigEndian::write_u16(&mut b[0..2], self.width);
        BigEndian::write_u16(&mut b[2..4], self.height);
        b[4..20].copy_from_slice(&self.format.encode());
        BigEndian::write_u32(&mut b[20..24], self.name.len() as u32);
        b[24..].copy_from_slice(self.name.as_bytes());
        b
    }

    pub fn decode(b: &[u8]) -> Result<ServerInit> {
        if b.len() < 24 {
            bail!("server init: short buffer ({} bytes)", b.len());
        }
        let len = BigEndian::read_u32(&b[20..24]) as usize;
        if b.len() != 24 + len {
            bail!("server init: name length mismatch");
        }
        let mut fmt = [0u8; 16];
        fmt.copy_from_slice(&b[4..20]);
        Ok(ServerInit {
            width: BigEndian::read_u16(&b[0..2]),
            height: BigEndian::read_u16(&b[2..4]),
            format: PixelFormat::decode(&fmt),
            name: String::from_utf8_lossy(&b[24..]).into_owned(),
        })
    }
}

/// A viewer's FramebufferUpdateRequest: the viewport it wants, and
/// whether it already holds the previous contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateRequest {
    pub rect: Rect,
    pub incremental: bool,
}

impl UpdateRequest {
    pub fn decode(b: &[u8; 9]) -> UpdateRequest {
        let x = BigEndian::read_u16(&b[1..3]);
        let y = BigEndian::read_u16(&b[3..5]);
        let w = BigEndian::read_u16(&b[5..7]);
        let h = BigEndian::read_u16(&b[7..9]);
        UpdateRequest {
            rect: Rect::from_xywh(x, y, w, h),
            incremental: b[0] == 1,
        }
    }

    pub fn encode(&self) -> [u8; 9] {
        let mut b = [0u8; 9];
        b[0] = self.incremental as u8;
        BigEndian::write_u16(&mut b[1..3], self.rect.x0 as u16);
        BigEndian::write_u16(&mut b[3..5], self.rect.y0 as u16);
        BigEndian::write_u16(&mut b[5..7], self.rect.width() as u16);
        BigEndian::write_u16(&mut b[7..9], self.rect.height() as u16);
        b
    }
}

/// Pointer and keyboard events share one channel to the embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    Pointer { buttons: u8, x: u16, y: u16 },
    Key { down: bool, keysym: u32 },
}

impl InputEvent {
    pub fn decode_pointer(b: &[u8; 5]) -> InputEvent {
        InputEvent::Pointer {
            buttons: b[0],
            x: BigEndian::read_u16(&b[1..3]),
            y: BigEndian::read_u16(&b[3..5]),
        }
    }

    pub fn decode_key(b: &[u8; 7]) -> InputEvent {
        InputEvent::Key {
            down: b[0] == 1,
            keysym: BigEndian::read_u32(&b[3..7]),
        }
    }

    /// The message payload this event came from, without the type byte.
    pub fn encode(&self) -> Vec<u8> {
        match *self {
            InputEvent::Pointer { buttons, x, y } => {
                let mut b = vec![0u8; 5];
                b[0] = buttons;
                BigEndian::write_u16(&mut b[1..3], x);
                BigEndian::write_u16(&mut b[3..5], y);
                b
            }
            InputEvent::Key { down, keysym } => {
                let mut b = vec![0u8; 7];
                b[0] = down as u8;
                BigEndian::write_u32(&mut b[3..7], keysym);
                b
            }
        }
    }
}

/// Length field of a ClientCutText header (3 bytes padding, 4 bytes
/// length, text follows).
pub fn decode_cut_len(b: &[u8; 7]) -> usize {
    BigEndian::read_u32(&b[3..7]) as usize
}

pub fn encode_cut(text: &str) -> Vec<u8> {
    let mut b = vec![0u8; 7 + text.len()];
    BigEndian::write_u32(&mut b[3..7], text.len() as u32);
    b[7..].copy_from_slice(text.as_bytes());
    b
}

/// Count field of a SetEncodings header (1 byte padding, 2 bytes count).
pub fn decode_encoding_count(b: &[u8; 3]) -> usize {
    BigEndian::read_u16(&b[1..3]) as usize
}

pub fn decode_encodings(b: &[u8]) -> Vec<i32> {
    b.chunks_exact(4).map(BigEndian::read_i32).collect()
}

pub fn encode_encodings(encodings: &[i32]) -> Vec<u8> {
    let mut b = vec![0u8; 3 + 4 * encodings.len()];
    BigEndian::write_u16(&mut b[1..3], encodings.len() as u16);
    for (i, e) in encodings.iter().enumerate() {
        BigEndian::write_i32(&mut b[3 + 4 * i..7 + 4 * i], *e);
    }
    b
}

/// 12-byte rectangle header inside a FramebufferUpdate.
pub fn rect_header(rect: Rect, encoding: i32) -> [u8; 12] {
    let mut b = [0u8; 12];
    BigEndian::write_u16(&mut b[0..2], rect.x0 as u16);
    BigEndian::write_u16(&mut b[2..4], rect.y0 as u16);
    BigEndian::write_u16(&mut b[4..6], rect.width() as u16);
    BigEndian::write_u16(&mut b[6..8], rect.height() as u16);
    BigEndian::write_i32(&mut b[8..12], encoding);
    b
}

/// Raw-encodes one rectangle of the surface: `w*h*4` bytes, top-down
/// row-major, each pixel as blue, green, red, alpha.
pub fn encode_raw(fb: &Surface, rect: Rect) -> Vec<u8> {
    let w = rect.width() as usize;
    let h = rect.height() as usize;
    let mut buf = vec![0u8; w * h * 4];
    let mut i = 0;
    for y in rect.y0..rect.y1 {
        for x in rect.x0..rect.x1 {
            let [r, g, b, a] = fb.pixel(x, y);
            buf[i] = b;
            buf[i + 1] = g;
            buf[i + 2] = r;
            buf[i + 3] = a;
            i += 4;
        }
    }
    buf
}

/// Builds a complete FramebufferUpdate response for a dirty region as a
/// list of byte chunks: one message header, then a header and a Raw
/// payload per rectangle. Chunks are written to the socket back to back.
pub fn encode_update(fb: &Surface, dirty: &Dirty) -> Vec<Vec<u8>> {
    let rects = dirty.rects();
    if rects.is_empty() {
        return vec![];
    }

    let mut out = Vec::with_capacity(1 + 2 * rects.len());
    let mut head = vec![0u8; 4];
    head[0] = FRAMEBUFFER_UPDATE;
    BigEndian::write_u16(&mut head[2..4], rects.len() as u16);
    out.push(head);
    for r in rects {
        out.push(rect_header(r, ENCODING_RAW).to_vec());
        out.push(encode_raw(fb, r));
    }
    out
}
