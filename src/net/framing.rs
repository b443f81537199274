//! WebSocket v13 framing (RFC 6455 §5.2) and the handshake accept token.
//!
//! Deliberately small: text frames only, no fragmentation, no ping/pong.
//! Extended 64-bit lengths are read from their low 24 bits only, so the
//! largest frame either direction is `MAX_PAYLOAD_LEN` bytes.

use base64::prelude::*;
use bytes::{BufMut, Bytes, BytesMut};
use ring::digest;

use crate::buffer::Buffer;
use crate::error::FrameSignal;

/// RFC 6455 GUID appended to the client key.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

pub const OPCODE_TEXT: u8 = 0x1;
pub const OPCODE_CLOSE: u8 = 0x8;

const FIN: u8 = 0x80;
const MASK: u8 = 0x80;
const LEN_16: u8 = 126;
const LEN_64: u8 = 127;

/// Largest payload the 24-bit length window can express.
pub const MAX_PAYLOAD_LEN: usize = (1 << 24) - 1;

/// Computes `Sec-WebSocket-Accept` for a client `Sec-WebSocket-Key`.
///
/// Whitespace anywhere in `key` is stripped before hashing.
pub fn compute_accept_token(key: &str) -> String {
    let mut input: String = key.chars().filter(|c| !c.is_whitespace()).collect();
    input.push_str(WS_GUID);
    let hash = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, input.as_bytes());
    BASE64_STANDARD.encode(hash.as_ref())
}

/// XORs `buf` in place with the repeating 4-byte `key`.
#[inline]
pub fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Largest header a client frame can carry: 10 length bytes plus the mask key.
pub const MAX_HEADER_LEN: usize = 14;

/// Decodes one masked client frame into its payload.
///
/// A close frame yields `FrameSignal::Closing` whatever its mask bit and
/// length say. Anything that is not a masked text frame is `Unsupported`.
/// For the 64-bit length form only bytes 7..10 of the frame are read.
pub fn decode_frame(data: &Buffer) -> Result<Buffer, FrameSignal> {
    let raw = data.as_slice();
    require(raw, 1)?;

    let opcode = raw[0] & 0x0F;
    if opcode == OPCODE_CLOSE {
        return Err(FrameSignal::Closing);
    }

    require(raw, 2)?;
    let masked = raw[1] & MASK != 0;
    if !masked || opcode != OPCODE_TEXT {
        return Err(FrameSignal::Unsupported { opcode, masked });
    }

    let header = parse_header(raw)?;
    require(raw, header.frame_len())?;
    unmask_payload(raw, &header)
}

/// Decodes the frame at the front of a stream of client bytes.
///
/// Returns `None` while the frame is incomplete. Otherwise returns the
/// number of bytes the frame occupies together with its decode result, so
/// the caller can advance past frames that were dropped as well as
/// delivered ones. A close frame consumes everything that is left.
pub fn decode_next(raw: &[u8]) -> Option<(usize, Result<Buffer, FrameSignal>)> {
    let first = *raw.first()?;
    if first & 0x0F == OPCODE_CLOSE {
        return Some((raw.len(), Err(FrameSignal::Closing)));
    }

    // Header parsing only fails on missing bytes
    let header = parse_header(raw).ok()?;
    let consumed = header.frame_len();
    if raw.len() < consumed {
        return None;
    }

    let result = if header.masked && header.opcode == OPCODE_TEXT {
        unmask_payload(raw, &header)
    } else {
        Err(FrameSignal::Unsupported {
            opcode: header.opcode,
            masked: header.masked,
        })
    };
    Some((consumed, result))
}

struct Header {
    opcode: u8,
    masked: bool,
    payload_len: usize,
    /// Offset of the mask key, or of the payload when unmasked.
    offset: usize,
}

impl Header {
    fn payload_start(&self) -> usize {
        self.offset + if self.masked { 4 } else { 0 }
    }

    fn frame_len(&self) -> usize {
        self.payload_start() + self.payload_len
    }
}

fn parse_header(raw: &[u8]) -> Result<Header, FrameSignal> {
    require(raw, 2)?;
    let opcode = raw[0] & 0x0F;
    let masked = raw[1] & MASK != 0;

    let (payload_len, offset) = match raw[1] & 0x7F {
        LEN_16 => {
            require(raw, 4)?;
            (u16::from_be_bytes([raw[2], raw[3]]) as usize, 4)
        }
        LEN_64 => {
            require(raw, 10)?;
            // Bytes 2..7 of the 64-bit field are ignored.
            (u32::from_be_bytes([0, raw[7], raw[8], raw[9]]) as usize, 10)
        }
        len => (len as usize, 2),
    };

    let header = Header {
        opcode,
        masked,
        payload_len,
        offset,
    };
    require(raw, header.payload_start())?;
    Ok(header)
}

/// `raw` must hold the whole masked frame described by `header`.
fn unmask_payload(raw: &[u8], header: &Header) -> Result<Buffer, FrameSignal> {
    let offset = header.offset;
    let mask_key = [raw[offset], raw[offset + 1], raw[offset + 2], raw[offset + 3]];
    let start = header.payload_start();

    let mut payload = raw[start..start + header.payload_len].to_vec();
    apply_mask(&mut payload, mask_key);

    Ok(Buffer::from_bytes(payload)?)
}

/// Encodes `payload` as a single unmasked FIN text frame (server to client).
pub fn encode_frame(payload: &Buffer) -> Result<Buffer, FrameSignal> {
    let mut frame = BytesMut::with_capacity(header_len(payload.len())? + payload.len());
    put_header(&mut frame, payload.len(), 0);
    frame.extend_from_slice(payload.as_slice());
    Ok(Buffer::from_raw(frame.freeze()))
}

/// Encodes `payload` as a masked FIN text frame, the way a client sends it.
pub fn encode_client_frame(payload: &[u8], mask_key: [u8; 4]) -> Result<Vec<u8>, FrameSignal> {
    let mut frame = BytesMut::with_capacity(header_len(payload.len())? + 4 + payload.len());
    put_header(&mut frame, payload.len(), MASK);
    frame.put_slice(&mask_key);

    let start = frame.len();
    frame.extend_from_slice(payload);
    apply_mask(&mut frame[start..], mask_key);
    Ok(frame.to_vec())
}

/// Two-byte unmasked close frame with an empty body.
pub fn encode_close_frame() -> Buffer {
    Buffer::from_raw(Bytes::from_static(&[FIN | OPCODE_CLOSE, 0x00]))
}

fn header_len(payload_len: usize) -> Result<usize, FrameSignal> {
    match payload_len {
        0..=125 => Ok(2),
        126..=65535 => Ok(4),
        n if n <= MAX_PAYLOAD_LEN => Ok(10),
        n => Err(FrameSignal::TooLarge(n)),
    }
}

/// Writes byte 0, byte 1 and any extended length. `payload_len` must have
/// passed `header_len`.
fn put_header(dst: &mut BytesMut, payload_len: usize, mask_bit: u8) {
    // Byte 0: FIN | opcode text
    dst.put_u8(FIN | OPCODE_TEXT);

    // Byte 1: MASK | length tier
    if payload_len < LEN_16 as usize {
        dst.put_u8(mask_bit | payload_len as u8);
    } else if payload_len <= u16::MAX as usize {
        dst.put_u8(mask_bit | LEN_16);
        dst.put_u16(payload_len as u16);
    } else {
        // Only the low 24 bits of the 64-bit field are populated
        dst.put_u8(mask_bit | LEN_64);
        dst.put_bytes(0, 5);
        dst.put_uint(payload_len as u64, 3);
    }
}

#[inline]
fn require(raw: &[u8], needed: usize) -> Result<(), FrameSignal> {
    if raw.len() < needed {
        return Err(FrameSignal::Truncated {
            needed,
            available: raw.len(),
        });
    }
    Ok(())
}
