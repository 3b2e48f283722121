//! WebSocket frame parsing and serialization
//!
//! RFC 6455 frames as they appear on the wire:
//! - Payloads stay in wire form (still masked) until the codec decodes them
//! - The parser is a two-state machine that never consumes a partial header
//! - Unknown opcodes parse successfully so the codec can log and drop them

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::mask::apply_mask;
use crate::{MEDIUM_MESSAGE_THRESHOLD, SMALL_MESSAGE_THRESHOLD};

/// WebSocket opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    /// Continuation frame
    Continuation,
    /// Text frame
    Text,
    /// Binary frame
    Binary,
    /// Connection close
    Close,
    /// Ping
    Ping,
    /// Pong
    Pong,
    /// Reserved opcode with no assigned meaning
    Unknown(u8),
}

impl OpCode {
    /// Parse opcode from the low nibble of a byte
    #[inline]
    pub fn from_u8(byte: u8) -> Self {
        match byte & 0x0F {
            0x0 => OpCode::Continuation,
            0x1 => OpCode::Text,
            0x2 => OpCode::Binary,
            0x8 => OpCode::Close,
            0x9 => OpCode::Ping,
            0xA => OpCode::Pong,
            other => OpCode::Unknown(other),
        }
    }

    /// Wire value of this opcode
    #[inline]
    pub fn as_u8(self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
            OpCode::Unknown(code) => code & 0x0F,
        }
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(self) -> bool {
        self.as_u8() >= 0x8
    }

    /// Check if this is a data frame
    #[inline]
    pub fn is_data(self) -> bool {
        self.as_u8() <= 0x2
    }
}

/// A complete WebSocket frame
///
/// `payload` is exactly what travels on the wire: when `mask` is present the
/// bytes are masked with it. Use [`Frame::unmasked_payload`] to recover them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment flag
    pub fin: bool,
    /// Frame opcode
    pub opcode: OpCode,
    /// Masking key, present on client-to-server frames
    pub mask: Option<[u8; 4]>,
    /// Frame payload in wire form
    pub payload: Bytes,
}

impl Frame {
    /// Create a new unmasked frame
    pub fn new(opcode: OpCode, payload: Bytes, fin: bool) -> Self {
        Self {
            fin,
            opcode,
            mask: None,
            payload,
        }
    }

    /// Create a final binary frame
    #[inline]
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Binary, data.into(), true)
    }

    /// Create a close frame carrying a status code
    #[inline]
    pub fn close(code: u16) -> Self {
        Self::new(
            OpCode::Close,
            Bytes::copy_from_slice(&code.to_be_bytes()),
            true,
        )
    }

    /// Mask the payload with `mask` and record the key.
    ///
    /// The frame must not already be masked.
    pub fn masked(mut self, mask: [u8; 4]) -> Self {
        debug_assert!(self.mask.is_none(), "frame is already masked");
        let mut data = BytesMut::from(&self.payload[..]);
        apply_mask(&mut data, mask);
        self.payload = data.freeze();
        self.mask = Some(mask);
        self
    }

    /// Check whether the frame carries a masking key
    #[inline]
    pub fn is_masked(&self) -> bool {
        self.mask.is_some()
    }

    /// Payload with the mask removed
    pub fn unmasked_payload(&self) -> Bytes {
        match self.mask {
            Some(mask) => {
                let mut data = BytesMut::from(&self.payload[..]);
                apply_mask(&mut data, mask);
                data.freeze()
            }
            None => self.payload.clone(),
        }
    }

    /// Close status code, if the frame is a close frame carrying one
    pub fn close_code(&self) -> Option<u16> {
        if self.opcode != OpCode::Close {
            return None;
        }
        let payload = self.unmasked_payload();
        (payload.len() >= 2).then(|| u16::from_be_bytes([payload[0], payload[1]]))
    }

    /// Number of bytes [`Frame::encode`] writes
    #[inline]
    pub fn encoded_len(&self) -> usize {
        header_size(self.payload.len(), self.mask.is_some()) + self.payload.len()
    }

    /// Serialize the frame; the payload is written as stored.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        put_header(buf, self.fin, self.opcode, self.payload.len(), self.mask);
        buf.put_slice(&self.payload);
    }
}

/// Parsed header of the frame whose payload is pending
#[derive(Debug, Clone, Copy)]
struct FrameHead {
    fin: bool,
    opcode: OpCode,
    mask: Option<[u8; 4]>,
    payload_len: usize,
}

/// Frame parser state machine
#[derive(Debug, Clone, Copy)]
enum ParseState {
    /// Waiting for a complete header
    Header,
    /// Header consumed, waiting for the payload
    Payload(FrameHead),
}

/// Streaming frame parser
///
/// Feed it the receive buffer after every read; complete frames are split
/// off the front of the buffer, partial ones are left in place.
#[derive(Debug)]
pub struct FrameParser {
    state: ParseState,
    max_frame_size: usize,
}

impl FrameParser {
    /// Create a new frame parser
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            state: ParseState::Header,
            max_frame_size,
        }
    }

    /// Parse a frame from the buffer
    ///
    /// Returns:
    /// - Ok(Some(frame)) if a complete frame was parsed
    /// - Ok(None) if more data is needed
    /// - Err(e) if parsing failed
    pub fn parse(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        loop {
            match self.state {
                ParseState::Header => match parse_head(buf, self.max_frame_size)? {
                    Some(head) => self.state = ParseState::Payload(head),
                    None => return Ok(None),
                },
                ParseState::Payload(head) => {
                    if buf.len() < head.payload_len {
                        return Ok(None);
                    }

                    let payload = buf.split_to(head.payload_len).freeze();
                    self.state = ParseState::Header;

                    return Ok(Some(Frame {
                        fin: head.fin,
                        opcode: head.opcode,
                        mask: head.mask,
                        payload,
                    }));
                }
            }
        }
    }

    /// Whether the parser holds a header whose payload has not arrived
    #[inline]
    pub fn is_mid_frame(&self) -> bool {
        matches!(self.state, ParseState::Payload(_))
    }
}

/// Validate and consume one frame header, or leave `buf` untouched.
fn parse_head(buf: &mut BytesMut, max_frame_size: usize) -> Result<Option<FrameHead>> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let b0 = buf[0];
    let b1 = buf[1];

    let fin = b0 & 0x80 != 0;
    // No extension is ever negotiated
    if b0 & 0x70 != 0 {
        return Err(Error::Protocol("reserved bits must be 0"));
    }

    let opcode = OpCode::from_u8(b0);
    if opcode.is_control() && !fin {
        return Err(Error::Protocol("control frame must not be fragmented"));
    }

    let masked = b1 & 0x80 != 0;
    let len_byte = b1 & 0x7F;
    let len_size = match len_byte {
        126 => 2,
        127 => 8,
        _ => 0,
    };

    let total = 2 + len_size + if masked { 4 } else { 0 };
    if buf.len() < total {
        return Ok(None);
    }

    let payload_len = match len_byte {
        126 => {
            let len = u16::from_be_bytes([buf[2], buf[3]]) as u64;
            if len <= SMALL_MESSAGE_THRESHOLD as u64 {
                return Err(Error::Protocol("payload length not minimal"));
            }
            len
        }
        127 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[2..10]);
            let len = u64::from_be_bytes(raw);
            if len >> 63 != 0 {
                return Err(Error::Protocol("payload length MSB must be 0"));
            }
            if len <= MEDIUM_MESSAGE_THRESHOLD as u64 {
                return Err(Error::Protocol("payload length not minimal"));
            }
            len
        }
        n => n as u64,
    };

    if opcode.is_control() && payload_len > SMALL_MESSAGE_THRESHOLD as u64 {
        return Err(Error::Protocol("control frame too large"));
    }
    if payload_len > max_frame_size as u64 {
        return Err(Error::FrameTooLarge);
    }

    let mask = masked.then(|| {
        let at = 2 + len_size;
        [buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]
    });

    buf.advance(total);

    Ok(Some(FrameHead {
        fin,
        opcode,
        mask,
        payload_len: payload_len as usize,
    }))
}

#[inline]
fn header_size(payload_len: usize, masked: bool) -> usize {
    2 + if payload_len > MEDIUM_MESSAGE_THRESHOLD {
        8
    } else if payload_len > SMALL_MESSAGE_THRESHOLD {
        2
    } else {
        0
    } + if masked { 4 } else { 0 }
}

#[inline]
fn put_header(
    buf: &mut BytesMut,
    fin: bool,
    opcode: OpCode,
    payload_len: usize,
    mask: Option<[u8; 4]>,
) {
    let mut b0 = opcode.as_u8();
    if fin {
        b0 |= 0x80;
    }
    buf.put_u8(b0);

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    if payload_len <= SMALL_MESSAGE_THRESHOLD {
        buf.put_u8(mask_bit | payload_len as u8);
    } else if payload_len <= MEDIUM_MESSAGE_THRESHOLD {
        buf.put_u8(mask_bit | 126);
        buf.put_u16(payload_len as u16);
    } else {
        buf.put_u8(mask_bit | 127);
        buf.put_u64(payload_len as u64);
    }

    if let Some(m) = mask {
        buf.put_slice(&m);
    }
}

/// Encode a frame into a buffer
///
/// `payload` is given unmasked; when `mask` is set it is copied and masked
/// in the output buffer.
#[inline]
pub fn encode_frame(
    buf: &mut BytesMut,
    opcode: OpCode,
    payload: &[u8],
    fin: bool,
    mask: Option<[u8; 4]>,
) {
    buf.reserve(header_size(payload.len(), mask.is_some()) + payload.len());
    put_header(buf, fin, opcode, payload.len(), mask);

    let start = buf.len();
    buf.put_slice(payload);
    if let Some(m) = mask {
        apply_mask(&mut buf[start..], m);
    }
}
