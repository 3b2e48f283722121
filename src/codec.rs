//! Duplex frame codec
//!
//! Translates between the byte stream the upper protocol writes and single,
//! final binary WebSocket frames. The codec never originates ping, pong or
//! fragmented frames; inbound ones are logged and dropped.

use bytes::{Bytes, BytesMut};

use crate::frame::{Frame, OpCode, encode_frame};
use crate::mask::generate_mask;

/// Which side of the connection this endpoint is
///
/// Fixed for the lifetime of a connection. The initiator dials and masks
/// every frame it sends; the acceptor listens and never masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dialing side (WebSocket client)
    Initiator,
    /// Listening side (WebSocket server)
    Acceptor,
}

impl Role {
    /// Whether outbound frames from this role carry a mask
    #[inline]
    pub fn masks_outbound(self) -> bool {
        matches!(self, Role::Initiator)
    }
}

/// Result of decoding one inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// Unmasked payload of a text or binary frame
    Data(Bytes),
    /// Peer sent a close frame; the channel must be closed
    Close,
    /// Frame was logged and dropped
    Ignored,
}

/// Role-parameterized frame codec
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    role: Role,
}

impl FrameCodec {
    /// Create a codec for `role`
    pub fn new(role: Role) -> Self {
        Self { role }
    }

    /// The role this codec encodes for
    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    #[inline]
    fn outbound_mask(&self) -> Option<[u8; 4]> {
        self.role.masks_outbound().then(generate_mask)
    }

    /// Wrap `payload` in a single final binary frame.
    ///
    /// Initiator frames get a fresh random key and a masked payload;
    /// acceptor frames carry the payload as given.
    pub fn encode(&self, payload: &[u8]) -> Frame {
        let frame = Frame::binary(Bytes::copy_from_slice(payload));
        match self.outbound_mask() {
            Some(mask) => frame.masked(mask),
            None => frame,
        }
    }

    /// Serialize the frame [`FrameCodec::encode`] would build straight into `buf`.
    #[inline]
    pub fn encode_into(&self, payload: &[u8], buf: &mut BytesMut) {
        encode_frame(buf, OpCode::Binary, payload, true, self.outbound_mask());
    }

    /// Serialize a close frame carrying `code`
    pub fn encode_close(&self, code: u16, buf: &mut BytesMut) {
        encode_frame(
            buf,
            OpCode::Close,
            &code.to_be_bytes(),
            true,
            self.outbound_mask(),
        );
    }

    /// Map an inbound frame to the action the stream takes.
    pub fn decode(&self, frame: Frame) -> Decoded {
        let expect_masked = !self.role.masks_outbound();
        if frame.is_masked() != expect_masked {
            tracing::warn!(
                role = ?self.role,
                masked = frame.is_masked(),
                "peer frame masking does not match its role"
            );
        }

        match frame.opcode {
            OpCode::Text | OpCode::Binary => {
                if !frame.fin {
                    tracing::warn!(
                        opcode = ?frame.opcode,
                        "fragmented message start; fragments are not reassembled"
                    );
                }
                Decoded::Data(frame.unmasked_payload())
            }
            OpCode::Close => {
                tracing::debug!(code = ?frame.close_code(), "close frame received");
                Decoded::Close
            }
            OpCode::Ping | OpCode::Pong => {
                tracing::warn!(opcode = ?frame.opcode, "control frame ignored");
                Decoded::Ignored
            }
            OpCode::Continuation => {
                tracing::warn!("continuation frame dropped; fragmented messages are unsupported");
                Decoded::Ignored
            }
            OpCode::Unknown(code) => {
                tracing::warn!(opcode = code, "frame with unknown opcode ignored");
                Decoded::Ignored
            }
        }
    }
}
