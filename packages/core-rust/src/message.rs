//! Wire message type and binary frame codec for the device protocol.
//!
//! A frame is laid out as:
//!
//! ```text
//! [kind:1][flags:1][id_len:1][id: id_len bytes][payload_len:4 BE][payload]
//! ```
//!
//! Encode and decode form a total bijection on well-formed frames: every
//! encoded frame decodes back to an equal `Message`, and every decode
//! failure names the malformation. Message ids are opaque byte tokens;
//! their uniqueness (per connection, per in-flight request) is enforced by
//! the connection layer, not by the codec.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Maximum length of a message id in bytes (the id length is a single byte
/// on the wire).
pub const MAX_ID_LEN: usize = 255;

/// Marker bit: the peer asked for the message to be retained for late
/// pollers.
pub const FLAG_RETAINED: u8 = 0b0000_0001;

/// Marker bit: the message should bypass handler-side batching.
pub const FLAG_URGENT: u8 = 0b0000_0010;

// ---------------------------------------------------------------------------
// MessageKind
// ---------------------------------------------------------------------------

/// Discriminates the five frame kinds carried on a device connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Server-to-device (or device-to-server) call expecting a `Response`
    /// with the same id.
    Request,
    /// Reply to a `Request`, matched by id.
    Response,
    /// One-way message; no reply is ever produced.
    Notification,
    /// Keepalive probe. The receiver answers with `Pong` and extends the
    /// sender's idle deadline.
    Ping,
    /// Keepalive answer; payload carries the responder's clock in unix
    /// milliseconds.
    Pong,
}

impl MessageKind {
    /// The one-byte wire tag for this kind.
    #[must_use]
    pub const fn wire_tag(self) -> u8 {
        match self {
            Self::Request => 1,
            Self::Response => 2,
            Self::Notification => 3,
            Self::Ping => 4,
            Self::Pong => 5,
        }
    }

    /// Parses a wire tag back into a kind.
    const fn from_wire_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Request),
            2 => Some(Self::Response),
            3 => Some(Self::Notification),
            4 => Some(Self::Ping),
            5 => Some(Self::Pong),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A single protocol message as carried on a device connection.
///
/// `id` and `payload` are cheaply cloneable [`Bytes`]; cloning a `Message`
/// never copies frame data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    /// Opaque token matching a `Response` to its `Request`. May be empty
    /// for kinds that are never correlated (`Notification`, `Ping`, `Pong`).
    pub id: Bytes,
    pub payload: Bytes,
    /// Marker bits ([`FLAG_RETAINED`], [`FLAG_URGENT`]); carried opaque.
    pub flags: u8,
}

impl Message {
    /// Builds a request frame.
    #[must_use]
    pub fn request(id: impl Into<Bytes>, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: MessageKind::Request,
            id: id.into(),
            payload: payload.into(),
            flags: 0,
        }
    }

    /// Builds a response frame answering the request with the given id.
    #[must_use]
    pub fn response(id: impl Into<Bytes>, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: MessageKind::Response,
            id: id.into(),
            payload: payload.into(),
            flags: 0,
        }
    }

    /// Builds a one-way notification frame.
    #[must_use]
    pub fn notification(id: impl Into<Bytes>, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: MessageKind::Notification,
            id: id.into(),
            payload: payload.into(),
            flags: 0,
        }
    }

    /// Builds a ping frame.
    #[must_use]
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self {
            kind: MessageKind::Ping,
            id: Bytes::new(),
            payload: payload.into(),
            flags: 0,
        }
    }

    /// Builds a pong frame.
    #[must_use]
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self {
            kind: MessageKind::Pong,
            id: Bytes::new(),
            payload: payload.into(),
            flags: 0,
        }
    }

    /// Sets marker bits, consuming and returning the message.
    #[must_use]
    pub const fn with_flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    /// Whether the given marker bit(s) are all set.
    #[must_use]
    pub const fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag == flag
    }

    /// Serializes the message into a wire frame.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::IdTooLong`] when the id exceeds [`MAX_ID_LEN`];
    /// every other message encodes successfully.
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        if self.id.len() > MAX_ID_LEN {
            return Err(CodecError::IdTooLong { len: self.id.len() });
        }

        let mut buf = BytesMut::with_capacity(3 + self.id.len() + 4 + self.payload.len());
        buf.put_u8(self.kind.wire_tag());
        buf.put_u8(self.flags);
        #[allow(clippy::cast_possible_truncation)] // checked against MAX_ID_LEN above
        buf.put_u8(self.id.len() as u8);
        buf.put_slice(&self.id);
        buf.put_u32(u32::try_from(self.payload.len()).map_err(|_| CodecError::PayloadTooLong {
            len: self.payload.len(),
        })?);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Parses a wire frame back into a message.
    ///
    /// The full frame must be present: short input fails with
    /// [`CodecError::Truncated`] and extra bytes after the payload fail with
    /// [`CodecError::TrailingBytes`].
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] naming the malformation.
    pub fn decode(frame: &[u8]) -> Result<Self, CodecError> {
        let mut buf = frame;
        if buf.remaining() < 3 {
            return Err(CodecError::Truncated);
        }

        let tag = buf.get_u8();
        let kind = MessageKind::from_wire_tag(tag).ok_or(CodecError::UnknownKind { tag })?;
        let flags = buf.get_u8();
        let id_len = buf.get_u8() as usize;

        if buf.remaining() < id_len {
            return Err(CodecError::Truncated);
        }
        let id = Bytes::copy_from_slice(&buf[..id_len]);
        buf.advance(id_len);

        if buf.remaining() < 4 {
            return Err(CodecError::Truncated);
        }
        let payload_len = buf.get_u32() as usize;

        if buf.remaining() < payload_len {
            return Err(CodecError::Truncated);
        }
        let payload = Bytes::copy_from_slice(&buf[..payload_len]);
        buf.advance(payload_len);

        if buf.has_remaining() {
            return Err(CodecError::TrailingBytes {
                extra: buf.remaining(),
            });
        }

        Ok(Self {
            kind,
            id,
            payload,
            flags,
        })
    }
}

// ---------------------------------------------------------------------------
// CodecError
// ---------------------------------------------------------------------------

/// Frame encode/decode failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("message id of {len} bytes exceeds the {MAX_ID_LEN}-byte limit")]
    IdTooLong { len: usize },

    #[error("payload of {len} bytes exceeds the u32 length prefix")]
    PayloadTooLong { len: usize },

    #[error("unknown frame kind tag {tag:#04x}")]
    UnknownKind { tag: u8 },

    #[error("frame ends before the declared lengths are satisfied")]
    Truncated,

    #[error("{extra} bytes trail the declared payload")]
    TrailingBytes { extra: usize },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn roundtrip(msg: &Message) -> Message {
        let frame = msg.encode().expect("encode");
        Message::decode(&frame).expect("decode")
    }

    #[test]
    fn request_roundtrip() {
        let msg = Message::request(&b"42"[..], &b"telemetry"[..]);
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn response_roundtrip() {
        let msg = Message::response(&b"42"[..], &b"ok"[..]);
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn notification_roundtrip_with_flags() {
        let msg =
            Message::notification(&b"n-1"[..], &b"{\"temp\":21.5}"[..]).with_flags(FLAG_URGENT);
        let decoded = roundtrip(&msg);
        assert_eq!(decoded, msg);
        assert!(decoded.has_flag(FLAG_URGENT));
        assert!(!decoded.has_flag(FLAG_RETAINED));
    }

    #[test]
    fn ping_pong_roundtrip_empty_id() {
        for msg in [Message::ping(&b""[..]), Message::pong(&b"1700000000000"[..])] {
            assert_eq!(roundtrip(&msg), msg);
        }
    }

    #[test]
    fn empty_payload_roundtrip() {
        let msg = Message::request(&b"1"[..], Bytes::new());
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn encode_rejects_oversized_id() {
        let msg = Message::request(vec![b'x'; MAX_ID_LEN + 1], Bytes::new());
        assert_eq!(
            msg.encode(),
            Err(CodecError::IdTooLong { len: MAX_ID_LEN + 1 })
        );
    }

    #[test]
    fn max_length_id_roundtrips() {
        let msg = Message::request(vec![b'x'; MAX_ID_LEN], &b"p"[..]);
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn decode_rejects_unknown_kind() {
        let mut frame = Message::request(&b"1"[..], &b"p"[..])
            .encode()
            .unwrap()
            .to_vec();
        frame[0] = 0x7f;
        assert_eq!(
            Message::decode(&frame),
            Err(CodecError::UnknownKind { tag: 0x7f })
        );
    }

    #[test]
    fn decode_rejects_truncated_frames() {
        let frame = Message::request(&b"abc"[..], &b"payload"[..])
            .encode()
            .unwrap();
        // Every proper prefix must fail as truncated.
        for cut in 0..frame.len() {
            assert_eq!(
                Message::decode(&frame[..cut]),
                Err(CodecError::Truncated),
                "prefix of {cut} bytes should be truncated"
            );
        }
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        let mut frame = Message::request(&b"1"[..], &b"p"[..])
            .encode()
            .unwrap()
            .to_vec();
        frame.extend_from_slice(&[0, 0]);
        assert_eq!(
            Message::decode(&frame),
            Err(CodecError::TrailingBytes { extra: 2 })
        );
    }

    #[test]
    fn wire_tags_are_stable() {
        // The tags are a wire contract shared with device firmware; a change
        // here breaks deployed fleets.
        assert_eq!(MessageKind::Request.wire_tag(), 1);
        assert_eq!(MessageKind::Response.wire_tag(), 2);
        assert_eq!(MessageKind::Notification.wire_tag(), 3);
        assert_eq!(MessageKind::Ping.wire_tag(), 4);
        assert_eq!(MessageKind::Pong.wire_tag(), 5);
    }

    proptest! {
        #[test]
        fn arbitrary_frames_roundtrip(
            tag in 1u8..=5,
            flags in any::<u8>(),
            id in proptest::collection::vec(any::<u8>(), 0..=MAX_ID_LEN),
            payload in proptest::collection::vec(any::<u8>(), 0..2048),
        ) {
            let msg = Message {
                kind: MessageKind::from_wire_tag(tag).unwrap(),
                id: Bytes::from(id),
                payload: Bytes::from(payload),
                flags,
            };
            prop_assert_eq!(roundtrip(&msg), msg);
        }
    }
}
