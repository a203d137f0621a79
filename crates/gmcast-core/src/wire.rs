//! GMCast wire format.
//!
//! Every datagram starts with a fixed 24-byte header; protocol messages
//! (handshake, topology) append a type-specific body, user payloads follow
//! the header verbatim. Multi-byte integers are network byte order. The
//! header is a zerocopy type so it can be read straight off the datagram
//! without allocation; variable-length bodies go through `bytes`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::link::LinkMap;
use crate::node::NodeId;

/// Current wire format version. A frame with any other version is dropped
/// and the peer that sent it is failed.
pub const WIRE_VERSION: u8 = 0;

pub const T_HANDSHAKE: u8 = 1;
pub const T_HANDSHAKE_RESPONSE: u8 = 2;
pub const T_HANDSHAKE_OK: u8 = 3;
pub const T_HANDSHAKE_FAIL: u8 = 4;
pub const T_TOPOLOGY_CHANGE: u8 = 5;

/// Types at or above this value carry user payload and bypass the
/// connection state machine entirely.
pub const T_USER_BASE: u8 = 8;

// ── Frame header ─────────────────────────────────────────────────────────────

/// Fixed header preceding every GMCast datagram.
///
/// Wire size: 24 bytes. For user frames the `flags` byte carries the
/// forwarding TTL; protocol frames keep it zero.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct FrameHeader {
    pub version: u8,
    pub msg_type: u8,
    pub flags: u8,
    pub reserved: u8,
    pub source_uuid: [u8; 16],
    pub seq: U32<BigEndian>,
}

assert_eq_size!(FrameHeader, [u8; 24]);

/// Header length in bytes; user payload starts at this offset.
pub const HEADER_SIZE: usize = std::mem::size_of::<FrameHeader>();

// ── Messages ─────────────────────────────────────────────────────────────────

/// Handshake body, shared by `T_HANDSHAKE` and `T_HANDSHAKE_RESPONSE`.
///
/// `handshake_uuid` is the per-connection tie-break id: the acceptor draws
/// it and the connector echoes it back, so both endpoints agree on it.
/// `listen_addr` is the sender's advertised listen address, not the
/// ephemeral endpoint of the TCP connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub handshake_uuid: NodeId,
    pub group_name: String,
    pub listen_addr: String,
}

/// Type-specific message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Handshake(Handshake),
    HandshakeResponse(Handshake),
    HandshakeOk,
    HandshakeFail { reason: String },
    TopologyChange(LinkMap),
    /// User frame marker; the payload itself stays in the datagram and is
    /// sliced off at `HEADER_SIZE` by the dispatcher.
    User { ttl: u8 },
}

/// A decoded GMCast frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub source: NodeId,
    pub seq: u32,
    pub body: Body,
}

impl Message {
    pub fn msg_type(&self) -> u8 {
        match &self.body {
            Body::Handshake(_) => T_HANDSHAKE,
            Body::HandshakeResponse(_) => T_HANDSHAKE_RESPONSE,
            Body::HandshakeOk => T_HANDSHAKE_OK,
            Body::HandshakeFail { .. } => T_HANDSHAKE_FAIL,
            Body::TopologyChange(_) => T_TOPOLOGY_CHANGE,
            Body::User { .. } => T_USER_BASE,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + 64);
        let flags = match &self.body {
            Body::User { ttl } => *ttl,
            _ => 0,
        };
        let header = FrameHeader {
            version: WIRE_VERSION,
            msg_type: self.msg_type(),
            flags,
            reserved: 0,
            source_uuid: self.source.into_bytes(),
            seq: U32::new(self.seq),
        };
        buf.put_slice(header.as_bytes());

        match &self.body {
            Body::Handshake(hs) | Body::HandshakeResponse(hs) => {
                buf.put_slice(&hs.handshake_uuid.into_bytes());
                put_string(&mut buf, &hs.group_name);
                put_string(&mut buf, &hs.listen_addr);
            }
            Body::HandshakeOk => {}
            Body::HandshakeFail { reason } => put_string(&mut buf, reason),
            Body::TopologyChange(lm) => lm.encode_into(&mut buf),
            Body::User { .. } => {}
        }
        buf.freeze()
    }

    pub fn decode(dg: &[u8]) -> Result<Self, WireError> {
        let header = FrameHeader::read_from_prefix(dg).ok_or(WireError::Truncated)?;
        if header.version != WIRE_VERSION {
            return Err(WireError::UnknownVersion(header.version));
        }
        let source = NodeId::from_bytes(header.source_uuid);
        let seq = header.seq.get();
        let mut buf = &dg[HEADER_SIZE..];

        let body = match header.msg_type {
            T_HANDSHAKE => Body::Handshake(decode_handshake(&mut buf)?),
            T_HANDSHAKE_RESPONSE => Body::HandshakeResponse(decode_handshake(&mut buf)?),
            T_HANDSHAKE_OK => Body::HandshakeOk,
            T_HANDSHAKE_FAIL => Body::HandshakeFail {
                reason: get_string(&mut buf, "failure reason")?,
            },
            T_TOPOLOGY_CHANGE => Body::TopologyChange(LinkMap::decode(&mut buf)?),
            t if t >= T_USER_BASE => Body::User { ttl: header.flags },
            t => return Err(WireError::UnknownType(t)),
        };
        Ok(Self { source, seq, body })
    }
}

/// Encode a user frame: header plus the payload verbatim.
pub fn encode_user(source: NodeId, seq: u32, ttl: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    let header = FrameHeader {
        version: WIRE_VERSION,
        msg_type: T_USER_BASE,
        flags: ttl,
        reserved: 0,
        source_uuid: source.into_bytes(),
        seq: U32::new(seq),
    };
    buf.put_slice(header.as_bytes());
    buf.put_slice(payload);
    buf.freeze()
}

fn decode_handshake(buf: &mut impl Buf) -> Result<Handshake, WireError> {
    if buf.remaining() < 16 {
        return Err(WireError::Truncated);
    }
    let mut raw = [0u8; 16];
    buf.copy_to_slice(&mut raw);
    Ok(Handshake {
        handshake_uuid: NodeId::from_bytes(raw),
        group_name: get_string(buf, "group name")?,
        listen_addr: get_string(buf, "listen address")?,
    })
}

fn put_string(buf: &mut impl BufMut, s: &str) {
    debug_assert!(s.len() <= u16::MAX as usize);
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

pub(crate) fn get_string(buf: &mut impl Buf, what: &'static str) -> Result<String, WireError> {
    if buf.remaining() < 2 {
        return Err(WireError::Truncated);
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(WireError::Truncated);
    }
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    String::from_utf8(raw).map_err(|_| WireError::InvalidUtf8(what))
}

// ── Errors ───────────────────────────────────────────────────────────────────

/// Errors arising when interpreting wire-format data. All of these are
/// per-peer protocol violations: the peer that produced the frame is failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("frame truncated")]
    Truncated,

    #[error("unknown wire version: {0}")]
    UnknownVersion(u8),

    #[error("unknown message type: {0}")]
    UnknownType(u8),

    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("invalid link entry in topology body")]
    InvalidLink,
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn ids(seed: u64) -> (NodeId, NodeId) {
        let mut rng = StdRng::seed_from_u64(seed);
        (NodeId::random(&mut rng), NodeId::random(&mut rng))
    }

    #[test]
    fn header_layout_is_stable() {
        let msg = Message {
            source: NodeId::from_bytes([0x11; 16]),
            seq: 1,
            body: Body::HandshakeOk,
        };
        let bytes = msg.encode();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(
            hex::encode(&bytes),
            "000300001111111111111111111111111111111100000001"
        );
    }

    #[test]
    fn handshake_round_trip() {
        let (source, hs_uuid) = ids(1);
        let msg = Message {
            source,
            seq: 7,
            body: Body::Handshake(Handshake {
                handshake_uuid: hs_uuid,
                group_name: "galaxy".into(),
                listen_addr: "tcp://10.0.0.1:4567".into(),
            }),
        };
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn handshake_response_round_trip() {
        let (source, hs_uuid) = ids(2);
        let msg = Message {
            source,
            seq: 8,
            body: Body::HandshakeResponse(Handshake {
                handshake_uuid: hs_uuid,
                group_name: "galaxy".into(),
                listen_addr: "tcp://10.0.0.2:4567".into(),
            }),
        };
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn handshake_fail_round_trip() {
        let (source, _) = ids(3);
        let msg = Message {
            source,
            seq: 0,
            body: Body::HandshakeFail {
                reason: "invalid group".into(),
            },
        };
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn topology_change_round_trip() {
        let (source, other) = ids(4);
        let mut lm = LinkMap::new();
        lm.insert(other, "tcp://192.168.0.9:4567".into());
        let msg = Message {
            source,
            seq: 3,
            body: Body::TopologyChange(lm),
        };
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn user_frame_carries_payload_after_header() {
        let (source, _) = ids(5);
        let dg = encode_user(source, 42, 1, b"hello mesh");
        assert_eq!(&dg[HEADER_SIZE..], b"hello mesh");

        let msg = Message::decode(&dg).unwrap();
        assert_eq!(msg.source, source);
        assert_eq!(msg.seq, 42);
        assert_eq!(msg.body, Body::User { ttl: 1 });
    }

    #[test]
    fn truncated_frames_are_rejected() {
        let (source, hs_uuid) = ids(6);
        let msg = Message {
            source,
            seq: 1,
            body: Body::Handshake(Handshake {
                handshake_uuid: hs_uuid,
                group_name: "g".into(),
                listen_addr: "tcp://1.2.3.4:1".into(),
            }),
        };
        let bytes = msg.encode();
        for cut in [0, HEADER_SIZE - 1, HEADER_SIZE + 5, bytes.len() - 1] {
            assert!(
                matches!(Message::decode(&bytes[..cut]), Err(WireError::Truncated)),
                "cut at {cut} should be truncated"
            );
        }
    }

    #[test]
    fn unknown_version_is_rejected() {
        let (source, _) = ids(7);
        let mut bytes = BytesMut::from(&encode_user(source, 0, 1, b"x")[..]);
        bytes[0] = 0x7f;
        assert!(matches!(
            Message::decode(&bytes),
            Err(WireError::UnknownVersion(0x7f))
        ));
    }

    #[test]
    fn reserved_type_codes_are_rejected() {
        let (source, _) = ids(8);
        let mut bytes = BytesMut::from(&encode_user(source, 0, 1, b"")[..]);
        for t in [0u8, 6, 7] {
            bytes[1] = t;
            assert!(matches!(
                Message::decode(&bytes),
                Err(WireError::UnknownType(got)) if got == t
            ));
        }
    }
}
