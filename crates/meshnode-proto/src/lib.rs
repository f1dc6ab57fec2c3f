//! Wire formats carried over the authenticated `PacketConn` session layer.
//!
//! Every packet read from or written to a session starts with one tag byte
//! ([`SessionTag`]) distinguishing application traffic from control
//! messages. Control messages carry a second byte ([`ControlType`]); debug
//! control messages carry a third ([`DebugType`]). See spec §4.5/§6.2.
//!
//! This crate only frames and unframes bytes — it has no I/O and no async,
//! so both the link manager and the core runtime can depend on it without a
//! cycle. Dispatch is a closed enum match, not a dynamic handler table, per
//! the "dynamic control dispatch" design note: a fixed, small set of
//! variants rather than a lookup structure in the hot read path.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Current handshake protocol version. Bumping the major version signals an
/// incompatible handshake frame layout.
pub const PROTOCOL_VERSION_MAJOR: u8 = 1;
pub const PROTOCOL_VERSION_MINOR: u8 = 0;

/// Largest local public-key-derived JSON blob this layer will frame
/// unexamined (nodeinfo, debug responses); enforced by callers, not here.
pub const MAX_CONTROL_PAYLOAD: usize = 16 * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtoError {
    #[error("packet truncated: expected at least {expected} byte(s), got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("unknown session tag byte {0:#04x}")]
    UnknownSessionTag(u8),
    #[error("unknown control type byte {0:#04x}")]
    UnknownControlType(u8),
    #[error("unknown debug type byte {0:#04x}")]
    UnknownDebugType(u8),
    #[error("domain name is {0} bytes, longer than the 255-byte length prefix allows")]
    DomainNameTooLong(usize),
}

/// The one leading byte every session packet carries (spec §6.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionTag {
    Traffic = 0x01,
    Control = 0x02,
}

impl TryFrom<u8> for SessionTag {
    type Error = ProtoError;

    fn try_from(b: u8) -> Result<Self, Self::Error> {
        match b {
            0x01 => Ok(SessionTag::Traffic),
            0x02 => Ok(SessionTag::Control),
            other => Err(ProtoError::UnknownSessionTag(other)),
        }
    }
}

/// The control-message type byte, following a [`SessionTag::Control`] tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlType {
    NodeInfoRequest = 0x01,
    NodeInfoResponse = 0x02,
    Debug = 0xFF,
}

impl TryFrom<u8> for ControlType {
    type Error = ProtoError;

    fn try_from(b: u8) -> Result<Self, Self::Error> {
        match b {
            0x01 => Ok(ControlType::NodeInfoRequest),
            0x02 => Ok(ControlType::NodeInfoResponse),
            0xFF => Ok(ControlType::Debug),
            other => Err(ProtoError::UnknownControlType(other)),
        }
    }
}

/// The debug sub-type byte, following a [`ControlType::Debug`] byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DebugType {
    Dummy = 0x00,
    GetSelfRequest = 0x01,
    GetSelfResponse = 0x02,
    GetPeersRequest = 0x03,
    GetPeersResponse = 0x04,
    GetTreeRequest = 0x05,
    GetTreeResponse = 0x06,
}

impl TryFrom<u8> for DebugType {
    type Error = ProtoError;

    fn try_from(b: u8) -> Result<Self, Self::Error> {
        match b {
            0x00 => Ok(DebugType::Dummy),
            0x01 => Ok(DebugType::GetSelfRequest),
            0x02 => Ok(DebugType::GetSelfResponse),
            0x03 => Ok(DebugType::GetPeersRequest),
            0x04 => Ok(DebugType::GetPeersResponse),
            0x05 => Ok(DebugType::GetTreeRequest),
            0x06 => Ok(DebugType::GetTreeResponse),
            other => Err(ProtoError::UnknownDebugType(other)),
        }
    }
}

/// A fully parsed session packet: either application traffic or a control
/// message (spec §4.4's inbound dispatch).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Traffic(Bytes),
    Control(ControlMessage),
}

impl Frame {
    /// Parse the leading tag byte and dispatch the remainder. Returns
    /// [`ProtoError::UnknownSessionTag`] for anything but `0x01`/`0x02`;
    /// per spec §4.4 the caller should simply discard such packets.
    pub fn parse(packet: Bytes) -> Result<Self, ProtoError> {
        if packet.is_empty() {
            return Err(ProtoError::Truncated {
                expected: 1,
                actual: 0,
            });
        }
        let tag = SessionTag::try_from(packet[0])?;
        let rest = packet.slice(1..);
        match tag {
            SessionTag::Traffic => Ok(Frame::Traffic(rest)),
            SessionTag::Control => Ok(Frame::Control(ControlMessage::parse(rest)?)),
        }
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        match self {
            Frame::Traffic(payload) => {
                buf.put_u8(SessionTag::Traffic as u8);
                buf.extend_from_slice(payload);
            }
            Frame::Control(msg) => {
                buf.put_u8(SessionTag::Control as u8);
                buf.unsplit(msg.encode());
            }
        }
        buf
    }
}

/// A control message, one layer in from the session tag (spec §4.5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    NodeInfoRequest,
    /// Payload is the remote's NodeInfo, serialized as JSON.
    NodeInfoResponse(Bytes),
    Debug(DebugMessage),
}

impl ControlMessage {
    pub fn parse(payload: Bytes) -> Result<Self, ProtoError> {
        if payload.is_empty() {
            return Err(ProtoError::Truncated {
                expected: 1,
                actual: 0,
            });
        }
        let control_type = ControlType::try_from(payload[0])?;
        let rest = payload.slice(1..);
        match control_type {
            ControlType::NodeInfoRequest => Ok(ControlMessage::NodeInfoRequest),
            ControlType::NodeInfoResponse => Ok(ControlMessage::NodeInfoResponse(rest)),
            ControlType::Debug => Ok(ControlMessage::Debug(DebugMessage::parse(rest)?)),
        }
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        match self {
            ControlMessage::NodeInfoRequest => {
                buf.put_u8(ControlType::NodeInfoRequest as u8);
            }
            ControlMessage::NodeInfoResponse(payload) => {
                buf.put_u8(ControlType::NodeInfoResponse as u8);
                buf.extend_from_slice(payload);
            }
            ControlMessage::Debug(msg) => {
                buf.put_u8(ControlType::Debug as u8);
                buf.unsplit(msg.encode());
            }
        }
        buf
    }
}

/// A debug request/response, one layer in from the control type (spec
/// §4.5). Request variants carry no payload; response variants carry a
/// caller-interpreted byte string (concatenated public keys for
/// `get_peers`/`get_tree`, a JSON object for `get_self`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugMessage {
    Dummy,
    GetSelfRequest,
    GetSelfResponse(Bytes),
    GetPeersRequest,
    GetPeersResponse(Bytes),
    GetTreeRequest,
    GetTreeResponse(Bytes),
}

impl DebugMessage {
    pub fn parse(payload: Bytes) -> Result<Self, ProtoError> {
        if payload.is_empty() {
            return Err(ProtoError::Truncated {
                expected: 1,
                actual: 0,
            });
        }
        let debug_type = DebugType::try_from(payload[0])?;
        let rest = payload.slice(1..);
        Ok(match debug_type {
            DebugType::Dummy => DebugMessage::Dummy,
            DebugType::GetSelfRequest => DebugMessage::GetSelfRequest,
            DebugType::GetSelfResponse => DebugMessage::GetSelfResponse(rest),
            DebugType::GetPeersRequest => DebugMessage::GetPeersRequest,
            DebugType::GetPeersResponse => DebugMessage::GetPeersResponse(rest),
            DebugType::GetTreeRequest => DebugMessage::GetTreeRequest,
            DebugType::GetTreeResponse => DebugMessage::GetTreeResponse(rest),
        })
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        match self {
            DebugMessage::Dummy => buf.put_u8(DebugType::Dummy as u8),
            DebugMessage::GetSelfRequest => buf.put_u8(DebugType::GetSelfRequest as u8),
            DebugMessage::GetSelfResponse(payload) => {
                buf.put_u8(DebugType::GetSelfResponse as u8);
                buf.extend_from_slice(payload);
            }
            DebugMessage::GetPeersRequest => buf.put_u8(DebugType::GetPeersRequest as u8),
            DebugMessage::GetPeersResponse(payload) => {
                buf.put_u8(DebugType::GetPeersResponse as u8);
                buf.extend_from_slice(payload);
            }
            DebugMessage::GetTreeRequest => buf.put_u8(DebugType::GetTreeRequest as u8),
            DebugMessage::GetTreeResponse(payload) => {
                buf.put_u8(DebugType::GetTreeResponse as u8);
                buf.extend_from_slice(payload);
            }
        }
        buf
    }
}

/// The peer handshake metadata frame (spec §6.2), sent by both sides before
/// either treats the transport connection as up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeFrame {
    pub version_major: u8,
    pub version_minor: u8,
    pub public_key: [u8; 32],
    pub domain_name: String,
}

impl HandshakeFrame {
    pub fn new(public_key: [u8; 32], domain_name: impl Into<String>) -> Result<Self, ProtoError> {
        let domain_name = domain_name.into();
        if domain_name.len() > u8::MAX as usize {
            return Err(ProtoError::DomainNameTooLong(domain_name.len()));
        }
        Ok(HandshakeFrame {
            version_major: PROTOCOL_VERSION_MAJOR,
            version_minor: PROTOCOL_VERSION_MINOR,
            public_key,
            domain_name,
        })
    }

    /// Whether a peer announcing `other_major` is compatible with us (spec
    /// §4.2: drop the connection on a major version mismatch).
    pub fn major_compatible(&self, other_major: u8) -> bool {
        self.version_major == other_major
    }

    pub fn encode(&self) -> BytesMut {
        let name_bytes = self.domain_name.as_bytes();
        let mut buf = BytesMut::with_capacity(2 + 32 + 1 + name_bytes.len());
        buf.put_u8(self.version_major);
        buf.put_u8(self.version_minor);
        buf.extend_from_slice(&self.public_key);
        buf.put_u8(name_bytes.len() as u8);
        buf.extend_from_slice(name_bytes);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        const HEADER_LEN: usize = 1 + 1 + 32 + 1;
        if buf.len() < HEADER_LEN {
            return Err(ProtoError::Truncated {
                expected: HEADER_LEN,
                actual: buf.len(),
            });
        }
        let version_major = buf[0];
        let version_minor = buf[1];
        let mut public_key = [0u8; 32];
        public_key.copy_from_slice(&buf[2..34]);
        let name_len = buf[34] as usize;
        if buf.len() < HEADER_LEN + name_len {
            return Err(ProtoError::Truncated {
                expected: HEADER_LEN + name_len,
                actual: buf.len(),
            });
        }
        let domain_name = String::from_utf8_lossy(&buf[HEADER_LEN..HEADER_LEN + name_len]).into_owned();
        Ok(HandshakeFrame {
            version_major,
            version_minor,
            public_key,
            domain_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_frame_round_trips() {
        let frame = HandshakeFrame::new([7u8; 32], "example").unwrap();
        let encoded = frame.encode();
        let decoded = HandshakeFrame::decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn handshake_frame_rejects_truncated_input() {
        let frame = HandshakeFrame::new([1u8; 32], "node-1").unwrap();
        let encoded = frame.encode();
        let err = HandshakeFrame::decode(&encoded[..10]).unwrap_err();
        assert!(matches!(err, ProtoError::Truncated { .. }));
    }

    #[test]
    fn handshake_frame_empty_name_round_trips() {
        let frame = HandshakeFrame::new([0u8; 32], "").unwrap();
        let decoded = HandshakeFrame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded.domain_name, "");
    }

    #[test]
    fn traffic_frame_round_trips() {
        let payload = Bytes::from_static(b"hello overlay");
        let frame = Frame::Traffic(payload.clone());
        let encoded = frame.encode().freeze();
        let parsed = Frame::parse(encoded).unwrap();
        assert_eq!(parsed, Frame::Traffic(payload));
    }

    #[test]
    fn nodeinfo_request_round_trips() {
        let frame = Frame::Control(ControlMessage::NodeInfoRequest);
        let encoded = frame.encode().freeze();
        assert_eq!(Frame::parse(encoded).unwrap(), frame);
    }

    #[test]
    fn nodeinfo_response_round_trips() {
        let json = Bytes::from_static(br#"{"buildname":"meshnode"}"#);
        let frame = Frame::Control(ControlMessage::NodeInfoResponse(json.clone()));
        let encoded = frame.encode().freeze();
        assert_eq!(Frame::parse(encoded).unwrap(), frame);
    }

    #[test]
    fn debug_get_self_request_round_trips() {
        let frame = Frame::Control(ControlMessage::Debug(DebugMessage::GetSelfRequest));
        let encoded = frame.encode().freeze();
        assert_eq!(Frame::parse(encoded).unwrap(), frame);
    }

    #[test]
    fn debug_get_peers_response_round_trips() {
        let keys = Bytes::from(vec![0xAB; 32 * 3]);
        let frame = Frame::Control(ControlMessage::Debug(DebugMessage::GetPeersResponse(
            keys.clone(),
        )));
        let encoded = frame.encode().freeze();
        assert_eq!(Frame::parse(encoded).unwrap(), frame);
    }

    #[test]
    fn unknown_session_tag_is_rejected() {
        let err = Frame::parse(Bytes::from_static(&[0x7F, 0x00])).unwrap_err();
        assert_eq!(err, ProtoError::UnknownSessionTag(0x7F));
    }

    #[test]
    fn unknown_control_type_is_rejected() {
        let err = ControlMessage::parse(Bytes::from_static(&[0x55])).unwrap_err();
        assert_eq!(err, ProtoError::UnknownControlType(0x55));
    }

    #[test]
    fn unknown_debug_type_is_rejected() {
        let err = DebugMessage::parse(Bytes::from_static(&[0x44])).unwrap_err();
        assert_eq!(err, ProtoError::UnknownDebugType(0x44));
    }

    #[test]
    fn empty_packet_is_truncated_not_panicking() {
        let err = Frame::parse(Bytes::new()).unwrap_err();
        assert_eq!(
            err,
            ProtoError::Truncated {
                expected: 1,
                actual: 0
            }
        );
    }
}
