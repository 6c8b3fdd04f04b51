//! Protocol frame model.
//!
//! A [`Frame`] is the unit exchanged over a control connection: a
//! [`FrameKind`], the multiplexing key (`conn_id`) and an opaque payload.
//! `conn_id` 0 ([`CONTROL_CONN_ID`]) addresses the session itself; every other
//! value addresses one guest link.

use std::borrow::Cow;
use std::fmt;

/// Identifier of a guest link within one session.
pub type ConnId = u32;

/// Connection id reserved for control-plane frames.
pub const CONTROL_CONN_ID: ConnId = 0;

/// Frame kinds and their wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Ping,
    AuthRequest,
    AuthResponse,
    Ok,
    Error,
    SessionMeta,
    GuestConnect,
    GuestDisconnect,
    Data,
    /// A wire value this build does not know. The frame's payload is still
    /// consumed, so the stream stays in sync and the session decides.
    Unknown(u16),
}

impl FrameKind {
    /// All known kinds, in wire-value order.
    pub const ALL: [FrameKind; 9] = [
        FrameKind::Ping,
        FrameKind::AuthRequest,
        FrameKind::AuthResponse,
        FrameKind::Ok,
        FrameKind::Error,
        FrameKind::SessionMeta,
        FrameKind::GuestConnect,
        FrameKind::GuestDisconnect,
        FrameKind::Data,
    ];

    /// The 16-bit value written on the wire.
    pub fn as_u16(self) -> u16 {
        match self {
            FrameKind::Ping => 0,
            FrameKind::AuthRequest => 1,
            FrameKind::AuthResponse => 2,
            FrameKind::Ok => 3,
            FrameKind::Error => 4,
            FrameKind::SessionMeta => 5,
            FrameKind::GuestConnect => 6,
            FrameKind::GuestDisconnect => 7,
            FrameKind::Data => 8,
            FrameKind::Unknown(value) => value,
        }
    }

    pub fn is_known(self) -> bool {
        !matches!(self, FrameKind::Unknown(_))
    }
}

impl From<u16> for FrameKind {
    fn from(value: u16) -> Self {
        FrameKind::ALL
            .get(value as usize)
            .copied()
            .unwrap_or(FrameKind::Unknown(value))
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub conn_id: ConnId,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(kind: FrameKind, conn_id: ConnId, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            conn_id,
            payload: payload.into(),
        }
    }

    /// Keepalive frame with an empty payload.
    pub fn ping() -> Self {
        Self::new(FrameKind::Ping, CONTROL_CONN_ID, Vec::new())
    }

    pub fn auth_request(challenge: &str) -> Self {
        Self::new(FrameKind::AuthRequest, CONTROL_CONN_ID, challenge)
    }

    /// The bridge's answer to an `AuthRequest`; the payload is the opaque credential.
    pub fn auth_response(credential: impl Into<Vec<u8>>) -> Self {
        Self::new(FrameKind::AuthResponse, CONTROL_CONN_ID, credential)
    }

    pub fn ok(message: impl Into<String>) -> Self {
        Self::new(FrameKind::Ok, CONTROL_CONN_ID, message.into())
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(FrameKind::Error, CONTROL_CONN_ID, message.into())
    }

    pub fn session_meta(meta: impl Into<String>) -> Self {
        Self::new(FrameKind::SessionMeta, CONTROL_CONN_ID, meta.into())
    }

    pub fn guest_connect(conn_id: ConnId) -> Self {
        Self::new(FrameKind::GuestConnect, conn_id, Vec::new())
    }

    pub fn guest_disconnect(conn_id: ConnId) -> Self {
        Self::new(FrameKind::GuestDisconnect, conn_id, Vec::new())
    }

    pub fn data(conn_id: ConnId, bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(FrameKind::Data, conn_id, bytes)
    }

    /// Payload as text, replacing invalid UTF-8.
    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_wire_values() {
        for (value, kind) in FrameKind::ALL.iter().enumerate() {
            assert_eq!(kind.as_u16() as usize, value);
            assert_eq!(FrameKind::from(value as u16), *kind);
        }
        assert_eq!(FrameKind::Data.as_u16(), 8);
    }

    #[test]
    fn unknown_values_are_preserved() {
        assert_eq!(FrameKind::from(9), FrameKind::Unknown(9));
        assert_eq!(FrameKind::from(u16::MAX).as_u16(), u16::MAX);
        assert!(!FrameKind::Unknown(9).is_known());
        assert!(FrameKind::ALL.iter().all(|k| k.is_known()));
    }

    #[test]
    fn control_frames_use_conn_zero() {
        assert_eq!(Frame::ping().conn_id, CONTROL_CONN_ID);
        assert!(Frame::ping().payload.is_empty());
        assert_eq!(Frame::ok("auth OK").conn_id, CONTROL_CONN_ID);
        assert_eq!(Frame::error("nope").payload_str(), "nope");
        assert_eq!(Frame::session_meta("game-x").kind, FrameKind::SessionMeta);
    }

    #[test]
    fn guest_frames_carry_conn_id() {
        let f = Frame::data(42, b"hello".to_vec());
        assert_eq!(f.conn_id, 42);
        assert_eq!(f.payload, b"hello");
        assert_eq!(Frame::guest_connect(7).conn_id, 7);
        assert!(Frame::guest_disconnect(7).payload.is_empty());
    }
}
