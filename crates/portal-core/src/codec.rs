//! Binary framing for the portal control connection.
//!
//! Wire format (big-endian):
//! `[2-byte kind][4-byte conn_id][4-byte length][length bytes of payload]`

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{PortalError, PortalResult};
use crate::frame::{ConnId, Frame, FrameKind};

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 10;

/// Default cap on a single frame payload (1 MiB).
pub const DEFAULT_MAX_PAYLOAD: usize = 1_048_576;

/// Decoded fixed-size frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    pub conn_id: ConnId,
    pub length: u32,
}

impl FrameHeader {
    /// Header describing `frame`. Fails if the payload does not fit a `u32` length.
    pub fn of(frame: &Frame) -> PortalResult<Self> {
        let length = u32::try_from(frame.payload.len()).map_err(|_| {
            PortalError::Codec(format!("payload of {} bytes exceeds u32", frame.payload.len()))
        })?;
        Ok(Self {
            kind: frame.kind,
            conn_id: frame.conn_id,
            length,
        })
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..2].copy_from_slice(&self.kind.as_u16().to_be_bytes());
        buf[2..6].copy_from_slice(&self.conn_id.to_be_bytes());
        buf[6..10].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    /// Unrecognised kinds decode as [`FrameKind::Unknown`].
    pub fn decode(buf: &[u8; HEADER_LEN]) -> Self {
        let kind = FrameKind::from(u16::from_be_bytes([buf[0], buf[1]]));
        let conn_id = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]);
        let length = u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]);
        Self {
            kind,
            conn_id,
            length,
        }
    }
}

/// Encode a frame into header + payload bytes.
pub fn frame_encode(frame: &Frame) -> PortalResult<Vec<u8>> {
    let header = FrameHeader::of(frame)?;
    let mut out = Vec::with_capacity(HEADER_LEN + frame.payload.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(&frame.payload);
    Ok(out)
}

/// Read exactly one frame.
///
/// EOF inside the header is reported as [`PortalError::ConnectionClosed`];
/// EOF inside the payload is [`PortalError::Truncated`]. A declared length
/// above `max_payload` fails before anything is allocated. A frame of unknown
/// kind is read in full and returned; rejecting it is up to the caller.
pub async fn read_frame<R>(reader: &mut R, max_payload: usize) -> PortalResult<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; HEADER_LEN];
    if let Err(e) = reader.read_exact(&mut head).await {
        return Err(match e.kind() {
            std::io::ErrorKind::UnexpectedEof => PortalError::ConnectionClosed,
            _ => PortalError::Io(e),
        });
    }
    let header = FrameHeader::decode(&head);

    let len = header.length as usize;
    if len > max_payload {
        return Err(PortalError::FrameTooLarge {
            len,
            max: max_payload,
        });
    }

    let mut payload = vec![0u8; len];
    if let Err(e) = reader.read_exact(&mut payload).await {
        return Err(match e.kind() {
            std::io::ErrorKind::UnexpectedEof => PortalError::Truncated { expected: len },
            _ => PortalError::Io(e),
        });
    }

    Ok(Frame {
        kind: header.kind,
        conn_id: header.conn_id,
        payload,
    })
}

/// Write one frame: header, then payload, then flush.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> PortalResult<()>
where
    W: AsyncWrite + Unpin,
{
    let header = FrameHeader::of(frame)?;
    writer.write_all(&header.encode()).await?;
    if !frame.payload.is_empty() {
        writer.write_all(&frame.payload).await?;
    }
    writer.flush().await?;
    Ok(())
}
