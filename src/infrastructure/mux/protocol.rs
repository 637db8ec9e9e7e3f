//! Wire framing for the mux daemon socket.
//!
//! Every frame is a 16-byte little-endian header followed by the payload:
//!
//! ```text
//! ┌────────────┬────────────┬────────────┬────────────┬─────────────┐
//! │ length u32 │ version u32│  kind u32  │   tag u32  │   payload   │
//! └────────────┴────────────┴────────────┴────────────┴─────────────┘
//! ```
//!
//! Control messages carry a JSON body; `Data` frames carry raw bytes and use
//! the tag as the channel identifier.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::MuxError;
use crate::domain::models::DeviceId;

pub const PROTOCOL_VERSION: u32 = 1;
pub const HEADER_LEN: usize = 16;

/// Upper bound on a single frame payload.
pub const MAX_PAYLOAD: u32 = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageKind {
    /// Client -> daemon: subscribe to presence events.
    Listen = 1,
    /// Daemon -> client: a device became reachable.
    Attached = 2,
    /// Daemon -> client: a device became unreachable.
    Detached = 3,
    /// Client -> daemon: scan for a device and attempt a port.
    ConnectRequest = 4,
    /// Daemon -> client: resolution of a connect request.
    ConnectResult = 5,
    /// Daemon -> client: an established connection terminated.
    Disconnected = 6,
    /// Tagged payload bytes, either direction.
    Data = 7,
    /// Client -> daemon: cancel an outstanding scan.
    StopScan = 8,
}

impl MessageKind {
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Listen),
            2 => Some(Self::Attached),
            3 => Some(Self::Detached),
            4 => Some(Self::ConnectRequest),
            5 => Some(Self::ConnectResult),
            6 => Some(Self::Disconnected),
            7 => Some(Self::Data),
            8 => Some(Self::StopScan),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: MessageKind,
    pub tag: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    /// A control frame with a JSON body.
    pub fn control<T: Serialize>(kind: MessageKind, body: &T) -> Result<Self, MuxError> {
        Ok(Self {
            kind,
            tag: 0,
            payload: serde_json::to_vec(body)?,
        })
    }

    /// A control frame with no body.
    pub fn bare(kind: MessageKind) -> Self {
        Self {
            kind,
            tag: 0,
            payload: Vec::new(),
        }
    }

    /// A data frame; `tag` is the channel identifier.
    pub fn data(tag: u32, payload: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Data,
            tag,
            payload,
        }
    }

    /// Decode the JSON body of a control frame.
    pub fn body<T: DeserializeOwned>(&self) -> Result<T, MuxError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
        buf.extend_from_slice(&(self.kind as u32).to_le_bytes());
        buf.extend_from_slice(&self.tag.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }
}

pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Frame) -> Result<(), MuxError> {
    w.write_all(&frame.encode()).await?;
    w.flush().await?;
    Ok(())
}

/// Read one frame.
///
/// An unrecognized message kind is reported only after its payload has been
/// consumed, so the stream stays aligned and the caller may keep reading.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Frame, MuxError> {
    let mut header = [0u8; HEADER_LEN];
    r.read_exact(&mut header).await?;
    let (len, version, raw_kind, tag) = header_fields(&header);

    if version != PROTOCOL_VERSION {
        return Err(MuxError::UnsupportedVersion(version));
    }
    if len > MAX_PAYLOAD {
        return Err(MuxError::OversizedFrame(len));
    }

    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).await?;

    let kind = MessageKind::from_u32(raw_kind).ok_or(MuxError::UnknownMessage(raw_kind))?;
    Ok(Frame { kind, tag, payload })
}

fn header_fields(header: &[u8; HEADER_LEN]) -> (u32, u32, u32, u32) {
    let field = |i: usize| u32::from_le_bytes([header[i], header[i + 1], header[i + 2], header[i + 3]]);
    (field(0), field(4), field(8), field(12))
}

// ── Control bodies ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanTargetBody {
    pub device_id: DeviceId,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectResultBody {
    pub device_id: DeviceId,
    pub port: u16,
    pub success: bool,
    #[serde(default)]
    pub cause: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetachedBody {
    pub device_id: DeviceId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisconnectedBody {
    pub device_id: DeviceId,
    pub port: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_control_frame_roundtrip() {
        let frame = Frame::control(
            MessageKind::ConnectRequest,
            &ScanTargetBody {
                device_id: 42,
                port: 29173,
            },
        )
        .unwrap();

        let bytes = frame.encode();
        let decoded = read_frame(&mut &bytes[..]).await.unwrap();
        assert_eq!(decoded.kind, MessageKind::ConnectRequest);
        let body: ScanTargetBody = decoded.body().unwrap();
        assert_eq!(body.device_id, 42);
        assert_eq!(body.port, 29173);
    }

    #[tokio::test]
    async fn test_data_frame_keeps_tag_and_payload() {
        let bytes = Frame::data(106, b"stream bytes".to_vec()).encode();
        let decoded = read_frame(&mut &bytes[..]).await.unwrap();
        assert_eq!(decoded.kind, MessageKind::Data);
        assert_eq!(decoded.tag, 106);
        assert_eq!(decoded.payload, b"stream bytes");
    }

    #[tokio::test]
    async fn test_rejects_unsupported_version() {
        let mut bytes = Frame::bare(MessageKind::Listen).encode();
        bytes[4] = 9;
        let err = read_frame(&mut &bytes[..]).await.unwrap_err();
        assert!(matches!(err, MuxError::UnsupportedVersion(9)));
    }

    #[tokio::test]
    async fn test_rejects_oversized_payload() {
        let mut bytes = Frame::bare(MessageKind::Listen).encode();
        bytes[0..4].copy_from_slice(&(MAX_PAYLOAD + 1).to_le_bytes());
        let err = read_frame(&mut &bytes[..]).await.unwrap_err();
        assert!(matches!(err, MuxError::OversizedFrame(_)));
    }

    #[tokio::test]
    async fn test_unknown_kind_leaves_stream_aligned() {
        // An unknown-kind frame followed by a valid one: the first read must
        // fail without desyncing the second.
        let mut unknown = Frame::bare(MessageKind::Listen).encode();
        unknown[8..12].copy_from_slice(&99u32.to_le_bytes());
        let mut bytes = unknown;
        bytes.extend_from_slice(&Frame::data(7, b"next".to_vec()).encode());

        let mut reader = &bytes[..];
        let err = read_frame(&mut reader).await.unwrap_err();
        assert!(matches!(err, MuxError::UnknownMessage(99)));

        let next = read_frame(&mut reader).await.unwrap();
        assert_eq!(next.kind, MessageKind::Data);
        assert_eq!(next.payload, b"next");
    }

    #[tokio::test]
    async fn test_truncated_frame_is_io_error() {
        let bytes = Frame::data(1, b"abcdef".to_vec()).encode();
        let err = read_frame(&mut &bytes[..HEADER_LEN + 2]).await.unwrap_err();
        assert!(matches!(err, MuxError::Io(_)));
    }
}
