//! Wire frames and the length-prefixed codec.
//!
//! Every frame belongs to exactly one call (`call_id`) multiplexed over the
//! connection. Unlike a fixed-size descriptor, the frame carries a
//! variable-length method name and metadata on open, so the whole frame is
//! postcard-encoded behind a `u32` little-endian length prefix.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::TransportError;
use crate::status::Status;

bitflags! {
    /// Flags carried in each frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FrameFlags: u32 {
        /// First frame of a call; `Frame::open` describes the call.
        const OPEN   = 0b0000_0001;
        /// Frame carries one payload message.
        const DATA   = 0b0000_0010;
        /// The sender half-closed its direction; no more DATA will follow.
        const EOS    = 0b0000_0100;
        /// The caller aborted the call.
        const CANCEL = 0b0000_1000;
        /// Terminal status; `Frame::status` is present.
        const STATUS = 0b0001_0000;
    }
}

/// First bytes on every connection, ahead of any frame. Lets a peer that is
/// not speaking this protocol (a TLS ClientHello, a stray HTTP request) be
/// rejected before its bytes are misread as a length prefix.
pub(crate) const PREAMBLE: [u8; 4] = *b"sku1";

/// Sentinel for "no deadline" in [`OpenCall::deadline_ns`].
pub const NO_DEADLINE: u64 = u64::MAX;

/// Upper bound on one encoded frame; guards the length-prefixed reader.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Call description carried by the OPEN frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenCall {
    pub method: String,
    /// Absolute deadline in nanoseconds since the unix epoch;
    /// [`NO_DEADLINE`] means none.
    pub deadline_ns: u64,
    pub metadata: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub call_id: u32,
    flags: u32,
    pub open: Option<OpenCall>,
    pub status: Option<Status>,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn open(call_id: u32, open: OpenCall) -> Self {
        Self {
            call_id,
            flags: FrameFlags::OPEN.bits(),
            open: Some(open),
            status: None,
            payload: Vec::new(),
        }
    }

    pub fn data(call_id: u32, payload: Vec<u8>) -> Self {
        Self {
            call_id,
            flags: FrameFlags::DATA.bits(),
            open: None,
            status: None,
            payload,
        }
    }

    pub fn eos(call_id: u32) -> Self {
        Self {
            call_id,
            flags: FrameFlags::EOS.bits(),
            open: None,
            status: None,
            payload: Vec::new(),
        }
    }

    pub fn cancel(call_id: u32) -> Self {
        Self {
            call_id,
            flags: FrameFlags::CANCEL.bits(),
            open: None,
            status: None,
            payload: Vec::new(),
        }
    }

    /// Terminal status frame. Implies the sender's direction is closed.
    pub fn status(call_id: u32, status: Status) -> Self {
        Self {
            call_id,
            flags: (FrameFlags::STATUS | FrameFlags::EOS).bits(),
            open: None,
            status: Some(status),
            payload: Vec::new(),
        }
    }

    pub fn flags(&self) -> FrameFlags {
        FrameFlags::from_bits_truncate(self.flags)
    }

    /// Write this frame, length-prefixed, and flush.
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<(), TransportError>
    where
        W: AsyncWrite + Unpin,
    {
        let bytes = postcard::to_allocvec(self)?;
        if bytes.len() > MAX_FRAME_LEN {
            return Err(TransportError::FrameTooLarge {
                len: bytes.len(),
                max: MAX_FRAME_LEN,
            });
        }
        writer.write_all(&(bytes.len() as u32).to_le_bytes()).await?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read one length-prefixed frame. A clean EOF maps to `Closed`.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, TransportError>
    where
        R: AsyncRead + Unpin,
    {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await.map_err(eof_as_closed)?;
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_FRAME_LEN {
            return Err(TransportError::FrameTooLarge {
                len,
                max: MAX_FRAME_LEN,
            });
        }
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf).await.map_err(eof_as_closed)?;
        Ok(postcard::from_bytes(&buf)?)
    }
}

/// Read and verify the connection preamble before the first frame.
pub(crate) async fn read_preamble<R>(reader: &mut R) -> Result<(), TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).await.map_err(eof_as_closed)?;
    if buf != PREAMBLE {
        return Err(TransportError::Unavailable(
            "peer is not speaking this protocol".into(),
        ));
    }
    Ok(())
}

fn eof_as_closed(e: std::io::Error) -> TransportError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        TransportError::Closed
    } else {
        TransportError::Io(e)
    }
}
