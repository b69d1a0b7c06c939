//! Length-prefixed framing for the ordered byte stream.
//!
//! Each frame is `u32 length (big-endian) || ciphertext`. Datagram
//! transports need no framing; their message boundaries are the frames.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::session::TAG_LEN;

/// Largest inner IP packet the tunnel carries.
pub const MAX_IP_PACKET: usize = 65_535;
pub const LEN_PREFIX: usize = 4;
/// Nothing shorter than a bare auth tag can be a valid ciphertext.
pub const MIN_FRAME: usize = TAG_LEN;
pub const MAX_FRAME: usize = MAX_IP_PACKET + TAG_LEN + LEN_PREFIX;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("declared frame length {0} exceeds {MAX_FRAME} bytes")]
    TooLarge(usize),
    #[error("declared frame length {0} is below {MIN_FRAME} bytes")]
    TooSmall(usize),
    #[error("stream ended in the middle of a frame")]
    ShortRead,
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
}

fn eof_is_short(e: io::Error) -> FrameError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        FrameError::ShortRead
    } else {
        FrameError::Io(e)
    }
}

fn check_bounds(len: usize) -> Result<(), FrameError> {
    if len < MIN_FRAME {
        return Err(FrameError::TooSmall(len));
    }
    if len > MAX_FRAME {
        return Err(FrameError::TooLarge(len));
    }
    Ok(())
}

/// Stamp the length prefix into a buffer already laid out as
/// `[0u8; 4] || ciphertext`.
pub fn encode_length(frame: &mut [u8]) -> Result<(), FrameError> {
    let payload = frame.len().saturating_sub(LEN_PREFIX);
    check_bounds(payload)?;
    frame[..LEN_PREFIX].copy_from_slice(&(payload as u32).to_be_bytes());
    Ok(())
}

/// Read one frame. `Ok(None)` means the stream closed cleanly between
/// frames; closing mid-frame is `ShortRead`. Bounds are enforced before
/// any payload allocation, so a hostile length prefix costs nothing.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Vec<u8>>, FrameError> {
    let mut len_bytes = [0u8; LEN_PREFIX];
    let n = reader.read(&mut len_bytes).await?;
    if n == 0 {
        return Ok(None);
    }
    if n < LEN_PREFIX {
        reader
            .read_exact(&mut len_bytes[n..])
            .await
            .map_err(eof_is_short)?;
    }
    let len = u32::from_be_bytes(len_bytes) as usize;
    check_bounds(len)?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(eof_is_short)?;
    Ok(Some(payload))
}

/// Write one frame as a single buffer, prefix included.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    ciphertext: &[u8],
) -> Result<(), FrameError> {
    check_bounds(ciphertext.len())?;
    let mut frame = Vec::with_capacity(LEN_PREFIX + ciphertext.len());
    frame.extend_from_slice(&[0u8; LEN_PREFIX]);
    frame.extend_from_slice(ciphertext);
    encode_length(&mut frame)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
