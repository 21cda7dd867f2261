//! Length-prefixed CBOR framing for the handshake and the control channel.
//!
//! Wire format: `[4-byte big-endian length][CBOR payload]`

use std::io::Cursor;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ImpError, ImpResult};

/// Largest CBOR payload accepted in a single frame (1 MiB).
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Encode a serializable value into a length-prefixed CBOR frame.
pub fn frame_encode<T: serde::Serialize>(value: &T) -> ImpResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(value, &mut payload)?;

    if payload.len() > MAX_FRAME_LEN {
        return Err(ImpError::Protocol(format!(
            "frame of {} bytes exceeds limit of {MAX_FRAME_LEN}",
            payload.len()
        )));
    }

    let len = payload.len() as u32;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend(payload);
    Ok(frame)
}

/// Decode a CBOR payload (without length prefix) into a typed value.
pub fn cbor_decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> ImpResult<T> {
    let cursor = Cursor::new(data);
    let value: T = ciborium::from_reader(cursor)?;
    Ok(value)
}

/// Encode a value as CBOR without a length prefix.
pub fn cbor_encode<T: serde::Serialize>(value: &T) -> ImpResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(value, &mut payload)?;
    Ok(payload)
}

/// Write one frame to an async writer and flush it.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> ImpResult<()>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let frame = frame_encode(value)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read exactly one frame from an async reader.
///
/// Never consumes bytes past the end of the frame, so it is safe to hand the
/// reader to another protocol layer afterwards.
pub async fn read_frame<R, T>(reader: &mut R) -> ImpResult<T>
where
    R: AsyncRead + Unpin,
    T: serde::de::DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ImpError::Protocol(format!(
            "announced frame of {len} bytes exceeds limit of {MAX_FRAME_LEN}"
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    cbor_decode(&payload)
}
