//! Encode/decode and framing for control-plane messages.
//!
//! Frames are a 4-byte little-endian length followed by a JSON payload.
//! Oversized frames are refused before the payload is read.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::protocol_types::{ErrorCode, IpcMessage, ProtocolError};

pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16 MB

/// Encode message to JSON bytes with size limit enforcement.
pub fn encode_message(message: &IpcMessage) -> Result<Vec<u8>, ProtocolError> {
    let bytes = serde_json::to_vec(message)?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: bytes.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(bytes)
}

/// Encode a response; an oversized one is replaced by an error message.
pub fn encode_response(message: &IpcMessage) -> Result<Vec<u8>, ProtocolError> {
    match encode_message(message) {
        Err(ProtocolError::MessageTooLarge { size, max }) => encode_message(&IpcMessage::error(
            ErrorCode::Internal,
            format!("Response too large: {} bytes (max {})", size, max),
        )),
        other => other,
    }
}

/// Decode message from JSON bytes with size limit enforcement.
pub fn decode_message(bytes: &[u8]) -> Result<IpcMessage, ProtocolError> {
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: bytes.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(serde_json::from_slice(bytes)?)
}

/// Read a length-prefixed frame from an async reader.
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Vec<u8>, ProtocolError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;

    let frame_len = u32::from_le_bytes(len_buf) as usize;
    if frame_len > MAX_FRAME_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: frame_len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut buf = vec![0u8; frame_len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    data: &[u8],
) -> Result<(), ProtocolError> {
    let len = u32::try_from(data.len()).map_err(|_| ProtocolError::MessageTooLarge {
        size: data.len(),
        max: MAX_FRAME_SIZE,
    })?;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}
