use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{IpcError, Result};

/// Largest frame accepted when no limit is configured.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;

/// Encoded size of `message` as a frame body, excluding the length prefix.
pub fn frame_len<T: Serialize>(message: &T) -> Result<usize> {
    Ok(bincode::serialized_size(message)? as usize)
}

/// Write one length-prefixed frame.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = bincode::serialize(message)?;
    let len = u32::try_from(bytes.len()).map_err(|_| IpcError::FrameTooLarge {
        size: bytes.len(),
        max: u32::MAX as usize,
    })?;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the peer closed the connection cleanly
/// before sending another frame.
pub async fn read_frame<R, T>(reader: &mut R, max_frame_bytes: usize) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > max_frame_bytes {
        return Err(IpcError::FrameTooLarge {
            size: len,
            max: max_frame_bytes,
        });
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(bincode::deserialize(&buf)?))
}
