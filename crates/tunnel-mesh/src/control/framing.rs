//! Control channel frames: a big-endian `u32` length followed by that many
//! bytes of JSON. Frames are capped at [`MAX_MESSAGE_SIZE`].

use crate::error::{MeshError, MeshResult};
use serde::{de::DeserializeOwned, Serialize};
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted frame body.
pub const MAX_MESSAGE_SIZE: u32 = 1024 * 1024;

const LENGTH_PREFIX: usize = 4;

/// Read one frame.
///
/// Returns `Ok(None)` when the peer closed the stream on a frame boundary;
/// a stream that ends inside a frame is an error.
pub async fn read_message<R, T>(reader: &mut R) -> MeshResult<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut prefix = [0u8; LENGTH_PREFIX];
    let mut filled = 0;
    while filled < LENGTH_PREFIX {
        match reader.read(&mut prefix[filled..]).await? {
            0 if filled == 0 => return Ok(None),
            0 => {
                return Err(MeshError::Io(std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "control stream ended inside a length prefix",
                )))
            }
            n => filled += n,
        }
    }

    let len = checked_len(u32::from_be_bytes(prefix) as usize)?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}

/// Write one frame and flush it.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> MeshResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message)?;
    let len = checked_len(body.len())?;

    let mut frame = Vec::with_capacity(LENGTH_PREFIX + len);
    frame.extend_from_slice(&(len as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

fn checked_len(len: usize) -> MeshResult<usize> {
    if len == 0 {
        return Err(MeshError::Control("empty control frame".into()));
    }
    if len > MAX_MESSAGE_SIZE as usize {
        return Err(MeshError::Control(format!(
            "control frame of {} bytes exceeds {} bytes",
            len, MAX_MESSAGE_SIZE
        )));
    }
    Ok(len)
}
