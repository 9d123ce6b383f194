use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::buffer::SharedBuffer;
use crate::config::Config;
use crate::error;
use crate::Error;

/// Reads whatever the socket has into the free tail of `buffer`, growing it so that at least
/// `min_free` bytes are available for the read. Returns the number of bytes read; `0` means the
/// peer closed the stream.
pub async fn fill<R>(reader: &mut R, buffer: &mut SharedBuffer, min_free: usize) -> Result<usize, Error>
where
    R: AsyncRead + Unpin,
{
    let spare = buffer.spare_capacity_mut(min_free)?;
    let n = reader.read(spare).await?;
    buffer.commit(n)?;

    Ok(n)
}

/// Free space to ask [`fill`] for: the initial size for a buffer that has no store yet, the minimum
/// afterwards. A store still shared with handed-off slices is replaced by one just big enough for
/// the live bytes plus the minimum.
pub fn read_size(buffer: &SharedBuffer, config: &Config) -> usize {
    if buffer.capacity() == 0 {
        config.read_buffer_init_size
    } else {
        config.read_buffer_min_size
    }
}

/// Writes all of `buffer` to the socket. The window is advanced as bytes are accepted, so on error
/// the buffer holds exactly what was not sent.
pub async fn drain<W>(writer: &mut W, buffer: &mut SharedBuffer) -> Result<usize, Error>
where
    W: AsyncWrite + Unpin,
{
    let mut sent = 0;
    while !buffer.is_empty() {
        let n = writer.write_buf(buffer).await?;
        if n == 0 {
            return Err(error::Error::Closed.into());
        }
        sent += n;
    }
    writer.flush().await?;

    Ok(sent)
}
