//! Framing: length-prefix (4 bytes BE) + UTF-8 text payload.
//!
//! One frame is one chat message. Decoding is frame-at-a-time straight off the
//! stream: exactly 4 prefix bytes, then exactly `len` payload bytes.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const LEN_SIZE: usize = 4;

/// Largest payload a live connection accepts from a peer (16 MiB).
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Payload buffer growth step; memory follows the bytes that actually arrive.
const READ_CHUNK: usize = 8 * 1024;

/// Encode text into a single frame: 4 bytes BE length + UTF-8 bytes.
pub fn encode_frame(text: &str) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = text.as_bytes();
    let len = u32::try_from(payload.len()).map_err(|_| FrameEncodeError::TooLarge {
        len: payload.len(),
    })?;
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Error encoding text into a frame. The prefix is 32 bits wide; nothing else is limited here.
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("payload of {len} bytes does not fit a 32-bit length prefix")]
    TooLarge { len: usize },
}

/// Read one frame from `reader` and return its text. Any 32-bit length is accepted.
///
/// A stream that ends anywhere inside the prefix is a clean [`FrameReadError::PeerClosed`];
/// one that ends inside the payload is [`FrameReadError::TruncatedFrame`].
pub async fn read_frame<R>(reader: &mut R) -> Result<String, FrameReadError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    read_frame_limited(reader, u32::MAX as usize).await
}

/// Like [`read_frame`], but a prefix above `max_len` fails with
/// [`FrameReadError::TooLarge`] before any payload is read.
pub async fn read_frame_limited<R>(reader: &mut R, max_len: usize) -> Result<String, FrameReadError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; LEN_SIZE];
    let got = fill(reader, &mut len_buf).await?;
    if got < LEN_SIZE {
        return Err(FrameReadError::PeerClosed);
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_len {
        return Err(FrameReadError::TooLarge { len, max: max_len });
    }
    let mut payload = Vec::with_capacity(len.min(READ_CHUNK));
    let got = (&mut *reader).take(len as u64).read_to_end(&mut payload).await?;
    if got < len {
        return Err(FrameReadError::TruncatedFrame {
            expected: len,
            received: got,
        });
    }
    String::from_utf8(payload).map_err(|e| FrameReadError::InvalidUtf8(e.utf8_error()))
}

/// Encode `text` and write the whole frame, then flush.
pub async fn write_frame<W>(writer: &mut W, text: &str) -> Result<(), FrameWriteError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = encode_frame(text)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read until `buf` is full or the stream ends. Returns the number of bytes read.
async fn fill<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Error reading a frame off the stream.
#[derive(Debug, thiserror::Error)]
pub enum FrameReadError {
    /// Stream ended before a full length prefix; the peer closed between messages.
    #[error("peer closed the stream")]
    PeerClosed,
    /// Stream ended mid-payload.
    #[error("frame truncated: expected {expected} bytes, got {received}")]
    TruncatedFrame { expected: usize, received: usize },
    #[error("frame of {len} bytes exceeds the {max}-byte limit")]
    TooLarge { len: usize, max: usize },
    #[error("frame payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[source] std::str::Utf8Error),
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Error writing a frame to the stream.
#[derive(Debug, thiserror::Error)]
pub enum FrameWriteError {
    #[error(transparent)]
    Encode(#[from] FrameEncodeError),
    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),
}
