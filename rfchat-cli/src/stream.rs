//! Owned duplex stream for one connection, and the handle that closes it
//! from outside the receive loop.

use std::io;

use rfchat_core::{read_frame_limited, write_frame, FrameReadError, FrameWriteError, MAX_FRAME_LEN};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// RFCOMM-equivalent byte stream as handed over by a radio.
pub struct ChatStream {
    reader: BoxedReader,
    writer: BoxedWriter,
    remote_name: String,
}

impl ChatStream {
    pub fn new<R, W>(reader: R, writer: W, remote_name: impl Into<String>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            remote_name: remote_name.into(),
        }
    }

    /// Display name of the device on the other end.
    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }

    /// Split into closable read and write sides sharing one close handle.
    pub fn into_parts(self) -> (ClosableReader, ClosableWriter, CloseSignal) {
        let (tx, rx) = watch::channel(false);
        let reader = ClosableReader {
            inner: self.reader,
            closed: rx.clone(),
        };
        let writer = ClosableWriter {
            inner: Some(self.writer),
            closed: rx,
        };
        (reader, writer, CloseSignal { tx })
    }

    /// Raw halves, for driving a peer byte by byte.
    #[cfg(test)]
    pub fn into_raw(self) -> (BoxedReader, BoxedWriter) {
        (self.reader, self.writer)
    }
}

impl std::fmt::Debug for ChatStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatStream")
            .field("remote_name", &self.remote_name)
            .finish_non_exhaustive()
    }
}

/// Closes both sides. Dropping it has the same effect.
#[derive(Debug)]
pub struct CloseSignal {
    tx: watch::Sender<bool>,
}

impl CloseSignal {
    pub fn close(&self) {
        self.tx.send_replace(true);
    }

}

/// Read side whose in-flight read fails fast once the stream is closed locally.
pub struct ClosableReader {
    inner: BoxedReader,
    closed: watch::Receiver<bool>,
}

impl ClosableReader {
    /// True once the stream has been closed locally.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Read one frame of at most [`MAX_FRAME_LEN`] bytes, or fail with
    /// `ConnectionAborted` as soon as the stream is closed.
    pub async fn read_frame(&mut self) -> Result<String, FrameReadError> {
        if self.is_closed() {
            return Err(aborted().into());
        }
        let closed = &mut self.closed;
        let inner = &mut self.inner;
        tokio::select! {
            biased;
            _ = async { closed.wait_for(|c| *c).await.is_ok() } => Err(aborted().into()),
            frame = read_frame_limited(inner, MAX_FRAME_LEN) => frame,
        }
    }
}

/// Write side. A local close cancels an in-flight write; [`ClosableWriter::shutdown`]
/// releases the stream for good.
pub struct ClosableWriter {
    inner: Option<BoxedWriter>,
    closed: watch::Receiver<bool>,
}

impl ClosableWriter {
    /// Write one frame, or fail with `ConnectionAborted` once the stream is closed
    /// or released. A frame cut off by the close is not resumed.
    pub async fn write_frame(&mut self, text: &str) -> Result<(), FrameWriteError> {
        let Some(inner) = self.inner.as_mut() else {
            return Err(aborted().into());
        };
        if *self.closed.borrow() {
            return Err(aborted().into());
        }
        let closed = &mut self.closed;
        tokio::select! {
            biased;
            _ = async { closed.wait_for(|c| *c).await.is_ok() } => Err(aborted().into()),
            written = write_frame(inner, text) => written,
        }
    }

    /// Shut the write side down and drop it. Later writes fail.
    pub async fn shutdown(&mut self) {
        if let Some(mut inner) = self.inner.take() {
            if let Err(e) = inner.shutdown().await {
                tracing::debug!(error = %e, "stream shutdown");
            }
        }
    }
}

fn aborted() -> io::Error {
    io::Error::new(
        io::ErrorKind::ConnectionAborted,
        "the I/O operation has been aborted by a local disconnect",
    )
}
