//! Transport seam: whole UTF-8 text frames over a full-duplex stream.
//!
//! The broker and the node only see [`FrameSink`] and [`FrameStream`].
//! WebSocket adapters live next to the server and the dialer; [`memory`]
//! pairs two endpoints in-process.

use std::time::Duration;

use async_trait::async_trait;

/// Failures reported by a transport.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The connection is gone.
    #[error("transport closed")]
    Closed,

    /// A frame exceeded the configured ceiling.
    #[error("frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge {
        /// Size of the offending frame.
        size: usize,
        /// Configured ceiling.
        limit: usize,
    },

    /// The peer did not take a frame within the write deadline.
    #[error("write did not complete within {0:?}")]
    WriteTimeout(Duration),

    /// Any other I/O or protocol failure.
    #[error("transport error: {0}")]
    Io(String),
}

/// Write half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Write one text frame.
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Close the connection. Closing twice is not an error.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Read half of a connection.
#[async_trait]
pub trait FrameStream: Send {
    /// Next text frame, or `None` once the peer is gone.
    async fn next_frame(&mut self) -> Option<Result<String, TransportError>>;
}

/// Boxed write half.
pub type BoxSink = Box<dyn FrameSink>;

/// Boxed read half.
pub type BoxStream = Box<dyn FrameStream>;

/// Close `sink`, giving up after `limit`.
pub async fn close_within(sink: &mut dyn FrameSink, limit: Duration) -> Result<(), TransportError> {
    tokio::time::timeout(limit, sink.close())
        .await
        .unwrap_or(Err(TransportError::WriteTimeout(limit)))
}

pub mod memory {
    //! In-process transport built on unbounded channels.

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::{FrameSink, FrameStream, TransportError};

    /// Write half of an in-memory connection.
    #[derive(Debug)]
    pub struct MemorySink {
        tx: Option<mpsc::UnboundedSender<String>>,
    }

    /// Read half of an in-memory connection.
    #[derive(Debug)]
    pub struct MemoryStream {
        rx: mpsc::UnboundedReceiver<String>,
    }

    /// One side of an in-memory connection.
    #[derive(Debug)]
    pub struct MemoryEndpoint {
        /// Frames written here arrive at the other side's stream.
        pub sink: MemorySink,
        /// Frames written by the other side.
        pub stream: MemoryStream,
    }

    /// Create two connected endpoints.
    pub fn pair() -> (MemoryEndpoint, MemoryEndpoint) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            MemoryEndpoint {
                sink: MemorySink { tx: Some(a_tx) },
                stream: MemoryStream { rx: b_rx },
            },
            MemoryEndpoint {
                sink: MemorySink { tx: Some(b_tx) },
                stream: MemoryStream { rx: a_rx },
            },
        )
    }

    impl MemorySink {
        /// Whether `close` has been called or the reader is gone.
        pub fn is_closed(&self) -> bool {
            self.tx.as_ref().is_none_or(mpsc::UnboundedSender::is_closed)
        }

        /// Pass `frames` writes through, then hang every later write and close,
        /// like a peer that stopped reading.
        pub fn stall_after(self, frames: usize) -> StallingSink {
            StallingSink {
                inner: self,
                remaining: frames,
            }
        }
    }

    /// See [`MemorySink::stall_after`].
    #[derive(Debug)]
    pub struct StallingSink {
        inner: MemorySink,
        remaining: usize,
    }

    impl MemoryStream {
        /// Take a frame if one is already queued.
        pub fn try_next(&mut self) -> Option<String> {
            self.rx.try_recv().ok()
        }
    }

    #[async_trait]
    impl FrameSink for MemorySink {
        async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
            let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
            tx.send(text).map_err(|_| TransportError::Closed)
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.tx = None;
            Ok(())
        }
    }

    #[async_trait]
    impl FrameSink for StallingSink {
        async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
            if self.remaining == 0 {
                std::future::pending::<()>().await;
            }
            self.remaining -= 1;
            self.inner.send_text(text).await
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            if self.remaining == 0 {
                std::future::pending::<()>().await;
            }
            self.inner.close().await
        }
    }

    #[async_trait]
    impl FrameStream for MemoryStream {
        async fn next_frame(&mut self) -> Option<Result<String, TransportError>> {
            self.rx.recv().await.map(Ok)
        }
    }
}
