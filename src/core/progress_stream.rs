use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use bytes::Bytes;
use futures::Stream;
use pin_project_lite::pin_project;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

/// 8KB
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

pub type ProgressCallback = Box<dyn FnMut(u64) + Send + Sync>;

pin_project! {
    /// Byte stream over a source that reports the cumulative number of bytes
    /// read after every non-empty chunk.
    pub struct TransferStream<S> {
        #[pin]
        inner: S,
        transferred: u64,
        on_progress: ProgressCallback,
        cancellation_token: Option<CancellationToken>,
        finished: bool,
    }
}

impl TransferStream<ReaderStream<File>> {
    /// Reads `file` one chunk of at most `chunk_size` bytes at a time.
    pub fn from_file(file: File, chunk_size: usize, on_progress: ProgressCallback) -> Self {
        let chunk_size = chunk_size.max(1);
        Self::new(ReaderStream::with_capacity(file, chunk_size), on_progress)
    }
}

impl<S> TransferStream<S> {
    pub fn new(inner: S, on_progress: ProgressCallback) -> Self {
        Self {
            inner,
            transferred: 0,
            on_progress,
            cancellation_token: None,
            finished: false,
        }
    }

    /// The stream fails with `Interrupted` before the next read once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = Some(token);
        self
    }
}

impl<S> Stream for TransferStream<S>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();

        if *this.finished {
            return Poll::Ready(None);
        }

        if this.cancellation_token.as_ref().is_some_and(|token| token.is_cancelled()) {
            *this.finished = true;
            return Poll::Ready(Some(Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "upload cancelled",
            ))));
        }

        match this.inner.poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if !chunk.is_empty() {
                    *this.transferred += chunk.len() as u64;
                    (this.on_progress)(*this.transferred);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                *this.finished = true;
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                *this.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
