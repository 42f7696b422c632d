//! Response body wrapper that counts bytes and reports completion
//!
//! [`MeteredBody`] passes every frame through untouched. It runs its
//! completion callback exactly once: when the inner body reports
//! end-of-stream, when it yields an error, or when the body is dropped
//! before finishing (client disconnect, HEAD response, empty body that the
//! server never polls).

use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::Body;
use bytes::Bytes;
use http_body::{Frame, SizeHint};

/// What the body observed by the time it completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BodyStats {
    /// Data bytes passed through
    pub bytes: u64,
    /// `false` when the body was dropped or failed before end-of-stream
    pub completed: bool,
}

type OnComplete = Box<dyn FnOnce(BodyStats) + Send + 'static>;

/// Byte-counting response body
pub struct MeteredBody {
    inner: Body,
    bytes: u64,
    on_complete: Option<OnComplete>,
}

impl MeteredBody {
    pub fn new<F>(inner: Body, on_complete: F) -> Self
    where
        F: FnOnce(BodyStats) + Send + 'static,
    {
        Self {
            inner,
            bytes: 0,
            on_complete: Some(Box::new(on_complete)),
        }
    }

    fn complete(&mut self, completed: bool) {
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(BodyStats {
                bytes: self.bytes,
                completed,
            });
        }
    }
}

impl http_body::Body for MeteredBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.bytes += data.len() as u64;
                }
                if this.inner.is_end_stream() {
                    this.complete(true);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.complete(false);
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.complete(true);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for MeteredBody {
    fn drop(&mut self) {
        let completed = http_body::Body::is_end_stream(&self.inner);
        self.complete(completed);
    }
}
