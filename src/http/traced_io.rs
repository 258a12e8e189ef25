use crate::timing::{Checkpoints, ProbeSlot};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Stream wrapper that reports request-written and first-response-byte to the
/// probe currently attached to its slot.
///
/// The request counts as written at the first successful flush after request
/// bytes went out; the first read that yields data marks the first response
/// byte.
pub struct TracedIo<S> {
    inner: S,
    slot: ProbeSlot,
    unflushed: bool,
}

impl<S> TracedIo<S> {
    pub fn new(inner: S, slot: ProbeSlot) -> Self {
        Self {
            inner,
            slot,
            unflushed: false,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TracedIo<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            if buf.filled().len() > before {
                this.slot.notify(|probe| probe.first_response_byte());
            }
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TracedIo<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = poll {
            this.unflushed |= n > 0;
        }
        poll
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write_vectored(cx, bufs);
        if let Poll::Ready(Ok(n)) = poll {
            this.unflushed |= n > 0;
        }
        poll
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_flush(cx);
        if let Poll::Ready(Ok(())) = poll {
            if this.unflushed {
                this.unflushed = false;
                this.slot.notify(|probe| probe.request_written());
            }
        }
        poll
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
