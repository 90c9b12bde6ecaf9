//! Peekable buffered stream

use bytes::{Buf, BytesMut};
use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, ReadBuf};

/// Size of a single read from the underlying stream
const READ_CHUNK: usize = 8 * 1024;

/// A stream with a read-ahead buffer that supports non-destructive peeks.
///
/// Bytes obtained through [`peek`](Self::peek) or `AsyncBufRead` are
/// always handed out by subsequent reads before anything new is pulled
/// from the inner stream. Writes go straight through.
#[derive(Debug)]
pub struct BufferedEndpoint<S> {
    inner: S,
    buf: BytesMut,
}

impl<S> BufferedEndpoint<S> {
    /// Wrap a stream
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }
}

impl<S: AsyncRead + Unpin> BufferedEndpoint<S> {
    /// Return the first `n` bytes without consuming them.
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        while self.buf.len() < n {
            let read = poll_fn(|cx| self.poll_read_more(cx)).await?;
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream closed before peek completed",
                ));
            }
        }
        Ok(&self.buf[..n])
    }

    fn poll_read_more(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        let mut chunk = [0u8; READ_CHUNK];
        let mut read_buf = ReadBuf::new(&mut chunk);
        ready!(Pin::new(&mut self.inner).poll_read(cx, &mut read_buf))?;
        let filled = read_buf.filled();
        self.buf.extend_from_slice(filled);
        Poll::Ready(Ok(filled.len()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for BufferedEndpoint<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.buf.is_empty() {
            return Pin::new(&mut this.inner).poll_read(cx, out);
        }

        let n = out.remaining().min(this.buf.len());
        out.put_slice(&this.buf[..n]);
        this.buf.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncBufRead for BufferedEndpoint<S> {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        let this = self.get_mut();
        if this.buf.is_empty() {
            ready!(this.poll_read_more(cx))?;
        }
        Poll::Ready(Ok(&this.buf[..]))
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        let this = self.get_mut();
        let amt = amt.min(this.buf.len());
        this.buf.advance(amt);
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for BufferedEndpoint<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
