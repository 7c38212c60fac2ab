use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

use crate::error::{Error, Result};

/// A proxy tunnel after the handshake: the raw TCP stream, or the same
/// stream upgraded to TLS for https destinations.
pub enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl MaybeTlsStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, MaybeTlsStream::Tls(_))
    }
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Default internal buffer size.
const DEFAULT_CAPACITY: usize = 1024;

/// Read-buffering adapter over a byte stream.
///
/// Reads drain the internal buffer before touching the inner stream, and an
/// empty buffer triggers exactly one inner read (reads are never coalesced).
/// On top of plain reads it offers [`read_line`](Self::read_line) for
/// CRLF-terminated lines and [`ensure_buffered`](Self::ensure_buffered) for
/// fixed-size peeks. Writes pass straight through to the inner stream.
pub struct BufferedReadStream<S> {
    inner: S,
    buf: Box<[u8]>,
    pos: usize,
    filled: usize,
}

impl<S> BufferedReadStream<S> {
    pub fn new(inner: S) -> Self {
        Self::with_capacity(inner, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(inner: S, capacity: usize) -> Self {
        BufferedReadStream {
            inner,
            buf: vec![0u8; capacity].into_boxed_slice(),
            pos: 0,
            filled: 0,
        }
    }

    /// Number of bytes currently buffered and unread.
    pub fn buffered(&self) -> usize {
        self.filled - self.pos
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Unwraps the inner stream. Buffered bytes are discarded.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> BufferedReadStream<S> {
    /// One inner read into the (empty) internal buffer.
    async fn fill(&mut self) -> io::Result<usize> {
        self.pos = 0;
        self.filled = 0;
        let n = self.inner.read(&mut self.buf).await?;
        self.filled = n;
        Ok(n)
    }

    /// Reads one CRLF-terminated line, returning it without the terminator.
    ///
    /// A lone `\n` does not end the line; only the `\r\n` pair does. If the
    /// stream ends before a terminator is seen, the bytes accumulated so far
    /// are returned verbatim.
    pub async fn read_line(&mut self) -> Result<String> {
        let mut line: Vec<u8> = Vec::new();
        loop {
            if self.pos == self.filled && self.fill().await? == 0 {
                break;
            }
            let b = self.buf[self.pos];
            self.pos += 1;
            line.push(b);
            if line.ends_with(b"\r\n") {
                line.truncate(line.len() - 2);
                break;
            }
        }
        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    /// Reads until at least `min` bytes are buffered, compacting unread
    /// bytes to the front first. Returns `false` when the stream ends before
    /// `min` bytes are available.
    pub async fn ensure_buffered(&mut self, min: usize) -> Result<bool> {
        if min > self.buf.len() {
            return Err(Error::Config(format!(
                "cannot buffer {min} bytes: buffer capacity is {}",
                self.buf.len()
            )));
        }
        if self.pos > 0 {
            self.buf.copy_within(self.pos..self.filled, 0);
            self.filled -= self.pos;
            self.pos = 0;
        }
        while self.filled < min {
            let n = self.inner.read(&mut self.buf[self.filled..]).await?;
            if n == 0 {
                return Ok(false);
            }
            self.filled += n;
        }
        Ok(true)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for BufferedReadStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        if me.pos < me.filled {
            let available = &me.buf[me.pos..me.filled];
            let n = available.len().min(out.remaining());
            out.put_slice(&available[..n]);
            me.pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut me.inner).poll_read(cx, out)
    }
}

impl<S: AsyncRead + Unpin> AsyncBufRead for BufferedReadStream<S> {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        let me = self.get_mut();
        if me.pos >= me.filled {
            me.pos = 0;
            me.filled = 0;
            let mut rb = ReadBuf::new(&mut me.buf);
            ready!(Pin::new(&mut me.inner).poll_read(cx, &mut rb))?;
            me.filled = rb.filled().len();
        }
        Poll::Ready(Ok(&me.buf[me.pos..me.filled]))
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        let me = self.get_mut();
        me.pos = (me.pos + amt).min(me.filled);
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for BufferedReadStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
