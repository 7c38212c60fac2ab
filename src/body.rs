use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use async_compression::tokio::bufread::{DeflateDecoder, GzipDecoder};
use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt, BufReader, ReadBuf};
use tracing::debug;

use crate::error::{Error, Result};
use crate::pool::PoolGuard;
use crate::connection_pool::PooledTunnel;
use crate::stream::{BufferedReadStream, MaybeTlsStream};

fn invalid_data(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

fn unexpected_eof(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, message.to_string())
}

/// Protocol violations inside body framing travel through the reader stack
/// as `InvalidData`; everything else is transport I/O.
fn map_body_err(e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::InvalidData {
        Error::Protocol(e.to_string())
    } else {
        Error::Io(e)
    }
}

/// Longest accepted chunk-size line, terminator included.
const MAX_CHUNK_HEADER: usize = 256;

/// Accumulates bytes from `inner` into `scratch` until a CRLF-terminated
/// line is complete, then returns it without the terminator. A bare `\n` is
/// rejected: chunked framing lines always end in `\r\n`.
fn poll_crlf_line<R: AsyncBufRead + Unpin>(
    mut inner: Pin<&mut R>,
    scratch: &mut Vec<u8>,
    cx: &mut Context<'_>,
) -> Poll<io::Result<Vec<u8>>> {
    loop {
        let buf = ready!(inner.as_mut().poll_fill_buf(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Err(unexpected_eof(
                "connection closed inside chunked framing",
            )));
        }
        match buf.iter().position(|&b| b == b'\n') {
            Some(i) => {
                scratch.extend_from_slice(&buf[..=i]);
                inner.as_mut().consume(i + 1);
                let mut line = std::mem::take(scratch);
                if !line.ends_with(b"\r\n") {
                    return Poll::Ready(Err(invalid_data(format!(
                        "chunked framing line not CRLF-terminated: {:?}",
                        String::from_utf8_lossy(&line)
                    ))));
                }
                line.truncate(line.len() - 2);
                return Poll::Ready(Ok(line));
            }
            None => {
                scratch.extend_from_slice(buf);
                let n = buf.len();
                inner.as_mut().consume(n);
                if scratch.len() > MAX_CHUNK_HEADER {
                    return Poll::Ready(Err(invalid_data(
                        "chunk header line too long".to_string(),
                    )));
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    /// Expecting a hex chunk-size line.
    Size,
    /// Inside a chunk, `remaining` payload bytes left.
    Data { remaining: u64 },
    /// Expecting the empty line that closes a chunk's payload.
    DataEnd,
    /// Zero-size chunk seen; expecting the final empty line.
    Trailer,
    Done,
}

/// Decoder for `Transfer-Encoding: chunked` response bodies.
///
/// Reads hex-prefixed chunks off the buffered transport and terminates after
/// the zero-size chunk and its closing CRLF; reads past that point return 0
/// without touching the transport.
pub(crate) struct ChunkedReader<R> {
    inner: R,
    state: ChunkState,
    line: Vec<u8>,
}

impl<R> ChunkedReader<R> {
    pub(crate) fn new(inner: R) -> Self {
        ChunkedReader {
            inner,
            state: ChunkState::Size,
            line: Vec::new(),
        }
    }

    pub(crate) fn into_inner(self) -> R {
        self.inner
    }

    pub(crate) fn is_done(&self) -> bool {
        self.state == ChunkState::Done
    }
}

impl<R: AsyncBufRead + Unpin> AsyncRead for ChunkedReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        loop {
            match me.state {
                ChunkState::Done => return Poll::Ready(Ok(())),
                ChunkState::Size => {
                    let line = ready!(poll_crlf_line(Pin::new(&mut me.inner), &mut me.line, cx))?;
                    let text = String::from_utf8_lossy(&line);
                    let size = u64::from_str_radix(text.trim(), 16).map_err(|_| {
                        invalid_data(format!("invalid chunk header {:?}", text.as_ref()))
                    })?;
                    me.state = if size == 0 {
                        ChunkState::Trailer
                    } else {
                        ChunkState::Data { remaining: size }
                    };
                }
                ChunkState::Data { ref mut remaining } => {
                    if out.remaining() == 0 {
                        return Poll::Ready(Ok(()));
                    }
                    let buf = ready!(Pin::new(&mut me.inner).poll_fill_buf(cx))?;
                    if buf.is_empty() {
                        return Poll::Ready(Err(unexpected_eof(
                            "connection closed inside chunk payload",
                        )));
                    }
                    let n = (*remaining)
                        .min(buf.len() as u64)
                        .min(out.remaining() as u64) as usize;
                    out.put_slice(&buf[..n]);
                    Pin::new(&mut me.inner).consume(n);
                    *remaining -= n as u64;
                    if *remaining == 0 {
                        me.state = ChunkState::DataEnd;
                    }
                    return Poll::Ready(Ok(()));
                }
                ChunkState::DataEnd => {
                    let line = ready!(poll_crlf_line(Pin::new(&mut me.inner), &mut me.line, cx))?;
                    if !line.is_empty() {
                        return Poll::Ready(Err(invalid_data(format!(
                            "chunk payload not followed by bare CRLF: {:?}",
                            String::from_utf8_lossy(&line)
                        ))));
                    }
                    me.state = ChunkState::Size;
                }
                ChunkState::Trailer => {
                    let line = ready!(poll_crlf_line(Pin::new(&mut me.inner), &mut me.line, cx))?;
                    if !line.is_empty() {
                        return Poll::Ready(Err(invalid_data(format!(
                            "unexpected trailer after final chunk: {:?}",
                            String::from_utf8_lossy(&line)
                        ))));
                    }
                    me.state = ChunkState::Done;
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}

/// Decoder for `Content-Length` framed bodies: serves exactly `remaining`
/// bytes and then reports EOF without reading past the boundary.
pub(crate) struct LengthReader<R> {
    inner: R,
    remaining: u64,
}

impl<R> LengthReader<R> {
    pub(crate) fn new(inner: R, length: u64) -> Self {
        LengthReader {
            inner,
            remaining: length,
        }
    }

    pub(crate) fn into_inner(self) -> R {
        self.inner
    }

    pub(crate) fn is_done(&self) -> bool {
        self.remaining == 0
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for LengthReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        if me.remaining == 0 || out.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        let n = me.remaining.min(out.remaining() as u64) as usize;
        let slice = out.initialize_unfilled_to(n);
        let mut sub = ReadBuf::new(slice);
        ready!(Pin::new(&mut me.inner).poll_read(cx, &mut sub))?;
        let filled = sub.filled().len();
        if filled == 0 {
            return Poll::Ready(Err(unexpected_eof(
                "connection closed before end of body",
            )));
        }
        out.advance(filled);
        me.remaining -= filled as u64;
        Poll::Ready(Ok(()))
    }
}

/// Reads `r` to EOF with a small scratch buffer, returning the byte count.
pub(crate) async fn drain_to_eof<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<u64> {
    let mut scratch = [0u8; 64];
    let mut total = 0u64;
    loop {
        let n = r.read(&mut scratch).await?;
        if n == 0 {
            return Ok(total);
        }
        total += n as u64;
    }
}

type Transport = BufferedReadStream<MaybeTlsStream>;

/// Response body framing selected from the response headers.
pub(crate) enum FramedBody {
    Chunked(ChunkedReader<Transport>),
    Length(LengthReader<Transport>),
    /// No framing headers: the body is whatever remains until the server
    /// closes the connection.
    Raw(Transport),
}

impl FramedBody {
    /// Whether the transport is positioned exactly at the end of the body,
    /// making the tunnel safe to reuse.
    fn reusable(&self) -> bool {
        match self {
            FramedBody::Chunked(r) => r.is_done(),
            FramedBody::Length(r) => r.is_done(),
            // EOF on a raw body means the server closed the connection.
            FramedBody::Raw(_) => false,
        }
    }

    fn into_transport(self) -> Transport {
        match self {
            FramedBody::Chunked(r) => r.into_inner(),
            FramedBody::Length(r) => r.into_inner(),
            FramedBody::Raw(t) => t,
        }
    }
}

impl AsyncRead for FramedBody {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            FramedBody::Chunked(r) => Pin::new(r).poll_read(cx, out),
            FramedBody::Length(r) => Pin::new(r).poll_read(cx, out),
            FramedBody::Raw(t) => Pin::new(t).poll_read(cx, out),
        }
    }
}

/// Framed body, optionally unwrapped from its content encoding.
pub(crate) enum BodyReader {
    Identity(FramedBody),
    Gzip(GzipDecoder<BufReader<FramedBody>>),
    Deflate(DeflateDecoder<BufReader<FramedBody>>),
}

impl BodyReader {
    pub(crate) fn identity(framed: FramedBody) -> Self {
        BodyReader::Identity(framed)
    }

    pub(crate) fn gzip(framed: FramedBody) -> Self {
        BodyReader::Gzip(GzipDecoder::new(BufReader::new(framed)))
    }

    pub(crate) fn deflate(framed: FramedBody) -> Self {
        BodyReader::Deflate(DeflateDecoder::new(BufReader::new(framed)))
    }

    async fn read_some(&mut self, out: &mut [u8]) -> io::Result<usize> {
        match self {
            BodyReader::Identity(r) => r.read(out).await,
            BodyReader::Gzip(r) => r.read(out).await,
            BodyReader::Deflate(r) => r.read(out).await,
        }
    }

    /// After the decoder reports EOF, the framed stream underneath may still
    /// hold undelivered bytes (padding past the compressed payload). They
    /// are consumed here so the tunnel ends up fully read and reusable.
    async fn drain_inner(&mut self) -> io::Result<()> {
        match self {
            BodyReader::Identity(_) => Ok(()),
            BodyReader::Gzip(r) => drain_to_eof(r.get_mut()).await.map(|_| ()),
            BodyReader::Deflate(r) => drain_to_eof(r.get_mut()).await.map(|_| ()),
        }
    }

    fn into_framed(self) -> FramedBody {
        match self {
            BodyReader::Identity(r) => r,
            BodyReader::Gzip(r) => r.into_inner().into_inner(),
            BodyReader::Deflate(r) => r.into_inner().into_inner(),
        }
    }
}

/// Streaming response body.
///
/// The body holds the pooled-tunnel lease for its whole lifetime: reading it
/// to EOF hands the (fully consumed) tunnel back to the pool, while dropping
/// it early marks the tunnel broken so the next acquire replaces it instead
/// of reusing a stream with unread bytes on the wire.
pub struct Body {
    reader: Option<BodyReader>,
    lease: Option<PoolGuard<PooledTunnel>>,
    finished: bool,
}

impl Body {
    pub(crate) fn new(reader: BodyReader, lease: PoolGuard<PooledTunnel>) -> Self {
        Body {
            reader: Some(reader),
            lease: Some(lease),
            finished: false,
        }
    }

    /// Reads some decoded body bytes into `out`; 0 means end of body.
    pub async fn read(&mut self, out: &mut [u8]) -> Result<usize> {
        if self.finished || out.is_empty() {
            return Ok(0);
        }
        let reader = match self.reader.as_mut() {
            Some(r) => r,
            None => return Ok(0),
        };
        match reader.read_some(out).await {
            Ok(0) => {
                self.finish().await?;
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) => {
                self.abandon();
                Err(map_body_err(e))
            }
        }
    }

    /// Collects the remaining body into one buffer.
    pub async fn bytes(mut self) -> Result<Bytes> {
        let mut collected = Vec::new();
        let mut scratch = [0u8; 4096];
        loop {
            let n = self.read(&mut scratch).await?;
            if n == 0 {
                return Ok(Bytes::from(collected));
            }
            collected.extend_from_slice(&scratch[..n]);
        }
    }

    /// Reads the remaining body to EOF, discarding it.
    pub async fn drain(&mut self) -> Result<()> {
        let mut scratch = [0u8; 4096];
        while self.read(&mut scratch).await? != 0 {}
        Ok(())
    }

    /// Clean end of body: settle the tunnel's fate and release the lease.
    async fn finish(&mut self) -> Result<()> {
        self.finished = true;
        let reader = match self.reader.take() {
            Some(r) => r,
            None => return Ok(()),
        };
        let mut reader = reader;
        if let Err(e) = reader.drain_inner().await {
            self.abandon_reader(reader);
            return Err(map_body_err(e));
        }

        let reusable = {
            let framed = match &reader {
                BodyReader::Identity(f) => f,
                // after drain_inner the decoder's BufReader is exhausted,
                // so reuse depends on the framing state alone
                BodyReader::Gzip(r) => r.get_ref().get_ref(),
                BodyReader::Deflate(r) => r.get_ref().get_ref(),
            };
            framed.reusable()
        };

        let transport = reader.into_framed().into_transport();
        if let Some(mut lease) = self.lease.take() {
            if reusable && transport.buffered() == 0 {
                lease.restore_stream(transport.into_inner());
            } else {
                debug!(reusable, "tunnel not reusable after body; marking broken");
                lease.mark_broken();
            }
        }
        Ok(())
    }

    fn abandon_reader(&mut self, reader: BodyReader) {
        drop(reader);
        self.abandon();
    }

    /// Error path: the transport is unsafe to reuse.
    fn abandon(&mut self) {
        self.finished = true;
        self.reader = None;
        if let Some(mut lease) = self.lease.take() {
            lease.mark_broken();
        }
    }
}

impl Drop for Body {
    fn drop(&mut self) {
        if !self.finished {
            if let Some(lease) = self.lease.as_mut() {
                lease.mark_broken();
            }
        }
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Body")
            .field("finished", &self.finished)
            .finish()
    }
}
