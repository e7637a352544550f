//! Stream that replays already-consumed bytes before reading from the socket

use bytes::{Buf, Bytes};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Reads from `prefix` first, then the underlying stream. Writes go straight
/// to the underlying stream.
#[derive(Debug)]
pub struct PrefixedStream<S> {
    prefix: Bytes,
    stream: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: impl Into<Bytes>, stream: S) -> Self {
        Self {
            prefix: prefix.into(),
            stream,
        }
    }

    /// Bytes that have not been replayed yet
    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Unreplayed prefix and the underlying stream
    pub fn into_parts(self) -> (Bytes, S) {
        (self.prefix, self.stream)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let to_read = std::cmp::min(self.prefix.len(), buf.remaining());
            buf.put_slice(&self.prefix[..to_read]);
            self.prefix.advance(to_read);
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_prefix_is_replayed_before_stream() {
        let (mut far, near) = tokio::io::duplex(64);
        far.write_all(b" world").await.unwrap();
        drop(far);

        let mut stream = PrefixedStream::new(Bytes::from_static(b"hello"), near);
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn test_small_reads_do_not_lose_prefix_bytes() {
        let (_far, near) = tokio::io::duplex(64);
        let mut stream = PrefixedStream::new(Bytes::from_static(b"GET"), near);

        let mut one = [0u8; 1];
        stream.read_exact(&mut one).await.unwrap();
        assert_eq!(&one, b"G");
        assert_eq!(stream.prefix(), b"ET");

        let (rest, _) = stream.into_parts();
        assert_eq!(&rest[..], b"ET");
    }

    #[tokio::test]
    async fn test_writes_pass_through() {
        let (mut far, near) = tokio::io::duplex(64);
        let mut stream = PrefixedStream::new(Bytes::new(), near);
        stream.write_all(b"pong").await.unwrap();

        let mut buf = [0u8; 4];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }
}
