use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::server::TlsStream;

/// Unified stream type for plain and TLS-wrapped connections.
///
/// Lets the command loop keep a single stream value across an STLS upgrade:
/// the handler swaps `Plain` for `Tls` in place, passing through `Upgrading`
/// only while the handshake owns the inner stream.
pub enum Pop3Stream<S> {
    Plain(S),
    Tls(Box<TlsStream<S>>),
    /// Transient state during the STLS handshake; never observable by I/O.
    Upgrading,
}

impl<S> Pop3Stream<S> {
    pub fn is_tls(&self) -> bool {
        matches!(self, Pop3Stream::Tls(_))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for Pop3Stream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Pop3Stream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Pop3Stream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
            Pop3Stream::Upgrading => {
                panic!("Attempted I/O on Pop3Stream during STLS upgrade")
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for Pop3Stream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Pop3Stream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Pop3Stream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
            Pop3Stream::Upgrading => {
                panic!("Attempted I/O on Pop3Stream during STLS upgrade")
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Pop3Stream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Pop3Stream::Tls(stream) => Pin::new(stream).poll_flush(cx),
            Pop3Stream::Upgrading => {
                panic!("Attempted I/O on Pop3Stream during STLS upgrade")
            }
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Pop3Stream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Pop3Stream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
            Pop3Stream::Upgrading => {
                panic!("Attempted I/O on Pop3Stream during STLS upgrade")
            }
        }
    }
}
