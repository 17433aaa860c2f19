use std::io::Error;
use std::ops::Deref;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{client, server};

/// A connection leg, plain or wrapped in TLS.
///
/// The client-facing leg terminates TLS as a server, the server-facing leg as a client.
#[derive(Debug)]
pub enum MaybeTlsStream {
  /// TCP
  Tcp(TcpStream),
  /// TLS accepted from the game client
  ServerTls(Box<server::TlsStream<TcpStream>>),
  /// TLS dialed toward the real server
  ClientTls(Box<client::TlsStream<TcpStream>>),
}

// 实现socket的读写
impl AsyncRead for MaybeTlsStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
      MaybeTlsStream::ServerTls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
      MaybeTlsStream::ClientTls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
    }
  }
}
impl AsyncWrite for MaybeTlsStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
      MaybeTlsStream::ServerTls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
      MaybeTlsStream::ClientTls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
      MaybeTlsStream::ServerTls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
      MaybeTlsStream::ClientTls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
    }
  }
  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
      MaybeTlsStream::ServerTls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
      MaybeTlsStream::ClientTls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
    }
  }
}

// 直接暴露socket的全部外部接口
impl Deref for MaybeTlsStream {
  type Target = TcpStream;

  fn deref(&self) -> &Self::Target {
    match self {
      MaybeTlsStream::Tcp(s) => s,
      MaybeTlsStream::ServerTls(t) => t.get_ref().0,
      MaybeTlsStream::ClientTls(t) => t.get_ref().0,
    }
  }
}
