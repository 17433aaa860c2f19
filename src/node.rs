//! Transport node
//!
//! A [`Node`] is one leg of a session: the game client side or the real server side. It keeps
//! its read and write halves behind separate locks so that handlers can inject packets while
//! the relay loop is parked on a receive.
use crate::connector::Connector;
use crate::endpoint::Endpoint;
use crate::errors::{new_io_error, Error, Result};
use crate::format::Format;
use crate::packet::Packet;
use crate::socket::MaybeTlsStream;
use bytes::BytesMut;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::io::ErrorKind;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

const READ_CHUNK: usize = 8 * 1024;

type WebSocket = WebSocketStream<MaybeTlsStream>;

enum Source {
  Raw(ReadHalf<MaybeTlsStream>),
  WebSocket(SplitStream<WebSocket>),
}

enum Sink {
  Raw(WriteHalf<MaybeTlsStream>),
  WebSocket(SplitSink<WebSocket, Message>),
}

struct Reader {
  source: Source,
  buf: BytesMut,
}

impl Reader {
  /// Pull more bytes into the buffer. `false` means the peer ended the stream.
  async fn fill(&mut self) -> Result<bool> {
    match &mut self.source {
      Source::Raw(half) => {
        self.buf.reserve(READ_CHUNK);
        Ok(half.read_buf(&mut self.buf).await? != 0)
      }
      Source::WebSocket(stream) => loop {
        match stream.next().await {
          Some(Ok(Message::Binary(data))) => {
            self.buf.extend_from_slice(&data);
            return Ok(true);
          }
          Some(Ok(Message::Text(text))) => {
            self.buf.extend_from_slice(text.as_bytes());
            return Ok(true);
          }
          Some(Ok(Message::Close(_))) | None => return Ok(false),
          // control frames carry no game traffic
          Some(Ok(_)) => continue,
          Some(Err(e)) => return Err(e.into()),
        }
      },
    }
  }
}

impl Sink {
  async fn send(&mut self, data: &[u8]) -> Result<()> {
    match self {
      Sink::Raw(half) => {
        half.write_all(data).await?;
        half.flush().await?;
      }
      Sink::WebSocket(sink) => sink.send(Message::binary(data.to_vec())).await?,
    }
    Ok(())
  }
}

/// One leg of an intercepted session.
pub struct Node {
  peer_addr: SocketAddr,
  web_socket: bool,
  reader: Mutex<Option<Reader>>,
  writer: Mutex<Option<Sink>>,
  closed: CancellationToken,
}

impl std::fmt::Debug for Node {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Node")
      .field("peer_addr", &self.peer_addr)
      .field("web_socket", &self.web_socket)
      .field("closed", &self.is_closed())
      .finish()
  }
}

impl Node {
  /// Wrap an accepted or dialed TCP stream as a raw node.
  pub fn from_tcp(stream: TcpStream) -> Result<Node> {
    Self::raw(MaybeTlsStream::Tcp(stream))
  }

  fn raw(stream: MaybeTlsStream) -> Result<Node> {
    let peer_addr = stream.peer_addr()?;
    let (read, write) = tokio::io::split(stream);
    Ok(Self::assemble(
      peer_addr,
      false,
      Source::Raw(read),
      Sink::Raw(write),
    ))
  }

  fn web_socket(stream: WebSocket, peer_addr: SocketAddr) -> Node {
    let (sink, source) = stream.split();
    Self::assemble(
      peer_addr,
      true,
      Source::WebSocket(source),
      Sink::WebSocket(sink),
    )
  }

  fn assemble(peer_addr: SocketAddr, web_socket: bool, source: Source, sink: Sink) -> Node {
    Node {
      peer_addr,
      web_socket,
      reader: Mutex::new(Some(Reader {
        source,
        buf: BytesMut::with_capacity(READ_CHUNK),
      })),
      writer: Mutex::new(Some(sink)),
      closed: CancellationToken::new(),
    }
  }

  /// Take the plain TCP stream back out of a raw node that has not been used yet.
  fn into_tcp(self) -> Result<TcpStream> {
    let reader = self.reader.into_inner();
    let writer = self.writer.into_inner();
    match (reader, writer) {
      (
        Some(Reader {
          source: Source::Raw(read),
          ..
        }),
        Some(Sink::Raw(write)),
      ) => match read.unsplit(write) {
        MaybeTlsStream::Tcp(stream) => Ok(stream),
        _ => Err(Error::protocol("node is already upgraded")),
      },
      _ => Err(new_io_error(
        ErrorKind::NotConnected,
        "node is closed or already upgraded",
      )),
    }
  }

  /// Terminate TLS with the game client and accept its WebSocket upgrade.
  pub async fn upgrade_as_server(self, acceptor: &TlsAcceptor) -> Result<Node> {
    let peer_addr = self.peer_addr;
    let stream = self.into_tcp()?;
    let tls = acceptor.accept(stream).await.map_err(|e| {
      if e.kind() == ErrorKind::InvalidData {
        Error::protocol(format!("TLS handshake with {} failed: {}", peer_addr, e))
      } else {
        Error::IO(e)
      }
    })?;
    let stream = MaybeTlsStream::ServerTls(Box::new(tls));
    let web_socket = tokio_tungstenite::accept_async(stream).await?;
    tracing::debug!("accepted web socket upgrade from {}", peer_addr);
    Ok(Self::web_socket(web_socket, peer_addr))
  }

  /// Dial TLS toward the real server and request a WebSocket upgrade on `path`.
  pub async fn upgrade_as_client(
    self,
    connector: &Connector,
    endpoint: &Endpoint,
    path: &str,
  ) -> Result<Node> {
    let peer_addr = self.peer_addr;
    let stream = self.into_tcp()?;
    let stream = connector.upgrade_to_tls(stream, endpoint.host()).await?;
    let uri: http::Uri = format!("wss://{}{}", endpoint, path).parse()?;
    let (web_socket, response) = tokio_tungstenite::client_async(uri, stream).await?;
    tracing::debug!(
      "web socket upgrade to {} answered with {}",
      endpoint,
      response.status()
    );
    Ok(Self::web_socket(web_socket, peer_addr))
  }

  /// address of the peer on this leg
  pub fn peer_addr(&self) -> SocketAddr {
    self.peer_addr
  }
  /// whether this leg speaks WebSocket frames
  pub fn is_web_socket(&self) -> bool {
    self.web_socket
  }
  /// whether [`close`](Self::close) has been called
  pub fn is_closed(&self) -> bool {
    self.closed.is_cancelled()
  }

  /// Write raw bytes; one binary message on a WebSocket leg.
  pub async fn send_bytes(&self, data: &[u8]) -> Result<()> {
    if self.is_closed() {
      return Err(closed_error());
    }
    let mut guard = self.writer.lock().await;
    let sink = guard.as_mut().ok_or_else(closed_error)?;
    let result = tokio::select! {
      _ = self.closed.cancelled() => Err(closed_error()),
      result = sink.send(data) => result,
    };
    if result.is_err() || self.is_closed() {
      *guard = None;
    }
    result
  }

  /// Read whatever bytes are available into `buf`. `Ok(0)` means the leg is done.
  pub async fn receive_bytes(&self, buf: &mut [u8]) -> Result<usize> {
    let mut guard = self.reader.lock().await;
    loop {
      let Some(reader) = guard.as_mut() else {
        return Ok(0);
      };
      if !reader.buf.is_empty() {
        let n = reader.buf.len().min(buf.len());
        buf[..n].copy_from_slice(&reader.buf.split_to(n));
        return Ok(n);
      }
      if !self.fill(reader).await? {
        *guard = None;
        return Ok(0);
      }
    }
  }

  /// Frame and send one packet.
  pub async fn send_packet(&self, format: &dyn Format, packet: &Packet) -> Result<()> {
    let mut buf = BytesMut::new();
    format.encode(packet, &mut buf)?;
    self.send_bytes(&buf).await
  }

  /// Receive one packet.
  ///
  /// `Ok(None)` is the end of the stream: the peer closed the leg, or [`close`](Self::close)
  /// was called.
  pub async fn receive_packet(&self, format: &dyn Format) -> Result<Option<Packet>> {
    let mut guard = self.reader.lock().await;
    loop {
      let Some(reader) = guard.as_mut() else {
        return Ok(None);
      };
      if self.is_closed() {
        *guard = None;
        return Ok(None);
      }
      match format.decode(&mut reader.buf) {
        Ok(Some(packet)) => return Ok(Some(packet)),
        Ok(None) => {}
        Err(e) => {
          *guard = None;
          return Err(e);
        }
      }
      match self.fill(reader).await {
        Ok(true) => continue,
        Ok(false) => {
          *guard = None;
          return Ok(None);
        }
        Err(e) => {
          *guard = None;
          return Err(e);
        }
      }
    }
  }

  async fn fill(&self, reader: &mut Reader) -> Result<bool> {
    tokio::select! {
      _ = self.closed.cancelled() => Ok(false),
      filled = reader.fill() => filled,
    }
  }

  /// Close the leg. Idempotent and safe to call while a receive or send is in flight: the busy
  /// operation observes the closure and releases its half.
  pub fn close(&self) {
    if self.closed.is_cancelled() {
      return;
    }
    self.closed.cancel();
    if let Ok(mut writer) = self.writer.try_lock() {
      writer.take();
    }
    if let Ok(mut reader) = self.reader.try_lock() {
      reader.take();
    }
    tracing::trace!("closed node {}", self.peer_addr);
  }
}

fn closed_error() -> Error {
  new_io_error(ErrorKind::NotConnected, "node is closed")
}
