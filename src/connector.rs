use crate::endpoint::Endpoint;
use crate::errors::{Error, Result};
use crate::options::InterceptOptions;
use crate::socket::MaybeTlsStream;
use crate::tls;
use rustls_pki_types::ServerName;
use socket2::Socket as RawSocket;
use socket2::{Domain, Protocol, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_rustls::TlsConnector;

/// Dials the real server.
pub struct Connector {
  connect_timeout: Option<Duration>,
  nodelay: bool,
  tls: Option<TlsConnector>,
}

impl Connector {
  /// Build the connector described by `options`.
  ///
  /// The TLS client configuration is only built for WebSocket sessions.
  pub fn from_options(options: &InterceptOptions) -> Result<Connector> {
    let tls = if options.use_web_sockets() {
      let config = tls::client_config(options.certs_verification(), options.root_certificates())?;
      Some(TlsConnector::from(Arc::new(config)))
    } else {
      None
    };
    Ok(Connector {
      connect_timeout: options.connect_timeout(),
      nodelay: options.nodelay(),
      tls,
    })
  }
  /// Connect to a remote endpoint with addr
  pub async fn connect_with_addr<S: Into<SocketAddr>>(&self, addr: S) -> Result<TcpStream> {
    let addr = addr.into();
    let raw_socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    raw_socket.set_nonblocking(true)?;
    let socket = TcpSocket::from_std_stream(raw_socket.into());
    if self.nodelay {
      socket.set_nodelay(self.nodelay)?;
    }
    let s = match self.connect_timeout {
      None => socket.connect(addr).await?,
      Some(timeout) => tokio::time::timeout(timeout, socket.connect(addr))
        .await
        .map_err(|x| crate::errors::new_io_error(std::io::ErrorKind::TimedOut, &x.to_string()))??,
    };
    Ok(s)
  }
  /// Resolve `endpoint` and connect to it.
  pub async fn connect(&self, endpoint: &Endpoint) -> Result<TcpStream> {
    let addr = endpoint.resolve().await?;
    tracing::debug!("dialing {} ({})", endpoint, addr);
    self.connect_with_addr(addr).await
  }
  /// Wrap a dialed stream in TLS, presenting `domain` as the server name.
  pub async fn upgrade_to_tls(&self, stream: TcpStream, domain: &str) -> Result<MaybeTlsStream> {
    let tls = self
      .tls
      .clone()
      .ok_or_else(|| Error::configuration("TLS is only configured for web socket sessions"))?;
    let domain = ServerName::try_from(domain.to_owned())
      .map_err(|e| Error::configuration(e.to_string()))?;
    let stream = tls.connect(domain, stream).await?;
    Ok(MaybeTlsStream::ClientTls(Box::new(stream)))
  }
}

/// Bind the listener the game client is accepted on.
pub(crate) fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
  let raw_socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
  raw_socket.set_reuse_address(true)?;
  raw_socket.set_nonblocking(true)?;
  raw_socket.bind(&addr.into())?;
  raw_socket.listen(128)?;
  Ok(TcpListener::from_std(raw_socket.into())?)
}
