use crate::errors::{Error, Result};
use crate::game::Game;
use crate::tls::{Certificate, Identity};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Port the game client is redirected to unless configured otherwise.
pub const DEFAULT_LISTEN_PORT: u16 = 9567;

/// Negotiation options of an [`intercept`](crate::Session::intercept) call.
///
/// Instances are immutable and can only be produced validated, through
/// [`InterceptOptionsBuilder::build`], or as the raw socket [`Default`].
#[derive(Clone, Debug)]
pub struct InterceptOptions {
  listen_addr: IpAddr,
  listen_port: u16,
  listen_skip_amount: usize,
  use_web_sockets: bool,
  certificate: Option<Identity>,
  web_socket_path: String,
  connect_timeout: Option<Duration>,
  nodelay: bool,
  certs_verification: bool,
  root_certificates: Vec<Certificate>,
}

impl Default for InterceptOptions {
  fn default() -> Self {
    Self {
      listen_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
      listen_port: DEFAULT_LISTEN_PORT,
      listen_skip_amount: 0,
      use_web_sockets: false,
      certificate: None,
      web_socket_path: String::from("/websocket"),
      connect_timeout: Some(Duration::from_secs(10)),
      nodelay: true,
      certs_verification: true,
      root_certificates: vec![],
    }
  }
}

impl InterceptOptions {
  /// Start building options from the defaults.
  pub fn builder() -> InterceptOptionsBuilder {
    InterceptOptionsBuilder::default()
  }
  /// Start building options for a game, with the transport mode derived from its kind.
  pub fn for_game(game: &Game) -> InterceptOptionsBuilder {
    InterceptOptionsBuilder::default().use_web_sockets(game.kind.uses_web_sockets())
  }
  /// interface the game client is accepted on
  pub fn listen_addr(&self) -> IpAddr {
    self.listen_addr
  }
  /// port the game client is accepted on
  pub fn listen_port(&self) -> u16 {
    self.listen_port
  }
  /// socket address the negotiator listens on
  pub fn listen_socket_addr(&self) -> SocketAddr {
    SocketAddr::new(self.listen_addr, self.listen_port)
  }
  /// number of leading accepted connections discarded without negotiating
  pub fn listen_skip_amount(&self) -> usize {
    self.listen_skip_amount
  }
  /// whether both legs are upgraded to secure WebSockets
  pub fn use_web_sockets(&self) -> bool {
    self.use_web_sockets
  }
  /// identity presented to the game client in WebSocket mode
  pub fn certificate(&self) -> Option<&Identity> {
    self.certificate.as_ref()
  }
  /// request path of the upgrade toward the real server
  pub fn web_socket_path(&self) -> &str {
    &self.web_socket_path
  }
  /// connect timeout of the remote dial
  pub fn connect_timeout(&self) -> Option<Duration> {
    self.connect_timeout
  }
  /// whether `TCP_NODELAY` is set on both legs
  pub fn nodelay(&self) -> bool {
    self.nodelay
  }
  /// whether the real server's certificate is verified
  pub fn certs_verification(&self) -> bool {
    self.certs_verification
  }
  /// extra roots trusted on the server-facing leg
  pub fn root_certificates(&self) -> &[Certificate] {
    &self.root_certificates
  }
}

/// Builder of [`InterceptOptions`].
#[derive(Clone, Debug, Default)]
pub struct InterceptOptionsBuilder {
  inner: InterceptOptions,
}

impl InterceptOptionsBuilder {
  /// Set the interface the game client is accepted on.
  ///
  /// Default is `127.0.0.1`.
  pub fn listen_addr(mut self, value: IpAddr) -> InterceptOptionsBuilder {
    self.inner.listen_addr = value;
    self
  }
  /// Set the port the game client is accepted on.
  ///
  /// Default is `9567`.
  pub fn listen_port(mut self, value: u16) -> InterceptOptionsBuilder {
    self.inner.listen_port = value;
    self
  }
  /// Discard the first `value` accepted connections without negotiating.
  ///
  /// Browsers probe the port before the real connection is made; skipping absorbs them.
  /// Default is `0`.
  pub fn listen_skip_amount(mut self, value: usize) -> InterceptOptionsBuilder {
    self.inner.listen_skip_amount = value;
    self
  }
  /// Upgrade both legs to secure WebSockets.
  ///
  /// Requires a [`certificate`](Self::certificate). Default is `false`.
  pub fn use_web_sockets(mut self, value: bool) -> InterceptOptionsBuilder {
    self.inner.use_web_sockets = value;
    self
  }
  /// Set the identity presented to the game client in WebSocket mode.
  pub fn certificate(mut self, value: Identity) -> InterceptOptionsBuilder {
    self.inner.certificate = Some(value);
    self
  }
  /// Set the request path of the upgrade toward the real server.
  ///
  /// Default is `/websocket`.
  pub fn web_socket_path(mut self, value: impl Into<String>) -> InterceptOptionsBuilder {
    self.inner.web_socket_path = value.into();
    self
  }
  /// Set a timeout for the remote dial.
  ///
  /// Default is 10 seconds.
  pub fn connect_timeout(mut self, timeout: Option<Duration>) -> InterceptOptionsBuilder {
    self.inner.connect_timeout = timeout;
    self
  }
  /// Set that both legs have `TCP_NODELAY` set to the supplied value.
  ///
  /// Default is `true`.
  pub fn nodelay(mut self, value: bool) -> InterceptOptionsBuilder {
    self.inner.nodelay = value;
    self
  }
  /// Controls the use of certificate validation toward the real server.
  ///
  /// Defaults to `true`.
  ///
  /// # Warning
  ///
  /// If disabled, *any* certificate presented by the server-facing leg is accepted.
  pub fn certs_verification(mut self, value: bool) -> InterceptOptionsBuilder {
    self.inner.certs_verification = value;
    self
  }
  /// Adds certificates to the set of roots trusted on the server-facing leg.
  pub fn root_certificates(mut self, value: Vec<Certificate>) -> InterceptOptionsBuilder {
    self.inner.root_certificates = value;
    self
  }
  /// Validate and freeze the options.
  pub fn build(self) -> Result<InterceptOptions> {
    let options = self.inner;
    if options.use_web_sockets && options.certificate.is_none() {
      return Err(Error::configuration(
        "a certificate is required to intercept web socket sessions",
      ));
    }
    if options.use_web_sockets && !options.web_socket_path.starts_with('/') {
      return Err(Error::configuration(format!(
        "web socket path must start with '/': {}",
        options.web_socket_path
      )));
    }
    Ok(options)
  }
}
