//! Traffic interception interfaces
//!
//! Interceptors are registered on a [`Session`](crate::Session) and called synchronously, in
//! registration order, for every lifecycle event and every relayed packet. An error returned by
//! an interceptor is not swallowed: it ends the session and surfaces from
//! [`Session::intercept`](crate::Session::intercept).
use crate::endpoint::Endpoint;
use crate::errors::{Error, Result};
use crate::exchange::Exchange;
use crate::packet::Direction;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Hooks into the lifecycle and traffic of a session.
///
/// Every method defaults to doing nothing.
pub trait Interceptor: Send + Sync {
  /// The game client is accepted and about to be connected to the real server.
  fn on_connected(&self, _event: &mut ConnectedEvent) -> Result<()> {
    Ok(())
  }
  /// A connected session ended. Raised once per connected session.
  fn on_disconnected(&self) -> Result<()> {
    Ok(())
  }
  /// A packet from the game client to the server
  fn on_outgoing(&self, _exchange: &mut Exchange) -> Result<()> {
    Ok(())
  }
  /// A packet from the server to the game client
  fn on_incoming(&self, _exchange: &mut Exchange) -> Result<()> {
    Ok(())
  }
}

/// Hands an endpoint to a negotiation that is waiting on [`ConnectedEvent::defer_endpoint`].
#[derive(Debug)]
pub struct EndpointSender {
  tx: oneshot::Sender<Endpoint>,
}

impl EndpointSender {
  /// Supply the endpoint. Returns `false` when the negotiation is already gone.
  pub fn send(self, endpoint: Endpoint) -> bool {
    self.tx.send(endpoint).is_ok()
  }
}

/// Raised once the game client is accepted, before the real server is dialed.
#[derive(Debug)]
pub struct ConnectedEvent {
  client_addr: SocketAddr,
  web_socket: bool,
  endpoint: Option<Endpoint>,
  fake_policy_request: bool,
  cancelled: bool,
  pending: Option<oneshot::Receiver<Endpoint>>,
}

impl ConnectedEvent {
  pub(crate) fn new(client_addr: SocketAddr, web_socket: bool, endpoint: Option<Endpoint>) -> Self {
    Self {
      client_addr,
      web_socket,
      endpoint,
      fake_policy_request: false,
      cancelled: false,
      pending: None,
    }
  }
  /// Address of the accepted game client
  pub fn client_addr(&self) -> SocketAddr {
    self.client_addr
  }
  /// Whether the game client leg was upgraded to a WebSocket
  pub fn is_web_socket(&self) -> bool {
    self.web_socket
  }
  /// The server that will be dialed, if known yet
  pub fn endpoint(&self) -> Option<&Endpoint> {
    self.endpoint.as_ref()
  }
  /// Dial `endpoint` instead of the one given to `intercept`.
  pub fn set_endpoint(&mut self, endpoint: Endpoint) {
    self.endpoint = Some(endpoint);
    self.pending = None;
  }
  /// Supply the endpoint later.
  ///
  /// The negotiation waits on the returned sender unless an endpoint is set on this event.
  pub fn defer_endpoint(&mut self) -> EndpointSender {
    let (tx, rx) = oneshot::channel();
    self.pending = Some(rx);
    EndpointSender { tx }
  }
  /// Whether the policy file request is replayed toward the server before relaying
  pub fn fake_policy_request(&self) -> bool {
    self.fake_policy_request
  }
  /// Replay the policy file request toward the server before relaying.
  pub fn set_fake_policy_request(&mut self, value: bool) {
    self.fake_policy_request = value;
  }
  /// Abort the interception. `intercept` returns without an error.
  pub fn cancel(&mut self) {
    self.cancelled = true;
  }
  /// Whether an interceptor cancelled the interception
  pub fn is_cancelled(&self) -> bool {
    self.cancelled
  }

  /// Resolve the endpoint to dial, waiting on a deferred hand-off if needed.
  pub(crate) async fn into_endpoint(self) -> Result<Endpoint> {
    if let Some(endpoint) = self.endpoint {
      return Ok(endpoint);
    }
    match self.pending {
      Some(rx) => rx
        .await
        .map_err(|_| Error::configuration("endpoint sender dropped before supplying an endpoint")),
      None => Err(Error::configuration("no endpoint to connect to")),
    }
  }
}

/// Ordered registry of interceptors.
///
/// Cloning the handler shares the registry.
#[derive(Clone, Default)]
pub struct InterceptorHandler {
  interceptors: Arc<RwLock<Vec<Arc<dyn Interceptor>>>>,
}

impl InterceptorHandler {
  /// Create a new interceptor handler
  pub fn new() -> Self {
    Self::default()
  }

  /// Add an interceptor after the ones already registered
  pub fn add_interceptor(&self, interceptor: Arc<dyn Interceptor>) {
    self.interceptors.write().push(interceptor);
  }

  /// Remove a previously added interceptor. Returns whether it was registered.
  pub fn remove_interceptor(&self, interceptor: &Arc<dyn Interceptor>) -> bool {
    let mut interceptors = self.interceptors.write();
    let before = interceptors.len();
    interceptors.retain(|registered| !Arc::ptr_eq(registered, interceptor));
    before != interceptors.len()
  }

  /// Number of registered interceptors
  pub fn len(&self) -> usize {
    self.interceptors.read().len()
  }

  /// Whether no interceptor is registered
  pub fn is_empty(&self) -> bool {
    self.interceptors.read().is_empty()
  }

  // interceptors may register others while being called
  fn snapshot(&self) -> Vec<Arc<dyn Interceptor>> {
    self.interceptors.read().clone()
  }

  /// Process a connected event through all interceptors
  pub fn process_connected(&self, event: &mut ConnectedEvent) -> Result<()> {
    for interceptor in self.snapshot() {
      interceptor.on_connected(event)?;
    }
    Ok(())
  }

  /// Notify all interceptors of a disconnect
  pub fn process_disconnected(&self) -> Result<()> {
    for interceptor in self.snapshot() {
      interceptor.on_disconnected()?;
    }
    Ok(())
  }

  /// Process a packet through all interceptors of its direction
  pub fn process_exchange(&self, exchange: &mut Exchange) -> Result<()> {
    let direction = exchange.direction();
    for interceptor in self.snapshot() {
      match direction {
        Direction::Outgoing => interceptor.on_outgoing(exchange)?,
        Direction::Incoming => interceptor.on_incoming(exchange)?,
      }
    }
    Ok(())
  }
}

impl std::fmt::Debug for InterceptorHandler {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("InterceptorHandler")
      .field("interceptors", &self.len())
      .finish()
  }
}

/// Logs the lifecycle and every packet through `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingInterceptor {
  payloads: bool,
}

impl LoggingInterceptor {
  /// Log packet headers only
  pub fn new() -> Self {
    Self::default()
  }
  /// Log packet bodies as well
  pub fn with_payloads(mut self) -> Self {
    self.payloads = true;
    self
  }

  fn log(&self, exchange: &Exchange) {
    let packet = exchange.packet();
    if self.payloads {
      tracing::info!(
        "[{}] #{} id={:?} len={} {}",
        exchange.direction(),
        exchange.sequence(),
        packet.id(),
        packet.len(),
        packet.payload().escape_ascii()
      );
    } else {
      tracing::info!(
        "[{}] #{} id={:?} len={}",
        exchange.direction(),
        exchange.sequence(),
        packet.id(),
        packet.len()
      );
    }
  }
}

impl Interceptor for LoggingInterceptor {
  fn on_connected(&self, event: &mut ConnectedEvent) -> Result<()> {
    match event.endpoint() {
      Some(endpoint) => tracing::info!(
        "client {} connected, relaying to {}",
        event.client_addr(),
        endpoint
      ),
      None => tracing::info!("client {} connected", event.client_addr()),
    }
    Ok(())
  }

  fn on_disconnected(&self) -> Result<()> {
    tracing::info!("session disconnected");
    Ok(())
  }

  fn on_outgoing(&self, exchange: &mut Exchange) -> Result<()> {
    self.log(exchange);
    Ok(())
  }

  fn on_incoming(&self, exchange: &mut Exchange) -> Result<()> {
    self.log(exchange);
    Ok(())
  }
}
