use crate::endpoint::Endpoint;
use crate::errors::{new_io_error, Result};
use crate::format::Formats;
use crate::interceptor::{Interceptor, InterceptorHandler};
use crate::negotiator::Negotiator;
use crate::node::Node;
use crate::options::InterceptOptions;
use crate::packet::{Direction, Packet};
use crate::relay::Relay;
use parking_lot::Mutex;
use std::fmt;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Lifecycle of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionState {
  /// no interception started yet
  Idle,
  /// waiting for the game client
  Listening,
  /// handshaking with the game client or the real server
  Negotiating,
  /// both legs open and relaying
  Connected,
  /// torn down
  Disconnected,
}

impl SessionState {
  fn from_u8(value: u8) -> Self {
    match value {
      1 => SessionState::Listening,
      2 => SessionState::Negotiating,
      3 => SessionState::Connected,
      4 => SessionState::Disconnected,
      _ => SessionState::Idle,
    }
  }
}

impl fmt::Display for SessionState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      SessionState::Idle => "idle",
      SessionState::Listening => "listening",
      SessionState::Negotiating => "negotiating",
      SessionState::Connected => "connected",
      SessionState::Disconnected => "disconnected",
    };
    f.write_str(name)
  }
}

/// State owned by one `intercept` call.
///
/// Relay loops only ever tear down the link they were spawned for, so a loop that outlives its
/// session can not disturb the next one.
pub(crate) struct Link {
  id: u64,
  token: CancellationToken,
  local: Mutex<Option<Arc<Node>>>,
  remote: Mutex<Option<Arc<Node>>>,
  state: AtomicU8,
  torn_down: AtomicBool,
  handler: InterceptorHandler,
}

impl Link {
  fn new(id: u64, token: CancellationToken, handler: InterceptorHandler) -> Self {
    Self {
      id,
      token,
      local: Mutex::new(None),
      remote: Mutex::new(None),
      state: AtomicU8::new(SessionState::Idle as u8),
      torn_down: AtomicBool::new(false),
      handler,
    }
  }

  pub(crate) fn token(&self) -> &CancellationToken {
    &self.token
  }

  pub(crate) fn handler(&self) -> &InterceptorHandler {
    &self.handler
  }

  pub(crate) fn state(&self) -> SessionState {
    SessionState::from_u8(self.state.load(Ordering::Acquire))
  }

  /// Move between the negotiation states. Has no effect once the link is torn down.
  pub(crate) fn set_state(&self, state: SessionState) {
    let _ = self
      .state
      .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
        match SessionState::from_u8(current) {
          SessionState::Disconnected | SessionState::Connected => None,
          _ => Some(state as u8),
        }
      });
  }

  /// Store the negotiated nodes and enter Connected. `false` when the link was torn down first.
  fn attach(&self, local: Arc<Node>, remote: Arc<Node>) -> bool {
    *self.local.lock() = Some(local.clone());
    *self.remote.lock() = Some(remote.clone());
    let connected = !self.torn_down.load(Ordering::Acquire)
      && self
        .state
        .compare_exchange(
          SessionState::Negotiating as u8,
          SessionState::Connected as u8,
          Ordering::AcqRel,
          Ordering::Acquire,
        )
        .is_ok();
    if !connected {
      local.close();
      remote.close();
    }
    connected
  }

  fn node(&self, direction: Direction) -> Option<Arc<Node>> {
    match direction {
      Direction::Outgoing => self.remote.lock().clone(),
      Direction::Incoming => self.local.lock().clone(),
    }
  }

  /// Close both nodes and cancel the link. Only the first caller does the work; Disconnected is
  /// raised once, and only if the link reached Connected.
  pub(crate) fn teardown(&self) -> Result<()> {
    if self
      .torn_down
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      return Ok(());
    }
    self.token.cancel();
    let local = self.local.lock().take();
    let remote = self.remote.lock().take();
    for node in local.iter().chain(remote.iter()) {
      node.close();
    }
    let previous = self
      .state
      .swap(SessionState::Disconnected as u8, Ordering::AcqRel);
    if SessionState::from_u8(previous) == SessionState::Connected {
      tracing::info!("session {} disconnected", self.id);
      self.handler.process_disconnected()
    } else {
      tracing::debug!("session {} stopped while {}", self.id, SessionState::from_u8(previous));
      Ok(())
    }
  }
}

/// An interception proxy between one game client and its server.
///
/// A session runs one interception at a time. Starting a new one through
/// [`intercept`](Session::intercept) tears down whatever the previous call left running.
pub struct Session {
  formats: Formats,
  handler: InterceptorHandler,
  current: Mutex<Option<Arc<Link>>>,
  links: AtomicU64,
}

impl Session {
  /// Create a session framing traffic with `formats`.
  pub fn new(formats: Formats) -> Self {
    Self {
      formats,
      handler: InterceptorHandler::new(),
      current: Mutex::new(None),
      links: AtomicU64::new(0),
    }
  }

  /// Register an interceptor after the ones already registered.
  pub fn add_interceptor(&self, interceptor: Arc<dyn Interceptor>) {
    self.handler.add_interceptor(interceptor);
  }

  /// The interceptor registry
  pub fn interceptor_handler(&self) -> &InterceptorHandler {
    &self.handler
  }

  /// The formats packets are framed with
  pub fn formats(&self) -> &Formats {
    &self.formats
  }

  fn current(&self) -> Option<Arc<Link>> {
    self.current.lock().clone()
  }

  /// Lifecycle state of the latest interception
  pub fn state(&self) -> SessionState {
    self
      .current()
      .map(|link| link.state())
      .unwrap_or(SessionState::Idle)
  }

  /// Whether both legs are open and relaying
  pub fn is_connected(&self) -> bool {
    self.state() == SessionState::Connected
  }

  /// Accept the game client, connect it to `endpoint` and relay traffic until the session ends.
  ///
  /// `endpoint` may be left out when an interceptor supplies one from
  /// [`on_connected`](Interceptor::on_connected). The call returns `Ok(())` when either side
  /// closes, when [`disconnect`](Session::disconnect) is called, or when `cancel` fires.
  /// Protocol and configuration failures abort the negotiation and are returned, as is the
  /// first error raised by an interceptor.
  pub async fn intercept(
    &self,
    endpoint: Option<Endpoint>,
    options: &InterceptOptions,
    cancel: CancellationToken,
  ) -> Result<()> {
    let id = self.links.fetch_add(1, Ordering::Relaxed) + 1;
    let link = Arc::new(Link::new(id, cancel.child_token(), self.handler.clone()));
    let previous = self.current.lock().replace(link.clone());
    if let Some(previous) = previous {
      previous.teardown()?;
    }

    let negotiated = match Negotiator::new(options, &self.handler) {
      Ok(negotiator) => negotiator.negotiate(&link, endpoint).await,
      Err(e) => Err(e),
    };
    let (local, remote) = match negotiated {
      Ok(Some(nodes)) => nodes,
      Ok(None) => return link.teardown(),
      Err(e) => {
        link.teardown()?;
        return Err(e);
      }
    };
    let local = Arc::new(local);
    let remote = Arc::new(remote);
    if !link.attach(local.clone(), remote.clone()) {
      return link.teardown();
    }
    tracing::info!(
      "session {} connected: {} <-> {}",
      id,
      local.peer_addr(),
      remote.peer_addr()
    );

    let outgoing = tokio::spawn(
      Relay {
        direction: Direction::Outgoing,
        source: local.clone(),
        destination: remote.clone(),
        format: self.formats.send.clone(),
        link: link.clone(),
      }
      .run(),
    );
    let incoming = tokio::spawn(
      Relay {
        direction: Direction::Incoming,
        source: remote,
        destination: local,
        format: self.formats.receive.clone(),
        link: link.clone(),
      }
      .run(),
    );

    link.token().cancelled().await;
    let torn_down = link.teardown();
    let (outgoing, incoming) = tokio::join!(outgoing, incoming);
    for joined in [outgoing, incoming] {
      match joined {
        Ok(result) => result?,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(_) => {}
      }
    }
    torn_down
  }

  async fn send(&self, direction: Direction, packet: &Packet) -> Result<()> {
    let node = self
      .current()
      .and_then(|link| link.node(direction))
      .ok_or_else(|| new_io_error(ErrorKind::NotConnected, "session is not connected"))?;
    node
      .send_packet(self.formats.for_direction(direction).as_ref(), packet)
      .await
  }

  /// Inject a packet toward the game client.
  pub async fn send_to_client(&self, packet: &Packet) -> Result<()> {
    self.send(Direction::Incoming, packet).await
  }

  /// Inject a packet toward the real server.
  pub async fn send_to_server(&self, packet: &Packet) -> Result<()> {
    self.send(Direction::Outgoing, packet).await
  }

  /// Tear down the current interception.
  ///
  /// Safe to call from any thread and any number of times; only the first call closes the legs
  /// and raises [`on_disconnected`](Interceptor::on_disconnected).
  pub fn disconnect(&self) -> Result<()> {
    match self.current() {
      Some(link) => link.teardown(),
      None => Ok(()),
    }
  }
}

impl Default for Session {
  fn default() -> Self {
    Self::new(Formats::default())
  }
}

impl fmt::Debug for Session {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Session")
      .field("state", &self.state())
      .field("formats", &self.formats)
      .field("handler", &self.handler)
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;

  #[derive(Default)]
  struct Disconnects(AtomicUsize);

  impl Interceptor for Disconnects {
    fn on_disconnected(&self) -> Result<()> {
      self.0.fetch_add(1, Ordering::SeqCst);
      Ok(())
    }
  }

  fn link(handler: &InterceptorHandler) -> Link {
    Link::new(1, CancellationToken::new(), handler.clone())
  }

  #[test]
  fn teardown_before_connected_is_silent() {
    let handler = InterceptorHandler::new();
    let disconnects = Arc::new(Disconnects::default());
    handler.add_interceptor(disconnects.clone());
    let link = link(&handler);
    link.set_state(SessionState::Listening);
    link.teardown().unwrap();
    assert_eq!(link.state(), SessionState::Disconnected);
    assert!(link.token().is_cancelled());
    assert_eq!(disconnects.0.load(Ordering::SeqCst), 0);
    // a torn down link never moves again
    link.set_state(SessionState::Negotiating);
    assert_eq!(link.state(), SessionState::Disconnected);
  }

  #[test]
  fn concurrent_teardown_raises_one_disconnect() {
    let handler = InterceptorHandler::new();
    let disconnects = Arc::new(Disconnects::default());
    handler.add_interceptor(disconnects.clone());
    let link = Arc::new(link(&handler));
    link.set_state(SessionState::Negotiating);
    link
      .state
      .store(SessionState::Connected as u8, Ordering::Release);
    let threads: Vec<_> = (0..8)
      .map(|_| {
        let link = link.clone();
        std::thread::spawn(move || link.teardown().unwrap())
      })
      .collect();
    for thread in threads {
      thread.join().unwrap();
    }
    assert_eq!(disconnects.0.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn idle_session_refuses_injection() {
    let session = Session::default();
    assert_eq!(session.state(), SessionState::Idle);
    assert!(!session.is_connected());
    assert!(session.send_to_server(&Packet::with_id(1, b"")).await.is_err());
    session.disconnect().unwrap();
  }
}
