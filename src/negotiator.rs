//! Client and server handshakes
//!
//! The negotiator accepts game clients until one completes the handshake, lets interceptors pick
//! the server, and dials it. In raw mode it answers the cross-domain policy probe some clients
//! send on a throwaway connection first.
use crate::connector::{bind_listener, Connector};
use crate::endpoint::Endpoint;
use crate::errors::{Error, Result};
use crate::interceptor::{ConnectedEvent, InterceptorHandler};
use crate::node::Node;
use crate::options::InterceptOptions;
use crate::session::{Link, SessionState};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

/// Probe a raw client sends before the game connection.
pub const POLICY_REQUEST: &[u8] = b"<policy-file-request/>\0";
/// Answer to [`POLICY_REQUEST`]
pub const POLICY_RESPONSE: &[u8] =
  b"<cross-domain-policy><allow-access-from domain=\"*\" to-ports=\"*\"/></cross-domain-policy>\0";

const POLICY_RESPONSE_LIMIT: usize = 4096;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

enum Attempt {
  Connected(Node, Node),
  Retry,
  Aborted,
}

pub(crate) struct Negotiator<'a> {
  options: &'a InterceptOptions,
  handler: &'a InterceptorHandler,
  acceptor: Option<TlsAcceptor>,
  connector: Connector,
}

impl<'a> Negotiator<'a> {
  /// Check the options and prepare both TLS sides before anything is bound.
  pub(crate) fn new(
    options: &'a InterceptOptions,
    handler: &'a InterceptorHandler,
  ) -> Result<Self> {
    let acceptor = if options.use_web_sockets() {
      let identity = options
        .certificate()
        .ok_or_else(|| Error::configuration("web socket interception requires a certificate"))?;
      Some(TlsAcceptor::from(Arc::new(identity.server_config()?)))
    } else {
      None
    };
    Ok(Negotiator {
      options,
      handler,
      acceptor,
      connector: Connector::from_options(options)?,
    })
  }

  /// Accept game clients until one is connected to its server.
  ///
  /// `Ok(None)` means the link was cancelled, or an interceptor cancelled the attempt.
  pub(crate) async fn negotiate(
    &self,
    link: &Link,
    endpoint: Option<Endpoint>,
  ) -> Result<Option<(Node, Node)>> {
    let token = link.token();
    link.set_state(SessionState::Listening);
    let listener = bind_listener(self.options.listen_socket_addr())?;
    tracing::info!("listening for the game client on {}", listener.local_addr()?);
    let mut accepted = 0usize;
    loop {
      link.set_state(SessionState::Listening);
      let (stream, addr) = tokio::select! {
        _ = token.cancelled() => return Ok(None),
        accept = listener.accept() => match accept {
          Ok(accepted) => accepted,
          Err(e) => {
            tracing::warn!("accept failed: {}", e);
            if !back_off(token).await {
              return Ok(None);
            }
            continue;
          }
        },
      };
      accepted += 1;
      if accepted <= self.options.listen_skip_amount() {
        tracing::debug!("skipping connection {} from {}", accepted, addr);
        continue;
      }
      link.set_state(SessionState::Negotiating);
      tracing::debug!("negotiating with {}", addr);
      let attempt = tokio::select! {
        _ = token.cancelled() => return Ok(None),
        attempt = self.attempt(stream, endpoint.as_ref()) => attempt,
      };
      match attempt {
        Ok(Attempt::Connected(local, remote)) => return Ok(Some((local, remote))),
        Ok(Attempt::Retry) => continue,
        Ok(Attempt::Aborted) => return Ok(None),
        Err(e) if e.is_retryable() => {
          tracing::warn!("negotiation with {} failed: {}", addr, e);
          continue;
        }
        Err(e) => return Err(e),
      }
    }
  }

  async fn attempt(&self, mut stream: TcpStream, endpoint: Option<&Endpoint>) -> Result<Attempt> {
    let client_addr = stream.peer_addr()?;
    if self.options.nodelay() {
      stream.set_nodelay(true)?;
    }
    let local = match &self.acceptor {
      Some(acceptor) => Node::from_tcp(stream)?.upgrade_as_server(acceptor).await?,
      None => {
        if answer_policy_probe(&mut stream).await? {
          return Ok(Attempt::Retry);
        }
        Node::from_tcp(stream)?
      }
    };

    let mut event = ConnectedEvent::new(client_addr, local.is_web_socket(), endpoint.cloned());
    self.handler.process_connected(&mut event)?;
    if event.is_cancelled() {
      tracing::info!("interception cancelled by an interceptor");
      return Ok(Attempt::Aborted);
    }
    let fake_policy_request = event.fake_policy_request();
    let endpoint = event.into_endpoint().await?;
    match self.dial(&endpoint, fake_policy_request).await {
      Ok(remote) => Ok(Attempt::Connected(local, remote)),
      Err(e) => {
        tracing::warn!("connecting to {} failed: {}", endpoint, e);
        local.close();
        Ok(Attempt::Retry)
      }
    }
  }

  /// Open the server side of the link.
  ///
  /// Any failure here sends the negotiator back to listening for the next client.
  async fn dial(&self, endpoint: &Endpoint, fake_policy_request: bool) -> Result<Node> {
    if fake_policy_request {
      self.request_policy(endpoint).await?;
    }
    let remote = Node::from_tcp(self.connector.connect(endpoint).await?)?;
    if self.acceptor.is_some() {
      remote
        .upgrade_as_client(&self.connector, endpoint, self.options.web_socket_path())
        .await
    } else {
      Ok(remote)
    }
  }

  /// Replay the policy probe toward the server on a connection of its own.
  async fn request_policy(&self, endpoint: &Endpoint) -> Result<()> {
    let mut stream = self.connector.connect(endpoint).await?;
    stream.write_all(POLICY_REQUEST).await?;
    let mut response = Vec::with_capacity(POLICY_RESPONSE.len());
    let mut buf = [0u8; 512];
    while response.len() < POLICY_RESPONSE_LIMIT {
      let n = stream.read(&mut buf).await?;
      if n == 0 {
        break;
      }
      response.extend_from_slice(&buf[..n]);
      if response.ends_with(b"\0") {
        break;
      }
    }
    tracing::debug!("{} answered the policy probe with {} bytes", endpoint, response.len());
    Ok(())
  }
}

/// Pause after a failed accept. Returns `false` if the token was cancelled meanwhile.
async fn back_off(token: &CancellationToken) -> bool {
  tokio::select! {
    _ = token.cancelled() => false,
    _ = tokio::time::sleep(ACCEPT_BACKOFF) => true,
  }
}

/// Answer the policy probe if the client opened with one.
///
/// Returns `true` when the connection was a probe, or closed before sending anything, and has
/// been dealt with.
async fn answer_policy_probe(stream: &mut TcpStream) -> Result<bool> {
  let mut first = [0u8; 1];
  if stream.peek(&mut first).await? == 0 {
    return Ok(true);
  }
  if first[0] != POLICY_REQUEST[0] {
    return Ok(false);
  }
  let mut request = vec![0u8; POLICY_REQUEST.len()];
  stream.read_exact(&mut request).await?;
  if request != POLICY_REQUEST {
    return Err(Error::protocol(format!(
      "unexpected policy probe: {}",
      request.escape_ascii()
    )));
  }
  stream.write_all(POLICY_RESPONSE).await?;
  stream.flush().await?;
  stream.shutdown().await?;
  tracing::debug!("answered policy probe from {}", stream.peer_addr()?);
  Ok(true)
}
