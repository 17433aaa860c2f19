//! Integration tests for slinger-relay

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use slinger_relay::rustls;
use slinger_relay::rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use slinger_relay::tls::{Certificate, Identity};
use slinger_relay::{
  CancellationToken, ConnectedEvent, Continuation, Direction, Endpoint, EndpointSender, Error,
  Exchange, Format, Formats, InterceptOptions, InterceptOptionsBuilder, Interceptor,
  LengthPrefixed, Packet, Result, Session, SessionState, POLICY_REQUEST, POLICY_RESPONSE,
};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

async fn within<F: Future>(future: F) -> F::Output {
  tokio::time::timeout(Duration::from_secs(10), future)
    .await
    .expect("timed out")
}

fn free_port() -> u16 {
  std::net::TcpListener::bind("127.0.0.1:0")
    .unwrap()
    .local_addr()
    .unwrap()
    .port()
}

fn frame(payload: &[u8]) -> Vec<u8> {
  let mut buf = BytesMut::new();
  LengthPrefixed::u32()
    .encode(&Packet::with_id(1, payload), &mut buf)
    .unwrap();
  buf.to_vec()
}

async fn read_frame(stream: &mut TcpStream) -> Packet {
  let mut len = [0u8; 4];
  within(stream.read_exact(&mut len)).await.unwrap();
  let mut body = vec![0u8; u32::from_be_bytes(len) as usize];
  within(stream.read_exact(&mut body)).await.unwrap();
  Packet::new(body)
}

async fn assert_closed(stream: &mut TcpStream) {
  let mut buf = [0u8; 16];
  let read = within(stream.read(&mut buf)).await;
  assert!(matches!(read, Ok(0) | Err(_)), "stream still open: {:?}", read);
}

#[derive(Default)]
struct Recorder {
  connected: AtomicUsize,
  disconnected: AtomicUsize,
  packets: Mutex<Vec<(Direction, u64, Vec<u8>)>>,
}

impl Recorder {
  fn sequences(&self, direction: Direction) -> Vec<u64> {
    self
      .packets
      .lock()
      .iter()
      .filter(|(d, _, _)| *d == direction)
      .map(|(_, sequence, _)| *sequence)
      .collect()
  }
}

impl Interceptor for Recorder {
  fn on_connected(&self, _event: &mut ConnectedEvent) -> Result<()> {
    self.connected.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }
  fn on_disconnected(&self) -> Result<()> {
    self.disconnected.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }
  fn on_outgoing(&self, exchange: &mut Exchange) -> Result<()> {
    self.record(exchange);
    Ok(())
  }
  fn on_incoming(&self, exchange: &mut Exchange) -> Result<()> {
    self.record(exchange);
    Ok(())
  }
}

impl Recorder {
  fn record(&self, exchange: &Exchange) {
    self.packets.lock().push((
      exchange.direction(),
      exchange.sequence(),
      exchange.packet().payload().to_vec(),
    ));
  }
}

struct Proxy {
  session: Arc<Session>,
  recorder: Arc<Recorder>,
  port: u16,
  server: TcpListener,
  cancel: CancellationToken,
  task: JoinHandle<Result<()>>,
}

impl Proxy {
  async fn start(endpoint: bool, configure: impl FnOnce(&Session)) -> Proxy {
    Self::start_with(endpoint, |builder| builder, configure).await
  }

  async fn start_with(
    endpoint: bool,
    options: impl FnOnce(InterceptOptionsBuilder) -> InterceptOptionsBuilder,
    configure: impl FnOnce(&Session),
  ) -> Proxy {
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = Endpoint::from(server.local_addr().unwrap());
    let port = free_port();
    let options = options(InterceptOptions::builder().listen_port(port))
      .build()
      .unwrap();
    let session = Arc::new(Session::new(Formats::flash()));
    let recorder = Arc::new(Recorder::default());
    session.add_interceptor(recorder.clone());
    configure(&session);
    let cancel = CancellationToken::new();
    let task = {
      let session = session.clone();
      let cancel = cancel.clone();
      let target = endpoint.then_some(target);
      tokio::spawn(async move { session.intercept(target, &options, cancel).await })
    };
    Proxy {
      session,
      recorder,
      port,
      server,
      cancel,
      task,
    }
  }

  async fn client(&self) -> TcpStream {
    for _ in 0..200 {
      if let Ok(stream) = TcpStream::connect(("127.0.0.1", self.port)).await {
        return stream;
      }
      tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("proxy never listened on {}", self.port);
  }

  async fn server(&self) -> TcpStream {
    within(self.server.accept()).await.unwrap().0
  }

  /// Connect a client, send `hello` and return both legs once the server got it.
  async fn connect(&self, hello: &[u8]) -> (TcpStream, TcpStream) {
    let mut client = self.client().await;
    client.write_all(&frame(hello)).await.unwrap();
    let mut server = self.server().await;
    assert_eq!(read_frame(&mut server).await.payload(), hello);
    (client, server)
  }

  async fn finish(self) -> Result<()> {
    within(self.task).await.unwrap()
  }
}

#[tokio::test]
async fn packets_are_relayed_in_order() {
  let proxy = Proxy::start(true, |_| {}).await;
  let mut client = proxy.client().await;
  for i in 0..20u8 {
    client.write_all(&frame(&[b'c', i])).await.unwrap();
  }
  let mut server = proxy.server().await;
  for i in 0..20u8 {
    assert_eq!(read_frame(&mut server).await.payload(), &[b'c', i]);
  }
  for i in 0..5u8 {
    server.write_all(&frame(&[b's', i])).await.unwrap();
  }
  for i in 0..5u8 {
    assert_eq!(read_frame(&mut client).await.payload(), &[b's', i]);
  }
  assert!(proxy.session.is_connected());
  assert_eq!(
    proxy.recorder.sequences(Direction::Outgoing),
    (1..=20).collect::<Vec<u64>>()
  );
  assert_eq!(
    proxy.recorder.sequences(Direction::Incoming),
    (1..=5).collect::<Vec<u64>>()
  );
  assert_eq!(proxy.recorder.connected.load(Ordering::SeqCst), 1);
  proxy.cancel.cancel();
  proxy.finish().await.unwrap();
}

struct BlockPings;

impl Interceptor for BlockPings {
  fn on_outgoing(&self, exchange: &mut Exchange) -> Result<()> {
    if exchange.packet().payload() == b"PING" {
      exchange.block();
    }
    Ok(())
  }
}

#[tokio::test]
async fn blocked_packet_is_not_forwarded() {
  let proxy = Proxy::start(true, |session| session.add_interceptor(Arc::new(BlockPings))).await;
  let mut client = proxy.client().await;
  client.write_all(&frame(b"PING")).await.unwrap();
  client.write_all(&frame(b"PONG")).await.unwrap();
  let mut server = proxy.server().await;
  assert_eq!(read_frame(&mut server).await.payload(), b"PONG");
  assert_eq!(proxy.recorder.sequences(Direction::Outgoing), vec![1, 2]);
  proxy.session.disconnect().unwrap();
  proxy.finish().await.unwrap();
}

struct Swap;

impl Interceptor for Swap {
  fn on_outgoing(&self, exchange: &mut Exchange) -> Result<()> {
    if exchange.packet().payload() == b"SWAP" {
      let relayer = exchange.relay();
      let packet = Packet::with_id(1, b"SWAPPED");
      exchange.defer(async move {
        relayer.send(&packet).await.unwrap();
      });
    }
    Ok(())
  }
}

#[tokio::test]
async fn relayed_packet_is_delivered_once() {
  let proxy = Proxy::start(true, |session| session.add_interceptor(Arc::new(Swap))).await;
  let mut client = proxy.client().await;
  client.write_all(&frame(b"SWAP")).await.unwrap();
  client.write_all(&frame(b"AFTER")).await.unwrap();
  let mut server = proxy.server().await;
  assert_eq!(read_frame(&mut server).await.payload(), b"SWAPPED");
  assert_eq!(read_frame(&mut server).await.payload(), b"AFTER");
  proxy.cancel.cancel();
  proxy.finish().await.unwrap();
}

#[derive(Default)]
struct Hold {
  held: Mutex<Option<Continuation>>,
}

impl Interceptor for Hold {
  fn on_outgoing(&self, exchange: &mut Exchange) -> Result<()> {
    if exchange.packet().payload() == b"HOLD" {
      *self.held.lock() = exchange.hold();
    }
    Ok(())
  }
  fn on_incoming(&self, exchange: &mut Exchange) -> Result<()> {
    assert!(exchange.hold().is_none());
    Ok(())
  }
}

#[tokio::test]
async fn held_outgoing_does_not_stall_incoming() {
  let hold = Arc::new(Hold::default());
  let proxy = Proxy::start(true, |session| session.add_interceptor(hold.clone())).await;
  let (mut client, mut server) = proxy.connect(b"HOLD").await;
  client.write_all(&frame(b"NEXT")).await.unwrap();

  server.write_all(&frame(b"WELCOME")).await.unwrap();
  assert_eq!(read_frame(&mut client).await.payload(), b"WELCOME");

  let mut len = [0u8; 4];
  let early = tokio::time::timeout(Duration::from_millis(200), server.read_exact(&mut len)).await;
  assert!(early.is_err(), "outgoing packet forwarded while held");

  hold.held.lock().take().unwrap().resume();
  assert_eq!(read_frame(&mut server).await.payload(), b"NEXT");
  proxy.cancel.cancel();
  proxy.finish().await.unwrap();
}

#[tokio::test]
async fn concurrent_disconnect_raises_one_event() {
  let proxy = Proxy::start(true, |_| {}).await;
  let (mut client, mut server) = proxy.connect(b"HELLO").await;
  std::thread::scope(|scope| {
    for _ in 0..2 {
      scope.spawn(|| proxy.session.disconnect().unwrap());
    }
  });
  proxy.session.disconnect().unwrap();
  assert_closed(&mut client).await;
  assert_closed(&mut server).await;
  let recorder = proxy.recorder.clone();
  let session = proxy.session.clone();
  proxy.finish().await.unwrap();
  assert_eq!(recorder.disconnected.load(Ordering::SeqCst), 1);
  assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn remote_close_ends_the_session_once() {
  let proxy = Proxy::start(true, |_| {}).await;
  let (mut client, server) = proxy.connect(b"HELLO").await;
  drop(server);
  assert_closed(&mut client).await;
  let recorder = proxy.recorder.clone();
  proxy.finish().await.unwrap();
  assert_eq!(recorder.disconnected.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn listen_skip_discards_leading_connections() {
  let proxy = Proxy::start_with(true, |builder| builder.listen_skip_amount(2), |_| {}).await;
  let mut first = proxy.client().await;
  let mut second = proxy.client().await;
  assert_closed(&mut first).await;
  assert_closed(&mut second).await;
  assert_eq!(proxy.recorder.connected.load(Ordering::SeqCst), 0);
  let (_client, _server) = proxy.connect(b"THIRD").await;
  assert_eq!(proxy.recorder.connected.load(Ordering::SeqCst), 1);
  proxy.cancel.cancel();
  proxy.finish().await.unwrap();
}

#[tokio::test]
async fn web_sockets_require_a_certificate() {
  let built = InterceptOptions::builder().use_web_sockets(true).build();
  assert!(matches!(built, Err(Error::Configuration(_))));
}

#[tokio::test]
async fn cancel_while_listening() {
  let proxy = Proxy::start(true, |_| {}).await;
  // wait for the listener before cancelling
  drop(proxy.client().await);
  proxy.cancel.cancel();
  let recorder = proxy.recorder.clone();
  let session = proxy.session.clone();
  proxy.finish().await.unwrap();
  assert_eq!(session.state(), SessionState::Disconnected);
  assert_eq!(recorder.disconnected.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn policy_probe_is_answered_then_listening_resumes() {
  let proxy = Proxy::start(true, |_| {}).await;
  let mut probe = proxy.client().await;
  probe.write_all(POLICY_REQUEST).await.unwrap();
  let mut response = Vec::new();
  within(probe.read_to_end(&mut response)).await.unwrap();
  assert_eq!(response, POLICY_RESPONSE);
  assert_eq!(proxy.recorder.connected.load(Ordering::SeqCst), 0);
  let (_client, _server) = proxy.connect(b"HELLO").await;
  proxy.cancel.cancel();
  proxy.finish().await.unwrap();
}

#[tokio::test]
async fn bogus_policy_probe_is_a_protocol_error() {
  let proxy = Proxy::start(true, |_| {}).await;
  let mut probe = proxy.client().await;
  probe.write_all(b"<cross-domain-request/>\0").await.unwrap();
  assert!(matches!(proxy.finish().await, Err(Error::Protocol(_))));
}

struct Redirect(Endpoint);

impl Interceptor for Redirect {
  fn on_connected(&self, event: &mut ConnectedEvent) -> Result<()> {
    assert!(event.endpoint().is_none());
    event.set_endpoint(self.0.clone());
    Ok(())
  }
}

#[tokio::test]
async fn interceptor_supplies_the_endpoint() {
  let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let target = Endpoint::from(server.local_addr().unwrap());
  let proxy = Proxy::start(false, |session| {
    session.add_interceptor(Arc::new(Redirect(target)))
  })
  .await;
  let mut client = proxy.client().await;
  client.write_all(&frame(b"HELLO")).await.unwrap();
  let (mut redirected, _) = within(server.accept()).await.unwrap();
  assert_eq!(read_frame(&mut redirected).await.payload(), b"HELLO");
  proxy.cancel.cancel();
  proxy.finish().await.unwrap();
}

#[derive(Default)]
struct Deferred {
  sender: Mutex<Option<EndpointSender>>,
}

impl Interceptor for Deferred {
  fn on_connected(&self, event: &mut ConnectedEvent) -> Result<()> {
    *self.sender.lock() = Some(event.defer_endpoint());
    Ok(())
  }
}

#[tokio::test]
async fn endpoint_can_be_supplied_later() {
  let deferred = Arc::new(Deferred::default());
  let proxy = Proxy::start(false, |session| session.add_interceptor(deferred.clone())).await;
  let mut client = proxy.client().await;
  client.write_all(&frame(b"HELLO")).await.unwrap();
  let sender = within(async {
    loop {
      if let Some(sender) = deferred.sender.lock().take() {
        return sender;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
  })
  .await;
  assert_eq!(proxy.session.state(), SessionState::Negotiating);
  assert!(sender.send(Endpoint::from(proxy.server.local_addr().unwrap())));
  let mut server = proxy.server().await;
  assert_eq!(read_frame(&mut server).await.payload(), b"HELLO");
  proxy.cancel.cancel();
  proxy.finish().await.unwrap();
}

#[tokio::test]
async fn missing_endpoint_is_a_configuration_error() {
  let proxy = Proxy::start(false, |_| {}).await;
  let mut client = proxy.client().await;
  client.write_all(&frame(b"HELLO")).await.unwrap();
  assert!(matches!(proxy.finish().await, Err(Error::Configuration(_))));
}

struct CancelOnConnect;

impl Interceptor for CancelOnConnect {
  fn on_connected(&self, event: &mut ConnectedEvent) -> Result<()> {
    event.cancel();
    Ok(())
  }
}

#[tokio::test]
async fn connected_event_can_cancel() {
  let proxy = Proxy::start(true, |session| {
    session.add_interceptor(Arc::new(CancelOnConnect))
  })
  .await;
  let mut client = proxy.client().await;
  client.write_all(&frame(b"HELLO")).await.unwrap();
  let recorder = proxy.recorder.clone();
  proxy.finish().await.unwrap();
  assert_closed(&mut client).await;
  assert_eq!(recorder.disconnected.load(Ordering::SeqCst), 0);
}

struct Faulty;

impl Interceptor for Faulty {
  fn on_incoming(&self, _exchange: &mut Exchange) -> Result<()> {
    Err(Error::interceptor("cannot parse incoming packet"))
  }
}

#[tokio::test]
async fn interceptor_errors_surface_from_intercept() {
  let proxy = Proxy::start(true, |session| session.add_interceptor(Arc::new(Faulty))).await;
  let (mut client, mut server) = proxy.connect(b"HELLO").await;
  server.write_all(&frame(b"WELCOME")).await.unwrap();
  assert_closed(&mut client).await;
  let recorder = proxy.recorder.clone();
  assert!(matches!(proxy.finish().await, Err(Error::Interceptor(_))));
  assert_eq!(recorder.disconnected.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn packets_can_be_injected_both_ways() {
  let proxy = Proxy::start(true, |_| {}).await;
  let (mut client, mut server) = proxy.connect(b"HELLO").await;
  proxy
    .session
    .send_to_client(&Packet::with_id(1, b"TO CLIENT"))
    .await
    .unwrap();
  proxy
    .session
    .send_to_server(&Packet::with_id(1, b"TO SERVER"))
    .await
    .unwrap();
  assert_eq!(read_frame(&mut client).await.payload(), b"TO CLIENT");
  assert_eq!(read_frame(&mut server).await.payload(), b"TO SERVER");
  // injected packets are not intercepted
  assert_eq!(proxy.recorder.sequences(Direction::Incoming), Vec::<u64>::new());
  proxy.cancel.cancel();
  proxy.finish().await.unwrap();
}

struct MimicPolicy;

impl Interceptor for MimicPolicy {
  fn on_connected(&self, event: &mut ConnectedEvent) -> Result<()> {
    event.set_fake_policy_request(true);
    Ok(())
  }
}

#[tokio::test]
async fn policy_request_is_replayed_to_the_server() {
  let proxy = Proxy::start(true, |session| session.add_interceptor(Arc::new(MimicPolicy))).await;
  let mut client = proxy.client().await;
  client.write_all(&frame(b"HELLO")).await.unwrap();

  let mut probe = proxy.server().await;
  let mut request = vec![0u8; POLICY_REQUEST.len()];
  within(probe.read_exact(&mut request)).await.unwrap();
  assert_eq!(request, POLICY_REQUEST);
  probe.write_all(POLICY_RESPONSE).await.unwrap();

  let mut server = proxy.server().await;
  assert_eq!(read_frame(&mut server).await.payload(), b"HELLO");
  proxy.cancel.cancel();
  proxy.finish().await.unwrap();
}

#[tokio::test]
async fn new_intercept_tears_down_the_previous_one() {
  let proxy = Proxy::start(true, |_| {}).await;
  let (mut client, mut server) = proxy.connect(b"HELLO").await;
  let options = InterceptOptions::builder()
    .listen_port(free_port())
    .build()
    .unwrap();
  let second = {
    let session = proxy.session.clone();
    tokio::spawn(async move {
      session
        .intercept(None, &options, CancellationToken::new())
        .await
    })
  };
  assert_closed(&mut client).await;
  assert_closed(&mut server).await;
  let recorder = proxy.recorder.clone();
  let session = proxy.session.clone();
  proxy.finish().await.unwrap();
  assert_eq!(recorder.disconnected.load(Ordering::SeqCst), 1);
  wait_for_state(&session, SessionState::Listening).await;
  session.disconnect().unwrap();
  within(second).await.unwrap().unwrap();
}

type WebSocketClient =
  tokio_tungstenite::WebSocketStream<tokio_rustls::client::TlsStream<TcpStream>>;

/// Self-signed `127.0.0.1` certificate with client and server configs trusting it.
struct TestTls {
  identity: Identity,
  root: Certificate,
  client: Arc<rustls::ClientConfig>,
  server: Arc<rustls::ServerConfig>,
}

impl TestTls {
  fn generate() -> TestTls {
    let certified = rcgen::generate_simple_self_signed(vec!["127.0.0.1".to_string()]).unwrap();
    let cert_pem = certified.cert.pem();
    let key_pem = certified.key_pair.serialize_pem();
    let identity = Identity::from_pem(format!("{}{}", cert_pem, key_pem).as_bytes()).unwrap();
    let root = Certificate::from_der(certified.cert.der()).unwrap();
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let mut roots = rustls::RootCertStore::empty();
    roots.add(certified.cert.der().clone()).unwrap();
    let client = rustls::ClientConfig::builder_with_provider(provider.clone())
      .with_safe_default_protocol_versions()
      .unwrap()
      .with_root_certificates(roots)
      .with_no_client_auth();
    let server = rustls::ServerConfig::builder_with_provider(provider)
      .with_safe_default_protocol_versions()
      .unwrap()
      .with_no_client_auth()
      .with_single_cert(
        vec![certified.cert.der().clone()],
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der())),
      )
      .unwrap();
    TestTls {
      identity,
      root,
      client: Arc::new(client),
      server: Arc::new(server),
    }
  }

  /// Start a web socket proxy and keep the configs for both ends.
  async fn start_proxy(self) -> (Proxy, Arc<rustls::ClientConfig>, tokio_rustls::TlsAcceptor) {
    let TestTls {
      identity,
      root,
      client,
      server,
    } = self;
    let proxy = Proxy::start_with(
      true,
      |builder| {
        builder
          .use_web_sockets(true)
          .certificate(identity)
          .root_certificates(vec![root])
      },
      |_| {},
    )
    .await;
    (proxy, client, tokio_rustls::TlsAcceptor::from(server))
  }
}

async fn web_socket_client(proxy: &Proxy, config: Arc<rustls::ClientConfig>) -> WebSocketClient {
  let tcp = proxy.client().await;
  let tls = tokio_rustls::TlsConnector::from(config)
    .connect(ServerName::try_from("127.0.0.1".to_string()).unwrap(), tcp)
    .await
    .unwrap();
  let (client, _) = tokio_tungstenite::client_async(
    format!("wss://127.0.0.1:{}/websocket", proxy.port),
    tls,
  )
  .await
  .unwrap();
  client
}

async fn wait_for_state(session: &Session, state: SessionState) {
  within(async {
    while session.state() != state {
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
  })
  .await;
}

#[tokio::test]
async fn web_socket_session_relays_binary_frames() {
  let (proxy, client_config, acceptor) = TestTls::generate().start_proxy().await;

  let client_handshake = web_socket_client(&proxy, client_config);
  let server_handshake = async {
    let tcp = proxy.server().await;
    let tls = acceptor.accept(tcp).await.unwrap();
    tokio_tungstenite::accept_async(tls).await.unwrap()
  };
  let (mut client, mut server) =
    within(async { tokio::join!(client_handshake, server_handshake) }).await;

  client.send(Message::binary(frame(b"HELLO"))).await.unwrap();
  match within(server.next()).await {
    Some(Ok(Message::Binary(data))) => assert_eq!(&data[..], &frame(b"HELLO")[..]),
    other => panic!("unexpected message {:?}", other),
  }
  server.send(Message::binary(frame(b"WELCOME"))).await.unwrap();
  match within(client.next()).await {
    Some(Ok(Message::Binary(data))) => assert_eq!(&data[..], &frame(b"WELCOME")[..]),
    other => panic!("unexpected message {:?}", other),
  }
  assert!(proxy.session.is_connected());
  proxy.cancel.cancel();
  proxy.finish().await.unwrap();
}

/// Points the first client at `unreachable` and leaves the rest alone.
struct UnreachableFirst {
  unreachable: Endpoint,
  attempts: AtomicUsize,
}

impl Interceptor for UnreachableFirst {
  fn on_connected(&self, event: &mut ConnectedEvent) -> Result<()> {
    if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
      event.set_endpoint(self.unreachable.clone());
    }
    Ok(())
  }
}

#[tokio::test]
async fn refused_dial_returns_to_listening() {
  let unreachable = Endpoint::from(std::net::SocketAddr::from(([127, 0, 0, 1], free_port())));
  let redirect = Arc::new(UnreachableFirst {
    unreachable,
    attempts: AtomicUsize::new(0),
  });
  let proxy = Proxy::start(true, |session| session.add_interceptor(redirect.clone())).await;

  let mut first = proxy.client().await;
  first.write_all(&frame(b"LOST")).await.unwrap();
  assert_closed(&mut first).await;
  wait_for_state(&proxy.session, SessionState::Listening).await;
  assert!(!proxy.task.is_finished());
  assert_eq!(proxy.recorder.disconnected.load(Ordering::SeqCst), 0);

  let (mut client, mut server) = proxy.connect(b"HELLO").await;
  server.write_all(&frame(b"WELCOME")).await.unwrap();
  assert_eq!(read_frame(&mut client).await.payload(), b"WELCOME");
  assert!(proxy.session.is_connected());
  assert_eq!(redirect.attempts.load(Ordering::SeqCst), 2);
  assert_eq!(proxy.recorder.connected.load(Ordering::SeqCst), 2);
  proxy.cancel.cancel();
  let recorder = proxy.recorder.clone();
  proxy.finish().await.unwrap();
  assert_eq!(recorder.disconnected.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn rejected_upgrade_returns_to_listening() {
  let (proxy, client_config, acceptor) = TestTls::generate().start_proxy().await;

  let mut first = within(web_socket_client(&proxy, client_config.clone())).await;
  let rejected = within(async {
    let tcp = proxy.server().await;
    let mut tls = acceptor.accept(tcp).await.unwrap();
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
      let n = tls.read(&mut buf).await.unwrap();
      assert_ne!(n, 0, "upgrade request cut short");
      request.extend_from_slice(&buf[..n]);
    }
    assert!(request.starts_with(b"GET /websocket "));
    tls
      .write_all(b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n")
      .await
      .unwrap();
    tls.flush().await.unwrap();
    tls
  })
  .await;
  match within(first.next()).await {
    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => {}
    other => panic!("first client still open: {:?}", other),
  }
  drop(rejected);
  wait_for_state(&proxy.session, SessionState::Listening).await;
  assert!(!proxy.task.is_finished());

  let client_handshake = web_socket_client(&proxy, client_config);
  let server_handshake = async {
    let tcp = proxy.server().await;
    let tls = acceptor.accept(tcp).await.unwrap();
    tokio_tungstenite::accept_async(tls).await.unwrap()
  };
  let (mut client, mut server) =
    within(async { tokio::join!(client_handshake, server_handshake) }).await;
  client.send(Message::binary(frame(b"HELLO"))).await.unwrap();
  match within(server.next()).await {
    Some(Ok(Message::Binary(data))) => assert_eq!(&data[..], &frame(b"HELLO")[..]),
    other => panic!("unexpected message {:?}", other),
  }
  assert!(proxy.session.is_connected());
  assert_eq!(proxy.recorder.connected.load(Ordering::SeqCst), 2);
  proxy.cancel.cancel();
  proxy.finish().await.unwrap();
}
