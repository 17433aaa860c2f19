//! Per-packet interception context
use crate::errors::Result;
use crate::format::Format;
use crate::node::Node;
use crate::packet::{Direction, Packet};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;

/// What the relay loop does with the packet once every interceptor has seen it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Verdict {
  /// send the (possibly modified) packet to the other side
  #[default]
  Forward,
  /// drop the packet
  Block,
  /// an interceptor took over delivery through a [`Relayer`]
  Relay,
}

/// Sender toward the destination of an exchange, handed out by [`Exchange::relay`].
#[derive(Clone)]
pub struct Relayer {
  node: Arc<Node>,
  format: Arc<dyn Format>,
}

impl Relayer {
  pub(crate) fn new(node: Arc<Node>, format: Arc<dyn Format>) -> Self {
    Self { node, format }
  }
  /// Frame `packet` with the direction's format and send it to the destination.
  pub async fn send(&self, packet: &Packet) -> Result<()> {
    self.node.send_packet(self.format.as_ref(), packet).await
  }
  /// Send bytes to the destination unframed.
  pub async fn send_bytes(&self, data: &[u8]) -> Result<()> {
    self.node.send_bytes(data).await
  }
}

impl fmt::Debug for Relayer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Relayer")
      .field("peer_addr", &self.node.peer_addr())
      .field("format", &self.format)
      .finish()
  }
}

/// Handle that lets the relay loop receive the next outgoing packet.
///
/// Calling [`resume`](Continuation::resume) or dropping the handle both release the loop.
#[derive(Debug)]
pub struct Continuation {
  tx: oneshot::Sender<()>,
}

impl Continuation {
  /// Let the loop continue.
  pub fn resume(self) {
    let _ = self.tx.send(());
  }
}

/// One intercepted packet.
///
/// The exchange is created fresh for every received packet and handed to each interceptor in
/// registration order. Interceptors can edit the packet, [`block`](Exchange::block) it, take
/// over delivery with [`relay`](Exchange::relay), or gate the next outgoing receive with
/// [`defer`](Exchange::defer) and [`hold`](Exchange::hold).
pub struct Exchange {
  packet: Packet,
  sequence: u64,
  direction: Direction,
  verdict: Verdict,
  waits: Vec<BoxFuture<'static, ()>>,
  relayer: Relayer,
}

impl Exchange {
  pub(crate) fn new(packet: Packet, sequence: u64, direction: Direction, relayer: Relayer) -> Self {
    Self {
      packet,
      sequence,
      direction,
      verdict: Verdict::Forward,
      waits: Vec::new(),
      relayer,
    }
  }
  /// The packet as it will be forwarded
  pub fn packet(&self) -> &Packet {
    &self.packet
  }
  /// Mutable access to the packet
  pub fn packet_mut(&mut self) -> &mut Packet {
    &mut self.packet
  }
  /// Swap the packet for another one, returning the previous packet.
  pub fn replace_packet(&mut self, packet: Packet) -> Packet {
    std::mem::replace(&mut self.packet, packet)
  }
  /// Position of the packet in its direction, starting at 1 for every connected session.
  pub fn sequence(&self) -> u64 {
    self.sequence
  }
  /// Which way the packet travels
  pub fn direction(&self) -> Direction {
    self.direction
  }
  /// Current verdict
  pub fn verdict(&self) -> Verdict {
    self.verdict
  }
  /// Whether an interceptor blocked the packet
  pub fn is_blocked(&self) -> bool {
    self.verdict == Verdict::Block
  }
  /// Drop the packet instead of forwarding it.
  pub fn block(&mut self) {
    self.verdict = Verdict::Block;
  }
  /// Put the verdict back to [`Verdict::Forward`].
  pub fn forward(&mut self) {
    self.verdict = Verdict::Forward;
  }
  /// Take over delivery of this packet.
  ///
  /// The engine will not forward it; the returned [`Relayer`] sends to the same destination,
  /// now or from a spawned task.
  pub fn relay(&mut self) -> Relayer {
    self.verdict = Verdict::Relay;
    self.relayer.clone()
  }
  /// Whether the next receive in this direction waits on a deferred future.
  pub fn is_deferred(&self) -> bool {
    !self.waits.is_empty()
  }
  /// Make the outgoing loop await `wait` before it receives the next packet.
  ///
  /// Only this direction is gated; incoming traffic keeps flowing. Incoming exchanges never
  /// wait and return `false`.
  pub fn defer<F>(&mut self, wait: F) -> bool
  where
    F: Future<Output = ()> + Send + 'static,
  {
    if !self.direction.is_outgoing() {
      return false;
    }
    self.waits.push(wait.boxed());
    true
  }
  /// Hold the outgoing loop until the returned handle is resumed or dropped.
  ///
  /// Returns `None` on incoming exchanges.
  pub fn hold(&mut self) -> Option<Continuation> {
    let (tx, rx) = oneshot::channel::<()>();
    self
      .defer(async move {
        let _ = rx.await;
      })
      .then_some(Continuation { tx })
  }

  pub(crate) fn into_parts(self) -> (Packet, Verdict, Vec<BoxFuture<'static, ()>>) {
    (self.packet, self.verdict, self.waits)
  }
}

impl fmt::Debug for Exchange {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Exchange")
      .field("direction", &self.direction)
      .field("sequence", &self.sequence)
      .field("verdict", &self.verdict)
      .field("deferred", &self.is_deferred())
      .field("packet", &self.packet)
      .finish()
  }
}
