use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Which way a packet travels through the relay.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Direction {
  /// game client to server
  Outgoing,
  /// server to game client
  Incoming,
}

impl Direction {
  /// Whether this is the client to server direction.
  pub fn is_outgoing(self) -> bool {
    matches!(self, Direction::Outgoing)
  }
}

impl fmt::Display for Direction {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Direction::Outgoing => f.write_str("outgoing"),
      Direction::Incoming => f.write_str("incoming"),
    }
  }
}

/// One framed unit of game traffic.
///
/// The body is kept opaque: it is whatever the [`Format`](crate::Format) produced between two
/// length prefixes. Game protocols put a big-endian `u16` header first, exposed through
/// [`Packet::id`] for handlers.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Packet {
  body: Bytes,
}

impl Packet {
  /// Wrap a frame body.
  pub fn new(body: impl Into<Bytes>) -> Self {
    Self { body: body.into() }
  }
  /// Build a body from a `u16` header followed by `payload`.
  pub fn with_id(id: u16, payload: &[u8]) -> Self {
    let mut body = BytesMut::with_capacity(2 + payload.len());
    body.put_u16(id);
    body.put_slice(payload);
    Self {
      body: body.freeze(),
    }
  }
  /// The leading `u16` header, if the body has one.
  pub fn id(&self) -> Option<u16> {
    match self.body.as_ref() {
      [hi, lo, ..] => Some(u16::from_be_bytes([*hi, *lo])),
      _ => None,
    }
  }
  /// Everything after the header.
  pub fn payload(&self) -> &[u8] {
    self.body.get(2..).unwrap_or_default()
  }
  /// The whole frame body.
  pub fn body(&self) -> &Bytes {
    &self.body
  }
  /// Length of the frame body.
  pub fn len(&self) -> usize {
    self.body.len()
  }
  /// Whether the frame body is empty.
  pub fn is_empty(&self) -> bool {
    self.body.is_empty()
  }
  /// Consume the packet and return its body.
  pub fn into_body(self) -> Bytes {
    self.body
  }
}

impl From<Bytes> for Packet {
  fn from(value: Bytes) -> Self {
    Packet::new(value)
  }
}

impl From<&'static [u8]> for Packet {
  fn from(value: &'static [u8]) -> Self {
    Packet::new(Bytes::from_static(value))
  }
}

impl fmt::Debug for Packet {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Packet")
      .field("id", &self.id())
      .field("len", &self.len())
      .field("body", &self.body.escape_ascii().to_string())
      .finish()
  }
}
