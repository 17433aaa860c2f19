//! Packet framing
//!
//! A [`Format`] cuts packets out of a node's byte stream and writes them back. The relay picks
//! one format per direction through [`Formats`].
use crate::errors::{Error, Result};
use crate::game::GameKind;
use crate::packet::Packet;
use bytes::{Buf, BufMut, BytesMut};
use std::fmt;
use std::sync::Arc;

/// Encodes and decodes packets on a byte stream.
pub trait Format: fmt::Debug + Send + Sync {
  /// Split one packet off the front of `src`.
  ///
  /// Returns `Ok(None)` while `src` does not hold a whole frame yet.
  fn decode(&self, src: &mut BytesMut) -> Result<Option<Packet>>;
  /// Append the framed `packet` to `dst`.
  fn encode(&self, packet: &Packet, dst: &mut BytesMut) -> Result<()>;
}

/// Width of a length prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LengthPrefix {
  /// big-endian `u16`
  U16,
  /// big-endian `u32`
  U32,
}

impl LengthPrefix {
  fn width(self) -> usize {
    match self {
      LengthPrefix::U16 => 2,
      LengthPrefix::U32 => 4,
    }
  }
  fn max(self) -> usize {
    match self {
      LengthPrefix::U16 => u16::MAX as usize,
      LengthPrefix::U32 => u32::MAX as usize,
    }
  }
}

/// Frames made of a big-endian length prefix followed by that many body bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LengthPrefixed {
  prefix: LengthPrefix,
  max_body_len: usize,
}

impl LengthPrefixed {
  /// Largest body accepted by a `u32` prefixed format unless configured otherwise.
  pub const DEFAULT_MAX_BODY_LEN: usize = 8 * 1024 * 1024;

  /// `u16` length prefix.
  pub const fn u16() -> Self {
    Self {
      prefix: LengthPrefix::U16,
      max_body_len: u16::MAX as usize,
    }
  }
  /// `u32` length prefix.
  pub const fn u32() -> Self {
    Self {
      prefix: LengthPrefix::U32,
      max_body_len: Self::DEFAULT_MAX_BODY_LEN,
    }
  }
  /// Limit the body length accepted in either direction.
  ///
  /// The limit never exceeds what the prefix can express.
  pub fn max_body_len(mut self, value: usize) -> Self {
    self.max_body_len = value.min(self.prefix.max());
    self
  }
  /// Width of the prefix
  pub fn prefix(&self) -> LengthPrefix {
    self.prefix
  }
}

impl Format for LengthPrefixed {
  fn decode(&self, src: &mut BytesMut) -> Result<Option<Packet>> {
    let width = self.prefix.width();
    if src.len() < width {
      return Ok(None);
    }
    let len = match self.prefix {
      LengthPrefix::U16 => u16::from_be_bytes([src[0], src[1]]) as usize,
      LengthPrefix::U32 => u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize,
    };
    if len > self.max_body_len {
      return Err(Error::protocol(format!(
        "frame of {} bytes exceeds the {} byte limit",
        len, self.max_body_len
      )));
    }
    if src.len() < width + len {
      src.reserve(width + len - src.len());
      return Ok(None);
    }
    src.advance(width);
    Ok(Some(Packet::new(src.split_to(len).freeze())))
  }

  fn encode(&self, packet: &Packet, dst: &mut BytesMut) -> Result<()> {
    let len = packet.len();
    if len > self.max_body_len {
      return Err(Error::protocol(format!(
        "packet of {} bytes exceeds the {} byte limit",
        len, self.max_body_len
      )));
    }
    dst.reserve(self.prefix.width() + len);
    match self.prefix {
      LengthPrefix::U16 => dst.put_u16(len as u16),
      LengthPrefix::U32 => dst.put_u32(len as u32),
    }
    dst.put_slice(packet.body());
    Ok(())
  }
}

/// The format pair of a session.
///
/// `send` frames what the game client sends (outgoing traffic), `receive` frames what it
/// receives (incoming traffic).
#[derive(Clone, Debug)]
pub struct Formats {
  /// client to server framing
  pub send: Arc<dyn Format>,
  /// server to client framing
  pub receive: Arc<dyn Format>,
}

impl Formats {
  /// Use independent formats per direction.
  pub fn new(send: impl Format + 'static, receive: impl Format + 'static) -> Self {
    Self {
      send: Arc::new(send),
      receive: Arc::new(receive),
    }
  }
  /// `u32` prefixed frames both ways.
  pub fn flash() -> Self {
    Self::new(LengthPrefixed::u32(), LengthPrefixed::u32())
  }
  /// `u16` prefixed frames outgoing, `u32` prefixed frames incoming.
  pub fn unity() -> Self {
    Self::new(LengthPrefixed::u16(), LengthPrefixed::u32())
  }
  /// Default formats of a game kind.
  pub fn for_game(kind: GameKind) -> Self {
    match kind {
      GameKind::Flash => Self::flash(),
      GameKind::Unity => Self::unity(),
    }
  }
  /// The format framing traffic in `direction`.
  pub fn for_direction(&self, direction: crate::Direction) -> &Arc<dyn Format> {
    match direction {
      crate::Direction::Outgoing => &self.send,
      crate::Direction::Incoming => &self.receive,
    }
  }
}

impl Default for Formats {
  fn default() -> Self {
    Self::flash()
  }
}
