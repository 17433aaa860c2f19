#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # slinger-relay
//!
//! The `slinger-relay` crate is an interception proxy for game clients. It sits between the
//! client and its server, terminates both legs of the connection and shows every packet to
//! registered [`Interceptor`]s before forwarding it.
//!
//! - Raw socket and secure WebSocket clients
//! - Cross-domain policy probe answered and optionally replayed to the server
//! - Packets can be edited, blocked, delivered by the interceptor or held back
//! - Exactly one disconnect notification per connected session
//!
//! ## Intercepting a session
//!
//! A [`Session`] listens for the game client, dials the server once the client is accepted and
//! relays until either side closes.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use slinger_relay::{
//!   CancellationToken, Endpoint, Formats, InterceptOptions, LoggingInterceptor, Session,
//! };
//!
//! # async fn run() -> slinger_relay::Result<()> {
//! let session = Session::new(Formats::flash());
//! session.add_interceptor(Arc::new(LoggingInterceptor::new()));
//! let options = InterceptOptions::builder().listen_port(9567).build()?;
//! let endpoint = Endpoint::parse("game.example.com:30000")?;
//! session
//!   .intercept(Some(endpoint), &options, CancellationToken::new())
//!   .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Handling packets
//!
//! Interceptors receive an [`Exchange`] per packet and decide what happens to it.
//!
//! ```rust
//! use slinger_relay::{Exchange, Interceptor, Result};
//!
//! struct DropPings;
//!
//! impl Interceptor for DropPings {
//!   fn on_outgoing(&self, exchange: &mut Exchange) -> Result<()> {
//!     if exchange.packet().payload() == b"PING" {
//!       exchange.block();
//!     }
//!     Ok(())
//!   }
//! }
//! ```
//!
//! An outgoing exchange can also hold the client to server direction until the interceptor is
//! done with it, through [`Exchange::defer`] or [`Exchange::hold`]. Server traffic is never held.
//!
//! ## TLS
//!
//! WebSocket clients are accepted over TLS with the [`tls::Identity`] configured on the
//! [`InterceptOptions`], and the server is dialed over TLS verified against the webpki roots
//! plus any [`tls::Certificate`] added to the options.
//!
//! ## Optional Features
//!
//! - **serde**: Serialization of the value types and `Game::from_json`.
//!
mod connector;
mod endpoint;
mod errors;
mod exchange;
mod format;
mod game;
mod interceptor;
mod negotiator;
mod node;
mod options;
mod packet;
mod relay;
mod session;
mod socket;
/// TLS identities and certificates
pub mod tls;

pub use connector::Connector;
pub use endpoint::Endpoint;
pub use errors::{Error, Result};
pub use exchange::{Continuation, Exchange, Relayer, Verdict};
pub use format::{Format, Formats, LengthPrefix, LengthPrefixed};
pub use game::{Game, GameKind};
pub use interceptor::{
  ConnectedEvent, EndpointSender, Interceptor, InterceptorHandler, LoggingInterceptor,
};
pub use negotiator::{POLICY_REQUEST, POLICY_RESPONSE};
pub use node::Node;
pub use options::{InterceptOptions, InterceptOptionsBuilder, DEFAULT_LISTEN_PORT};
pub use packet::{Direction, Packet};
pub use session::{Session, SessionState};
pub use socket::MaybeTlsStream;
pub use tokio_rustls::rustls;
pub use tokio_util::sync::CancellationToken;
