//! relay error
use std::io::ErrorKind;
use thiserror::Error as ThisError;
use tokio_rustls::rustls;
use tokio_tungstenite::tungstenite;
/// A `Result` alias where the `Err` case is `slinger_relay::Error`.
pub type Result<T> = std::result::Result<T, Error>;
/// The Errors that may occur while negotiating or relaying a session.
///
/// A closed stream and a cancelled negotiation are not errors: they are reported as `Ok(None)`
/// by the operations that can observe them and end the session through the disconnect path.
#[derive(ThisError, Debug)]
pub enum Error {
  /// Socket level failure
  #[error(transparent)]
  IO(#[from] std::io::Error),
  /// tls Error
  #[error(transparent)]
  Tls(#[from] rustls::Error),
  /// http::Error
  #[error(transparent)]
  Http(http::Error),
  /// Malformed handshake, unexpected probe payload or a frame the format rejects
  #[error("protocol error: {0}")]
  Protocol(String),
  /// Options or handler hand-off that can not produce a working session
  #[error("configuration error: {0}")]
  Configuration(String),
  /// Error raised by an interceptor, never swallowed by the engine
  #[error("interceptor error: {0}")]
  Interceptor(String),
}

impl Error {
  /// Create a protocol error and log it
  pub fn protocol(msg: impl Into<String>) -> Self {
    let error = Error::Protocol(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a configuration error and log it
  pub fn configuration(msg: impl Into<String>) -> Self {
    let error = Error::Configuration(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create an interceptor error and log it
  pub fn interceptor(msg: impl Into<String>) -> Self {
    let error = Error::Interceptor(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Whether the negotiator may drop the current attempt and listen again.
  pub(crate) fn is_retryable(&self) -> bool {
    matches!(self, Error::IO(_))
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}

impl From<http::uri::InvalidUri> for Error {
  fn from(value: http::uri::InvalidUri) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<tungstenite::Error> for Error {
  fn from(value: tungstenite::Error) -> Self {
    match value {
      tungstenite::Error::Io(e) => Error::IO(e),
      tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
        new_io_error(ErrorKind::ConnectionAborted, "web socket closed")
      }
      other => Error::protocol(format!("web socket: {}", other)),
    }
  }
}

pub(crate) fn new_io_error(error_kind: ErrorKind, msg: &str) -> Error {
  Error::IO(std::io::Error::new(error_kind, msg))
}

pub(crate) fn builder<E: Into<Box<dyn std::error::Error + Send + Sync>>>(e: E) -> Error {
  Error::configuration(e.into().to_string())
}
