use crate::errors::{Error, Result};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

/// The upstream game server a session relays to.
///
/// The host is kept as written (domain or literal address) so that the TLS leg of a
/// WebSocket session can present it as the server name; it is only resolved when dialing.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Endpoint {
  host: String,
  port: u16,
}

impl Endpoint {
  /// Create an endpoint from a host name or address and a port.
  pub fn new(host: impl Into<String>, port: u16) -> Self {
    Self {
      host: host.into(),
      port,
    }
  }
  /// Parse `host:port`, `[v6]:port` or a bare socket address.
  pub fn parse(value: &str) -> Result<Self> {
    if let Ok(addr) = value.parse::<SocketAddr>() {
      return Ok(addr.into());
    }
    let (host, port) = value
      .rsplit_once(':')
      .ok_or_else(|| Error::configuration(format!("missing port in endpoint: {}", value)))?;
    let port = port
      .parse::<u16>()
      .map_err(|_| Error::configuration(format!("invalid port in endpoint: {}", value)))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
      return Err(Error::configuration(format!(
        "missing host in endpoint: {}",
        value
      )));
    }
    Ok(Self::new(host, port))
  }
  /// host name or literal address
  pub fn host(&self) -> &str {
    &self.host
  }
  /// port
  pub fn port(&self) -> u16 {
    self.port
  }
  /// Resolve the endpoint, returning the first address the resolver yields.
  pub async fn resolve(&self) -> Result<SocketAddr> {
    let mut addrs = tokio::net::lookup_host((self.host.as_str(), self.port)).await?;
    addrs.next().ok_or_else(|| {
      crate::errors::new_io_error(
        std::io::ErrorKind::NotFound,
        &format!("no address for {}", self),
      )
    })
  }
}

impl From<SocketAddr> for Endpoint {
  fn from(value: SocketAddr) -> Self {
    Self::new(value.ip().to_string(), value.port())
  }
}

impl FromStr for Endpoint {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    Endpoint::parse(s)
  }
}

impl fmt::Display for Endpoint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.host.contains(':') {
      write!(f, "[{}]:{}", self.host, self.port)
    } else {
      write!(f, "{}:{}", self.host, self.port)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_domain_and_port() {
    let endpoint = Endpoint::parse("game-us.example.com:30000").unwrap();
    assert_eq!(endpoint.host(), "game-us.example.com");
    assert_eq!(endpoint.port(), 30000);
    assert_eq!(endpoint.to_string(), "game-us.example.com:30000");
  }

  #[test]
  fn parse_ipv6() {
    let endpoint: Endpoint = "[::1]:9567".parse().unwrap();
    assert_eq!(endpoint.host(), "::1");
    assert_eq!(endpoint.to_string(), "[::1]:9567");
  }

  #[test]
  fn parse_rejects_missing_port() {
    assert!(matches!(
      Endpoint::parse("example.com"),
      Err(Error::Configuration(_))
    ));
    assert!(Endpoint::parse("example.com:http").is_err());
    assert!(Endpoint::parse(":80").is_err());
  }

  #[tokio::test]
  async fn resolve_literal_address() {
    let endpoint = Endpoint::new("127.0.0.1", 4000);
    let addr = endpoint.resolve().await.unwrap();
    assert_eq!(addr, "127.0.0.1:4000".parse().unwrap());
  }
}
