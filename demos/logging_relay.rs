//! Raw socket relay that logs every packet
//!
//! Point the game client at `127.0.0.1:9567` and give the real server on the command line.
//!
//! To run:
//! ```bash
//! RUST_LOG=debug cargo run --example logging_relay -- game.example.com:30000 [listen port]
//! ```

use slinger_relay::{
  CancellationToken, Endpoint, Exchange, Formats, InterceptOptions, Interceptor,
  LoggingInterceptor, Result, Session, DEFAULT_LISTEN_PORT,
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Drops outgoing packets with a given header
struct BlockId(u16);

impl Interceptor for BlockId {
  fn on_outgoing(&self, exchange: &mut Exchange) -> Result<()> {
    if exchange.packet().id() == Some(self.0) {
      tracing::warn!("blocking outgoing packet #{}", exchange.sequence());
      exchange.block();
    }
    Ok(())
  }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
  tracing_subscriber::registry()
    .with(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "logging_relay=info,slinger_relay=info".into()),
    )
    .with(tracing_subscriber::fmt::layer())
    .init();

  let mut args = std::env::args().skip(1);
  let target = args.next().ok_or("usage: logging_relay <host:port> [listen port]")?;
  let endpoint = Endpoint::parse(&target)?;
  let listen_port = match args.next() {
    Some(port) => port.parse()?,
    None => DEFAULT_LISTEN_PORT,
  };

  let session = Arc::new(Session::new(Formats::flash()));
  session.add_interceptor(Arc::new(LoggingInterceptor::new().with_payloads()));
  if let Ok(id) = std::env::var("BLOCK_ID") {
    session.add_interceptor(Arc::new(BlockId(id.parse()?)));
  }
  let options = InterceptOptions::builder().listen_port(listen_port).build()?;

  let cancel = CancellationToken::new();
  let ctrl_c = {
    let cancel = cancel.clone();
    async move {
      let _ = tokio::signal::ctrl_c().await;
      cancel.cancel();
    }
  };
  tokio::spawn(ctrl_c);
  loop {
    session.intercept(Some(endpoint.clone()), &options, cancel.clone()).await?;
    if cancel.is_cancelled() {
      break;
    }
    tracing::info!("session ended, waiting for the next client");
  }
  Ok(())
}
