use crate::errors::Result;
use crate::exchange::{Exchange, Relayer, Verdict};
use crate::format::Format;
use crate::node::Node;
use crate::packet::Direction;
use crate::session::Link;
use std::sync::Arc;

/// Pumps packets one way between the two legs of a link.
pub(crate) struct Relay {
  pub(crate) direction: Direction,
  pub(crate) source: Arc<Node>,
  pub(crate) destination: Arc<Node>,
  pub(crate) format: Arc<dyn Format>,
  pub(crate) link: Arc<Link>,
}

impl Relay {
  /// Relay until either leg ends, then tear the link down.
  ///
  /// Returns the first interceptor error; the end of a stream is not an error.
  pub(crate) async fn run(self) -> Result<()> {
    let relayed = self.pump().await;
    let torn_down = self.link.teardown();
    relayed.and(torn_down)
  }

  async fn pump(&self) -> Result<()> {
    let mut sequence = 0u64;
    loop {
      let packet = match self.source.receive_packet(self.format.as_ref()).await {
        Ok(Some(packet)) => packet,
        Ok(None) => {
          tracing::debug!("{} stream from {} ended", self.direction, self.source.peer_addr());
          return Ok(());
        }
        Err(e) => {
          tracing::debug!(
            "{} stream from {} failed: {}",
            self.direction,
            self.source.peer_addr(),
            e
          );
          return Ok(());
        }
      };
      sequence += 1;
      let relayer = Relayer::new(self.destination.clone(), self.format.clone());
      let mut exchange = Exchange::new(packet, sequence, self.direction, relayer);
      self.link.handler().process_exchange(&mut exchange)?;

      let (packet, verdict, waits) = exchange.into_parts();
      match verdict {
        Verdict::Forward => {
          if let Err(e) = self.destination.send_packet(self.format.as_ref(), &packet).await {
            tracing::debug!(
              "{} forward to {} failed: {}",
              self.direction,
              self.destination.peer_addr(),
              e
            );
            return Ok(());
          }
        }
        Verdict::Block => tracing::trace!("{} packet #{} blocked", self.direction, sequence),
        Verdict::Relay => {
          tracing::trace!("{} packet #{} relayed by interceptor", self.direction, sequence)
        }
      }

      if !waits.is_empty() {
        tokio::select! {
          _ = self.link.token().cancelled() => return Ok(()),
          _ = futures::future::join_all(waits) => {}
        }
      }
    }
  }
}
