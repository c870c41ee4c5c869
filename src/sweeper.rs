use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::{StreamExt, wrappers::IntervalStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::broker::Broker;

/// Owned handle to the broker's periodic reclaim/expiry sweep.
pub struct Sweeper {
  token: CancellationToken,
  handle: JoinHandle<()>,
}

impl Sweeper {
  pub fn spawn(broker: Arc<Broker>, every: Duration) -> Self {
    let token = CancellationToken::new();
    let child = token.child_token();

    let handle = tokio::spawn(async move {
      let mut interval = tokio::time::interval(every);
      interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
      let mut ticks = IntervalStream::new(interval);
      // The first tick fires immediately.
      ticks.next().await;

      loop {
        tokio::select! {
          _ = child.cancelled() => break,
          tick = ticks.next() => {
            if tick.is_none() {
              break;
            }
            let report = broker.sweep().await;
            debug!(reclaimed = report.reclaimed.len(), "Sweep tick");
          }
        }
      }
      info!("Sweeper stopped");
    });

    Self { token, handle }
  }

  pub fn token(&self) -> CancellationToken {
    self.token.clone()
  }

  pub async fn shutdown(self) {
    self.token.cancel();
    let _ = self.handle.await;
  }
}
