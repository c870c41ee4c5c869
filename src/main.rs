use std::sync::Arc;
use swarmq::{broker::Broker, config::BrokerConfig, routes::routes, sweeper::Sweeper};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let config = BrokerConfig::from_env()?;
  let port = config.server_port;
  let sweep_interval = config.sweep_interval;
  let broker = Arc::new(Broker::new(config));
  let sweeper = Sweeper::spawn(broker.clone(), sweep_interval);

  let (addr, server) =
    warp::serve(routes(broker)).try_bind_with_graceful_shutdown(([0, 0, 0, 0], port), shutdown_signal())?;
  info!(%addr, "Broker listening");
  server.await;

  sweeper.shutdown().await;
  info!("Broker stopped");
  Ok(())
}

async fn shutdown_signal() {
  let ctrl_c = async {
    if let Err(e) = tokio::signal::ctrl_c().await {
      tracing::error!(error = %e, "Failed to listen for ctrl-c");
      std::future::pending::<()>().await;
    }
  };

  #[cfg(unix)]
  let terminate = async {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
      Ok(mut signal) => {
        signal.recv().await;
      }
      Err(_) => std::future::pending::<()>().await,
    }
  };

  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();

  tokio::select! {
    _ = ctrl_c => {},
    _ = terminate => {},
  }
  info!("Shutdown signal received");
}
