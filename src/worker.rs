use swarmq::agent::WorkerAgent;
use swarmq::config::AgentConfig;
use swarmq::executor::{EchoExecutor, ExecutorRegistry, SleepExecutor};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let config = AgentConfig::from_env()?;
  let executors = ExecutorRegistry::new()
    .register("echo", EchoExecutor)
    .register("sleep", SleepExecutor)
    .with_fallback(EchoExecutor);

  let agent = WorkerAgent::new(config, executors)?;
  let handle = agent.spawn();
  info!(worker_id = %handle.worker_id(), "Worker running, ctrl-c to stop");

  tokio::signal::ctrl_c().await?;
  handle.shutdown().await;
  Ok(())
}
