use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use swarmq::agent::{AgentState, WorkerAgent};
use swarmq::broker::Broker;
use swarmq::client::BrokerClient;
use swarmq::config::{AgentConfig, BrokerConfig};
use swarmq::executor::{EchoExecutor, Executor, ExecutorRegistry};
use swarmq::models::{ClaimedTask, NewTask, ResultView, WorkerStatus};
use swarmq::routes::routes;
use std::net::SocketAddr;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const SECRET: &str = "agent-secret";
const DEAD_ENDPOINT: &str = "http://127.0.0.1:1";

struct LiveBroker {
  url: String,
  addr: SocketAddr,
  broker: Arc<Broker>,
  stop: oneshot::Sender<()>,
  server: JoinHandle<()>,
}

impl LiveBroker {
  async fn stop(self) {
    let _ = self.stop.send(());
    let _ = tokio::time::timeout(Duration::from_secs(5), self.server).await;
  }
}

fn serve(broker: Arc<Broker>, addr: SocketAddr) -> Result<LiveBroker, warp::Error> {
  let (stop, stopped) = oneshot::channel::<()>();
  let (addr, server) = warp::serve(routes(broker.clone())).try_bind_with_graceful_shutdown(addr, async {
    stopped.await.ok();
  })?;
  let server = tokio::spawn(server);
  Ok(LiveBroker { url: format!("http://{}", addr), addr, broker, stop, server })
}

fn start_broker() -> LiveBroker {
  serve(Arc::new(Broker::new(BrokerConfig::new(SECRET))), ([127, 0, 0, 1], 0).into()).unwrap()
}

async fn restart_broker(addr: SocketAddr) -> LiveBroker {
  let broker = Arc::new(Broker::new(BrokerConfig::new(SECRET)));
  for _ in 0..50 {
    if let Ok(live) = serve(broker.clone(), addr) {
      return live;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
  }
  panic!("could not rebind {}", addr);
}

fn agent_config(urls: Vec<String>, worker_id: &str) -> AgentConfig {
  let mut config = AgentConfig::new(urls, SECRET);
  config.worker_id = Some(worker_id.into());
  config.hostname = Some("test-host".into());
  config.poll_interval = Duration::from_millis(20);
  config.heartbeat_interval = Duration::from_millis(50);
  config.request_timeout = Duration::from_secs(2);
  config.reconnect_base = Duration::from_millis(10);
  config.reconnect_max = Duration::from_millis(50);
  config
}

async fn wait_for_result(client: &BrokerClient, task_id: &str) -> ResultView {
  for _ in 0..200 {
    if let Some(view) = client.fetch_result(task_id).await.unwrap() {
      return view;
    }
    tokio::time::sleep(Duration::from_millis(25)).await;
  }
  panic!("no result for {}", task_id);
}

async fn wait_idle(handle: &swarmq::agent::AgentHandle) {
  let mut state = handle.subscribe();
  tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| *s == AgentState::Idle))
    .await
    .expect("agent never became idle")
    .unwrap();
}

struct HangingExecutor;

#[async_trait]
impl Executor for HangingExecutor {
  async fn execute(&self, _task: &ClaimedTask) -> anyhow::Result<Value> {
    std::future::pending().await
  }
}

struct PanickingExecutor;

#[async_trait]
impl Executor for PanickingExecutor {
  async fn execute(&self, _task: &ClaimedTask) -> anyhow::Result<Value> {
    panic!("executor bug");
  }
}

#[tokio::test]
async fn agent_runs_submitted_tasks() {
  let live = start_broker();
  let executors = ExecutorRegistry::new().register("echo", EchoExecutor);
  let agent = WorkerAgent::new(agent_config(vec![live.url.clone()], "agent-1"), executors).unwrap();
  let handle = agent.spawn();

  let submitter = BrokerClient::new(vec![live.url.clone()], SECRET, Duration::from_secs(2)).unwrap();
  let tasks: Vec<NewTask> =
    (0..3).map(|i| NewTask::new(json!({"n": i})).with_id(format!("t{}", i)).with_kind("echo")).collect();
  let submitted = submitter.submit(&tasks).await.unwrap();
  assert_eq!(submitted.task_ids.len(), 3);

  for i in 0..3 {
    let view = wait_for_result(&submitter, &format!("t{}", i)).await;
    assert_eq!(view.result, Some(json!({"n": i})));
    assert_eq!(view.worker_id.as_deref(), Some("agent-1"));
  }

  let status = live.broker.status().await;
  let worker = &status.workers["agent-1"];
  assert_eq!(worker.hostname.as_deref(), Some("test-host"));
  assert_eq!(worker.resources["capacity"], 1);
  assert_eq!(status.queue.completed, 3);

  handle.shutdown().await;
  live.stop().await;
}

#[tokio::test]
async fn agent_fails_over_and_stays_on_the_live_endpoint() {
  let live = start_broker();
  let urls = vec![DEAD_ENDPOINT.to_string(), live.url.clone()];
  let agent = WorkerAgent::new(agent_config(urls, "agent-2"), ExecutorRegistry::new().with_fallback(EchoExecutor))
    .unwrap();
  let handle = agent.spawn();

  let mut state = handle.subscribe();
  tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| *s == AgentState::Idle))
    .await
    .expect("agent never became idle")
    .unwrap();
  assert_eq!(handle.active_endpoint(), live.url);

  let submitter = BrokerClient::new(vec![live.url.clone()], SECRET, Duration::from_secs(2)).unwrap();
  submitter.submit(&[NewTask::new(json!("ping")).with_id("p1")]).await.unwrap();
  let view = wait_for_result(&submitter, "p1").await;
  assert_eq!(view.result, Some(json!("ping")));
  assert_eq!(handle.active_endpoint(), live.url);

  handle.shutdown().await;
  live.stop().await;
}

#[tokio::test]
async fn executor_panic_is_reported_as_failure() {
  let live = start_broker();
  let executors = ExecutorRegistry::new().register("boom", PanickingExecutor).register("echo", EchoExecutor);
  let agent = WorkerAgent::new(agent_config(vec![live.url.clone()], "agent-3"), executors).unwrap();
  let handle = agent.spawn();

  let submitter = BrokerClient::new(vec![live.url.clone()], SECRET, Duration::from_secs(2)).unwrap();
  submitter
    .submit(&[
      NewTask::new(json!({})).with_id("bad").with_kind("boom"),
      NewTask::new(json!("still alive")).with_id("good").with_kind("echo"),
    ])
    .await
    .unwrap();

  let bad = wait_for_result(&submitter, "bad").await;
  assert_eq!(bad.error.as_deref(), Some("executor panicked"));
  let good = wait_for_result(&submitter, "good").await;
  assert_eq!(good.result, Some(json!("still alive")));

  handle.shutdown().await;
  live.stop().await;
}

#[tokio::test]
async fn unsupported_type_is_reported_not_dropped() {
  let live = start_broker();
  let executors = ExecutorRegistry::new().register("echo", EchoExecutor);
  let agent = WorkerAgent::new(agent_config(vec![live.url.clone()], "agent-4"), executors).unwrap();
  let handle = agent.spawn();

  let submitter = BrokerClient::new(vec![live.url.clone()], SECRET, Duration::from_secs(2)).unwrap();
  submitter.submit(&[NewTask::new(json!({})).with_id("x").with_kind("train")]).await.unwrap();
  let view = wait_for_result(&submitter, "x").await;
  assert_eq!(view.error.as_deref(), Some("unsupported task type: train"));

  handle.shutdown().await;
  live.stop().await;
}

#[tokio::test]
async fn shutdown_is_prompt_while_disconnected() {
  let agent = WorkerAgent::new(agent_config(vec![DEAD_ENDPOINT.to_string()], "agent-5"), ExecutorRegistry::new())
    .unwrap();
  let handle = agent.spawn();
  tokio::time::sleep(Duration::from_millis(100)).await;
  assert_ne!(handle.state(), AgentState::Idle);

  tokio::time::timeout(Duration::from_secs(2), handle.shutdown()).await.expect("shutdown hung");
}

#[tokio::test]
async fn wrong_secret_never_registers() {
  let live = start_broker();
  let mut config = agent_config(vec![live.url.clone()], "agent-6");
  config.secret = "wrong".into();
  let handle = WorkerAgent::new(config, ExecutorRegistry::new()).unwrap().spawn();

  tokio::time::sleep(Duration::from_millis(150)).await;
  assert_ne!(handle.state(), AgentState::Idle);
  assert!(live.broker.status().await.workers.is_empty());

  handle.shutdown().await;
  live.stop().await;
}

#[tokio::test]
async fn heartbeats_continue_while_an_execution_hangs() {
  let live = start_broker();
  let executors = ExecutorRegistry::new().register("hang", HangingExecutor);
  let handle = WorkerAgent::new(agent_config(vec![live.url.clone()], "agent-7"), executors).unwrap().spawn();
  wait_idle(&handle).await;

  let submitter = BrokerClient::new(vec![live.url.clone()], SECRET, Duration::from_secs(2)).unwrap();
  submitter.submit(&[NewTask::new(json!({})).with_id("stuck").with_kind("hang")]).await.unwrap();
  let mut state = handle.subscribe();
  tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| *s == AgentState::Executing))
    .await
    .expect("task never started")
    .unwrap();

  let before = live.broker.status().await.workers["agent-7"].heartbeats;
  tokio::time::sleep(Duration::from_millis(300)).await;
  let status = live.broker.status().await;
  let worker = &status.workers["agent-7"];
  assert!(worker.heartbeats >= before + 2, "heartbeats stalled at {}", worker.heartbeats);
  assert_eq!(worker.status, WorkerStatus::Ready);
  assert_eq!(status.queue.active, 1);
  assert_eq!(handle.state(), AgentState::Executing);

  tokio::time::timeout(Duration::from_secs(2), handle.shutdown()).await.expect("shutdown hung");
  live.stop().await;
}

#[tokio::test]
async fn agent_moves_to_backup_when_primary_dies_and_stays_after_it_returns() {
  let primary = start_broker();
  let backup = start_broker();
  let urls = vec![primary.url.clone(), backup.url.clone()];
  let handle =
    WorkerAgent::new(agent_config(urls, "agent-8"), ExecutorRegistry::new().with_fallback(EchoExecutor)).unwrap().spawn();
  wait_idle(&handle).await;
  assert_eq!(handle.active_endpoint(), primary.url);

  let primary_addr = primary.addr;
  let primary_url = primary.url.clone();
  primary.stop().await;

  let submitter = BrokerClient::new(vec![backup.url.clone()], SECRET, Duration::from_secs(2)).unwrap();
  submitter.submit(&[NewTask::new(json!("first")).with_id("b1")]).await.unwrap();
  let view = wait_for_result(&submitter, "b1").await;
  assert_eq!(view.result, Some(json!("first")));
  assert_eq!(view.worker_id.as_deref(), Some("agent-8"));
  assert_eq!(handle.active_endpoint(), backup.url);

  let revived = restart_broker(primary_addr).await;
  assert_eq!(revived.url, primary_url);
  let revived_client = BrokerClient::new(vec![revived.url.clone()], SECRET, Duration::from_secs(2)).unwrap();
  revived_client.submit(&[NewTask::new(json!("ignored")).with_id("p1")]).await.unwrap();

  submitter.submit(&[NewTask::new(json!("second")).with_id("b2")]).await.unwrap();
  let view = wait_for_result(&submitter, "b2").await;
  assert_eq!(view.result, Some(json!("second")));
  assert_eq!(handle.active_endpoint(), backup.url);

  let revived_queue = revived.broker.status().await.queue;
  assert_eq!(revived_queue.claimed, 0);
  assert_eq!(revived_queue.queued, 1);

  handle.shutdown().await;
  revived.stop().await;
  backup.stop().await;
}
