//! Remote worker loop: register, poll/claim, execute, report, heartbeat.
//!
//! Polling and heartbeats run as separate tasks and never wait on each other
//! or on an execution, so a slow executor cannot make the worker look dead.

use futures::FutureExt;
use serde_json::json;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::client::BrokerClient;
use crate::config::AgentConfig;
use crate::error::ClientError;
use crate::executor::ExecutorRegistry;
use crate::models::{ClaimedTask, HeartbeatRequest, Outcome, RegisterRequest, ResultReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
  Disconnected,
  Registering,
  Idle,
  Executing,
}

struct Shared {
  config: AgentConfig,
  client: BrokerClient,
  executors: ExecutorRegistry,
  worker_id: String,
  running: AtomicUsize,
  failures: AtomicU32,
  state: watch::Sender<AgentState>,
}

impl Shared {
  fn set_state(&self, next: AgentState) {
    self.state.send_if_modified(|state| {
      let changed = *state != next;
      if changed {
        debug!(from = ?*state, to = ?next, "Agent state");
        *state = next;
      }
      changed
    });
  }

  /// Idle/Executing follow the number of running executions; the
  /// connection states are left alone.
  fn refresh_busy(&self) {
    let busy = self.running.load(Ordering::SeqCst) > 0;
    self.state.send_if_modified(|state| {
      let next = match *state {
        AgentState::Idle | AgentState::Executing if busy => AgentState::Executing,
        AgentState::Idle | AgentState::Executing => AgentState::Idle,
        other => other,
      };
      let changed = *state != next;
      *state = next;
      changed
    });
  }

  fn record_success(&self) {
    self.failures.store(0, Ordering::SeqCst);
  }

  fn record_failure(&self) -> u32 {
    self.failures.fetch_add(1, Ordering::SeqCst) + 1
  }

  fn unhealthy(&self) -> bool {
    self.failures.load(Ordering::SeqCst) >= self.config.failure_threshold
  }

  fn register_request(&self) -> RegisterRequest {
    let mut resources = serde_json::Map::new();
    resources.insert("capacity".into(), json!(self.config.max_concurrent));
    resources.insert("kinds".into(), json!(self.executors.kinds()));
    RegisterRequest { id: Some(self.worker_id.clone()), hostname: self.config.hostname.clone(), resources }
  }

  fn heartbeat_request(&self) -> HeartbeatRequest {
    let running = self.running.load(Ordering::SeqCst);
    let status = if running > 0 { "executing" } else { "idle" };
    HeartbeatRequest {
      id: self.worker_id.clone(),
      status: Some(status.into()),
      load: Some(json!({ "running": running, "capacity": self.config.max_concurrent })),
      hostname: self.config.hostname.clone(),
    }
  }
}

const MIN_RECONNECT_DELAY: Duration = Duration::from_millis(10);

fn reconnect_backoff(config: &AgentConfig) -> impl Iterator<Item = Duration> {
  ExponentialBackoff::from_millis(config.reconnect_base.as_millis() as u64)
    .max_delay(config.reconnect_max)
    .map(|delay| delay.max(MIN_RECONNECT_DELAY))
}

/// Sleeps unless cancelled first. Returns `true` when cancelled.
async fn pause(token: &CancellationToken, delay: Duration) -> bool {
  tokio::select! {
    _ = token.cancelled() => true,
    _ = tokio::time::sleep(delay) => false,
  }
}

pub struct WorkerAgent {
  shared: Arc<Shared>,
  state: watch::Receiver<AgentState>,
}

impl WorkerAgent {
  pub fn new(config: AgentConfig, executors: ExecutorRegistry) -> anyhow::Result<Self> {
    let client = BrokerClient::new(config.broker_urls.clone(), config.secret.clone(), config.request_timeout)?;
    let worker_id = config.worker_id.clone().unwrap_or_else(|| format!("worker-{}", Uuid::new_v4()));
    let (state, rx) = watch::channel(AgentState::Disconnected);
    let shared = Shared {
      config,
      client,
      executors,
      worker_id,
      running: AtomicUsize::new(0),
      failures: AtomicU32::new(0),
      state,
    };
    Ok(Self { shared: Arc::new(shared), state: rx })
  }

  pub fn worker_id(&self) -> &str {
    &self.shared.worker_id
  }

  pub fn spawn(self) -> AgentHandle {
    let token = CancellationToken::new();
    info!(worker_id = %self.shared.worker_id, endpoints = ?self.shared.config.broker_urls, "Starting worker agent");
    let poll = tokio::spawn(poll_loop(self.shared.clone(), token.child_token()));
    let heartbeat = tokio::spawn(heartbeat_loop(self.shared.clone(), token.child_token()));
    AgentHandle { token, poll, heartbeat, state: self.state, shared: self.shared }
  }
}

pub struct AgentHandle {
  token: CancellationToken,
  poll: JoinHandle<()>,
  heartbeat: JoinHandle<()>,
  state: watch::Receiver<AgentState>,
  shared: Arc<Shared>,
}

impl AgentHandle {
  pub fn state(&self) -> AgentState {
    *self.state.borrow()
  }

  pub fn subscribe(&self) -> watch::Receiver<AgentState> {
    self.state.clone()
  }

  pub fn worker_id(&self) -> &str {
    &self.shared.worker_id
  }

  pub fn active_endpoint(&self) -> String {
    self.shared.client.active_endpoint().to_string()
  }

  pub fn running(&self) -> usize {
    self.shared.running.load(Ordering::SeqCst)
  }

  /// Stops polling and heartbeats and joins both loops. Executions still in
  /// flight are aborted; their leases expire on the broker.
  pub async fn shutdown(self) {
    self.token.cancel();
    let _ = self.poll.await;
    let _ = self.heartbeat.await;
    self.shared.set_state(AgentState::Disconnected);
    info!(worker_id = %self.shared.worker_id, "Worker agent stopped");
  }
}

async fn poll_loop(shared: Arc<Shared>, token: CancellationToken) {
  let permits = Arc::new(Semaphore::new(shared.config.max_concurrent));
  let mut executions = JoinSet::new();
  let mut registered = false;
  let mut reconnect = reconnect_backoff(&shared.config);

  loop {
    while let Some(joined) = executions.try_join_next() {
      if let Err(e) = joined {
        error!(error = %e, "Execution task failed");
      }
    }

    if registered && shared.unhealthy() {
      warn!(worker_id = %shared.worker_id, "Broker unreachable, reconnecting");
      registered = false;
    }

    if !registered {
      shared.set_state(AgentState::Registering);
      match shared.client.register(&shared.register_request()).await {
        Ok(id) => {
          if id != shared.worker_id {
            warn!(expected = %shared.worker_id, got = %id, "Broker assigned a different worker id");
          }
          info!(worker_id = %shared.worker_id, endpoint = %shared.client.active_endpoint(), "Registered");
          registered = true;
          shared.record_success();
          reconnect = reconnect_backoff(&shared.config);
          shared.set_state(AgentState::Idle);
          shared.refresh_busy();
        }
        Err(e) => {
          shared.set_state(AgentState::Disconnected);
          let delay = reconnect.next().unwrap_or(shared.config.reconnect_max.max(MIN_RECONNECT_DELAY));
          warn!(error = %e, retry_in = ?delay, "Registration failed");
          if pause(&token, delay).await {
            break;
          }
          continue;
        }
      }
    }

    let permit = tokio::select! {
      _ = token.cancelled() => break,
      permit = permits.clone().acquire_owned() => match permit {
        Ok(permit) => permit,
        Err(_) => break,
      },
    };

    let claimed = tokio::select! {
      _ = token.cancelled() => break,
      claimed = shared.client.claim(&shared.worker_id) => claimed,
    };

    match claimed {
      Ok(Some(task)) => {
        shared.record_success();
        info!(task_id = %task.id, kind = %task.kind, attempt = task.attempt, "Claimed task");
        executions.spawn(execute(shared.clone(), task, permit));
      }
      Ok(None) => {
        shared.record_success();
        drop(permit);
        if pause(&token, shared.config.poll_interval).await {
          break;
        }
      }
      Err(e) => {
        drop(permit);
        let failures = match e {
          ClientError::Unauthorized => {
            error!("Broker rejected our secret");
            shared.record_failure()
          }
          ref other if other.is_transient() => shared.record_failure(),
          ref other => {
            warn!(error = %other, "Claim rejected");
            shared.failures.load(Ordering::SeqCst)
          }
        };
        debug!(failures, "Claim failed");
        if pause(&token, shared.config.poll_interval).await {
          break;
        }
      }
    }
  }

  if !executions.is_empty() {
    info!(in_flight = executions.len(), "Abandoning running executions");
  }
  executions.shutdown().await;
}

async fn execute(shared: Arc<Shared>, task: ClaimedTask, _permit: OwnedSemaphorePermit) {
  shared.running.fetch_add(1, Ordering::SeqCst);
  shared.refresh_busy();

  let outcome = match AssertUnwindSafe(shared.executors.run(&task)).catch_unwind().await {
    Ok(outcome) => outcome,
    Err(_) => {
      error!(task_id = %task.id, "Executor panicked");
      Outcome::Failure("executor panicked".into())
    }
  };

  shared.running.fetch_sub(1, Ordering::SeqCst);
  shared.refresh_busy();

  let succeeded = outcome.is_success();
  let report = ResultReport::for_task(&task, &shared.worker_id, outcome);
  match shared.client.report_with_retry(&report, shared.config.result_retries).await {
    Ok(()) => info!(task_id = %task.id, succeeded, "Result delivered"),
    Err(e) => error!(task_id = %task.id, error = %e, "Giving up on result delivery, dropping result"),
  }
}

async fn heartbeat_loop(shared: Arc<Shared>, token: CancellationToken) {
  let mut ticker = tokio::time::interval(shared.config.heartbeat_interval);
  ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

  loop {
    tokio::select! {
      _ = token.cancelled() => break,
      _ = ticker.tick() => {}
    }

    let req = shared.heartbeat_request();
    let sent = tokio::select! {
      _ = token.cancelled() => break,
      sent = shared.client.heartbeat(&req) => sent,
    };
    match sent {
      Ok(()) => {
        shared.record_success();
        debug!(worker_id = %shared.worker_id, "Heartbeat sent");
      }
      Err(e) => {
        let failures = shared.record_failure();
        warn!(error = %e, failures, "Heartbeat failed");
      }
    }
  }
}
