//! The broker owns the three stores and is the only thing that mutates them.
//! It is constructed explicitly and shared behind an `Arc`, so every test can
//! run its own isolated instance.

use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::BrokerConfig;
use crate::error::{BrokerError, BrokerResult};
use crate::models::{
  BroadcastRequest, BroadcastResponse, ClaimedTask, HeartbeatRequest, NewTask, RegisterRequest, ResultLookup,
  ResultReport, StatusSnapshot, SubmitBody, SubmitResponse,
};
use crate::result_store::ResultStore;
use crate::signing;
use crate::task_queue::{Completion, TaskPhase, TaskQueue};
use crate::telemetry::{SecurityEvent, SecurityEventKind, SecurityTelemetry, TracingTelemetry};
use crate::worker_registry::WorkerRegistry;

static ID_PATTERN: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.:@\-]{1,128}$").expect("id pattern compiles"));

fn validate_lease_timeout(secs: Option<u64>) -> BrokerResult<()> {
  if secs == Some(0) {
    return Err(BrokerError::BadRequest("leaseTimeoutSecs must be positive".into()));
  }
  Ok(())
}

pub fn validate_id(kind: &str, id: &str) -> BrokerResult<()> {
  if ID_PATTERN.is_match(id) {
    Ok(())
  } else {
    Err(BrokerError::BadRequest(format!("invalid {} {:?}", kind, id)))
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
  pub reclaimed: Vec<String>,
  pub expired_results: usize,
  pub pruned_workers: usize,
  /// Unclaimed tasks whose target worker was pruned.
  pub dropped_tasks: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
  Recorded,
  Ignored,
}

pub struct Broker {
  config: BrokerConfig,
  queue: TaskQueue,
  results: ResultStore,
  workers: WorkerRegistry,
  clock: Arc<dyn Clock>,
  telemetry: Arc<dyn SecurityTelemetry>,
  /// Held while ids are admitted and while an accepted outcome moves from
  /// the queue to the result store, so a retired id cannot be resubmitted
  /// while its old outcome is in flight.
  admission: Mutex<()>,
}

impl Broker {
  pub fn new(config: BrokerConfig) -> Self {
    Self {
      queue: TaskQueue::new(),
      results: ResultStore::new(config.result_ttl),
      workers: WorkerRegistry::new(config.stale_after()),
      clock: Arc::new(SystemClock),
      telemetry: Arc::new(TracingTelemetry),
      admission: Mutex::new(()),
      config,
    }
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn with_telemetry(mut self, telemetry: Arc<dyn SecurityTelemetry>) -> Self {
    self.telemetry = telemetry;
    self
  }

  pub fn config(&self) -> &BrokerConfig {
    &self.config
  }

  fn reject(&self, kind: SecurityEventKind, route: &'static str, remote: Option<SocketAddr>) {
    self.telemetry.record(SecurityEvent { kind, route, remote, at: self.clock.now() });
  }

  pub fn authenticate(
    &self,
    header: Option<&str>,
    route: &'static str,
    remote: Option<SocketAddr>,
  ) -> BrokerResult<()> {
    let provided = header.map(signing::bearer).unwrap_or_default();
    if signing::secret_matches(&self.config.secret, provided) {
      Ok(())
    } else {
      self.reject(SecurityEventKind::BadSecret, route, remote);
      Err(BrokerError::Unauthorized)
    }
  }

  pub fn verify_signed(
    &self,
    body: &[u8],
    signature: Option<&str>,
    route: &'static str,
    remote: Option<SocketAddr>,
  ) -> BrokerResult<()> {
    let valid = signature.is_some_and(|sig| signing::verify(&self.config.secret, body, sig));
    if valid {
      Ok(())
    } else {
      self.reject(SecurityEventKind::BadSignature, route, remote);
      Err(BrokerError::BadSignature)
    }
  }

  pub async fn submit(&self, body: SubmitBody) -> BrokerResult<SubmitResponse> {
    let tasks = body.into_tasks();
    if tasks.is_empty() {
      return Err(BrokerError::BadRequest("no tasks in request".into()));
    }
    for new_task in &tasks {
      if let Some(id) = &new_task.id {
        validate_id("task id", id)?;
      }
      validate_id("task type", &new_task.kind)?;
      validate_lease_timeout(new_task.lease_timeout_secs)?;
    }

    let now = self.clock.now();
    let tasks: Vec<_> = tasks
      .into_iter()
      .map(|new_task| {
        let id = new_task.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        new_task.into_task(id, now)
      })
      .collect();

    let _admission = self.admission.lock().await;
    for task in &tasks {
      if self.results.holds(&task.id, now).await {
        return Err(BrokerError::DuplicateTask(task.id.clone()));
      }
    }
    let task_ids = self.queue.submit_all(tasks).await?;
    let queued = self.queue.stats().await.queued;
    info!(count = task_ids.len(), queued, "Tasks submitted");
    Ok(SubmitResponse { ok: true, task_ids, queued })
  }

  pub async fn claim(&self, worker_id: &str) -> BrokerResult<Option<ClaimedTask>> {
    validate_id("worker id", worker_id)?;
    let now = self.clock.now();
    self.workers.touch(worker_id, now).await;
    Ok(self.queue.claim(worker_id, now, |task| self.config.lease_timeout_for(&task.kind)).await)
  }

  pub async fn report(&self, report: ResultReport) -> BrokerResult<ReportOutcome> {
    validate_id("task id", &report.task_id)?;
    let outcome = report
      .outcome()
      .ok_or_else(|| BrokerError::BadRequest("result or error is required".into()))?;

    let completion = self
      .queue
      .complete(
        &report.task_id,
        report.worker_id.as_deref(),
        report.lease_id.as_deref(),
        outcome.is_success(),
      )
      .await;
    match completion {
      Completion::Accepted(lease) => {
        let now = self.clock.now();
        if let Some(worker_id) = &report.worker_id {
          self.workers.touch(worker_id, now).await;
        }
        let _admission = self.admission.lock().await;
        if !self.results.put(&report.task_id, Some(lease.worker_id.clone()), outcome, now).await {
          warn!(task_id = %report.task_id, "Outcome already stored for this id, keeping the first");
        }
        self.queue.retire(&report.task_id).await;
        info!(task_id = %report.task_id, worker_id = %lease.worker_id, "Result recorded");
        Ok(ReportOutcome::Recorded)
      }
      Completion::Ignored => {
        warn!(task_id = %report.task_id, worker_id = ?report.worker_id, "Late or unleased result ignored");
        Ok(ReportOutcome::Ignored)
      }
    }
  }

  async fn lookup_pending(&self, task_id: &str) -> ResultLookup {
    match self.queue.phase(task_id).await {
      Some(TaskPhase::Queued) => ResultLookup::Queued,
      Some(TaskPhase::Processing) | Some(TaskPhase::Recording) => ResultLookup::Processing,
      None => ResultLookup::Unknown,
    }
  }

  /// Consumes a ready result; otherwise reports where the task is.
  pub async fn result(&self, task_id: &str) -> BrokerResult<ResultLookup> {
    validate_id("task id", task_id)?;
    if let Some(record) = self.results.take(task_id, self.clock.now()).await {
      return Ok(ResultLookup::Ready(record));
    }
    Ok(self.lookup_pending(task_id).await)
  }

  pub async fn results(&self, task_ids: &[String]) -> BrokerResult<BTreeMap<String, ResultLookup>> {
    for id in task_ids {
      validate_id("task id", id)?;
    }
    let mut ready = self.results.take_batch(task_ids, self.clock.now()).await;
    let mut out = BTreeMap::new();
    for id in task_ids {
      let lookup = match ready.remove(id) {
        Some(record) => ResultLookup::Ready(record),
        None => self.lookup_pending(id).await,
      };
      out.insert(id.clone(), lookup);
    }
    Ok(out)
  }

  pub async fn register(&self, req: RegisterRequest) -> BrokerResult<String> {
    if let Some(id) = &req.id {
      validate_id("worker id", id)?;
    }
    Ok(self.workers.register(req, self.clock.now()).await)
  }

  pub async fn heartbeat(&self, req: HeartbeatRequest) -> BrokerResult<()> {
    validate_id("worker id", &req.id)?;
    self.workers.heartbeat(req, self.clock.now()).await;
    Ok(())
  }

  /// Queues one task per target worker, each claimable only by its target.
  /// Explicit targets the registry has never seen are skipped.
  pub async fn broadcast(&self, req: BroadcastRequest) -> BrokerResult<BroadcastResponse> {
    validate_id("task type", &req.kind)?;
    validate_lease_timeout(req.lease_timeout_secs)?;
    let now = self.clock.now();
    let targets: Vec<String> = match req.worker_ids {
      Some(ids) => {
        for id in &ids {
          validate_id("worker id", id)?;
        }
        let mut seen = HashSet::new();
        let mut known = Vec::new();
        for id in ids {
          if !seen.insert(id.clone()) {
            continue;
          }
          if self.workers.contains(&id).await {
            known.push(id);
          } else {
            warn!(worker_id = %id, "Broadcast target is not registered, skipping");
          }
        }
        known
      }
      None => self.workers.ready_ids(now).await,
    };

    let (payload, meta) = match req.payload {
      Some(payload) => (payload, (!req.rest.is_empty()).then(|| Value::Object(req.rest.clone()))),
      None => (Value::Object(req.rest.clone()), None),
    };

    let broadcast_id = format!("bc-{}", Uuid::new_v4().simple());
    let tasks: Vec<_> = targets
      .iter()
      .enumerate()
      .map(|(idx, worker_id)| {
        let new_task = NewTask {
          kind: req.kind.clone(),
          payload: payload.clone(),
          meta: meta.clone(),
          target_worker: Some(worker_id.clone()),
          lease_timeout_secs: req.lease_timeout_secs,
          ..NewTask::default()
        };
        new_task.into_task(format!("{}:{}", broadcast_id, idx), now)
      })
      .collect();
    self.queue.submit_all(tasks).await?;
    info!(broadcast_id = %broadcast_id, targets = targets.len(), "Broadcast queued");
    Ok(BroadcastResponse { ok: true, broadcast_id, targets: targets.len() })
  }

  pub async fn status(&self) -> StatusSnapshot {
    let now = self.clock.now();
    StatusSnapshot {
      queue: self.queue.stats().await,
      results: self.results.len().await,
      workers: self.workers.list(now).await.into_iter().map(|w| (w.id.clone(), w)).collect(),
    }
  }

  pub async fn sweep(&self) -> SweepReport {
    let now = self.clock.now();
    let reclaimed = self.queue.reclaim_expired(now).await;
    let expired_results = self.results.sweep(now).await;
    let pruned = match self.config.worker_prune_after {
      Some(horizon) => self.workers.prune_stale(now, horizon).await,
      None => Vec::new(),
    };
    let dropped_tasks = self.queue.drop_targeted(&pruned).await;
    if !reclaimed.is_empty() || expired_results > 0 || !pruned.is_empty() {
      info!(
        reclaimed = reclaimed.len(),
        expired_results,
        pruned_workers = pruned.len(),
        dropped_tasks = dropped_tasks.len(),
        "Sweep"
      );
    }
    SweepReport { reclaimed, expired_results, pruned_workers: pruned.len(), dropped_tasks }
  }
}
