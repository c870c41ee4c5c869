use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const DEFAULT_TASK_TYPE: &str = "default";

fn default_task_type() -> String {
  DEFAULT_TASK_TYPE.to_string()
}

/// A field that is present deserializes to `Some`, even when it is `null`.
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
  Value::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
  pub id: String,
  #[serde(rename = "type")]
  pub kind: String,
  pub payload: Value,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub system_prompt: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub max_tokens: Option<u32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub meta: Option<Value>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub target_worker: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub lease_timeout_secs: Option<u64>,
  pub created_at: DateTime<Utc>,
}

/// Task as submitted over the wire. `id` and `type` are optional.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,
  #[serde(rename = "type", default = "default_task_type")]
  pub kind: String,
  pub payload: Value,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub system_prompt: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub max_tokens: Option<u32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub meta: Option<Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub target_worker: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub lease_timeout_secs: Option<u64>,
}

impl NewTask {
  pub fn new(payload: Value) -> Self {
    Self { kind: default_task_type(), payload, ..Default::default() }
  }

  pub fn with_id(mut self, id: impl Into<String>) -> Self {
    self.id = Some(id.into());
    self
  }

  pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
    self.kind = kind.into();
    self
  }

  pub fn into_task(self, id: String, created_at: DateTime<Utc>) -> Task {
    Task {
      id,
      kind: self.kind,
      payload: self.payload,
      system_prompt: self.system_prompt,
      max_tokens: self.max_tokens,
      meta: self.meta,
      target_worker: self.target_worker,
      lease_timeout_secs: self.lease_timeout_secs,
      created_at,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SubmitBody {
  Batch { tasks: Vec<NewTask> },
  Single(NewTask),
}

impl SubmitBody {
  pub fn into_tasks(self) -> Vec<NewTask> {
    match self {
      SubmitBody::Batch { tasks } => tasks,
      SubmitBody::Single(task) => vec![task],
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
  pub ok: bool,
  pub task_ids: Vec<String>,
  pub queued: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
  pub task_id: String,
  pub worker_id: String,
  pub lease_id: String,
  pub attempt: u32,
  pub claimed_at: DateTime<Utc>,
  pub lease_deadline: DateTime<Utc>,
}

/// What a worker receives from `GET /api/task`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClaimedTask {
  pub id: String,
  #[serde(rename = "type")]
  pub kind: String,
  pub payload: Value,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub system_prompt: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub max_tokens: Option<u32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub meta: Option<Value>,
  pub lease_id: String,
  pub attempt: u32,
  pub lease_deadline: DateTime<Utc>,
}

impl ClaimedTask {
  pub fn from_lease(task: &Task, lease: &Lease) -> Self {
    Self {
      id: task.id.clone(),
      kind: task.kind.clone(),
      payload: task.payload.clone(),
      system_prompt: task.system_prompt.clone(),
      max_tokens: task.max_tokens,
      meta: task.meta.clone(),
      lease_id: lease.lease_id.clone(),
      attempt: lease.attempt,
      lease_deadline: lease.lease_deadline,
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
  Success(Value),
  Failure(String),
}

impl Outcome {
  pub fn is_success(&self) -> bool {
    matches!(self, Outcome::Success(_))
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultRecord {
  pub task_id: String,
  pub worker_id: Option<String>,
  pub outcome: Outcome,
  pub completed_at: DateTime<Utc>,
  pub expires_at: DateTime<Utc>,
}

/// Body of `POST /api/result`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResultReport {
  pub task_id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub worker_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub lease_id: Option<String>,
  #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
  pub result: Option<Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

impl ResultReport {
  pub fn for_task(task: &ClaimedTask, worker_id: &str, outcome: Outcome) -> Self {
    let (result, error) = match outcome {
      Outcome::Success(value) => (Some(value), None),
      Outcome::Failure(message) => (None, Some(message)),
    };
    Self {
      task_id: task.id.clone(),
      worker_id: Some(worker_id.to_string()),
      lease_id: Some(task.lease_id.clone()),
      result,
      error,
    }
  }

  /// An error wins over a result when a reporter sends both.
  pub fn outcome(&self) -> Option<Outcome> {
    match (&self.error, &self.result) {
      (Some(message), _) => Some(Outcome::Failure(message.clone())),
      (None, Some(value)) => Some(Outcome::Success(value.clone())),
      (None, None) => None,
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResultLookup {
  Ready(ResultRecord),
  Queued,
  Processing,
  Unknown,
}

/// Wire shape of a result lookup, shared by the single and batch endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResultView {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub task_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub status: Option<String>,
  #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
  pub result: Option<Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub worker_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub completed_at: Option<DateTime<Utc>>,
}

impl ResultView {
  fn status(status: &str) -> Self {
    Self {
      task_id: None,
      status: Some(status.to_string()),
      result: None,
      error: None,
      worker_id: None,
      completed_at: None,
    }
  }

  pub fn is_ready(&self) -> bool {
    self.status.is_none()
  }
}

impl From<&ResultLookup> for ResultView {
  fn from(lookup: &ResultLookup) -> Self {
    match lookup {
      ResultLookup::Ready(record) => {
        let (result, error) = match &record.outcome {
          Outcome::Success(value) => (Some(value.clone()), None),
          Outcome::Failure(message) => (None, Some(message.clone())),
        };
        ResultView {
          task_id: Some(record.task_id.clone()),
          status: None,
          result,
          error,
          worker_id: record.worker_id.clone(),
          completed_at: Some(record.completed_at),
        }
      }
      ResultLookup::Queued => ResultView::status("queued"),
      ResultLookup::Processing => ResultView::status("processing"),
      ResultLookup::Unknown => ResultView::status("unknown"),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub hostname: Option<String>,
  #[serde(flatten)]
  pub resources: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
  pub ok: bool,
  pub worker_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
  pub id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub status: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub load: Option<Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub hostname: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastRequest {
  pub worker_ids: Option<Vec<String>>,
  #[serde(rename = "type", default = "default_task_type")]
  pub kind: String,
  pub payload: Option<Value>,
  pub lease_timeout_secs: Option<u64>,
  #[serde(flatten)]
  pub rest: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastResponse {
  pub ok: bool,
  pub broadcast_id: String,
  pub targets: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
  Ready,
  Stale,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSnapshot {
  pub id: String,
  pub hostname: Option<String>,
  pub resources: Map<String, Value>,
  pub reported_status: Option<String>,
  pub load: Option<Value>,
  pub registered_at: DateTime<Utc>,
  pub last_seen_at: DateTime<Utc>,
  pub heartbeats: u64,
  pub status: WorkerStatus,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct QueueStats {
  pub submitted: u64,
  pub claimed: u64,
  pub completed: u64,
  pub failed: u64,
  pub reclaimed: u64,
  pub queued: usize,
  pub active: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
  #[serde(flatten)]
  pub queue: QueueStats,
  pub results: usize,
  pub workers: BTreeMap<String, WorkerSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OkResponse {
  pub ok: bool,
}

impl OkResponse {
  pub fn ok() -> Self {
    Self { ok: true }
  }
}
