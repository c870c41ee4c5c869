//! Worker identity and liveness. Status is derived from `last_seen_at` on
//! every read and never stored.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::{HeartbeatRequest, RegisterRequest, WorkerSnapshot, WorkerStatus};
use crate::task_queue::to_chrono;

#[derive(Debug, Clone)]
struct WorkerEntry {
  hostname: Option<String>,
  resources: Map<String, Value>,
  reported_status: Option<String>,
  load: Option<Value>,
  registered_at: DateTime<Utc>,
  last_seen_at: DateTime<Utc>,
  heartbeats: u64,
}

impl WorkerEntry {
  fn new(now: DateTime<Utc>) -> Self {
    Self {
      hostname: None,
      resources: Map::new(),
      reported_status: None,
      load: None,
      registered_at: now,
      last_seen_at: now,
      heartbeats: 0,
    }
  }
}

pub struct WorkerRegistry {
  workers: RwLock<HashMap<String, WorkerEntry>>,
  stale_after: Duration,
}

impl WorkerRegistry {
  pub fn new(stale_after: Duration) -> Self {
    Self { workers: RwLock::new(HashMap::new()), stale_after }
  }

  pub async fn register(&self, req: RegisterRequest, now: DateTime<Utc>) -> String {
    let id = req.id.unwrap_or_else(|| format!("worker-{}", Uuid::new_v4()));
    let mut workers = self.workers.write().await;
    let entry = workers.entry(id.clone()).or_insert_with(|| WorkerEntry::new(now));
    if req.hostname.is_some() {
      entry.hostname = req.hostname;
    }
    if !req.resources.is_empty() {
      entry.resources = req.resources;
    }
    entry.last_seen_at = now;
    info!(worker_id = %id, hostname = ?entry.hostname, "Worker registered");
    id
  }

  pub async fn heartbeat(&self, req: HeartbeatRequest, now: DateTime<Utc>) {
    let mut workers = self.workers.write().await;
    let entry = workers.entry(req.id.clone()).or_insert_with(|| {
      info!(worker_id = %req.id, "Heartbeat from unregistered worker, registering");
      WorkerEntry::new(now)
    });
    entry.last_seen_at = now;
    entry.heartbeats += 1;
    if req.status.is_some() {
      entry.reported_status = req.status;
    }
    if req.load.is_some() {
      entry.load = req.load;
    }
    if req.hostname.is_some() {
      entry.hostname = req.hostname;
    }
    debug!(worker_id = %req.id, "Heartbeat");
  }

  /// Records contact from a worker that has not necessarily registered.
  pub async fn touch(&self, worker_id: &str, now: DateTime<Utc>) {
    let mut workers = self.workers.write().await;
    match workers.get_mut(worker_id) {
      Some(entry) => entry.last_seen_at = now,
      None => {
        info!(worker_id, "First contact from worker, registering");
        workers.insert(worker_id.to_string(), WorkerEntry::new(now));
      }
    }
  }

  fn snapshot(&self, id: &str, entry: &WorkerEntry, now: DateTime<Utc>) -> WorkerSnapshot {
    let status = if now - entry.last_seen_at > to_chrono(self.stale_after) {
      WorkerStatus::Stale
    } else {
      WorkerStatus::Ready
    };
    WorkerSnapshot {
      id: id.to_string(),
      hostname: entry.hostname.clone(),
      resources: entry.resources.clone(),
      reported_status: entry.reported_status.clone(),
      load: entry.load.clone(),
      registered_at: entry.registered_at,
      last_seen_at: entry.last_seen_at,
      heartbeats: entry.heartbeats,
      status,
    }
  }

  pub async fn contains(&self, worker_id: &str) -> bool {
    self.workers.read().await.contains_key(worker_id)
  }

  pub async fn get(&self, worker_id: &str, now: DateTime<Utc>) -> Option<WorkerSnapshot> {
    let workers = self.workers.read().await;
    workers.get(worker_id).map(|entry| self.snapshot(worker_id, entry, now))
  }

  pub async fn list(&self, now: DateTime<Utc>) -> Vec<WorkerSnapshot> {
    let workers = self.workers.read().await;
    let mut out: Vec<_> = workers.iter().map(|(id, entry)| self.snapshot(id, entry, now)).collect();
    out.sort_by(|a, b| a.id.cmp(&b.id));
    out
  }

  pub async fn ready_ids(&self, now: DateTime<Utc>) -> Vec<String> {
    self
      .list(now)
      .await
      .into_iter()
      .filter(|w| w.status == WorkerStatus::Ready)
      .map(|w| w.id)
      .collect()
  }

  /// Housekeeping: forget workers silent for longer than `older_than`.
  /// Returns the pruned ids.
  pub async fn prune_stale(&self, now: DateTime<Utc>, older_than: Duration) -> Vec<String> {
    let horizon = to_chrono(older_than);
    let mut workers = self.workers.write().await;
    let mut pruned = Vec::new();
    workers.retain(|id, entry| {
      let keep = now - entry.last_seen_at <= horizon;
      if !keep {
        info!(worker_id = %id, "Pruning silent worker");
        pruned.push(id.clone());
      }
      keep
    });
    pruned.sort();
    pruned
  }

  pub async fn len(&self) -> usize {
    self.workers.read().await.len()
  }

  pub async fn is_empty(&self) -> bool {
    self.workers.read().await.is_empty()
  }
}
