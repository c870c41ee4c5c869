use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use crate::models::{Outcome, ResultRecord};
use crate::task_queue::deadline;

/// Completed outcomes waiting to be collected. Entries disappear when taken
/// or when their TTL runs out, whichever comes first.
pub struct ResultStore {
  entries: Mutex<HashMap<String, ResultRecord>>,
  ttl: Duration,
}

impl ResultStore {
  pub fn new(ttl: Duration) -> Self {
    Self { entries: Mutex::new(HashMap::new()), ttl }
  }

  pub fn ttl(&self) -> Duration {
    self.ttl
  }

  /// Stores an outcome. A live record for the same task is never replaced.
  pub async fn put(
    &self,
    task_id: &str,
    worker_id: Option<String>,
    outcome: Outcome,
    now: DateTime<Utc>,
  ) -> bool {
    let mut entries = self.entries.lock().await;
    if entries.get(task_id).is_some_and(|r| r.expires_at > now) {
      debug!(task_id, "Result already stored, keeping first");
      return false;
    }
    entries.insert(
      task_id.to_string(),
      ResultRecord {
        task_id: task_id.to_string(),
        worker_id,
        outcome,
        completed_at: now,
        expires_at: deadline(now, self.ttl),
      },
    );
    true
  }

  /// Whether an unexpired, unconsumed outcome exists for `task_id`.
  pub async fn holds(&self, task_id: &str, now: DateTime<Utc>) -> bool {
    self.entries.lock().await.get(task_id).is_some_and(|r| r.expires_at > now)
  }

  pub async fn take(&self, task_id: &str, now: DateTime<Utc>) -> Option<ResultRecord> {
    let mut entries = self.entries.lock().await;
    entries.remove(task_id).filter(|r| r.expires_at > now)
  }

  pub async fn take_batch(&self, task_ids: &[String], now: DateTime<Utc>) -> HashMap<String, ResultRecord> {
    let mut entries = self.entries.lock().await;
    task_ids
      .iter()
      .filter_map(|id| entries.remove(id))
      .filter(|r| r.expires_at > now)
      .map(|r| (r.task_id.clone(), r))
      .collect()
  }

  pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
    let mut entries = self.entries.lock().await;
    let before = entries.len();
    entries.retain(|_, r| r.expires_at > now);
    before - entries.len()
  }

  pub async fn len(&self) -> usize {
    self.entries.lock().await.len()
  }

  pub async fn is_empty(&self) -> bool {
    self.entries.lock().await.is_empty()
  }
}
