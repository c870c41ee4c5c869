//! Unclaimed/leased task state machine.
//!
//! A task moves Unclaimed -> Leased -> Resulted, with Leased -> Unclaimed on
//! lease expiry. All transitions happen under one mutex, so claim, reclaim
//! and complete never interleave.

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{BrokerError, BrokerResult};
use crate::models::{ClaimedTask, Lease, QueueStats, Task};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
  Queued,
  Processing,
  /// Lease accepted a result, outcome not yet handed to the result store.
  Recording,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
  Accepted(Lease),
  Ignored,
}

#[derive(Debug)]
enum Slot {
  Unclaimed,
  Leased(Lease),
  Resulted,
}

#[derive(Debug)]
struct Entry {
  seq: u64,
  task: Task,
  slot: Slot,
  attempts: u32,
}

#[derive(Debug, Default)]
struct QueueState {
  next_seq: u64,
  tasks: HashMap<String, Entry>,
  /// Unclaimed task ids keyed by submission order.
  unclaimed: BTreeMap<u64, String>,
  leased: usize,
  stats: QueueStats,
}

pub struct TaskQueue {
  state: Mutex<QueueState>,
}

pub(crate) fn to_chrono(d: std::time::Duration) -> Duration {
  Duration::from_std(d).unwrap_or(Duration::MAX)
}

/// `now + d`, saturating instead of panicking on absurd configurations.
pub(crate) fn deadline(now: DateTime<Utc>, d: std::time::Duration) -> DateTime<Utc> {
  now.checked_add_signed(to_chrono(d)).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl TaskQueue {
  pub fn new() -> Self {
    Self { state: Mutex::new(QueueState::default()) }
  }

  pub async fn submit(&self, task: Task) -> BrokerResult<String> {
    let mut ids = self.submit_all(vec![task]).await?;
    ids.pop().ok_or_else(|| BrokerError::BadRequest("no tasks in request".into()))
  }

  /// Queues every task or none: ids already live, or repeated inside the
  /// batch, reject the whole batch.
  pub async fn submit_all(&self, tasks: Vec<Task>) -> BrokerResult<Vec<String>> {
    let mut state = self.state.lock().await;
    {
      let mut seen = HashSet::new();
      for task in &tasks {
        if state.tasks.contains_key(&task.id) || !seen.insert(task.id.as_str()) {
          return Err(BrokerError::DuplicateTask(task.id.clone()));
        }
      }
    }

    let mut ids = Vec::with_capacity(tasks.len());
    for task in tasks {
      let seq = state.next_seq;
      state.next_seq += 1;
      let id = task.id.clone();
      state.unclaimed.insert(seq, id.clone());
      state.tasks.insert(id.clone(), Entry { seq, task, slot: Slot::Unclaimed, attempts: 0 });
      state.stats.submitted += 1;
      debug!(task_id = %id, "Task queued");
      ids.push(id);
    }
    Ok(ids)
  }

  /// Pops the oldest task this worker may take and leases it. `timeout_for`
  /// resolves the lease length for tasks without their own override.
  pub async fn claim<F>(&self, worker_id: &str, now: DateTime<Utc>, timeout_for: F) -> Option<ClaimedTask>
  where
    F: Fn(&Task) -> std::time::Duration,
  {
    let mut state = self.state.lock().await;
    let QueueState { tasks, unclaimed, .. } = &mut *state;

    let seq = unclaimed.iter().find_map(|(seq, id)| {
      let entry = tasks.get(id)?;
      match entry.task.target_worker.as_deref() {
        Some(target) if target != worker_id => None,
        _ => Some(*seq),
      }
    })?;
    let id = unclaimed.remove(&seq)?;
    let entry = tasks.get_mut(&id)?;

    let timeout = entry
      .task
      .lease_timeout_secs
      .map(std::time::Duration::from_secs)
      .unwrap_or_else(|| timeout_for(&entry.task));
    entry.attempts += 1;
    let lease = Lease {
      task_id: id.clone(),
      worker_id: worker_id.to_string(),
      lease_id: Uuid::new_v4().to_string(),
      attempt: entry.attempts,
      claimed_at: now,
      lease_deadline: deadline(now, timeout),
    };
    let claimed = ClaimedTask::from_lease(&entry.task, &lease);
    entry.slot = Slot::Leased(lease);

    state.leased += 1;
    state.stats.claimed += 1;
    info!(task_id = %id, worker_id, attempt = claimed.attempt, "Task leased");
    Some(claimed)
  }

  /// Returns every task whose lease deadline has passed to the unclaimed
  /// pool. The original holder is not told.
  pub async fn reclaim_expired(&self, now: DateTime<Utc>) -> Vec<String> {
    let mut state = self.state.lock().await;
    let QueueState { tasks, unclaimed, .. } = &mut *state;

    let mut reclaimed = Vec::new();
    for (id, entry) in tasks.iter_mut() {
      let expired = matches!(&entry.slot, Slot::Leased(lease) if lease.lease_deadline <= now);
      if expired {
        if let Slot::Leased(lease) = std::mem::replace(&mut entry.slot, Slot::Unclaimed) {
          info!(task_id = %id, worker_id = %lease.worker_id, "Lease expired, task reclaimed");
        }
        unclaimed.insert(entry.seq, id.clone());
        reclaimed.push(id.clone());
      }
    }

    state.leased -= reclaimed.len();
    state.stats.reclaimed += reclaimed.len() as u64;
    reclaimed
  }

  /// Accepts a result only from the current lease holder. Everything else
  /// (expired lease, someone else's lease, already resulted) is ignored so
  /// the first accepted result wins.
  pub async fn complete(
    &self,
    task_id: &str,
    worker_id: Option<&str>,
    lease_id: Option<&str>,
    succeeded: bool,
  ) -> Completion {
    let mut state = self.state.lock().await;
    let Some(entry) = state.tasks.get_mut(task_id) else {
      debug!(task_id, "Result for unknown or retired task ignored");
      return Completion::Ignored;
    };

    let holds_lease = match &entry.slot {
      Slot::Leased(lease) => {
        worker_id.is_none_or(|w| w == lease.worker_id) && lease_id.is_none_or(|l| l == lease.lease_id)
      }
      _ => false,
    };
    if !holds_lease {
      debug!(task_id, worker_id = ?worker_id, "Stale result ignored");
      return Completion::Ignored;
    }

    let Slot::Leased(lease) = std::mem::replace(&mut entry.slot, Slot::Resulted) else {
      return Completion::Ignored;
    };
    state.leased -= 1;
    if succeeded {
      state.stats.completed += 1;
    } else {
      state.stats.failed += 1;
    }
    Completion::Accepted(lease)
  }

  /// Forgets a resulted task once its outcome lives in the result store.
  pub async fn retire(&self, task_id: &str) {
    let mut state = self.state.lock().await;
    if matches!(state.tasks.get(task_id).map(|e| &e.slot), Some(Slot::Resulted)) {
      state.tasks.remove(task_id);
    }
  }

  /// Removes unclaimed tasks addressed to any of `workers`. Leased ones are
  /// left to finish or expire.
  pub async fn drop_targeted(&self, workers: &[String]) -> Vec<String> {
    if workers.is_empty() {
      return Vec::new();
    }
    let mut state = self.state.lock().await;
    let QueueState { tasks, unclaimed, .. } = &mut *state;

    let mut dropped = Vec::new();
    unclaimed.retain(|_, id| {
      let orphaned = tasks.get(id.as_str()).is_some_and(|entry| {
        entry.task.target_worker.as_ref().is_some_and(|target| workers.contains(target))
      });
      if orphaned {
        dropped.push(id.clone());
      }
      !orphaned
    });
    for id in &dropped {
      tasks.remove(id);
      info!(task_id = %id, "Dropped task addressed to a pruned worker");
    }
    dropped
  }

  pub async fn phase(&self, task_id: &str) -> Option<TaskPhase> {
    let state = self.state.lock().await;
    state.tasks.get(task_id).map(|entry| match entry.slot {
      Slot::Unclaimed => TaskPhase::Queued,
      Slot::Leased(_) => TaskPhase::Processing,
      Slot::Resulted => TaskPhase::Recording,
    })
  }

  pub async fn lease(&self, task_id: &str) -> Option<Lease> {
    let state = self.state.lock().await;
    match state.tasks.get(task_id).map(|e| &e.slot) {
      Some(Slot::Leased(lease)) => Some(lease.clone()),
      _ => None,
    }
  }

  pub async fn stats(&self) -> QueueStats {
    let state = self.state.lock().await;
    QueueStats { queued: state.unclaimed.len(), active: state.leased, ..state.stats }
  }
}

impl Default for TaskQueue {
  fn default() -> Self {
    Self::new()
  }
}
