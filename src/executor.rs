//! Task-type handlers. A worker is given an `ExecutorRegistry`; adding a new
//! kind of work means registering another `Executor` under its type tag.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::models::{ClaimedTask, Outcome};

#[async_trait]
pub trait Executor: Send + Sync {
  async fn execute(&self, task: &ClaimedTask) -> Result<Value>;
}

/// Adapts an async closure over the claimed task into an `Executor`.
pub struct FnExecutor<F>(pub F);

#[async_trait]
impl<F, Fut> Executor for FnExecutor<F>
where
  F: Fn(ClaimedTask) -> Fut + Send + Sync,
  Fut: Future<Output = Result<Value>> + Send,
{
  async fn execute(&self, task: &ClaimedTask) -> Result<Value> {
    (self.0)(task.clone()).await
  }
}

pub struct EchoExecutor;

#[async_trait]
impl Executor for EchoExecutor {
  async fn execute(&self, task: &ClaimedTask) -> Result<Value> {
    Ok(task.payload.clone())
  }
}

/// Sleeps for `payload.ms` milliseconds, then echoes the payload.
pub struct SleepExecutor;

#[async_trait]
impl Executor for SleepExecutor {
  async fn execute(&self, task: &ClaimedTask) -> Result<Value> {
    let ms = task
      .payload
      .get("ms")
      .and_then(Value::as_u64)
      .ok_or_else(|| anyhow!("sleep task {} needs a numeric 'ms'", task.id))?;
    info!(task_id = %task.id, ms, "Sleeping");
    tokio::time::sleep(Duration::from_millis(ms)).await;
    Ok(task.payload.clone())
  }
}

#[derive(Default, Clone)]
pub struct ExecutorRegistry {
  handlers: HashMap<String, Arc<dyn Executor>>,
  fallback: Option<Arc<dyn Executor>>,
}

impl ExecutorRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(mut self, kind: impl Into<String>, executor: impl Executor + 'static) -> Self {
    self.handlers.insert(kind.into(), Arc::new(executor));
    self
  }

  pub fn with_fallback(mut self, executor: impl Executor + 'static) -> Self {
    self.fallback = Some(Arc::new(executor));
    self
  }

  pub fn kinds(&self) -> Vec<String> {
    let mut kinds: Vec<_> = self.handlers.keys().cloned().collect();
    kinds.sort();
    kinds
  }

  fn handler(&self, kind: &str) -> Option<Arc<dyn Executor>> {
    self.handlers.get(kind).or(self.fallback.as_ref()).cloned()
  }

  /// Runs the task and folds any error into a `Failure` outcome.
  pub async fn run(&self, task: &ClaimedTask) -> Outcome {
    let Some(executor) = self.handler(&task.kind) else {
      return Outcome::Failure(format!("unsupported task type: {}", task.kind));
    };
    match executor.execute(task).await {
      Ok(value) => Outcome::Success(value),
      Err(e) => Outcome::Failure(format!("{:#}", e)),
    }
  }
}
