//! Worker/submitter side of the broker protocol.
//!
//! Endpoints are tried in priority order, but the last endpoint that
//! answered stays first in line until it fails (sticky failover).

use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_retry::RetryIf;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{debug, info, warn};

use crate::error::ClientError;
use crate::models::{
  ClaimedTask, HeartbeatRequest, NewTask, RegisterRequest, RegisterResponse, ResultReport, ResultView,
  SubmitResponse,
};
use crate::signing::{self, SIGNATURE_HEADER};

const RETRY_BASE_MS: u64 = 100;
const RETRY_MAX_DELAY: Duration = Duration::from_secs(5);

pub type ClientResult<T> = std::result::Result<T, ClientError>;

pub struct BrokerClient {
  http: reqwest::Client,
  endpoints: Vec<String>,
  active: AtomicUsize,
  secret: String,
}

impl BrokerClient {
  pub fn new(endpoints: Vec<String>, secret: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
    if endpoints.is_empty() {
      anyhow::bail!("at least one broker endpoint is required");
    }
    let http = reqwest::Client::builder().timeout(timeout).build()?;
    Ok(Self {
      http,
      endpoints: endpoints.into_iter().map(|e| e.trim_end_matches('/').to_string()).collect(),
      active: AtomicUsize::new(0),
      secret: secret.into(),
    })
  }

  pub fn active_endpoint(&self) -> &str {
    &self.endpoints[self.active.load(Ordering::Relaxed) % self.endpoints.len()]
  }

  /// Sticky endpoint first, then the rest by priority.
  fn attempt_order(&self) -> Vec<usize> {
    let active = self.active.load(Ordering::Relaxed) % self.endpoints.len();
    std::iter::once(active).chain((0..self.endpoints.len()).filter(|i| *i != active)).collect()
  }

  async fn send(&self, method: Method, path: &str, body: Option<Vec<u8>>, signed: bool) -> ClientResult<Response> {
    let signature = match (&body, signed) {
      (Some(bytes), true) => Some(signing::sign(&self.secret, bytes)),
      _ => None,
    };

    let mut last_error = String::from("no endpoints tried");
    for idx in self.attempt_order() {
      let url = format!("{}{}", self.endpoints[idx], path);
      let mut req: RequestBuilder = self.http.request(method.clone(), &url).bearer_auth(&self.secret);
      if let Some(bytes) = &body {
        req = req.header(reqwest::header::CONTENT_TYPE, "application/json").body(bytes.clone());
      }
      if let Some(sig) = &signature {
        req = req.header(SIGNATURE_HEADER, sig);
      }

      match req.send().await {
        Ok(resp) if resp.status().is_server_error() => {
          last_error = format!("{} answered {}", url, resp.status());
          warn!(endpoint = %self.endpoints[idx], status = %resp.status(), "Broker error, trying next endpoint");
        }
        Ok(resp) => {
          let previous = self.active.swap(idx, Ordering::Relaxed);
          if previous != idx {
            info!(endpoint = %self.endpoints[idx], "Failed over to broker endpoint");
          }
          return Ok(resp);
        }
        Err(e) => {
          last_error = format!("{}: {}", url, e);
          warn!(endpoint = %self.endpoints[idx], error = %e, "Broker unreachable");
        }
      }
    }
    Err(ClientError::Unreachable(last_error))
  }

  async fn send_json<B: Serialize>(&self, path: &str, body: &B, signed: bool) -> ClientResult<Response> {
    let bytes = serde_json::to_vec(body).map_err(|e| ClientError::Decode(e.to_string()))?;
    self.send(Method::POST, path, Some(bytes), signed).await
  }

  async fn check(resp: Response) -> ClientResult<Response> {
    let status = resp.status();
    if status == StatusCode::UNAUTHORIZED {
      return Err(ClientError::Unauthorized);
    }
    if status.is_client_error() {
      let body = resp.text().await.unwrap_or_default();
      return Err(ClientError::Rejected { status: status.as_u16(), body });
    }
    Ok(resp)
  }

  async fn decode<T: DeserializeOwned>(resp: Response) -> ClientResult<T> {
    resp.json().await.map_err(|e| ClientError::Decode(e.to_string()))
  }

  pub async fn register(&self, req: &RegisterRequest) -> ClientResult<String> {
    let resp = Self::check(self.send_json("/api/swarm/register", req, false).await?).await?;
    let body: RegisterResponse = Self::decode(resp).await?;
    Ok(body.worker_id)
  }

  pub async fn claim(&self, worker_id: &str) -> ClientResult<Option<ClaimedTask>> {
    let path = format!("/api/task?worker={}", worker_id);
    let resp = Self::check(self.send(Method::GET, &path, None, false).await?).await?;
    if resp.status() == StatusCode::NO_CONTENT {
      return Ok(None);
    }
    Ok(Some(Self::decode(resp).await?))
  }

  pub async fn heartbeat(&self, req: &HeartbeatRequest) -> ClientResult<()> {
    Self::check(self.send_json("/api/swarm/heartbeat", req, true).await?).await?;
    Ok(())
  }

  pub async fn report(&self, report: &ResultReport) -> ClientResult<()> {
    Self::check(self.send_json("/api/result", report, true).await?).await?;
    Ok(())
  }

  /// Posts a result, retrying transient failures with exponential backoff.
  pub async fn report_with_retry(&self, report: &ResultReport, retries: usize) -> ClientResult<()> {
    let strategy = ExponentialBackoff::from_millis(RETRY_BASE_MS).max_delay(RETRY_MAX_DELAY).take(retries);
    RetryIf::start(
      strategy,
      || async {
        let outcome = self.report(report).await;
        if let Err(e) = &outcome {
          debug!(task_id = %report.task_id, error = %e, "Result delivery attempt failed");
        }
        outcome
      },
      |e: &ClientError| e.is_transient(),
    )
    .await
  }

  pub async fn submit(&self, tasks: &[NewTask]) -> ClientResult<SubmitResponse> {
    let body = serde_json::json!({ "tasks": tasks });
    let resp = Self::check(self.send_json("/api/task", &body, false).await?).await?;
    Self::decode(resp).await
  }

  /// `None` while the task is still queued or running.
  pub async fn fetch_result(&self, task_id: &str) -> ClientResult<Option<ResultView>> {
    let resp = self.send(Method::GET, &format!("/api/result/{}", task_id), None, false).await?;
    match resp.status() {
      StatusCode::ACCEPTED => Ok(None),
      StatusCode::NOT_FOUND => Err(ClientError::Rejected { status: 404, body: format!("unknown task {}", task_id) }),
      _ => Ok(Some(Self::decode(Self::check(resp).await?).await?)),
    }
  }
}
