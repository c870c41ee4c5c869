use thiserror::Error;
use warp::http::StatusCode;

#[derive(Debug, Error)]
pub enum BrokerError {
  #[error("unauthorized")]
  Unauthorized,

  #[error("invalid request signature")]
  BadSignature,

  #[error("bad request: {0}")]
  BadRequest(String),

  #[error("task {0} already exists")]
  DuplicateTask(String),
}

impl BrokerError {
  pub fn status(&self) -> StatusCode {
    match self {
      BrokerError::Unauthorized | BrokerError::BadSignature => StatusCode::UNAUTHORIZED,
      BrokerError::BadRequest(_) | BrokerError::DuplicateTask(_) => StatusCode::BAD_REQUEST,
    }
  }

  pub fn code(&self) -> &'static str {
    match self {
      BrokerError::Unauthorized => "unauthorized",
      BrokerError::BadSignature => "bad_signature",
      BrokerError::BadRequest(_) => "bad_request",
      BrokerError::DuplicateTask(_) => "duplicate_task",
    }
  }
}

impl warp::reject::Reject for BrokerError {}

pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// Failures seen by the worker side when talking to a broker.
#[derive(Debug, Error)]
pub enum ClientError {
  #[error("all broker endpoints failed, last error: {0}")]
  Unreachable(String),

  #[error("broker rejected credentials")]
  Unauthorized,

  #[error("broker answered {status}: {body}")]
  Rejected { status: u16, body: String },

  #[error("could not decode broker response: {0}")]
  Decode(String),
}

impl ClientError {
  /// Transient errors are retried and count towards failover; the rest are
  /// configuration or protocol problems that retrying will not fix.
  pub fn is_transient(&self) -> bool {
    matches!(self, ClientError::Unreachable(_))
  }
}
