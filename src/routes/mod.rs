use serde::Serialize;
use serde::de::DeserializeOwned;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::error;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::broker::Broker;
use crate::error::{BrokerError, BrokerResult};
use crate::signing::{AUTH_HEADER, SIGNATURE_HEADER};

pub mod status;
pub mod swarm;
pub mod tasks;

const MAX_BODY_BYTES: u64 = 1024 * 1024;

pub fn routes(broker: Arc<Broker>) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
  tasks::submit_route(broker.clone())
    .or(tasks::claim_route(broker.clone()))
    .or(tasks::report_route(broker.clone()))
    .or(tasks::result_route(broker.clone()))
    .or(tasks::results_route(broker.clone()))
    .or(swarm::register_route(broker.clone()))
    .or(swarm::heartbeat_route(broker.clone()))
    .or(swarm::broadcast_route(broker.clone()))
    .or(status::status_route(broker))
    .recover(handle_rejection)
}

/// Credentials and origin of a request, checked by the handler before it
/// touches any store.
#[derive(Debug, Clone)]
pub struct Caller {
  pub auth: Option<String>,
  pub remote: Option<SocketAddr>,
}

fn with_broker(broker: Arc<Broker>) -> impl Filter<Extract = (Arc<Broker>,), Error = Infallible> + Clone {
  warp::any().map(move || broker.clone())
}

fn caller() -> impl Filter<Extract = (Caller,), Error = Rejection> + Clone {
  warp::header::optional::<String>(AUTH_HEADER)
    .and(warp::addr::remote())
    .map(|auth, remote| Caller { auth, remote })
}

/// Raw body plus its signature header, for routes that verify an HMAC over
/// exactly the bytes that were sent.
fn signed_body() -> impl Filter<Extract = (warp::hyper::body::Bytes, Option<String>), Error = Rejection> + Clone {
  warp::body::content_length_limit(MAX_BODY_BYTES)
    .and(warp::body::bytes())
    .and(warp::header::optional::<String>(SIGNATURE_HEADER))
}

fn raw_body() -> impl Filter<Extract = (warp::hyper::body::Bytes,), Error = Rejection> + Clone {
  warp::body::content_length_limit(MAX_BODY_BYTES).and(warp::body::bytes())
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> BrokerResult<T> {
  serde_json::from_slice(body).map_err(|e| BrokerError::BadRequest(format!("malformed body: {}", e)))
}

fn reject(err: BrokerError) -> Rejection {
  warp::reject::custom(err)
}

fn json_reply<T: Serialize>(value: &T, status: StatusCode) -> warp::reply::Response {
  warp::reply::with_status(warp::reply::json(value), status).into_response()
}

#[derive(Serialize)]
struct ErrorBody {
  error: String,
  code: &'static str,
}

pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
  let (status, code, message) = if let Some(e) = err.find::<BrokerError>() {
    (e.status(), e.code(), e.to_string())
  } else if err.is_not_found() {
    (StatusCode::NOT_FOUND, "not_found", "route not found".to_string())
  } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
    (StatusCode::PAYLOAD_TOO_LARGE, "too_large", "body too large".to_string())
  } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
    (StatusCode::METHOD_NOT_ALLOWED, "method_not_allowed", "method not allowed".to_string())
  } else if err.find::<warp::reject::InvalidHeader>().is_some()
    || err.find::<warp::reject::InvalidQuery>().is_some()
    || err.find::<warp::reject::LengthRequired>().is_some()
  {
    (StatusCode::BAD_REQUEST, "bad_request", "malformed request".to_string())
  } else {
    error!("Unhandled rejection: {:?}", err);
    (StatusCode::INTERNAL_SERVER_ERROR, "internal", "internal error".to_string())
  };

  Ok(warp::reply::with_status(warp::reply::json(&ErrorBody { error: message, code }), status))
}
