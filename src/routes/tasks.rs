use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::info;
use warp::http::StatusCode;
use warp::hyper::body::Bytes;
use warp::{Filter, Rejection, Reply};

use super::{Caller, caller, json_reply, parse_body, raw_body, reject, signed_body, with_broker};
use crate::broker::{Broker, ReportOutcome};
use crate::error::BrokerError;
use crate::models::{OkResponse, ResultLookup, ResultReport, ResultView, SubmitBody};

pub fn submit_route(broker: Arc<Broker>) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
  warp::path!("api" / "task")
    .and(warp::post())
    .and(caller())
    .and(raw_body())
    .and(with_broker(broker))
    .and_then(handle_submit)
}

pub fn claim_route(broker: Arc<Broker>) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
  warp::path!("api" / "task")
    .and(warp::get())
    .and(caller())
    .and(warp::query::<HashMap<String, String>>())
    .and(with_broker(broker))
    .and_then(handle_claim)
}

pub fn report_route(broker: Arc<Broker>) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
  warp::path!("api" / "result")
    .and(warp::post())
    .and(caller())
    .and(signed_body())
    .and(with_broker(broker))
    .and_then(handle_report)
}

pub fn result_route(broker: Arc<Broker>) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
  warp::path!("api" / "result" / String)
    .and(warp::get())
    .and(caller())
    .and(with_broker(broker))
    .and_then(handle_result)
}

pub fn results_route(broker: Arc<Broker>) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
  warp::path!("api" / "results")
    .and(warp::get())
    .and(caller())
    .and(warp::query::<HashMap<String, String>>())
    .and(with_broker(broker))
    .and_then(handle_results)
}

async fn handle_submit(caller: Caller, body: Bytes, broker: Arc<Broker>) -> Result<warp::reply::Response, Rejection> {
  broker.authenticate(caller.auth.as_deref(), "submit", caller.remote).map_err(reject)?;
  let submit: SubmitBody = parse_body(&body).map_err(reject)?;
  let response = broker.submit(submit).await.map_err(reject)?;
  Ok(json_reply(&response, StatusCode::OK))
}

async fn handle_claim(
  caller: Caller,
  query: HashMap<String, String>,
  broker: Arc<Broker>,
) -> Result<warp::reply::Response, Rejection> {
  broker.authenticate(caller.auth.as_deref(), "claim", caller.remote).map_err(reject)?;
  let worker_id = query
    .get("worker")
    .ok_or_else(|| reject(BrokerError::BadRequest("worker query parameter is required".into())))?;

  match broker.claim(worker_id).await.map_err(reject)? {
    Some(task) => Ok(json_reply(&task, StatusCode::OK)),
    None => Ok(warp::reply::with_status(warp::reply(), StatusCode::NO_CONTENT).into_response()),
  }
}

async fn handle_report(
  caller: Caller,
  body: Bytes,
  signature: Option<String>,
  broker: Arc<Broker>,
) -> Result<warp::reply::Response, Rejection> {
  broker.authenticate(caller.auth.as_deref(), "result", caller.remote).map_err(reject)?;
  broker.verify_signed(&body, signature.as_deref(), "result", caller.remote).map_err(reject)?;
  let report: ResultReport = parse_body(&body).map_err(reject)?;
  let task_id = report.task_id.clone();
  if broker.report(report).await.map_err(reject)? == ReportOutcome::Ignored {
    info!(task_id = %task_id, "Acknowledged result that did not win");
  }
  Ok(json_reply(&OkResponse::ok(), StatusCode::OK))
}

async fn handle_result(task_id: String, caller: Caller, broker: Arc<Broker>) -> Result<warp::reply::Response, Rejection> {
  broker.authenticate(caller.auth.as_deref(), "result", caller.remote).map_err(reject)?;
  let lookup = broker.result(&task_id).await.map_err(reject)?;
  let view = ResultView::from(&lookup);
  let status = match lookup {
    ResultLookup::Ready(_) => StatusCode::OK,
    ResultLookup::Queued | ResultLookup::Processing => StatusCode::ACCEPTED,
    ResultLookup::Unknown => {
      return Ok(json_reply(&json!({"taskId": task_id, "status": "unknown"}), StatusCode::NOT_FOUND));
    }
  };
  Ok(json_reply(&view, status))
}

async fn handle_results(
  caller: Caller,
  query: HashMap<String, String>,
  broker: Arc<Broker>,
) -> Result<warp::reply::Response, Rejection> {
  broker.authenticate(caller.auth.as_deref(), "results", caller.remote).map_err(reject)?;
  let raw = query
    .get("ids")
    .ok_or_else(|| reject(BrokerError::BadRequest("ids query parameter is required".into())))?;
  let ids: Vec<String> = raw
    .split(',')
    .map(str::trim)
    .filter(|id| !id.is_empty())
    .map(str::to_string)
    .collect();

  let lookups = broker.results(&ids).await.map_err(reject)?;
  let views: BTreeMap<String, ResultView> =
    lookups.iter().map(|(id, lookup)| (id.clone(), ResultView::from(lookup))).collect();
  Ok(json_reply(&views, StatusCode::OK))
}
