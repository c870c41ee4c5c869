use std::sync::Arc;
use warp::http::StatusCode;
use warp::hyper::body::Bytes;
use warp::{Filter, Rejection, Reply};

use super::{Caller, caller, json_reply, parse_body, raw_body, reject, signed_body, with_broker};
use crate::broker::Broker;
use crate::models::{BroadcastRequest, HeartbeatRequest, OkResponse, RegisterRequest, RegisterResponse};

pub fn register_route(broker: Arc<Broker>) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
  warp::path!("api" / "swarm" / "register")
    .and(warp::post())
    .and(caller())
    .and(raw_body())
    .and(with_broker(broker))
    .and_then(handle_register)
}

pub fn heartbeat_route(broker: Arc<Broker>) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
  warp::path!("api" / "swarm" / "heartbeat")
    .and(warp::post())
    .and(caller())
    .and(signed_body())
    .and(with_broker(broker))
    .and_then(handle_heartbeat)
}

pub fn broadcast_route(broker: Arc<Broker>) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
  warp::path!("api" / "swarm" / "broadcast")
    .and(warp::post())
    .and(caller())
    .and(raw_body())
    .and(with_broker(broker))
    .and_then(handle_broadcast)
}

async fn handle_register(caller: Caller, body: Bytes, broker: Arc<Broker>) -> Result<warp::reply::Response, Rejection> {
  broker.authenticate(caller.auth.as_deref(), "register", caller.remote).map_err(reject)?;
  let req: RegisterRequest = parse_body(&body).map_err(reject)?;
  let worker_id = broker.register(req).await.map_err(reject)?;
  Ok(json_reply(&RegisterResponse { ok: true, worker_id }, StatusCode::OK))
}

async fn handle_heartbeat(
  caller: Caller,
  body: Bytes,
  signature: Option<String>,
  broker: Arc<Broker>,
) -> Result<warp::reply::Response, Rejection> {
  broker.authenticate(caller.auth.as_deref(), "heartbeat", caller.remote).map_err(reject)?;
  broker.verify_signed(&body, signature.as_deref(), "heartbeat", caller.remote).map_err(reject)?;
  let req: HeartbeatRequest = parse_body(&body).map_err(reject)?;
  broker.heartbeat(req).await.map_err(reject)?;
  Ok(json_reply(&OkResponse::ok(), StatusCode::OK))
}

async fn handle_broadcast(caller: Caller, body: Bytes, broker: Arc<Broker>) -> Result<warp::reply::Response, Rejection> {
  broker.authenticate(caller.auth.as_deref(), "broadcast", caller.remote).map_err(reject)?;
  let req: BroadcastRequest = parse_body(&body).map_err(reject)?;
  let response = broker.broadcast(req).await.map_err(reject)?;
  Ok(json_reply(&response, StatusCode::OK))
}
