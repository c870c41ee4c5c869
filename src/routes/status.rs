use std::sync::Arc;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use super::{Caller, caller, json_reply, reject, with_broker};
use crate::broker::Broker;

pub fn status_route(broker: Arc<Broker>) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
  warp::path!("api" / "status")
    .and(warp::get())
    .and(caller())
    .and(with_broker(broker))
    .and_then(handle_status)
}

async fn handle_status(caller: Caller, broker: Arc<Broker>) -> Result<warp::reply::Response, Rejection> {
  broker.authenticate(caller.auth.as_deref(), "status", caller.remote).map_err(reject)?;
  Ok(json_reply(&broker.status().await, StatusCode::OK))
}
