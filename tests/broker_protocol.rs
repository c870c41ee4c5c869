use chrono::Duration;
use serde_json::{Value, json};
use std::convert::Infallible;
use std::sync::Arc;
use swarmq::broker::Broker;
use swarmq::clock::ManualClock;
use swarmq::config::BrokerConfig;
use swarmq::routes::routes;
use swarmq::signing;
use swarmq::telemetry::{RecordingTelemetry, SecurityEventKind};
use warp::http::StatusCode;
use warp::{Filter, Reply};

const SECRET: &str = "swarm-secret";

struct Harness {
  broker: Arc<Broker>,
  clock: Arc<ManualClock>,
  telemetry: Arc<RecordingTelemetry>,
}

fn harness_with(config: BrokerConfig) -> Harness {
  let clock = Arc::new(ManualClock::default());
  let telemetry = Arc::new(RecordingTelemetry::default());
  let broker = Arc::new(Broker::new(config).with_clock(clock.clone()).with_telemetry(telemetry.clone()));
  Harness { broker, clock, telemetry }
}

fn harness() -> Harness {
  harness_with(BrokerConfig::new(SECRET))
}

async fn call<F, R>(api: &F, req: warp::test::RequestBuilder) -> (StatusCode, Value)
where
  F: Filter<Extract = (R,), Error = Infallible> + 'static,
  R: Reply,
{
  let resp = req.reply(api).await;
  let body = if resp.body().is_empty() { Value::Null } else { serde_json::from_slice(resp.body()).unwrap() };
  (resp.status(), body)
}

fn get(path: &str) -> warp::test::RequestBuilder {
  warp::test::request().method("GET").path(path).header("authorization", format!("Bearer {}", SECRET))
}

fn post(path: &str, body: &Value) -> warp::test::RequestBuilder {
  warp::test::request()
    .method("POST")
    .path(path)
    .header("authorization", format!("Bearer {}", SECRET))
    .header("content-type", "application/json")
    .body(serde_json::to_vec(body).unwrap())
}

fn signed_post(path: &str, body: &Value) -> warp::test::RequestBuilder {
  let bytes = serde_json::to_vec(body).unwrap();
  let signature = signing::sign(SECRET, &bytes);
  warp::test::request()
    .method("POST")
    .path(path)
    .header("authorization", format!("Bearer {}", SECRET))
    .header("content-type", "application/json")
    .header("x-signature", signature)
    .body(bytes)
}

fn result_body(task: &Value, worker: &str, result: Value) -> Value {
  json!({
    "taskId": task["id"],
    "workerId": worker,
    "leaseId": task["leaseId"],
    "result": result,
  })
}

#[tokio::test]
async fn three_tasks_are_claimed_in_order_then_no_content() {
  let h = harness();
  let api = routes(h.broker.clone());

  let (status, body) = call(
    &api,
    post(
      "/api/task",
      &json!({"tasks": [
        {"id": "a", "payload": 1},
        {"id": "b", "payload": 2},
        {"id": "c", "payload": 3},
      ]}),
    ),
  )
  .await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(body["taskIds"], json!(["a", "b", "c"]));
  assert_eq!(body["queued"], 3);

  for expected in ["a", "b", "c"] {
    let (status, task) = call(&api, get("/api/task?worker=w1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(task["id"], expected);
    assert_eq!(task["type"], "default");
    assert_eq!(task["attempt"], 1);
  }

  let (status, body) = call(&api, get("/api/task?worker=w1")).await;
  assert_eq!(status, StatusCode::NO_CONTENT);
  assert_eq!(body, Value::Null);

  call(&api, post("/api/task", &json!({"id": "d", "payload": 4}))).await;
  let (status, task) = call(&api, get("/api/task?worker=w1")).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(task["id"], "d");
}

#[tokio::test]
async fn expired_lease_goes_to_the_next_worker() {
  let h = harness();
  let api = routes(h.broker.clone());
  call(&api, post("/api/task", &json!({"id": "t1", "payload": {"q": 1}}))).await;

  let (_, first) = call(&api, get("/api/task?worker=w1")).await;
  let (status, _) = call(&api, get("/api/task?worker=w2")).await;
  assert_eq!(status, StatusCode::NO_CONTENT);

  h.clock.advance(Duration::seconds(121));
  let report = h.broker.sweep().await;
  assert_eq!(report.reclaimed, vec!["t1"]);

  let (status, second) = call(&api, get("/api/task?worker=w2")).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(second["id"], "t1");
  assert_eq!(second["attempt"], 2);
  assert_ne!(second["leaseId"], first["leaseId"]);

  // w1 finally answers on its expired lease.
  let (status, ack) = call(&api, signed_post("/api/result", &result_body(&first, "w1", json!("late")))).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(ack, json!({"ok": true}));
  let (status, pending) = call(&api, get("/api/result/t1")).await;
  assert_eq!(status, StatusCode::ACCEPTED);
  assert_eq!(pending["status"], "processing");

  call(&api, signed_post("/api/result", &result_body(&second, "w2", json!("fresh")))).await;
  let (status, ready) = call(&api, get("/api/result/t1")).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(ready["result"], "fresh");
  assert_eq!(ready["workerId"], "w2");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_workers_get_exactly_one_lease() {
  let h = harness();
  let api = routes(h.broker.clone());
  call(&api, post("/api/task", &json!({"id": "only", "payload": null}))).await;

  let (a, b) = tokio::join!(call(&api, get("/api/task?worker=w1")), call(&api, get("/api/task?worker=w2")));
  let mut statuses = vec![a.0, b.0];
  statuses.sort();
  assert_eq!(statuses, vec![StatusCode::OK, StatusCode::NO_CONTENT]);
}

#[tokio::test]
async fn first_accepted_result_wins() {
  let h = harness();
  let api = routes(h.broker.clone());
  call(&api, post("/api/task", &json!({"id": "t1", "payload": {}}))).await;
  let (_, task) = call(&api, get("/api/task?worker=w1")).await;

  call(&api, signed_post("/api/result", &result_body(&task, "w1", json!("first")))).await;
  let (status, ack) = call(&api, signed_post("/api/result", &result_body(&task, "w1", json!("second")))).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(ack["ok"], true);

  let (_, view) = call(&api, get("/api/result/t1")).await;
  assert_eq!(view["result"], "first");
}

#[tokio::test]
async fn null_result_is_accepted_and_served() {
  let h = harness();
  let api = routes(h.broker.clone());
  call(&api, post("/api/task", &json!({"id": "t1", "payload": {}}))).await;
  let (_, task) = call(&api, get("/api/task?worker=w1")).await;

  let (status, ack) = call(&api, signed_post("/api/result", &result_body(&task, "w1", Value::Null))).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(ack["ok"], true);

  let (status, view) = call(&api, get("/api/result/t1")).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(view.get("result"), Some(&Value::Null));
  assert_eq!(h.broker.status().await.queue.active, 0);
}

#[tokio::test]
async fn reused_id_waits_for_its_old_result_to_be_consumed() {
  let h = harness();
  let api = routes(h.broker.clone());
  call(&api, post("/api/task", &json!({"id": "t1", "payload": 1}))).await;
  let (_, task) = call(&api, get("/api/task?worker=w1")).await;
  call(&api, signed_post("/api/result", &result_body(&task, "w1", json!("old")))).await;

  let (status, err) = call(&api, post("/api/task", &json!({"id": "t1", "payload": 2}))).await;
  assert_eq!(status, StatusCode::BAD_REQUEST);
  assert_eq!(err["code"], "duplicate_task");

  let (_, old) = call(&api, get("/api/result/t1")).await;
  assert_eq!(old["result"], "old");

  let (status, _) = call(&api, post("/api/task", &json!({"id": "t1", "payload": 2}))).await;
  assert_eq!(status, StatusCode::OK);
  let (status, pending) = call(&api, get("/api/result/t1")).await;
  assert_eq!(status, StatusCode::ACCEPTED);
  assert_eq!(pending["status"], "queued");
}

#[tokio::test]
async fn rejected_batch_submits_nothing() {
  let h = harness();
  let api = routes(h.broker.clone());
  let (status, err) =
    call(&api, post("/api/task", &json!({"tasks": [{"id": "a", "payload": 1}, {"id": "a", "payload": 2}]}))).await;
  assert_eq!(status, StatusCode::BAD_REQUEST);
  assert_eq!(err["code"], "duplicate_task");
  let (status, _) = call(&api, get("/api/task?worker=w1")).await;
  assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn results_expire_after_their_ttl() {
  let mut config = BrokerConfig::new(SECRET);
  config.result_ttl = std::time::Duration::from_secs(1);
  let h = harness_with(config);
  let api = routes(h.broker.clone());

  call(&api, post("/api/task", &json!({"id": "t1", "payload": {}}))).await;
  let (_, task) = call(&api, get("/api/task?worker=w1")).await;
  call(&api, signed_post("/api/result", &result_body(&task, "w1", json!(42)))).await;

  h.clock.advance(Duration::seconds(2));
  let (status, body) = call(&api, get("/api/result/t1")).await;
  assert_eq!(status, StatusCode::NOT_FOUND);
  assert_eq!(body, json!({"taskId": "t1", "status": "unknown"}));
}

#[tokio::test]
async fn failure_results_carry_the_error() {
  let h = harness();
  let api = routes(h.broker.clone());
  call(&api, post("/api/task", &json!({"id": "t1", "payload": {}}))).await;
  let (_, task) = call(&api, get("/api/task?worker=w1")).await;

  let body = json!({"taskId": "t1", "workerId": "w1", "leaseId": task["leaseId"], "error": "model crashed"});
  call(&api, signed_post("/api/result", &body)).await;

  let (status, view) = call(&api, get("/api/result/t1")).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(view["error"], "model crashed");
  assert!(view.get("result").is_none());
  assert_eq!(h.broker.status().await.queue.failed, 1);
}

#[tokio::test]
async fn bad_signature_is_rejected_before_the_registry_is_touched() {
  let h = harness();
  let api = routes(h.broker.clone());

  let body = json!({"id": "w1", "status": "idle"});
  let req = warp::test::request()
    .method("POST")
    .path("/api/swarm/heartbeat")
    .header("authorization", format!("Bearer {}", SECRET))
    .header("x-signature", signing::sign("not-the-secret", &serde_json::to_vec(&body).unwrap()))
    .body(serde_json::to_vec(&body).unwrap());
  let (status, err) = call(&api, req).await;
  assert_eq!(status, StatusCode::UNAUTHORIZED);
  assert_eq!(err["code"], "bad_signature");
  assert!(h.broker.status().await.workers.is_empty());

  let (status, _) = call(&api, post("/api/swarm/heartbeat", &body)).await;
  assert_eq!(status, StatusCode::UNAUTHORIZED);

  let kinds: Vec<_> = h.telemetry.events().into_iter().map(|e| e.kind).collect();
  assert_eq!(kinds, vec![SecurityEventKind::BadSignature, SecurityEventKind::BadSignature]);

  let (status, _) = call(&api, signed_post("/api/swarm/heartbeat", &body)).await;
  assert_eq!(status, StatusCode::OK);
  assert!(h.broker.status().await.workers.contains_key("w1"));
}

#[tokio::test]
async fn wrong_secret_is_unauthorized_everywhere() {
  let h = harness();
  let api = routes(h.broker.clone());

  let req = warp::test::request().method("GET").path("/api/status").header("authorization", "Bearer guess");
  let (status, err) = call(&api, req).await;
  assert_eq!(status, StatusCode::UNAUTHORIZED);
  assert_eq!(err["code"], "unauthorized");

  let req = warp::test::request()
    .method("POST")
    .path("/api/task")
    .body(serde_json::to_vec(&json!({"payload": 1})).unwrap());
  let (status, _) = call(&api, req).await;
  assert_eq!(status, StatusCode::UNAUTHORIZED);
  assert_eq!(h.broker.status().await.queue.submitted, 0);

  let kinds: Vec<_> = h.telemetry.events().into_iter().map(|e| e.kind).collect();
  assert_eq!(kinds, vec![SecurityEventKind::BadSecret, SecurityEventKind::BadSecret]);
}

#[tokio::test]
async fn batch_lookup_mixes_ready_pending_and_unknown() {
  let h = harness();
  let api = routes(h.broker.clone());
  call(&api, post("/api/task", &json!({"tasks": [{"id": "a", "payload": 1}, {"id": "b", "payload": 2}]}))).await;
  let (_, a) = call(&api, get("/api/task?worker=w1")).await;
  call(&api, signed_post("/api/result", &result_body(&a, "w1", json!("done")))).await;

  let (status, views) = call(&api, get("/api/results?ids=a,b,zzz")).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(views["a"]["result"], "done");
  assert_eq!(views["b"]["status"], "queued");
  assert_eq!(views["zzz"]["status"], "unknown");

  // Ready results are consumed by the lookup.
  let (_, again) = call(&api, get("/api/results?ids=a")).await;
  assert_eq!(again["a"]["status"], "unknown");
}

#[tokio::test]
async fn status_reports_counts_and_workers() {
  let h = harness();
  let api = routes(h.broker.clone());
  call(&api, post("/api/swarm/register", &json!({"id": "w1", "hostname": "gpu-1", "gpus": 2}))).await;
  call(&api, post("/api/task", &json!({"tasks": [{"payload": 1}, {"payload": 2}]}))).await;
  call(&api, get("/api/task?worker=w1")).await;

  let (status, body) = call(&api, get("/api/status")).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(body["submitted"], 2);
  assert_eq!(body["queued"], 1);
  assert_eq!(body["active"], 1);
  assert_eq!(body["results"], 0);
  assert_eq!(body["workers"]["w1"]["hostname"], "gpu-1");
  assert_eq!(body["workers"]["w1"]["resources"]["gpus"], 2);
  assert_eq!(body["workers"]["w1"]["status"], "ready");

  h.clock.advance(Duration::seconds(31));
  let (_, body) = call(&api, get("/api/status")).await;
  assert_eq!(body["workers"]["w1"]["status"], "stale");
}

#[tokio::test]
async fn broadcast_reaches_each_target_once() {
  let h = harness();
  let api = routes(h.broker.clone());
  for id in ["w1", "w2"] {
    call(&api, post("/api/swarm/register", &json!({"id": id}))).await;
  }
  let (status, body) = call(
    &api,
    post("/api/swarm/broadcast", &json!({"type": "reload", "workerIds": ["w1", "w2"], "payload": {"v": 3}})),
  )
  .await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(body["targets"], 2);

  let (_, task) = call(&api, get("/api/task?worker=w1")).await;
  assert_eq!(task["type"], "reload");
  assert_eq!(task["payload"], json!({"v": 3}));
  let (status, _) = call(&api, get("/api/task?worker=w1")).await;
  assert_eq!(status, StatusCode::NO_CONTENT);
  let (status, _) = call(&api, get("/api/task?worker=w2")).await;
  assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn malformed_requests_are_bad_requests() {
  let h = harness();
  let api = routes(h.broker.clone());

  let (status, _) = call(&api, get("/api/task")).await;
  assert_eq!(status, StatusCode::BAD_REQUEST);

  let req = warp::test::request()
    .method("POST")
    .path("/api/task")
    .header("authorization", format!("Bearer {}", SECRET))
    .body("{not json");
  let (status, err) = call(&api, req).await;
  assert_eq!(status, StatusCode::BAD_REQUEST);
  assert_eq!(err["code"], "bad_request");

  call(&api, post("/api/task", &json!({"id": "dup", "payload": 1}))).await;
  let (status, err) = call(&api, post("/api/task", &json!({"id": "dup", "payload": 1}))).await;
  assert_eq!(status, StatusCode::BAD_REQUEST);
  assert_eq!(err["code"], "duplicate_task");

  let (status, _) = call(&api, get("/api/nowhere")).await;
  assert_eq!(status, StatusCode::NOT_FOUND);
}
