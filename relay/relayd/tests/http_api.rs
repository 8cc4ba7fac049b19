use std::net::SocketAddr;
use std::sync::Arc;

use relay_core::{CommandQueue, DispatchMode, MemoryQueue, RelayConfig, RelayService};
use relay_spec::{
    canonical_message, sign_message, unix_now, CommandState, SharedSecret, SignedOperation,
    WebhookVerifier, MAX_RESULT_CHARS,
};
use relayd::http::{WEBHOOK_EVENT_HEADER, WEBHOOK_SIGNATURE_HEADER};
use relayd::{build_router, AppState, RelayMetrics};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tokio::task::JoinHandle;

const SECRET: &str = "relay-test-secret";
const HOOK_SECRET: &str = "relay-hook-secret";

fn config(dispatch: DispatchMode, webhook: bool) -> RelayConfig {
    RelayConfig {
        agent_secret: SharedSecret::new(SECRET),
        webhook_secret: if webhook {
            SharedSecret::new(HOOK_SECRET)
        } else {
            None
        },
        agents: ["suna"].into_iter().collect(),
        dispatch,
        ..RelayConfig::default()
    }
}

async fn start_server(config: RelayConfig) -> (SocketAddr, JoinHandle<()>) {
    let (addr, handle, _) = start_server_with_queue(config).await;
    (addr, handle)
}

async fn start_server_with_queue(config: RelayConfig) -> (SocketAddr, JoinHandle<()>, MemoryQueue) {
    let queue = MemoryQueue::new();
    let service = RelayService::new(&config, Arc::new(queue.clone()));
    let metrics = RelayMetrics::new(service.webhook_configured()).expect("metrics");
    let state = Arc::new(AppState::new(service, metrics, config.dispatch));
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    let handle = tokio::spawn(async move {
        axum::serve(listener, build_router(state)).await.unwrap();
    });
    (addr, handle, queue)
}

fn sig(agent: &str, op: SignedOperation<'_>, ts: i64) -> String {
    let secret = SharedSecret::new(SECRET).unwrap();
    sign_message(&secret, &canonical_message(agent, &op, ts))
}

async fn submit(client: &Client, addr: SocketAddr, action: &str, payload: &str) -> Value {
    let ts = unix_now();
    let resp = client
        .post(format!("http://{addr}/cmd"))
        .json(&json!({
            "agent": "suna",
            "action": action,
            "payload": payload,
            "ts": ts,
            "sig": sig("suna", SignedOperation::Submit { action, payload }, ts),
        }))
        .send()
        .await
        .expect("submit");
    assert_eq!(resp.status(), StatusCode::OK);
    resp.json().await.expect("json")
}

async fn fetch(client: &Client, addr: SocketAddr) -> Value {
    let ts = unix_now();
    let signature = sig("suna", SignedOperation::FetchNext, ts);
    let resp = client
        .get(format!(
            "http://{addr}/next?agent=suna&ts={ts}&sig={signature}"
        ))
        .send()
        .await
        .expect("next");
    assert_eq!(resp.status(), StatusCode::OK);
    resp.json().await.expect("json")
}

async fn report(client: &Client, addr: SocketAddr, id: u64, result: &str) -> reqwest::Response {
    let ts = unix_now();
    client
        .post(format!("http://{addr}/result"))
        .json(&json!({
            "id": id,
            "result": result,
            "ts": ts.to_string(),
            "sig": sig("suna", SignedOperation::ReportResult { id }, ts),
        }))
        .send()
        .await
        .expect("result")
}

#[tokio::test]
async fn submit_fetch_report_round_trip() {
    let (addr, server) = start_server(config(DispatchMode::Peek, true)).await;
    let client = Client::new();

    let live: Value = client
        .get(format!("http://{addr}/"))
        .send()
        .await
        .expect("root")
        .json()
        .await
        .expect("json");
    assert_eq!(live["status"], "relay is live");

    let queued = submit(&client, addr, "say", "hi").await;
    assert_eq!(queued["status"], "ok");
    assert_eq!(queued["queued"], true);
    assert_eq!(queued["id"], 1);

    let next = fetch(&client, addr).await;
    assert_eq!(next["id"], 1);
    assert_eq!(next["action"], "say");
    assert_eq!(next["payload"], "hi");

    let saved = report(&client, addr, 1, "done").await;
    assert_eq!(saved.status(), StatusCode::OK);
    let saved: Value = saved.json().await.expect("json");
    assert_eq!(saved["saved"], true);

    let empty = fetch(&client, addr).await;
    assert_eq!(empty, json!({"status": "no_pending"}));

    server.abort();
}

#[tokio::test]
async fn fifo_head_is_repeated_until_reported() {
    let (addr, server) = start_server(config(DispatchMode::Peek, true)).await;
    let client = Client::new();
    for action in ["a", "b", "c"] {
        submit(&client, addr, action, "").await;
    }
    for _ in 0..3 {
        assert_eq!(fetch(&client, addr).await["action"], "a");
    }
    report(&client, addr, 1, "ok").await;
    assert_eq!(fetch(&client, addr).await["action"], "b");
    server.abort();
}

#[tokio::test]
async fn claim_dispatch_hides_in_flight_command() {
    let (addr, server) = start_server(config(DispatchMode::Claim, true)).await;
    let client = Client::new();
    submit(&client, addr, "a", "").await;
    submit(&client, addr, "b", "").await;
    assert_eq!(fetch(&client, addr).await["id"], 1);
    assert_eq!(fetch(&client, addr).await["status"], "no_pending");
    report(&client, addr, 1, "ok").await;
    assert_eq!(fetch(&client, addr).await["id"], 2);
    server.abort();
}

#[tokio::test]
async fn rejects_bad_signatures_and_missing_ids() {
    let (addr, server) = start_server(config(DispatchMode::Peek, true)).await;
    let client = Client::new();
    let ts = unix_now();

    let collapsed = sign_message(
        &SharedSecret::new(SECRET).unwrap(),
        &format!("suna.next.{ts}"),
    );
    let resp = client
        .get(format!(
            "http://{addr}/next?agent=suna&ts={ts}&sig={collapsed}"
        ))
        .send()
        .await
        .expect("next");
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["detail"], "Invalid signature");

    let stale = ts - 301;
    let resp = client
        .post(format!("http://{addr}/cmd"))
        .json(&json!({
            "agent": "suna",
            "action": "say",
            "payload": "hi",
            "ts": stale,
            "sig": sig("suna", SignedOperation::Submit { action: "say", payload: "hi" }, stale),
        }))
        .send()
        .await
        .expect("cmd");
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = client
        .post(format!("http://{addr}/cmd"))
        .json(&json!({"agent": "intruder", "action": "say", "ts": ts, "sig": "00"}))
        .send()
        .await
        .expect("cmd");
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = client
        .post(format!("http://{addr}/result"))
        .json(&json!({"result": "x", "ts": ts, "sig": "00"}))
        .send()
        .await
        .expect("result");
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["detail"], "Missing id");

    let health: Value = client
        .get(format!("http://{addr}/healthz"))
        .send()
        .await
        .expect("healthz")
        .json()
        .await
        .expect("json");
    assert_eq!(health["queue_length"], 0);

    server.abort();
}

#[tokio::test]
async fn result_for_unknown_id_is_saved_noop() {
    let (addr, server) = start_server(config(DispatchMode::Peek, true)).await;
    let client = Client::new();
    let ts = unix_now();
    let resp = client
        .post(format!("http://{addr}/result"))
        .json(&json!({
            "agent": "suna",
            "id": 42,
            "result": "x",
            "ts": ts,
            "sig": sig("suna", SignedOperation::ReportResult { id: 42 }, ts),
        }))
        .send()
        .await
        .expect("result");
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["saved"], true);
    server.abort();
}

#[tokio::test]
async fn long_results_are_truncated() {
    let (addr, server, queue) = start_server_with_queue(config(DispatchMode::Peek, true)).await;
    let client = Client::new();
    submit(&client, addr, "dump", "").await;
    let result: String = "é日".repeat(4500);
    let resp = report(&client, addr, 1, &result).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let stored = queue.get(1).expect("stored command");
    assert_eq!(stored.state, CommandState::Executed);
    let stored = stored.result.expect("stored result");
    assert_eq!(stored.chars().count(), MAX_RESULT_CHARS);
    let expected: String = result.chars().take(MAX_RESULT_CHARS).collect();
    assert_eq!(stored, expected);
    let health: Value = client
        .get(format!("http://{addr}/readyz"))
        .send()
        .await
        .expect("readyz")
        .json()
        .await
        .expect("json");
    assert_eq!(health["status"], "ready");
    assert_eq!(health["pending"], 0);
    server.abort();
}

#[tokio::test]
async fn webhook_ingest_and_rejections() {
    let (addr, server) = start_server(config(DispatchMode::Peek, true)).await;
    let client = Client::new();
    let body = br#"{"ref":"refs/heads/main","repository":{"full_name":"acme/api"},"pusher":{"name":"dana"},"commits":[{}]}"#;
    let header = WebhookVerifier::new(SharedSecret::new(HOOK_SECRET))
        .expected_header(body)
        .unwrap();

    let resp = client
        .post(format!("http://{addr}/webhook"))
        .header(WEBHOOK_SIGNATURE_HEADER, &header)
        .header(WEBHOOK_EVENT_HEADER, "push")
        .body(body.to_vec())
        .send()
        .await
        .expect("webhook");
    assert_eq!(resp.status(), StatusCode::OK);
    let json: Value = resp.json().await.expect("json");
    assert_eq!(json["queued"]["agent"], "suna");
    assert_eq!(json["queued"]["action"], "notify");
    assert_eq!(
        json["queued"]["message"],
        "push to acme/api@main by dana: 1 commit(s)"
    );

    let next = fetch(&client, addr).await;
    assert_eq!(next["action"], "notify");

    let resp = client
        .post(format!("http://{addr}/webhook"))
        .header(WEBHOOK_SIGNATURE_HEADER, "sha256=00")
        .header(WEBHOOK_EVENT_HEADER, "push")
        .body(body.to_vec())
        .send()
        .await
        .expect("webhook");
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let metrics = client
        .get(format!("http://{addr}/metrics"))
        .send()
        .await
        .expect("metrics")
        .text()
        .await
        .expect("text");
    assert!(metrics.contains(r#"relay_auth_failures_total{op="webhook"} 1"#));
    assert!(metrics.contains("relay_commands_enqueued_total 1"));

    server.abort();

    let (addr, server) = start_server(config(DispatchMode::Peek, false)).await;
    let resp = client
        .post(format!("http://{addr}/webhook"))
        .header(WEBHOOK_SIGNATURE_HEADER, &header)
        .body(body.to_vec())
        .send()
        .await
        .expect("webhook");
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    server.abort();
}

#[tokio::test]
async fn lenient_bodies_are_accepted() {
    let (addr, server, queue) = start_server_with_queue(config(DispatchMode::Peek, true)).await;
    let client = Client::new();
    let ts = unix_now();

    // null payload, float timestamp, no content type
    let body = json!({
        "agent": "suna",
        "action": "ping",
        "payload": null,
        "ts": ts as f64,
        "sig": sig("suna", SignedOperation::Submit { action: "ping", payload: "" }, ts),
    });
    let resp = client
        .post(format!("http://{addr}/cmd"))
        .body(body.to_string())
        .send()
        .await
        .expect("cmd");
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(queue.get(1).expect("queued").payload, "");

    let resp = client
        .post(format!("http://{addr}/result"))
        .json(&json!({
            "id": "1",
            "result": 42,
            "ts": ts,
            "sig": sig("suna", SignedOperation::ReportResult { id: 1 }, ts),
        }))
        .send()
        .await
        .expect("result");
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(queue.get(1).and_then(|cmd| cmd.result).as_deref(), Some("42"));
    server.abort();
}

#[tokio::test]
async fn malformed_json_gets_detail_body() {
    let (addr, server) = start_server(config(DispatchMode::Peek, true)).await;
    let client = Client::new();
    for route in ["cmd", "result"] {
        let resp = client
            .post(format!("http://{addr}/{route}"))
            .header("content-type", "application/json")
            .body("{\"agent\": ")
            .send()
            .await
            .expect("post");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = resp.json().await.expect("json");
        assert!(body["detail"]
            .as_str()
            .is_some_and(|detail| detail.starts_with("Invalid JSON body")));
    }
    server.abort();
}
