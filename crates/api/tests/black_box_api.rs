use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use reqwest::StatusCode;
use runrelay_api::app::{self, AppServices, BackgroundTasks};
use runrelay_api::AppConfig;
use runrelay_infra::InMemoryBroker;
use serde_json::{json, Value as JsonValue};

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
    background: Option<BackgroundTasks>,
}

impl TestServer {
    async fn spawn() -> Self {
        let config = AppConfig::default()
            .with_step_delay(Duration::from_millis(1))
            .with_backoff_base(Duration::from_millis(5))
            .with_idle_timeout(Duration::from_millis(200))
            .with_keep_alive(Duration::from_millis(200));
        let services = Arc::new(AppServices::with_broker(Arc::new(InMemoryBroker::new()), config));
        services.prepare_topics().await;
        let background = services.spawn_background();

        // Same router as prod, but bound to an ephemeral port.
        let router = app::build_app(services);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self {
            base_url,
            handle,
            background: Some(background),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
        if let Some(background) = self.background.take() {
            tokio::spawn(background.shutdown());
        }
    }
}

async fn create_run(client: &reqwest::Client, srv: &TestServer, body: JsonValue) -> String {
    let res = client.post(srv.url("/runs")).json(&body).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let created: JsonValue = res.json().await.unwrap();
    created["run_id"].as_str().unwrap().to_string()
}

/// Read `data:` records off an SSE response until `done` matches one.
async fn read_events_until(
    res: reqwest::Response,
    done: impl Fn(&JsonValue) -> bool,
) -> (Vec<JsonValue>, usize) {
    let mut stream = res.bytes_stream();
    let mut buffer = String::new();
    let mut events = Vec::new();
    let mut keep_alives = 0;

    let read = async {
        while let Some(chunk) = stream.next().await {
            buffer.push_str(&String::from_utf8_lossy(&chunk.unwrap()));
            while let Some(end) = buffer.find("\n\n") {
                let frame: String = buffer.drain(..end + 2).collect();
                for line in frame.lines() {
                    if let Some(data) = line.strip_prefix("data:") {
                        let value: JsonValue = serde_json::from_str(data.trim()).unwrap();
                        let finished = done(&value);
                        events.push(value);
                        if finished {
                            return;
                        }
                    } else if line.starts_with(':') {
                        keep_alives += 1;
                    }
                }
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), read)
        .await
        .expect("event stream did not reach the expected record in time");

    (events, keep_alives)
}

async fn get_dlq_eventually(client: &reqwest::Client, srv: &TestServer, run_id: &str) -> JsonValue {
    // The dead-letter cache is filled asynchronously by the indexer.
    for _ in 0..200 {
        let res = client.get(srv.url(&format!("/runs/{run_id}/dlq"))).send().await.unwrap();
        if res.status() == StatusCode::OK {
            return res.json().await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("dead letter did not become visible within timeout");
}

#[tokio::test]
async fn healthz_is_ok_with_in_memory_broker() {
    let srv = TestServer::spawn().await;
    let res = reqwest::get(srv.url("/healthz")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: JsonValue = res.json().await.unwrap();
    assert_eq!(body["ok"], true);
}

#[tokio::test]
async fn successful_run_streams_its_full_timeline() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let run_id = create_run(&client, &srv, json!({"input": {"hello": "world"}})).await;

    let res = client
        .get(srv.url(&format!("/runs/{run_id}/events?client_id=obs-1")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()["cache-control"], "no-cache");

    let (events, _) = read_events_until(res, |e| e["type"] == "run.succeeded").await;
    let types: Vec<&str> = events.iter().map(|e| e["type"].as_str().unwrap()).collect();

    assert_eq!(types[0], "sse.connected");
    assert_eq!(types[1], "run.created");
    assert_eq!(
        &types[2..],
        [
            "worker.received",
            "run.started",
            "step.started",
            "step.completed",
            "step.started",
            "step.completed",
            "step.started",
            "step.completed",
            "step.started",
            "step.completed",
            "run.succeeded",
        ]
    );
    assert!(events[1..].iter().all(|e| e["run_id"] == run_id.as_str()));
}

#[tokio::test]
async fn failing_run_dead_letters_then_replay_succeeds() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let run_id = create_run(&client, &srv, json!({"fail_at": "tool_call"})).await;

    let dlq = get_dlq_eventually(&client, &srv, &run_id).await;
    assert_eq!(dlq["reason"], "max_attempts");
    assert_eq!(dlq["attempts"], 3);
    assert_eq!(dlq["replay_seq"], 0);
    assert_eq!(dlq["command"]["fail_at"], "tool_call");

    // A late observer is told about the dead letter right after connecting.
    let res = client
        .get(srv.url(&format!("/runs/{run_id}/events?client_id=late")))
        .send()
        .await
        .unwrap();
    let (events, _) = read_events_until(res, |e| e["type"] == "run.failed").await;
    assert_eq!(events[0]["type"], "sse.connected");
    assert_eq!(events[1]["type"], "dlq.available");
    assert_eq!(events[1]["dlq"]["reason"], "max_attempts");

    let failed_attempts = events.iter().filter(|e| e["type"] == "run.attempt_failed").count();
    assert_eq!(failed_attempts, 3);
    let retries: Vec<_> = events
        .iter()
        .filter(|e| e["type"] == "run.retry_scheduled")
        .map(|e| e["attempt"].as_u64().unwrap())
        .collect();
    assert_eq!(retries, vec![2, 3]);

    let res = client
        .post(srv.url(&format!("/runs/{run_id}/replay")))
        .json(&json!({"fail_at": null}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let replayed: JsonValue = res.json().await.unwrap();
    assert_eq!(replayed["seq"], 1);
    assert_eq!(replayed["fail_at"], JsonValue::Null);

    let res = client
        .get(srv.url(&format!("/runs/{run_id}/events?client_id=after-replay")))
        .send()
        .await
        .unwrap();
    let (events, _) = read_events_until(res, |e| e["type"] == "run.succeeded").await;
    let received: Vec<_> = events
        .iter()
        .filter(|e| e["type"] == "worker.received" && e["replay_seq"] == 1)
        .map(|e| e["attempt"].as_u64().unwrap())
        .collect();
    assert_eq!(received, vec![1]);
}

#[tokio::test]
async fn quiet_streams_receive_keep_alive_comments() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let run_id = create_run(&client, &srv, json!({})).await;

    let res = client
        .get(srv.url(&format!("/runs/{run_id}/events")))
        .send()
        .await
        .unwrap();

    let mut stream = res.bytes_stream();
    let mut text = String::new();
    let read = async {
        while let Some(chunk) = stream.next().await {
            text.push_str(&String::from_utf8_lossy(&chunk.unwrap()));
            if text.contains(": keep-alive") {
                return;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), read)
        .await
        .expect("no keep-alive received");
}

#[tokio::test]
async fn unknown_run_is_not_found() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client.post(srv.url("/runs/nope/replay")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: JsonValue = res.json().await.unwrap();
    assert_eq!(body["error"], "not_found");

    let res = client.get(srv.url("/runs/nope/events")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn malformed_body_is_rejected() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(srv.url("/runs"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: JsonValue = res.json().await.unwrap();
    assert_eq!(body["error"], "validation_error");
}
