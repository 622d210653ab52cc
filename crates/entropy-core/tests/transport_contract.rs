//! Architectural Contract Test: Transport Adapter
//!
//! Verifies that the HTTP adapter is a thin translation layer:
//!
//! - Calls round-trip through `Client` and `Gateway` to the service
//! - Error kinds come back as real HTTP statuses with their gRPC code
//! - Log streams are NDJSON and end with an explicit end marker
//! - Non-loggable modules answer 501 UNIMPLEMENTED

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use entropy_core::module::{LogChunk, LogFilter};
use entropy_core::transport::{ACTOR_HEADER, ErrorBody, LogLine};
use entropy_core::{Client, ErrorKind, Gateway, ListFilter, Status};
use tokio::net::TcpListener;
use tokio::sync::watch;

const URN: &str = "orn:entropy:log:p1:a";

struct Server {
    base: String,
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<entropy_core::Result<()>>,
}

async fn serve(harness: &Harness) -> Server {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let gateway = Arc::new(Gateway::new(
        harness.service.clone(),
        Duration::from_secs(5),
    ));
    let (shutdown, rx) = watch::channel(false);
    let task = tokio::spawn(gateway.serve(listener, rx));
    Server {
        base,
        shutdown,
        task,
    }
}

async fn error_body(response: reqwest::Response) -> ErrorBody {
    response.json().await.unwrap()
}

#[tokio::test]
async fn create_and_get_round_trip() {
    let harness = Harness::new(ScriptedModule::new());
    let server = serve(&harness).await;
    let client = Client::new(server.base.clone());

    let created = client
        .create_resource(create_request("a"), Some("alice".into()))
        .await
        .unwrap();
    assert_eq!(created.urn, URN);
    assert_eq!(created.created_by, "alice");
    assert_eq!(created.state.status, Status::Pending);

    let fetched = client.get_resource(URN).await.unwrap();
    assert_eq!(fetched.urn, created.urn);
    assert_eq!(fetched.version, created.version);

    let listed = client.list_resources(ListFilter::default()).await.unwrap();
    assert_eq!(listed.len(), 1);
    let filtered = client
        .list_resources(ListFilter {
            status: Some(Status::Completed),
            ..ListFilter::default()
        })
        .await
        .unwrap();
    assert!(filtered.is_empty());

    let job = client.get_pending_job(URN).await.unwrap();
    assert!(job.is_some());

    assert_eq!(client.list_modules().await.unwrap(), vec!["log".to_string()]);

    // Missing actor falls back to anonymous
    let other = client
        .create_resource(create_request("b"), None)
        .await
        .unwrap();
    assert_eq!(other.created_by, "anonymous");

    server.shutdown.send(true).unwrap();
    server.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn plain_http_callers_get_real_statuses() {
    let harness = Harness::new(ScriptedModule::new());
    let server = serve(&harness).await;
    let http = reqwest::Client::new();

    let response = http
        .post(format!("{}/v1/resources", server.base))
        .header(ACTOR_HEADER, "bob")
        .json(&create_request("a"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::CREATED);
    let created: serde_json::Value = response.json().await.unwrap();
    assert_eq!(created["created_by"], "bob");

    let response = http
        .get(format!("{}/v1/resources/orn:entropy:log:p1:missing", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    assert_eq!(error_body(response).await.code, "NOT_FOUND");

    let response = http
        .post(format!("{}/v1/resources", server.base))
        .json(&create_request("a"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);
    assert_eq!(error_body(response).await.code, "ALREADY_EXISTS");

    let response = http
        .post(format!("{}/v1/resources", server.base))
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    assert_eq!(error_body(response).await.code, "INVALID_ARGUMENT");

    let response = http
        .get(format!("{}/v1/nowhere", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    server.shutdown.send(true).unwrap();
}

#[tokio::test]
async fn client_surfaces_error_kinds() {
    let harness = Harness::new(ScriptedModule::new());
    let server = serve(&harness).await;
    let client = Client::new(server.base.clone());

    let err = client.get_resource(URN).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let mut request = create_request("c");
    request.kind = "unknown".to_string();
    let err = client.create_resource(request, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ModuleNotFound);

    client
        .create_resource(create_request("a"), None)
        .await
        .unwrap();
    // Not yet synced, so the command path refuses to re-plan
    let err = client.delete_resource(URN, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    server.shutdown.send(true).unwrap();
}

#[tokio::test]
async fn logs_stream_until_end_marker() {
    let module = ScriptedModule::new().with_logs(vec![
        LogChunk::new("line one").with_label("stream", "stdout"),
        LogChunk::new("oops").with_label("stream", "stderr"),
        LogChunk::new("line two").with_label("stream", "stdout"),
    ]);
    let harness = Harness::new(module);
    let server = serve(&harness).await;
    let client = Client::new(server.base.clone());
    client
        .create_resource(create_request("a"), None)
        .await
        .unwrap();

    let mut filter = LogFilter::new();
    filter.insert("stream".to_string(), "stdout".to_string());
    let mut received = Vec::new();
    client
        .logs(URN, filter, |chunk| received.push(chunk.data))
        .await
        .unwrap();
    assert_eq!(received, vec!["line one".to_string(), "line two".to_string()]);

    let response = reqwest::get(format!("{}/v1/resources/{URN}/logs", server.base))
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "application/x-ndjson"
    );
    let text = response.text().await.unwrap();
    let lines: Vec<LogLine> = text
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(lines.len(), 4);
    assert!(lines[..3].iter().all(|l| matches!(l, LogLine::Chunk(_))));
    assert_eq!(lines[3], LogLine::End(true));

    server.shutdown.send(true).unwrap();
}

#[tokio::test]
async fn logs_on_non_loggable_module_are_unimplemented() {
    let harness = Harness::new(ScriptedModule::new());
    let server = serve(&harness).await;
    let client = Client::new(server.base.clone());
    client
        .create_resource(create_request("a"), None)
        .await
        .unwrap();

    let err = client
        .logs(URN, LogFilter::new(), |_| {})
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);

    let response = reqwest::get(format!("{}/v1/resources/{URN}/logs", server.base))
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_IMPLEMENTED);
    assert_eq!(error_body(response).await.code, "UNIMPLEMENTED");

    server.shutdown.send(true).unwrap();
}
