// # Transport Adapter
//
// Thin HTTP adapter exposing `ResourceService` through axum routes, and a
// matching `reqwest` client.
//
// ## Routes
//
// ```text
// POST   /v1/resources                          create (201)
// GET    /v1/resources?kind=&project=&status=&label.<k>=<v>
// GET    /v1/resources/{urn}
// PATCH  /v1/resources/{urn}                    update
// DELETE /v1/resources/{urn}
// POST   /v1/resources/{urn}/actions/{action}   apply action
// GET    /v1/resources/{urn}/job                pending job or null
// GET    /v1/resources/{urn}/logs?<label>=<v>   NDJSON log stream
// GET    /v1/modules
// ```
//
// The caller identifies itself with the `x-entropy-actor` header.
//
// Failures carry the HTTP status of their error kind and a body naming
// the gRPC code:
//
// ```json
// {"code":"NOT_FOUND","error":{"kind":"not_found","message":"..."}}
// ```
//
// The log stream is `application/x-ndjson`, one `{"chunk":{..}}` line per
// chunk, then `{"end":true}`, or `{"error":{..}}` if the source fails.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

use crate::error::{Error, ErrorKind, Result};
use crate::job::PendingJob;
use crate::module::{LogChunk, LogFilter, LogStream};
use crate::resource::{ListFilter, Resource, Status};
use crate::service::{ANONYMOUS, CreateRequest, ResourceService, UpdateRequest};

/// Header carrying the caller's identity
pub const ACTOR_HEADER: &str = "x-entropy-actor";

const NDJSON: &str = "application/x-ndjson";

/// Buffered log lines per open stream
const LOG_BUFFER: usize = 64;

/// HTTP status and gRPC code name for an error kind
pub fn code_for(kind: ErrorKind) -> (u16, &'static str) {
    match kind {
        ErrorKind::NotFound => (404, "NOT_FOUND"),
        ErrorKind::AlreadyExists => (409, "ALREADY_EXISTS"),
        ErrorKind::InvalidParams
        | ErrorKind::ModuleNotFound
        | ErrorKind::ModuleConfigParseFailed => (400, "INVALID_ARGUMENT"),
        ErrorKind::Conflict => (409, "FAILED_PRECONDITION"),
        ErrorKind::Unsupported => (501, "UNIMPLEMENTED"),
        ErrorKind::Internal => (500, "INTERNAL"),
    }
}

/// Rebuild an error from its wire representation
fn error_from_wire(err: ApiError) -> Error {
    match err.kind.as_str() {
        "not_found" => Error::NotFound(err.message),
        "already_exists" => Error::AlreadyExists(err.message),
        "invalid_params" => Error::InvalidParams(err.message),
        "conflict" => Error::Conflict(err.message),
        "unsupported" => Error::Unsupported(err.message),
        "module_not_found" => Error::ModuleNotFound(err.message),
        "module_config_parse_failed" => Error::ModuleConfigParseFailed {
            kind: String::new(),
            message: err.message,
        },
        _ => Error::Internal(err.message),
    }
}

/// Error payload of a failed call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub kind: String,
    pub message: String,
}

/// Body of a failed call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub error: ApiError,
}

/// A failed call as returned by the handlers
#[derive(Debug)]
pub struct ApiFailure {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiFailure {
    fn timed_out(after: Duration) -> Self {
        Self {
            status: StatusCode::GATEWAY_TIMEOUT,
            body: ErrorBody {
                code: "DEADLINE_EXCEEDED".to_string(),
                error: ApiError {
                    kind: ErrorKind::Internal.as_str().to_string(),
                    message: format!("request exceeded {}ms", after.as_millis()),
                },
            },
        }
    }

    fn no_route() -> Self {
        Self::from(Error::not_found("no such route"))
    }
}

impl From<Error> for ApiFailure {
    fn from(err: Error) -> Self {
        let kind = err.kind();
        let (status, code) = code_for(kind);
        Self {
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            body: ErrorBody {
                code: code.to_string(),
                error: ApiError {
                    kind: kind.as_str().to_string(),
                    message: err.to_string(),
                },
            },
        }
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiFailure>;

/// One line of a log stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLine {
    Chunk(LogChunk),
    Error(ApiError),
    End(bool),
}

impl LogLine {
    fn to_bytes(&self) -> Vec<u8> {
        let mut line = serde_json::to_vec(self).unwrap_or_else(|e| {
            serde_json::json!({ "error": { "kind": "internal", "message": e.to_string() } })
                .to_string()
                .into_bytes()
        });
        line.push(b'\n');
        line
    }
}

fn actor_of(headers: &HeaderMap) -> &str {
    headers
        .get(ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or(ANONYMOUS)
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T> {
    if body.is_empty() {
        return serde_json::from_value(Value::Null)
            .map_err(|e| Error::invalid_params(format!("missing request body: {e}")));
    }
    serde_json::from_slice(body)
        .map_err(|e| Error::invalid_params(format!("malformed request body: {e}")))
}

/// Decode `kind`, `project`, `status` and `label.<key>` query parameters
fn list_filter(params: BTreeMap<String, String>) -> Result<ListFilter> {
    let mut filter = ListFilter::default();
    for (key, value) in params {
        match key.as_str() {
            "kind" => filter.kind = Some(value),
            "project" => filter.project = Some(value),
            "status" => filter.status = Some(value.parse::<Status>()?),
            _ => match key.strip_prefix("label.") {
                Some(label) => {
                    filter.labels.insert(label.to_string(), value);
                }
                None => {
                    return Err(Error::invalid_params(format!(
                        "unknown list parameter '{key}'"
                    )));
                }
            },
        }
    }
    Ok(filter)
}

fn list_query(filter: &ListFilter) -> Vec<(String, String)> {
    let mut query = Vec::new();
    if let Some(kind) = &filter.kind {
        query.push(("kind".to_string(), kind.clone()));
    }
    if let Some(project) = &filter.project {
        query.push(("project".to_string(), project.clone()));
    }
    if let Some(status) = filter.status {
        query.push(("status".to_string(), status.to_string()));
    }
    for (key, value) in &filter.labels {
        query.push((format!("label.{key}"), value.clone()));
    }
    query
}

/// Server side of the adapter
pub struct Gateway {
    service: ResourceService,
    request_timeout: Duration,
}

impl Gateway {
    pub fn new(service: ResourceService, request_timeout: Duration) -> Self {
        Self {
            service,
            request_timeout,
        }
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/v1/resources", post(create_resource).get(list_resources))
            .route(
                "/v1/resources/{urn}",
                get(get_resource)
                    .patch(update_resource)
                    .delete(delete_resource),
            )
            .route("/v1/resources/{urn}/actions/{action}", post(apply_action))
            .route("/v1/resources/{urn}/job", get(get_pending_job))
            .route("/v1/resources/{urn}/logs", get(get_log))
            .route("/v1/modules", get(list_modules))
            .fallback(|| async { ApiFailure::no_route() })
            .with_state(self)
    }

    /// Serve the routes on `listener` until `shutdown` flips to true
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "api listening");
        }

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            })
            .await?;

        info!("api stopped");
        Ok(())
    }

    /// Run a service call under the request timeout
    async fn within<T>(&self, call: impl Future<Output = Result<T>>) -> ApiResult<T> {
        match tokio::time::timeout(self.request_timeout, call).await {
            Ok(result) => result.map_err(ApiFailure::from),
            Err(_) => Err(ApiFailure::timed_out(self.request_timeout)),
        }
    }
}

type Shared = State<Arc<Gateway>>;

async fn create_resource(
    State(gw): Shared,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<Resource>)> {
    let request: CreateRequest = parse_body(&body)?;
    debug!(kind = %request.kind, name = %request.name, "create resource");
    let created = gw.within(gw.service.create(request, actor_of(&headers))).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn list_resources(
    State(gw): Shared,
    Query(params): Query<BTreeMap<String, String>>,
) -> ApiResult<Json<Vec<Resource>>> {
    let filter = list_filter(params)?;
    Ok(Json(gw.within(gw.service.list(&filter)).await?))
}

async fn get_resource(State(gw): Shared, Path(urn): Path<String>) -> ApiResult<Json<Resource>> {
    Ok(Json(gw.within(gw.service.get(&urn)).await?))
}

async fn update_resource(
    State(gw): Shared,
    Path(urn): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Resource>> {
    let update: UpdateRequest = parse_body(&body)?;
    Ok(Json(
        gw.within(gw.service.update(&urn, update, actor_of(&headers)))
            .await?,
    ))
}

async fn delete_resource(
    State(gw): Shared,
    Path(urn): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Resource>> {
    Ok(Json(
        gw.within(gw.service.delete(&urn, actor_of(&headers)))
            .await?,
    ))
}

async fn apply_action(
    State(gw): Shared,
    Path((urn, action)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Resource>> {
    let params: Value = parse_body(&body)?;
    Ok(Json(
        gw.within(
            gw.service
                .apply_action(&urn, &action, params, actor_of(&headers)),
        )
        .await?,
    ))
}

async fn get_pending_job(
    State(gw): Shared,
    Path(urn): Path<String>,
) -> ApiResult<Json<Option<PendingJob>>> {
    Ok(Json(gw.within(gw.service.get_pending_job(&urn)).await?))
}

async fn list_modules(State(gw): Shared) -> Json<Vec<String>> {
    Json(gw.service.registry().kinds())
}

/// Open the stream under the request timeout, then relay it line by line
///
/// The relay stops, dropping the module stream, once the client goes away.
async fn get_log(
    State(gw): Shared,
    Path(urn): Path<String>,
    Query(filter): Query<LogFilter>,
) -> ApiResult<Response> {
    let stream = gw.within(gw.service.get_log(&urn, &filter)).await?;
    let (tx, rx) = mpsc::channel::<Vec<u8>>(LOG_BUFFER);
    tokio::spawn(relay_log(stream, tx));

    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
    let mut response = Response::new(body);
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(NDJSON));
    Ok(response)
}

async fn relay_log(mut stream: LogStream, tx: mpsc::Sender<Vec<u8>>) {
    while let Some(item) = stream.next().await {
        let line = match item {
            Ok(chunk) => LogLine::Chunk(chunk),
            Err(e) => {
                let failure = ApiFailure::from(e);
                let _ = tx.send(LogLine::Error(failure.body.error).to_bytes()).await;
                return;
            }
        };
        if tx.send(line.to_bytes()).await.is_err() {
            debug!("log client disconnected");
            return;
        }
    }
    let _ = tx.send(LogLine::End(true).to_bytes()).await;
}

/// Client side of the adapter
#[derive(Debug, Clone)]
pub struct Client {
    base_url: String,
    http: reqwest::Client,
    timeout: Duration,
}

impl Client {
    /// `addr` is `host:port` or a full `http(s)://` base URL
    pub fn new(addr: impl Into<String>) -> Self {
        let addr = addr.into();
        let base_url = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{addr}")
        };
        Self {
            base_url,
            http: reqwest::Client::new(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn resource_url(&self, urn: &str, suffix: &str) -> String {
        self.url(&format!("/v1/resources/{urn}{suffix}"))
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        actor: Option<&str>,
    ) -> Result<T> {
        let mut request = request.timeout(self.timeout);
        if let Some(actor) = actor {
            request = request.header(ACTOR_HEADER, actor);
        }
        let response = request.send().await.map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(failure_of(response).await);
        }
        response.json().await.map_err(transport_error)
    }

    pub async fn create_resource(
        &self,
        resource: CreateRequest,
        actor: Option<String>,
    ) -> Result<Resource> {
        let request = self.http.post(self.url("/v1/resources")).json(&resource);
        self.send(request, actor.as_deref()).await
    }

    pub async fn update_resource(
        &self,
        urn: &str,
        update: UpdateRequest,
        actor: Option<String>,
    ) -> Result<Resource> {
        let request = self.http.patch(self.resource_url(urn, "")).json(&update);
        self.send(request, actor.as_deref()).await
    }

    pub async fn delete_resource(&self, urn: &str, actor: Option<String>) -> Result<Resource> {
        let request = self.http.delete(self.resource_url(urn, ""));
        self.send(request, actor.as_deref()).await
    }

    pub async fn apply_action(
        &self,
        urn: &str,
        action: &str,
        params: Value,
        actor: Option<String>,
    ) -> Result<Resource> {
        let request = self
            .http
            .post(self.resource_url(urn, &format!("/actions/{action}")))
            .json(&params);
        self.send(request, actor.as_deref()).await
    }

    pub async fn get_resource(&self, urn: &str) -> Result<Resource> {
        self.send(self.http.get(self.resource_url(urn, "")), None)
            .await
    }

    pub async fn list_resources(&self, filter: ListFilter) -> Result<Vec<Resource>> {
        let request = self
            .http
            .get(self.url("/v1/resources"))
            .query(&list_query(&filter));
        self.send(request, None).await
    }

    pub async fn get_pending_job(&self, urn: &str) -> Result<Option<PendingJob>> {
        self.send(self.http.get(self.resource_url(urn, "/job")), None)
            .await
    }

    pub async fn list_modules(&self) -> Result<Vec<String>> {
        self.send(self.http.get(self.url("/v1/modules")), None).await
    }

    /// Stream logs, calling `on_chunk` for every chunk until the end marker
    ///
    /// Only the initial response is bounded by the client timeout.
    pub async fn logs<F>(&self, urn: &str, filter: LogFilter, mut on_chunk: F) -> Result<()>
    where
        F: FnMut(LogChunk),
    {
        let request = self
            .http
            .get(self.resource_url(urn, "/logs"))
            .query(&filter);
        let mut response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| {
                Error::internal(format!(
                    "log request timed out after {}ms",
                    self.timeout.as_millis()
                ))
            })?
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(failure_of(response).await);
        }

        let mut buffer: Vec<u8> = Vec::new();
        while let Some(bytes) = response.chunk().await.map_err(transport_error)? {
            buffer.extend_from_slice(&bytes);
            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                match serde_json::from_slice::<LogLine>(&line)? {
                    LogLine::Chunk(chunk) => on_chunk(chunk),
                    LogLine::Error(err) => return Err(error_from_wire(err)),
                    LogLine::End(_) => return Ok(()),
                }
            }
        }
        Err(Error::internal("log stream closed without end marker"))
    }
}

fn transport_error(err: reqwest::Error) -> Error {
    Error::internal(format!("api request failed: {err}"))
}

/// Decode the error body of a non-success response
async fn failure_of(response: reqwest::Response) -> Error {
    let status = response.status();
    match response.json::<ErrorBody>().await {
        Ok(body) => error_from_wire(body.error),
        Err(_) => Error::internal(format!("api answered {status}")),
    }
}
