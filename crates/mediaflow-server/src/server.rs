//! HTTP front of the job system.
//!
//! | Method | Path | |
//! |--------|------|---|
//! | GET | `/health` | broker and database reachability |
//! | POST | `/api/jobs/:queue/:type` | submit a job, `202` with a status URL |
//! | GET | `/api/jobs/:queue/:id` | job status (`exists: false` when unknown) |
//! | GET | `/api/queues/:queue/stats` | counts and counters of one queue |
//! | GET | `/api/media` | paginated metadata |
//! | DELETE | `/api/media` | batch delete by id |
//! | GET | `/api/media/stats` | size aggregates |

use crate::config::AppConfig;
use crate::error::{ApiError, Result};
use crate::queues::AppContext;
use bytes::Bytes;
use http::{header, Method, StatusCode};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use mediaflow_db::{MediaFilter, PageRequest, SortBy, SortOrder, DEFAULT_PAGE_SIZE};
use mediaflow_jobs::{EnqueueOptions, StatusResponse, SubmitResponse};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// How long open connections get to finish once shutdown starts.
const CONNECTION_DRAIN: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("Invalid route: {0}")]
    Route(#[from] matchit::InsertError),

    #[error("Server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Prefix of returned status URLs.
    pub public_base_url: String,
    pub max_body_bytes: usize,
}

impl From<&AppConfig> for HttpConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            public_base_url: config.public_base_url.clone(),
            max_body_bytes: config.max_body_bytes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Health,
    Job,
    QueueStats,
    Media,
    MediaStats,
}

impl Endpoint {
    fn methods(&self) -> &'static [Method] {
        const GET: &[Method] = &[Method::GET];
        const GET_POST: &[Method] = &[Method::GET, Method::POST];
        const GET_DELETE: &[Method] = &[Method::GET, Method::DELETE];
        match self {
            Endpoint::Job => GET_POST,
            Endpoint::Media => GET_DELETE,
            Endpoint::Health | Endpoint::QueueStats | Endpoint::MediaStats => GET,
        }
    }
}

fn routes() -> std::result::Result<matchit::Router<Endpoint>, matchit::InsertError> {
    let mut router = matchit::Router::new();
    router.insert("/health", Endpoint::Health)?;
    router.insert("/api/jobs/:queue/:key", Endpoint::Job)?;
    router.insert("/api/queues/:queue/stats", Endpoint::QueueStats)?;
    router.insert("/api/media", Endpoint::Media)?;
    router.insert("/api/media/stats", Endpoint::MediaStats)?;
    Ok(router)
}

struct HttpState {
    ctx: Arc<AppContext>,
    router: matchit::Router<Endpoint>,
    config: HttpConfig,
}

pub struct HttpServer {
    state: Arc<HttpState>,
}

impl HttpServer {
    pub fn new(ctx: Arc<AppContext>, config: HttpConfig) -> std::result::Result<Self, ServeError> {
        Ok(Self {
            state: Arc::new(HttpState {
                ctx,
                router: routes()?,
                config,
            }),
        })
    }

    /// Accept connections until `shutdown` resolves, then let open
    /// connections finish their current request.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> std::result::Result<(), ServeError>
    where
        F: Future<Output = ()> + Send,
    {
        let addr = listener.local_addr()?;
        info!("mediaflow listening on http://{}", addr);

        let graceful = GracefulShutdown::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, remote_addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "Accept failed");
                            continue;
                        }
                    };
                    let state = self.state.clone();
                    let service = service_fn(move |req: hyper::Request<Incoming>| {
                        let state = state.clone();
                        async move { Ok::<_, Infallible>(handle_request(state, req, remote_addr).await) }
                    });

                    let conn = graceful.watch(http1::Builder::new().serve_connection(TokioIo::new(stream), service));
                    tokio::spawn(async move {
                        if let Err(err) = conn.await {
                            debug!("Connection error: {}", err);
                        }
                    });
                }
                _ = &mut shutdown => break,
            }
        }

        drop(listener);
        info!("HTTP server stopped accepting connections");
        tokio::select! {
            _ = graceful.shutdown() => {}
            _ = tokio::time::sleep(CONNECTION_DRAIN) => {
                warn!("Open connections did not close in time");
            }
        }
        Ok(())
    }
}

/// Handle a single HTTP request
async fn handle_request(
    state: Arc<HttpState>,
    req: hyper::Request<Incoming>,
    _remote_addr: SocketAddr,
) -> hyper::Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();

    let response = match dispatch(&state, req).await {
        Ok(response) => response,
        Err(err) => {
            if let Some(details) = err.internal_details() {
                error!(error_type = %err.error_type, details = %details, "Request error");
            }
            err.into_response()
        }
    };

    log_request(&method, &path, response.status(), start);
    response
}

async fn dispatch(state: &HttpState, req: hyper::Request<Incoming>) -> Result<hyper::Response<Full<Bytes>>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let (endpoint, params) = match state.router.at(&path) {
        Ok(matched) => {
            let params: HashMap<String, String> = matched
                .params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            (*matched.value, params)
        }
        Err(_) => {
            return Err(ApiError::not_found(format!("No route found for {} {}", method, path)));
        }
    };

    let allowed = endpoint.methods();
    if !allowed.contains(&method) {
        let allowed_str: Vec<&str> = allowed.iter().map(|m| m.as_str()).collect();
        let mut response = ApiError::method_not_allowed(format!("Method {} not allowed for {}", method, path))
            .into_response();
        if let Ok(value) = header::HeaderValue::from_str(&allowed_str.join(", ")) {
            response.headers_mut().insert(header::ALLOW, value);
        }
        return Ok(response);
    }

    let param = |name: &str| params.get(name).cloned().unwrap_or_default();
    match (endpoint, method) {
        (Endpoint::Health, _) => health(state).await,
        (Endpoint::Job, Method::POST) => submit(state, &param("queue"), &param("key"), req).await,
        (Endpoint::Job, _) => job_status(state, &param("queue"), &param("key")).await,
        (Endpoint::QueueStats, _) => queue_stats(state, &param("queue")).await,
        (Endpoint::Media, Method::DELETE) => delete_media(state, req).await,
        (Endpoint::Media, _) => list_media(state, req.uri().query().unwrap_or("")).await,
        (Endpoint::MediaStats, _) => media_stats(state).await,
    }
}

/// Log request completion
fn log_request(method: &Method, path: &str, status: StatusCode, start: Instant) {
    let elapsed = start.elapsed();

    if status.is_success() {
        info!(
            method = %method,
            path = %path,
            status = %status.as_u16(),
            duration_ms = %elapsed.as_millis(),
            "Request completed"
        );
    } else {
        error!(
            method = %method,
            path = %path,
            status = %status.as_u16(),
            duration_ms = %elapsed.as_millis(),
            "Request failed"
        );
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Result<hyper::Response<Full<Bytes>>> {
    let bytes = serde_json::to_vec(body)
        .map_err(|e| ApiError::internal("Failed to serialize response").with_internal(e.to_string()))?;
    let mut response = hyper::Response::new(Full::new(Bytes::from(bytes)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    Ok(response)
}

async fn read_json<T: DeserializeOwned>(req: hyper::Request<Incoming>, limit: usize) -> Result<T> {
    let collected = Limited::new(req.into_body(), limit).collect().await.map_err(|e| {
        if e.downcast_ref::<LengthLimitError>().is_some() {
            ApiError::payload_too_large(format!("Request body exceeds {limit} bytes"))
        } else {
            ApiError::bad_request("Failed to read request body").with_internal(e.to_string())
        }
    })?;
    let bytes = collected.to_bytes();
    if bytes.is_empty() {
        return Err(ApiError::bad_request("Request body is required"));
    }
    Ok(serde_json::from_slice(&bytes)?)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct SubmitOptions {
    attempts: Option<u32>,
    priority: Option<i32>,
    delay_ms: Option<u64>,
    timeout_ms: Option<u64>,
    job_id: Option<String>,
}

impl From<SubmitOptions> for EnqueueOptions {
    fn from(opts: SubmitOptions) -> Self {
        EnqueueOptions {
            max_attempts: opts.attempts,
            backoff: None,
            timeout: opts.timeout_ms.map(Duration::from_millis),
            priority: opts.priority,
            delay: opts.delay_ms.map(Duration::from_millis),
            job_id: opts.job_id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    payload: serde_json::Value,
    #[serde(default)]
    options: SubmitOptions,
}

async fn submit(
    state: &HttpState,
    queue: &str,
    job_type: &str,
    req: hyper::Request<Incoming>,
) -> Result<hyper::Response<Full<Bytes>>> {
    let body: SubmitRequest = read_json(req, state.config.max_body_bytes).await?;
    if let Some(id) = &body.options.job_id {
        if id.is_empty() || id.contains('/') {
            return Err(ApiError::bad_request("jobId must be non-empty and contain no '/'"));
        }
    }

    let submission = state
        .ctx
        .manager()
        .submit(queue, job_type, body.payload, body.options.into())
        .await?;
    info!(queue = %submission.queue, job_id = %submission.job_id, job_type, "Job submitted");

    let response = SubmitResponse::accepted(&submission, &state.config.public_base_url);
    json_response(StatusCode::ACCEPTED, &response)
}

async fn job_status(state: &HttpState, queue: &str, job_id: &str) -> Result<hyper::Response<Full<Bytes>>> {
    let status = state.ctx.manager().status(queue, job_id).await?;
    json_response(StatusCode::OK, &StatusResponse::from(status))
}

async fn queue_stats(state: &HttpState, queue: &str) -> Result<hyper::Response<Full<Bytes>>> {
    let stats = state.ctx.manager().stats(queue).await?;
    json_response(StatusCode::OK, &json!({ "success": true, "stats": stats }))
}

async fn health(state: &HttpState) -> Result<hyper::Response<Full<Bytes>>> {
    let broker = state.ctx.manager().ping().await.is_ok();
    let database = state.ctx.services().db.ping().await.is_ok();
    let accepting = !state.ctx.manager().is_closed();

    let healthy = broker && database && accepting;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    json_response(
        status,
        &json!({
            "success": healthy,
            "status": if healthy { "ok" } else { "degraded" },
            "broker": broker,
            "database": database,
            "accepting": accepting,
        }),
    )
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct MediaQuery {
    page: Option<u32>,
    page_size: Option<u32>,
    storage_backend: Option<String>,
    content_type: Option<String>,
    search: Option<String>,
    sort_by: Option<SortBy>,
    sort_order: Option<SortOrder>,
}

impl From<MediaQuery> for PageRequest {
    fn from(q: MediaQuery) -> Self {
        PageRequest::new(q.page.unwrap_or(1), q.page_size.unwrap_or(DEFAULT_PAGE_SIZE))
            .filters(MediaFilter {
                storage_backend: q.storage_backend,
                content_type: q.content_type,
                search: q.search,
                ..MediaFilter::default()
            })
            .sort(q.sort_by.unwrap_or_default(), q.sort_order.unwrap_or_default())
    }
}

async fn list_media(state: &HttpState, query: &str) -> Result<hyper::Response<Full<Bytes>>> {
    let query: MediaQuery = serde_urlencoded::from_str(query)
        .map_err(|e| ApiError::bad_request(format!("Invalid query string: {e}")))?;
    let page = state.ctx.services().db.paginate(&query.into()).await?;
    json_response(
        StatusCode::OK,
        &json!({ "success": true, "data": page.data, "pagination": page.pagination }),
    )
}

#[derive(Debug, Deserialize)]
struct DeleteRequest {
    ids: Vec<i64>,
}

async fn delete_media(state: &HttpState, req: hyper::Request<Incoming>) -> Result<hyper::Response<Full<Bytes>>> {
    let body: DeleteRequest = read_json(req, state.config.max_body_bytes).await?;
    let deleted = state.ctx.services().db.batch_delete(&body.ids).await?;
    json_response(
        StatusCode::OK,
        &json!({ "success": true, "requested": body.ids.len(), "deleted": deleted }),
    )
}

async fn media_stats(state: &HttpState) -> Result<hyper::Response<Full<Bytes>>> {
    let stats = state.ctx.services().db.get_stats().await?;
    json_response(StatusCode::OK, &json!({ "success": true, "stats": stats }))
}
