//! HTTP server for the remote-function endpoint.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::header::{HeaderValue, ALLOW, CONTENT_TYPE};
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use remote_hmac_core::{BatchHandler, BatchOutcome};
use remote_hmac_telemetry::metrics::{record_batch, record_response};
use remote_hmac_telemetry::{render_metrics, InFlightGuard};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::config::{ServerConfig, INTERNAL_PREFIX};
use crate::error::{ErrorResponse, ServerError, ServerResult};
use crate::health::HealthChecker;
use crate::shutdown::{ConnectionTracker, ShutdownSignal};

/// Request ID header, read from the caller and echoed on every response.
pub const HEADER_REQUEST_ID: &str = "x-request-id";

const CONTENT_TYPE_JSON: &str = "application/json";
const CONTENT_TYPE_PROMETHEUS: &str = "text/plain; version=0.0.4";
const CONTENT_TYPE_TEXT: &str = "text/plain; charset=utf-8";

/// Upper bound on a caller-supplied request ID.
const MAX_REQUEST_ID_LEN: usize = 128;

/// State shared by every connection.
struct AppState {
    config: Arc<ServerConfig>,
    handler: BatchHandler,
    health: Arc<HealthChecker>,
}

/// The remote HMAC server.
pub struct HmacServer {
    state: Arc<AppState>,
}

impl HmacServer {
    /// Create a server computing HMAC-SHA256 with the configured engine.
    pub fn new(config: ServerConfig) -> ServerResult<Self> {
        let handler = BatchHandler::hmac_sha256(config.engine.clone());
        Self::with_handler(config, handler)
    }

    /// Create a server around a prepared batch handler.
    pub fn with_handler(config: ServerConfig, handler: BatchHandler) -> ServerResult<Self> {
        config.validate()?;

        Ok(Self {
            state: Arc::new(AppState {
                config: Arc::new(config),
                handler,
                health: Arc::new(HealthChecker::new()),
            }),
        })
    }

    /// Health checker backing the internal endpoints.
    pub fn health(&self) -> Arc<HealthChecker> {
        Arc::clone(&self.state.health)
    }

    /// Bind the listener without accepting connections yet.
    pub async fn bind(self) -> ServerResult<BoundServer> {
        let addr = self.state.config.socket_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::server(format!("failed to bind {addr}: {e}")))?;
        let local_addr = listener.local_addr()?;

        Ok(BoundServer {
            listener,
            local_addr,
            state: self.state,
        })
    }

    /// Run until SIGTERM or SIGINT.
    pub async fn run(self) -> ServerResult<()> {
        self.run_until(ShutdownSignal::with_os_signals()).await
    }

    /// Run until `shutdown` is triggered.
    pub async fn run_until(self, shutdown: ShutdownSignal) -> ServerResult<()> {
        self.bind().await?.serve(shutdown).await
    }
}

/// A server whose listener is bound.
pub struct BoundServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    state: Arc<AppState>,
}

impl BoundServer {
    /// The address actually bound, with the real port when `0` was requested.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until `shutdown` fires, then drain.
    pub async fn serve(self, shutdown: ShutdownSignal) -> ServerResult<()> {
        let Self {
            listener,
            local_addr,
            state,
        } = self;
        let tracker = ConnectionTracker::new();
        let mut stop = shutdown.recv();

        info!(
            addr = %local_addr,
            function_path = %state.config.server.function_path,
            mode = ?state.config.engine.mode,
            "remote HMAC server listening"
        );
        state.health.set_ready(true);

        loop {
            let (stream, peer_addr) = tokio::select! {
                () = &mut stop => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                        continue;
                    }
                },
            };

            let token = tracker.acquire();
            let state = Arc::clone(&state);
            let shutdown = shutdown.clone();

            tokio::spawn(async move {
                let _token = token;
                let io = TokioIo::new(stream);

                let service = service_fn(move |req| {
                    let state = Arc::clone(&state);
                    async move { Ok::<_, Infallible>(handle_request(req, state, peer_addr).await) }
                });

                let conn = http1::Builder::new().serve_connection(io, service);
                tokio::pin!(conn);

                let result = tokio::select! {
                    result = conn.as_mut() => result,
                    () = shutdown.recv() => {
                        conn.as_mut().graceful_shutdown();
                        conn.await
                    }
                };

                if let Err(e) = result {
                    debug!(peer = %peer_addr, error = %e, "connection error");
                }
            });
        }

        state.health.set_ready(false);
        drop(listener);

        let timeout = state.config.server.shutdown_timeout;
        info!(
            active_connections = tracker.active_connections(),
            timeout_ms = duration_ms(timeout),
            "shutting down, draining connections"
        );

        if tokio::time::timeout(timeout, tracker.wait_for_idle())
            .await
            .is_err()
        {
            warn!(
                active_connections = tracker.active_connections(),
                "shutdown timeout elapsed with connections still open"
            );
        }

        info!("remote HMAC server stopped");
        Ok(())
    }
}

/// Handle one request inside its own span.
async fn handle_request(
    req: Request<Incoming>,
    state: Arc<AppState>,
    peer_addr: SocketAddr,
) -> Response<Full<Bytes>> {
    let start = Instant::now();
    let _in_flight = InFlightGuard::new();

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let request_id = request_id(req.headers());

    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        method = %method,
        path = %path,
        peer = %peer_addr,
    );

    async move {
        let mut response = route(req, &state, &request_id).await;

        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert(HEADER_REQUEST_ID, value);
        }

        let status = response.status();
        record_response(status.as_u16());
        info!(
            status = status.as_u16(),
            duration_ms = duration_ms(start.elapsed()),
            "request completed"
        );

        response
    }
    .instrument(span)
    .await
}

async fn route(req: Request<Incoming>, state: &AppState, request_id: &str) -> Response<Full<Bytes>> {
    let path = req.uri().path();

    if path.starts_with(INTERNAL_PREFIX) {
        return internal_endpoint(path, &state.health);
    }

    if path != state.config.server.function_path {
        return error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            &format!("no route for {path}"),
            request_id,
        );
    }

    if req.method() != Method::POST {
        let mut response = error_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "method_not_allowed",
            &format!("{} is not allowed, use POST", req.method()),
            request_id,
        );
        response
            .headers_mut()
            .insert(ALLOW, HeaderValue::from_static("POST"));
        return response;
    }

    let limit = state.config.server.max_request_body_size;
    let body = match read_body(req, limit).await {
        Ok(body) => body,
        Err(err) => {
            warn!(error = %err, category = err.category(), "rejecting request body");
            return server_error_response(&err, request_id);
        }
    };

    process_batch(&body, state, request_id).await
}

async fn process_batch(body: &[u8], state: &AppState, request_id: &str) -> Response<Full<Bytes>> {
    let start = Instant::now();
    let handled = state.handler.handle(body).await;
    let elapsed = start.elapsed();

    record_batch(handled.rows, handled.fault, elapsed);
    state.health.record_batch();

    debug!(
        batch_request_id = %handled.request_id,
        rows = handled.rows,
        fault = handled.fault.unwrap_or("none"),
        duration_ms = duration_ms(elapsed),
        "batch processed"
    );

    batch_response(handled.body, request_id)
}

/// Turn an encoded batch into the HTTP reply. Only an encode failure is
/// answered with a non-200 status.
fn batch_response(body: BatchOutcome<Vec<u8>>, request_id: &str) -> Response<Full<Bytes>> {
    match body {
        Ok(json) => bytes_response(StatusCode::OK, CONTENT_TYPE_JSON, Bytes::from(json)),
        Err(err) => {
            let err = ServerError::internal(err.to_string());
            error!(error = %err, request_id, "failed to encode batch response");
            bytes_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                CONTENT_TYPE_TEXT,
                Bytes::from(err.to_string()),
            )
        }
    }
}

/// Collect the body, refusing anything over `limit` bytes.
async fn read_body(req: Request<Incoming>, limit: usize) -> ServerResult<Bytes> {
    let declared = req
        .headers()
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if declared.is_some_and(|len| len > limit as u64) {
        return Err(ServerError::PayloadTooLarge { limit });
    }

    match Limited::new(req.into_body(), limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.is::<LengthLimitError>() => Err(ServerError::PayloadTooLarge { limit }),
        Err(e) => Err(ServerError::bad_request(format!(
            "failed to read request body: {e}"
        ))),
    }
}

fn internal_endpoint(path: &str, health: &HealthChecker) -> Response<Full<Bytes>> {
    match path.strip_prefix(INTERNAL_PREFIX).unwrap_or(path) {
        "health" => json_response(StatusCode::OK, &health.liveness()),
        "ready" => {
            let response = health.readiness();
            let status = if response.status.is_ready() {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            json_response(status, &response)
        }
        "metrics" => match render_metrics() {
            Some(text) => bytes_response(StatusCode::OK, CONTENT_TYPE_PROMETHEUS, Bytes::from(text)),
            None => error_response(
                StatusCode::NOT_FOUND,
                "metrics_disabled",
                "metrics are not enabled",
                "internal",
            ),
        },
        "version" => json_response(
            StatusCode::OK,
            &serde_json::json!({
                "name": env!("CARGO_PKG_NAME"),
                "version": crate::VERSION,
            }),
        ),
        _ => error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            &format!("unknown internal endpoint: {path}"),
            "internal",
        ),
    }
}

/// Reuse a well-formed caller request ID, otherwise mint a UUIDv7.
fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(HEADER_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty() && id.len() <= MAX_REQUEST_ID_LEN)
        .map_or_else(|| Uuid::now_v7().to_string(), ToString::to_string)
}

fn bytes_response(status: StatusCode, content_type: &'static str, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let json = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
    bytes_response(status, CONTENT_TYPE_JSON, Bytes::from(json))
}

fn error_response(
    status: StatusCode,
    error: &str,
    message: &str,
    request_id: &str,
) -> Response<Full<Bytes>> {
    let body = ErrorResponse::new(error, message).with_request_id(request_id);
    json_response(status, &body)
}

fn server_error_response(err: &ServerError, request_id: &str) -> Response<Full<Bytes>> {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    json_response(status, &ErrorResponse::from(err).with_request_id(request_id))
}

#[allow(clippy::cast_possible_truncation)]
fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response<Full<Bytes>>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_request_id_generated() {
        let id = request_id(&HeaderMap::new());
        assert!(Uuid::parse_str(&id).is_ok());
        assert_ne!(id, request_id(&HeaderMap::new()));
    }

    #[test]
    fn test_request_id_reused() {
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_REQUEST_ID, HeaderValue::from_static("caller-42"));
        assert_eq!(request_id(&headers), "caller-42");
    }

    #[test]
    fn test_request_id_oversized_replaced() {
        let mut headers = HeaderMap::new();
        let long = "x".repeat(MAX_REQUEST_ID_LEN + 1);
        headers.insert(HEADER_REQUEST_ID, HeaderValue::from_str(&long).unwrap());
        assert_ne!(request_id(&headers), long);
    }

    #[tokio::test]
    async fn test_error_response() {
        let response = error_response(StatusCode::NOT_FOUND, "not_found", "nope", "req-1");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let json = body_json(response).await;
        assert_eq!(json["error"], "not_found");
        assert_eq!(json["request_id"], "req-1");
    }

    #[tokio::test]
    async fn test_server_error_response_status() {
        let err = ServerError::PayloadTooLarge { limit: 4 };
        let response = server_error_response(&err, "req-2");
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body_json(response).await["error"], "payload_too_large");
    }

    #[tokio::test]
    async fn test_internal_endpoints() {
        let health = HealthChecker::new();

        let response = internal_endpoint("/_hmac/health", &health);
        assert_eq!(response.status(), StatusCode::OK);

        let response = internal_endpoint("/_hmac/ready", &health);
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        health.set_ready(true);
        let response = internal_endpoint("/_hmac/ready", &health);
        assert_eq!(response.status(), StatusCode::OK);

        let response = internal_endpoint("/_hmac/version", &health);
        assert_eq!(body_json(response).await["version"], crate::VERSION);

        let response = internal_endpoint("/_hmac/nope", &health);
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_batch_response_ok() {
        let response = batch_response(Ok(br#"{"replies":[]}"#.to_vec()), "req-3");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), CONTENT_TYPE_JSON);
        assert_eq!(body_json(response).await, serde_json::json!({"replies": []}));
    }

    #[tokio::test]
    async fn test_batch_response_encode_failure() {
        let err = remote_hmac_core::BatchError::encode("key must be a string");
        let response = batch_response(Err(err), "req-4");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), CONTENT_TYPE_TEXT);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.starts_with("Internal error: "));
        assert!(text.contains("key must be a string"));
    }

    #[test]
    fn test_json_response() {
        let response = json_response(StatusCode::OK, &serde_json::json!({"replies": []}));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), CONTENT_TYPE_JSON);
    }
}
