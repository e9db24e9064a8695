// This file is part of Nightjar, an edge camera video event agent.
// Copyright (C) 2026 The Nightjar Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! HTTP services: the supervisor's control API and the runtime's internal
//! status endpoint.

use crate::config::{self, CLASS_CATALOG};
use crate::json::{AgentSnapshot, ClassesPut, ClassesResponse};
use crate::supervisor::{Manager, StartOutcome, WaitCond};
use base::{err, Error, ErrorKind};
use bytes::Bytes;
use http::header::{self, HeaderValue};
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

type Body = Full<Bytes>;

/// An HTTP error response. A thin wrapper over the hyper response type;
/// its purpose is automatic conversion from `base::Error`, which the
/// orphan rule prevents on `Response` itself.
#[derive(Debug)]
pub struct HttpError(Response<Body>);

impl From<Response<Body>> for HttpError {
    fn from(response: Response<Body>) -> Self {
        HttpError(response)
    }
}

impl From<Error> for HttpError {
    fn from(err: Error) -> Self {
        use ErrorKind::*;
        let status = match err.kind() {
            Unauthenticated => StatusCode::UNAUTHORIZED,
            PermissionDenied => StatusCode::FORBIDDEN,
            InvalidArgument | FailedPrecondition => StatusCode::BAD_REQUEST,
            NotFound => StatusCode::NOT_FOUND,
            DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        HttpError(plain_response(status, err.chain().to_string()))
    }
}

pub type ResponseResult = Result<Response<Body>, HttpError>;

fn plain_response<B: Into<Bytes>>(status: StatusCode, body: B) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))
        .body(Full::new(body.into()))
        .expect("hardcoded head should be valid")
}

fn not_found() -> HttpError {
    HttpError(plain_response(StatusCode::NOT_FOUND, "no such endpoint"))
}

fn method_not_allowed() -> HttpError {
    HttpError(plain_response(
        StatusCode::METHOD_NOT_ALLOWED,
        "method not allowed",
    ))
}

fn serve_json<T: serde::Serialize>(status: StatusCode, out: &T) -> ResponseResult {
    let body = serde_json::to_vec(out).map_err(|e| err!(Internal, source(e)))?;
    Ok(Response::builder()
        .status(status)
        .header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        )
        .body(Full::new(Bytes::from(body)))
        .expect("hardcoded head should be valid"))
}

fn query_param<'a>(query: &'a str, name: &str) -> Option<std::borrow::Cow<'a, str>> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == name)
        .map(|(_, v)| v)
}

/// The supervisor's control API, served on `status_port`.
pub struct ControlService<M: Manager> {
    manager: M,
    classes_override_path: PathBuf,
}

impl<M: Manager + 'static> ControlService<M> {
    pub fn new(manager: M, classes_override_path: PathBuf) -> Arc<Self> {
        Arc::new(ControlService {
            manager,
            classes_override_path,
        })
    }

    pub async fn route(
        &self,
        method: &Method,
        path: &str,
        query: &str,
        body: Bytes,
    ) -> ResponseResult {
        match path {
            "/status" if method == Method::GET => {
                serve_json(StatusCode::OK, &self.manager.status().await)
            }
            "/control/start" if method == Method::POST => self.control_start(query).await,
            "/control/stop" if method == Method::POST => {
                self.manager.stop().await;
                serve_json(StatusCode::ACCEPTED, &serde_json::json!({"stopping": true}))
            }
            "/config/classes" if method == Method::GET => self.get_classes(),
            "/config/classes" if method == Method::PUT => self.put_classes(&body),
            "/status" | "/control/start" | "/control/stop" | "/config/classes" => {
                Err(method_not_allowed())
            }
            _ => Err(not_found()),
        }
    }

    async fn control_start(&self, query: &str) -> ResponseResult {
        let wait: WaitCond = match query_param(query, "wait") {
            Some(v) => v.parse()?,
            None => WaitCond::None,
        };
        let timeout_ms: u64 = match query_param(query, "timeoutMs") {
            Some(v) => v
                .parse()
                .map_err(|_| err!(InvalidArgument, msg("bad timeoutMs {v:?}")))?,
            None => 15_000,
        };
        let min_frames: u64 = match query_param(query, "minFrames") {
            Some(v) => v
                .parse()
                .map_err(|_| err!(InvalidArgument, msg("bad minFrames {v:?}")))?,
            None => 3,
        };
        match self
            .manager
            .start_gated(wait, Duration::from_millis(timeout_ms), min_frames)
            .await?
        {
            StartOutcome::Ready(status) => serve_json(StatusCode::OK, &status),
            StartOutcome::Timeout(status) => serve_json(StatusCode::GATEWAY_TIMEOUT, &status),
        }
    }

    fn get_classes(&self) -> ResponseResult {
        let override_ = config::read_override(&self.classes_override_path)?;
        let catalog: Vec<String> = CLASS_CATALOG.iter().map(|s| s.to_string()).collect();
        let effective = override_.clone().unwrap_or_else(|| catalog.clone());
        serve_json(
            StatusCode::OK,
            &ClassesResponse {
                override_,
                catalog,
                effective,
            },
        )
    }

    fn put_classes(&self, body: &Bytes) -> ResponseResult {
        let put: ClassesPut = serde_json::from_slice(body)
            .map_err(|e| err!(InvalidArgument, msg("bad classes body"), source(e)))?;
        config::write_override(&self.classes_override_path, &put.classes)?;
        info!(classes = ?put.classes, "class override written; effective on next runtime start");
        self.get_classes()
    }
}

/// The runtime's internal snapshot endpoint, served on `status_port + 1`.
pub struct StatusService {
    snapshot: Arc<dyn Fn() -> AgentSnapshot + Send + Sync>,
}

impl StatusService {
    pub fn new(snapshot: Arc<dyn Fn() -> AgentSnapshot + Send + Sync>) -> Arc<Self> {
        Arc::new(StatusService { snapshot })
    }

    pub async fn route(&self, method: &Method, path: &str) -> ResponseResult {
        match path {
            "/status" if method == Method::GET => serve_json(StatusCode::OK, &(self.snapshot)()),
            "/status" => Err(method_not_allowed()),
            _ => Err(not_found()),
        }
    }
}

async fn collect_body(req: Request<Incoming>) -> Result<(http::request::Parts, Bytes), Error> {
    let (parts, body) = req.into_parts();
    let bytes = body
        .collect()
        .await
        .map_err(|e| err!(Unavailable, msg("unable to read request body"), source(e)))?
        .to_bytes();
    Ok((parts, bytes))
}

/// A boxed per-request handler future; hyper's `service_fn` needs one
/// nameable future type per service.
type HandlerFuture =
    std::pin::Pin<Box<dyn std::future::Future<Output = Result<Response<Body>, std::convert::Infallible>> + Send>>;

/// Serves connections until shutdown, then drains gracefully.
async fn serve_with<F>(
    listener: TcpListener,
    shutdown_rx: base::shutdown::Receiver,
    handle: F,
) -> Result<(), Error>
where
    F: Fn(Request<Incoming>) -> HandlerFuture + Clone + Send + 'static,
{
    let graceful = hyper_util::server::graceful::GracefulShutdown::new();
    loop {
        tokio::select! {
            _ = shutdown_rx.wait() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(a) => a,
                    Err(e) => {
                        warn!(err = %e, "accept failed");
                        continue;
                    }
                };
                debug!(%peer, "http connection");
                let io = TokioIo::new(stream);
                let handle = handle.clone();
                let conn = hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, service_fn(move |req| (handle.clone())(req)));
                let conn = graceful.watch(conn);
                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        debug!(err = %e, "http connection error");
                    }
                });
            }
        }
    }
    tokio::select! {
        _ = graceful.shutdown() => {}
        _ = tokio::time::sleep(Duration::from_secs(5)) => {
            warn!("http connections did not drain within 5s");
        }
    }
    Ok(())
}

/// Binds and serves the control API.
pub async fn serve_control<M: Manager + 'static>(
    service: Arc<ControlService<M>>,
    port: u16,
    shutdown_rx: base::shutdown::Receiver,
) -> Result<(), Error> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| err!(e, msg("unable to bind control port {port}")))?;
    info!(port, "control API listening");
    serve_with(listener, shutdown_rx, move |req| -> HandlerFuture {
        let service = service.clone();
        Box::pin(async move {
            let (parts, body) = match collect_body(req).await {
                Ok(v) => v,
                Err(e) => return Ok(HttpError::from(e).0),
            };
            let query = parts.uri.query().unwrap_or("");
            let resp = service
                .route(&parts.method, parts.uri.path(), query, body)
                .await
                .unwrap_or_else(|e| e.0);
            Ok(resp)
        })
    })
    .await
}

/// Binds and serves the runtime's internal status endpoint.
pub async fn serve_status(
    service: Arc<StatusService>,
    port: u16,
    shutdown_rx: base::shutdown::Receiver,
) -> Result<(), Error> {
    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .map_err(|e| err!(e, msg("unable to bind status port {port}")))?;
    info!(port, "internal status endpoint listening");
    serve_with(listener, shutdown_rx, move |req| -> HandlerFuture {
        let service = service.clone();
        Box::pin(async move {
            let (parts, _) = match collect_body(req).await {
                Ok(v) => v,
                Err(e) => return Ok(HttpError::from(e).0),
            };
            let resp = service
                .route(&parts.method, parts.uri.path())
                .await
                .unwrap_or_else(|e| e.0);
            Ok(resp)
        })
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::json::{ManagerStatus, TopLevelStatus};
    use async_trait::async_trait;
    use base::Mutex;

    struct MockManager {
        outcome: Mutex<Option<fn() -> StartOutcome>>,
        stops: std::sync::atomic::AtomicU64,
        frames: u64,
    }

    fn status(state: &str, frames: u64) -> TopLevelStatus {
        TopLevelStatus {
            manager: ManagerStatus {
                state: state.to_owned(),
                pid: Some(1),
                autostart: false,
                started_at: None,
                last_exit: None,
                last_error: None,
            },
            agent: Some(AgentSnapshot {
                state: "IDLE".to_owned(),
                session_id: None,
                frames_processed: frames,
                detections_total: 0,
                sessions_opened: 0,
                last_error: None,
                metrics: None,
            }),
        }
    }

    #[async_trait]
    impl Manager for Arc<MockManager> {
        async fn status(&self) -> TopLevelStatus {
            status("running", self.frames)
        }

        async fn start_gated(
            &self,
            _wait: WaitCond,
            _timeout: Duration,
            _min_frames: u64,
        ) -> Result<StartOutcome, Error> {
            Ok(self.outcome.lock().take().expect("outcome set")())
        }

        async fn stop(&self) {
            self.stops.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    fn service(
        outcome: fn() -> StartOutcome,
    ) -> (
        Arc<ControlService<Arc<MockManager>>>,
        Arc<MockManager>,
        tempfile::TempDir,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(MockManager {
            outcome: Mutex::new(Some(outcome)),
            stops: std::sync::atomic::AtomicU64::new(0),
            frames: 7,
        });
        let svc = ControlService::new(manager.clone(), dir.path().join("classes.json"));
        (svc, manager, dir)
    }

    async fn body_json(resp: Response<Body>) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn status_roundtrip() {
        let (svc, _, _dir) = service(|| StartOutcome::Ready(status("running", 7)));
        let resp = svc
            .route(&Method::GET, "/status", "", Bytes::new())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let v = body_json(resp).await;
        assert_eq!(v["manager"]["state"], "running");
        assert_eq!(v["agent"]["frames_processed"], 7);
    }

    #[tokio::test]
    async fn start_ready_returns_200() {
        let (svc, _, _dir) = service(|| StartOutcome::Ready(status("running", 7)));
        let resp = svc
            .route(
                &Method::POST,
                "/control/start",
                "wait=heartbeat&timeoutMs=15000&minFrames=5",
                Bytes::new(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn start_timeout_returns_504_with_snapshot() {
        let (svc, _, _dir) = service(|| StartOutcome::Timeout(status("running", 2)));
        let resp = svc
            .route(
                &Method::POST,
                "/control/start",
                "wait=heartbeat&timeoutMs=1000&minFrames=5",
                Bytes::new(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
        let v = body_json(resp).await;
        assert_eq!(v["agent"]["frames_processed"], 2);
    }

    #[tokio::test]
    async fn start_rejects_bad_wait() {
        let (svc, _, _dir) = service(|| StartOutcome::Ready(status("running", 7)));
        let e = svc
            .route(&Method::POST, "/control/start", "wait=nonsense", Bytes::new())
            .await
            .unwrap_err();
        assert_eq!(e.0.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn stop_returns_202() {
        let (svc, manager, _dir) = service(|| StartOutcome::Ready(status("running", 7)));
        let resp = svc
            .route(&Method::POST, "/control/stop", "", Bytes::new())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(manager.stops.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn classes_get_put_get() {
        let (svc, _, _dir) = service(|| StartOutcome::Ready(status("running", 7)));

        let resp = svc
            .route(&Method::GET, "/config/classes", "", Bytes::new())
            .await
            .unwrap();
        let v = body_json(resp).await;
        assert!(v["override"].is_null());
        assert_eq!(v["effective"], v["catalog"]);

        let put = Bytes::from(r#"{"classes":["person","dog"]}"#);
        let resp = svc
            .route(&Method::PUT, "/config/classes", "", put)
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let v = body_json(resp).await;
        assert_eq!(v["override"], serde_json::json!(["person", "dog"]));
        assert_eq!(v["effective"], serde_json::json!(["person", "dog"]));
    }

    #[tokio::test]
    async fn classes_put_rejects_unknown_class() {
        let (svc, _, _dir) = service(|| StartOutcome::Ready(status("running", 7)));
        let put = Bytes::from(r#"{"classes":["dragon"]}"#);
        let e = svc
            .route(&Method::PUT, "/config/classes", "", put)
            .await
            .unwrap_err();
        assert_eq!(e.0.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_path_is_404() {
        let (svc, _, _dir) = service(|| StartOutcome::Ready(status("running", 7)));
        let e = svc
            .route(&Method::GET, "/nope", "", Bytes::new())
            .await
            .unwrap_err();
        assert_eq!(e.0.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn status_service_serves_snapshot() {
        let svc = StatusService::new(Arc::new(|| AgentSnapshot {
            state: "ACTIVE".to_owned(),
            session_id: Some("s-1".to_owned()),
            frames_processed: 42,
            detections_total: 3,
            sessions_opened: 1,
            last_error: None,
            metrics: None,
        }));
        let resp = svc.route(&Method::GET, "/status").await.unwrap();
        let v = body_json(resp).await;
        assert_eq!(v["state"], "ACTIVE");
        assert_eq!(v["frames_processed"], 42);
    }
}
