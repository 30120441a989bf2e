use crate::{bus, core, oidc};
use anyhow::{Context, Result};
use bytes::Bytes;
use futures::future;
use http_body_util::{BodyExt, Full, Limited};
use hyper::{header, Method, Request, Response, StatusCode};
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tracing::{debug, error, info, info_span, warn, Instrument};

const MAX_BODY_BYTES: usize = 1024 * 1024;
const READ_HEADER_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

type RspBody = Full<Bytes>;

/// The ingress HTTP endpoint: authenticate, validate, publish.
#[derive(Clone)]
pub struct Ingress(Arc<Inner>);

struct Inner {
    validator: oidc::Validator,
    publisher: bus::Publisher,
    allowed_prefix: String,
    published: AtomicU64,
}

impl Ingress {
    pub fn new(validator: oidc::Validator, publisher: bus::Publisher, allowed_prefix: String) -> Self {
        Self(Arc::new(Inner {
            validator,
            publisher,
            allowed_prefix,
            published: AtomicU64::new(0),
        }))
    }
}

impl<B> tower::Service<Request<B>> for Ingress
where
    B: http_body::Body + Send + 'static,
    B::Data: Send,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    type Response = Response<RspBody>;
    type Error = std::convert::Infallible;
    type Future = future::BoxFuture<'static, Result<Response<RspBody>, Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let inner = self.0.clone();
        Box::pin(async move { Ok(inner.dispatch(req).await) })
    }
}

impl Inner {
    /// Routes one request and emits exactly one completion record for it.
    async fn dispatch<B>(self: Arc<Self>, req: Request<B>) -> Response<RspBody>
    where
        B: http_body::Body + Send + 'static,
        B::Data: Send,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let request_id = request_id();
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let remote_addr = req
            .extensions()
            .get::<SocketAddr>()
            .map(|addr| addr.to_string())
            .unwrap_or_default();
        let user_agent = req
            .headers()
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let start = Instant::now();

        let mut rsp = self
            .route(req)
            .instrument(info_span!("request", id = %request_id))
            .await;
        rsp.headers_mut().insert(
            header::HeaderName::from_static("x-request-id"),
            header::HeaderValue::from_str(&request_id).expect("request id is a valid header value"),
        );

        let status = rsp.status().as_u16();
        let duration_ms = start.elapsed().as_millis() as u64;
        if rsp.status().is_client_error() || rsp.status().is_server_error() {
            warn!(
                request_id = %request_id,
                %method,
                %path,
                status,
                duration_ms,
                remote_addr = %remote_addr,
                user_agent = %user_agent,
                "request completed",
            );
        } else {
            info!(
                request_id = %request_id,
                %method,
                %path,
                status,
                duration_ms,
                remote_addr = %remote_addr,
                user_agent = %user_agent,
                "request completed",
            );
        }
        rsp
    }

    async fn route<B>(&self, req: Request<B>) -> Response<RspBody>
    where
        B: http_body::Body + Send + 'static,
        B::Data: Send,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        match (method, path.as_str()) {
            (Method::POST, "/event") => self.handle_event(req).await,
            (_, "/event") => text_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed"),
            (Method::GET, "/healthz") => text_response(StatusCode::OK, "ok"),
            (_, "/healthz") => text_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed"),
            _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
        }
    }

    async fn handle_event<B>(&self, req: Request<B>) -> Response<RspBody>
    where
        B: http_body::Body + Send + 'static,
        B::Data: Send,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let content_type = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !content_type.starts_with("application/json") {
            warn!(content_type, "invalid content type");
            return text_response(
                StatusCode::BAD_REQUEST,
                "Content-Type must be application/json",
            );
        }

        let token = match bearer_token(&req) {
            Some(token) => token.to_string(),
            None => {
                warn!("missing or invalid authorization header");
                return text_response(StatusCode::UNAUTHORIZED, "Unauthorized");
            }
        };

        let claims = match self.validator.validate(&token).await {
            Ok(claims) => claims,
            Err(error) => {
                // The raw token is never logged; the unverified inspection
                // carries enough context to diagnose the rejection.
                let inspection = oidc::inspect(&token);
                warn!(
                    %error,
                    expected_issuer = oidc::GITHUB_OIDC_ISSUER,
                    expected_audience = self.validator.audience(),
                    expected_owner = self.validator.allowed_owner(),
                    token = ?inspection,
                    "token validation failed",
                );
                return text_response(StatusCode::UNAUTHORIZED, "Unauthorized");
            }
        };
        info!(
            owner = %claims.repository_owner,
            repository = %claims.repository,
            "authenticated request",
        );

        let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(error) => {
                warn!(%error, "failed to read request body");
                return text_response(StatusCode::BAD_REQUEST, "Failed to read request body");
            }
        };

        let event = match core::Event::parse_and_validate(&body, &self.allowed_prefix) {
            Ok(event) => event,
            Err(error) => {
                warn!(%error, "payload validation failed");
                return text_response(StatusCode::BAD_REQUEST, &error.to_string());
            }
        };

        let payload = match event.to_canonical_json() {
            Ok(payload) => payload,
            Err(error) => {
                error!(%error, "failed to serialize event");
                return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error");
            }
        };

        if let Err(error) = self.publisher.publish(&payload).await {
            error!(%error, "failed to publish event");
            return text_response(StatusCode::BAD_GATEWAY, "Service unavailable");
        }

        let published = self.published.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            image = %event.image,
            tags = ?event.tags,
            total_published = published,
            "event published",
        );

        Response::builder()
            .status(StatusCode::ACCEPTED)
            .body(RspBody::default())
            .expect("accepted response must be valid")
    }
}

fn bearer_token<B>(req: &Request<B>) -> Option<&str> {
    req.headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn text_response(status: StatusCode, message: &str) -> Response<RspBody> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(Bytes::copy_from_slice(message.as_bytes())))
        .expect("text response must be valid")
}

/// Serves the ingress endpoint until `drain` fires, then drains in-flight
/// connections with a bounded grace period.
pub async fn serve(addr: SocketAddr, ingress: Ingress, drain: drain::Watch) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    let addr = listener.local_addr()?;
    info!(%addr, "HTTP ingress server listening");

    let graceful = hyper_util::server::graceful::GracefulShutdown::new();
    let shutdown = drain.signaled();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            res = listener.accept() => {
                let (stream, remote_addr) = match res {
                    Ok(conn) => conn,
                    Err(error) => {
                        warn!(%error, "failed to accept connection");
                        continue;
                    }
                };
                let io = hyper_util::rt::TokioIo::new(stream);
                let ingress = ingress.clone();
                let svc = hyper::service::service_fn(move |mut req: Request<hyper::body::Incoming>| {
                    req.extensions_mut().insert(remote_addr);
                    let mut ingress = ingress.clone();
                    async move { tower::Service::call(&mut ingress, req).await }
                });
                let conn = hyper::server::conn::http1::Builder::new()
                    .timer(hyper_util::rt::TokioTimer::new())
                    .header_read_timeout(READ_HEADER_TIMEOUT)
                    .serve_connection(io, svc);
                let conn = graceful.watch(conn);
                tokio::spawn(async move {
                    if let Err(error) = conn.await {
                        debug!(%error, "connection error");
                    }
                });
            }
            handle = &mut shutdown => {
                info!("shutting down ingress server");
                drop(listener);
                let drained = handle
                    .release_after(tokio::time::timeout(SHUTDOWN_GRACE, graceful.shutdown()))
                    .await;
                if drained.is_err() {
                    warn!("graceful shutdown timed out; aborting open connections");
                }
                return Ok(());
            }
        }
    }
}
