//! # HTTP Servers
//!
//! Health probes and Prometheus metrics.
//!
//! Provides endpoints:
//! - `/healthz` - Liveness probe (always returns 200)
//! - `/readyz` - Readiness probe (returns 200 once startup has finished)
//! - `/metrics` - Prometheus metrics in text format
//!
//! Probes are always plain HTTP. Metrics are served over HTTPS with a
//! self-signed certificate unless `--metrics-secure=false`; the HTTPS
//! endpoint also requires a bearer token allowed to `get` `/metrics`.

use crate::error::ControllerError;
use crate::metrics::REGISTRY;
use crate::metrics_auth::{METRICS_PATH, MetricsAuthorizer, require_metrics_access};
use axum::{Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use prometheus::{Encoder, TextEncoder};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Readiness shared between the controller and the probe server
#[derive(Debug, Default)]
pub struct ServerState {
    /// Set once bootstrap and APIC connectivity have succeeded
    pub is_ready: AtomicBool,
}

/// `/healthz` and `/readyz`
pub fn probe_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .with_state(state)
}

/// `/metrics`
pub fn metrics_router() -> Router {
    Router::new().route(METRICS_PATH, get(metrics_handler))
}

/// `/metrics` behind bearer-token authentication and authorization
pub fn secure_metrics_router(authorizer: Arc<dyn MetricsAuthorizer>) -> Router {
    metrics_router().route_layer(axum::middleware::from_fn_with_state(authorizer, require_metrics_access))
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        );
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        buffer,
    )
}

async fn healthz_handler() -> impl IntoResponse {
    StatusCode::OK
}

async fn readyz_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    if state.is_ready.load(Ordering::Relaxed) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Serve `router` over plain HTTP until `shutdown` fires
pub async fn serve(listener: TcpListener, router: Router, shutdown: CancellationToken) -> Result<(), ControllerError> {
    if let Ok(addr) = listener.local_addr() {
        info!("HTTP server listening on {}", addr);
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| ControllerError::Server(e.to_string()))
}

/// TLS settings for the metrics endpoint
///
/// Generates a fresh self-signed certificate. ALPN offers `h2` only when
/// HTTP/2 is enabled.
pub fn tls_config(enable_http2: bool) -> Result<Arc<rustls::ServerConfig>, ControllerError> {
    let tls_error = |e: &dyn std::fmt::Display| ControllerError::Server(format!("metrics TLS setup failed: {e}"));

    let params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).map_err(|e| tls_error(&e))?;
    let key_pair = rcgen::KeyPair::generate().map_err(|e| tls_error(&e))?;
    let cert = params.self_signed(&key_pair).map_err(|e| tls_error(&e))?;
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

    let mut config = rustls::ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| tls_error(&e))?
        .with_no_client_auth()
        .with_single_cert(vec![cert.der().clone()], key)
        .map_err(|e| tls_error(&e))?;

    config.alpn_protocols = if enable_http2 {
        vec![b"h2".to_vec(), b"http/1.1".to_vec()]
    } else {
        vec![b"http/1.1".to_vec()]
    };
    Ok(Arc::new(config))
}

/// Serve `router` over TLS until `shutdown` fires
pub async fn serve_tls(
    listener: TcpListener,
    router: Router,
    tls: Arc<rustls::ServerConfig>,
    enable_http2: bool,
    shutdown: CancellationToken,
) -> Result<(), ControllerError> {
    if let Ok(addr) = listener.local_addr() {
        info!("HTTPS server listening on {}", addr);
    }
    let acceptor = TlsAcceptor::from(tls);

    loop {
        let (stream, peer_addr) = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Error accepting HTTPS connection: {}", e);
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        let router = router.clone();
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(tls_stream) => tls_stream,
                Err(e) => {
                    debug!("TLS error from {}: {}", peer_addr, e);
                    return;
                }
            };
            let io = TokioIo::new(tls_stream);
            let service = TowerToHyperService::new(router);
            let builder = auto::Builder::new(TokioExecutor::new());
            let builder = if enable_http2 { builder } else { builder.http1_only() };
            if let Err(e) = builder.serve_connection(io, service).await {
                debug!("Error serving HTTPS connection from {}: {}", peer_addr, e);
            }
        });
    }

    info!("HTTPS server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics_auth::MetricsUser;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    /// Tokens "viewer" (allowed), "stranger" (denied) and "broken" (review error)
    struct StaticAuthorizer;

    #[async_trait::async_trait]
    impl MetricsAuthorizer for StaticAuthorizer {
        async fn authenticate(&self, token: &str) -> Result<Option<MetricsUser>, ControllerError> {
            match token {
                "viewer" | "stranger" => Ok(Some(MetricsUser {
                    username: token.to_string(),
                    ..MetricsUser::default()
                })),
                "broken" => Err(ControllerError::Server("token review unavailable".to_string())),
                _ => Ok(None),
            }
        }

        async fn authorize(&self, user: &MetricsUser) -> Result<bool, ControllerError> {
            Ok(user.username == "viewer")
        }
    }

    async fn get_metrics_as(token: Option<&str>) -> StatusCode {
        let mut request = Request::builder().uri("/metrics");
        if let Some(token) = token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }
        secure_metrics_router(Arc::new(StaticAuthorizer))
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    async fn get_status(router: Router, path: &str) -> StatusCode {
        router
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn test_healthz_always_ok() {
        let state = Arc::new(ServerState::default());
        assert_eq!(get_status(probe_router(state), "/healthz").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readyz_follows_state() {
        let state = Arc::new(ServerState::default());
        assert_eq!(
            get_status(probe_router(state.clone()), "/readyz").await,
            StatusCode::SERVICE_UNAVAILABLE
        );

        state.is_ready.store(true, Ordering::Relaxed);
        assert_eq!(get_status(probe_router(state), "/readyz").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_text_format() {
        crate::metrics::increment_fabric_operations("server_test");
        // Registering twice fails; another test may have registered already
        let _ = crate::metrics::register_metrics();

        let response = metrics_router()
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("epgconf_fabric_operations_total"));
    }

    #[tokio::test]
    async fn test_secure_metrics_require_token() {
        assert_eq!(get_metrics_as(None).await, StatusCode::UNAUTHORIZED);
        assert_eq!(get_metrics_as(Some("forged")).await, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_secure_metrics_require_access() {
        assert_eq!(get_metrics_as(Some("stranger")).await, StatusCode::FORBIDDEN);
        assert_eq!(get_metrics_as(Some("broken")).await, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(get_metrics_as(Some("viewer")).await, StatusCode::OK);
    }

    #[test]
    fn test_alpn_http1_only_by_default() {
        let config = tls_config(false).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);

        let config = tls_config(true).unwrap();
        assert_eq!(config.alpn_protocols[0], b"h2".to_vec());
    }

    #[tokio::test]
    async fn test_metrics_served_over_tls() {
        let _ = crate::metrics::register_metrics();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve_tls(
            listener,
            secure_metrics_router(Arc::new(StaticAuthorizer)),
            tls_config(false).unwrap(),
            false,
            shutdown.clone(),
        ));

        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .resolve("localhost", addr)
            .build()
            .unwrap();
        let url = format!("https://localhost:{}/metrics", addr.port());
        let response = client.get(&url).send().await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);

        let response = client.get(&url).bearer_auth("viewer").send().await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(response.version(), reqwest::Version::HTTP_11);

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }
}
